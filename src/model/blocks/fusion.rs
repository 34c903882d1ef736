use burn::module::{Ignored, Param};
use burn::prelude::*;
use burn::tensor::activation::sigmoid;

use super::routed;

/// `[shortcut]`: adds earlier outputs into the running tensor, optionally
/// scaling every input (the running tensor first) by a learned weight.
#[derive(Module, Debug)]
pub struct WeightedFeatureFusion<B: Backend> {
    /// Absolute layer indices of the added features.
    pub layers: Ignored<Vec<usize>>,
    pub weights: Option<Param<Tensor<B, 1>>>,
}

impl<B: Backend> WeightedFeatureFusion<B> {
    pub fn new(device: &B::Device, layers: Vec<usize>, weighted: bool) -> Self {
        let weights = weighted.then(|| Param::from_tensor(Tensor::zeros([layers.len() + 1], device)));
        Self {
            layers: Ignored(layers),
            weights,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>, outputs: &[Option<Tensor<B, 4>>]) -> Tensor<B, 4> {
        let n = self.layers.len() + 1;
        // sigmoid(w) * 2/n, one scalar per input broadcast over [B, C, H, W]
        let weight = |w: &Tensor<B, 1>, i: usize| w.clone().slice([i..i + 1]).reshape([1, 1, 1, 1]);
        let w = self
            .weights
            .as_ref()
            .map(|w| sigmoid(w.val()) * (2.0 / n as f64));

        let mut x = match &w {
            Some(w) => x * weight(w, 0),
            None => x,
        };
        let nx = x.dims()[1];

        for (i, &layer) in self.layers.iter().enumerate() {
            let mut a = routed(outputs, layer).clone();
            if let Some(w) = &w {
                a = a * weight(w, i + 1);
            }
            let [batch, na, height, width] = a.dims();

            x = if nx == na {
                x + a
            } else if nx > na {
                // feature is narrower: add into the leading channels only
                let region = [0..batch, 0..na, 0..height, 0..width];
                let summed = x.clone().slice(region.clone()) + a;
                x.slice_assign(region, summed)
            } else {
                x + a.slice([0..batch, 0..nx, 0..height, 0..width])
            };
        }

        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn channel_ramp(channels: usize, device: &<TestBackend as Backend>::Device) -> Tensor<TestBackend, 4> {
        let values: Vec<f32> = (0..channels).flat_map(|c| vec![c as f32; 4]).collect();
        Tensor::from_data(TensorData::new(values, [1, channels, 2, 2]), device)
    }

    #[test]
    fn mismatched_sources_fit_running_channels() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::ones([1, 16, 2, 2], &device);
        let outputs = vec![
            Some(channel_ramp(16, &device)),
            Some(channel_ramp(24, &device)),
        ];
        let fusion = WeightedFeatureFusion::<TestBackend>::new(&device, vec![0, 1], false);
        let y = fusion.forward(x, &outputs);
        assert_eq!(y.dims(), [1, 16, 2, 2]);

        // 1 + c + c for each of the first 16 channels
        let values: Vec<f32> = y.into_data().to_vec().unwrap();
        for c in 0..16 {
            assert_eq!(values[c * 4], 1.0 + 2.0 * c as f32);
        }
    }

    #[test]
    fn narrower_source_only_touches_leading_channels() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::zeros([1, 4, 2, 2], &device);
        let outputs = vec![Some(Tensor::<TestBackend, 4>::ones([1, 2, 2, 2], &device))];
        let fusion = WeightedFeatureFusion::<TestBackend>::new(&device, vec![0], false);
        let values: Vec<f32> = fusion.forward(x, &outputs).into_data().to_vec().unwrap();
        assert_eq!(&values[..8], &[1.0; 8]);
        assert_eq!(&values[8..], &[0.0; 8]);
    }

    #[test]
    fn zero_initialised_weights_average_inputs() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::ones([1, 3, 2, 2], &device);
        let outputs = vec![Some(Tensor::<TestBackend, 4>::ones([1, 3, 2, 2], &device))];
        let fusion = WeightedFeatureFusion::<TestBackend>::new(&device, vec![0], true);
        // sigmoid(0) * 2 / 2 = 0.5 per input
        let values: Vec<f32> = fusion.forward(x, &outputs).into_data().to_vec().unwrap();
        for v in values {
            assert!((v - 1.0).abs() < 1e-6);
        }
    }
}
