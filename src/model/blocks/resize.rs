use burn::prelude::*;
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};

/// Fill value for the border left after shrinking an image.
pub const PAD_VALUE: f32 = 0.447;

/// Padding granularity when the scaled image does not keep the input shape.
const GRID: usize = 64;

/// Pads (or crops) `[B, C, H, W]` on the right and bottom to `[height, width]`.
pub fn pad_to<B: Backend>(x: Tensor<B, 4>, height: usize, width: usize, value: f32) -> Tensor<B, 4> {
    let [batch, channels, h, w] = x.dims();
    let x = if h > height || w > width {
        x.slice([0..batch, 0..channels, 0..h.min(height), 0..w.min(width)])
    } else {
        x
    };
    let [_, _, h, w] = x.dims();
    if h == height && w == width {
        return x;
    }
    x.pad((0, width - w, 0, height - h), value)
}

/// Bilinear rescale of an image batch by `ratio`.
///
/// With `same_shape` the result is padded back to the input size so the
/// passes of an augmented batch stay stackable; otherwise it is padded up to
/// the next multiple of 64 pixels.
pub fn scale_image<B: Backend>(image: Tensor<B, 4>, ratio: f64, same_shape: bool) -> Tensor<B, 4> {
    let [_, _, h, w] = image.dims();
    let scaled = [
        ((h as f64 * ratio) as usize).max(1),
        ((w as f64 * ratio) as usize).max(1),
    ];
    let resized = interpolate(
        image,
        scaled,
        InterpolateOptions::new(InterpolateMode::Bilinear),
    );

    let (height, width) = if same_shape {
        (h, w)
    } else {
        let up = |v: usize| (v as f64 * ratio / GRID as f64).ceil() as usize * GRID;
        (up(h), up(w))
    };
    pad_to(resized, height, width, PAD_VALUE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    #[test]
    fn same_shape_scaling_keeps_dimensions() {
        let device = Default::default();
        let image = Tensor::<NdArray, 4>::ones([2, 3, 64, 96], &device);
        let scaled = scale_image(image, 0.67, true);
        assert_eq!(scaled.dims(), [2, 3, 64, 96]);

        // padded border carries the fill value
        let corner: Vec<f32> = scaled
            .slice([0..1, 0..1, 63..64, 95..96])
            .into_data()
            .to_vec()
            .unwrap();
        assert!((corner[0] - PAD_VALUE).abs() < 1e-6);
    }

    #[test]
    fn free_shape_scaling_rounds_up_to_grid() {
        let device = Default::default();
        let image = Tensor::<NdArray, 4>::zeros([1, 3, 100, 130], &device);
        let scaled = scale_image(image, 0.83, false);
        assert_eq!(scaled.dims(), [1, 3, 128, 128]);
    }

    #[test]
    fn pad_to_crops_larger_inputs() {
        let device = Default::default();
        let x = Tensor::<NdArray, 4>::zeros([1, 1, 10, 4], &device);
        assert_eq!(pad_to(x, 8, 6, 0.0).dims(), [1, 1, 8, 6]);
    }
}
