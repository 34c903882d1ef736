use burn::module::Ignored;
use burn::prelude::*;
use burn::tensor::activation::sigmoid;

/// Per-head output of a fixed-shape export graph, batch size 1.
#[derive(Debug, Clone)]
pub struct ExportOutput<B: Backend> {
    /// `[A*H*W, C]`, or `[A*H*W, 1]` objectness for a single class.
    pub scores: Tensor<B, 2>,
    /// Box centers normalized by the grid size, `[A*H*W, 2]`.
    pub xy: Tensor<B, 2>,
    /// Box sizes normalized by the grid size, `[A*H*W, 2]`.
    pub wh: Tensor<B, 2>,
}

/// `[yolo]` detection head. Holds no parameters; it reshapes and decodes the
/// output of the convolution in front of it.
#[derive(Module, Debug, Clone)]
pub struct YoloLayer {
    /// Anchor `(w, h)` pairs in input pixels.
    pub anchors: Ignored<Vec<[f32; 2]>>,
    pub num_classes: usize,
    /// Input pixels per grid cell.
    pub stride: usize,
    /// Position among the detection heads.
    pub index: usize,
    /// Absolute indices from the block's `from` field.
    pub layers: Ignored<Vec<usize>>,
    /// `(rows, cols)` fixed at construction for export graphs.
    pub export_grid: Ignored<Option<[usize; 2]>>,
}

impl YoloLayer {
    pub fn num_anchors(&self) -> usize {
        self.anchors.len()
    }

    /// Attributes per anchor: `x, y, w, h, obj` and the class logits.
    pub fn num_outputs(&self) -> usize {
        self.num_classes + 5
    }

    /// Anchors in grid units.
    pub fn anchor_vec(&self) -> Vec<[f32; 2]> {
        let stride = self.stride as f32;
        self.anchors
            .iter()
            .map(|[w, h]| [w / stride, h / stride])
            .collect()
    }

    /// `[B, A*(5+C), H, W]` -> `[B, A, H, W, 5+C]`, values untouched.
    pub fn reshape<B: Backend>(&self, p: Tensor<B, 4>) -> Tensor<B, 5> {
        let [batch, _, ny, nx] = p.dims();
        p.reshape([batch, self.num_anchors(), self.num_outputs(), ny, nx])
            .permute([0, 1, 3, 4, 2])
    }

    /// Inference decoding.
    ///
    /// Returns `[B, A*H*W, 5+C]` candidates with `xywh` in input pixels,
    /// sigmoid objectness and class scores (multiplied by objectness when there
    /// is more than one class), plus the raw reshaped tensor. The cell grid is
    /// built from the observed tensor so any input resolution is honored.
    pub fn decode<B: Backend>(&self, p: Tensor<B, 4>) -> (Tensor<B, 3>, Tensor<B, 5>) {
        let raw = self.reshape(p);
        let [batch, na, ny, nx, no] = raw.dims();
        let device = raw.device();
        let stride = self.stride as f32;

        let grid = Tensor::<B, 5>::from_data(TensorData::new(grid_offsets(ny, nx), [1, 1, ny, nx, 2]), &device);
        let anchors: Vec<f32> = self.anchors.iter().flatten().copied().collect();
        let anchor_wh = Tensor::<B, 5>::from_data(TensorData::new(anchors, [1, na, 1, 1, 2]), &device);

        let attr = |from: usize, to: usize| raw.clone().slice([0..batch, 0..na, 0..ny, 0..nx, from..to]);
        let xy = (sigmoid(attr(0, 2)) + grid) * stride;
        let wh = attr(2, 4).exp() * anchor_wh;
        let obj = sigmoid(attr(4, 5));
        let mut parts = vec![xy, wh, obj.clone()];
        if no > 5 {
            let cls = sigmoid(attr(5, no));
            parts.push(if self.num_classes > 1 { cls * obj } else { cls });
        }

        let decoded = Tensor::cat(parts, 4).reshape([batch, na * ny * nx, no]);
        (decoded, raw)
    }

    /// Fixed-shape decoding for export graphs; batch size is taken as 1.
    pub fn export<B: Backend>(&self, p: Tensor<B, 4>) -> ExportOutput<B> {
        let [_, _, observed_ny, observed_nx] = p.dims();
        let [ny, nx] = self.export_grid.unwrap_or([observed_ny, observed_nx]);
        let (na, no) = (self.num_anchors(), self.num_outputs());
        let m = na * ny * nx;
        let device = p.device();

        let p = p
            .reshape([1, na, no, ny, nx])
            .permute([0, 1, 3, 4, 2])
            .reshape([m, no]);

        let cells = grid_offsets(ny, nx);
        let grid: Vec<f32> = (0..na).flat_map(|_| cells.iter().copied()).collect();
        let anchor_wh: Vec<f32> = self
            .anchor_vec()
            .iter()
            .flat_map(|wh| std::iter::repeat(wh).take(ny * nx).flatten().copied())
            .collect();
        let grid = Tensor::<B, 2>::from_data(TensorData::new(grid, [m, 2]), &device);
        let anchor_wh = Tensor::<B, 2>::from_data(TensorData::new(anchor_wh, [m, 2]), &device);
        let inv_grid = Tensor::<B, 2>::from_data(
            TensorData::new(vec![1.0 / nx as f32, 1.0 / ny as f32], [1, 2]),
            &device,
        );

        let attr = |from: usize, to: usize| p.clone().slice([0..m, from..to]);
        let xy = (sigmoid(attr(0, 2)) + grid) * inv_grid.clone();
        let wh = attr(2, 4).exp() * anchor_wh * inv_grid;
        let scores = if self.num_classes == 1 {
            sigmoid(attr(4, 5))
        } else {
            sigmoid(attr(5, no)) * sigmoid(attr(4, 5))
        };

        ExportOutput { scores, xy, wh }
    }
}

/// `(x, y)` offsets of every cell in row-major order, flattened.
fn grid_offsets(ny: usize, nx: usize) -> Vec<f32> {
    (0..ny)
        .flat_map(|y| (0..nx).flat_map(move |x| [x as f32, y as f32]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn head(num_classes: usize) -> YoloLayer {
        YoloLayer {
            anchors: Ignored(vec![[10.0, 13.0], [16.0, 30.0]]),
            num_classes,
            stride: 8,
            index: 0,
            layers: Ignored(Vec::new()),
            export_grid: Ignored(None),
        }
    }

    #[test]
    fn zero_logits_decode_to_cell_centers_and_anchors() {
        let device = Default::default();
        let layer = head(2);
        let p = Tensor::<TestBackend, 4>::zeros([1, 2 * 7, 3, 4], &device);
        let (decoded, raw) = layer.decode(p);
        assert_eq!(raw.dims(), [1, 2, 3, 4, 7]);
        assert_eq!(decoded.dims(), [1, 2 * 3 * 4, 7]);

        let values: Vec<f32> = decoded.into_data().to_vec().unwrap();
        // anchor 1, row 2, col 3
        let row = &values[(12 + 2 * 4 + 3) * 7..][..7];
        // class probability times objectness
        let expected = [(0.5 + 3.0) * 8.0, (0.5 + 2.0) * 8.0, 16.0, 30.0, 0.5, 0.25, 0.25];
        for (got, want) in row.iter().zip(expected) {
            assert!((got - want).abs() < 1e-5, "{got} vs {want}");
        }
    }

    #[test]
    fn single_class_scores_are_not_scaled() {
        let device = Default::default();
        let layer = head(1);
        let p = Tensor::<TestBackend, 4>::zeros([1, 2 * 6, 1, 1], &device);
        let values: Vec<f32> = layer.decode(p).0.into_data().to_vec().unwrap();
        assert!((values[5] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn resolution_change_rebuilds_grid() {
        let device = Default::default();
        let layer = head(1);
        for size in [2, 5] {
            let p = Tensor::<TestBackend, 4>::zeros([2, 12, size, size], &device);
            assert_eq!(layer.decode(p).0.dims(), [2, 2 * size * size, 6]);
        }
    }

    #[test]
    fn export_normalizes_by_grid() {
        let device = Default::default();
        let mut layer = head(3);
        layer.export_grid = Ignored(Some([2, 4]));
        let p = Tensor::<TestBackend, 4>::zeros([1, 2 * 8, 2, 4], &device);
        let out = layer.export(p);
        assert_eq!(out.scores.dims(), [16, 3]);
        assert_eq!(out.xy.dims(), [16, 2]);

        let xy: Vec<f32> = out.xy.into_data().to_vec().unwrap();
        assert!((xy[0] - 0.5 / 4.0).abs() < 1e-6);
        assert!((xy[1] - 0.5 / 2.0).abs() < 1e-6);
        let wh: Vec<f32> = out.wh.into_data().to_vec().unwrap();
        // first anchor in grid units (10 / 8, 13 / 8) over (4, 2)
        assert!((wh[0] - 1.25 / 4.0).abs() < 1e-6);
        assert!((wh[1] - 1.625 / 2.0).abs() < 1e-6);
    }
}
