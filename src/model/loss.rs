use burn::prelude::*;
use burn::tensor::activation::sigmoid;
use serde::{Deserialize, Serialize};

use super::blocks::YoloLayer;
use super::geometry::{bbox_iou_tensor, BoxFormat};
use super::targets::{build_targets, TargetBox};
use crate::error::TargetError;

/// Focal loss balance between positives and negatives.
const FOCAL_ALPHA: f32 = 0.25;

/// Loss gains and matching thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    /// Box (GIoU) loss gain.
    pub giou: f32,
    pub cls: f32,
    pub obj: f32,
    /// Positive weight of the class BCE.
    pub cls_pw: f32,
    /// Positive weight of the objectness BCE.
    pub obj_pw: f32,
    /// Anchor shape IoU a target needs to be assigned.
    pub iou_t: f32,
    /// Focal loss gamma; 0 disables focal weighting.
    pub fl_gamma: f32,
    /// Label smoothing epsilon.
    pub label_smoothing: f32,
    /// Blend between hard 1.0 and GIoU objectness targets.
    pub gr: f32,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            giou: 3.54,
            cls: 37.4,
            obj: 64.3,
            cls_pw: 1.0,
            obj_pw: 1.0,
            iou_t: 0.20,
            fl_gamma: 0.0,
            label_smoothing: 0.0,
            gr: 1.0,
        }
    }
}

/// Detached loss terms for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LossComponents {
    pub box_loss: f32,
    pub objectness: f32,
    pub classification: f32,
    pub total: f32,
}

impl LossComponents {
    pub fn to_array(self) -> [f32; 4] {
        [self.box_loss, self.objectness, self.classification, self.total]
    }
}

#[derive(Debug, Clone)]
pub struct LossOutput<B: Backend> {
    /// Differentiable total loss, shape `[1]`.
    pub loss: Tensor<B, 1>,
    pub components: LossComponents,
}

/// Positive and negative targets for label smoothing `eps`.
pub fn smooth_bce(eps: f32) -> (f32, f32) {
    (1.0 - 0.5 * eps, 0.5 * eps)
}

/// `log(sigmoid(x))` without overflow for large `|x|`.
fn log_sigmoid<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.clone().clamp_max(0.0) - x.abs().neg().exp().log1p()
}

/// Element-wise BCE-with-logits with a positive-class weight, optionally
/// focal-weighted, averaged over all elements.
fn bce_with_logits<B: Backend, const D: usize>(
    logits: Tensor<B, D>,
    targets: Tensor<B, D>,
    pos_weight: f32,
    fl_gamma: f32,
) -> Tensor<B, 1> {
    let positive = targets.clone() * log_sigmoid(logits.clone()) * pos_weight;
    let negative = targets.clone().neg().add_scalar(1.0) * log_sigmoid(logits.clone().neg());
    let loss = (positive + negative).neg();

    if fl_gamma <= 0.0 {
        return loss.mean();
    }

    let p = sigmoid(logits);
    let inv_t = targets.clone().neg().add_scalar(1.0);
    let p_t = targets.clone() * p.clone() + inv_t.clone() * p.neg().add_scalar(1.0);
    let alpha_factor = targets * FOCAL_ALPHA + inv_t * (1.0 - FOCAL_ALPHA);
    let modulating = p_t.neg().add_scalar(1.0).powf_scalar(fl_gamma);
    (loss * alpha_factor * modulating).mean()
}

/// Composite YOLOv3 loss over all heads.
///
/// `predictions` are the raw `[B, A, H, W, 5+C]` training outputs in head
/// order. Returns `giou * box + obj * obj + cls * cls` and its detached terms.
pub fn compute_loss<B: Backend>(
    predictions: &[Tensor<B, 5>],
    targets: &[TargetBox],
    heads: &[&YoloLayer],
    config: &LossConfig,
) -> Result<LossOutput<B>, TargetError> {
    let grids: Vec<[usize; 2]> = predictions
        .iter()
        .map(|p| {
            let [_, _, ny, nx, _] = p.dims();
            [ny, nx]
        })
        .collect();
    let assignments = build_targets(heads, &grids, targets, config.iou_t)?;
    let (cp, cn) = smooth_bce(config.label_smoothing);

    let device = match predictions.first() {
        Some(p) => p.device(),
        None => return Err(TargetError::HeadCountMismatch { predictions: 0, heads: heads.len() }),
    };
    let mut lbox = Tensor::<B, 1>::zeros([1], &device);
    let mut lobj = Tensor::<B, 1>::zeros([1], &device);
    let mut lcls = Tensor::<B, 1>::zeros([1], &device);

    for ((pi, head), assignment) in predictions.iter().zip(heads).zip(&assignments) {
        let [batch, na, ny, nx, no] = pi.dims();
        let cells = batch * na * ny * nx;
        let flat = pi.clone().reshape([cells, no]);
        let mut tobj = vec![0.0f32; cells];

        let n = assignment.len();
        if n > 0 {
            let indices = assignment.flat_indices(na, [ny, nx]);
            let index_tensor = Tensor::<B, 1, Int>::from_data(
                TensorData::new(indices.iter().map(|&i| i as i64).collect::<Vec<_>>(), [n]),
                &device,
            );
            let ps = flat.clone().select(0, index_tensor);

            let anchors: Vec<f32> = assignment.anchors.iter().flatten().copied().collect();
            let anchors = Tensor::<B, 2>::from_data(TensorData::new(anchors, [n, 2]), &device);
            let tbox: Vec<f32> = assignment.tbox.iter().flatten().copied().collect();
            let tbox = Tensor::<B, 2>::from_data(TensorData::new(tbox, [n, 4]), &device);

            let pxy = sigmoid(ps.clone().slice([0..n, 0..2]));
            let pwh = ps.clone().slice([0..n, 2..4]).exp().clamp_max(1e3) * anchors;
            let pbox = Tensor::cat(vec![pxy, pwh], 1);
            let giou = bbox_iou_tensor(pbox, tbox, BoxFormat::Xywh, true);
            lbox = lbox + giou.clone().neg().add_scalar(1.0).mean();

            let quality: Vec<f32> = giou
                .detach()
                .clamp(0.0, 1.0)
                .into_data()
                .convert::<f32>()
                .into_vec()
                .unwrap_or_else(|_| vec![1.0; n]);
            for (&cell, g) in indices.iter().zip(quality) {
                tobj[cell] = (1.0 - config.gr) + config.gr * g;
            }

            if head.num_classes > 1 {
                let nc = no - 5;
                let mut t = vec![cn; n * nc];
                for (k, &class_id) in assignment.class_id.iter().enumerate() {
                    t[k * nc + class_id] = cp;
                }
                let t = Tensor::<B, 2>::from_data(TensorData::new(t, [n, nc]), &device);
                let logits = ps.slice([0..n, 5..no]);
                lcls = lcls + bce_with_logits(logits, t, config.cls_pw, config.fl_gamma);
            }
        }

        let obj_logits = flat.slice([0..cells, 4..5]).reshape([cells]);
        let tobj = Tensor::<B, 1>::from_data(TensorData::new(tobj, [cells]), &device);
        lobj = lobj + bce_with_logits(obj_logits, tobj, config.obj_pw, config.fl_gamma);

        log::debug!("head {}: {} matched targets on a {ny}x{nx} grid", head.index, n);
    }

    let lbox = lbox * config.giou;
    let lobj = lobj * config.obj;
    let lcls = lcls * config.cls;
    let loss = lbox.clone() + lobj.clone() + lcls.clone();

    let scalar = |t: &Tensor<B, 1>| t.clone().detach().into_scalar().elem::<f32>();
    let components = LossComponents {
        box_loss: scalar(&lbox),
        objectness: scalar(&lobj),
        classification: scalar(&lcls),
        total: scalar(&loss),
    };

    Ok(LossOutput { loss, components })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::module::Ignored;

    type TestBackend = NdArray;

    fn head(num_classes: usize) -> YoloLayer {
        YoloLayer {
            anchors: Ignored(vec![[10.0, 13.0], [16.0, 30.0], [33.0, 23.0]]),
            num_classes,
            stride: 32,
            index: 0,
            layers: Ignored(Vec::new()),
            export_grid: Ignored(None),
        }
    }

    #[test]
    fn bce_matches_closed_form() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 1>::from_floats([0.0, 2.0, -3.0], &device);
        let targets = Tensor::<TestBackend, 1>::from_floats([1.0, 0.0, 1.0], &device);
        let got = bce_with_logits(logits, targets, 1.0, 0.0).into_scalar();

        let sig = |x: f32| 1.0 / (1.0 + (-x).exp());
        let want = -((sig(0.0)).ln() + (1.0 - sig(2.0)).ln() + sig(-3.0).ln()) / 3.0;
        assert!((got - want).abs() < 1e-5, "{got} vs {want}");
    }

    #[test]
    fn focal_weighting_shrinks_easy_examples() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 1>::from_floats([4.0], &device);
        let targets = Tensor::<TestBackend, 1>::from_floats([1.0], &device);
        let plain = bce_with_logits(logits.clone(), targets.clone(), 1.0, 0.0).into_scalar();
        let focal = bce_with_logits(logits, targets, 1.0, 1.5).into_scalar();
        assert!(focal < plain * FOCAL_ALPHA);
    }

    #[test]
    fn label_smoothing_targets() {
        assert_eq!(smooth_bce(0.0), (1.0, 0.0));
        assert_eq!(smooth_bce(0.1), (0.95, 0.05));
    }

    #[test]
    fn components_sum_to_total() {
        let device = Default::default();
        let yolo = head(3);
        let p = Tensor::<TestBackend, 5>::zeros([1, 3, 13, 13, 8], &device);
        // 0.65 grid units, close enough in shape to the smallest anchor
        let targets = [TargetBox::new(0, 1, 0.5, 0.5, 0.05, 0.05)];
        let out = compute_loss(&[p], &targets, &[&yolo], &LossConfig::default()).unwrap();

        let c = out.components;
        assert!(c.box_loss > 0.0 && c.objectness > 0.0 && c.classification > 0.0);
        assert!((c.box_loss + c.objectness + c.classification - c.total).abs() < 1e-3);
        let total: f32 = out.loss.into_scalar();
        assert!((total - c.total).abs() < 1e-4);
    }

    #[test]
    fn single_class_skips_classification() {
        let device = Default::default();
        let yolo = head(1);
        let p = Tensor::<TestBackend, 5>::zeros([1, 3, 13, 13, 6], &device);
        let targets = [TargetBox::new(0, 0, 0.5, 0.5, 0.05, 0.05)];
        let out = compute_loss(&[p], &targets, &[&yolo], &LossConfig::default()).unwrap();
        assert!(out.components.box_loss > 0.0);
        assert_eq!(out.components.classification, 0.0);
    }

    #[test]
    fn no_targets_only_penalizes_objectness() {
        let device = Default::default();
        let yolo = head(2);
        let p = Tensor::<TestBackend, 5>::zeros([2, 3, 4, 4, 7], &device);
        let out = compute_loss(&[p], &[], &[&yolo], &LossConfig::default()).unwrap();
        let c = out.components;
        assert_eq!(c.box_loss, 0.0);
        // BCE(0, 0) = ln 2 for every cell
        assert!((c.objectness - 64.3 * std::f32::consts::LN_2).abs() < 1e-3);
    }
}
