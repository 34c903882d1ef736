//! Box overlap metrics.
//!
//! Scalar versions work on `[f32; 4]` boxes and back NMS and tests; the
//! tensor versions are used by the loss so gradients flow through them.
//! Every division carries [`EPS`] so degenerate boxes never divide by zero.

use burn::prelude::*;
use serde::{Deserialize, Serialize};

pub const EPS: f32 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxFormat {
    /// Corners: x1, y1, x2, y2.
    Xyxy,
    /// Center and size: x, y, w, h.
    Xywh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IouKind {
    #[default]
    IoU,
    GIoU,
    DIoU,
    CIoU,
}

fn corners(b: [f32; 4], format: BoxFormat) -> [f32; 4] {
    match format {
        BoxFormat::Xyxy => b,
        BoxFormat::Xywh => [
            b[0] - b[2] / 2.0,
            b[1] - b[3] / 2.0,
            b[0] + b[2] / 2.0,
            b[1] + b[3] / 2.0,
        ],
    }
}

pub fn bbox_iou(box1: [f32; 4], box2: [f32; 4], format: BoxFormat, kind: IouKind) -> f32 {
    let [b1_x1, b1_y1, b1_x2, b1_y2] = corners(box1, format);
    let [b2_x1, b2_y1, b2_x2, b2_y2] = corners(box2, format);

    let inter = (b1_x2.min(b2_x2) - b1_x1.max(b2_x1)).max(0.0)
        * (b1_y2.min(b2_y2) - b1_y1.max(b2_y1)).max(0.0);

    let (w1, h1) = (b1_x2 - b1_x1, b1_y2 - b1_y1);
    let (w2, h2) = (b2_x2 - b2_x1, b2_y2 - b2_y1);
    let union = (w1 * h1 + EPS) + w2 * h2 - inter;
    let iou = inter / union;

    if kind == IouKind::IoU {
        return iou;
    }

    // smallest enclosing box
    let cw = b1_x2.max(b2_x2) - b1_x1.min(b2_x1);
    let ch = b1_y2.max(b2_y2) - b1_y1.min(b2_y1);

    match kind {
        IouKind::GIoU => {
            let c_area = cw * ch + EPS;
            iou - (c_area - union) / c_area
        }
        IouKind::DIoU | IouKind::CIoU => {
            let c2 = cw * cw + ch * ch + EPS;
            let rho2 = ((b2_x1 + b2_x2) - (b1_x1 + b1_x2)).powi(2) / 4.0
                + ((b2_y1 + b2_y2) - (b1_y1 + b1_y2)).powi(2) / 4.0;
            if kind == IouKind::DIoU {
                return iou - rho2 / c2;
            }
            let v = (4.0 / std::f32::consts::PI.powi(2))
                * ((w2 / (h2 + EPS)).atan() - (w1 / (h1 + EPS)).atan()).powi(2);
            let alpha = v / (1.0 - iou + v + EPS);
            iou - (rho2 / c2 + v * alpha)
        }
        IouKind::IoU => iou,
    }
}

/// Shape-only IoU of two `(w, h)` pairs, as if both boxes shared a center.
pub fn wh_iou_pair(wh1: [f32; 2], wh2: [f32; 2]) -> f32 {
    let inter = wh1[0].min(wh2[0]) * wh1[1].min(wh2[1]);
    inter / (wh1[0] * wh1[1] + wh2[0] * wh2[1] - inter + EPS)
}

/// `n x m` shape-only IoU matrix.
pub fn wh_iou(wh1: &[[f32; 2]], wh2: &[[f32; 2]]) -> Vec<Vec<f32>> {
    wh1.iter()
        .map(|a| wh2.iter().map(|b| wh_iou_pair(*a, *b)).collect())
        .collect()
}

fn column<B: Backend>(boxes: &Tensor<B, 2>, index: usize) -> Tensor<B, 1> {
    let [n, _] = boxes.dims();
    boxes.clone().slice([0..n, index..index + 1]).reshape([n])
}

fn tensor_corners<B: Backend>(
    boxes: &Tensor<B, 2>,
    format: BoxFormat,
) -> [Tensor<B, 1>; 4] {
    let (a, b, c, d) = (
        column(boxes, 0),
        column(boxes, 1),
        column(boxes, 2),
        column(boxes, 3),
    );
    match format {
        BoxFormat::Xyxy => [a, b, c, d],
        BoxFormat::Xywh => {
            let half_w = c / 2.0;
            let half_h = d / 2.0;
            [
                a.clone() - half_w.clone(),
                b.clone() - half_h.clone(),
                a + half_w,
                b + half_h,
            ]
        }
    }
}

/// Row-wise IoU (or GIoU) of two `[n, 4]` box tensors.
///
/// Only the variants the loss needs are differentiable here; DIoU/CIoU are
/// available through the scalar [`bbox_iou`].
pub fn bbox_iou_tensor<B: Backend>(
    box1: Tensor<B, 2>,
    box2: Tensor<B, 2>,
    format: BoxFormat,
    generalized: bool,
) -> Tensor<B, 1> {
    let [b1_x1, b1_y1, b1_x2, b1_y2] = tensor_corners(&box1, format);
    let [b2_x1, b2_y1, b2_x2, b2_y2] = tensor_corners(&box2, format);

    let inter_w = (b1_x2.clone().min_pair(b2_x2.clone()) - b1_x1.clone().max_pair(b2_x1.clone()))
        .clamp_min(0.0);
    let inter_h = (b1_y2.clone().min_pair(b2_y2.clone()) - b1_y1.clone().max_pair(b2_y1.clone()))
        .clamp_min(0.0);
    let inter = inter_w * inter_h;

    let area1 = (b1_x2.clone() - b1_x1.clone()) * (b1_y2.clone() - b1_y1.clone());
    let area2 = (b2_x2.clone() - b2_x1.clone()) * (b2_y2.clone() - b2_y1.clone());
    let union = area1 + EPS + area2 - inter.clone();
    let iou = inter / union.clone();

    if !generalized {
        return iou;
    }

    let cw = b1_x2.max_pair(b2_x2) - b1_x1.min_pair(b2_x1);
    let ch = b1_y2.max_pair(b2_y2) - b1_y1.min_pair(b2_y1);
    let c_area = cw * ch + EPS;
    iou - (c_area.clone() - union) / c_area
}
