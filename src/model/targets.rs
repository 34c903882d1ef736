use burn::prelude::*;

use super::blocks::YoloLayer;
use super::geometry::wh_iou_pair;
use crate::error::TargetError;

/// One ground-truth box, coordinates normalized to `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetBox {
    pub image: usize,
    pub class_id: usize,
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
}

impl TargetBox {
    pub fn new(image: usize, class_id: usize, cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            image,
            class_id,
            cx,
            cy,
            w,
            h,
        }
    }

    /// Reads an `[n, 6]` tensor of `(image, class, x, y, w, h)` rows.
    pub fn from_tensor<B: Backend>(targets: Tensor<B, 2>) -> Vec<Self> {
        let [n, columns] = targets.dims();
        assert_eq!(columns, 6, "target rows are (image, class, x, y, w, h)");
        let values: Vec<f32> = targets.into_data().convert::<f32>().into_vec().unwrap_or_default();
        values
            .chunks_exact(6)
            .take(n)
            .map(|r| Self::new(r[0] as usize, r[1] as usize, r[2], r[3], r[4], r[5]))
            .collect()
    }
}

/// Matches of one detection head, stored as parallel vectors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeadAssignment {
    pub image: Vec<usize>,
    pub anchor: Vec<usize>,
    /// Grid row (`gj`).
    pub row: Vec<usize>,
    /// Grid column (`gi`).
    pub col: Vec<usize>,
    /// `(dx, dy, w, h)` in grid units, offsets relative to the cell.
    pub tbox: Vec<[f32; 4]>,
    /// Matched anchor `(w, h)` in grid units.
    pub anchors: Vec<[f32; 2]>,
    pub class_id: Vec<usize>,
}

impl HeadAssignment {
    pub fn len(&self) -> usize {
        self.image.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image.is_empty()
    }

    /// Row-major offset of each match in a flattened `[B, A, H, W]` grid.
    pub fn flat_indices(&self, num_anchors: usize, grid: [usize; 2]) -> Vec<usize> {
        let [ny, nx] = grid;
        (0..self.len())
            .map(|k| ((self.image[k] * num_anchors + self.anchor[k]) * ny + self.row[k]) * nx + self.col[k])
            .collect()
    }
}

/// Assigns targets to `(anchor, cell)` pairs of every head.
///
/// `grids` holds each head's `(rows, cols)`. A target is kept for every
/// anchor whose shape IoU exceeds `iou_t`, anchor-major; the cell is the
/// floored grid position clamped into the grid.
pub fn build_targets(
    heads: &[&YoloLayer],
    grids: &[[usize; 2]],
    targets: &[TargetBox],
    iou_t: f32,
) -> Result<Vec<HeadAssignment>, TargetError> {
    if heads.len() != grids.len() {
        return Err(TargetError::HeadCountMismatch {
            predictions: grids.len(),
            heads: heads.len(),
        });
    }

    let mut assignments = Vec::with_capacity(heads.len());
    for (head, &[ny, nx]) in heads.iter().zip(grids) {
        if let Some(t) = targets.iter().find(|t| t.class_id >= head.num_classes) {
            return Err(TargetError::ClassOutOfRange {
                class_id: t.class_id,
                num_classes: head.num_classes,
            });
        }

        let mut assignment = HeadAssignment::default();
        for (a, anchor) in head.anchor_vec().into_iter().enumerate() {
            for t in targets {
                let (gx, gy) = (t.cx * nx as f32, t.cy * ny as f32);
                let (gw, gh) = (t.w * nx as f32, t.h * ny as f32);
                if wh_iou_pair(anchor, [gw, gh]) <= iou_t {
                    continue;
                }

                let col = clamp_cell(gx, nx);
                let row = clamp_cell(gy, ny);
                assignment.image.push(t.image);
                assignment.anchor.push(a);
                assignment.row.push(row);
                assignment.col.push(col);
                assignment.tbox.push([gx - col as f32, gy - row as f32, gw, gh]);
                assignment.anchors.push(anchor);
                assignment.class_id.push(t.class_id);
            }
        }
        assignments.push(assignment);
    }

    Ok(assignments)
}

fn clamp_cell(position: f32, size: usize) -> usize {
    (position.floor().max(0.0) as usize).min(size.saturating_sub(1))
}
