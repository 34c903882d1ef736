use burn::prelude::*;

use super::geometry::{bbox_iou, BoxFormat, IouKind};

/// A decoded box in input pixels, center format.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub confidence: f32,
    pub class_id: usize,
}

impl Detection {
    pub fn xywh(&self) -> [f32; 4] {
        [self.x, self.y, self.w, self.h]
    }

    /// Corner coordinates `x1, y1, x2, y2`.
    pub fn xyxy(&self) -> [f32; 4] {
        [
            self.x - self.w / 2.0,
            self.y - self.h / 2.0,
            self.x + self.w / 2.0,
            self.y + self.h / 2.0,
        ]
    }
}

/// Turns decoded candidates `[B, N, 5+C]` into per-image detections.
///
/// Multi-class rows already carry `P(class) * P(object)` in their class
/// columns, so the best class score is the confidence. Single-class rows use
/// objectness.
pub fn extract_detections<B: Backend>(decoded: Tensor<B, 3>, conf_threshold: f32) -> Vec<Vec<Detection>> {
    let [batch, candidates, attributes] = decoded.dims();
    let values: Vec<f32> = decoded.into_data().convert::<f32>().into_vec().unwrap_or_default();
    if values.len() != batch * candidates * attributes {
        return vec![Vec::new(); batch];
    }

    values
        .chunks_exact((candidates * attributes).max(1))
        .take(batch)
        .map(|image| {
            image
                .chunks_exact(attributes)
                .filter_map(|row| {
                    let (class_id, confidence) = match &row[5..] {
                        [] | [_] => (0, row[4]),
                        scores => scores
                            .iter()
                            .copied()
                            .enumerate()
                            .fold((0, f32::MIN), |best, (c, s)| if s > best.1 { (c, s) } else { best }),
                    };
                    (confidence >= conf_threshold).then_some(Detection {
                        x: row[0],
                        y: row[1],
                        w: row[2],
                        h: row[3],
                        confidence,
                        class_id,
                    })
                })
                .collect()
        })
        .collect()
}

pub struct NMS;

impl NMS {
    pub fn iou(a: &Detection, b: &Detection) -> f32 {
        bbox_iou(a.xywh(), b.xywh(), BoxFormat::Xywh, IouKind::IoU)
    }

    /// Class-aware greedy suppression, highest confidence first.
    pub fn apply(
        detections: Vec<Detection>,
        iou_threshold: f32,
        confidence_threshold: f32,
    ) -> Vec<Detection> {
        let mut valid: Vec<_> = detections
            .into_iter()
            .filter(|d| d.confidence >= confidence_threshold)
            .collect();

        valid.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        let mut used = vec![false; valid.len()];
        let mut result = Vec::new();

        for i in 0..valid.len() {
            if used[i] {
                continue;
            }
            result.push(valid[i].clone());

            for j in (i + 1)..valid.len() {
                if used[j] || valid[j].class_id != valid[i].class_id {
                    continue;
                }
                if Self::iou(&valid[i], &valid[j]) > iou_threshold {
                    used[j] = true;
                }
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    fn det(x: f32, confidence: f32, class_id: usize) -> Detection {
        Detection {
            x,
            y: 10.0,
            w: 10.0,
            h: 10.0,
            confidence,
            class_id,
        }
    }

    #[test]
    fn overlapping_boxes_of_one_class_are_suppressed() {
        let kept = NMS::apply(
            vec![det(10.0, 0.6, 0), det(11.0, 0.9, 0), det(11.0, 0.8, 1), det(50.0, 0.7, 0)],
            0.45,
            0.25,
        );
        let summary: Vec<_> = kept.iter().map(|d| (d.class_id, d.confidence)).collect();
        assert_eq!(summary, vec![(0, 0.9), (1, 0.8), (0, 0.7)]);
    }

    #[test]
    fn low_confidence_is_dropped() {
        assert!(NMS::apply(vec![det(0.0, 0.1, 0)], 0.45, 0.25).is_empty());
    }

    #[test]
    fn extraction_picks_best_class() {
        let device = Default::default();
        let decoded = Tensor::<NdArray, 3>::from_floats(
            [[
                [5.0, 6.0, 2.0, 3.0, 0.9, 0.1, 0.7],
                [1.0, 1.0, 1.0, 1.0, 0.9, 0.05, 0.1],
            ]],
            &device,
        );
        let images = extract_detections(decoded, 0.25);
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].len(), 1);
        assert_eq!(images[0][0].class_id, 1);
        assert!((images[0][0].confidence - 0.7).abs() < 1e-6);
    }
}
