mod common;

use burn::backend::{Autodiff, NdArray};
use burn::prelude::*;

use common::{small_config, to_vec, two_head_model, TWO_HEAD_CFG};
use yolov3_detection::error::TargetError;
use yolov3_detection::model::{TargetBox, NMS};
use yolov3_detection::training::{Trainer, TrainingConfig};

type TrainBackend = Autodiff<NdArray>;

#[test]
fn train_step_updates_parameters() {
    let device = Default::default();
    let model = two_head_model::<TrainBackend>(&small_config(), &device);
    let before = to_vec(model.layers[0].as_conv().unwrap().conv.branches()[0].weight.val());

    let mut trainer = Trainer::new(model, TrainingConfig::default());
    let images = Tensor::<TrainBackend, 4>::ones([2, 3, 64, 64], &device);
    let targets = [
        TargetBox::new(0, 0, 0.5, 0.5, 0.3, 0.3),
        TargetBox::new(1, 1, 0.25, 0.75, 0.3, 0.3),
    ];

    let losses = trainer.train_step(images, &targets).unwrap();
    assert_eq!(trainer.steps(), 1);
    assert!(losses.total.is_finite() && losses.total > 0.0);
    assert!(losses.box_loss > 0.0 && losses.classification > 0.0);

    let after = to_vec(trainer.model.layers[0].as_conv().unwrap().conv.branches()[0].weight.val());
    assert!(before.iter().zip(&after).any(|(b, a)| b != a));
}

#[test]
fn bad_class_id_aborts_the_step() {
    let device = Default::default();
    let model = two_head_model::<TrainBackend>(&small_config(), &device);
    let mut trainer = Trainer::new(model, TrainingConfig::default());
    let images = Tensor::<TrainBackend, 4>::ones([1, 3, 64, 64], &device);

    let err = trainer
        .train_step(images, &[TargetBox::new(0, 2, 0.5, 0.5, 0.3, 0.3)])
        .unwrap_err();
    assert!(matches!(err, TargetError::ClassOutOfRange { class_id: 2, num_classes: 2 }));
    assert_eq!(trainer.steps(), 0);
}

#[test]
fn trainer_builds_from_config_and_detects() {
    let device = Default::default();
    let dir = tempfile::tempdir().unwrap();
    let cfg = dir.path().join("two-head.cfg");
    std::fs::write(&cfg, TWO_HEAD_CFG).unwrap();

    let config = TrainingConfig {
        cfg: cfg.to_str().unwrap().to_string(),
        model: small_config(),
        conf_threshold: 0.0,
        iou_threshold: 0.5,
        ..TrainingConfig::default()
    };
    let trainer = Trainer::<TrainBackend>::from_config(config, &device).unwrap();
    assert_eq!(trainer.model.yolo_layers().len(), 2);

    let images = Tensor::<TrainBackend, 4>::ones([2, 3, 64, 64], &device);
    let detections = trainer.detect(images);
    assert_eq!(detections.len(), 2);
    for image in &detections {
        assert!(!image.is_empty());
        // survivors of the same class never overlap past the threshold
        for (i, a) in image.iter().enumerate() {
            for b in &image[i + 1..] {
                if a.class_id == b.class_id {
                    assert!(NMS::iou(a, b) <= 0.5);
                }
            }
        }
    }
}

#[test]
fn missing_cfg_is_a_config_error() {
    let config = TrainingConfig {
        cfg: "does/not/exist.cfg".to_string(),
        ..TrainingConfig::default()
    };
    assert!(Trainer::<TrainBackend>::from_config(config, &Default::default()).is_err());
}
