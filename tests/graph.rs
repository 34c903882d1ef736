mod common;

use burn::backend::NdArray;
use burn::prelude::*;

use common::{small_config, to_vec, two_head_model, TWO_HEAD_CANDIDATES, TWO_HEAD_CFG};
use yolov3_detection::config::parse_model_config;
use yolov3_detection::model::blocks::scale_image;
use yolov3_detection::model::{extract_detections, Darknet, DarknetConfig, NMS};

type TestBackend = NdArray;

#[test]
fn one_node_per_block_without_forward_references() {
    let device = Default::default();
    let specs = parse_model_config(TWO_HEAD_CFG, "two-head.cfg").unwrap();
    let model = two_head_model::<TestBackend>(&small_config(), &device);

    assert_eq!(model.layers.len(), specs.len() - 1);
    for (i, layer) in model.layers.iter().enumerate() {
        assert!(
            layer.sources().iter().all(|&j| j < i),
            "layer {i} ({}) reads {:?}",
            layer.name(),
            layer.sources()
        );
    }
    assert_eq!(model.yolo_layer_indices(), &[8, 13]);
    let strides: Vec<_> = model.yolo_layers().iter().map(|y| y.stride).collect();
    assert_eq!(strides, vec![32, 16]);

    // routed: shortcut source, route sources, and the bias-only head convs
    let routed: Vec<usize> = model
        .routs()
        .iter()
        .enumerate()
        .filter_map(|(i, &r)| r.then_some(i))
        .collect();
    assert_eq!(routed, vec![1, 5, 6, 7, 10, 12]);
}

#[test]
fn inference_concatenates_all_heads() {
    let device = Default::default();
    let model = two_head_model::<TestBackend>(&small_config(), &device);
    let images = Tensor::<TestBackend, 4>::random([2, 3, 64, 64], burn::tensor::Distribution::Default, &device);

    let (decoded, raw) = model.forward(images.clone());
    assert_eq!(decoded.dims(), [2, TWO_HEAD_CANDIDATES, 7]);
    assert_eq!(raw[0].dims(), [2, 3, 2, 2, 7]);
    assert_eq!(raw[1].dims(), [2, 3, 4, 4, 7]);

    let train = model.forward_train(images);
    assert_eq!(train.len(), 2);
    assert_eq!(train[1].dims(), [2, 3, 4, 4, 7]);

    // every decoded center lies in the image frame
    let values = to_vec(decoded.clone());
    for row in values.chunks_exact(7) {
        assert!(row[0] >= 0.0 && row[0] <= 64.0 && row[1] >= 0.0 && row[1] <= 64.0);
        assert!(row[4] > 0.0 && row[4] < 1.0);
    }

    let detections = extract_detections(decoded, 0.0);
    assert_eq!(detections.len(), 2);
    assert_eq!(detections[0].len(), TWO_HEAD_CANDIDATES);
    let kept = NMS::apply(detections[0].clone(), 0.5, 0.0);
    assert!(!kept.is_empty() && kept.len() <= TWO_HEAD_CANDIDATES);
}

#[test]
fn augmented_inference_triples_candidates() {
    let device = Default::default();
    let model = two_head_model::<TestBackend>(&small_config(), &device);
    let images = Tensor::<TestBackend, 4>::ones([1, 3, 64, 64], &device);

    let (single, _) = model.forward(images.clone());
    let augmented = model.forward_augmented(images);
    assert_eq!(augmented.dims(), [1, 3 * single.dims()[1], 7]);

    // the un-augmented pass comes first and is unchanged
    let first = augmented.slice([0..1, 0..TWO_HEAD_CANDIDATES, 0..7]);
    let a = to_vec(first);
    let b = to_vec(single);
    for (x, y) in a.iter().zip(&b) {
        assert!((x - y).abs() < 1e-5);
    }
}

#[test]
fn augmented_passes_run_on_their_own_grids() {
    let device = Default::default();
    let model = two_head_model::<TestBackend>(&small_config(), &device);
    let images = Tensor::<TestBackend, 4>::ones([1, 3, 96, 96], &device);

    let original = model.forward(images.clone()).0.dims()[1];
    let flipped = model.forward(scale_image(images.clone().flip([3]), 0.83, false)).0.dims()[1];
    let shrunk = model.forward(scale_image(images.clone(), 0.67, false)).0.dims()[1];
    // 96 -> 79 and 64, both padded up to 128
    assert_eq!((original, flipped, shrunk), (135, 240, 240));

    let augmented = model.forward_augmented(images);
    assert_eq!(augmented.dims()[1], original + flipped + shrunk);
}

#[test]
fn export_graph_returns_normalized_boxes() {
    let device = Default::default();
    let config = DarknetConfig {
        export: true,
        ..small_config()
    };
    let model = two_head_model::<TestBackend>(&config, &device);
    let image = Tensor::<TestBackend, 4>::ones([1, 3, 64, 64], &device);

    let (scores, boxes) = model.forward_export(image);
    assert_eq!(scores.dims(), [TWO_HEAD_CANDIDATES, 2]);
    assert_eq!(boxes.dims(), [TWO_HEAD_CANDIDATES, 4]);
    for row in to_vec(boxes).chunks_exact(4) {
        assert!(row[0] >= 0.0 && row[0] <= 1.0 && row[1] >= 0.0 && row[1] <= 1.0);
    }
}

#[test]
fn fused_model_matches_unfused() {
    let device = Default::default();
    let model = two_head_model::<TestBackend>(&small_config(), &device);
    let fused = model.fuse();

    assert!(fused
        .layers
        .iter()
        .filter_map(|l| l.as_conv())
        .all(|block| block.norm.is_none()));
    // the source model keeps its norms
    assert!(model.layers[0].as_conv().unwrap().norm.is_some());

    let images = Tensor::<TestBackend, 4>::random([1, 3, 64, 64], burn::tensor::Distribution::Default, &device);
    let (expected, _) = model.forward(images.clone());
    let (actual, _) = fused.forward(images);
    for (e, a) in to_vec(expected).iter().zip(to_vec(actual).iter()) {
        assert!((e - a).abs() <= 1e-3 * e.abs().max(1.0), "{e} vs {a}");
    }
}

#[test]
fn cfg_file_is_read_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("two-head.cfg");
    std::fs::write(&path, TWO_HEAD_CFG).unwrap();

    let device = Default::default();
    let model = Darknet::<TestBackend>::from_cfg_file(&path, &small_config(), &device).unwrap();
    assert_eq!(model.yolo_layers().len(), 2);
}
