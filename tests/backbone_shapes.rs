//! Integration tests for backbone construction and the forward contract

use gat_backbone::model::weight_url;
use gat_backbone::{Backbone, BackboneConfig, BackboneError, RecordingObserver, Variant};
use ndarray::Array4;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;

fn tiny_resnet18() -> Backbone {
    Backbone::build(BackboneConfig::new(Variant::ResNet18, [256, 512], (1, 1))).unwrap()
}

#[test]
fn resnet101_pyramid_shapes_for_640_input() {
    let config = BackboneConfig::new(Variant::ResNet101, [1024, 2048], (10, 10));
    let backbone = Backbone::build(config).unwrap();

    let shapes = backbone.output_shapes([1, 3, 640, 640]).unwrap();
    assert_eq!(shapes[0], [1, 256, 160, 160]);
    assert_eq!(shapes[1], [1, 512, 80, 80]);
    assert_eq!(shapes[2], [1, 1024, 40, 40]);
    assert_eq!(shapes[3], [1, 2048, 20, 20]);
}

#[test]
fn every_variant_builds_with_matching_fusion_channels() {
    for variant in [
        Variant::ResNet18,
        Variant::ResNet34,
        Variant::ResNet50,
        Variant::ResNet101,
        Variant::ResNet152,
    ] {
        let channels = variant.stage_channels();
        let config = BackboneConfig::new(variant, [channels[2], channels[3]], (4, 4));
        let backbone = Backbone::build(config).unwrap();

        let expected_blocks: usize = variant.block_counts().iter().sum();
        let actual_blocks = backbone.layer1.len()
            + backbone.layer2.len()
            + backbone.layer3.len()
            + backbone.layer4.len();
        assert_eq!(actual_blocks, expected_blocks, "{}", variant.id());
    }
}

#[test]
fn forward_emits_six_taps_in_pipeline_order() {
    let backbone = tiny_resnet18();
    let input = Array4::random((1, 3, 32, 32), Uniform::new(-1.0, 1.0));

    let mut observer = RecordingObserver::new();
    let pyramid = backbone.forward_observed(&input, &mut observer).unwrap();

    let names: Vec<&str> = observer.taps.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, ["c2", "c3", "c4", "c4_fused", "c5", "c5_fused"]);

    // Fusion taps keep the resolution of the stage they refine
    assert_eq!(observer.taps[2].1, observer.taps[3].1);
    assert_eq!(observer.taps[4].1, observer.taps[5].1);

    // Observation does not change what forward returns
    let unobserved = backbone.forward(&input).unwrap();
    assert_eq!(unobserved.c5, pyramid.c5);
}

#[test]
fn batch_dimension_is_preserved() {
    let backbone = tiny_resnet18();
    let input = Array4::random((3, 3, 32, 32), Uniform::new(-1.0, 1.0));
    let pyramid = backbone.forward(&input).unwrap();

    for shape in pyramid.shapes() {
        assert_eq!(shape[0], 3);
    }
}

#[test]
fn unknown_model_identifier_leaves_backbone_untouched() {
    let backbone = tiny_resnet18();
    let before = backbone.conv1.weight.clone();

    match weight_url("resnet999") {
        Err(BackboneError::UnknownModel(id)) => assert_eq!(id, "resnet999"),
        other => panic!("expected UnknownModel, got {other:?}"),
    }

    assert_eq!(backbone.conv1.weight, before);
}

#[test]
fn serde_round_trip_preserves_block_output() {
    let block = gat_backbone::model::Bottleneck::new(16, 4, 1);
    let input = Array4::random((1, 16, 8, 8), Uniform::new(-1.0, 1.0));
    let expected = block.forward(&input);

    let json = serde_json::to_string(&block).unwrap();
    let restored: gat_backbone::model::Bottleneck = serde_json::from_str(&json).unwrap();

    assert_eq!(restored.forward(&input), expected);
}

#[test]
fn serde_round_trip_preserves_fusion_output() {
    let fusion = gat_backbone::model::GatFusion::new(8, (2, 2));
    let input = Array4::random((1, 8, 8, 8), Uniform::new(-1.0, 1.0));
    let expected = fusion.forward(&input);

    let json = serde_json::to_string(&fusion).unwrap();
    let restored: gat_backbone::model::GatFusion = serde_json::from_str(&json).unwrap();

    assert_eq!(restored.forward(&input), expected);
}

#[test]
fn normalization_layers_start_at_identity() {
    let mut backbone = tiny_resnet18();

    let mut scales_ok = true;
    let mut shifts_ok = true;
    backbone.visit_layers(&mut |layer| {
        if let gat_backbone::model::LayerMut::Normalize(bn) = layer {
            scales_ok &= bn.weight.iter().all(|&w| w == 1.0);
            shifts_ok &= bn.bias.iter().all(|&b| b == 0.0);
        }
    });

    assert!(scales_ok);
    assert!(shifts_ok);
}
