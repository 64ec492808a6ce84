use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use ndarray::{Array1, Array4};
use std::collections::BTreeMap;
use std::path::Path;

use mri_capsnet::inference::{ReferenceSet, NUM_CLASSES};
use mri_capsnet::model::config::{BackboneConfig, CapsuleConfig, DigitCapsConfig};
use mri_capsnet::model::state_dict_of;
use mri_capsnet::model::weights::{write_tensors, NamedTensor};
use mri_capsnet::{CapNet, CapsNetError, ClassLabel, ClassifierConfig, InferenceContext, ModelBuilder, NetworkConfig};

fn small_network() -> NetworkConfig {
    NetworkConfig {
        input_size: 64,
        backbone: BackboneConfig {
            input_channels: 1,
            stem_channels: 8,
            stem_kernel: 7,
            stem_stride: 2,
            stem_padding: 3,
            stage_channels: vec![8, 8, 16, 16],
            blocks_per_stage: vec![1, 1, 1, 1],
            batch_norm_eps: 1e-5,
        },
        primary: CapsuleConfig {
            num_capsules: 4,
            capsule_dim: 8,
            kernel_size: 3,
            stride: 1,
            padding: 1,
        },
        digit: DigitCapsConfig {
            num_capsules: 4,
            capsule_dim: 16,
            routing_iterations: 3,
        },
    }
}

fn seeded(config: NetworkConfig, seed: u64) -> CapNet {
    ModelBuilder::new()
        .with_network_config(config)
        .with_seed(seed)
        .build()
        .unwrap()
}

/// Une classe contient exactement `anchor`, les autres en sont éloignées.
fn anchored(anchor: &Array1<f32>, class: usize) -> ReferenceSet {
    let classes: BTreeMap<usize, Vec<Array1<f32>>> = (0..NUM_CLASSES)
        .map(|c| {
            let vectors = if c == class {
                vec![anchor.clone()]
            } else {
                vec![anchor.mapv(|v| v + 1.0 + c as f32), anchor.mapv(|v| v - 2.0)]
            };
            (c, vectors)
        })
        .collect();
    ReferenceSet::new(classes).unwrap()
}

fn write_config(dir: &Path, network: &NetworkConfig) -> ClassifierConfig {
    let json = serde_json::json!({
        "model_path": dir.join("model.safetensors"),
        "reference_path": dir.join("references.safetensors"),
        "network": network,
    });
    let path = dir.join("classifier.json");
    std::fs::write(&path, serde_json::to_vec_pretty(&json).unwrap()).unwrap();
    ClassifierConfig::from_json_file(&path).unwrap()
}

fn ramp_image() -> Array4<f32> {
    Array4::from_shape_fn((1, 1, 64, 64), |(_, _, h, w)| ((h * 3 + w) % 64) as f32 / 32.0 - 1.0)
}

#[test]
fn black_mri_slice_matches_its_reference_class() {
    let encoder = seeded(NetworkConfig::default(), 7);
    let black = DynamicImage::ImageLuma8(GrayImage::new(224, 224));

    let scratch_ctx = InferenceContext::from_parts(encoder.clone(), anchored(&Array1::zeros(4), 0)).unwrap();
    let input = scratch_ctx.preprocessor().process(&black);
    assert_eq!(input.dim(), (1, 1, 224, 224));
    let anchor = encoder.embed(&input.view()).unwrap();
    assert_eq!(anchor.len(), 4);

    let ctx = InferenceContext::from_parts(encoder, anchored(&anchor, 1)).unwrap();
    let prediction = ctx.classify_image(&black).unwrap();

    assert_eq!(prediction.label, ClassLabel::VeryMildDemented);
    assert!(prediction.closeness[1] > 99.9);

    let response = prediction.to_response();
    assert_eq!(response.prediction, ClassLabel::VeryMildDemented);
    let names: Vec<ClassLabel> = response.closeness.iter().map(|s| s.class).collect();
    assert_eq!(names, ClassLabel::ALL.to_vec());
    let total: f64 = response.closeness.iter().map(|s| s.score).sum();
    assert!((total - 100.0).abs() < 0.1);
}

#[test]
fn initialize_loads_weights_and_mixed_references() {
    let dir = tempfile::tempdir().unwrap();
    let network = small_network();
    let encoder = seeded(network.clone(), 11);

    std::fs::write(
        dir.path().join("model.safetensors"),
        state_dict_of(&encoder).unwrap().to_safetensors().unwrap(),
    )
    .unwrap();

    let raw = ramp_image();
    let raw_embedding = encoder.embed(&raw.view()).unwrap();
    let mut tensors = vec![NamedTensor::from_array("0.0", &raw.view())];
    for class in 1..NUM_CLASSES {
        let far = raw_embedding.mapv(|v| v + class as f32);
        tensors.push(NamedTensor::new(format!("{class}.0"), vec![1, 4], far.to_vec()));
    }
    std::fs::write(dir.path().join("references.safetensors"), write_tensors(&tensors).unwrap()).unwrap();

    let config = write_config(dir.path(), &network);
    let ctx = InferenceContext::initialize(&config).unwrap();

    // exemplaire brut passé dans l'encodeur chargé, les précalculés sont aplatis
    assert_eq!(ctx.references().class(0)[0], raw_embedding);
    assert_eq!(ctx.references().class(2)[0], raw_embedding.mapv(|v| v + 2.0));
    assert_eq!(ctx.encoder().forward(&raw.view()).unwrap(), encoder.forward(&raw.view()).unwrap());

    let prediction = ctx.classify_tensor(&raw.view()).unwrap();
    assert_eq!(prediction.label, ClassLabel::NonDemented);
}

#[test]
fn wrapped_checkpoint_loads_like_bare_one() {
    let dir = tempfile::tempdir().unwrap();
    let network = small_network();
    let encoder = seeded(network.clone(), 12);

    let mut wrapped = state_dict_of(&encoder).unwrap().wrapped();
    wrapped.push(NamedTensor::new("epoch", vec![1], vec![30.0]));
    std::fs::write(dir.path().join("model.safetensors"), write_tensors(&wrapped).unwrap()).unwrap();

    let anchor = encoder.embed(&ramp_image().view()).unwrap();
    std::fs::write(
        dir.path().join("references.safetensors"),
        anchored(&anchor, 3).to_safetensors().unwrap(),
    )
    .unwrap();

    let ctx = InferenceContext::initialize(&write_config(dir.path(), &network)).unwrap();
    let prediction = ctx.classify_tensor(&ramp_image().view()).unwrap();
    assert_eq!(prediction.label, ClassLabel::ModerateDemented);
}

#[test]
fn predict_image_reads_files_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let network = small_network();
    let encoder = seeded(network.clone(), 13);
    std::fs::write(
        dir.path().join("model.safetensors"),
        state_dict_of(&encoder).unwrap().to_safetensors().unwrap(),
    )
    .unwrap();

    let slice = GrayImage::from_fn(120, 90, |x, y| Luma([((x * 2 + y) % 256) as u8]));
    let image_path = dir.path().join("slice.png");
    DynamicImage::ImageLuma8(slice.clone())
        .save_with_format(&image_path, ImageFormat::Png)
        .unwrap();

    let scratch_ctx = InferenceContext::from_parts(encoder.clone(), anchored(&Array1::zeros(4), 0)).unwrap();
    let input = scratch_ctx.preprocessor().process(&DynamicImage::ImageLuma8(slice));
    let anchor = encoder.embed(&input.view()).unwrap();
    std::fs::write(
        dir.path().join("references.safetensors"),
        anchored(&anchor, 2).to_safetensors().unwrap(),
    )
    .unwrap();

    let ctx = InferenceContext::initialize(&write_config(dir.path(), &network)).unwrap();
    let prediction = mri_capsnet::predict_image(&ctx, &image_path).unwrap();
    assert_eq!(prediction.label, ClassLabel::MildDemented);

    let distance = ctx.compare_paths(&image_path, &image_path).unwrap();
    assert_eq!(distance[[0, 0]], 0.0);
}

#[test]
fn missing_reference_class_fails_initialization() {
    let dir = tempfile::tempdir().unwrap();
    let network = small_network();
    let encoder = seeded(network.clone(), 14);
    std::fs::write(
        dir.path().join("model.safetensors"),
        state_dict_of(&encoder).unwrap().to_safetensors().unwrap(),
    )
    .unwrap();

    let tensors: Vec<NamedTensor> = (0..3)
        .map(|class| NamedTensor::new(format!("{class}.0"), vec![4], vec![class as f32; 4]))
        .collect();
    std::fs::write(dir.path().join("references.safetensors"), write_tensors(&tensors).unwrap()).unwrap();

    let err = InferenceContext::initialize(&write_config(dir.path(), &network)).unwrap_err();
    assert!(matches!(err, CapsNetError::EmptyReferenceClass(3)));
}

#[test]
fn checkpoint_for_another_geometry_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut other = small_network();
    other.primary.num_capsules = 2;
    let encoder = seeded(other, 15);
    std::fs::write(
        dir.path().join("model.safetensors"),
        state_dict_of(&encoder).unwrap().to_safetensors().unwrap(),
    )
    .unwrap();
    std::fs::write(
        dir.path().join("references.safetensors"),
        anchored(&Array1::zeros(4), 0).to_safetensors().unwrap(),
    )
    .unwrap();

    let err = InferenceContext::initialize(&write_config(dir.path(), &small_network())).unwrap_err();
    assert!(matches!(err, CapsNetError::ArtifactShape { .. }));
}
