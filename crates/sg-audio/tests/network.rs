// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of Spiralgram — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use sg_audio::{
    network_for_rho, schedule_for, MelFrontend, ModelConfig, Network, NetworkOutput, RfProbe,
    RhoSpec,
};
use sg_nn::{io, Module};
use sg_tensor::Tensor;
use tempfile::tempdir;

fn small_spec() -> RhoSpec {
    RhoSpec {
        rho_time: 12,
        rho_freq: 12,
        base_channels: 8,
        blocks: "211".to_string(),
        n_classes: 4,
        input_shape: [1, 1, 32, 32],
        ..RhoSpec::default()
    }
}

#[test]
fn config_only_and_single_call_paths_agree() {
    let spec = small_spec();
    let config = schedule_for(&spec).unwrap();
    let manual = Network::from_config(&config).unwrap();
    let direct = network_for_rho(&spec).unwrap();
    assert_eq!(manual.layer_specs(), direct.layer_specs());
    // The assembled layers also match the pure schedule flattening.
    let flattened = sg_audio::schedule::layer_specs(&config).unwrap();
    assert_eq!(manual.layer_specs(), flattened.as_slice());
}

#[test]
fn forward_shapes_follow_the_schedule() {
    let network = network_for_rho(&small_spec()).unwrap();
    let input = Tensor::random_normal(3, 32 * 32, 0.0, 1.0, Some(21)).unwrap();
    let output = network.run(&input).unwrap();
    match output {
        NetworkOutput::Logits(logits) => assert_eq!(logits.shape(), (3, 4)),
        other => panic!("expected logits, got {other:?}"),
    }
}

#[test]
fn realized_receptive_field_is_reported_for_the_built_config() {
    let config = schedule_for(&small_spec()).unwrap();
    let probe = RfProbe::new(&config).unwrap();
    assert_eq!(probe.total_layers(), 8);
    let realized = probe.realized().unwrap();
    assert!(realized.freq >= 12 || realized.time >= 12);
    assert_eq!(realized.scale, 4);
}

#[test]
fn state_dict_round_trips_through_bincode() {
    let config = schedule_for(&small_spec()).unwrap();
    let network = Network::from_config_seeded(&config, 13).unwrap();
    let dir = tempdir().unwrap();
    let path = dir.path().join("network.bin");
    io::save_bincode(&network, &path).unwrap();

    let mut restored = Network::from_config_seeded(&config, 14).unwrap();
    io::load_bincode(&mut restored, &path).unwrap();
    assert_eq!(
        network.state_dict().unwrap(),
        restored.state_dict().unwrap()
    );

    let input = Tensor::random_normal(1, 32 * 32, 0.0, 1.0, Some(5)).unwrap();
    network.set_training(false);
    restored.set_training(false);
    let a = network.forward(&input).unwrap();
    let b = restored.forward(&input).unwrap();
    assert_eq!(a, b);
}

#[test]
fn raw_spectrogram_front_end_feeds_the_stem() {
    let mut config = schedule_for(&RhoSpec {
        input_shape: [1, 1, -1, 16],
        ..small_spec()
    })
    .unwrap();
    config.use_raw_spectograms = true;
    // Twelve mel bands mixed from four power bins.
    let basis = Tensor::from_fn(12, 4, |r, c| if c / 2 == r % 2 { 0.5 } else { 0.0 }).unwrap();
    let frontend = MelFrontend::new(basis);
    let network = Network::from_config_with_frontend(&config, frontend).unwrap();
    let input = Tensor::random_uniform(2, 4 * 16, 0.1, 10.0, Some(17)).unwrap();
    let output = network.run(&input).unwrap();
    match output {
        NetworkOutput::Logits(logits) => assert_eq!(logits.shape(), (2, 4)),
        other => panic!("expected logits, got {other:?}"),
    }
}

#[test]
fn missing_front_end_for_raw_mode_is_an_error() {
    let mut config = schedule_for(&small_spec()).unwrap();
    config.use_raw_spectograms = true;
    assert!(Network::from_config(&config).is_err());
}

#[test]
fn merged_overrides_rebuild_into_a_consistent_network() {
    let config = schedule_for(&small_spec()).unwrap();
    let merged = config
        .merge_overrides(&serde_json::json!({
            "n_classes": 2,
            "apply_softmax": true
        }))
        .unwrap();
    let network = Network::from_config_seeded(&merged, 3).unwrap();
    let input = Tensor::random_normal(1, 32 * 32, 0.0, 1.0, Some(2)).unwrap();
    match network.run(&input).unwrap() {
        NetworkOutput::Probabilities(probs) => {
            assert_eq!(probs.shape(), (1, 2));
            let total: f32 = probs.data().iter().sum();
            assert!((total - 1.0).abs() < 1e-4);
        }
        other => panic!("expected probabilities, got {other:?}"),
    }
}

#[test]
fn config_serialises_as_a_nested_mapping() {
    let config = schedule_for(&small_spec()).unwrap();
    let tree = serde_json::to_value(&config).unwrap();
    assert_eq!(tree["block_type"], "basic");
    assert!(tree["stage1"]["maxpool"].is_array());
    let parsed: ModelConfig = serde_json::from_value(tree).unwrap();
    assert_eq!(parsed, config);
}
