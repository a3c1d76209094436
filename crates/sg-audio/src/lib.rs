// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of Spiralgram — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Receptive-field-scheduled residual networks for audio spectrograms.
//!
//! The crate derives a full per-layer kernel and downsampling schedule from a
//! pair of receptive-field targets (one per spectrogram axis), then assembles
//! the matching frequency-damped residual network. The scheduler is pure and
//! runs once; the resulting [`config::ModelConfig`] is an ordinary serde
//! mapping that can be stored, merged with overrides, or handed straight to
//! [`models::Network::from_config`].

pub mod config;
pub mod error;
pub mod frontend;
pub mod models;
pub mod schedule;

pub use config::{AttentionMode, BlockType, ModelConfig, StageConfig, WeightInit};
pub use error::ModelError;
pub use frontend::MelFrontend;
pub use models::{Network, NetworkOutput};
pub use schedule::{network_for_rho, schedule_for, LayerSpec, RfProbe, RfState, RhoSpec};
