// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of Spiralgram — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Forward-only neural module API for the Spiralgram audio stack.
//!
//! The crate offers an `nn.Module` style surface kept entirely in Rust:
//! layers expose [`module::Module`], parameters are traversed through
//! visitors, and weight initialisation runs as a post-construction walk in
//! which every layer variant applies its own rule.

pub mod damping;
pub mod init;
pub mod io;
pub mod layers;
pub mod module;

pub use damping::DampingCache;
pub use init::{InitContext, InitPolicy};
pub use io::{load_bincode, load_json, save_bincode, save_json};
pub use layers::activation::Relu;
pub use layers::conv::{AvgPool2d, DampedConv2d, MaxPool2d};
pub use layers::linear::Linear;
pub use layers::normalization::BatchNorm2d;
pub use layers::sequential::Sequential;
pub use module::{Module, Parameter};

pub use sg_tensor::{PureResult, Tensor, TensorError};
