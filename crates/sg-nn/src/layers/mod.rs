// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of Spiralgram — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

pub mod activation;
pub mod conv;
pub mod linear;
pub mod normalization;
pub mod sequential;

pub use activation::Relu;
pub use conv::{AvgPool2d, DampedConv2d, MaxPool2d};
pub use linear::Linear;
pub use normalization::BatchNorm2d;
pub use sequential::Sequential;
