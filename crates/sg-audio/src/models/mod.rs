// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of Spiralgram — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Network assemblies built on the Spiralgram neural module stack.

pub mod attention;
pub mod cp_resnet;

pub use self::attention::AttentionAvg;
pub use self::cp_resnet::{Network, NetworkOutput};
