// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of Spiralgram — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::config::BlockType;
use sg_tensor::TensorError;
use thiserror::Error;

/// Errors raised while validating configurations or assembling networks.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Only the basic residual block is implemented.
    #[error("block type {0:?} is not implemented")]
    UnsupportedBlockType(BlockType),
    /// `depth` must decompose as `blocks_per_stage * 6 + 2`.
    #[error("depth {depth} does not satisfy (depth - 2) % 6 == 0")]
    DepthMismatch { depth: usize },
    /// Free-form configuration violation (bad block string, missing front-end,
    /// stage tables shorter than the block count, ...).
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Propagated tensor or layer failure.
    #[error(transparent)]
    Tensor(#[from] TensorError),
    /// Serde failure while merging configuration overrides.
    #[error("configuration merge failed: {0}")]
    Merge(String),
}
