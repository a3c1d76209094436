// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of Spiralgram — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::error::ModelError;
use serde::{Deserialize, Serialize};

/// Residual block family. Only [`BlockType::Basic`] is implemented;
/// `bottleneck` deserialises for compatibility and fails fast at assembly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockType {
    #[serde(rename = "basic")]
    Basic,
    #[serde(rename = "bottleneck")]
    Bottleneck,
}

/// Whole-model weight initialisation policy. The wire name `fixup` is kept
/// for compatibility with existing configuration mappings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeightInit {
    #[serde(rename = "standard")]
    Standard,
    #[serde(rename = "fixup")]
    DepthScaled,
}

/// Attention-pooling head variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttentionMode {
    #[serde(rename = "sum_all")]
    SumAll,
    #[serde(rename = "per_class")]
    PerClass,
}

/// Per-stage schedule: downsampling insertion points and the two kernel-size
/// tables, one entry per residual block, each entry `(frequency, time)`.
///
/// Position `0` in `maxpool` inserts a pooling step before the first block;
/// position `p >= 1` inserts one after block `p`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    pub maxpool: Vec<usize>,
    pub k1s: Vec<(usize, usize)>,
    pub k2s: Vec<(usize, usize)>,
}

/// Complete network configuration, the nested-mapping contract consumed by
/// [`crate::models::Network::from_config`]. Every field has a serde default
/// so partial mappings parse; unknown keys are ignored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub arch: String,
    /// `(batch placeholder, channels, frequency, time)`; the spatial axes may
    /// be `-1` for "unspecified".
    pub input_shape: [i64; 4],
    pub n_classes: usize,
    pub base_channels: usize,
    pub block_type: BlockType,
    pub depth: usize,
    /// Explicit per-stage block counts; bypasses the depth-derived default.
    pub n_blocks_per_stage: Option<[usize; 3]>,
    /// Explicit per-stage channel widths; bypasses the base-channel ramp.
    pub n_channels: Option<[usize; 3]>,
    /// Widens stage 3 to eight times the base width.
    pub grow_a_lot: bool,
    pub stage1: StageConfig,
    pub stage2: StageConfig,
    pub stage3: StageConfig,
    pub weight_init: WeightInit,
    pub use_raw_spectograms: bool,
    pub apply_softmax: bool,
    pub return_embed: bool,
    pub stop_before_global_avg_pooling: bool,
    pub use_check_point: bool,
    pub attention_avg: Option<AttentionMode>,
    pub pooling_padding: usize,
    /// Emit a structured trace line at every shape transition of the forward
    /// pass. Applies to every call, not only the first.
    pub trace_shapes: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            arch: String::new(),
            input_shape: [1, 1, -1, -1],
            n_classes: 10,
            base_channels: 128,
            block_type: BlockType::Basic,
            depth: 26,
            n_blocks_per_stage: None,
            n_channels: None,
            grow_a_lot: false,
            stage1: StageConfig::default(),
            stage2: StageConfig::default(),
            stage3: StageConfig::default(),
            weight_init: WeightInit::Standard,
            use_raw_spectograms: false,
            apply_softmax: false,
            return_embed: false,
            stop_before_global_avg_pooling: false,
            use_check_point: false,
            attention_avg: None,
            pooling_padding: 0,
            trace_shapes: false,
        }
    }
}

impl ModelConfig {
    /// Fails fast on configurations the assembly cannot honour.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.block_type != BlockType::Basic {
            return Err(ModelError::UnsupportedBlockType(self.block_type));
        }
        self.blocks_per_stage().map(|_| ())
    }

    /// Per-stage block counts: the explicit override when present, otherwise
    /// the depth-derived `(depth - 2) / 6` split.
    pub fn blocks_per_stage(&self) -> Result<[usize; 3], ModelError> {
        if let Some(blocks) = self.n_blocks_per_stage {
            return Ok(blocks);
        }
        if self.depth < 2 || (self.depth - 2) % 6 != 0 {
            return Err(ModelError::DepthMismatch { depth: self.depth });
        }
        let per_stage = (self.depth - 2) / 6;
        Ok([per_stage; 3])
    }

    /// Stage schedule by 1-based stage id.
    pub fn stage(&self, stage_id: usize) -> &StageConfig {
        match stage_id {
            1 => &self.stage1,
            2 => &self.stage2,
            _ => &self.stage3,
        }
    }

    /// Per-stage channel widths before zero-block passthrough correction.
    pub fn channels(&self) -> [usize; 3] {
        let mut channels = self.n_channels.unwrap_or([
            self.base_channels,
            self.base_channels * 2,
            self.base_channels * 4,
        ]);
        if self.grow_a_lot {
            channels[2] = self.base_channels * 8;
        }
        channels
    }

    /// Deep-merges a JSON mapping of overrides into this configuration:
    /// nested maps merge key by key, everything else replaces.
    pub fn merge_overrides(&self, overrides: &serde_json::Value) -> Result<Self, ModelError> {
        fn merge(base: &mut serde_json::Value, overlay: &serde_json::Value) {
            match (base, overlay) {
                (serde_json::Value::Object(base), serde_json::Value::Object(overlay)) => {
                    for (key, value) in overlay {
                        match base.get_mut(key) {
                            Some(slot) => merge(slot, value),
                            None => {
                                base.insert(key.clone(), value.clone());
                            }
                        }
                    }
                }
                (base, overlay) => *base = overlay.clone(),
            }
        }
        let mut tree =
            serde_json::to_value(self).map_err(|err| ModelError::Merge(err.to_string()))?;
        merge(&mut tree, overrides);
        serde_json::from_value(tree).map_err(|err| ModelError::Merge(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn depth_must_decompose_into_stages() {
        let mut config = ModelConfig::default();
        config.depth = 25;
        assert!(matches!(
            config.blocks_per_stage(),
            Err(ModelError::DepthMismatch { depth: 25 })
        ));
        config.depth = 26;
        assert_eq!(config.blocks_per_stage().unwrap(), [4, 4, 4]);
    }

    #[test]
    fn explicit_block_counts_bypass_depth() {
        let mut config = ModelConfig::default();
        config.depth = 25;
        config.n_blocks_per_stage = Some([2, 0, 1]);
        assert_eq!(config.blocks_per_stage().unwrap(), [2, 0, 1]);
    }

    #[test]
    fn bottleneck_fails_fast() {
        let mut config = ModelConfig::default();
        config.block_type = BlockType::Bottleneck;
        assert!(matches!(
            config.validate(),
            Err(ModelError::UnsupportedBlockType(BlockType::Bottleneck))
        ));
    }

    #[test]
    fn channel_ramp_and_grow_a_lot() {
        let mut config = ModelConfig::default();
        config.base_channels = 32;
        assert_eq!(config.channels(), [32, 64, 128]);
        config.grow_a_lot = true;
        assert_eq!(config.channels(), [32, 64, 256]);
        config.n_channels = Some([8, 8, 8]);
        assert_eq!(config.channels(), [8, 8, 256]);
    }

    #[test]
    fn partial_mapping_parses_with_defaults() {
        let config: ModelConfig = serde_json::from_value(json!({
            "n_classes": 4,
            "block_type": "basic",
            "weight_init": "fixup",
            "stage1": { "maxpool": [1], "k1s": [[3, 3]], "k2s": [[1, 1]] }
        }))
        .unwrap();
        assert_eq!(config.n_classes, 4);
        assert_eq!(config.weight_init, WeightInit::DepthScaled);
        assert_eq!(config.stage1.k1s, vec![(3, 3)]);
        assert_eq!(config.depth, 26);
    }

    #[test]
    fn merge_overrides_merges_nested_maps() {
        let base = ModelConfig::default();
        let merged = base
            .merge_overrides(&json!({
                "n_classes": 2,
                "stage1": { "maxpool": [0, 1] }
            }))
            .unwrap();
        assert_eq!(merged.n_classes, 2);
        assert_eq!(merged.stage1.maxpool, vec![0, 1]);
        assert_eq!(merged.base_channels, base.base_channels);
    }
}
