// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of Spiralgram — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Receptive-field scheduler.
//!
//! Given a target receptive field per spectrogram axis, the scheduler derives
//! the per-layer kernel-size and downsampling schedule for the three backbone
//! stages. The rule is a fixed threshold table indexed by layer position and
//! the per-axis `excess = rho - 7` (7 is the receptive field the stem plus
//! the opening layer already contribute): stage-1 layers start at size 3 and
//! shrink to 1 once their position's threshold exceeds the remaining budget,
//! stage-2/3 layers start at size 1 and grow to 3 while budget remains. The
//! thresholds are an empirically tuned table, not a derived formula, and are
//! kept exactly as documented for the depth-26 configuration.

use crate::config::{BlockType, ModelConfig, StageConfig, WeightInit};
use crate::error::ModelError;
use crate::models::Network;
use std::cell::RefCell;
use std::collections::HashMap;

/// Inputs of the convenience entry point: receptive-field targets, channel
/// budget and a compact block-count string such as `"444"`.
#[derive(Clone, Debug)]
pub struct RhoSpec {
    pub rho_time: usize,
    pub rho_freq: usize,
    pub base_channels: usize,
    pub blocks: String,
    pub n_classes: usize,
    pub arch: String,
    pub input_shape: [i64; 4],
}

impl Default for RhoSpec {
    fn default() -> Self {
        Self {
            rho_time: 12,
            rho_freq: 12,
            base_channels: 128,
            blocks: "444".to_string(),
            n_classes: 10,
            arch: "cp_speech_resnet".to_string(),
            input_shape: [10, 1, -1, -1],
        }
    }
}

fn parse_blocks(blocks: &str) -> Result<[usize; 3], ModelError> {
    let digits: Vec<usize> = blocks
        .chars()
        .map(|c| c.to_digit(10).map(|d| d as usize))
        .collect::<Option<_>>()
        .ok_or_else(|| ModelError::Config(format!("block string {blocks:?} is not numeric")))?;
    if digits.len() != 3 {
        return Err(ModelError::Config(format!(
            "block string {blocks:?} must name exactly three stages"
        )));
    }
    Ok([digits[0], digits[1], digits[2]])
}

/// Kernel size 3 shrinking to 1 once the negated budget clears the threshold.
fn shrink(excess: i64, threshold: i64) -> usize {
    if -excess > threshold {
        1
    } else {
        3
    }
}

/// Kernel size 1 growing to 3 once the budget clears the threshold.
fn grow(excess: i64, threshold: i64) -> usize {
    if excess > threshold {
        3
    } else {
        1
    }
}

fn stage1_schedule(blocks: usize, ef: i64, et: i64) -> StageConfig {
    let mut k1s = Vec::with_capacity(blocks);
    let mut k2s = Vec::with_capacity(blocks);
    for index in 0..blocks {
        if index == 0 {
            k1s.push((3, 3));
            k2s.push((1, 1));
            continue;
        }
        // conv1 of block `index` sits at local layer 2*index + 1, conv2 one
        // deeper; thresholds count down from the end of the stage.
        let t1 = (2 * blocks) as i64 - 2 * index as i64;
        let t2 = t1 - 1;
        k1s.push((shrink(ef, t1), shrink(et, t1)));
        k2s.push((shrink(ef, t2), shrink(et, t2)));
    }
    StageConfig {
        maxpool: vec![1],
        k1s,
        k2s,
    }
}

fn stage2_schedule(blocks: usize, ef: i64, et: i64) -> StageConfig {
    let mut k1s = Vec::with_capacity(blocks);
    let mut k2s = Vec::with_capacity(blocks);
    for index in 0..blocks {
        if index == 0 {
            // The stage opener still follows the shrinking rule at budget 0.
            k1s.push((shrink(ef, 0), shrink(et, 0)));
            k2s.push((grow(ef, 0), grow(et, 0)));
            continue;
        }
        let t1 = 2 * index as i64 - 1;
        let t2 = t1 + 1;
        k1s.push((grow(ef, t1), grow(et, t1)));
        k2s.push((grow(ef, t2), grow(et, t2)));
    }
    StageConfig {
        maxpool: Vec::new(),
        k1s,
        k2s,
    }
}

fn stage3_schedule(blocks: usize, prev_blocks: usize, ef: i64, et: i64) -> StageConfig {
    let mut k1s = Vec::with_capacity(blocks);
    let mut k2s = Vec::with_capacity(blocks);
    for index in 0..blocks {
        // Thresholds continue where stage 2 left off.
        let t1 = 2 * index as i64 + 2 * prev_blocks as i64 - 1;
        let t2 = t1 + 1;
        k1s.push((grow(ef, t1), grow(et, t1)));
        k2s.push((grow(ef, t2), grow(et, t2)));
    }
    StageConfig {
        maxpool: Vec::new(),
        k1s,
        k2s,
    }
}

/// Derives the full configuration mapping for the given targets.
pub fn schedule_for(spec: &RhoSpec) -> Result<ModelConfig, ModelError> {
    let blocks = parse_blocks(&spec.blocks)?;
    let ef = spec.rho_freq as i64 - 7;
    let et = spec.rho_time as i64 - 7;
    Ok(ModelConfig {
        arch: spec.arch.clone(),
        input_shape: spec.input_shape,
        n_classes: spec.n_classes,
        base_channels: spec.base_channels,
        block_type: BlockType::Basic,
        depth: 2 + 2 * (blocks[0] + blocks[1] + blocks[2]),
        n_blocks_per_stage: Some(blocks),
        stage1: stage1_schedule(blocks[0], ef, et),
        stage2: stage2_schedule(blocks[1], ef, et),
        stage3: stage3_schedule(blocks[2], blocks[1], ef, et),
        weight_init: WeightInit::Standard,
        ..ModelConfig::default()
    })
}

/// Derives the configuration and assembles the network in one call.
pub fn network_for_rho(spec: &RhoSpec) -> Result<Network, ModelError> {
    Network::from_config(&schedule_for(spec)?)
}

/// One scheduled convolution of the backbone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayerSpec {
    /// 0-based, globally increasing across the whole backbone.
    pub layer_index: usize,
    /// `(frequency, time)` kernel extents; always odd.
    pub kernel: (usize, usize),
    /// `(frequency, time)` stride.
    pub stride: (usize, usize),
    /// 1-based stage id.
    pub stage_id: usize,
    /// 0-based block position within the stage.
    pub block_index: usize,
}

/// Flattens a configuration into one [`LayerSpec`] per backbone convolution.
pub fn layer_specs(config: &ModelConfig) -> Result<Vec<LayerSpec>, ModelError> {
    let blocks = config.blocks_per_stage()?;
    let mut specs = Vec::new();
    for (stage_idx, &stage_blocks) in blocks.iter().enumerate() {
        let stage_id = stage_idx + 1;
        let stage = config.stage(stage_id);
        if stage.k1s.len() < stage_blocks || stage.k2s.len() < stage_blocks {
            return Err(ModelError::Config(format!(
                "stage{stage_id} schedules {} blocks but tables hold {}/{} entries",
                stage_blocks,
                stage.k1s.len(),
                stage.k2s.len()
            )));
        }
        for block_index in 0..stage_blocks {
            for kernel in [stage.k1s[block_index], stage.k2s[block_index]] {
                specs.push(LayerSpec {
                    layer_index: specs.len(),
                    kernel,
                    stride: (1, 1),
                    stage_id,
                    block_index,
                });
            }
        }
    }
    Ok(specs)
}

/// Cumulative receptive-field state after some prefix of the backbone:
/// the downsampling factor so far and the receptive extent per axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RfState {
    pub scale: u64,
    pub freq: u64,
    pub time: u64,
}

/// Receptive-field verification chain over a fixed configuration.
///
/// The chain walks the backbone's global 1-based layer index: the kernel
/// comes from the stage tables (layer parity selects the block's first or
/// second convolution) and the 2x pool inserted after block `p` is folded
/// into that block's second convolution, exactly as scheduled. States are
/// memoized because the recursion is queried at arbitrary repeated indices.
pub struct RfProbe<'a> {
    config: &'a ModelConfig,
    blocks: [usize; 3],
    memo: RefCell<HashMap<usize, RfState>>,
}

/// Receptive field contributed by the fixed stem: stride 2, extent 5.
const STEM_STATE: RfState = RfState {
    scale: 2,
    freq: 5,
    time: 5,
};

impl<'a> RfProbe<'a> {
    pub fn new(config: &'a ModelConfig) -> Result<Self, ModelError> {
        let blocks = config.blocks_per_stage()?;
        Ok(Self {
            config,
            blocks,
            memo: RefCell::new(HashMap::new()),
        })
    }

    /// Number of scheduled backbone convolutions.
    pub fn total_layers(&self) -> usize {
        2 * self.blocks.iter().sum::<usize>()
    }

    /// Stage id, local 1-based layer position and block index for a global
    /// 1-based layer index.
    fn locate(&self, layer: usize) -> Result<(usize, usize, usize), ModelError> {
        let mut remaining = layer;
        for (stage_idx, &stage_blocks) in self.blocks.iter().enumerate() {
            let stage_layers = 2 * stage_blocks;
            if remaining <= stage_layers {
                return Ok((stage_idx + 1, remaining, (remaining - 1) / 2));
            }
            remaining -= stage_layers;
        }
        Err(ModelError::Config(format!(
            "layer index {layer} exceeds the scheduled backbone depth"
        )))
    }

    /// `(frequency, time)` kernel of the given global layer.
    pub fn kernel_at(&self, layer: usize) -> Result<(usize, usize), ModelError> {
        let (stage_id, local, block_index) = self.locate(layer)?;
        let stage = self.config.stage(stage_id);
        let table = if local % 2 == 1 { &stage.k1s } else { &stage.k2s };
        table.get(block_index).copied().ok_or_else(|| {
            ModelError::Config(format!(
                "stage{stage_id} kernel table is missing block {block_index}"
            ))
        })
    }

    /// Downsampling factor folded into the given global layer.
    pub fn stride_at(&self, layer: usize) -> Result<u64, ModelError> {
        let (stage_id, local, block_index) = self.locate(layer)?;
        if local % 2 == 1 {
            return Ok(1);
        }
        let stage = self.config.stage(stage_id);
        if stage.maxpool.contains(&(block_index + 1)) {
            Ok(2)
        } else {
            Ok(1)
        }
    }

    /// Cumulative state after `layer` backbone convolutions (0 = stem only).
    pub fn state_at(&self, layer: usize) -> Result<RfState, ModelError> {
        if layer == 0 {
            return Ok(STEM_STATE);
        }
        if let Some(state) = self.memo.borrow().get(&layer) {
            return Ok(*state);
        }
        let previous = self.state_at(layer - 1)?;
        let (kf, kt) = self.kernel_at(layer)?;
        let stride = self.stride_at(layer)?;
        let state = RfState {
            scale: previous.scale * stride,
            freq: previous.freq + (kf as u64 - 1) * previous.scale,
            time: previous.time + (kt as u64 - 1) * previous.scale,
        };
        self.memo.borrow_mut().insert(layer, state);
        Ok(state)
    }

    /// Realized receptive field of the whole backbone.
    pub fn realized(&self) -> Result<RfState, ModelError> {
        self.state_at(self.total_layers())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(rho_time: usize, rho_freq: usize, blocks: &str) -> RhoSpec {
        RhoSpec {
            rho_time,
            rho_freq,
            blocks: blocks.to_string(),
            ..RhoSpec::default()
        }
    }

    #[test]
    fn documented_scenario_reproduces_the_threshold_table() {
        let config = schedule_for(&spec(12, 12, "444")).unwrap();
        assert_eq!(config.depth, 26);
        assert_eq!(config.blocks_per_stage().unwrap(), [4, 4, 4]);
        assert_eq!(config.stage1.maxpool, vec![1]);
        // excess = 5 on both axes.
        assert_eq!(config.stage1.k1s, vec![(3, 3), (3, 3), (3, 3), (3, 3)]);
        assert_eq!(config.stage1.k2s, vec![(1, 1), (3, 3), (3, 3), (3, 3)]);
        assert_eq!(config.stage2.k1s, vec![(3, 3), (3, 3), (3, 3), (1, 1)]);
        assert_eq!(config.stage2.k2s, vec![(3, 3), (3, 3), (3, 3), (1, 1)]);
        assert_eq!(config.stage3.k1s, vec![(1, 1); 4]);
        assert_eq!(config.stage3.k2s, vec![(1, 1); 4]);
    }

    #[test]
    fn first_layer_is_always_three_by_three() {
        for rho in [5usize, 9, 16, 29] {
            let config = schedule_for(&spec(rho, rho, "444")).unwrap();
            let probe = RfProbe::new(&config).unwrap();
            assert_eq!(probe.kernel_at(1).unwrap(), (3, 3));
        }
    }

    #[test]
    fn axes_are_scheduled_independently() {
        let config = schedule_for(&spec(5, 12, "444")).unwrap();
        // time excess = -2: the stage-2 opener shrinks on the time axis only.
        assert_eq!(config.stage2.k1s[0], (3, 1));
        // stage-1 deepest second conv crosses its threshold on time only.
        assert_eq!(config.stage1.k2s[3], (3, 1));
        // frequency side keeps the rho=12 schedule.
        assert_eq!(config.stage2.k2s[2], (3, 1));
    }

    #[test]
    fn scheduler_emits_two_convs_per_block() {
        for blocks in ["444", "231", "111"] {
            let config = schedule_for(&spec(12, 12, blocks)).unwrap();
            let per_stage = config.blocks_per_stage().unwrap();
            let specs = layer_specs(&config).unwrap();
            assert_eq!(specs.len(), 2 * per_stage.iter().sum::<usize>());
            for (idx, layer) in specs.iter().enumerate() {
                assert_eq!(layer.layer_index, idx);
                assert!(matches!(layer.kernel.0, 1 | 3));
                assert!(matches!(layer.kernel.1, 1 | 3));
            }
        }
    }

    #[test]
    fn realized_receptive_field_is_monotone_in_rho() {
        let mut last_freq = 0;
        for rho_freq in 5..=30 {
            let config = schedule_for(&spec(12, rho_freq, "444")).unwrap();
            let probe = RfProbe::new(&config).unwrap();
            let realized = probe.realized().unwrap();
            assert!(realized.freq >= last_freq);
            last_freq = realized.freq;
        }
        let mut last_time = 0;
        for rho_time in 5..=30 {
            let config = schedule_for(&spec(rho_time, 12, "444")).unwrap();
            let probe = RfProbe::new(&config).unwrap();
            let realized = probe.realized().unwrap();
            assert!(realized.time >= last_time);
            last_time = realized.time;
        }
    }

    #[test]
    fn rf_chain_matches_a_hand_computed_schedule() {
        let config = schedule_for(&spec(12, 12, "111")).unwrap();
        let probe = RfProbe::new(&config).unwrap();
        assert_eq!(probe.total_layers(), 6);
        // Stage 1: (3,3) then (1,1) with the pool folded into layer 2.
        assert_eq!(probe.stride_at(2).unwrap(), 2);
        let after_stage1 = probe.state_at(2).unwrap();
        assert_eq!(
            after_stage1,
            RfState {
                scale: 4,
                freq: 9,
                time: 9
            }
        );
        let realized = probe.realized().unwrap();
        assert_eq!(realized.scale, 4);
        assert_eq!(realized.freq, 41);
        assert_eq!(realized.time, 41);
        // Memoized states answer repeated queries consistently.
        assert_eq!(probe.state_at(2).unwrap(), after_stage1);
    }

    #[test]
    fn bad_block_strings_are_rejected() {
        assert!(schedule_for(&spec(12, 12, "44")).is_err());
        assert!(schedule_for(&spec(12, 12, "4x4")).is_err());
    }
}
