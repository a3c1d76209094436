// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of Spiralgram — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Frequency-damped residual network for spectrogram classification.

use crate::config::{AttentionMode, ModelConfig, StageConfig, WeightInit};
use crate::error::ModelError;
use crate::frontend::MelFrontend;
use crate::models::attention::AttentionAvg;
use crate::schedule::LayerSpec;
use sg_nn::init::{InitContext, InitPolicy};
use sg_nn::module::{Module, Parameter};
use sg_nn::{AvgPool2d, BatchNorm2d, DampedConv2d, DampingCache, MaxPool2d, Relu, Sequential};
use sg_tensor::{PureResult, Tensor, TensorError};
use std::sync::Arc;
use tracing::{debug, warn};

const BN_MOMENTUM: f32 = 0.1;
const BN_EPSILON: f32 = 1.0e-5;

/// Spatial extent substituted for unspecified (-1) input axes.
const DEFAULT_SPATIAL_EXTENT: usize = 256;

/// Padding rule used throughout this backbone: `kernel / 3` per axis.
/// Intentionally narrower than the conventional `kernel / 2` "same" rule.
pub(crate) fn calc_padding(kernel: (usize, usize)) -> (usize, usize) {
    (kernel.0 / 3, kernel.1 / 3)
}

/// Construction-time state threaded through the stage builders: the shared
/// damping-mask cache, the block index counter consumed by the depth-scaled
/// initialisation policy, and the record of scheduled backbone convolutions.
pub struct BuildContext {
    damping: Arc<DampingCache>,
    next_block_index: usize,
    specs: Vec<LayerSpec>,
}

impl BuildContext {
    pub fn new(damping: Arc<DampingCache>) -> Self {
        Self {
            damping,
            next_block_index: 0,
            specs: Vec::new(),
        }
    }

    fn allocate_block_index(&mut self) -> usize {
        let index = self.next_block_index;
        self.next_block_index += 1;
        index
    }

    fn record(
        &mut self,
        kernel: (usize, usize),
        stride: (usize, usize),
        stage_id: usize,
        block_index: usize,
    ) {
        self.specs.push(LayerSpec {
            layer_index: self.specs.len(),
            kernel,
            stride,
            stage_id,
            block_index,
        });
    }
}

/// Basic residual unit: conv-norm-relu-conv-norm with a projection shortcut
/// when the channel count or stride changes.
#[derive(Debug)]
pub struct BasicBlock {
    layer_index: usize,
    conv1: DampedConv2d,
    bn1: BatchNorm2d,
    conv2: DampedConv2d,
    bn2: BatchNorm2d,
    shortcut: Option<(DampedConv2d, BatchNorm2d)>,
    activation: Relu,
    output_hw: (usize, usize),
}

impl BasicBlock {
    #[allow(clippy::too_many_arguments)]
    fn new(
        ctx: &mut BuildContext,
        name: &str,
        in_channels: usize,
        out_channels: usize,
        stride: (usize, usize),
        k1: (usize, usize),
        k2: (usize, usize),
        input_hw: (usize, usize),
    ) -> PureResult<Self> {
        let layer_index = ctx.allocate_block_index();
        let conv1 = DampedConv2d::new(
            format!("{name}.conv1"),
            in_channels,
            out_channels,
            k1,
            stride,
            calc_padding(k1),
            input_hw,
            ctx.damping.clone(),
        )?;
        let conv1_hw = conv1.output_hw()?;
        let bn1 = BatchNorm2d::new(
            format!("{name}.bn1"),
            out_channels,
            conv1_hw,
            BN_MOMENTUM,
            BN_EPSILON,
        )?;
        let conv2 = DampedConv2d::new(
            format!("{name}.conv2"),
            out_channels,
            out_channels,
            k2,
            (1, 1),
            calc_padding(k2),
            conv1_hw,
            ctx.damping.clone(),
        )?;
        let conv2_hw = conv2.output_hw()?;
        let bn2 = BatchNorm2d::new(
            format!("{name}.bn2"),
            out_channels,
            conv2_hw,
            BN_MOMENTUM,
            BN_EPSILON,
        )?;
        let shortcut = if in_channels != out_channels || stride != (1, 1) {
            let conv = DampedConv2d::new(
                format!("{name}.shortcut"),
                in_channels,
                out_channels,
                (1, 1),
                stride,
                (0, 0),
                input_hw,
                ctx.damping.clone(),
            )?;
            let shortcut_hw = conv.output_hw()?;
            if shortcut_hw != conv2_hw {
                return Err(TensorError::ShapeMismatch {
                    left: shortcut_hw,
                    right: conv2_hw,
                });
            }
            let bn = BatchNorm2d::new(
                format!("{name}.shortcut_bn"),
                out_channels,
                shortcut_hw,
                BN_MOMENTUM,
                BN_EPSILON,
            )?;
            Some((conv, bn))
        } else {
            None
        };
        Ok(Self {
            layer_index,
            conv1,
            bn1,
            conv2,
            bn2,
            shortcut,
            activation: Relu::new(),
            output_hw: conv2_hw,
        })
    }

    /// Globally unique block position assigned at construction.
    pub fn layer_index(&self) -> usize {
        self.layer_index
    }

    fn output_hw(&self) -> (usize, usize) {
        self.output_hw
    }
}

impl Module for BasicBlock {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let residual = match &self.shortcut {
            Some((conv, bn)) => bn.forward(&conv.forward(input)?)?,
            None => input.clone(),
        };
        let y = self.activation.forward(&self.bn1.forward(&self.conv1.forward(input)?)?)?;
        let y = self.bn2.forward(&self.conv2.forward(&y)?)?;
        self.activation.forward(&y.add(&residual)?)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.conv1.visit_parameters(visitor)?;
        self.bn1.visit_parameters(visitor)?;
        self.conv2.visit_parameters(visitor)?;
        self.bn2.visit_parameters(visitor)?;
        if let Some((conv, bn)) = &self.shortcut {
            conv.visit_parameters(visitor)?;
            bn.visit_parameters(visitor)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.conv1.visit_parameters_mut(visitor)?;
        self.bn1.visit_parameters_mut(visitor)?;
        self.conv2.visit_parameters_mut(visitor)?;
        self.bn2.visit_parameters_mut(visitor)?;
        if let Some((conv, bn)) = &mut self.shortcut {
            conv.visit_parameters_mut(visitor)?;
            bn.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }

    fn set_training(&self, training: bool) {
        self.bn1.set_training(training);
        self.bn2.set_training(training);
        if let Some((_, bn)) = &self.shortcut {
            bn.set_training(training);
        }
    }

    fn init_weights(&mut self, ctx: &mut InitContext) -> PureResult<()> {
        self.conv1.init_weights(ctx)?;
        self.bn1.init_weights(ctx)?;
        self.conv2.init_weights(ctx)?;
        self.bn2.init_weights(ctx)?;
        if let Some((conv, bn)) = &mut self.shortcut {
            conv.init_weights(ctx)?;
            bn.init_weights(ctx)?;
        }
        if let InitPolicy::DepthScaled { total_blocks } = ctx.policy() {
            let (kh, kw) = self.conv1.kernel();
            let n = kh * kw * self.conv1.out_channels();
            let std = (total_blocks as f32).powf(-0.5) * (2.0 / n as f32).sqrt();
            ctx.normal(self.conv1.weight_mut().value_mut(), 0.0, std)?;
            InitContext::zero(self.conv2.weight_mut().value_mut());
            if let Some((conv, _)) = &mut self.shortcut {
                let (kh, kw) = conv.kernel();
                let n = kh * kw * conv.out_channels();
                ctx.normal(conv.weight_mut().value_mut(), 0.0, (2.0 / n as f32).sqrt())?;
            }
        }
        Ok(())
    }
}

/// Classification head: 1x1 projection with optional global pooling, or the
/// attention-weighted pooling alternative.
#[derive(Debug)]
enum Head {
    Projection {
        conv: DampedConv2d,
        bn: BatchNorm2d,
        pool: Option<AvgPool2d>,
    },
    Attention(AttentionAvg),
}

/// Typed forward-pass result; the variants are mutually exclusive and chosen
/// by configuration flags.
#[derive(Clone, Debug)]
pub enum NetworkOutput {
    /// Raw per-class logits.
    Logits(Tensor),
    /// Softmax-normalised class probabilities.
    Probabilities(Tensor),
    /// Logits (softmaxed when configured) plus the pre-head feature map.
    WithEmbedding { logits: Tensor, embedding: Tensor },
    /// Pre-pooling head output for multi-scale consumers.
    FeatureMap(Tensor),
}

impl NetworkOutput {
    /// The primary tensor of the variant.
    pub fn primary(&self) -> &Tensor {
        match self {
            NetworkOutput::Logits(tensor)
            | NetworkOutput::Probabilities(tensor)
            | NetworkOutput::FeatureMap(tensor) => tensor,
            NetworkOutput::WithEmbedding { logits, .. } => logits,
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn make_stage(
    ctx: &mut BuildContext,
    name: &str,
    stage_id: usize,
    in_channels: usize,
    out_channels: usize,
    n_blocks: usize,
    stride: (usize, usize),
    stage_cfg: &StageConfig,
    pooling_padding: usize,
    input_hw: (usize, usize),
) -> Result<(Sequential, usize, (usize, usize)), ModelError> {
    let mut stage = Sequential::new();
    if n_blocks == 0 {
        warn!(stage = stage_id, "stage has no blocks, passing features through unchanged");
        return Ok((stage, in_channels, input_hw));
    }
    if stage_cfg.k1s.len() < n_blocks || stage_cfg.k2s.len() < n_blocks {
        return Err(ModelError::Config(format!(
            "stage{stage_id} schedules {n_blocks} blocks but tables hold {}/{} entries",
            stage_cfg.k1s.len(),
            stage_cfg.k2s.len()
        )));
    }
    if let Some(position) = stage_cfg.maxpool.iter().find(|&&position| position > n_blocks) {
        return Err(ModelError::Config(format!(
            "stage{stage_id} downsampling position {position} exceeds its {n_blocks} blocks"
        )));
    }
    let mut hw = input_hw;
    let mut in_channels = in_channels;
    let mut stride = stride;
    if stage_cfg.maxpool.contains(&0) {
        let pool = MaxPool2d::new(
            in_channels,
            (2, 2),
            (2, 2),
            (pooling_padding, pooling_padding),
            hw,
        )?;
        hw = pool.output_hw()?;
        stage.push(pool);
    }
    for index in 0..n_blocks {
        let k1 = stage_cfg.k1s[index];
        let k2 = stage_cfg.k2s[index];
        let block = BasicBlock::new(
            ctx,
            &format!("{name}.block{}", index + 1),
            in_channels,
            out_channels,
            stride,
            k1,
            k2,
            hw,
        )?;
        ctx.record(k1, stride, stage_id, index);
        ctx.record(k2, (1, 1), stage_id, index);
        hw = block.output_hw();
        stage.push(block);
        in_channels = out_channels;
        stride = (1, 1);
        for &position in &stage_cfg.maxpool {
            if index + 1 == position {
                let pool = MaxPool2d::new(
                    out_channels,
                    (2, 2),
                    (2, 2),
                    (pooling_padding, pooling_padding),
                    hw,
                )?;
                hw = pool.output_hw()?;
                stage.push(pool);
            }
        }
    }
    Ok((stage, out_channels, hw))
}

/// Frequency-damped residual network assembled from a [`ModelConfig`].
pub struct Network {
    damping: Arc<DampingCache>,
    frontend: Option<MelFrontend>,
    frames: usize,
    stem_conv: DampedConv2d,
    stem_bn: BatchNorm2d,
    activation: Relu,
    stage1: Sequential,
    stage2: Sequential,
    stage3: Sequential,
    head: Head,
    layer_specs: Vec<LayerSpec>,
    total_blocks: usize,
    weight_init: WeightInit,
    apply_softmax: bool,
    return_embed: bool,
    stop_before_global_avg_pooling: bool,
    use_check_point: bool,
    trace_shapes: bool,
}

impl core::fmt::Debug for Network {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Network(blocks={},layers={})",
            self.total_blocks,
            self.layer_specs.len()
        )
    }
}

fn resolve_axis(value: i64, label: &str) -> usize {
    if value > 0 {
        value as usize
    } else {
        warn!(
            axis = label,
            substituted = DEFAULT_SPATIAL_EXTENT,
            "input axis unspecified, substituting default extent"
        );
        DEFAULT_SPATIAL_EXTENT
    }
}

impl Network {
    /// Assembles the network described by the configuration.
    pub fn from_config(config: &ModelConfig) -> Result<Self, ModelError> {
        Self::build(config, None, None)
    }

    /// Assembles with a deterministic weight-initialisation seed.
    pub fn from_config_seeded(config: &ModelConfig, seed: u64) -> Result<Self, ModelError> {
        Self::build(config, None, Some(seed))
    }

    /// Assembles a raw-spectrogram network around the supplied mel front-end.
    pub fn from_config_with_frontend(
        config: &ModelConfig,
        frontend: MelFrontend,
    ) -> Result<Self, ModelError> {
        Self::build(config, Some(frontend), None)
    }

    fn build(
        config: &ModelConfig,
        frontend: Option<MelFrontend>,
        seed: Option<u64>,
    ) -> Result<Self, ModelError> {
        config.validate()?;
        let blocks = config.blocks_per_stage()?;
        let channels = config.channels();
        if config.input_shape[1] <= 0 {
            return Err(ModelError::Config(
                "input channel count must be positive".to_string(),
            ));
        }
        let input_channels = config.input_shape[1] as usize;
        if config.use_raw_spectograms && frontend.is_none() {
            return Err(ModelError::Config(
                "use_raw_spectograms requires a mel front-end; \
                 call Network::from_config_with_frontend"
                    .to_string(),
            ));
        }
        let frames = resolve_axis(config.input_shape[3], "time");
        let freq = match (&frontend, config.use_raw_spectograms) {
            (Some(frontend), true) => frontend.n_mels(),
            _ => resolve_axis(config.input_shape[2], "frequency"),
        };
        let input_hw = (freq, frames);

        let damping = Arc::new(DampingCache::new());
        let mut ctx = BuildContext::new(damping.clone());
        let stem_conv = DampedConv2d::new(
            "in_c.conv",
            input_channels,
            channels[0],
            (5, 5),
            (2, 2),
            (1, 1),
            input_hw,
            damping.clone(),
        )?;
        let hw = stem_conv.output_hw()?;
        let stem_bn = BatchNorm2d::new("in_c.bn", channels[0], hw, BN_MOMENTUM, BN_EPSILON)?;

        let (stage1, c1, hw) = make_stage(
            &mut ctx,
            "stage1",
            1,
            channels[0],
            channels[0],
            blocks[0],
            (1, 1),
            &config.stage1,
            config.pooling_padding,
            hw,
        )?;
        let (stage2, c2, hw) = make_stage(
            &mut ctx,
            "stage2",
            2,
            c1,
            channels[1],
            blocks[1],
            (1, 1),
            &config.stage2,
            config.pooling_padding,
            hw,
        )?;
        let (stage3, c3, hw) = make_stage(
            &mut ctx,
            "stage3",
            3,
            c2,
            channels[2],
            blocks[2],
            (1, 1),
            &config.stage3,
            config.pooling_padding,
            hw,
        )?;

        let head = match config.attention_avg {
            Some(mode) => Head::Attention(AttentionAvg::new(
                "head.attention",
                c3,
                config.n_classes,
                hw,
                mode == AttentionMode::SumAll,
                damping.clone(),
            )?),
            None => {
                let conv = DampedConv2d::new(
                    "head.proj",
                    c3,
                    config.n_classes,
                    (1, 1),
                    (1, 1),
                    (0, 0),
                    hw,
                    damping.clone(),
                )?;
                let bn =
                    BatchNorm2d::new("head.bn", config.n_classes, hw, BN_MOMENTUM, BN_EPSILON)?;
                let pool = if config.stop_before_global_avg_pooling {
                    None
                } else {
                    Some(AvgPool2d::new(config.n_classes, hw, (1, 1), hw)?)
                };
                Head::Projection { conv, bn, pool }
            }
        };

        let mut network = Self {
            damping,
            frontend: if config.use_raw_spectograms {
                frontend
            } else {
                None
            },
            frames,
            stem_conv,
            stem_bn,
            activation: Relu::new(),
            stage1,
            stage2,
            stage3,
            head,
            layer_specs: ctx.specs,
            total_blocks: ctx.next_block_index,
            weight_init: config.weight_init,
            apply_softmax: config.apply_softmax,
            return_embed: config.return_embed,
            stop_before_global_avg_pooling: config.stop_before_global_avg_pooling,
            use_check_point: config.use_check_point,
            trace_shapes: config.trace_shapes,
        };
        network.initialise(seed)?;
        Ok(network)
    }

    /// Applies the configured initialisation policy in one traversal.
    pub fn initialise(&mut self, seed: Option<u64>) -> PureResult<()> {
        let policy = match self.weight_init {
            WeightInit::Standard => InitPolicy::Standard,
            WeightInit::DepthScaled => InitPolicy::DepthScaled {
                total_blocks: self.total_blocks.max(1),
            },
        };
        let mut ctx = InitContext::new(policy, seed);
        self.init_weights(&mut ctx)
    }

    /// One entry per scheduled backbone convolution, in construction order.
    pub fn layer_specs(&self) -> &[LayerSpec] {
        &self.layer_specs
    }

    /// Number of residual blocks across all stages.
    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    /// The damping-mask cache shared by every convolution of this network.
    pub fn damping(&self) -> &Arc<DampingCache> {
        &self.damping
    }

    /// Converts every cached damping mask to half precision for inference.
    pub fn downcast_damping(&self) {
        self.damping.downcast();
    }

    fn trace(&self, point: &str, tensor: &Tensor) {
        if self.trace_shapes {
            let (rows, cols) = tensor.shape();
            debug!(target: "sg_audio::shapes", point, rows, cols, "shape transition");
        }
    }

    fn forward_conv(&self, input: &Tensor) -> PureResult<Tensor> {
        let stem = self
            .activation
            .forward(&self.stem_bn.forward(&self.stem_conv.forward(input)?)?)?;
        self.trace("in_c", &stem);
        if self.use_check_point {
            // The three stages run as one fused unit; output is unchanged.
            let mut activ = stem;
            for stage in [&self.stage1, &self.stage2, &self.stage3] {
                activ = stage.forward(&activ)?;
            }
            self.trace("stages", &activ);
            return Ok(activ);
        }
        let x = self.stage1.forward(&stem)?;
        self.trace("stage1", &x);
        let x = self.stage2.forward(&x)?;
        self.trace("stage2", &x);
        let x = self.stage3.forward(&x)?;
        self.trace("stage3", &x);
        Ok(x)
    }

    /// Full forward pass returning the configured output variant.
    pub fn run(&self, input: &Tensor) -> PureResult<NetworkOutput> {
        self.trace("input", input);
        let features = match &self.frontend {
            Some(frontend) => {
                let mel = frontend.forward(input, self.frames)?;
                self.trace("mel", &mel);
                mel
            }
            None => input.clone(),
        };
        let embedding = self.forward_conv(&features)?;
        let pooled = match &self.head {
            Head::Projection { conv, bn, pool } => {
                let x = bn.forward(&conv.forward(&embedding)?)?;
                self.trace("head", &x);
                if self.stop_before_global_avg_pooling {
                    return Ok(NetworkOutput::FeatureMap(x));
                }
                match pool {
                    Some(pool) => pool.forward(&x)?,
                    None => x,
                }
            }
            Head::Attention(attention) => {
                let x = attention.forward(&embedding)?;
                self.trace("head", &x);
                if self.stop_before_global_avg_pooling {
                    return Ok(NetworkOutput::FeatureMap(x));
                }
                x
            }
        };
        self.trace("logits", &pooled);
        let logits = if self.apply_softmax {
            pooled.row_softmax()?
        } else {
            pooled
        };
        if self.return_embed {
            return Ok(NetworkOutput::WithEmbedding { logits, embedding });
        }
        if self.apply_softmax {
            return Ok(NetworkOutput::Probabilities(logits));
        }
        Ok(NetworkOutput::Logits(logits))
    }
}

impl Module for Network {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        match self.run(input)? {
            NetworkOutput::Logits(tensor)
            | NetworkOutput::Probabilities(tensor)
            | NetworkOutput::FeatureMap(tensor) => Ok(tensor),
            NetworkOutput::WithEmbedding { logits, .. } => Ok(logits),
        }
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.stem_conv.visit_parameters(visitor)?;
        self.stem_bn.visit_parameters(visitor)?;
        self.stage1.visit_parameters(visitor)?;
        self.stage2.visit_parameters(visitor)?;
        self.stage3.visit_parameters(visitor)?;
        match &self.head {
            Head::Projection { conv, bn, .. } => {
                conv.visit_parameters(visitor)?;
                bn.visit_parameters(visitor)?;
            }
            Head::Attention(attention) => attention.visit_parameters(visitor)?,
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.stem_conv.visit_parameters_mut(visitor)?;
        self.stem_bn.visit_parameters_mut(visitor)?;
        self.stage1.visit_parameters_mut(visitor)?;
        self.stage2.visit_parameters_mut(visitor)?;
        self.stage3.visit_parameters_mut(visitor)?;
        match &mut self.head {
            Head::Projection { conv, bn, .. } => {
                conv.visit_parameters_mut(visitor)?;
                bn.visit_parameters_mut(visitor)?;
            }
            Head::Attention(attention) => attention.visit_parameters_mut(visitor)?,
        }
        Ok(())
    }

    fn set_training(&self, training: bool) {
        self.stem_bn.set_training(training);
        self.stage1.set_training(training);
        self.stage2.set_training(training);
        self.stage3.set_training(training);
        match &self.head {
            Head::Projection { bn, .. } => bn.set_training(training),
            Head::Attention(_) => {}
        }
    }

    fn init_weights(&mut self, ctx: &mut InitContext) -> PureResult<()> {
        self.stem_conv.init_weights(ctx)?;
        self.stem_bn.init_weights(ctx)?;
        self.stage1.init_weights(ctx)?;
        self.stage2.init_weights(ctx)?;
        self.stage3.init_weights(ctx)?;
        match &mut self.head {
            Head::Projection { conv, bn, .. } => {
                conv.init_weights(ctx)?;
                bn.init_weights(ctx)?;
                if matches!(ctx.policy(), InitPolicy::DepthScaled { .. }) {
                    InitContext::zero(conv.weight_mut().value_mut());
                }
            }
            Head::Attention(attention) => attention.init_weights(ctx)?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BlockType;
    use crate::schedule::{schedule_for, RhoSpec};

    fn small_config() -> ModelConfig {
        let mut config = schedule_for(&RhoSpec {
            rho_time: 12,
            rho_freq: 12,
            base_channels: 8,
            blocks: "111".to_string(),
            n_classes: 5,
            input_shape: [1, 1, 32, 32],
            ..RhoSpec::default()
        })
        .unwrap();
        config.weight_init = WeightInit::Standard;
        config
    }

    #[test]
    fn padding_rule_is_kernel_over_three() {
        assert_eq!(calc_padding((3, 3)), (1, 1));
        assert_eq!(calc_padding((1, 1)), (0, 0));
        assert_eq!(calc_padding((5, 5)), (1, 1));
        assert_eq!(calc_padding((3, 1)), (1, 0));
    }

    #[test]
    fn forward_produces_one_logit_per_class() {
        let network = Network::from_config_seeded(&small_config(), 7).unwrap();
        let input = Tensor::random_normal(2, 32 * 32, 0.0, 1.0, Some(1)).unwrap();
        let output = network.run(&input).unwrap();
        match output {
            NetworkOutput::Logits(logits) => assert_eq!(logits.shape(), (2, 5)),
            other => panic!("expected logits, got {other:?}"),
        }
    }

    #[test]
    fn block_indices_increase_monotonically_per_network() {
        let network = Network::from_config(&small_config()).unwrap();
        assert_eq!(network.total_blocks(), 3);
        // A second network starts its own counter instead of continuing a
        // process-wide one.
        let other = Network::from_config(&small_config()).unwrap();
        assert_eq!(other.total_blocks(), 3);
    }

    #[test]
    fn softmax_flag_returns_probabilities() {
        let mut config = small_config();
        config.apply_softmax = true;
        let network = Network::from_config_seeded(&config, 7).unwrap();
        let input = Tensor::random_normal(1, 32 * 32, 0.0, 1.0, Some(2)).unwrap();
        match network.run(&input).unwrap() {
            NetworkOutput::Probabilities(probs) => {
                let total: f32 = probs.data().iter().sum();
                assert!((total - 1.0).abs() < 1e-4);
            }
            other => panic!("expected probabilities, got {other:?}"),
        }
    }

    #[test]
    fn embed_flag_also_returns_the_feature_map() {
        let mut config = small_config();
        config.return_embed = true;
        let network = Network::from_config_seeded(&config, 7).unwrap();
        let input = Tensor::random_normal(1, 32 * 32, 0.0, 1.0, Some(3)).unwrap();
        match network.run(&input).unwrap() {
            NetworkOutput::WithEmbedding { logits, embedding } => {
                assert_eq!(logits.shape(), (1, 5));
                // Stage 3 runs at four times the base width (32 channels)
                // on the 7x7 grid left after the stem and stage-1 pool.
                assert_eq!(embedding.shape(), (1, 32 * 7 * 7));
            }
            other => panic!("expected embedding output, got {other:?}"),
        }
    }

    #[test]
    fn early_exit_skips_global_pooling() {
        let mut config = small_config();
        config.stop_before_global_avg_pooling = true;
        let network = Network::from_config_seeded(&config, 7).unwrap();
        let input = Tensor::random_normal(1, 32 * 32, 0.0, 1.0, Some(4)).unwrap();
        match network.run(&input).unwrap() {
            NetworkOutput::FeatureMap(map) => assert_eq!(map.shape(), (1, 5 * 7 * 7)),
            other => panic!("expected feature map, got {other:?}"),
        }
    }

    #[test]
    fn checkpointing_does_not_change_the_output() {
        let config = small_config();
        let network = Network::from_config_seeded(&config, 7).unwrap();
        let mut fused = config.clone();
        fused.use_check_point = true;
        let fused_network = Network::from_config_seeded(&fused, 7).unwrap();
        let input = Tensor::random_normal(1, 32 * 32, 0.0, 1.0, Some(5)).unwrap();
        network.set_training(false);
        fused_network.set_training(false);
        let plain = network.forward(&input).unwrap();
        let chained = fused_network.forward(&input).unwrap();
        for (a, b) in plain.data().iter().zip(chained.data().iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn zero_block_stage_propagates_channels() {
        let mut config = small_config();
        config.n_blocks_per_stage = Some([1, 0, 1]);
        let network = Network::from_config(&config).unwrap();
        assert_eq!(network.total_blocks(), 2);
        // stage3 keeps working off stage1's channel width.
        let specs = network.layer_specs();
        assert_eq!(specs.len(), 4);
        assert_eq!(specs.iter().filter(|s| s.stage_id == 2).count(), 0);
        let input = Tensor::random_normal(1, 32 * 32, 0.0, 1.0, Some(6)).unwrap();
        assert!(network.run(&input).is_ok());
    }

    #[test]
    fn out_of_range_pool_positions_are_rejected() {
        let mut config = small_config();
        config.stage1.maxpool = vec![3];
        assert!(Network::from_config(&config).is_err());
    }

    #[test]
    fn bottleneck_configuration_fails_fast() {
        let mut config = small_config();
        config.block_type = BlockType::Bottleneck;
        assert!(matches!(
            Network::from_config(&config),
            Err(ModelError::UnsupportedBlockType(BlockType::Bottleneck))
        ));
    }

    #[test]
    fn depth_scaled_policy_zeroes_second_convs_and_head() {
        let mut config = small_config();
        config.weight_init = WeightInit::DepthScaled;
        let network = Network::from_config_seeded(&config, 7).unwrap();
        let mut zeroed = Vec::new();
        network
            .visit_parameters(&mut |param| {
                if param.name().ends_with("conv2::weight")
                    || param.name() == "head.proj::weight"
                {
                    zeroed.push(param.value().squared_l2_norm());
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(zeroed.len(), 4);
        assert!(zeroed.iter().all(|norm| *norm == 0.0));
    }

    #[test]
    fn attention_head_pools_without_avg_pool() {
        let mut config = small_config();
        config.attention_avg = Some(AttentionMode::SumAll);
        let network = Network::from_config_seeded(&config, 7).unwrap();
        let input = Tensor::random_normal(1, 32 * 32, 0.0, 1.0, Some(8)).unwrap();
        match network.run(&input).unwrap() {
            NetworkOutput::Logits(logits) => assert_eq!(logits.shape(), (1, 5)),
            other => panic!("expected logits, got {other:?}"),
        }
    }
}
