// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of Spiralgram — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use sg_nn::init::InitContext;
use sg_nn::module::{Module, Parameter};
use sg_nn::{DampedConv2d, DampingCache};
use sg_tensor::{PureResult, Tensor, TensorError};
use std::sync::Arc;

/// Attention-weighted pooling head.
///
/// Two 1x1 convolutions map the final feature map to per-class projections
/// and per-class attention logits. In per-class mode the attention weights
/// are normalised over the spatial positions of each class independently; in
/// `sum_all` mode a single softmax runs jointly over every class and
/// position. Either way the output is one pooled value per class.
#[derive(Debug)]
pub struct AttentionAvg {
    projection: DampedConv2d,
    attention: DampedConv2d,
    classes: usize,
    sum_all: bool,
}

fn softmax_in_place(values: &mut [f32]) {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut total = 0.0f32;
    for value in values.iter_mut() {
        *value = (*value - max).exp();
        total += *value;
    }
    for value in values.iter_mut() {
        *value /= total;
    }
}

impl AttentionAvg {
    pub fn new(
        name: &str,
        channels: usize,
        classes: usize,
        input_hw: (usize, usize),
        sum_all: bool,
        damping: Arc<DampingCache>,
    ) -> PureResult<Self> {
        let projection = DampedConv2d::new(
            format!("{name}.proj"),
            channels,
            classes,
            (1, 1),
            (1, 1),
            (0, 0),
            input_hw,
            damping.clone(),
        )?;
        let attention = DampedConv2d::new(
            format!("{name}.att"),
            channels,
            classes,
            (1, 1),
            (1, 1),
            (0, 0),
            input_hw,
            damping,
        )?;
        Ok(Self {
            projection,
            attention,
            classes,
            sum_all,
        })
    }

    /// Number of output classes.
    pub fn classes(&self) -> usize {
        self.classes
    }
}

impl Module for AttentionAvg {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let projected = self.projection.forward(input)?;
        let mut weights = self.attention.forward(input)?;
        let (batch, cols) = projected.shape();
        if cols % self.classes != 0 {
            return Err(TensorError::ShapeMismatch {
                left: (batch, cols),
                right: (batch, self.classes),
            });
        }
        let spatial = cols / self.classes;
        {
            let weight_data = weights.data_mut();
            for b in 0..batch {
                let row = &mut weight_data[b * cols..(b + 1) * cols];
                if self.sum_all {
                    softmax_in_place(row);
                } else {
                    for class_row in row.chunks_mut(spatial) {
                        softmax_in_place(class_row);
                    }
                }
            }
        }
        let mut out = Tensor::zeros(batch, self.classes)?;
        {
            let out_data = out.data_mut();
            let projected_data = projected.data();
            let weight_data = weights.data();
            for b in 0..batch {
                for class in 0..self.classes {
                    let start = b * cols + class * spatial;
                    let pooled: f32 = projected_data[start..start + spatial]
                        .iter()
                        .zip(weight_data[start..start + spatial].iter())
                        .map(|(value, weight)| value * weight)
                        .sum();
                    out_data[b * self.classes + class] = pooled;
                }
            }
        }
        Ok(out)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.projection.visit_parameters(visitor)?;
        self.attention.visit_parameters(visitor)?;
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.projection.visit_parameters_mut(visitor)?;
        self.attention.visit_parameters_mut(visitor)?;
        Ok(())
    }

    fn init_weights(&mut self, ctx: &mut InitContext) -> PureResult<()> {
        self.projection.init_weights(ctx)?;
        self.attention.init_weights(ctx)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(sum_all: bool) -> AttentionAvg {
        AttentionAvg::new(
            "head",
            2,
            3,
            (2, 2),
            sum_all,
            Arc::new(DampingCache::new()),
        )
        .unwrap()
    }

    #[test]
    fn output_is_one_value_per_class() {
        let head = head(false);
        let input = Tensor::random_normal(2, 2 * 4, 0.0, 1.0, Some(3)).unwrap();
        let output = head.forward(&input).unwrap();
        assert_eq!(output.shape(), (2, 3));
    }

    #[test]
    fn per_class_pooling_is_a_convex_combination() {
        let mut head = head(false);
        // Uniform projection weights make every class pool the same value.
        let span = head.projection.weight().value().shape();
        head.projection
            .weight_mut()
            .load_value(&Tensor::from_fn(span.0, span.1, |_, _| 1.0).unwrap())
            .unwrap();
        let input = Tensor::from_fn(1, 8, |_, c| if c < 4 { 1.0 } else { 0.0 }).unwrap();
        let output = head.forward(&input).unwrap();
        for class in 0..3 {
            assert!((output.data()[class] - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn sum_all_weights_span_classes_and_positions() {
        let head = head(true);
        let input = Tensor::random_normal(1, 8, 0.0, 1.0, Some(9)).unwrap();
        let projected = head.projection.forward(&input).unwrap();
        let output = head.forward(&input).unwrap();
        // Joint softmax means each class pools only a fraction of its row.
        let max_abs = projected
            .data()
            .iter()
            .fold(0.0f32, |acc, v| acc.max(v.abs()));
        assert!(output.data().iter().all(|v| v.abs() <= max_abs));
    }
}
