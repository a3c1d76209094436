// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of Spiralgram — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::init::InitContext;
use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};
use std::cell::{Cell, RefCell};

/// Batch normalisation over 2D feature maps, one statistic per channel.
///
/// Training mode normalises with batch statistics and folds them into the
/// running estimates; evaluation mode normalises with the running estimates
/// alone. The mode lives in a `Cell` so a shared reference can flip it, the
/// same way the rest of the stack drives forward passes.
#[derive(Debug)]
pub struct BatchNorm2d {
    channels: usize,
    spatial: usize,
    epsilon: f32,
    momentum: f32,
    gamma: Parameter,
    beta: Parameter,
    running_mean: RefCell<Tensor>,
    running_var: RefCell<Tensor>,
    training: Cell<bool>,
}

impl BatchNorm2d {
    /// Creates a new batch normalisation layer for `channels` feature maps of
    /// `input_hw` spatial extent.
    pub fn new(
        name: impl Into<String>,
        channels: usize,
        input_hw: (usize, usize),
        momentum: f32,
        epsilon: f32,
    ) -> PureResult<Self> {
        if channels == 0 || input_hw.0 == 0 || input_hw.1 == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: channels,
                cols: input_hw.0 * input_hw.1,
            });
        }
        if !(0.0..=1.0).contains(&momentum) || !momentum.is_finite() {
            return Err(TensorError::InvalidValue {
                label: "batchnorm_momentum",
            });
        }
        if epsilon <= 0.0 || !epsilon.is_finite() {
            return Err(TensorError::NonFiniteValue {
                label: "batchnorm_epsilon",
                value: epsilon,
            });
        }
        let name = name.into();
        let gamma = Tensor::from_vec(1, channels, vec![1.0; channels])?;
        let beta = Tensor::zeros(1, channels)?;
        let running_mean = Tensor::zeros(1, channels)?;
        let running_var = Tensor::from_vec(1, channels, vec![1.0; channels])?;
        Ok(Self {
            channels,
            spatial: input_hw.0 * input_hw.1,
            epsilon,
            momentum,
            gamma: Parameter::new(format!("{name}::gamma"), gamma),
            beta: Parameter::new(format!("{name}::beta"), beta),
            running_mean: RefCell::new(running_mean),
            running_var: RefCell::new(running_var),
            training: Cell::new(true),
        })
    }

    /// Returns the number of channels normalised per sample.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Enables or disables training mode.
    pub fn set_training(&self, training: bool) {
        self.training.set(training);
    }

    /// Switches the layer to evaluation mode.
    pub fn eval(&self) {
        self.set_training(false);
    }

    fn guard_input(&self, input: &Tensor) -> PureResult<()> {
        let (rows, cols) = input.shape();
        if cols != self.channels * self.spatial {
            return Err(TensorError::ShapeMismatch {
                left: (rows, cols),
                right: (rows, self.channels * self.spatial),
            });
        }
        Ok(())
    }

    fn batch_stats(&self, input: &Tensor) -> (Vec<f32>, Vec<f32>) {
        let (batch, cols) = input.shape();
        let count = (batch * self.spatial) as f32;
        let mut mean = vec![0.0f32; self.channels];
        let mut var = vec![0.0f32; self.channels];
        for b in 0..batch {
            let row = &input.data()[b * cols..(b + 1) * cols];
            for c in 0..self.channels {
                for value in &row[c * self.spatial..(c + 1) * self.spatial] {
                    mean[c] += value;
                }
            }
        }
        for value in mean.iter_mut() {
            *value /= count;
        }
        for b in 0..batch {
            let row = &input.data()[b * cols..(b + 1) * cols];
            for c in 0..self.channels {
                for value in &row[c * self.spatial..(c + 1) * self.spatial] {
                    let centered = value - mean[c];
                    var[c] += centered * centered;
                }
            }
        }
        for value in var.iter_mut() {
            *value /= count;
        }
        (mean, var)
    }
}

impl Module for BatchNorm2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.guard_input(input)?;
        let (batch, cols) = input.shape();
        let (mean, var) = if self.training.get() {
            let (mean, var) = self.batch_stats(input);
            let mut running_mean = self.running_mean.borrow_mut();
            let mut running_var = self.running_var.borrow_mut();
            for c in 0..self.channels {
                let rm = &mut running_mean.data_mut()[c];
                *rm = (1.0 - self.momentum) * *rm + self.momentum * mean[c];
                let rv = &mut running_var.data_mut()[c];
                *rv = (1.0 - self.momentum) * *rv + self.momentum * var[c];
            }
            (mean, var)
        } else {
            (
                self.running_mean.borrow().data().to_vec(),
                self.running_var.borrow().data().to_vec(),
            )
        };
        let gamma = self.gamma.value().data();
        let beta = self.beta.value().data();
        let mut out = Tensor::zeros(batch, cols)?;
        {
            let out_data = out.data_mut();
            for b in 0..batch {
                let row = &input.data()[b * cols..(b + 1) * cols];
                let out_row = &mut out_data[b * cols..(b + 1) * cols];
                for c in 0..self.channels {
                    let inv_std = 1.0 / (var[c] + self.epsilon).sqrt();
                    let (g, shift) = (gamma[c], beta[c]);
                    for idx in c * self.spatial..(c + 1) * self.spatial {
                        out_row[idx] = (row[idx] - mean[c]) * inv_std * g + shift;
                    }
                }
            }
        }
        Ok(out)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.gamma)?;
        visitor(&self.beta)?;
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.gamma)?;
        visitor(&mut self.beta)?;
        Ok(())
    }

    fn set_training(&self, training: bool) {
        self.training.set(training);
    }

    fn init_weights(&mut self, _ctx: &mut InitContext) -> PureResult<()> {
        InitContext::constant(self.gamma.value_mut(), 1.0);
        InitContext::zero(self.beta.value_mut());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn training_forward_whitens_each_channel() {
        let bn = BatchNorm2d::new("bn", 1, (2, 2), 0.1, 1e-5).unwrap();
        let input = Tensor::from_vec(2, 4, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]).unwrap();
        let output = bn.forward(&input).unwrap();
        let mean: f32 = output.data().iter().sum::<f32>() / 8.0;
        let var: f32 = output.data().iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / 8.0;
        assert!(mean.abs() < 1e-5);
        assert!((var - 1.0).abs() < 1e-3);
    }

    #[test]
    fn eval_mode_uses_running_estimates() {
        let bn = BatchNorm2d::new("bn", 1, (1, 2), 1.0, 1e-5).unwrap();
        let input = Tensor::from_vec(2, 2, vec![2.0, 2.0, 4.0, 4.0]).unwrap();
        // momentum 1.0 adopts the batch statistics outright.
        bn.forward(&input).unwrap();
        bn.eval();
        let probe = Tensor::from_vec(1, 2, vec![3.0, 3.0]).unwrap();
        let output = bn.forward(&probe).unwrap();
        for value in output.data() {
            assert!(value.abs() < 1e-3);
        }
    }

    #[test]
    fn rejects_mismatched_feature_width() {
        let bn = BatchNorm2d::new("bn", 2, (2, 2), 0.1, 1e-5).unwrap();
        let input = Tensor::zeros(1, 4).unwrap();
        assert!(bn.forward(&input).is_err());
    }
}
