// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of Spiralgram — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::{PureResult, Tensor, TensorError};
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::StandardNormal;

/// Whole-model weight initialisation policy, chosen once per network.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitPolicy {
    /// Kaiming-normal convolutions, unit/zero norms, Xavier-uniform linears.
    Standard,
    /// Fixup-style: the standard pass first, then residual blocks rescale
    /// their first convolution by `total_blocks^(-1/2)` and zero their
    /// second, with the head projection zeroed up front.
    DepthScaled { total_blocks: usize },
}

/// Mutable state threaded through a single initialisation walk.
pub struct InitContext {
    policy: InitPolicy,
    rng: StdRng,
}

impl InitContext {
    /// Creates a context for one walk over the module tree. A seed makes the
    /// walk reproducible; `None` draws from entropy.
    pub fn new(policy: InitPolicy, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { policy, rng }
    }

    /// Returns the policy this walk applies.
    pub fn policy(&self) -> InitPolicy {
        self.policy
    }

    /// Fills the tensor from `N(mean, std^2)`.
    pub fn normal(&mut self, tensor: &mut Tensor, mean: f32, std: f32) -> PureResult<()> {
        if std <= 0.0 || !std.is_finite() {
            return Err(TensorError::InvalidValue {
                label: "init_normal_std",
            });
        }
        for value in tensor.data_mut() {
            let sample: f64 = StandardNormal.sample(&mut self.rng);
            *value = mean + std * sample as f32;
        }
        Ok(())
    }

    /// Kaiming-normal with fan-in mode and ReLU gain: `N(0, 2 / fan_in)`.
    pub fn kaiming_normal(&mut self, tensor: &mut Tensor, fan_in: usize) -> PureResult<()> {
        if fan_in == 0 {
            return Err(TensorError::InvalidValue {
                label: "init_kaiming_fan_in",
            });
        }
        let std = (2.0 / fan_in as f32).sqrt();
        self.normal(tensor, 0.0, std)
    }

    /// Xavier-uniform over `[-limit, limit]` with `limit = sqrt(6/(fan_in+fan_out))`.
    pub fn xavier_uniform(
        &mut self,
        tensor: &mut Tensor,
        fan_in: usize,
        fan_out: usize,
    ) -> PureResult<()> {
        if fan_in + fan_out == 0 {
            return Err(TensorError::InvalidValue {
                label: "init_xavier_fans",
            });
        }
        let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
        let distribution = Uniform::new_inclusive(-limit, limit);
        for value in tensor.data_mut() {
            *value = distribution.sample(&mut self.rng);
        }
        Ok(())
    }

    /// Zeroes the tensor in place.
    pub fn zero(tensor: &mut Tensor) {
        for value in tensor.data_mut() {
            *value = 0.0;
        }
    }

    /// Fills the tensor with a constant.
    pub fn constant(tensor: &mut Tensor, value: f32) {
        for slot in tensor.data_mut() {
            *slot = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_walks_are_reproducible() {
        let mut a = Tensor::zeros(4, 4).unwrap();
        let mut b = Tensor::zeros(4, 4).unwrap();
        let mut ctx_a = InitContext::new(InitPolicy::Standard, Some(3));
        let mut ctx_b = InitContext::new(InitPolicy::Standard, Some(3));
        ctx_a.kaiming_normal(&mut a, 16).unwrap();
        ctx_b.kaiming_normal(&mut b, 16).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn xavier_uniform_respects_limit() {
        let mut tensor = Tensor::zeros(8, 8).unwrap();
        let mut ctx = InitContext::new(InitPolicy::Standard, Some(5));
        ctx.xavier_uniform(&mut tensor, 8, 8).unwrap();
        let limit = (6.0f32 / 16.0).sqrt();
        assert!(tensor.data().iter().all(|v| v.abs() <= limit));
        assert!(tensor.squared_l2_norm() > 0.0);
    }

    #[test]
    fn zero_and_constant_fill() {
        let mut tensor = Tensor::from_fn(2, 2, |_, _| 3.0).unwrap();
        InitContext::zero(&mut tensor);
        assert!(tensor.data().iter().all(|v| *v == 0.0));
        InitContext::constant(&mut tensor, 1.0);
        assert!(tensor.data().iter().all(|v| *v == 1.0));
    }
}
