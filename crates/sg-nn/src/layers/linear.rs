// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of Spiralgram — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::init::InitContext;
use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};

/// Fully-connected layer.
#[derive(Debug)]
pub struct Linear {
    weight: Parameter,
    bias: Parameter,
}

impl Linear {
    /// Creates a new linear layer with deterministic small parameters.
    pub fn new(name: impl Into<String>, input_dim: usize, output_dim: usize) -> PureResult<Self> {
        if input_dim == 0 || output_dim == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: input_dim,
                cols: output_dim,
            });
        }
        let name = name.into();
        let mut scale = 0.01f32;
        let weights = Tensor::from_fn(input_dim, output_dim, |_r, _c| {
            let value = scale;
            scale += 0.01;
            value
        })?;
        let bias = Tensor::zeros(1, output_dim)?;
        Ok(Self {
            weight: Parameter::new(format!("{name}::weight"), weights),
            bias: Parameter::new(format!("{name}::bias"), bias),
        })
    }

    /// Returns a reference to the weight parameter.
    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    /// Returns a reference to the bias parameter.
    pub fn bias(&self) -> &Parameter {
        &self.bias
    }
}

impl Module for Linear {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        if input.shape().1 != self.weight.value().shape().0 {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: self.weight.value().shape(),
            });
        }
        let mut out = input.matmul(self.weight.value())?;
        let bias = self.bias.value().data();
        let cols = out.shape().1;
        for row in out.data_mut().chunks_mut(cols) {
            for (dst, b) in row.iter_mut().zip(bias.iter()) {
                *dst += b;
            }
        }
        Ok(out)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)?;
        visitor(&self.bias)?;
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)?;
        visitor(&mut self.bias)?;
        Ok(())
    }

    fn init_weights(&mut self, ctx: &mut InitContext) -> PureResult<()> {
        let (fan_in, fan_out) = self.weight.value().shape();
        ctx.xavier_uniform(self.weight.value_mut(), fan_in, fan_out)?;
        InitContext::zero(self.bias.value_mut());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init::InitPolicy;

    #[test]
    fn linear_forward_matches_manual() {
        let layer = Linear::new("fc", 3, 2).unwrap();
        let input = Tensor::from_vec(1, 3, vec![1.0, -2.0, 0.5]).unwrap();
        let output = layer.forward(&input).unwrap();
        // The freshly constructed bias is zero, so the product is the output.
        let expected = input.matmul(layer.weight.value()).unwrap();
        assert_eq!(output, expected);
    }

    #[test]
    fn init_weights_zeroes_bias_and_bounds_weight() {
        let mut layer = Linear::new("fc", 4, 4).unwrap();
        layer
            .bias
            .load_value(&Tensor::from_vec(1, 4, vec![1.0; 4]).unwrap())
            .unwrap();
        let mut ctx = InitContext::new(InitPolicy::Standard, Some(2));
        layer.init_weights(&mut ctx).unwrap();
        assert!(layer.bias.value().data().iter().all(|v| *v == 0.0));
        let limit = (6.0f32 / 8.0).sqrt();
        assert!(layer.weight.value().data().iter().all(|v| v.abs() <= limit));
    }
}
