// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of Spiralgram — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use sg_tensor::{PureResult, Tensor, TensorError};

/// Floor applied before the logarithm so silent bins stay finite.
const POWER_FLOOR: f32 = 1.0e-10;

/// Log-power mel front-end over a precomputed filterbank.
///
/// The filterbank matrix is supplied by the caller (`(n_mels, n_bins)`); this
/// type only applies it. Input rows hold a power spectrogram laid out as
/// `n_bins * frames`; the output keeps the frame count and swaps the bin axis
/// for the mel axis. The logarithm runs before the mel projection, matching
/// the network this front-end feeds.
#[derive(Clone, Debug)]
pub struct MelFrontend {
    basis: Tensor,
}

impl MelFrontend {
    /// Wraps a precomputed mel filterbank.
    pub fn new(basis: Tensor) -> Self {
        Self { basis }
    }

    /// Number of mel bands produced per frame.
    pub fn n_mels(&self) -> usize {
        self.basis.shape().0
    }

    /// Number of spectrogram bins consumed per frame.
    pub fn n_bins(&self) -> usize {
        self.basis.shape().1
    }

    /// Maps `(batch, n_bins * frames)` power spectrograms to
    /// `(batch, n_mels * frames)` log-mel features.
    pub fn forward(&self, input: &Tensor, frames: usize) -> PureResult<Tensor> {
        if frames == 0 {
            return Err(TensorError::InvalidValue {
                label: "mel_frontend_frames",
            });
        }
        let (batch, cols) = input.shape();
        let n_bins = self.n_bins();
        if cols != n_bins * frames {
            return Err(TensorError::ShapeMismatch {
                left: (batch, cols),
                right: (batch, n_bins * frames),
            });
        }
        let n_mels = self.n_mels();
        let mut out = Tensor::zeros(batch, n_mels * frames)?;
        for b in 0..batch {
            let row = &input.data()[b * cols..(b + 1) * cols];
            let log_power: Vec<f32> = row
                .iter()
                .map(|power| power.max(POWER_FLOOR).sqrt().log10())
                .collect();
            let frame_matrix = Tensor::from_vec(n_bins, frames, log_power)?;
            let mel = self.basis.matmul(&frame_matrix)?;
            out.data_mut()[b * n_mels * frames..(b + 1) * n_mels * frames]
                .copy_from_slice(mel.data());
        }
        Ok(out)
    }
}
