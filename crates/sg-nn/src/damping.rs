// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of Spiralgram — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use half::f16;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// Attenuation floor reached at the frequency edges of a kernel.
pub const MIN_SCALE: f32 = 0.01;

/// Cache of frequency-damping masks keyed by kernel spatial shape.
///
/// The mask for a `(height, width)` kernel is all ones along the time (width)
/// axis and ramps linearly along the frequency (height) axis from `1.0` at
/// the centre row down to [`MIN_SCALE`] at the edge rows; kernels with fewer
/// than two rows get an identity mask. Each shape is computed once and then
/// only read, so concurrently constructed layers can share the cache behind
/// an `Arc`. The one mutating operation is [`DampingCache::downcast`], which
/// takes the whole cache exclusively.
#[derive(Debug, Default)]
pub struct DampingCache {
    masks: RwLock<HashMap<(usize, usize), Arc<Vec<f32>>>>,
    half_precision: AtomicBool,
}

fn quantize(values: &mut [f32]) {
    for value in values.iter_mut() {
        *value = f16::from_f32(*value).to_f32();
    }
}

impl DampingCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    fn compute(kernel: (usize, usize), half: bool) -> Vec<f32> {
        let (height, width) = kernel;
        let mut mask = vec![1.0f32; height * width];
        let center = (height as f32 - 1.0) / 2.0;
        if center >= 1.0 {
            for row in 0..height {
                let distance = (row as f32 - center).abs();
                let scale = 1.0 - (1.0 - MIN_SCALE) * distance / center;
                for value in &mut mask[row * width..(row + 1) * width] {
                    *value *= scale;
                }
            }
        }
        if half {
            quantize(&mut mask);
        }
        mask
    }

    /// Returns the mask for the given kernel shape, computing it on first use.
    /// Each shape is written exactly once; later calls only read.
    pub fn mask(&self, kernel: (usize, usize)) -> Arc<Vec<f32>> {
        if let Some(mask) = self
            .masks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&kernel)
        {
            return Arc::clone(mask);
        }
        let mut masks = self
            .masks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(mask) = masks.get(&kernel) {
            return Arc::clone(mask);
        }
        // The flag only changes under the write lock held here.
        let mask = Arc::new(Self::compute(
            kernel,
            self.half_precision.load(Ordering::Acquire),
        ));
        masks.insert(kernel, Arc::clone(&mask));
        mask
    }

    /// Converts every cached mask (and all masks computed afterwards) to an
    /// IEEE f16 representation. Global, blocking, idempotent and irreversible.
    pub fn downcast(&self) {
        let mut masks = self
            .masks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.half_precision.store(true, Ordering::Release);
        for mask in masks.values_mut() {
            let mut quantized = mask.as_ref().clone();
            quantize(&mut quantized);
            *mask = Arc::new(quantized);
        }
    }

    /// Returns `true` once [`DampingCache::downcast`] has run.
    pub fn is_half_precision(&self) -> bool {
        self.half_precision.load(Ordering::Acquire)
    }

    /// Number of distinct kernel shapes cached so far.
    pub fn len(&self) -> usize {
        self.masks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Returns `true` when no mask has been requested yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_is_one_at_centre_and_min_scale_at_edges() {
        let cache = DampingCache::new();
        let mask = cache.mask((5, 3));
        assert_eq!(mask.len(), 15);
        for value in &mask[2 * 3..3 * 3] {
            assert_eq!(*value, 1.0);
        }
        for value in &mask[0..3] {
            assert!((*value - MIN_SCALE).abs() < 1e-6);
        }
        for value in mask.iter() {
            assert!((MIN_SCALE..=1.0).contains(value));
        }
    }

    #[test]
    fn mask_is_symmetric_about_frequency_centre() {
        let cache = DampingCache::new();
        let mask = cache.mask((7, 1));
        for row in 0..7 {
            assert!((mask[row] - mask[6 - row]).abs() < 1e-6);
        }
    }

    #[test]
    fn single_row_kernels_get_identity_masks() {
        let cache = DampingCache::new();
        assert!(cache.mask((1, 3)).iter().all(|v| *v == 1.0));
        assert!(cache.mask((1, 1)).iter().all(|v| *v == 1.0));
    }

    #[test]
    fn masks_are_cached_per_shape() {
        let cache = DampingCache::new();
        let a = cache.mask((3, 3));
        let b = cache.mask((3, 3));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn downcast_is_idempotent_and_applies_to_new_masks() {
        let cache = DampingCache::new();
        let full = cache.mask((5, 1)).as_ref().clone();
        cache.downcast();
        let once = cache.mask((5, 1)).as_ref().clone();
        cache.downcast();
        let twice = cache.mask((5, 1)).as_ref().clone();
        assert_eq!(once, twice);
        assert_ne!(full, once);
        let fresh = cache.mask((9, 1));
        let mut expected = DampingCache::compute((9, 1), false);
        quantize(&mut expected);
        assert_eq!(fresh.as_ref(), &expected);
    }
}
