//! Hilbert-curve locality keys.
//!
//! Maps a point in the bounded spatial-key box to one integer so that nearby
//! points usually get nearby integers. Keys only decide storage and scan
//! order; queries never rely on them, since the curve can separate points
//! that are close in space.
//!
//! The transform is Skilling's "transpose" formulation (AIP Conf. Proc. 707,
//! 2004): coordinates are rotated/reflected in place, Gray-coded, and the
//! bits of the result are interleaved into the index.

use atomdb_core::error::{AtomError, Result};
use atomdb_core::types::LocalityKey;

/// Hilbert index of an integer grid point, `bits` bits per axis.
///
/// Requires `grid.len() * bits <= 64` and every coordinate `< 2^bits`.
pub fn hilbert_index(grid: &[u32], bits: u32) -> u64 {
    let mut x: Vec<u64> = grid.iter().map(|&g| g as u64).collect();
    axes_to_transpose(&mut x, bits);

    let mut h = 0u64;
    for b in (0..bits).rev() {
        for xi in &x {
            h = (h << 1) | ((xi >> b) & 1);
        }
    }
    h
}

/// Inverse of [`hilbert_index`].
pub fn hilbert_point(index: u64, dims: usize, bits: u32) -> Vec<u32> {
    let mut x = vec![0u64; dims];
    let mut shift = dims * bits as usize;
    for b in (0..bits).rev() {
        for xi in x.iter_mut() {
            shift -= 1;
            *xi |= ((index >> shift) & 1) << b;
        }
    }
    transpose_to_axes(&mut x, bits);
    x.into_iter().map(|v| v as u32).collect()
}

fn axes_to_transpose(x: &mut [u64], bits: u32) {
    let n = x.len();
    if n == 0 || bits == 0 {
        return;
    }
    let m = 1u64 << (bits - 1);

    // Inverse undo.
    let mut q = m;
    while q > 1 {
        let p = q - 1;
        for i in 0..n {
            if x[i] & q != 0 {
                x[0] ^= p;
            } else {
                let t = (x[0] ^ x[i]) & p;
                x[0] ^= t;
                x[i] ^= t;
            }
        }
        q >>= 1;
    }

    // Gray encode.
    for i in 1..n {
        x[i] ^= x[i - 1];
    }
    let mut t = 0;
    let mut q = m;
    while q > 1 {
        if x[n - 1] & q != 0 {
            t ^= q - 1;
        }
        q >>= 1;
    }
    for xi in x.iter_mut() {
        *xi ^= t;
    }
}

fn transpose_to_axes(x: &mut [u64], bits: u32) {
    let n = x.len();
    if n == 0 || bits == 0 {
        return;
    }
    let limit = 1u64 << bits;

    // Gray decode.
    let t = x[n - 1] >> 1;
    for i in (1..n).rev() {
        x[i] ^= x[i - 1];
    }
    x[0] ^= t;

    // Undo excess work.
    let mut q = 2;
    while q != limit {
        let p = q - 1;
        for i in (0..n).rev() {
            if x[i] & q != 0 {
                x[0] ^= p;
            } else {
                let t = (x[0] ^ x[i]) & p;
                x[0] ^= t;
                x[i] ^= t;
            }
        }
        q <<= 1;
    }
}

/// Quantizes coordinates in `[lo, hi]` onto a `2^bits` grid per axis and
/// orders them along a Hilbert curve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalityCurve {
    dims: usize,
    bits: u32,
    lo: f64,
    hi: f64,
}

impl LocalityCurve {
    pub fn new(dims: usize, bits: u32, lo: f64, hi: f64) -> Result<Self> {
        if dims == 0 || bits == 0 || bits > 32 || dims * bits as usize > 64 {
            return Err(AtomError::Validation(format!(
                "locality curve needs 1..=32 bits per axis and at most 64 bits total, got {} x {}",
                dims, bits
            )));
        }
        if !(lo.is_finite() && hi.is_finite() && hi > lo) {
            return Err(AtomError::Validation(format!(
                "locality curve range [{}, {}] is empty",
                lo, hi
            )));
        }
        Ok(Self { dims, bits, lo, hi })
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Grid cell of each coordinate. Values outside the range are clamped.
    pub fn quantize(&self, coords: &[f64]) -> Vec<u32> {
        let cells = (1u64 << self.bits) as f64;
        let max = (1u64 << self.bits) - 1;
        coords
            .iter()
            .map(|&c| {
                let unit = (c - self.lo) / (self.hi - self.lo);
                if !unit.is_finite() || unit <= 0.0 {
                    0
                } else {
                    ((unit * cells) as u64).min(max) as u32
                }
            })
            .collect()
    }

    /// Locality key of a point.
    pub fn encode(&self, coords: &[f64]) -> Result<LocalityKey> {
        if coords.len() != self.dims {
            return Err(AtomError::DimensionMismatch {
                expected: self.dims,
                actual: coords.len(),
            });
        }
        Ok(LocalityKey(hilbert_index(&self.quantize(coords), self.bits)))
    }

    /// Centre of the grid cell a key refers to. Diagnostic only.
    pub fn decode(&self, key: LocalityKey) -> Vec<f64> {
        let cells = (1u64 << self.bits) as f64;
        hilbert_point(key.0, self.dims, self.bits)
            .into_iter()
            .map(|g| self.lo + (g as f64 + 0.5) / cells * (self.hi - self.lo))
            .collect()
    }
}
