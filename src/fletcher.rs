// SPDX-License-Identifier: MIT

//! Fletcher-32 as used by the AMD PSP and BIOS directory headers.
//!
//! The directory checksum covers the serialised directory from offset 8
//! (the fields after cookie and checksum) through the last entry. Input is
//! consumed as 16-bit little-endian halves; a trailing odd byte is
//! zero-extended.

use core::ops::{Add, AddAssign, BitAnd, BitOr, Shl, Shr};
use fletcher::{Fletcher, FletcherAccumulator};

/// Accumulator with the reduction cadence the directory checksum needs:
/// 16-bit end-around-carry folds, at most 359 halves between folds so the
/// running sums stay inside 32 bits.
#[derive(Clone, Copy, PartialEq)]
pub struct DirSum(u32);

impl DirSum {
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl Add for DirSum {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self(self.0.add(other.0))
    }
}

impl AddAssign for DirSum {
    fn add_assign(&mut self, other: Self) {
        self.0 = self.0.add(other.0)
    }
}

impl BitAnd for DirSum {
    type Output = Self;
    fn bitand(self, other: Self) -> Self {
        Self(self.0.bitand(other.0))
    }
}

impl BitOr for DirSum {
    type Output = Self;
    fn bitor(self, other: Self) -> Self {
        Self(self.0.bitor(other.0))
    }
}

impl Shr<u16> for DirSum {
    type Output = Self;
    fn shr(self, bits: u16) -> Self {
        Self(self.0.shr(bits))
    }
}

impl Shl<u16> for DirSum {
    type Output = Self;
    fn shl(self, bits: u16) -> Self {
        Self(self.0.shl(bits))
    }
}

impl From<u16> for DirSum {
    fn from(value: u16) -> Self {
        Self(value.into())
    }
}

impl Default for DirSum {
    fn default() -> Self {
        DirSum(0x0000ffff)
    }
}

impl FletcherAccumulator for DirSum {
    type InputType = u16;
    const BIT_MASK: Self = DirSum(0xffff);
    const MAX_CHUNK_SIZE: usize = 359;
    const SHIFT_AMOUNT: u16 = 16;
}

pub type DirFletcher = Fletcher<DirSum>;

/// Fletcher-32 over `data`, fed half-by-half so multi-MB inputs are never
/// copied or padded.
pub fn fletcher32(data: &[u8]) -> u32 {
    let mut sum = DirFletcher::new();
    let mut halves = data.chunks_exact(2);
    for half in &mut halves {
        sum.update(&[u16::from_le_bytes([half[0], half[1]])]);
    }
    if let [last] = halves.remainder() {
        sum.update(&[u16::from(*last)]);
    }
    sum.value().value()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spot_values() {
        assert_eq!(fletcher32(b"abcde"), 0xF04FC729);
        assert_eq!(fletcher32(b"abcdef"), 0x56502D2A);
        assert_eq!(fletcher32(b"abcdefgh"), 0xEBE19591);
    }

    #[test]
    fn empty_input() {
        assert_eq!(fletcher32(b""), fletcher32(b""));
    }
}
