//! Register bit-field extraction.
//!
//! Bit positions are zero-based and ranges are inclusive on both ends: `extract_bits(v, 7, 4)`
//! returns bits 7..=4 of `v` shifted down to bit 0. `high` may be the top bit of the register
//! (31 or 63) without overflowing the mask computation.

use crate::error::BitRangeError;

const fn mask32(high: u32) -> u32 {
    if high >= 31 {
        u32::MAX
    } else {
        (1u32 << (high + 1)) - 1
    }
}

const fn mask64(high: u32) -> u64 {
    if high >= 63 {
        u64::MAX
    } else {
        (1u64 << (high + 1)) - 1
    }
}

/// Returns bits `high..=low` of a 32-bit register value.
///
/// Callers must pass `low <= high < 32`; use [`checked_extract_bits`] when the range is not a
/// compile-time constant.
#[inline]
pub const fn extract_bits(value: u32, high: u32, low: u32) -> u32 {
    debug_assert!(high < 32 && low <= high);
    (value & mask32(high)) >> (low & 31)
}

/// Returns bit `bit` of a 32-bit register value as 0 or 1.
#[inline]
pub const fn extract_bit(value: u32, bit: u32) -> u32 {
    extract_bits(value, bit, bit)
}

/// Returns bits `high..=low` of a 64-bit register value.
#[inline]
pub const fn extract_bits64(value: u64, high: u32, low: u32) -> u64 {
    debug_assert!(high < 64 && low <= high);
    (value & mask64(high)) >> (low & 63)
}

#[inline]
pub const fn extract_bit64(value: u64, bit: u32) -> u64 {
    extract_bits64(value, bit, bit)
}

pub fn checked_extract_bits(value: u32, high: u32, low: u32) -> Result<u32, BitRangeError> {
    if high >= 32 {
        return Err(BitRangeError::Overflow { high, width: 32 });
    }
    if low > high {
        return Err(BitRangeError::MisalignedBitRange { high, low });
    }
    Ok(extract_bits(value, high, low))
}

pub fn checked_extract_bits64(value: u64, high: u32, low: u32) -> Result<u64, BitRangeError> {
    if high >= 64 {
        return Err(BitRangeError::Overflow { high, width: 64 });
    }
    if low > high {
        return Err(BitRangeError::MisalignedBitRange { high, low });
    }
    Ok(extract_bits64(value, high, low))
}
