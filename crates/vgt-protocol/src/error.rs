use thiserror::Error;

/// The PVINFO page (or the guest driver that answered it) speaks a protocol we cannot trust.
///
/// Every variant is fatal to device attach: nothing else in the page may be interpreted once one
/// of these has been observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("PVINFO page too short: {len} bytes (need {needed})")]
    Truncated { len: usize, needed: usize },

    #[error("bad PVINFO magic {found:#018x} (expected {expected:#018x})")]
    BadMagic { found: u64, expected: u64 },

    #[error("unsupported PVINFO major version {found} (expected {expected})")]
    MajorVersionMismatch { found: u16, expected: u16 },

    #[error("guest driver speaks PVINFO major version {found} (expected {expected})")]
    DriverMajorVersionMismatch { found: u16, expected: u16 },
}

/// Misuse of the register bit-field helpers.
///
/// These are programming errors in an emulation routine, not guest-triggerable conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BitRangeError {
    #[error("bit range [{low}, {high}] has low > high")]
    MisalignedBitRange { high: u32, low: u32 },

    #[error("bit {high} is outside a {width}-bit register")]
    Overflow { high: u32, width: u32 },
}
