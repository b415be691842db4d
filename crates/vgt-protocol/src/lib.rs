//! Guest driver ↔ mediator contract for mediated graphics passthrough (vGT).
//!
//! This crate is the single Rust source of truth for the PVINFO page ABI: the 4 KiB shared page
//! the mediator exposes inside the device's register BAR so an unmodified guest driver can
//! discover its resource allocation, report shortfalls back, and exchange lightweight display
//! notifications.
//!
//! Everything here is plain data: constants, layout tables, (de)serialization and validation.
//! The live, concurrently-accessed page lives in `vgt-shared`; dispatch and negotiation live in
//! `vgt-mediator`.
#![forbid(unsafe_code)]

pub mod bits;
pub mod error;
pub mod notify;
pub mod platform;
pub mod pvinfo;

pub use bits::{
    checked_extract_bits, checked_extract_bits64, extract_bit, extract_bit64, extract_bits,
    extract_bits64,
};
pub use error::{BitRangeError, ProtocolError};
pub use notify::{
    G2vNotification, Mailbox, MailboxEvent, V2gNotification, VGT_G2V_MAX, VGT_NOTIFY_EMPTY,
    VGT_V2G_MAX,
};
pub use platform::{
    IgdGeneration, PlatformKind, PlatformProbe, StaticPlatformProbe, IGD_GENERATION_MAX,
};
pub use pvinfo::{
    field_offset, pvinfo_off, validate_bytes, validate_header, AvailableResources, DisplayReady,
    FieldOwner, GmadrRange, PvInfoField, ResourceRequest, ResourceShortfall, VgtIf, VgtIfAvailRs,
    VgtIfGmadr, VGT_MAGIC, VGT_PVINFO_HALF, VGT_PVINFO_PAGE, VGT_PVINFO_SIZE, VGT_VERSION_MAJOR,
    VGT_VERSION_MINOR,
};
