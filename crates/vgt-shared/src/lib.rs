//! The PVINFO page as live shared memory.
//!
//! `vgt-protocol` describes the page as bytes; this crate hands out the two writer-restricted
//! views the mediator and the guest driver use while the page is mapped into both.
#![forbid(unsafe_code)]

pub mod control_page;

pub use control_page::{
    Doorbell, GuestSide, MediatorSide, PageAccessError, SharedControlPage, CONTROL_PAGE_WORDS,
};
