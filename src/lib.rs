//! vGT control plane: the PVINFO contract between a mediated guest graphics driver and the host
//! mediator.
//!
//! - [`protocol`]: page layout, constants, mailbox values, platform identity.
//! - [`shared`]: the live page as shared atomic memory.
//! - [`mediator`]: dispatch, negotiation, reentrancy tracking and lifecycle.
#![forbid(unsafe_code)]

pub use vgt_mediator as mediator;
pub use vgt_protocol as protocol;
pub use vgt_shared as shared;

pub use vgt_mediator::{Mediator, MediatorConfig, VgtError};
pub use vgt_protocol::{VgtIf, VGT_MAGIC, VGT_PVINFO_PAGE, VGT_PVINFO_SIZE};
pub use vgt_shared::SharedControlPage;
