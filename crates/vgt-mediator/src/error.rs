use thiserror::Error;
use vgt_protocol::{IgdGeneration, ProtocolError, ResourceRequest};

pub type Result<T> = std::result::Result<T, VgtError>;

/// Why a trapped access was not emulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("no active emulation backend for this device")]
    NotInitialized,

    #[error("unsupported access: {len} bytes at {address:#x}")]
    UnsupportedAccess { address: u64, len: usize },
}

/// Terminal outcome of a failed resource negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NegotiationError {
    /// The guest asks for more than this host could ever grant.
    #[error("guest minimums exceed host capacity: {request:?}")]
    ExceedsCapacity { request: ResourceRequest },

    /// The pool could not satisfy the request right now.
    #[error("resource pool cannot satisfy guest minimums: {request:?}")]
    PoolExhausted { request: ResourceRequest },

    #[error("guest still reports a shortfall after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("vGT instance {0} is already attached")]
    AlreadyAttached(u32),

    #[error("no attached vGT instance {0}")]
    UnknownInstance(u32),

    #[error("graphics device generation {0:?} cannot be mediated")]
    UnsupportedGeneration(IgdGeneration),
}

#[derive(Debug, Error)]
pub enum VgtError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}
