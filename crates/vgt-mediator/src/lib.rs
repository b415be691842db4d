//! Mediator side of the vGT control plane.
//!
//! Owns one [`SharedControlPage`](vgt_shared::SharedControlPage) per attached guest, routes
//! trapped device accesses through an [`EmulationDispatcher`], negotiates graphics resources
//! with the guest driver and keeps virtual interrupt delivery out of mediator critical sections.
#![forbid(unsafe_code)]

pub mod config;
pub mod delayed;
pub mod dispatch;
pub mod error;
pub mod mediator;
pub mod negotiate;
pub mod pvinfo_mmio;
pub mod reentrancy;

pub use config::{MediatorConfig, NegotiatorConfig, ResourceLimits};
pub use delayed::{DelayedEvent, DelayedEventRegistry, DELAYED_EVENT_MAX};
pub use dispatch::{
    valid_access_size, EmulationBackend, EmulationDispatcher, NativeAccess, NoNativeAccess,
    RegistrationState, Requester, CONFIG_SPACE_SIZE,
};
pub use error::{DispatchError, LifecycleError, NegotiationError, Result, VgtError};
pub use mediator::{DelayedPayload, Mediator, VgtInstance};
pub use negotiate::{BoundedResourcePool, NegotiationState, ResourceNegotiator, ResourcePool};
pub use pvinfo_mmio::{GuestDoorbell, PvInfoMmio};
pub use reentrancy::{
    CoreId, DeferredIrqHook, DeferredVirqInjector, NoDeferredIrq, ReentrancyGuard, VirqDelivery,
};
