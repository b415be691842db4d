//! Per-core "inside the mediator" tracking.
//!
//! Every trapped access the mediator services runs between [`enter`] and [`exit`] on the core
//! that took the trap. While a core is inside, virtual interrupts for the privileged domain must
//! not be injected on it; they are deferred and delivered from the exit hook once the outermost
//! region has been left.
//!
//! A thread stands in for a pinned physical core: thread-local state cannot migrate mid-region,
//! which is the property disabling preemption gives the kernel.

use std::cell::Cell;
use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

static NEXT_CORE_ID: AtomicU32 = AtomicU32::new(0);

thread_local! {
    static CORE_ID: CoreId = CoreId(NEXT_CORE_ID.fetch_add(1, Ordering::Relaxed));
    static DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Identity of the executing core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoreId(u32);

impl CoreId {
    pub fn current() -> Self {
        CORE_ID.with(|id| *id)
    }

    pub fn index(self) -> u32 {
        self.0
    }
}

/// Called synchronously after every [`exit`], with the counter already decremented.
pub trait DeferredIrqHook {
    fn on_exit(&self, core: CoreId);
}

/// Hook for contexts with nothing to deliver.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoDeferredIrq;

impl DeferredIrqHook for NoDeferredIrq {
    fn on_exit(&self, _core: CoreId) {}
}

/// Nesting depth on the current core.
pub fn depth() -> u32 {
    DEPTH.with(Cell::get)
}

pub fn in_mediator() -> bool {
    depth() > 0
}

/// Marks the current core as executing mediator code. Nests.
pub fn enter() -> CoreId {
    DEPTH.with(|depth| depth.set(depth.get() + 1));
    CoreId::current()
}

/// Leaves one level of mediator code on `core`, then runs `hook` exactly once.
///
/// An exit without a matching [`enter`] leaves the counter at zero.
pub fn exit(core: CoreId, hook: &dyn DeferredIrqHook) {
    debug_assert_eq!(core, CoreId::current(), "reentrancy exit on a different core");

    DEPTH.with(|depth| match depth.get().checked_sub(1) {
        Some(next) => depth.set(next),
        None => tracing::error!(core = core.index(), "unbalanced reentrancy exit"),
    });
    hook.on_exit(core);
}

/// RAII region of mediator execution on the current core.
///
/// Dropping the guard (normal return, `?`, or unwinding) performs the matching [`exit`].
#[must_use = "the region ends when the guard is dropped"]
pub struct ReentrancyGuard<'a> {
    core: CoreId,
    hook: &'a dyn DeferredIrqHook,
    // Tied to the core it was created on.
    _not_send: PhantomData<*const ()>,
}

impl<'a> ReentrancyGuard<'a> {
    pub fn enter(hook: &'a dyn DeferredIrqHook) -> Self {
        Self {
            core: enter(),
            hook,
            _not_send: PhantomData,
        }
    }

    pub fn core(&self) -> CoreId {
        self.core
    }
}

impl Drop for ReentrancyGuard<'_> {
    fn drop(&mut self) {
        exit(self.core, self.hook);
    }
}

impl core::fmt::Debug for ReentrancyGuard<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReentrancyGuard")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

/// Delivers a virtual interrupt to the privileged domain on a given core.
pub trait VirqDelivery {
    fn inject(&self, core: CoreId);
}

impl<F: Fn(CoreId)> VirqDelivery for F {
    fn inject(&self, core: CoreId) {
        self(core)
    }
}

/// Decides whether a virtual interrupt can go out now or has to wait for the current core to
/// leave the mediator.
pub struct DeferredVirqInjector<D> {
    delivery: D,
    pending: Mutex<HashSet<CoreId>>,
}

impl<D: VirqDelivery> DeferredVirqInjector<D> {
    pub fn new(delivery: D) -> Self {
        Self {
            delivery,
            pending: Mutex::new(HashSet::new()),
        }
    }

    pub fn delivery(&self) -> &D {
        &self.delivery
    }

    /// Requests an injection on the current core. Returns `true` if it was delivered immediately.
    pub fn request_injection(&self) -> bool {
        let core = CoreId::current();
        if in_mediator() {
            self.pending_set().insert(core);
            tracing::trace!(core = core.index(), "virq deferred until mediator exit");
            false
        } else {
            self.delivery.inject(core);
            true
        }
    }

    pub fn is_pending(&self, core: CoreId) -> bool {
        self.pending_set().contains(&core)
    }

    fn pending_set(&self) -> std::sync::MutexGuard<'_, HashSet<CoreId>> {
        self.pending
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

impl<D: VirqDelivery> DeferredIrqHook for DeferredVirqInjector<D> {
    fn on_exit(&self, core: CoreId) {
        if in_mediator() {
            return;
        }
        let was_pending = self.pending_set().remove(&core);
        if was_pending {
            self.delivery.inject(core);
        }
    }
}

impl<D> core::fmt::Debug for DeferredVirqInjector<D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeferredVirqInjector").finish_non_exhaustive()
    }
}
