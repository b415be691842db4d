//! Attach/detach and power lifecycle of mediated guests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use vgt_protocol::{
    AvailableResources, G2vNotification, IgdGeneration, Mailbox, PlatformKind,
    PlatformProbe, PvInfoField, ResourceRequest, ResourceShortfall, V2gNotification,
};
use vgt_shared::{Doorbell, SharedControlPage};

use crate::config::MediatorConfig;
use crate::delayed::DelayedEventRegistry;
use crate::dispatch::{EmulationBackend, EmulationDispatcher, NativeAccess, RegistrationState};
use crate::error::{LifecycleError, NegotiationError, Result};
use crate::negotiate::{NegotiationState, ResourceNegotiator, ResourcePool};
use crate::pvinfo_mmio::{GuestDoorbell, PvInfoMmio};
use crate::reentrancy::{DeferredIrqHook, ReentrancyGuard};

/// One attached guest: its page, its dispatcher and its negotiation.
pub struct VgtInstance {
    id: u32,
    page: Arc<SharedControlPage>,
    dispatcher: EmulationDispatcher,
    negotiator: Mutex<ResourceNegotiator>,
}

impl VgtInstance {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn page(&self) -> &Arc<SharedControlPage> {
        &self.page
    }

    /// Trap entry point for this guest's device.
    pub fn dispatcher(&self) -> &EmulationDispatcher {
        &self.dispatcher
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        self.negotiator().state()
    }

    fn negotiator(&self) -> MutexGuard<'_, ResourceNegotiator> {
        self.negotiator
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

impl core::fmt::Debug for VgtInstance {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VgtInstance")
            .field("id", &self.id)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

/// Opaque host cookie parked in the delayed-event registry.
pub type DelayedPayload = u64;

pub struct Mediator {
    config: MediatorConfig,
    generation: IgdGeneration,
    platform: PlatformKind,
    native: Arc<dyn NativeAccess>,
    hook: Arc<dyn DeferredIrqHook + Send + Sync>,
    pool: Mutex<Box<dyn ResourcePool + Send>>,
    instances: Mutex<BTreeMap<u32, Arc<VgtInstance>>>,
    delayed: DelayedEventRegistry<DelayedPayload>,
}

impl Mediator {
    pub fn new(
        config: MediatorConfig,
        generation: IgdGeneration,
        probe: &dyn PlatformProbe,
        native: Arc<dyn NativeAccess>,
        hook: Arc<dyn DeferredIrqHook + Send + Sync>,
        pool: Box<dyn ResourcePool + Send>,
    ) -> Result<Self> {
        if !generation.is_supported() {
            return Err(LifecycleError::UnsupportedGeneration(generation).into());
        }
        let platform = probe.guest_platform();
        tracing::info!(?generation, ?platform, "vGT mediator initialised");

        Ok(Self {
            config,
            generation,
            platform,
            native,
            hook,
            pool: Mutex::new(pool),
            instances: Mutex::new(BTreeMap::new()),
            delayed: DelayedEventRegistry::new(),
        })
    }

    pub fn config(&self) -> &MediatorConfig {
        &self.config
    }

    pub fn generation(&self) -> IgdGeneration {
        self.generation
    }

    pub fn platform(&self) -> PlatformKind {
        self.platform
    }

    pub fn delayed_events(&self) -> &DelayedEventRegistry<DelayedPayload> {
        &self.delayed
    }

    pub fn instance(&self, id: u32) -> Option<Arc<VgtInstance>> {
        self.instances().get(&id).cloned()
    }

    pub fn instance_ids(&self) -> Vec<u32> {
        self.instances().keys().copied().collect()
    }

    /// Attaches guest `id` with its device registers mapped at `mmio_base`.
    ///
    /// The page is allocated, populated and given the initial allocation before the device goes
    /// active, so the guest's first trapped read already sees a valid page. Guest writes that
    /// publish something on the page ring `doorbell`.
    pub fn start<B: EmulationBackend + 'static>(
        &self,
        id: u32,
        mmio_base: u64,
        backend: B,
        doorbell: Arc<dyn GuestDoorbell>,
    ) -> Result<Arc<VgtInstance>> {
        if self.instances().contains_key(&id) {
            return Err(LifecycleError::AlreadyAttached(id).into());
        }

        let _guard = ReentrancyGuard::enter(self.hook());

        let initial = self.grant_initial()?;
        let page = Arc::new(SharedControlPage::new());
        page.mediator().populate(id);
        let mut negotiator = ResourceNegotiator::new(self.config.negotiator, initial);
        negotiator.publish(&page);
        if let Err(err) = page.validate() {
            self.pool().release(&initial);
            return Err(err.into());
        }

        let dispatcher = EmulationDispatcher::new(
            mmio_base,
            self.config.mmio_size,
            self.native.clone(),
            self.hook.clone(),
        );
        dispatcher.end_boot_time();
        dispatcher.register(Arc::new(PvInfoMmio::new(page.clone(), doorbell, backend)));

        let instance = Arc::new(VgtInstance {
            id,
            page,
            dispatcher,
            negotiator: Mutex::new(negotiator),
        });

        let mut instances = self.instances();
        if instances.contains_key(&id) {
            instance.dispatcher.unregister();
            self.pool().release(&initial);
            return Err(LifecycleError::AlreadyAttached(id).into());
        }
        instances.insert(id, instance.clone());
        tracing::info!(vgt_id = id, mmio_base, "vGT instance attached");
        Ok(instance)
    }

    /// Detaches guest `id`: accesses fail closed from here on, the backend is torn down and its
    /// resources go back to the pool.
    pub fn detach(&self, id: u32) -> Result<()> {
        let instance = self
            .instances()
            .remove(&id)
            .ok_or(LifecycleError::UnknownInstance(id))?;

        let _guard = ReentrancyGuard::enter(self.hook());
        if let Some(backend) = instance.dispatcher.unregister() {
            backend.teardown();
        }
        // Same lock order as a negotiation round, which may still hold a clone of the instance.
        let mut pool = self.pool();
        let allocation = instance.negotiator().retire();
        pool.release(&allocation);
        drop(pool);
        tracing::info!(vgt_id = id, "vGT instance detached");
        Ok(())
    }

    /// Suspends every active instance: the dispatcher stops accepting accesses before the backend
    /// is told to save state.
    pub fn suspend(&self) {
        let _guard = ReentrancyGuard::enter(self.hook());
        for instance in self.snapshot() {
            if let Some(backend) = instance.dispatcher.suspend() {
                backend.suspend();
                tracing::debug!(vgt_id = instance.id, "vGT instance suspended");
            }
        }
    }

    /// Reverse of [`Self::suspend`]: backends restore state before accesses are accepted again.
    pub fn resume(&self) {
        let _guard = ReentrancyGuard::enter(self.hook());
        for instance in self.snapshot() {
            if instance.dispatcher.state() != RegistrationState::Suspended {
                continue;
            }
            if let Some(backend) = instance.dispatcher.backend() {
                backend.resume();
            }
            instance.dispatcher.resume();
            tracing::debug!(vgt_id = instance.id, "vGT instance resumed");
        }
    }

    /// The physical device was reset by the host. Every backend reinitialises and host accesses
    /// pass straight through until [`Self::end_boot_time`].
    pub fn host_device_reset(&self) {
        tracing::warn!("host device reset");
        for instance in self.snapshot() {
            let _guard = ReentrancyGuard::enter(self.hook());
            instance.dispatcher.begin_boot_time();
            if let Some(backend) = instance.dispatcher.backend() {
                backend.host_reset();
            }
        }
    }

    pub fn end_boot_time(&self) {
        for instance in self.snapshot() {
            instance.dispatcher.end_boot_time();
        }
    }

    /// Reacts to a guest doorbell for `field` on instance `id`.
    pub fn handle_guest_signal(&self, id: u32, field: PvInfoField) -> Result<()> {
        match field {
            PvInfoField::RsInsufficient => self.handle_resource_signal(id).map(|_| ()),
            PvInfoField::G2vNotify => self.handle_notification(id).map(|_| ()),
            _ => {
                tracing::debug!(vgt_id = id, ?field, "guest signal for non-signalling field");
                Ok(())
            }
        }
    }

    /// Runs one round of resource negotiation on the guest's latest answer.
    pub fn handle_resource_signal(&self, id: u32) -> Result<NegotiationState> {
        let instance = self.require(id)?;
        self.negotiate(&instance)
    }

    fn negotiate(&self, instance: &VgtInstance) -> Result<NegotiationState> {
        let _guard = ReentrancyGuard::enter(self.hook());

        if let Err(err) = instance.page.validate_driver() {
            tracing::warn!(vgt_id = instance.id, "rejecting guest driver: {err}");
            return Err(err.into());
        }

        let state = {
            let mut pool = self.pool();
            instance
                .negotiator()
                .handle_guest_signal(&mut **pool, &instance.page)
        };
        match state {
            NegotiationState::Failed(err) => Err(err.into()),
            NegotiationState::Detached => Err(LifecycleError::UnknownInstance(instance.id).into()),
            state => Ok(state),
        }
    }

    /// Consumes the guest's pending notification and hands it to the backend.
    ///
    /// The mailbox is always cleared; a suspended backend does not see the event.
    pub fn handle_notification(&self, id: u32) -> Result<Mailbox<G2vNotification>> {
        let instance = self.require(id)?;
        let _guard = ReentrancyGuard::enter(self.hook());

        let mailbox = instance.page.mediator().take_notification();
        match mailbox {
            Mailbox::Event(event) => match instance.dispatcher.state() {
                RegistrationState::Active => {
                    if let Some(backend) = instance.dispatcher.backend() {
                        backend.guest_notification(event);
                    }
                }
                state => {
                    tracing::debug!(vgt_id = id, ?event, ?state, "notification not delivered");
                }
            },
            Mailbox::Unknown(raw) => {
                tracing::warn!(vgt_id = id, raw, "unknown guest notification discarded");
            }
            Mailbox::Empty => {}
        }
        Ok(mailbox)
    }

    /// Posts `event` to guest `id` and rings `doorbell` once it is visible.
    pub fn notify_guest(
        &self,
        id: u32,
        event: V2gNotification,
        doorbell: &dyn Doorbell,
    ) -> Result<()> {
        let instance = self.require(id)?;
        let _guard = ReentrancyGuard::enter(self.hook());
        instance.page.mediator().post(event, doorbell);
        Ok(())
    }

    fn require(&self, id: u32) -> Result<Arc<VgtInstance>> {
        self.instance(id)
            .ok_or_else(|| LifecycleError::UnknownInstance(id).into())
    }

    fn grant_initial(&self) -> Result<AvailableResources> {
        let wanted = self.config.default_resources;
        self.pool().allocate(&wanted).ok_or_else(|| {
            NegotiationError::PoolExhausted {
                request: ResourceRequest {
                    shortfall: ResourceShortfall::all(),
                    min_low_gmadr: wanted.low_gmadr.size,
                    min_high_gmadr: wanted.high_gmadr.size,
                    min_fence_num: wanted.fence_num,
                },
            }
            .into()
        })
    }

    fn hook(&self) -> &(dyn DeferredIrqHook + Send + Sync) {
        &*self.hook
    }

    fn snapshot(&self) -> Vec<Arc<VgtInstance>> {
        self.instances().values().cloned().collect()
    }

    fn instances(&self) -> MutexGuard<'_, BTreeMap<u32, Arc<VgtInstance>>> {
        self.instances
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    fn pool(&self) -> MutexGuard<'_, Box<dyn ResourcePool + Send>> {
        self.pool.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

impl core::fmt::Debug for Mediator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Mediator")
            .field("generation", &self.generation)
            .field("platform", &self.platform)
            .field("instances", &self.instance_ids())
            .field("delayed", &self.delayed)
            .finish_non_exhaustive()
    }
}
