//! Routing of trapped device accesses to the emulation backend.
//!
//! One [`EmulationDispatcher`] exists per virtual device. Entry points are called concurrently
//! from whichever core took the trap; the dispatcher never holds a lock across a backend call and
//! backends take `&self`, serializing internally as needed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use vgt_protocol::G2vNotification;

use crate::error::DispatchError;
use crate::reentrancy::{DeferredIrqHook, ReentrancyGuard};

/// Size of a PCI configuration space header as seen by the guest.
pub const CONFIG_SPACE_SIZE: u64 = 256;

/// Who issued the trapped access.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Requester {
    /// The privileged host domain's own driver.
    Host,
    /// A mediated guest.
    Guest,
}

/// Device emulation for one virtual GPU.
///
/// Memory offsets are relative to the start of the device's mapped register range; config offsets
/// are relative to the start of config space. Accesses have already been validated for size and
/// bounds. A `false` return means the backend refused the access.
pub trait EmulationBackend: Send + Sync {
    fn mem_read(&self, offset: u64, buf: &mut [u8]) -> bool;
    fn mem_write(&self, offset: u64, data: &[u8]) -> bool;
    fn cfg_read(&self, offset: u16, buf: &mut [u8]) -> bool;
    fn cfg_write(&self, offset: u16, data: &[u8]) -> bool;

    fn suspend(&self) {}
    fn resume(&self) {}
    /// The physical device was reset underneath the mediator.
    fn host_reset(&self) {}
    /// Detach is in progress; no further accesses will arrive.
    fn teardown(&self) {}
    /// The guest posted a notification through the PVINFO page.
    fn guest_notification(&self, _event: G2vNotification) {}
}

/// Direct hardware access used while the host is still booting and nothing is mediated yet.
pub trait NativeAccess: Send + Sync {
    fn mem_read(&self, address: u64, buf: &mut [u8]) -> bool;
    fn mem_write(&self, address: u64, data: &[u8]) -> bool;
    fn cfg_read(&self, offset: u16, buf: &mut [u8]) -> bool;
    fn cfg_write(&self, offset: u16, data: &[u8]) -> bool;
}

/// Passthrough for platforms with no native path: every access fails.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoNativeAccess;

impl NativeAccess for NoNativeAccess {
    fn mem_read(&self, _address: u64, _buf: &mut [u8]) -> bool {
        false
    }

    fn mem_write(&self, _address: u64, _data: &[u8]) -> bool {
        false
    }

    fn cfg_read(&self, _offset: u16, _buf: &mut [u8]) -> bool {
        false
    }

    fn cfg_write(&self, _offset: u16, _data: &[u8]) -> bool {
        false
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegistrationState {
    Unregistered,
    Active,
    Suspended,
}

enum Slot {
    Unregistered,
    Active(Arc<dyn EmulationBackend>),
    Suspended(Arc<dyn EmulationBackend>),
}

impl Slot {
    fn state(&self) -> RegistrationState {
        match self {
            Slot::Unregistered => RegistrationState::Unregistered,
            Slot::Active(_) => RegistrationState::Active,
            Slot::Suspended(_) => RegistrationState::Suspended,
        }
    }
}

pub struct EmulationDispatcher {
    mmio_base: u64,
    mmio_size: u64,
    boot_time: AtomicBool,
    native: Arc<dyn NativeAccess>,
    hook: Arc<dyn DeferredIrqHook + Send + Sync>,
    slot: RwLock<Slot>,
}

impl EmulationDispatcher {
    /// A dispatcher for a device whose registers are mapped at `mmio_base..mmio_base+mmio_size`.
    ///
    /// Starts unregistered and in boot time.
    pub fn new(
        mmio_base: u64,
        mmio_size: u64,
        native: Arc<dyn NativeAccess>,
        hook: Arc<dyn DeferredIrqHook + Send + Sync>,
    ) -> Self {
        Self {
            mmio_base,
            mmio_size,
            boot_time: AtomicBool::new(true),
            native,
            hook,
            slot: RwLock::new(Slot::Unregistered),
        }
    }

    pub fn mmio_base(&self) -> u64 {
        self.mmio_base
    }

    pub fn mmio_size(&self) -> u64 {
        self.mmio_size
    }

    pub fn is_boot_time(&self) -> bool {
        self.boot_time.load(Ordering::Acquire)
    }

    /// Host accesses stop bypassing emulation.
    pub fn end_boot_time(&self) {
        if self.boot_time.swap(false, Ordering::AcqRel) {
            tracing::debug!("boot-time passthrough disabled");
        }
    }

    /// Host accesses go straight to hardware again until [`Self::end_boot_time`].
    pub fn begin_boot_time(&self) {
        if !self.boot_time.swap(true, Ordering::AcqRel) {
            tracing::debug!("boot-time passthrough enabled");
        }
    }

    pub fn state(&self) -> RegistrationState {
        self.read_slot().state()
    }

    /// Installs `backend` and makes the device active. Returns the backend it replaced.
    pub fn register(
        &self,
        backend: Arc<dyn EmulationBackend>,
    ) -> Option<Arc<dyn EmulationBackend>> {
        let prev = std::mem::replace(&mut *self.write_slot(), Slot::Active(backend));
        match prev {
            Slot::Unregistered => None,
            Slot::Active(prev) | Slot::Suspended(prev) => Some(prev),
        }
    }

    /// Fails all subsequent accesses closed. Returns the backend that was installed.
    pub fn unregister(&self) -> Option<Arc<dyn EmulationBackend>> {
        let prev = std::mem::replace(&mut *self.write_slot(), Slot::Unregistered);
        match prev {
            Slot::Unregistered => None,
            Slot::Active(prev) | Slot::Suspended(prev) => Some(prev),
        }
    }

    /// Active → Suspended. Returns the backend if the transition happened.
    pub fn suspend(&self) -> Option<Arc<dyn EmulationBackend>> {
        let mut slot = self.write_slot();
        let backend = match &*slot {
            Slot::Active(backend) => backend.clone(),
            _ => return None,
        };
        *slot = Slot::Suspended(backend.clone());
        Some(backend)
    }

    /// Suspended → Active. Returns the backend if the transition happened.
    pub fn resume(&self) -> Option<Arc<dyn EmulationBackend>> {
        let mut slot = self.write_slot();
        let backend = match &*slot {
            Slot::Suspended(backend) => backend.clone(),
            _ => return None,
        };
        *slot = Slot::Active(backend.clone());
        Some(backend)
    }

    /// The installed backend regardless of state.
    pub fn backend(&self) -> Option<Arc<dyn EmulationBackend>> {
        match &*self.read_slot() {
            Slot::Unregistered => None,
            Slot::Active(backend) | Slot::Suspended(backend) => Some(backend.clone()),
        }
    }

    pub fn hook(&self) -> &(dyn DeferredIrqHook + Send + Sync) {
        &*self.hook
    }

    pub fn memory_read(&self, requester: Requester, address: u64, buf: &mut [u8]) -> bool {
        self.try_memory_read(requester, address, buf).is_ok()
    }

    pub fn memory_write(&self, requester: Requester, address: u64, data: &[u8]) -> bool {
        self.try_memory_write(requester, address, data).is_ok()
    }

    pub fn config_read(&self, requester: Requester, offset: u64, buf: &mut [u8]) -> bool {
        self.try_config_read(requester, offset, buf).is_ok()
    }

    pub fn config_write(&self, requester: Requester, offset: u64, data: &[u8]) -> bool {
        self.try_config_write(requester, offset, data).is_ok()
    }

    pub fn try_memory_read(
        &self,
        requester: Requester,
        address: u64,
        buf: &mut [u8],
    ) -> Result<(), DispatchError> {
        if self.passthrough(requester) {
            return access_result(self.native.mem_read(address, buf), address, buf.len());
        }
        let backend = self.active_backend()?;
        let offset = self.check_memory("mem_read", address, buf.len())?;
        let _guard = ReentrancyGuard::enter(self.hook());
        access_result(backend.mem_read(offset, buf), address, buf.len())
    }

    pub fn try_memory_write(
        &self,
        requester: Requester,
        address: u64,
        data: &[u8],
    ) -> Result<(), DispatchError> {
        if self.passthrough(requester) {
            return access_result(self.native.mem_write(address, data), address, data.len());
        }
        let backend = self.active_backend()?;
        let offset = self.check_memory("mem_write", address, data.len())?;
        let _guard = ReentrancyGuard::enter(self.hook());
        access_result(backend.mem_write(offset, data), address, data.len())
    }

    pub fn try_config_read(
        &self,
        requester: Requester,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), DispatchError> {
        if self.passthrough(requester) {
            let ok = u16::try_from(offset).is_ok_and(|cfg| self.native.cfg_read(cfg, buf));
            return access_result(ok, offset, buf.len());
        }
        let backend = self.active_backend()?;
        let cfg = check_config("cfg_read", offset, buf.len())?;
        let _guard = ReentrancyGuard::enter(self.hook());
        access_result(backend.cfg_read(cfg, buf), offset, buf.len())
    }

    pub fn try_config_write(
        &self,
        requester: Requester,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DispatchError> {
        if self.passthrough(requester) {
            let ok = u16::try_from(offset).is_ok_and(|cfg| self.native.cfg_write(cfg, data));
            return access_result(ok, offset, data.len());
        }
        let backend = self.active_backend()?;
        let cfg = check_config("cfg_write", offset, data.len())?;
        let _guard = ReentrancyGuard::enter(self.hook());
        access_result(backend.cfg_write(cfg, data), offset, data.len())
    }

    fn passthrough(&self, requester: Requester) -> bool {
        requester == Requester::Host && self.is_boot_time()
    }

    fn active_backend(&self) -> Result<Arc<dyn EmulationBackend>, DispatchError> {
        match &*self.read_slot() {
            Slot::Active(backend) => Ok(backend.clone()),
            _ => Err(DispatchError::NotInitialized),
        }
    }

    fn check_memory(
        &self,
        kind: &'static str,
        address: u64,
        len: usize,
    ) -> Result<u64, DispatchError> {
        let unsupported = DispatchError::UnsupportedAccess { address, len };
        if !valid_access_size(len) {
            tracing::debug!(address, len, kind, "unsupported access size");
            return Err(unsupported);
        }
        let offset = address.checked_sub(self.mmio_base).ok_or(unsupported)?;
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.mmio_size => Ok(offset),
            _ => {
                tracing::debug!(address, len, kind, "access outside device range");
                Err(unsupported)
            }
        }
    }

    fn read_slot(&self) -> RwLockReadGuard<'_, Slot> {
        self.slot.read().unwrap_or_else(|poison| poison.into_inner())
    }

    fn write_slot(&self) -> RwLockWriteGuard<'_, Slot> {
        self.slot.write().unwrap_or_else(|poison| poison.into_inner())
    }
}

impl core::fmt::Debug for EmulationDispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EmulationDispatcher")
            .field("mmio_base", &format_args!("{:#x}", self.mmio_base))
            .field("mmio_size", &format_args!("{:#x}", self.mmio_size))
            .field("boot_time", &self.is_boot_time())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Register accesses are naturally sized: 1, 2, 4 or 8 bytes.
pub fn valid_access_size(len: usize) -> bool {
    matches!(len, 1 | 2 | 4 | 8)
}

fn check_config(kind: &'static str, offset: u64, len: usize) -> Result<u16, DispatchError> {
    let unsupported = DispatchError::UnsupportedAccess {
        address: offset,
        len,
    };
    if !valid_access_size(len) {
        tracing::debug!(offset, len, kind, "unsupported access size");
        return Err(unsupported);
    }
    match offset.checked_add(len as u64) {
        Some(end) if end <= CONFIG_SPACE_SIZE => Ok(offset as u16),
        _ => {
            tracing::debug!(offset, len, kind, "access outside config space");
            Err(unsupported)
        }
    }
}

fn access_result(ok: bool, address: u64, len: usize) -> Result<(), DispatchError> {
    if ok {
        Ok(())
    } else {
        Err(DispatchError::UnsupportedAccess { address, len })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::reentrancy::{depth, NoDeferredIrq};
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    const BASE: u64 = 0xF000_0000;
    const SIZE: u64 = 0x10_0000;

    #[derive(Default)]
    struct RecordingBackend {
        calls: AtomicU32,
        depth_seen: AtomicU32,
        last_offset: Mutex<Option<u64>>,
    }

    impl RecordingBackend {
        fn record(&self, offset: u64) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.depth_seen.store(depth(), Ordering::SeqCst);
            *self.last_offset.lock().unwrap() = Some(offset);
            true
        }
    }

    impl EmulationBackend for RecordingBackend {
        fn mem_read(&self, offset: u64, buf: &mut [u8]) -> bool {
            buf.fill(0xAB);
            self.record(offset)
        }

        fn mem_write(&self, offset: u64, _data: &[u8]) -> bool {
            self.record(offset)
        }

        fn cfg_read(&self, offset: u16, buf: &mut [u8]) -> bool {
            buf.fill(0xCD);
            self.record(u64::from(offset))
        }

        fn cfg_write(&self, offset: u16, _data: &[u8]) -> bool {
            self.record(u64::from(offset))
        }
    }

    #[derive(Default)]
    struct CountingNative {
        calls: AtomicU32,
    }

    impl NativeAccess for CountingNative {
        fn mem_read(&self, _address: u64, buf: &mut [u8]) -> bool {
            buf.fill(0x11);
            self.calls.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn mem_write(&self, _address: u64, _data: &[u8]) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn cfg_read(&self, _offset: u16, _buf: &mut [u8]) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn cfg_write(&self, _offset: u16, _data: &[u8]) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn dispatcher(native: Arc<CountingNative>) -> EmulationDispatcher {
        EmulationDispatcher::new(BASE, SIZE, native, Arc::new(NoDeferredIrq))
    }

    #[test]
    fn unregistered_device_fails_closed() {
        let d = dispatcher(Arc::default());
        d.end_boot_time();
        let mut buf = [0u8; 4];
        assert_eq!(
            d.try_memory_read(Requester::Guest, BASE, &mut buf),
            Err(DispatchError::NotInitialized)
        );
        assert!(!d.config_write(Requester::Host, 0x10, &[0; 4]));
    }

    #[test]
    fn host_access_bypasses_emulation_during_boot_time() {
        let native = Arc::new(CountingNative::default());
        let backend = Arc::new(RecordingBackend::default());
        let d = dispatcher(native.clone());
        d.register(backend.clone());

        let mut buf = [0u8; 4];
        assert!(d.memory_read(Requester::Host, BASE + 4, &mut buf));
        assert_eq!(buf, [0x11; 4]);
        assert_eq!(native.calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);

        // Guests are always mediated.
        assert!(d.memory_read(Requester::Guest, BASE + 4, &mut buf));
        assert_eq!(buf, [0xAB; 4]);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        d.end_boot_time();
        assert!(d.memory_write(Requester::Host, BASE + 8, &[1, 2]));
        assert_eq!(native.calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        assert_eq!(*backend.last_offset.lock().unwrap(), Some(8));
    }

    #[test]
    fn access_sizes_and_ranges_are_validated() {
        let backend = Arc::new(RecordingBackend::default());
        let d = dispatcher(Arc::default());
        d.end_boot_time();
        d.register(backend.clone());

        for len in [0usize, 3, 5, 16] {
            let mut buf = vec![0u8; len];
            assert_eq!(
                d.try_memory_read(Requester::Guest, BASE, &mut buf),
                Err(DispatchError::UnsupportedAccess { address: BASE, len })
            );
        }
        assert!(!d.memory_write(Requester::Guest, BASE - 4, &[0; 4]));
        assert!(!d.memory_write(Requester::Guest, BASE + SIZE - 2, &[0; 4]));
        assert!(d.memory_write(Requester::Guest, BASE + SIZE - 8, &[0; 8]));

        let mut cfg = [0u8; 4];
        assert!(d.config_read(Requester::Guest, 0xFC, &mut cfg));
        assert_eq!(cfg, [0xCD; 4]);
        assert!(!d.config_read(Requester::Guest, 0xFE, &mut cfg));
        assert!(!d.config_read(Requester::Guest, u64::MAX, &mut cfg));

        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn suspended_device_fails_closed_until_resumed() {
        let backend = Arc::new(RecordingBackend::default());
        let d = dispatcher(Arc::default());
        d.end_boot_time();
        d.register(backend.clone());

        assert!(d.suspend().is_some());
        assert!(d.suspend().is_none());
        assert_eq!(d.state(), RegistrationState::Suspended);
        assert_eq!(
            d.try_memory_write(Requester::Guest, BASE, &[0; 4]),
            Err(DispatchError::NotInitialized)
        );

        assert!(d.resume().is_some());
        assert_eq!(d.state(), RegistrationState::Active);
        assert!(d.memory_write(Requester::Guest, BASE, &[0; 4]));

        assert!(d.unregister().is_some());
        assert_eq!(d.state(), RegistrationState::Unregistered);
        assert!(d.resume().is_none());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backend_runs_inside_reentrancy_region() {
        let backend = Arc::new(RecordingBackend::default());
        let d = dispatcher(Arc::default());
        d.end_boot_time();
        d.register(backend.clone());

        assert!(d.memory_write(Requester::Guest, BASE, &[0; 4]));
        assert_eq!(backend.depth_seen.load(Ordering::SeqCst), 1);
        assert_eq!(depth(), 0);
    }
}
