#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use anyhow::{bail, ensure, Context, Result};
use vgt::mediator::{
    EmulationBackend, EmulationDispatcher, GuestDoorbell, Mediator, Requester, VgtInstance,
};
use vgt::protocol::{
    pvinfo_off, AvailableResources, G2vNotification, GmadrRange, PvInfoField, V2gNotification,
    VGT_MAGIC, VGT_NOTIFY_EMPTY, VGT_PVINFO_PAGE, VGT_VERSION_MAJOR, VGT_VERSION_MINOR,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Doorbell that queues guest signals for the test to hand to the mediator.
#[derive(Default)]
pub struct QueuedDoorbell {
    pending: Mutex<Vec<PvInfoField>>,
}

impl QueuedDoorbell {
    pub fn drain(&self) -> Vec<PvInfoField> {
        std::mem::take(&mut *self.pending.lock().unwrap())
    }

    /// Delivers every queued signal for `id` to `mediator`.
    pub fn pump(&self, mediator: &Mediator, id: u32) -> vgt::mediator::Result<()> {
        for field in self.drain() {
            mediator.handle_guest_signal(id, field)?;
        }
        Ok(())
    }
}

impl GuestDoorbell for QueuedDoorbell {
    fn guest_signal(&self, field: PvInfoField) {
        self.pending.lock().unwrap().push(field);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendEvent {
    Write(u64),
    Suspend,
    Resume,
    HostReset,
    Teardown,
    Notification(G2vNotification),
}

/// Register backend that accepts everything and records what happened to it.
#[derive(Clone, Default)]
pub struct RecordingBackend {
    pub events: Arc<Mutex<Vec<BackendEvent>>>,
}

impl RecordingBackend {
    pub fn events(&self) -> Vec<BackendEvent> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: BackendEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl EmulationBackend for RecordingBackend {
    fn mem_read(&self, _offset: u64, buf: &mut [u8]) -> bool {
        buf.fill(0);
        true
    }

    fn mem_write(&self, offset: u64, _data: &[u8]) -> bool {
        self.push(BackendEvent::Write(offset));
        true
    }

    fn cfg_read(&self, _offset: u16, buf: &mut [u8]) -> bool {
        buf.fill(0);
        true
    }

    fn cfg_write(&self, _offset: u16, _data: &[u8]) -> bool {
        true
    }

    fn suspend(&self) {
        self.push(BackendEvent::Suspend);
    }

    fn resume(&self) {
        self.push(BackendEvent::Resume);
    }

    fn host_reset(&self) {
        self.push(BackendEvent::HostReset);
    }

    fn teardown(&self) {
        self.push(BackendEvent::Teardown);
    }

    fn guest_notification(&self, event: G2vNotification) {
        self.push(BackendEvent::Notification(event));
    }
}

/// A guest driver that only sees its device through trapped MMIO.
pub struct GuestDriver {
    instance: Arc<VgtInstance>,
}

impl GuestDriver {
    pub fn new(instance: Arc<VgtInstance>) -> Self {
        Self { instance }
    }

    fn dispatcher(&self) -> &EmulationDispatcher {
        self.instance.dispatcher()
    }

    fn pvinfo(&self, off: usize) -> u64 {
        self.dispatcher().mmio_base() + VGT_PVINFO_PAGE + off as u64
    }

    pub fn read_u32(&self, off: usize) -> Result<u32> {
        let mut buf = [0u8; 4];
        if !self
            .dispatcher()
            .memory_read(Requester::Guest, self.pvinfo(off), &mut buf)
        {
            bail!("PVINFO read at {off:#x} failed");
        }
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64(&self, off: usize) -> Result<u64> {
        let mut buf = [0u8; 8];
        if !self
            .dispatcher()
            .memory_read(Requester::Guest, self.pvinfo(off), &mut buf)
        {
            bail!("PVINFO read at {off:#x} failed");
        }
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_u32(&self, off: usize, value: u32) -> Result<()> {
        if !self
            .dispatcher()
            .memory_write(Requester::Guest, self.pvinfo(off), &value.to_le_bytes())
        {
            bail!("PVINFO write at {off:#x} failed");
        }
        Ok(())
    }

    /// Confirms it is running on a vGT mediator with a compatible major version.
    pub fn detect(&self) -> Result<u32> {
        let magic = self.read_u64(pvinfo_off::MAGIC).context("reading magic")?;
        ensure!(magic == VGT_MAGIC, "not a vGT device: magic {magic:#x}");
        let version = self.read_u32(pvinfo_off::VERSION_MAJOR)?;
        ensure!(
            version as u16 == VGT_VERSION_MAJOR,
            "unsupported vGT major version {}",
            version as u16
        );
        self.read_u32(pvinfo_off::VGT_ID)
    }

    pub fn available_resources(&self) -> Result<AvailableResources> {
        Ok(AvailableResources {
            low_gmadr: GmadrRange::new(
                self.read_u32(pvinfo_off::LOW_GMADR_BASE)?,
                self.read_u32(pvinfo_off::LOW_GMADR_SIZE)?,
            ),
            high_gmadr: GmadrRange::new(
                self.read_u32(pvinfo_off::HIGH_GMADR_BASE)?,
                self.read_u32(pvinfo_off::HIGH_GMADR_SIZE)?,
            ),
            fence_num: self.read_u32(pvinfo_off::FENCE_NUM)?,
        })
    }

    /// Probe-time handshake, all through MMIO. Returns whether the allocation was sufficient.
    pub fn probe(
        &self,
        min_low_gmadr: u32,
        min_high_gmadr: u32,
        min_fence_num: u32,
    ) -> Result<bool> {
        self.detect()?;
        let version = u32::from(VGT_VERSION_MAJOR) | (u32::from(VGT_VERSION_MINOR) << 16);
        self.write_u32(pvinfo_off::DRV_VERSION_MAJOR, version)?;

        let req = vgt::protocol::ResourceRequest::against(
            &self.available_resources()?,
            min_low_gmadr,
            min_high_gmadr,
            min_fence_num,
        );
        self.write_u32(pvinfo_off::MIN_LOW_GMADR, req.min_low_gmadr)?;
        self.write_u32(pvinfo_off::MIN_HIGH_GMADR, req.min_high_gmadr)?;
        self.write_u32(pvinfo_off::MIN_FENCE_NUM, req.min_fence_num)?;
        self.write_u32(pvinfo_off::RS_INSUFFICIENT, req.shortfall.bits())?;
        Ok(req.is_accepted())
    }

    pub fn notify(&self, event: G2vNotification) -> Result<()> {
        self.write_u32(pvinfo_off::G2V_NOTIFY, event as u32)
    }

    /// Takes the mediator's pending notification, if any, and clears the slot.
    pub fn take_notification(&self) -> Result<Option<V2gNotification>> {
        let raw = self.read_u32(pvinfo_off::V2G_NOTIFY)?;
        if raw == VGT_NOTIFY_EMPTY {
            return Ok(None);
        }
        self.write_u32(pvinfo_off::V2G_NOTIFY, VGT_NOTIFY_EMPTY)?;
        Ok(match raw {
            0 => Some(V2gNotification::SetHwCursor),
            1 => Some(V2gNotification::SetSwCursor),
            other => bail!("unknown v2g notification {other}"),
        })
    }
}
