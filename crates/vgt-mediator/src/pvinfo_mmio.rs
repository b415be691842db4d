use std::sync::Arc;

use vgt_protocol::{G2vNotification, PvInfoField, VGT_PVINFO_PAGE, VGT_PVINFO_SIZE};
use vgt_shared::SharedControlPage;

use crate::dispatch::EmulationBackend;

/// Mediator-side reaction to a guest write that publishes something on the PVINFO page.
///
/// Rung after the write is visible on the page, with the field that was written:
/// [`PvInfoField::G2vNotify`] for a notification, [`PvInfoField::RsInsufficient`] for a resource
/// response.
pub trait GuestDoorbell: Send + Sync {
    fn guest_signal(&self, field: PvInfoField);
}

/// Serves the PVINFO window of the register BAR from the shared page and forwards every other
/// access to `B`.
pub struct PvInfoMmio<B> {
    page: Arc<SharedControlPage>,
    doorbell: Arc<dyn GuestDoorbell>,
    inner: B,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Window {
    PvInfo(usize),
    Outside,
    Straddles,
}

fn classify(offset: u64, len: usize) -> Window {
    let start = VGT_PVINFO_PAGE;
    let end = VGT_PVINFO_PAGE + VGT_PVINFO_SIZE as u64;
    let access_end = offset.saturating_add(len as u64);
    if offset >= start && access_end <= end {
        Window::PvInfo((offset - start) as usize)
    } else if access_end <= start || offset >= end {
        Window::Outside
    } else {
        Window::Straddles
    }
}

fn touches(field: PvInfoField, offset: usize, len: usize) -> bool {
    offset < field.offset() + field.size() && field.offset() < offset + len
}

impl<B: EmulationBackend> PvInfoMmio<B> {
    pub fn new(page: Arc<SharedControlPage>, doorbell: Arc<dyn GuestDoorbell>, inner: B) -> Self {
        Self {
            page,
            doorbell,
            inner,
        }
    }

    pub fn page(&self) -> &Arc<SharedControlPage> {
        &self.page
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }
}

impl<B: EmulationBackend> EmulationBackend for PvInfoMmio<B> {
    fn mem_read(&self, offset: u64, buf: &mut [u8]) -> bool {
        match classify(offset, buf.len()) {
            Window::PvInfo(page_off) => self.page.read_bytes(page_off, buf).is_ok(),
            Window::Outside => self.inner.mem_read(offset, buf),
            Window::Straddles => false,
        }
    }

    fn mem_write(&self, offset: u64, data: &[u8]) -> bool {
        let page_off = match classify(offset, data.len()) {
            Window::PvInfo(page_off) => page_off,
            Window::Outside => return self.inner.mem_write(offset, data),
            Window::Straddles => return false,
        };

        if let Err(err) = self.page.guest_write_bytes(page_off, data) {
            tracing::warn!(offset = page_off, len = data.len(), "dropped PVINFO write: {err}");
            return false;
        }

        for field in [PvInfoField::G2vNotify, PvInfoField::RsInsufficient] {
            if touches(field, page_off, data.len()) {
                self.doorbell.guest_signal(field);
            }
        }
        true
    }

    fn cfg_read(&self, offset: u16, buf: &mut [u8]) -> bool {
        self.inner.cfg_read(offset, buf)
    }

    fn cfg_write(&self, offset: u16, data: &[u8]) -> bool {
        self.inner.cfg_write(offset, data)
    }

    fn suspend(&self) {
        self.inner.suspend()
    }

    fn resume(&self) {
        self.inner.resume()
    }

    fn host_reset(&self) {
        self.inner.host_reset()
    }

    fn teardown(&self) {
        self.inner.teardown()
    }

    fn guest_notification(&self, event: G2vNotification) {
        self.inner.guest_notification(event)
    }
}
