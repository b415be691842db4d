//! Live PVINFO page shared between the mediator and one guest.
//!
//! The page is stored as 1024 little-endian 32-bit words so it can be backed by memory both sides
//! map, using atomic operations only. Each side gets a typed view ([`MediatorSide`],
//! [`GuestSide`]) that can only write its own half of the page; reads are available to both.
//!
//! Mailbox protocol (one slot per direction, last write wins):
//! 1) Producer stores the event with `Release`.
//! 2) A `SeqCst` fence orders that store before the out-of-band signal.
//! 3) Producer rings the [`Doorbell`].
//! 4) Consumer swaps the slot back to empty (`AcqRel`) and processes what it took.

#[cfg(all(feature = "loom", test))]
use loom::sync::atomic::{fence, AtomicU32};
#[cfg(not(all(feature = "loom", test)))]
use std::sync::atomic::{fence, AtomicU32};

use std::sync::atomic::Ordering;

use thiserror::Error;
use vgt_protocol::pvinfo::pvinfo_off as off;
use vgt_protocol::{
    validate_header, AvailableResources, DisplayReady, FieldOwner, G2vNotification, GmadrRange,
    Mailbox, MailboxEvent, ProtocolError, PvInfoField, ResourceRequest, ResourceShortfall,
    V2gNotification, VgtIf, VGT_MAGIC, VGT_NOTIFY_EMPTY, VGT_PVINFO_SIZE, VGT_VERSION_MAJOR,
    VGT_VERSION_MINOR,
};

/// Number of 32-bit words in the page.
pub const CONTROL_PAGE_WORDS: usize = VGT_PVINFO_SIZE / 4;

/// Out-of-band "something changed" signal towards the other side (doorbell write, trap, event
/// channel). Delivery mechanics are not ours; only the ordering with respect to the mailbox is.
pub trait Doorbell {
    fn ring(&self);
}

impl<F: Fn()> Doorbell for F {
    fn ring(&self) {
        self()
    }
}

/// A trapped byte access to the page that the contract does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PageAccessError {
    #[error("access at {offset:#x}+{len} is outside the PVINFO page")]
    OutOfRange { offset: usize, len: usize },

    #[error("guest write to {field:?} at {offset:#x}: field belongs to the mediator")]
    WriterViolation { offset: usize, field: PvInfoField },

    #[error("guest write to reserved PVINFO space at {offset:#x}")]
    Reserved { offset: usize },

    #[error("guest write to v2g_notify must be a full-word write of the empty sentinel")]
    InvalidMailboxClear,
}

pub struct SharedControlPage {
    words: Box<[AtomicU32]>,
}

const fn word(offset: usize) -> usize {
    offset / 4
}

impl SharedControlPage {
    /// A zero-filled page, as allocated at attach time. Not valid until populated.
    pub fn new() -> Self {
        Self {
            words: (0..CONTROL_PAGE_WORDS).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    pub fn mediator(&self) -> MediatorSide<'_> {
        MediatorSide { page: self }
    }

    pub fn guest(&self) -> GuestSide<'_> {
        GuestSide { page: self }
    }

    fn load(&self, offset: usize) -> u32 {
        self.words[word(offset)].load(Ordering::Acquire)
    }

    fn store(&self, offset: usize, value: u32) {
        self.words[word(offset)].store(value, Ordering::Release);
    }

    fn load_u16_pair(&self, offset: usize) -> (u16, u16) {
        let raw = self.load(offset);
        (raw as u16, (raw >> 16) as u16)
    }

    fn store_u16_pair(&self, offset: usize, lo: u16, hi: u16) {
        self.store(offset, u32::from(lo) | (u32::from(hi) << 16));
    }

    pub fn magic(&self) -> u64 {
        u64::from(self.load(off::MAGIC)) | (u64::from(self.load(off::MAGIC + 4)) << 32)
    }

    /// `(version_major, version_minor)` published by the mediator.
    pub fn version(&self) -> (u16, u16) {
        self.load_u16_pair(off::VERSION_MAJOR)
    }

    pub fn instance_id(&self) -> u32 {
        self.load(off::VGT_ID)
    }

    /// Magic and major version. Readers must call this before trusting any other field.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        validate_header(self.magic(), self.version().0)
    }

    pub fn available_resources(&self) -> AvailableResources {
        AvailableResources {
            low_gmadr: GmadrRange::new(self.load(off::LOW_GMADR_BASE), self.load(off::LOW_GMADR_SIZE)),
            high_gmadr: GmadrRange::new(
                self.load(off::HIGH_GMADR_BASE),
                self.load(off::HIGH_GMADR_SIZE),
            ),
            fence_num: self.load(off::FENCE_NUM),
        }
    }

    /// `(drv_version_major, drv_version_minor)` reported by the guest; zero until it probes.
    pub fn driver_version(&self) -> (u16, u16) {
        self.load_u16_pair(off::DRV_VERSION_MAJOR)
    }

    pub fn validate_driver(&self) -> Result<(), ProtocolError> {
        let (found, _) = self.driver_version();
        if found != VGT_VERSION_MAJOR {
            return Err(ProtocolError::DriverMajorVersionMismatch {
                found,
                expected: VGT_VERSION_MAJOR,
            });
        }
        Ok(())
    }

    pub fn display_ready(&self) -> DisplayReady {
        DisplayReady::from_bits_retain(self.load(off::DISPLAY_READY))
    }

    /// The guest's resource response. `rs_insufficient` is read first so the minimums it
    /// announces are visible.
    pub fn resource_request(&self) -> ResourceRequest {
        let shortfall = ResourceShortfall::from_bits_retain(self.load(off::RS_INSUFFICIENT));
        ResourceRequest {
            shortfall,
            min_low_gmadr: self.load(off::MIN_LOW_GMADR),
            min_high_gmadr: self.load(off::MIN_HIGH_GMADR),
            min_fence_num: self.load(off::MIN_FENCE_NUM),
        }
    }

    /// `(base, size)` of the guest's GTT page-table segment.
    pub fn gtt_segment(&self) -> (u32, u32) {
        (self.load(off::GMM_GTT_SEG_BASE), self.load(off::GMM_GTT_SEG_SIZE))
    }

    /// `(xhot, yhot)` cursor hotspot hint.
    pub fn cursor_hotspot(&self) -> (u32, u32) {
        (self.load(off::XHOT), self.load(off::YHOT))
    }

    pub fn scratch(&self) -> u32 {
        self.load(off::SCRATCH)
    }

    /// Copies the whole page out as the ABI struct.
    pub fn snapshot(&self) -> VgtIf {
        let mut bytes = [0u8; VGT_PVINFO_SIZE];
        for (i, chunk) in bytes.chunks_exact_mut(4).enumerate() {
            chunk.copy_from_slice(&self.words[i].load(Ordering::Acquire).to_le_bytes());
        }
        VgtIf::from_page_bytes(&bytes)
    }

    /// Byte-granular read at a page-relative offset, as a trapped guest MMIO read sees it.
    pub fn read_bytes(&self, offset: usize, buf: &mut [u8]) -> Result<(), PageAccessError> {
        check_range(offset, buf.len())?;
        for (i, out) in buf.iter_mut().enumerate() {
            let byte_off = offset + i;
            *out = self.load(byte_off & !3).to_le_bytes()[byte_off & 3];
        }
        Ok(())
    }

    /// Byte-granular guest write at a page-relative offset, as a trapped guest MMIO write.
    ///
    /// Only guest-owned fields may be written. The single exception is the guest consuming a
    /// mediator notification, which must be a full-word write of [`VGT_NOTIFY_EMPTY`] to
    /// `v2g_notify`. Nothing is written unless the whole access is permitted.
    pub fn guest_write_bytes(&self, offset: usize, data: &[u8]) -> Result<(), PageAccessError> {
        check_range(offset, data.len())?;

        if let Some(PvInfoField::V2gNotify) = PvInfoField::containing(offset) {
            if offset != off::V2G_NOTIFY || data != VGT_NOTIFY_EMPTY.to_le_bytes() {
                return Err(PageAccessError::InvalidMailboxClear);
            }
            self.store(off::V2G_NOTIFY, VGT_NOTIFY_EMPTY);
            return Ok(());
        }

        for byte_off in offset..offset + data.len() {
            match PvInfoField::containing(byte_off) {
                None => return Err(PageAccessError::Reserved { offset: byte_off }),
                Some(field) if field.owner() != FieldOwner::Guest => {
                    return Err(PageAccessError::WriterViolation {
                        offset: byte_off,
                        field,
                    })
                }
                Some(_) => {}
            }
        }

        let mut byte_off = offset;
        for &value in data {
            self.merge_byte(byte_off, value);
            byte_off += 1;
        }
        Ok(())
    }

    fn merge_byte(&self, byte_off: usize, value: u8) {
        let cell = &self.words[word(byte_off)];
        let shift = (byte_off & 3) * 8;
        let mask = 0xFFu32 << shift;
        let mut current = cell.load(Ordering::Acquire);
        loop {
            let next = (current & !mask) | (u32::from(value) << shift);
            match cell.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    fn post<E: MailboxEvent>(&self, offset: usize, event: E, doorbell: &dyn Doorbell) {
        self.store(offset, event.to_raw());
        test_yield();
        fence(Ordering::SeqCst);
        doorbell.ring();
    }

    fn take<E: MailboxEvent>(&self, offset: usize) -> Mailbox<E> {
        let raw = self.words[word(offset)].swap(VGT_NOTIFY_EMPTY, Ordering::AcqRel);
        Mailbox::decode(raw)
    }

    fn peek<E: MailboxEvent>(&self, offset: usize) -> Mailbox<E> {
        Mailbox::decode(self.load(offset))
    }
}

impl Default for SharedControlPage {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for SharedControlPage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedControlPage")
            .field("magic", &format_args!("{:#018x}", self.magic()))
            .field("instance_id", &self.instance_id())
            .field("driver_version", &self.driver_version())
            .finish_non_exhaustive()
    }
}

fn check_range(offset: usize, len: usize) -> Result<(), PageAccessError> {
    match offset.checked_add(len) {
        Some(end) if end <= VGT_PVINFO_SIZE => Ok(()),
        _ => Err(PageAccessError::OutOfRange { offset, len }),
    }
}

/// Mediator's view of the page: writes the top half and the `v2g` mailbox.
#[derive(Clone, Copy)]
pub struct MediatorSide<'a> {
    page: &'a SharedControlPage,
}

impl<'a> MediatorSide<'a> {
    pub fn page(&self) -> &'a SharedControlPage {
        self.page
    }

    /// Writes the identity header and seeds both mailboxes with the empty sentinel.
    ///
    /// Must happen before the page is exposed to the guest: this is the only time the mediator
    /// touches `g2v_notify` other than consuming from it.
    pub fn populate(&self, instance_id: u32) {
        let page = self.page;
        page.store(off::MAGIC, VGT_MAGIC as u32);
        page.store(off::MAGIC + 4, (VGT_MAGIC >> 32) as u32);
        page.store_u16_pair(off::VERSION_MAJOR, VGT_VERSION_MAJOR, VGT_VERSION_MINOR);
        page.store(off::VGT_ID, instance_id);
        page.store(off::G2V_NOTIFY, VGT_NOTIFY_EMPTY);
        page.store(off::V2G_NOTIFY, VGT_NOTIFY_EMPTY);
    }

    pub fn publish_resources(&self, rs: &AvailableResources) {
        let page = self.page;
        page.store(off::LOW_GMADR_BASE, rs.low_gmadr.base);
        page.store(off::LOW_GMADR_SIZE, rs.low_gmadr.size);
        page.store(off::HIGH_GMADR_BASE, rs.high_gmadr.base);
        page.store(off::HIGH_GMADR_SIZE, rs.high_gmadr.size);
        page.store(off::FENCE_NUM, rs.fence_num);
    }

    pub fn post(&self, event: V2gNotification, doorbell: &dyn Doorbell) {
        self.page.post(off::V2G_NOTIFY, event, doorbell);
    }

    /// Consumes the pending guest notification, leaving the slot empty.
    pub fn take_notification(&self) -> Mailbox<G2vNotification> {
        self.page.take(off::G2V_NOTIFY)
    }

    /// What the guest would currently see in `v2g_notify`.
    pub fn pending_outgoing(&self) -> Mailbox<V2gNotification> {
        self.page.peek(off::V2G_NOTIFY)
    }
}

/// Guest driver's view of the page: writes the bottom half and the `g2v` mailbox.
#[derive(Clone, Copy)]
pub struct GuestSide<'a> {
    page: &'a SharedControlPage,
}

impl<'a> GuestSide<'a> {
    pub fn page(&self) -> &'a SharedControlPage {
        self.page
    }

    pub fn set_driver_version(&self, major: u16, minor: u16) {
        self.page.store_u16_pair(off::DRV_VERSION_MAJOR, major, minor);
    }

    pub fn set_display_ready(&self, ready: DisplayReady) {
        self.page.store(off::DISPLAY_READY, ready.bits());
    }

    /// Writes a resource response. Minimums go first; `rs_insufficient` is the publish point.
    pub fn report_resources(&self, req: &ResourceRequest) {
        let page = self.page;
        page.store(off::MIN_LOW_GMADR, req.min_low_gmadr);
        page.store(off::MIN_HIGH_GMADR, req.min_high_gmadr);
        page.store(off::MIN_FENCE_NUM, req.min_fence_num);
        page.store(off::RS_INSUFFICIENT, req.shortfall.bits());
    }

    /// Probe-time handshake: announce the driver version, compare the published allocation with
    /// the driver's minimums and write the response.
    pub fn respond_to_resources(
        &self,
        min_low_gmadr: u32,
        min_high_gmadr: u32,
        min_fence_num: u32,
    ) -> ResourceRequest {
        self.set_driver_version(VGT_VERSION_MAJOR, VGT_VERSION_MINOR);
        let req = ResourceRequest::against(
            &self.page.available_resources(),
            min_low_gmadr,
            min_high_gmadr,
            min_fence_num,
        );
        self.report_resources(&req);
        req
    }

    pub fn set_gtt_segment(&self, base: u32, size: u32) {
        self.page.store(off::GMM_GTT_SEG_BASE, base);
        self.page.store(off::GMM_GTT_SEG_SIZE, size);
    }

    pub fn set_cursor_hotspot(&self, x: u32, y: u32) {
        self.page.store(off::XHOT, x);
        self.page.store(off::YHOT, y);
    }

    pub fn set_scratch(&self, value: u32) {
        self.page.store(off::SCRATCH, value);
    }

    pub fn post(&self, event: G2vNotification, doorbell: &dyn Doorbell) {
        self.page.post(off::G2V_NOTIFY, event, doorbell);
    }

    /// Consumes the pending mediator notification, leaving the slot empty.
    pub fn take_notification(&self) -> Mailbox<V2gNotification> {
        self.page.take(off::V2G_NOTIFY)
    }

    /// What the mediator would currently see in `g2v_notify`.
    pub fn pending_outgoing(&self) -> Mailbox<G2vNotification> {
        self.page.peek(off::G2V_NOTIFY)
    }
}

#[cfg(all(test, feature = "loom"))]
#[inline]
fn test_yield() {
    loom::thread::yield_now();
}

#[cfg(not(all(test, feature = "loom")))]
#[inline]
fn test_yield() {}


#[cfg(all(test, feature = "loom"))]
mod loom_tests {
    use super::*;

    use loom::sync::atomic::AtomicBool;
    use loom::sync::Arc;

    #[test]
    fn consumer_never_sees_signal_before_value() {
        loom::model(|| {
            let page = Arc::new(SharedControlPage::new());
            page.mediator().populate(0);
            let rung = Arc::new(AtomicBool::new(false));

            let guest_page = page.clone();
            let guest_rung = rung.clone();
            let guest = loom::thread::spawn(move || {
                guest_page.guest().set_cursor_hotspot(5, 6);
                guest_page.guest().post(G2vNotification::SetPointerShape, &|| {
                    guest_rung.store(true, Ordering::Release)
                });
            });

            if rung.load(Ordering::Acquire) {
                assert_eq!(
                    page.mediator().take_notification(),
                    Mailbox::Event(G2vNotification::SetPointerShape)
                );
                assert_eq!(page.cursor_hotspot(), (5, 6));
            }

            guest.join().unwrap();
        });
    }
}
