//! PVINFO page ABI (`struct vgt_if`).
//!
//! One 4 KiB page at [`VGT_PVINFO_PAGE`] inside the GPU register BAR. The top half is written by
//! the mediator (identity, version, available resources); the bottom half is written by the guest
//! driver (its version, display readiness, resource shortfall report, mailboxes, hints). The two
//! halves never share a writer so neither side can tear the other's update.
//!
//! The offset table in [`pvinfo_off`] is the ABI. [`VgtIf`] mirrors it as a `#[repr(C)]` struct
//! with every reserved word spelled out, and the `const` block below refuses to compile if the
//! two ever disagree.

use core::mem::{offset_of, size_of};

use bitflags::bitflags;

use crate::error::ProtocolError;
use crate::notify::VGT_NOTIFY_EMPTY;

/// Offset of the PVINFO page within the register BAR.
pub const VGT_PVINFO_PAGE: u64 = 0x78000;
/// Size of the PVINFO page.
///
/// 32 KiB (`0x78000..0x80000`) was originally reserved, but the top of that range overlaps
/// `PIPE_EDP_CONF` (`0x7F008`), so only one page is claimed.
pub const VGT_PVINFO_SIZE: usize = 0x1000;
/// First byte of the guest-written half.
pub const VGT_PVINFO_HALF: usize = VGT_PVINFO_SIZE / 2;

/// `"vGTvGTvG"`.
pub const VGT_MAGIC: u64 = 0x4776_5447_7654_4776;
pub const VGT_VERSION_MAJOR: u16 = 1;
pub const VGT_VERSION_MINOR: u16 = 0;

pub mod pvinfo_off {
    //! Page-relative byte offsets of every PVINFO field, including reserved ranges.

    pub const MAGIC: usize = 0x000;
    pub const VERSION_MAJOR: usize = 0x008;
    pub const VERSION_MINOR: usize = 0x00A;
    pub const VGT_ID: usize = 0x00C;
    pub const RSV2: usize = 0x010;

    pub const AVAIL_RS: usize = 0x040;
    pub const LOW_GMADR_BASE: usize = 0x040;
    pub const LOW_GMADR_SIZE: usize = 0x044;
    pub const HIGH_GMADR_BASE: usize = 0x048;
    pub const HIGH_GMADR_SIZE: usize = 0x04C;
    pub const FENCE_NUM: usize = 0x050;
    pub const AVAIL_RS_RSV2: usize = 0x054;
    pub const RSV3: usize = 0x060;

    pub const DRV_VERSION_MAJOR: usize = 0x800;
    pub const DRV_VERSION_MINOR: usize = 0x802;
    pub const DISPLAY_READY: usize = 0x804;
    pub const RS_INSUFFICIENT: usize = 0x808;
    pub const MIN_LOW_GMADR: usize = 0x80C;
    pub const MIN_HIGH_GMADR: usize = 0x810;
    pub const MIN_FENCE_NUM: usize = 0x814;
    pub const G2V_NOTIFY: usize = 0x818;
    pub const V2G_NOTIFY: usize = 0x81C;
    pub const GMM_GTT_SEG_BASE: usize = 0x820;
    pub const RSV4: usize = 0x824;
    pub const GMM_GTT_SEG_SIZE: usize = 0x828;
    pub const RSV5: usize = 0x82C;
    pub const XHOT: usize = 0x830;
    pub const YHOT: usize = 0x834;
    pub const SCRATCH: usize = 0x838;
    pub const RSV6: usize = 0x83C;
}

bitflags! {
    /// `display_ready`: whether the guest can take part in a display ownership switch.
    ///
    /// The empty set is `VGT_DRV_DISPLAY_NOT_READY`.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct DisplayReady: u32 {
        const READY = 1 << 0;
        const LEGACY_VGA_MODE = 1 << 1;
    }
}

bitflags! {
    /// `rs_insufficient`: which published resources fell short of the driver's minimum.
    ///
    /// The empty set means the driver accepted the allocation. Undefined bits are reserved.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ResourceShortfall: u32 {
        const LOW_GMADR = 1 << 0;
        const HIGH_GMADR = 1 << 1;
        const FENCE = 1 << 2;
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VgtIfGmadr {
    pub my_base: u32,
    pub my_size: u32,
}

/// `avail_rs`: one contiguous region per kind.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VgtIfAvailRs {
    /// CPU-visible aperture.
    pub low_gmadr: VgtIfGmadr,
    /// Non-aperture graphics memory.
    pub high_gmadr: VgtIfGmadr,
    pub fence_num: u32,
    pub rsv2: [u32; 3],
}

/// The whole PVINFO page.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VgtIf {
    pub magic: u64,
    pub version_major: u16,
    pub version_minor: u16,
    pub vgt_id: u32,
    pub rsv2: [u32; 12],
    pub avail_rs: VgtIfAvailRs,
    pub rsv3: [u32; 0x200 - 24],

    pub drv_version_major: u16,
    pub drv_version_minor: u16,
    pub display_ready: u32,
    pub rs_insufficient: u32,
    pub min_low_gmadr: u32,
    pub min_high_gmadr: u32,
    pub min_fence_num: u32,
    pub g2v_notify: u32,
    pub v2g_notify: u32,
    pub gmm_gtt_seg_base: u32,
    pub rsv4: u32,
    pub gmm_gtt_seg_size: u32,
    pub rsv5: u32,
    pub xhot: u32,
    pub yhot: u32,
    pub scratch: u32,
    pub rsv6: [u32; 0x200 - 15],
}

const AVAIL_RS_LOW: usize = offset_of!(VgtIf, avail_rs) + offset_of!(VgtIfAvailRs, low_gmadr);
const AVAIL_RS_HIGH: usize = offset_of!(VgtIf, avail_rs) + offset_of!(VgtIfAvailRs, high_gmadr);

const _: () = {
    assert!(size_of::<VgtIf>() == VGT_PVINFO_SIZE);
    assert!(size_of::<VgtIfAvailRs>() == 0x20);

    assert!(offset_of!(VgtIf, magic) == pvinfo_off::MAGIC);
    assert!(offset_of!(VgtIf, version_major) == pvinfo_off::VERSION_MAJOR);
    assert!(offset_of!(VgtIf, version_minor) == pvinfo_off::VERSION_MINOR);
    assert!(offset_of!(VgtIf, vgt_id) == pvinfo_off::VGT_ID);
    assert!(offset_of!(VgtIf, rsv2) == pvinfo_off::RSV2);
    assert!(offset_of!(VgtIf, avail_rs) == pvinfo_off::AVAIL_RS);
    assert!(AVAIL_RS_LOW + offset_of!(VgtIfGmadr, my_base) == pvinfo_off::LOW_GMADR_BASE);
    assert!(AVAIL_RS_LOW + offset_of!(VgtIfGmadr, my_size) == pvinfo_off::LOW_GMADR_SIZE);
    assert!(AVAIL_RS_HIGH + offset_of!(VgtIfGmadr, my_base) == pvinfo_off::HIGH_GMADR_BASE);
    assert!(AVAIL_RS_HIGH + offset_of!(VgtIfGmadr, my_size) == pvinfo_off::HIGH_GMADR_SIZE);
    assert!(
        offset_of!(VgtIf, avail_rs) + offset_of!(VgtIfAvailRs, fence_num) == pvinfo_off::FENCE_NUM
    );
    assert!(
        offset_of!(VgtIf, avail_rs) + offset_of!(VgtIfAvailRs, rsv2) == pvinfo_off::AVAIL_RS_RSV2
    );
    assert!(offset_of!(VgtIf, rsv3) == pvinfo_off::RSV3);

    // The guest half starts exactly at the half-page boundary.
    assert!(offset_of!(VgtIf, drv_version_major) == VGT_PVINFO_HALF);
    assert!(offset_of!(VgtIf, drv_version_major) == pvinfo_off::DRV_VERSION_MAJOR);
    assert!(offset_of!(VgtIf, drv_version_minor) == pvinfo_off::DRV_VERSION_MINOR);
    assert!(offset_of!(VgtIf, display_ready) == pvinfo_off::DISPLAY_READY);
    assert!(offset_of!(VgtIf, rs_insufficient) == pvinfo_off::RS_INSUFFICIENT);
    assert!(offset_of!(VgtIf, min_low_gmadr) == pvinfo_off::MIN_LOW_GMADR);
    assert!(offset_of!(VgtIf, min_high_gmadr) == pvinfo_off::MIN_HIGH_GMADR);
    assert!(offset_of!(VgtIf, min_fence_num) == pvinfo_off::MIN_FENCE_NUM);
    assert!(offset_of!(VgtIf, g2v_notify) == pvinfo_off::G2V_NOTIFY);
    assert!(offset_of!(VgtIf, v2g_notify) == pvinfo_off::V2G_NOTIFY);
    assert!(offset_of!(VgtIf, gmm_gtt_seg_base) == pvinfo_off::GMM_GTT_SEG_BASE);
    assert!(offset_of!(VgtIf, rsv4) == pvinfo_off::RSV4);
    assert!(offset_of!(VgtIf, gmm_gtt_seg_size) == pvinfo_off::GMM_GTT_SEG_SIZE);
    assert!(offset_of!(VgtIf, rsv5) == pvinfo_off::RSV5);
    assert!(offset_of!(VgtIf, xhot) == pvinfo_off::XHOT);
    assert!(offset_of!(VgtIf, yhot) == pvinfo_off::YHOT);
    assert!(offset_of!(VgtIf, scratch) == pvinfo_off::SCRATCH);
    assert!(offset_of!(VgtIf, rsv6) == pvinfo_off::RSV6);
};

/// Which side of the contract may write a field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FieldOwner {
    Mediator,
    Guest,
}

/// Every named PVINFO field, for offset lookups and writer-domain checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PvInfoField {
    Magic,
    VersionMajor,
    VersionMinor,
    VgtId,
    LowGmadrBase,
    LowGmadrSize,
    HighGmadrBase,
    HighGmadrSize,
    FenceNum,
    DrvVersionMajor,
    DrvVersionMinor,
    DisplayReady,
    RsInsufficient,
    MinLowGmadr,
    MinHighGmadr,
    MinFenceNum,
    G2vNotify,
    V2gNotify,
    GttSegmentBase,
    GttSegmentSize,
    CursorHotspotX,
    CursorHotspotY,
    Scratch,
}

impl PvInfoField {
    pub const ALL: [PvInfoField; 23] = [
        Self::Magic,
        Self::VersionMajor,
        Self::VersionMinor,
        Self::VgtId,
        Self::LowGmadrBase,
        Self::LowGmadrSize,
        Self::HighGmadrBase,
        Self::HighGmadrSize,
        Self::FenceNum,
        Self::DrvVersionMajor,
        Self::DrvVersionMinor,
        Self::DisplayReady,
        Self::RsInsufficient,
        Self::MinLowGmadr,
        Self::MinHighGmadr,
        Self::MinFenceNum,
        Self::G2vNotify,
        Self::V2gNotify,
        Self::GttSegmentBase,
        Self::GttSegmentSize,
        Self::CursorHotspotX,
        Self::CursorHotspotY,
        Self::Scratch,
    ];

    /// Page-relative byte offset.
    pub const fn offset(self) -> usize {
        use pvinfo_off as off;
        match self {
            Self::Magic => off::MAGIC,
            Self::VersionMajor => off::VERSION_MAJOR,
            Self::VersionMinor => off::VERSION_MINOR,
            Self::VgtId => off::VGT_ID,
            Self::LowGmadrBase => off::LOW_GMADR_BASE,
            Self::LowGmadrSize => off::LOW_GMADR_SIZE,
            Self::HighGmadrBase => off::HIGH_GMADR_BASE,
            Self::HighGmadrSize => off::HIGH_GMADR_SIZE,
            Self::FenceNum => off::FENCE_NUM,
            Self::DrvVersionMajor => off::DRV_VERSION_MAJOR,
            Self::DrvVersionMinor => off::DRV_VERSION_MINOR,
            Self::DisplayReady => off::DISPLAY_READY,
            Self::RsInsufficient => off::RS_INSUFFICIENT,
            Self::MinLowGmadr => off::MIN_LOW_GMADR,
            Self::MinHighGmadr => off::MIN_HIGH_GMADR,
            Self::MinFenceNum => off::MIN_FENCE_NUM,
            Self::G2vNotify => off::G2V_NOTIFY,
            Self::V2gNotify => off::V2G_NOTIFY,
            Self::GttSegmentBase => off::GMM_GTT_SEG_BASE,
            Self::GttSegmentSize => off::GMM_GTT_SEG_SIZE,
            Self::CursorHotspotX => off::XHOT,
            Self::CursorHotspotY => off::YHOT,
            Self::Scratch => off::SCRATCH,
        }
    }

    /// Field width in bytes.
    pub const fn size(self) -> usize {
        match self {
            Self::Magic => 8,
            Self::VersionMajor
            | Self::VersionMinor
            | Self::DrvVersionMajor
            | Self::DrvVersionMinor => 2,
            _ => 4,
        }
    }

    /// The side that produces this field's value.
    ///
    /// `v2g_notify` sits in the guest half but is produced by the mediator; the guest only ever
    /// writes it back to empty after consuming an event (and the mediator does the same for
    /// `g2v_notify`).
    pub const fn owner(self) -> FieldOwner {
        match self {
            Self::V2gNotify => FieldOwner::Mediator,
            _ if self.offset() < VGT_PVINFO_HALF => FieldOwner::Mediator,
            _ => FieldOwner::Guest,
        }
    }

    /// Finds the field containing page-relative byte `offset`, if it is not reserved space.
    pub fn containing(offset: usize) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|field| (field.offset()..field.offset() + field.size()).contains(&offset))
    }
}

/// Offset of `field` within the register BAR, for mapping into the guest's MMIO space.
pub const fn field_offset(field: PvInfoField) -> u64 {
    VGT_PVINFO_PAGE + field.offset() as u64
}

/// One contiguous graphics memory range (`my_base` / `my_size`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct GmadrRange {
    pub base: u32,
    pub size: u32,
}

impl GmadrRange {
    pub const fn new(base: u32, size: u32) -> Self {
        Self { base, size }
    }

    pub fn end_exclusive(&self) -> u64 {
        u64::from(self.base) + u64::from(self.size)
    }
}

/// Mediator-published allocation (`avail_rs`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct AvailableResources {
    pub low_gmadr: GmadrRange,
    pub high_gmadr: GmadrRange,
    pub fence_num: u32,
}

/// Guest response to an allocation: which resources fell short and the minimum it needs.
///
/// A `min_*` value is only meaningful when the matching [`ResourceShortfall`] bit is set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ResourceRequest {
    pub shortfall: ResourceShortfall,
    pub min_low_gmadr: u32,
    pub min_high_gmadr: u32,
    pub min_fence_num: u32,
}

impl ResourceRequest {
    /// Compares a published allocation against a driver's minimums, producing the response the
    /// driver should write.
    pub fn against(
        available: &AvailableResources,
        min_low_gmadr: u32,
        min_high_gmadr: u32,
        min_fence_num: u32,
    ) -> Self {
        let mut req = Self::default();
        if available.low_gmadr.size < min_low_gmadr {
            req.shortfall |= ResourceShortfall::LOW_GMADR;
            req.min_low_gmadr = min_low_gmadr;
        }
        if available.high_gmadr.size < min_high_gmadr {
            req.shortfall |= ResourceShortfall::HIGH_GMADR;
            req.min_high_gmadr = min_high_gmadr;
        }
        if available.fence_num < min_fence_num {
            req.shortfall |= ResourceShortfall::FENCE;
            req.min_fence_num = min_fence_num;
        }
        req
    }

    pub fn is_accepted(&self) -> bool {
        self.shortfall.is_empty()
    }
}

impl VgtIf {
    pub const SIZE_BYTES: usize = VGT_PVINFO_SIZE;

    /// An all-zero page, as freshly allocated at attach time.
    pub const fn zeroed() -> Self {
        Self {
            magic: 0,
            version_major: 0,
            version_minor: 0,
            vgt_id: 0,
            rsv2: [0; 12],
            avail_rs: VgtIfAvailRs {
                low_gmadr: VgtIfGmadr {
                    my_base: 0,
                    my_size: 0,
                },
                high_gmadr: VgtIfGmadr {
                    my_base: 0,
                    my_size: 0,
                },
                fence_num: 0,
                rsv2: [0; 3],
            },
            rsv3: [0; 0x200 - 24],
            drv_version_major: 0,
            drv_version_minor: 0,
            display_ready: 0,
            rs_insufficient: 0,
            min_low_gmadr: 0,
            min_high_gmadr: 0,
            min_fence_num: 0,
            g2v_notify: 0,
            v2g_notify: 0,
            gmm_gtt_seg_base: 0,
            rsv4: 0,
            gmm_gtt_seg_size: 0,
            rsv5: 0,
            xhot: 0,
            yhot: 0,
            scratch: 0,
            rsv6: [0; 0x200 - 15],
        }
    }

    /// A page with the mediator header populated and both mailboxes empty.
    pub const fn new(vgt_id: u32) -> Self {
        let mut page = Self::zeroed();
        page.magic = VGT_MAGIC;
        page.version_major = VGT_VERSION_MAJOR;
        page.version_minor = VGT_VERSION_MINOR;
        page.vgt_id = vgt_id;
        page.g2v_notify = VGT_NOTIFY_EMPTY;
        page.v2g_notify = VGT_NOTIFY_EMPTY;
        page
    }

    /// Checks magic and major version. A minor mismatch is tolerated.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        validate_header(self.magic, self.version_major)
    }

    /// Checks the version the guest driver reported in the bottom half.
    pub fn validate_driver(&self) -> Result<(), ProtocolError> {
        if self.drv_version_major != VGT_VERSION_MAJOR {
            return Err(ProtocolError::DriverMajorVersionMismatch {
                found: self.drv_version_major,
                expected: VGT_VERSION_MAJOR,
            });
        }
        Ok(())
    }

    pub fn available_resources(&self) -> AvailableResources {
        AvailableResources {
            low_gmadr: GmadrRange::new(
                self.avail_rs.low_gmadr.my_base,
                self.avail_rs.low_gmadr.my_size,
            ),
            high_gmadr: GmadrRange::new(
                self.avail_rs.high_gmadr.my_base,
                self.avail_rs.high_gmadr.my_size,
            ),
            fence_num: self.avail_rs.fence_num,
        }
    }

    pub fn set_available_resources(&mut self, rs: &AvailableResources) {
        self.avail_rs.low_gmadr = VgtIfGmadr {
            my_base: rs.low_gmadr.base,
            my_size: rs.low_gmadr.size,
        };
        self.avail_rs.high_gmadr = VgtIfGmadr {
            my_base: rs.high_gmadr.base,
            my_size: rs.high_gmadr.size,
        };
        self.avail_rs.fence_num = rs.fence_num;
    }

    pub fn resource_request(&self) -> ResourceRequest {
        ResourceRequest {
            shortfall: ResourceShortfall::from_bits_retain(self.rs_insufficient),
            min_low_gmadr: self.min_low_gmadr,
            min_high_gmadr: self.min_high_gmadr,
            min_fence_num: self.min_fence_num,
        }
    }

    pub fn display_ready(&self) -> DisplayReady {
        DisplayReady::from_bits_retain(self.display_ready)
    }

    pub fn decode_from_le_bytes(buf: &[u8]) -> Option<Self> {
        let page: &[u8; VGT_PVINFO_SIZE] = buf.get(..Self::SIZE_BYTES)?.try_into().ok()?;
        Some(Self::from_page_bytes(page))
    }

    pub fn from_page_bytes(buf: &[u8; VGT_PVINFO_SIZE]) -> Self {
        use pvinfo_off as off;

        let mut page = Self::zeroed();
        page.magic = get_u64(buf, off::MAGIC);
        page.version_major = get_u16(buf, off::VERSION_MAJOR);
        page.version_minor = get_u16(buf, off::VERSION_MINOR);
        page.vgt_id = get_u32(buf, off::VGT_ID);
        get_u32s(buf, off::RSV2, &mut page.rsv2);
        page.avail_rs.low_gmadr.my_base = get_u32(buf, off::LOW_GMADR_BASE);
        page.avail_rs.low_gmadr.my_size = get_u32(buf, off::LOW_GMADR_SIZE);
        page.avail_rs.high_gmadr.my_base = get_u32(buf, off::HIGH_GMADR_BASE);
        page.avail_rs.high_gmadr.my_size = get_u32(buf, off::HIGH_GMADR_SIZE);
        page.avail_rs.fence_num = get_u32(buf, off::FENCE_NUM);
        get_u32s(buf, off::AVAIL_RS_RSV2, &mut page.avail_rs.rsv2);
        get_u32s(buf, off::RSV3, &mut page.rsv3);

        page.drv_version_major = get_u16(buf, off::DRV_VERSION_MAJOR);
        page.drv_version_minor = get_u16(buf, off::DRV_VERSION_MINOR);
        page.display_ready = get_u32(buf, off::DISPLAY_READY);
        page.rs_insufficient = get_u32(buf, off::RS_INSUFFICIENT);
        page.min_low_gmadr = get_u32(buf, off::MIN_LOW_GMADR);
        page.min_high_gmadr = get_u32(buf, off::MIN_HIGH_GMADR);
        page.min_fence_num = get_u32(buf, off::MIN_FENCE_NUM);
        page.g2v_notify = get_u32(buf, off::G2V_NOTIFY);
        page.v2g_notify = get_u32(buf, off::V2G_NOTIFY);
        page.gmm_gtt_seg_base = get_u32(buf, off::GMM_GTT_SEG_BASE);
        page.rsv4 = get_u32(buf, off::RSV4);
        page.gmm_gtt_seg_size = get_u32(buf, off::GMM_GTT_SEG_SIZE);
        page.rsv5 = get_u32(buf, off::RSV5);
        page.xhot = get_u32(buf, off::XHOT);
        page.yhot = get_u32(buf, off::YHOT);
        page.scratch = get_u32(buf, off::SCRATCH);
        get_u32s(buf, off::RSV6, &mut page.rsv6);
        page
    }

    pub fn encode_to_le_bytes(&self) -> [u8; VGT_PVINFO_SIZE] {
        use pvinfo_off as off;

        let mut buf = [0u8; VGT_PVINFO_SIZE];
        put(&mut buf, off::MAGIC, &self.magic.to_le_bytes());
        put(&mut buf, off::VERSION_MAJOR, &self.version_major.to_le_bytes());
        put(&mut buf, off::VERSION_MINOR, &self.version_minor.to_le_bytes());
        put(&mut buf, off::VGT_ID, &self.vgt_id.to_le_bytes());
        put_u32s(&mut buf, off::RSV2, &self.rsv2);
        put_u32(&mut buf, off::LOW_GMADR_BASE, self.avail_rs.low_gmadr.my_base);
        put_u32(&mut buf, off::LOW_GMADR_SIZE, self.avail_rs.low_gmadr.my_size);
        put_u32(&mut buf, off::HIGH_GMADR_BASE, self.avail_rs.high_gmadr.my_base);
        put_u32(&mut buf, off::HIGH_GMADR_SIZE, self.avail_rs.high_gmadr.my_size);
        put_u32(&mut buf, off::FENCE_NUM, self.avail_rs.fence_num);
        put_u32s(&mut buf, off::AVAIL_RS_RSV2, &self.avail_rs.rsv2);
        put_u32s(&mut buf, off::RSV3, &self.rsv3);

        put(&mut buf, off::DRV_VERSION_MAJOR, &self.drv_version_major.to_le_bytes());
        put(&mut buf, off::DRV_VERSION_MINOR, &self.drv_version_minor.to_le_bytes());
        put_u32(&mut buf, off::DISPLAY_READY, self.display_ready);
        put_u32(&mut buf, off::RS_INSUFFICIENT, self.rs_insufficient);
        put_u32(&mut buf, off::MIN_LOW_GMADR, self.min_low_gmadr);
        put_u32(&mut buf, off::MIN_HIGH_GMADR, self.min_high_gmadr);
        put_u32(&mut buf, off::MIN_FENCE_NUM, self.min_fence_num);
        put_u32(&mut buf, off::G2V_NOTIFY, self.g2v_notify);
        put_u32(&mut buf, off::V2G_NOTIFY, self.v2g_notify);
        put_u32(&mut buf, off::GMM_GTT_SEG_BASE, self.gmm_gtt_seg_base);
        put_u32(&mut buf, off::RSV4, self.rsv4);
        put_u32(&mut buf, off::GMM_GTT_SEG_SIZE, self.gmm_gtt_seg_size);
        put_u32(&mut buf, off::RSV5, self.rsv5);
        put_u32(&mut buf, off::XHOT, self.xhot);
        put_u32(&mut buf, off::YHOT, self.yhot);
        put_u32(&mut buf, off::SCRATCH, self.scratch);
        put_u32s(&mut buf, off::RSV6, &self.rsv6);
        buf
    }
}

impl Default for VgtIf {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// Validates the header of a raw PVINFO blob without decoding the rest of it.
pub fn validate_bytes(buf: &[u8]) -> Result<(), ProtocolError> {
    if buf.len() < VGT_PVINFO_SIZE {
        return Err(ProtocolError::Truncated {
            len: buf.len(),
            needed: VGT_PVINFO_SIZE,
        });
    }
    validate_header(
        get_u64(buf, pvinfo_off::MAGIC),
        get_u16(buf, pvinfo_off::VERSION_MAJOR),
    )
}

/// Validates an already-extracted `magic` / `version_major` pair.
pub fn validate_header(magic: u64, version_major: u16) -> Result<(), ProtocolError> {
    if magic != VGT_MAGIC {
        return Err(ProtocolError::BadMagic {
            found: magic,
            expected: VGT_MAGIC,
        });
    }
    if version_major != VGT_VERSION_MAJOR {
        return Err(ProtocolError::MajorVersionMismatch {
            found: version_major,
            expected: VGT_VERSION_MAJOR,
        });
    }
    Ok(())
}

fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn get_u64(buf: &[u8], off: usize) -> u64 {
    u64::from(get_u32(buf, off)) | (u64::from(get_u32(buf, off + 4)) << 32)
}

fn get_u32s(buf: &[u8], off: usize, out: &mut [u32]) {
    for (i, word) in out.iter_mut().enumerate() {
        *word = get_u32(buf, off + i * 4);
    }
}

fn put(buf: &mut [u8], off: usize, bytes: &[u8]) {
    buf[off..off + bytes.len()].copy_from_slice(bytes);
}

fn put_u32(buf: &mut [u8], off: usize, val: u32) {
    put(buf, off, &val.to_le_bytes());
}

fn put_u32s(buf: &mut [u8], off: usize, words: &[u32]) {
    for (i, word) in words.iter().enumerate() {
        put_u32(buf, off + i * 4, *word);
    }
}
