use pretty_assertions::assert_eq;
use proptest::prelude::*;
use vgt_protocol::pvinfo::pvinfo_off;
use vgt_protocol::{
    field_offset, validate_bytes, AvailableResources, GmadrRange, ProtocolError, PvInfoField,
    VgtIf, VGT_MAGIC, VGT_PVINFO_PAGE, VGT_PVINFO_SIZE, VGT_VERSION_MAJOR, VGT_VERSION_MINOR,
};

/// Offsets as laid out by `struct vgt_if` in the published C header, computed by hand from the
/// declared member types and reserved array lengths.
const C_HEADER_OFFSETS: &[(PvInfoField, usize)] = &[
    (PvInfoField::Magic, 0),
    (PvInfoField::VersionMajor, 8),
    (PvInfoField::VersionMinor, 10),
    (PvInfoField::VgtId, 12),
    // 12 reserved u32 pad the header to 0x40.
    (PvInfoField::LowGmadrBase, 0x40),
    (PvInfoField::LowGmadrSize, 0x44),
    (PvInfoField::HighGmadrBase, 0x48),
    (PvInfoField::HighGmadrSize, 0x4c),
    (PvInfoField::FenceNum, 0x50),
    // avail_rs tail (3 u32) + rsv3[0x200 - 24] pad to the half page.
    (PvInfoField::DrvVersionMajor, 0x800),
    (PvInfoField::DrvVersionMinor, 0x802),
    (PvInfoField::DisplayReady, 0x804),
    (PvInfoField::RsInsufficient, 0x808),
    (PvInfoField::MinLowGmadr, 0x80c),
    (PvInfoField::MinHighGmadr, 0x810),
    (PvInfoField::MinFenceNum, 0x814),
    (PvInfoField::G2vNotify, 0x818),
    (PvInfoField::V2gNotify, 0x81c),
    (PvInfoField::GttSegmentBase, 0x820),
    (PvInfoField::GttSegmentSize, 0x828),
    (PvInfoField::CursorHotspotX, 0x830),
    (PvInfoField::CursorHotspotY, 0x834),
    (PvInfoField::Scratch, 0x838),
];

#[test]
fn offsets_match_c_header_layout() {
    assert_eq!(C_HEADER_OFFSETS.len(), PvInfoField::ALL.len());
    for &(field, expected) in C_HEADER_OFFSETS {
        assert_eq!(field.offset(), expected, "{field:?}");
        assert_eq!(field_offset(field), VGT_PVINFO_PAGE + expected as u64, "{field:?}");
    }
}

#[test]
fn reserved_tails_pad_to_exact_page() {
    // rsv3[0x200 - 24] ends exactly at the half page; rsv6[0x200 - 15] ends exactly at the page.
    assert_eq!(pvinfo_off::RSV3 + (0x200 - 24) * 4, VGT_PVINFO_SIZE / 2);
    assert_eq!(pvinfo_off::RSV6 + (0x200 - 15) * 4, VGT_PVINFO_SIZE);
    assert_eq!(core::mem::size_of::<VgtIf>(), VGT_PVINFO_SIZE);
}

#[test]
fn encoded_header_bytes_are_little_endian() {
    let bytes = VgtIf::new(0x0102_0304).encode_to_le_bytes();
    assert_eq!(&bytes[0..8], b"vGTvGTvG");
    assert_eq!(&bytes[8..10], &VGT_VERSION_MAJOR.to_le_bytes());
    assert_eq!(&bytes[10..12], &VGT_VERSION_MINOR.to_le_bytes());
    assert_eq!(&bytes[12..16], &[0x04, 0x03, 0x02, 0x01]);
    assert_eq!(&bytes[0x818..0x820], &[0xff; 8]);
}

#[test]
fn short_blobs_are_rejected() {
    assert_eq!(
        validate_bytes(&[0u8; 16]),
        Err(ProtocolError::Truncated {
            len: 16,
            needed: VGT_PVINFO_SIZE
        })
    );
    assert!(VgtIf::decode_from_le_bytes(&[0u8; VGT_PVINFO_SIZE - 1]).is_none());
}

fn u32_edge() -> impl Strategy<Value = u32> {
    prop_oneof![
        2 => Just(0u32),
        2 => Just(u32::MAX),
        1 => Just(1u32),
        1 => Just(u32::MAX - 1),
        6 => any::<u32>(),
    ]
}

proptest! {
    #[test]
    fn single_bit_magic_corruption_fails_validation(bit in 0u32..64) {
        let mut bytes = VgtIf::new(1).encode_to_le_bytes();
        prop_assert_eq!(validate_bytes(&bytes), Ok(()));

        let corrupted = VGT_MAGIC ^ (1u64 << bit);
        bytes[0..8].copy_from_slice(&corrupted.to_le_bytes());
        prop_assert_eq!(
            validate_bytes(&bytes),
            Err(ProtocolError::BadMagic { found: corrupted, expected: VGT_MAGIC })
        );
    }

    #[test]
    fn validation_depends_only_on_magic_and_major(
        major in any::<u16>(),
        minor in any::<u16>(),
        vgt_id in any::<u32>(),
        filler in any::<u8>(),
    ) {
        let mut page = VgtIf::new(vgt_id);
        page.version_major = major;
        page.version_minor = minor;
        page.rsv3 = [u32::from_ne_bytes([filler; 4]); 0x200 - 24];

        let bytes = page.encode_to_le_bytes();
        prop_assert_eq!(validate_bytes(&bytes).is_ok(), major == VGT_VERSION_MAJOR);
        prop_assert_eq!(page.validate().is_ok(), major == VGT_VERSION_MAJOR);
    }

    #[test]
    fn resource_descriptor_survives_encode_decode(
        low_base in u32_edge(),
        low_size in u32_edge(),
        high_base in u32_edge(),
        high_size in u32_edge(),
        fence_num in u32_edge(),
    ) {
        let rs = AvailableResources {
            low_gmadr: GmadrRange::new(low_base, low_size),
            high_gmadr: GmadrRange::new(high_base, high_size),
            fence_num,
        };
        let mut page = VgtIf::new(0);
        page.set_available_resources(&rs);

        let bytes = page.encode_to_le_bytes();
        let decoded = VgtIf::decode_from_le_bytes(&bytes).unwrap();
        prop_assert_eq!(decoded.available_resources(), rs);
        prop_assert_eq!(decoded, page);
    }
}
