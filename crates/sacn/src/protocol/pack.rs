// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Outgoing frame packing.
//!
//! Fills a caller-provided buffer field by field; the three flags+length
//! fields are written last, once the payload extent is known. This is the
//! transmit seam of the library: the receiver core, the source detector
//! tests, and integration tests all synthesize traffic through it.

use super::constants::*;
use crate::config;
use crate::remote_source::SourceCid;

/// Options bits for a packed data frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct PackedOptions {
    pub preview: bool,
    pub terminated: bool,
    pub force_sync: bool,
}

impl PackedOptions {
    fn to_byte(self) -> u8 {
        let mut b = 0u8;
        if self.preview {
            b |= OPTIONS_PREVIEW;
        }
        if self.terminated {
            b |= OPTIONS_TERMINATED;
        }
        if self.force_sync {
            b |= OPTIONS_FORCE_SYNC;
        }
        b
    }
}

fn pack_preamble_and_root(buf: &mut [u8], root_vector: u32, cid: &SourceCid) {
    buf[OFS_PREAMBLE_SIZE..OFS_PREAMBLE_SIZE + 2].copy_from_slice(&PREAMBLE_SIZE.to_be_bytes());
    buf[OFS_POSTAMBLE_SIZE..OFS_POSTAMBLE_SIZE + 2].copy_from_slice(&POSTAMBLE_SIZE.to_be_bytes());
    buf[OFS_ACN_IDENTIFIER..OFS_ACN_IDENTIFIER + 12].copy_from_slice(&ACN_IDENTIFIER);
    buf[OFS_ROOT_VECTOR..OFS_ROOT_VECTOR + 4].copy_from_slice(&root_vector.to_be_bytes());
    buf[OFS_CID..OFS_CID + 16].copy_from_slice(cid.as_bytes());
}

fn pack_source_name(buf: &mut [u8], name: &str) {
    let field = &mut buf[OFS_SOURCE_NAME..OFS_SOURCE_NAME + 64];
    field.fill(0);
    // Truncate to 63 bytes at a char boundary; the final byte stays NUL.
    let mut len = name.len().min(config::SOURCE_NAME_MAX_LEN - 1);
    while !name.is_char_boundary(len) {
        len -= 1;
    }
    field[..len].copy_from_slice(&name.as_bytes()[..len]);
}

/// Pack a complete sACN data packet into `buf`, returning the total length.
///
/// `buf` must hold at least [`config::MAX_PACKET_SIZE`] bytes; `slots` is
/// truncated to 512.
#[allow(clippy::too_many_arguments)]
pub fn pack_data_packet(
    buf: &mut [u8],
    cid: &SourceCid,
    source_name: &str,
    universe: u16,
    priority: u8,
    sequence: u8,
    options: PackedOptions,
    sync_universe: u16,
    start_code: u8,
    slots: &[u8],
) -> usize {
    let slot_count = slots.len().min(config::DMX_ADDRESS_COUNT);
    let total = OFS_SLOTS + slot_count;

    pack_preamble_and_root(buf, VECTOR_ROOT_DATA, cid);
    buf[OFS_FRAMING_VECTOR..OFS_FRAMING_VECTOR + 4]
        .copy_from_slice(&VECTOR_FRAMING_DATA.to_be_bytes());
    pack_source_name(buf, source_name);
    buf[OFS_PRIORITY] = priority;
    buf[OFS_SYNC_UNIVERSE..OFS_SYNC_UNIVERSE + 2].copy_from_slice(&sync_universe.to_be_bytes());
    buf[OFS_SEQUENCE] = sequence;
    buf[OFS_OPTIONS] = options.to_byte();
    buf[OFS_UNIVERSE..OFS_UNIVERSE + 2].copy_from_slice(&universe.to_be_bytes());

    buf[OFS_DMP_VECTOR] = VECTOR_DMP_SET_PROPERTY;
    buf[OFS_DMP_ADDRESS_DATA_TYPE] = DMP_ADDRESS_DATA_TYPE;
    buf[OFS_DMP_FIRST_ADDRESS..OFS_DMP_FIRST_ADDRESS + 2].copy_from_slice(&0u16.to_be_bytes());
    buf[OFS_DMP_INCREMENT..OFS_DMP_INCREMENT + 2].copy_from_slice(&1u16.to_be_bytes());
    buf[OFS_DMP_PROPERTY_COUNT..OFS_DMP_PROPERTY_COUNT + 2]
        .copy_from_slice(&((slot_count + 1) as u16).to_be_bytes());
    buf[OFS_STARTCODE] = start_code;
    buf[OFS_SLOTS..total].copy_from_slice(&slots[..slot_count]);

    // Lengths last, now that the extent is known.
    buf[OFS_ROOT_FLAGS_LENGTH..OFS_ROOT_FLAGS_LENGTH + 2]
        .copy_from_slice(&flags_and_length(total - OFS_ROOT_FLAGS_LENGTH));
    buf[OFS_FRAMING_FLAGS_LENGTH..OFS_FRAMING_FLAGS_LENGTH + 2]
        .copy_from_slice(&flags_and_length(total - OFS_FRAMING_FLAGS_LENGTH));
    buf[OFS_DMP_FLAGS_LENGTH..OFS_DMP_FLAGS_LENGTH + 2]
        .copy_from_slice(&flags_and_length(total - OFS_DMP_FLAGS_LENGTH));

    total
}

/// Pack one page of a universe-discovery advertisement, returning the total
/// length. `universes` must already be ascending and at most 512 entries.
pub fn pack_discovery_page(
    buf: &mut [u8],
    cid: &SourceCid,
    source_name: &str,
    page: u8,
    last_page: u8,
    universes: &[u16],
) -> usize {
    let count = universes.len().min(DISCOVERY_UNIVERSES_PER_PAGE);
    let total = OFS_DISCOVERY_UNIVERSES + count * 2;

    pack_preamble_and_root(buf, VECTOR_ROOT_EXTENDED, cid);
    buf[OFS_FRAMING_VECTOR..OFS_FRAMING_VECTOR + 4]
        .copy_from_slice(&VECTOR_FRAMING_DISCOVERY.to_be_bytes());
    pack_source_name(buf, source_name);
    // Framing-layer reserved field.
    buf[OFS_PRIORITY..OFS_DISCOVERY_FLAGS_LENGTH].fill(0);

    buf[OFS_DISCOVERY_VECTOR..OFS_DISCOVERY_VECTOR + 4]
        .copy_from_slice(&VECTOR_DISCOVERY_UNIVERSE_LIST.to_be_bytes());
    buf[OFS_DISCOVERY_PAGE] = page;
    buf[OFS_DISCOVERY_LAST_PAGE] = last_page;
    for (i, universe) in universes[..count].iter().enumerate() {
        let offset = OFS_DISCOVERY_UNIVERSES + i * 2;
        buf[offset..offset + 2].copy_from_slice(&universe.to_be_bytes());
    }

    buf[OFS_ROOT_FLAGS_LENGTH..OFS_ROOT_FLAGS_LENGTH + 2]
        .copy_from_slice(&flags_and_length(total - OFS_ROOT_FLAGS_LENGTH));
    buf[OFS_FRAMING_FLAGS_LENGTH..OFS_FRAMING_FLAGS_LENGTH + 2]
        .copy_from_slice(&flags_and_length(total - OFS_FRAMING_FLAGS_LENGTH));
    buf[OFS_DISCOVERY_FLAGS_LENGTH..OFS_DISCOVERY_FLAGS_LENGTH + 2]
        .copy_from_slice(&flags_and_length(total - OFS_DISCOVERY_FLAGS_LENGTH));

    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_packet_layout() {
        let mut buf = [0u8; config::MAX_PACKET_SIZE];
        let cid = SourceCid::from_bytes([7; 16]);
        let len = pack_data_packet(
            &mut buf,
            &cid,
            "layout",
            256,
            100,
            0,
            PackedOptions::default(),
            0,
            0x00,
            &[0xAB; 512],
        );
        assert_eq!(len, 638);
        assert_eq!(&buf[4..16], b"ASC-E1.17\0\0\0");
        // Root length covers bytes 16..638 = 622 = 0x26E.
        assert_eq!(&buf[16..18], &[0x72, 0x6E]);
        assert_eq!(&buf[OFS_UNIVERSE..OFS_UNIVERSE + 2], &[0x01, 0x00]);
        assert_eq!(buf[OFS_STARTCODE], 0x00);
        assert_eq!(buf[OFS_SLOTS], 0xAB);
        assert_eq!(buf[len - 1], 0xAB);
    }

    #[test]
    fn test_source_name_truncated_at_char_boundary() {
        let mut buf = [0u8; config::MAX_PACKET_SIZE];
        let cid = SourceCid::zero();
        let long = "é".repeat(40); // 80 bytes of UTF-8
        pack_data_packet(
            &mut buf,
            &cid,
            &long,
            1,
            0,
            0,
            PackedOptions::default(),
            0,
            0,
            &[0],
        );
        let field = &buf[OFS_SOURCE_NAME..OFS_SOURCE_NAME + 64];
        assert_eq!(field[63], 0);
        let nul = field.iter().position(|&b| b == 0).unwrap();
        assert!(std::str::from_utf8(&field[..nul]).is_ok());
        assert!(nul <= 63);
    }

    #[test]
    fn test_discovery_page_layout() {
        let mut buf = [0u8; config::MAX_PACKET_SIZE];
        let cid = SourceCid::zero();
        let len = pack_discovery_page(&mut buf, &cid, "d", 0, 0, &[1, 2, 3]);
        assert_eq!(len, OFS_DISCOVERY_UNIVERSES + 6);
        assert_eq!(&buf[OFS_DISCOVERY_UNIVERSES..len], &[0, 1, 0, 2, 0, 3]);
    }
}
