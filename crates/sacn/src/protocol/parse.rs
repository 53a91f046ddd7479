// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Validating zero-copy parser for incoming sACN datagrams.
//!
//! Returns tagged views borrowing the receive buffer; slot data is never
//! copied. Any deviation in the outer headers rejects the packet. Extra
//! bytes past the claimed PDU lengths are tolerated (some sources pad).

use super::constants::*;
use crate::config;
use crate::remote_source::SourceCid;

/// A parsed sACN packet: a typed view over the receive buffer.
#[derive(Debug)]
pub enum SacnPacket<'a> {
    /// DMX data (or any other start code) for one universe.
    Data(DataView<'a>),
    /// Universe synchronization trigger. Recognized but not acted upon;
    /// the synchronization feature is not implemented.
    Sync(SyncView),
    /// One page of a universe-discovery advertisement.
    Discovery(DiscoveryView<'a>),
}

/// View of a data packet (framing vector `VECTOR_FRAMING_DATA`).
#[derive(Debug)]
pub struct DataView<'a> {
    pub cid: SourceCid,
    pub source_name: &'a str,
    pub universe: u16,
    pub priority: u8,
    pub sync_universe: u16,
    pub sequence: u8,
    pub preview: bool,
    pub terminated: bool,
    pub force_sync: bool,
    pub start_code: u8,
    /// Slot values following the start code. At most 512.
    pub slots: &'a [u8],
}

/// View of a synchronization packet.
#[derive(Debug)]
pub struct SyncView {
    pub cid: SourceCid,
    pub sequence: u8,
    pub sync_universe: u16,
}

/// View of one universe-discovery page.
#[derive(Debug)]
pub struct DiscoveryView<'a> {
    pub cid: SourceCid,
    pub source_name: &'a str,
    pub page: u8,
    pub last_page: u8,
    /// Raw big-endian universe list, validated strictly ascending.
    universe_bytes: &'a [u8],
}

impl DiscoveryView<'_> {
    /// Universes advertised on this page, ascending.
    pub fn universes(&self) -> impl Iterator<Item = u16> + '_ {
        self.universe_bytes
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
    }

    /// Number of universes on this page.
    #[must_use]
    pub fn universe_count(&self) -> usize {
        self.universe_bytes.len() / 2
    }
}

#[inline]
fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

#[inline]
fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

/// Extract the NUL-terminated UTF-8 source name from its 64-byte field.
fn parse_source_name(field: &[u8]) -> Option<&str> {
    let nul = field.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&field[..nul]).ok()
}

/// Parse one datagram. Returns `None` for anything malformed; the caller
/// counts the drop. Never allocates.
#[must_use]
pub fn parse_datagram(buf: &[u8]) -> Option<SacnPacket<'_>> {
    // Shared preamble + root layer.
    if buf.len() < OFS_SOURCE_NAME {
        return None;
    }
    if read_u16(buf, OFS_PREAMBLE_SIZE) != PREAMBLE_SIZE
        || read_u16(buf, OFS_POSTAMBLE_SIZE) != POSTAMBLE_SIZE
        || buf[OFS_ACN_IDENTIFIER..OFS_ACN_IDENTIFIER + 12] != ACN_IDENTIFIER
    {
        return None;
    }

    let root_length =
        parse_flags_and_length([buf[OFS_ROOT_FLAGS_LENGTH], buf[OFS_ROOT_FLAGS_LENGTH + 1]])?;
    if OFS_ROOT_FLAGS_LENGTH + root_length > buf.len() {
        return None;
    }
    let root_vector = read_u32(buf, OFS_ROOT_VECTOR);

    let mut cid_bytes = [0u8; 16];
    cid_bytes.copy_from_slice(&buf[OFS_CID..OFS_CID + 16]);
    let cid = SourceCid::from_bytes(cid_bytes);

    let framing_vector = read_u32(buf, OFS_FRAMING_VECTOR);
    parse_flags_and_length([buf[OFS_FRAMING_FLAGS_LENGTH], buf[OFS_FRAMING_FLAGS_LENGTH + 1]])?;

    match (root_vector, framing_vector) {
        (VECTOR_ROOT_DATA, VECTOR_FRAMING_DATA) => parse_data(buf, cid),
        (VECTOR_ROOT_EXTENDED, VECTOR_FRAMING_SYNC) => parse_sync(buf, cid),
        (VECTOR_ROOT_EXTENDED, VECTOR_FRAMING_DISCOVERY) => parse_discovery(buf, cid),
        _ => None,
    }
}

fn parse_data(buf: &[u8], cid: SourceCid) -> Option<SacnPacket<'_>> {
    if buf.len() < OFS_SLOTS {
        return None;
    }

    let source_name = parse_source_name(&buf[OFS_SOURCE_NAME..OFS_SOURCE_NAME + 64])?;

    let priority = buf[OFS_PRIORITY];
    if priority > config::MAX_PRIORITY {
        return None;
    }

    let universe = read_u16(buf, OFS_UNIVERSE);
    if !config::universe_is_valid(universe) {
        return None;
    }

    // DMP layer: fixed Set Property header.
    if buf[OFS_DMP_VECTOR] != VECTOR_DMP_SET_PROPERTY
        || buf[OFS_DMP_ADDRESS_DATA_TYPE] != DMP_ADDRESS_DATA_TYPE
        || read_u16(buf, OFS_DMP_FIRST_ADDRESS) != 0x0000
        || read_u16(buf, OFS_DMP_INCREMENT) != 0x0001
    {
        return None;
    }
    parse_flags_and_length([buf[OFS_DMP_FLAGS_LENGTH], buf[OFS_DMP_FLAGS_LENGTH + 1]])?;

    let property_count = read_u16(buf, OFS_DMP_PROPERTY_COUNT) as usize;
    if property_count == 0 || property_count > config::DMX_ADDRESS_COUNT + 1 {
        return None;
    }
    let slot_count = property_count - 1;
    if buf.len() < OFS_SLOTS + slot_count {
        return None;
    }

    let options = buf[OFS_OPTIONS];
    Some(SacnPacket::Data(DataView {
        cid,
        source_name,
        universe,
        priority,
        sync_universe: read_u16(buf, OFS_SYNC_UNIVERSE),
        sequence: buf[OFS_SEQUENCE],
        preview: options & OPTIONS_PREVIEW != 0,
        terminated: options & OPTIONS_TERMINATED != 0,
        force_sync: options & OPTIONS_FORCE_SYNC != 0,
        start_code: buf[OFS_STARTCODE],
        slots: &buf[OFS_SLOTS..OFS_SLOTS + slot_count],
    }))
}

fn parse_sync(buf: &[u8], cid: SourceCid) -> Option<SacnPacket<'_>> {
    if buf.len() < SYNC_PACKET_SIZE {
        return None;
    }
    Some(SacnPacket::Sync(SyncView {
        cid,
        sequence: buf[OFS_SYNC_SEQUENCE],
        sync_universe: read_u16(buf, OFS_SYNC_SYNC_UNIVERSE),
    }))
}

fn parse_discovery(buf: &[u8], cid: SourceCid) -> Option<SacnPacket<'_>> {
    if buf.len() < OFS_DISCOVERY_UNIVERSES {
        return None;
    }

    let source_name = parse_source_name(&buf[OFS_SOURCE_NAME..OFS_SOURCE_NAME + 64])?;

    if read_u32(buf, OFS_DISCOVERY_VECTOR) != VECTOR_DISCOVERY_UNIVERSE_LIST {
        return None;
    }
    let discovery_length = parse_flags_and_length([
        buf[OFS_DISCOVERY_FLAGS_LENGTH],
        buf[OFS_DISCOVERY_FLAGS_LENGTH + 1],
    ])?;

    // Discovery layer header is 8 octets; the rest is the universe list.
    let header = OFS_DISCOVERY_UNIVERSES - OFS_DISCOVERY_FLAGS_LENGTH;
    if discovery_length < header {
        return None;
    }
    let list_bytes = discovery_length - header;
    if list_bytes % 2 != 0
        || list_bytes / 2 > DISCOVERY_UNIVERSES_PER_PAGE
        || buf.len() < OFS_DISCOVERY_UNIVERSES + list_bytes
    {
        return None;
    }

    let page = buf[OFS_DISCOVERY_PAGE];
    let last_page = buf[OFS_DISCOVERY_LAST_PAGE];
    if page > last_page {
        return None;
    }

    let universe_bytes = &buf[OFS_DISCOVERY_UNIVERSES..OFS_DISCOVERY_UNIVERSES + list_bytes];

    // The list must be strictly ascending.
    let mut prev: Option<u16> = None;
    for chunk in universe_bytes.chunks_exact(2) {
        let universe = u16::from_be_bytes([chunk[0], chunk[1]]);
        if let Some(p) = prev {
            if universe <= p {
                return None;
            }
        }
        prev = Some(universe);
    }

    Some(SacnPacket::Discovery(DiscoveryView {
        cid,
        source_name,
        page,
        last_page,
        universe_bytes,
    }))
}
