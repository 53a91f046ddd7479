// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Remote source identification: CIDs and the global handle registry.
//!
//! Every sACN source endpoint carries a 128-bit Component Identifier (CID)
//! on the wire. Internally the engine refers to sources by dense 16-bit
//! handles so receivers, mergers, and application callbacks never have to
//! compare 16-byte ids. The registry keeps the bidirectional mapping and
//! refcounts each handle across the components that reference it.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};

/// sACN Component Identifier (CID).
///
/// 128-bit value uniquely naming a source endpoint (E1.31-2018 Sec.5.6).
/// Equality on CID identifies a source across address changes.
///
/// # Display Format
/// Lowercase hyphenated UUID: "1b6a8d94-0a72-4e3d-9f10-2c5b33f70001"
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SourceCid([u8; 16]);

impl SourceCid {
    /// Create a CID from raw bytes as they appear in the root layer.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// The raw 16 bytes, wire order.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// All-zero CID (placeholder; never produced by a compliant source).
    #[must_use]
    pub fn zero() -> Self {
        Self([0; 16])
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl fmt::Display for SourceCid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                write!(f, "-")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for SourceCid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SourceCid({})", self)
    }
}

/// Dense handle assigned to a remote source on first sight of its CID.
pub type RemoteSourceHandle = u16;

/// Reserved handle value meaning "no source".
pub const REMOTE_SOURCE_INVALID: RemoteSourceHandle = 0xFFFF;

struct RegistryEntry {
    cid: SourceCid,
    refcount: usize,
}

/// Global CID <-> handle registry. Lives in the engine state and is accessed
/// under the coarse lock only.
///
/// Invariant: at any instant there is at most one live handle per CID, and
/// `by_cid`/`by_handle` are exact inverses of each other.
#[derive(Default)]
pub(crate) struct RemoteSourceRegistry {
    by_cid: BTreeMap<SourceCid, RemoteSourceHandle>,
    by_handle: BTreeMap<RemoteSourceHandle, RegistryEntry>,
    next_handle: RemoteSourceHandle,
}

impl RemoteSourceRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Look up or allocate the handle for a CID, incrementing its refcount.
    ///
    /// Allocation scans forward from the last assigned value, skipping
    /// handles still in use and the reserved invalid value, so handles wrap
    /// safely past 65535 assignments.
    pub(crate) fn acquire(&mut self, cid: &SourceCid) -> Result<RemoteSourceHandle> {
        if let Some(&handle) = self.by_cid.get(cid) {
            if let Some(entry) = self.by_handle.get_mut(&handle) {
                entry.refcount += 1;
            }
            return Ok(handle);
        }

        if self.by_handle.len() >= REMOTE_SOURCE_INVALID as usize {
            log::debug!("[REGISTRY] handle space exhausted ({} live)", self.by_handle.len());
            return Err(Error::NoMem);
        }

        let mut candidate = self.next_handle;
        while candidate == REMOTE_SOURCE_INVALID || self.by_handle.contains_key(&candidate) {
            candidate = candidate.wrapping_add(1);
        }
        self.next_handle = candidate.wrapping_add(1);

        self.by_cid.insert(*cid, candidate);
        self.by_handle.insert(
            candidate,
            RegistryEntry {
                cid: *cid,
                refcount: 1,
            },
        );
        Ok(candidate)
    }

    /// Handle for a CID, if one is live. Does not touch the refcount.
    pub(crate) fn lookup_handle(&self, cid: &SourceCid) -> Option<RemoteSourceHandle> {
        self.by_cid.get(cid).copied()
    }

    /// CID for a live handle.
    pub(crate) fn cid(&self, handle: RemoteSourceHandle) -> Option<&SourceCid> {
        self.by_handle.get(&handle).map(|e| &e.cid)
    }

    /// Drop one reference to a handle, freeing it when the count hits zero.
    pub(crate) fn release(&mut self, handle: RemoteSourceHandle) {
        let freed = match self.by_handle.get_mut(&handle) {
            Some(entry) => {
                entry.refcount -= 1;
                entry.refcount == 0
            }
            None => false,
        };
        if freed {
            if let Some(entry) = self.by_handle.remove(&handle) {
                self.by_cid.remove(&entry.cid);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn live_count(&self) -> usize {
        self.by_handle.len()
    }
}
