// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # sACN - Streaming ACN (ANSI E1.31) in pure Rust
//!
//! Receive, merge, and monitor DMX-over-IP lighting data. The crate
//! implements the receiver/merger core of the protocol: multicast
//! listening with per-source liveness tracking, highest-takes-precedence
//! merging with per-address priorities, and the merge receiver that
//! composes the two under the sampling-period rules.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sacn::merge_receiver::{self, MergedData, MergeReceiverConfig, MergeReceiverHandle,
//!     MergeReceiverNotify};
//!
//! struct Printer;
//!
//! impl MergeReceiverNotify for Printer {
//!     fn merged_data(&self, _receiver: MergeReceiverHandle, data: &MergedData) {
//!         println!("universe {} slot 1 = {}", data.universe_id, data.levels[0]);
//!     }
//! }
//!
//! fn main() -> sacn::Result<()> {
//!     sacn::init(None)?;
//!     let handle = merge_receiver::create(
//!         &MergeReceiverConfig::new(1),
//!         Arc::new(Printer),
//!         None,
//!     )?;
//!     std::thread::sleep(std::time::Duration::from_secs(10));
//!     merge_receiver::destroy(handle)?;
//!     sacn::deinit();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                        Application Layer                           |
//! |     ReceiverNotify / MergeReceiverNotify / SourceDetectorNotify    |
//! +--------------------------------------------------------------------+
//! |                          Engine Layer                              |
//! |  receiver state machines | DMX merger | source loss | discovery    |
//! +--------------------------------------------------------------------+
//! |                         Transport Layer                            |
//! |  pooled multicast sockets | packet-info recv | interface discovery |
//! +--------------------------------------------------------------------+
//! ```
//!
//! One background receive thread owns the sockets and drives all timers;
//! a single coarse lock protects engine state, and every callback is
//! invoked with the lock released.
//!
//! ## Modules Overview
//!
//! - [`receiver`] - raw per-universe reception (start here)
//! - [`merge_receiver`] - reception plus HTP merging
//! - [`merge`] - the standalone DMX merger
//! - [`source_detector`] - universe-discovery monitoring
//! - [`protocol`] - wire codec
//!
//! ## See Also
//!
//! - ANSI E1.31-2018, Entertainment Technology - Lightweight streaming
//!   protocol for transport of DMX512 using ACN

/// Protocol constants and engine tunables.
pub mod config;
/// The coarse-locked engine core (init/deinit live here).
mod engine;
/// Error type and result alias.
mod error;
/// Highest-takes-precedence DMX merger with per-address priority.
pub mod merge;
/// Receiver + merger composition with sampling-period gating.
pub mod merge_receiver;
/// E1.31 wire codec: parser and frame packers.
pub mod protocol;
/// The sACN receiver API and engine internals.
pub mod receiver;
/// Remote source identity: CIDs and dense handles.
pub mod remote_source;
/// Universe-discovery source detector.
pub mod source_detector;
/// Sockets and network interface discovery.
pub mod transport;

pub use engine::{deinit, init, initialized};
pub use error::{Error, Result};
pub use merge::DmxMerger;
pub use remote_source::{RemoteSourceHandle, SourceCid, REMOTE_SOURCE_INVALID};

use crate::remote_source::RemoteSourceHandle as Handle;

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Look up the handle the engine assigned to a source CID, if that source
/// is currently known to any receiver or the source detector.
pub fn remote_source_handle(cid: &SourceCid) -> Result<Option<Handle>> {
    engine::with_engine(|engine| Ok(engine.registry.lookup_handle(cid)))
}

/// Look up the CID behind a remote source handle.
pub fn remote_source_cid(handle: Handle) -> Result<Option<SourceCid>> {
    engine::with_engine(|engine| Ok(engine.registry.cid(handle).copied()))
}
