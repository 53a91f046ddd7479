// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! sACN protocol constants and engine tunables - single source of truth.
//!
//! Centralizes every E1.31 magic number and timing default so nothing is
//! hardcoded elsewhere. Runtime-adjustable values (the expired-notification
//! wait) live in the engine state; everything here is compile-time.

use std::time::Duration;

// =======================================================================
// E1.31 wire constants
// =======================================================================

/// UDP destination port for all sACN traffic (ANSI E1.31-2018 Sec.9.1.1).
pub const SACN_PORT: u16 = 5568;

/// Number of DMX slots (octets) in one universe.
pub const DMX_ADDRESS_COUNT: usize = 512;

/// Maximum length of a source name, including the NUL terminator required
/// on the wire.
pub const SOURCE_NAME_MAX_LEN: usize = 64;

/// NULL start code: DMX level data.
pub const STARTCODE_DMX: u8 = 0x00;

/// ETC per-address priority start code.
pub const STARTCODE_PRIORITY: u8 = 0xDD;

/// Lowest valid sACN universe number.
pub const MIN_UNIVERSE: u16 = 1;

/// Highest valid sACN universe number.
pub const MAX_UNIVERSE: u16 = 63999;

/// The reserved universe on which universe-discovery packets are sent.
pub const DISCOVERY_UNIVERSE: u16 = 64214;

/// Highest valid universe priority.
pub const MAX_PRIORITY: u8 = 200;

/// Largest sACN datagram we will ever produce or accept (a full data packet
/// is 638 octets; discovery pages are smaller). Receive buffers round up.
pub const MAX_PACKET_SIZE: usize = 638;

// =======================================================================
// Timing defaults (E1.31 + ETC extensions)
// =======================================================================

/// How often each receive thread runs its periodic processing pass.
pub const PERIODIC_INTERVAL: Duration = Duration::from_millis(120);

/// Source-loss timeout: a source with no traffic for this long is offline
/// (E1.31-2018 Sec.6.7.1, network data loss timeout).
pub const SOURCE_LOSS_TIMEOUT: Duration = Duration::from_millis(2500);

/// How long to wait for a 0xDD packet after the first 0x00 packet from a new
/// source before notifying with levels only.
pub const WAIT_FOR_PRIORITY: Duration = Duration::from_millis(1500);

/// Length of the sampling period that follows universe subscription or a
/// networking reset.
pub const SAMPLE_TIME: Duration = Duration::from_millis(1500);

/// Default grace period before a termination set is reported lost. Runtime
/// adjustable via [`crate::receiver::set_expired_wait`].
pub const DEFAULT_EXPIRED_WAIT: Duration = Duration::from_millis(1000);

/// Source-side keep-alive interval: how often a source re-sends unchanged
/// data so receivers do not hit the loss timeout.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_millis(800);

/// How often a source advertises its universe list (E1.31 Sec.4.3).
pub const UNIVERSE_DISCOVERY_INTERVAL: Duration = Duration::from_secs(10);

/// A discovered source expires after missing two advertisement intervals
/// plus slack.
pub const UNIVERSE_DISCOVERY_SOURCE_TIMEOUT: Duration = Duration::from_secs(21);

// =======================================================================
// Engine limits
// =======================================================================

/// Number of background receive threads. Each receiver is pinned to one
/// thread for its lifetime so callbacks stay serialized.
pub const RECEIVER_MAX_THREADS: usize = 1;

/// How many multicast subscriptions may share one receive socket before the
/// socket layer creates another.
pub const MAX_SUBS_PER_SOCKET: usize = 20;

/// Upper bound on the receive-loop poll wait, so destroy/deinit make
/// progress promptly.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// On some platforms (macOS) the stack delivers multicast only to a single
/// bound socket per address family, so the layer binds exactly one and
/// fans every subscription into it.
pub const RECEIVER_LIMIT_BIND: bool = cfg!(target_os = "macos");

// =======================================================================
// Shared enums
// =======================================================================

/// How an API instance uses IPv4 and IPv6 networking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpSupport {
    /// Use IPv4 only.
    V4Only,
    /// Use IPv6 only.
    V6Only,
    /// Use both IPv4 and IPv6.
    #[default]
    V4AndV6,
}

impl IpSupport {
    #[must_use]
    pub fn includes_v4(self) -> bool {
        matches!(self, IpSupport::V4Only | IpSupport::V4AndV6)
    }

    #[must_use]
    pub fn includes_v6(self) -> bool {
        matches!(self, IpSupport::V6Only | IpSupport::V4AndV6)
    }
}

/// Validate a universe id against the allowed range.
#[inline]
#[must_use]
pub fn universe_is_valid(universe: u16) -> bool {
    (MIN_UNIVERSE..=MAX_UNIVERSE).contains(&universe)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_universe_range() {
        assert!(!universe_is_valid(0));
        assert!(universe_is_valid(1));
        assert!(universe_is_valid(63999));
        assert!(!universe_is_valid(64000));
        assert!(!universe_is_valid(DISCOVERY_UNIVERSE));
    }

    #[test]
    fn test_ip_support() {
        assert!(IpSupport::V4AndV6.includes_v4());
        assert!(IpSupport::V4AndV6.includes_v6());
        assert!(!IpSupport::V4Only.includes_v6());
        assert!(!IpSupport::V6Only.includes_v4());
    }
}
