// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error type shared by every public API in this crate.

use std::fmt;
use std::io;

/// Errors returned by sACN API operations.
///
/// All public functions are total: they return one of these variants and
/// never panic. Background-thread failures are logged and do not surface
/// here except as [`Error::Sys`] on the next API call that touches the
/// affected instance.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Argument / state errors
    // ========================================================================
    /// A malformed argument was provided (out-of-range universe, zero-length
    /// buffer, bad footprint, ...). The message names the offending argument.
    Invalid(&'static str),
    /// An API function was called before [`crate::init`].
    NotInit,
    /// A handle or universe did not correspond to a live instance.
    NotFound,
    /// An attempt was made to listen on a universe already owned by another
    /// receiver in this process.
    Exists,

    // ========================================================================
    // Resource errors
    // ========================================================================
    /// A capacity limit was reached (source cap, handle space, socket pool).
    NoMem,
    /// None of the requested network interfaces could be used.
    NoNetints,

    // ========================================================================
    // Other errors
    // ========================================================================
    /// A platform call failed unexpectedly.
    Sys(io::Error),
    /// The feature is declared in the API but not implemented (custom
    /// footprints, synchronization universes).
    NotImplemented,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Invalid(what) => write!(f, "Invalid argument: {}", what),
            Error::NotInit => write!(f, "sACN module not initialized"),
            Error::NotFound => write!(f, "Handle or universe not found"),
            Error::Exists => write!(f, "Universe already in use by this module"),
            Error::NoMem => write!(f, "Capacity limit reached"),
            Error::NoNetints => write!(f, "No usable network interfaces"),
            Error::Sys(e) => write!(f, "System call failed: {}", e),
            Error::NotImplemented => write!(f, "Feature not implemented"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Sys(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Sys(e)
    }
}

/// Convenient alias for API results using the public [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;
