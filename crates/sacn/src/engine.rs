// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Global engine state and the coarse lock.
//!
//! All engine state (receivers, mergers inside merge receivers, the remote
//! source registry, socket-layer pending queues) lives behind one mutex.
//! Receive threads take it around packet dispatch and release it across the
//! blocking poll; API calls take it for the duration of each entry.

use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use crate::config::{DEFAULT_EXPIRED_WAIT, RECEIVER_MAX_THREADS};
use crate::error::{Error, Result};
use crate::receiver::SacnReceiver;
use crate::remote_source::RemoteSourceRegistry;
use crate::source_detector::DetectorState;
use crate::transport::{McastInterface, SocketPool, SysNetint};

/// State owned by one receive thread, kept under the engine lock so API
/// threads can queue work for it.
pub(crate) struct RecvThreadContext {
    pub id: usize,
    pub running: Arc<AtomicBool>,
    pub join: Option<JoinHandle<()>>,
    pub pool: SocketPool,
    /// Receiver handles assigned to this thread.
    pub receivers: Vec<i32>,
    /// Set when the thread's poll context failed fatally; every receiver on
    /// it reports *sys* on the next API touch.
    pub failed: bool,
    /// Malformed datagrams silently dropped.
    pub packets_dropped: u64,
}

impl RecvThreadContext {
    fn new(id: usize) -> Self {
        Self {
            id,
            running: Arc::new(AtomicBool::new(false)),
            join: None,
            pool: SocketPool::new(),
            receivers: Vec::new(),
            failed: false,
            packets_dropped: 0,
        }
    }
}

/// Everything behind the coarse lock.
pub(crate) struct Engine {
    pub registry: RemoteSourceRegistry,
    pub receivers: BTreeMap<i32, SacnReceiver>,
    pub by_universe: BTreeMap<u16, i32>,
    pub threads: Vec<RecvThreadContext>,
    pub source_detector: Option<DetectorState>,
    pub sys_netints: Vec<SysNetint>,
    pub expired_wait: Duration,
    next_receiver_handle: i32,
}

impl Engine {
    fn new(sys_netints: Vec<SysNetint>) -> Self {
        Self {
            registry: RemoteSourceRegistry::new(),
            receivers: BTreeMap::new(),
            by_universe: BTreeMap::new(),
            threads: (0..RECEIVER_MAX_THREADS).map(RecvThreadContext::new).collect(),
            source_detector: None,
            sys_netints,
            expired_wait: DEFAULT_EXPIRED_WAIT,
            next_receiver_handle: 0,
        }
    }

    pub(crate) fn alloc_receiver_handle(&mut self) -> i32 {
        let mut candidate = self.next_receiver_handle;
        while candidate < 0 || self.receivers.contains_key(&candidate) {
            candidate = candidate.wrapping_add(1).max(0);
        }
        self.next_receiver_handle = candidate.wrapping_add(1);
        candidate
    }

    /// Pick the least-loaded usable receive thread.
    pub(crate) fn assign_thread(&self) -> Result<usize> {
        self.threads
            .iter()
            .filter(|t| !t.failed)
            .min_by_key(|t| t.receivers.len())
            .map(|t| t.id)
            .ok_or_else(|| {
                Error::Sys(io::Error::other("all receive threads have failed"))
            })
    }

    /// Error out API calls touching a failed thread.
    pub(crate) fn check_thread(&self, thread_id: usize) -> Result<()> {
        if self.threads.get(thread_id).is_some_and(|t| t.failed) {
            return Err(Error::Sys(io::Error::other("receive thread failed")));
        }
        Ok(())
    }

    /// Spawn the thread's receive loop if it is not already running.
    pub(crate) fn start_thread(&mut self, thread_id: usize) {
        let ctx = &mut self.threads[thread_id];
        if ctx.join.is_some() || ctx.failed {
            return;
        }
        ctx.running.store(true, Ordering::Release);
        let running = Arc::clone(&ctx.running);
        match std::thread::Builder::new()
            .name(format!("sacn-recv-{}", thread_id))
            .spawn(move || crate::receiver::thread::run(thread_id, running))
        {
            Ok(handle) => {
                ctx.join = Some(handle);
                log::debug!("[ENGINE] receive thread {} started", thread_id);
            }
            Err(e) => {
                // The caller sees the failure on the next API touch.
                ctx.running.store(false, Ordering::Release);
                ctx.failed = true;
                log::warn!("[ENGINE] failed to spawn receive thread {}: {}", thread_id, e);
            }
        }
    }
}

static ENGINE: Mutex<Option<Engine>> = Mutex::new(None);

pub(crate) fn lock() -> MutexGuard<'static, Option<Engine>> {
    ENGINE.lock()
}

/// Run `f` with the engine, or *not-initialized*.
pub(crate) fn with_engine<R>(f: impl FnOnce(&mut Engine) -> Result<R>) -> Result<R> {
    let mut guard = ENGINE.lock();
    match guard.as_mut() {
        Some(engine) => f(engine),
        None => Err(Error::NotInit),
    }
}

/// Initialize the sACN module. Idempotent; a second call is a no-op.
///
/// With an explicit interface list, multicast is restricted to those
/// interfaces and per-interface statuses are filled in.
pub fn init(netints: Option<&mut [McastInterface]>) -> Result<()> {
    let mut guard = ENGINE.lock();
    if guard.is_some() {
        log::debug!("[ENGINE] init called twice, ignoring");
        return Ok(());
    }

    let discovered = crate::transport::discover_netints();
    let sys_netints = match netints {
        None => discovered,
        Some(list) => crate::transport::select_netints(&discovered, Some(list))?,
    };

    *guard = Some(Engine::new(sys_netints));
    log::debug!("[ENGINE] initialized");
    Ok(())
}

/// Deinitialize the module: stop every receive thread, close every socket,
/// and drop all state. Synchronous; background threads are joined.
pub fn deinit() {
    let mut engine = {
        let mut guard = ENGINE.lock();
        match guard.take() {
            Some(engine) => engine,
            None => return,
        }
    };

    let mut joins = Vec::new();
    for thread in &mut engine.threads {
        thread.running.store(false, Ordering::Release);
        if let Some(handle) = thread.join.take() {
            joins.push(handle);
        }
    }
    for handle in joins {
        if handle.join().is_err() {
            log::debug!("[ENGINE] receive thread panicked during shutdown");
        }
    }
    // Sockets close when the engine (and its pools) drops here.
    drop(engine);
    log::debug!("[ENGINE] deinitialized");
}

/// True if [`init`] has been called and [`deinit`] has not.
pub fn initialized() -> bool {
    ENGINE.lock().is_some()
}
