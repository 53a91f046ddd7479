// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end tests driving live receivers over loopback UDP.
//!
//! Packets are packed with the crate's own codec and sent unicast to
//! 127.0.0.1:5568; the engine accepts unicast for a subscribed universe, so
//! no multicast routing is required on the test host. The engine is a
//! process-wide singleton, so every test serializes on one lock and runs
//! its own init/deinit cycle.

use std::net::UdpSocket;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use sacn::config::{MAX_PACKET_SIZE, SACN_PORT};
use sacn::merge_receiver::{
    self, MergeReceiverConfig, MergeReceiverHandle, MergeReceiverNotify, MergedData,
};
use sacn::protocol::{pack_data_packet, pack_discovery_page, PackedOptions};
use sacn::receiver::{
    self, LostSource, ReceiverConfig, ReceiverHandle, ReceiverNotify, RemoteSourceInfo,
    UniverseData,
};
use sacn::source_detector::{self, SourceDetectorConfig, SourceDetectorNotify};
use sacn::{Error, RemoteSourceHandle, SourceCid};

fn test_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn test_cid(n: u8) -> SourceCid {
    let mut bytes = [0x60u8; 16];
    bytes[15] = n;
    SourceCid::from_bytes(bytes)
}

struct Sender {
    socket: UdpSocket,
    cid: SourceCid,
    universe: u16,
    seq: u8,
}

impl Sender {
    fn new(cid: SourceCid, universe: u16) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").expect("bind sender socket");
        Self {
            socket,
            cid,
            universe,
            seq: 0,
        }
    }

    fn send(&mut self, start_code: u8, priority: u8, slots: &[u8]) {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let len = pack_data_packet(
            &mut buf,
            &self.cid,
            "integration source",
            self.universe,
            priority,
            self.seq,
            PackedOptions::default(),
            0,
            start_code,
            slots,
        );
        self.seq = self.seq.wrapping_add(1);
        self.socket
            .send_to(&buf[..len], ("127.0.0.1", SACN_PORT))
            .expect("send packet");
    }

    fn send_terminated(&mut self, slots: &[u8]) {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let len = pack_data_packet(
            &mut buf,
            &self.cid,
            "integration source",
            self.universe,
            100,
            self.seq,
            PackedOptions {
                terminated: true,
                ..PackedOptions::default()
            },
            0,
            0x00,
            slots,
        );
        self.seq = self.seq.wrapping_add(1);
        self.socket
            .send_to(&buf[..len], ("127.0.0.1", SACN_PORT))
            .expect("send packet");
    }
}

/// Poll `predicate` while periodically invoking `pump` until the deadline.
fn wait_for(mut pump: impl FnMut(), predicate: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        pump();
        std::thread::sleep(Duration::from_millis(50));
    }
    predicate()
}

#[derive(Default)]
struct MergeRecorder {
    frames: Mutex<Vec<MergedData>>,
    lost: Mutex<Vec<Vec<LostSource>>>,
    sampling_ended: Mutex<u32>,
}

impl MergeReceiverNotify for MergeRecorder {
    fn merged_data(&self, _receiver: MergeReceiverHandle, data: &MergedData) {
        self.frames.lock().expect("frames lock").push(data.clone());
    }

    fn sources_lost(&self, _receiver: MergeReceiverHandle, _universe: u16, lost: &[LostSource]) {
        self.lost.lock().expect("lost lock").push(lost.to_vec());
    }

    fn sampling_period_ended(&self, _receiver: MergeReceiverHandle, _universe: u16) {
        *self.sampling_ended.lock().expect("sampling lock") += 1;
    }
}

#[derive(Default)]
struct RawRecorder {
    packets: Mutex<Vec<(u8, Vec<u8>)>>,
}

impl ReceiverNotify for RawRecorder {
    fn universe_data(
        &self,
        _receiver: ReceiverHandle,
        _source_addr: std::net::SocketAddr,
        _source: &RemoteSourceInfo,
        data: &UniverseData<'_>,
    ) {
        self.packets
            .lock()
            .expect("packets lock")
            .push((data.start_code, data.values.to_vec()));
    }

    fn sources_lost(&self, _receiver: ReceiverHandle, _universe: u16, _lost: &[LostSource]) {}
}

#[test]
fn test_api_validation() {
    let _guard = test_lock().lock().expect("test lock");

    // Everything before init is *not-initialized*.
    let result = receiver::create(
        &ReceiverConfig::new(1),
        Arc::new(RawRecorder::default()),
        None,
    );
    assert!(matches!(result, Err(Error::NotInit)));

    sacn::init(None).expect("init");

    let result = receiver::create(
        &ReceiverConfig::new(0),
        Arc::new(RawRecorder::default()),
        None,
    );
    assert!(matches!(result, Err(Error::Invalid(_))));

    let handle = receiver::create(
        &ReceiverConfig::new(100),
        Arc::new(RawRecorder::default()),
        None,
    )
    .expect("create receiver");

    // The universe is owned; a second listener is refused.
    let result = merge_receiver::create(
        &MergeReceiverConfig::new(100),
        Arc::new(MergeRecorder::default()),
        None,
    );
    assert!(matches!(result, Err(Error::Exists)));

    // Custom footprints are declared but not implemented.
    let narrow = sacn::receiver::UniverseSubrange {
        start_address: 10,
        address_count: 16,
    };
    assert!(matches!(
        receiver::change_footprint(handle, &narrow),
        Err(Error::NotImplemented)
    ));

    assert_eq!(receiver::get_universe(handle).expect("get universe"), 100);
    receiver::change_universe(handle, 200).expect("change universe");
    assert_eq!(receiver::get_universe(handle).expect("get universe"), 200);

    receiver::destroy(handle).expect("destroy");
    assert!(matches!(receiver::destroy(handle), Err(Error::NotFound)));

    sacn::deinit();
    assert!(!sacn::initialized());
}

#[test]
fn test_merge_receiver_over_loopback() {
    let _guard = test_lock().lock().expect("test lock");
    sacn::init(None).expect("init");

    let recorder = Arc::new(MergeRecorder::default());
    let handle = merge_receiver::create(
        &MergeReceiverConfig::new(1),
        recorder.clone(),
        None,
    )
    .expect("create merge receiver");

    let mut levels = vec![0u8; 512];
    levels[0] = 201;
    levels[1] = 44;

    // Keep the source alive; the first merged frame arrives once the
    // sampling period and the PAP wait have both run their course.
    let mut sender = Sender::new(test_cid(1), 1);
    let got_frame = wait_for(
        || sender.send(0x00, 100, &levels),
        || !recorder.frames.lock().expect("frames").is_empty(),
        Duration::from_secs(8),
    );
    assert!(got_frame, "no merged data within the deadline");

    {
        let frames = recorder.frames.lock().expect("frames");
        let frame = frames.last().expect("one frame");
        assert_eq!(frame.universe_id, 1);
        assert_eq!(frame.levels[0], 201);
        assert_eq!(frame.levels[1], 44);
        assert_eq!(frame.priorities[0], 100);
        assert_eq!(frame.active_sources.len(), 1);
        let owner = frame.owners[0];
        assert_ne!(owner, sacn::REMOTE_SOURCE_INVALID);

        // The engine's CID map agrees with the frame's owner.
        let mapped: Option<RemoteSourceHandle> =
            sacn::remote_source_handle(&test_cid(1)).expect("lookup");
        assert_eq!(mapped, Some(owner));
        let source =
            merge_receiver::get_source(handle, owner).expect("get_source");
        assert_eq!(source.cid, test_cid(1));
        assert!(source.levels_active);
    }
    assert!(*recorder.sampling_ended.lock().expect("sampling") >= 1);

    // Graceful termination: the stream-terminated bit groups the source
    // into a termination set and one sources-lost event follows.
    sender.send_terminated(&levels);
    let got_lost = wait_for(
        || {},
        || !recorder.lost.lock().expect("lost").is_empty(),
        Duration::from_secs(5),
    );
    assert!(got_lost, "no sources-lost within the deadline");
    {
        let lost = recorder.lost.lock().expect("lost");
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].len(), 1);
        assert!(lost[0][0].terminated);

        // The merged frame published with the loss is dark.
        let frames = recorder.frames.lock().expect("frames");
        let last = frames.last().expect("frames nonempty");
        assert!(last.levels.iter().all(|&l| l == 0));
        assert!(last.active_sources.is_empty());
    }

    merge_receiver::destroy(handle).expect("destroy");
    sacn::deinit();
}

#[test]
fn test_raw_receiver_over_loopback() {
    let _guard = test_lock().lock().expect("test lock");
    sacn::init(None).expect("init");

    let recorder = Arc::new(RawRecorder::default());
    let handle = receiver::create(
        &ReceiverConfig::new(2),
        recorder.clone(),
        None,
    )
    .expect("create receiver");

    let mut sender = Sender::new(test_cid(2), 2);
    let got_data = wait_for(
        || sender.send(0x00, 120, &[7u8; 16]),
        || !recorder.packets.lock().expect("packets").is_empty(),
        Duration::from_secs(8),
    );
    assert!(got_data, "no universe data within the deadline");

    let packets = recorder.packets.lock().expect("packets");
    let (start_code, values) = &packets[0];
    assert_eq!(*start_code, 0x00);
    assert_eq!(values.as_slice(), &[7u8; 16]);
    drop(packets);

    receiver::destroy(handle).expect("destroy");
    sacn::deinit();
}

#[derive(Default)]
struct DetectorRecorder {
    updates: Mutex<Vec<(SourceCid, Vec<u16>)>>,
}

impl SourceDetectorNotify for DetectorRecorder {
    fn source_updated(
        &self,
        _handle: RemoteSourceHandle,
        cid: &SourceCid,
        _name: &str,
        sourced_universes: &[u16],
    ) {
        self.updates
            .lock()
            .expect("updates lock")
            .push((*cid, sourced_universes.to_vec()));
    }

    fn source_expired(&self, _handle: RemoteSourceHandle, _cid: &SourceCid, _name: &str) {}
}

#[test]
fn test_source_detector_over_loopback() {
    let _guard = test_lock().lock().expect("test lock");
    sacn::init(None).expect("init");

    let recorder = Arc::new(DetectorRecorder::default());
    source_detector::create(
        &SourceDetectorConfig::default(),
        recorder.clone(),
        None,
    )
    .expect("create detector");

    let socket = UdpSocket::bind("127.0.0.1:0").expect("bind sender");
    let universes: Vec<u16> = vec![1, 2, 7, 100];
    let mut buf = [0u8; MAX_PACKET_SIZE];
    let len = pack_discovery_page(&mut buf, &test_cid(9), "advertiser", 0, 0, &universes);

    let got_update = wait_for(
        || {
            socket
                .send_to(&buf[..len], ("127.0.0.1", SACN_PORT))
                .expect("send discovery");
        },
        || !recorder.updates.lock().expect("updates").is_empty(),
        Duration::from_secs(5),
    );
    assert!(got_update, "no source-updated within the deadline");

    let updates = recorder.updates.lock().expect("updates");
    let (cid, list) = &updates[0];
    assert_eq!(*cid, test_cid(9));
    assert_eq!(list, &universes);
    drop(updates);

    source_detector::destroy().expect("destroy detector");
    sacn::deinit();
}
