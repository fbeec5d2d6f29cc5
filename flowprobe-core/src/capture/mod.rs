//! Packet capture and rotation
//!
//! One capture state machine per interface: packets stream from a [`Source`]
//! into the live flow map, and external commands (rotate, status, config
//! update, close) arrive on a single-consumer command channel. Rotation swaps
//! the live map for a fresh one and moves the captured map to the interface's
//! writer through a rendezvous channel, so at most one interval is in flight
//! and a writeout that overruns the rotation interval simply delays the next
//! hand-off.

pub mod manager;

pub use manager::{Manager, ManagerConfig};

use crate::db::{BlockMetadata, InterfaceSummaryUpdate};
use crate::flowmap::{FlowKey, FlowMap};
use crate::{config, ProbeError, Result, Timestamp};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

/// A packet as delivered by a capture source: the parsed 5-tuple view plus
/// the source's direction hint
#[derive(Debug, Clone, Copy)]
pub struct Packet {
    pub sip: IpAddr,
    pub dip: IpAddr,
    pub dport: u16,
    pub proto: u8,
    pub total_len: u32,
    pub inbound: bool,
}

/// Outcome of polling a capture source
#[derive(Debug)]
pub enum SourcePoll {
    /// A packet was captured
    Packet(Packet),
    /// The poll interval elapsed without traffic
    Timeout,
    /// The source has drained and will never yield again
    Exhausted,
}

/// Contract of the ring-buffered packet source.
///
/// `next_packet` may block for a short poll interval; the capture loop
/// interleaves command handling between polls. Any `Err` is fatal for the
/// source and closes the owning interface after a final flush.
pub trait Source: Send {
    fn next_packet(&mut self) -> Result<SourcePoll>;

    /// Cumulative source-level statistics
    fn stats(&mut self) -> CaptureStats;

    fn close(&mut self);
}

/// Packet statistics of one interface
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct CaptureStats {
    /// Packets received by the source
    pub received: u64,
    /// Packets processed into the flow map
    pub processed: u64,
    /// Packets dropped at the source (ring overrun)
    pub dropped: u64,
}

/// Per-interface capture policy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Put the device into promiscuous mode
    pub promiscuous: bool,
    /// Ring buffer size hint in bytes (0 = source default)
    pub ring_buffer_size: usize,
    /// Invert the source's direction hint (counts inbound packets as sent)
    pub reverse_direction: bool,
}

/// States of the per-interface capture state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureState {
    Initializing,
    Active,
    Rotating,
    Closing,
    Closed,
}

/// Point-in-time status snapshot of one interface
#[derive(Debug, Clone, Serialize)]
pub struct InterfaceStatus {
    pub iface: String,
    pub state: CaptureState,
    /// Flows currently tracked in the live map
    pub flows: usize,
    pub stats: CaptureStats,
    pub last_rotation_stats: CaptureStats,
}

/// Commands accepted by a capture state machine
pub(crate) enum Command {
    Rotate { timestamp: Timestamp },
    Status { reply: Sender<InterfaceStatus> },
    UpdateConfig { config: CaptureConfig },
    Close { reply: Sender<()> },
}

/// A rotated interval on its way to the writer
pub(crate) struct WriteJob {
    pub(crate) map: FlowMap,
    pub(crate) meta: BlockMetadata,
    pub(crate) timestamp: Timestamp,
}

/// Wall clock in epoch seconds
pub(crate) fn unix_now() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Wall-clock time floored to the rotation interval
pub fn interval_timestamp(now: Timestamp, interval: Timestamp) -> Timestamp {
    now - now.rem_euclid(interval.max(1))
}

/// Validate an interface name (non-empty, bounded length, path-safe)
pub fn validate_iface_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ProbeError::Config(
            "interface list contains empty interface name".into(),
        ));
    }
    if name.len() > config::MAX_IFACE_NAME_LEN
        || name.chars().any(|c| c == '/' || c.is_whitespace())
    {
        return Err(ProbeError::Config(format!(
            "interface name `{}` is invalid",
            name
        )));
    }
    Ok(())
}

/// Per-interface capture state machine
pub(crate) struct Capture {
    iface: String,
    capture_config: CaptureConfig,
    rotation_interval: Timestamp,

    state: CaptureState,
    flow_map: FlowMap,
    processed: u64,
    dropped_at_last_rotation: u64,
    last_rotation_stats: CaptureStats,

    cmd_rx: Receiver<Command>,
    write_tx: Sender<WriteJob>,
    write_done_rx: Receiver<Result<InterfaceSummaryUpdate>>,
    error_tx: Sender<(String, ProbeError)>,

    source: Box<dyn Source>,
}

impl Capture {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        iface: String,
        capture_config: CaptureConfig,
        rotation_interval: Timestamp,
        cmd_rx: Receiver<Command>,
        write_tx: Sender<WriteJob>,
        write_done_rx: Receiver<Result<InterfaceSummaryUpdate>>,
        error_tx: Sender<(String, ProbeError)>,
        source: Box<dyn Source>,
    ) -> Self {
        Self {
            iface,
            capture_config,
            rotation_interval,
            state: CaptureState::Initializing,
            flow_map: FlowMap::new(),
            processed: 0,
            dropped_at_last_rotation: 0,
            last_rotation_stats: CaptureStats::default(),
            cmd_rx,
            write_tx,
            write_done_rx,
            error_tx,
            source,
        }
    }

    /// Main capture loop; runs on the interface's own thread until closed
    pub(crate) fn process(mut self) {
        self.state = CaptureState::Active;
        info!(iface = %self.iface, "capture started");

        loop {
            self.poll_write_completion();
            if self.state == CaptureState::Closed {
                return;
            }

            // drain pending commands before touching the source again
            loop {
                match self.cmd_rx.try_recv() {
                    Ok(Command::Rotate { timestamp }) => self.rotate(timestamp),
                    Ok(Command::Status { reply }) => {
                        let _ = reply.send(self.status());
                    }
                    Ok(Command::UpdateConfig { config }) => {
                        debug!(iface = %self.iface, "capture config updated");
                        self.capture_config = config;
                    }
                    Ok(Command::Close { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        return;
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        self.shutdown();
                        return;
                    }
                }
            }

            match self.source.next_packet() {
                Ok(SourcePoll::Packet(packet)) => self.ingest(&packet),
                Ok(SourcePoll::Timeout) => {}
                Ok(SourcePoll::Exhausted) => {
                    info!(iface = %self.iface, "capture source exhausted");
                    self.shutdown();
                    return;
                }
                Err(e) => {
                    error!(iface = %self.iface, error = %e, "fatal capture source error");
                    let _ = self.error_tx.send((self.iface.clone(), e));
                    self.shutdown();
                    return;
                }
            }
        }
    }

    fn ingest(&mut self, packet: &Packet) {
        let inbound = packet.inbound != self.capture_config.reverse_direction;
        self.flow_map.update(
            FlowKey::from_packet(packet.sip, packet.dip, packet.dport, packet.proto),
            inbound,
            packet.total_len as u64,
            1,
        );
        self.processed += 1;
    }

    // Hand the captured map to the writer. The swap is a single ownership
    // transfer: packets observed before this point are in `map`, everything
    // after lands in the fresh live map.
    fn rotate(&mut self, timestamp: Timestamp) {
        let map = std::mem::take(&mut self.flow_map);

        let source_stats = self.source.stats();
        let snapshot = CaptureStats {
            received: source_stats.received,
            processed: self.processed,
            dropped: source_stats.dropped,
        };
        let meta = BlockMetadata {
            packets_dropped: source_stats
                .dropped
                .saturating_sub(self.dropped_at_last_rotation),
            pcap_packets_received: Some(source_stats.received),
            pcap_packets_dropped: Some(source_stats.dropped),
            ..BlockMetadata::default()
        };
        self.dropped_at_last_rotation = source_stats.dropped;
        self.last_rotation_stats = snapshot;

        self.state = CaptureState::Rotating;
        debug!(iface = %self.iface, timestamp, flows = map.len(), "rotating flow map");

        // rendezvous hand-off: blocks only while the previous interval is
        // still being written, which delays this rotation as intended
        if self
            .write_tx
            .send(WriteJob {
                map,
                meta,
                timestamp,
            })
            .is_err()
        {
            error!(iface = %self.iface, "writer is gone, closing interface");
            self.source.close();
            self.state = CaptureState::Closed;
        }
    }

    fn poll_write_completion(&mut self) {
        loop {
            match self.write_done_rx.try_recv() {
                Ok(Ok(update)) => {
                    debug!(
                        iface = %self.iface,
                        timestamp = update.timestamp,
                        flows = update.flow_count,
                        "interval persisted"
                    );
                    if self.state == CaptureState::Rotating {
                        self.state = CaptureState::Active;
                    }
                }
                Ok(Err(e)) if e.is_fatal_for_interface() => {
                    error!(iface = %self.iface, error = %e, "fatal writer error, closing interface");
                    let _ = self.error_tx.send((self.iface.clone(), e));
                    self.source.close();
                    self.state = CaptureState::Closed;
                    return;
                }
                Ok(Err(e)) => {
                    warn!(iface = %self.iface, error = %e, "interval dropped");
                    if self.state == CaptureState::Rotating {
                        self.state = CaptureState::Active;
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return,
            }
        }
    }

    fn status(&mut self) -> InterfaceStatus {
        let source_stats = self.source.stats();
        InterfaceStatus {
            iface: self.iface.clone(),
            state: self.state,
            flows: self.flow_map.len(),
            stats: CaptureStats {
                received: source_stats.received,
                processed: self.processed,
                dropped: source_stats.dropped,
            },
            last_rotation_stats: self.last_rotation_stats,
        }
    }

    // One last flush of the live map, then release the source.
    fn shutdown(&mut self) {
        self.state = CaptureState::Closing;
        if !self.flow_map.is_empty() {
            let timestamp = interval_timestamp(unix_now(), self.rotation_interval);
            self.rotate(timestamp);
        }
        self.source.close();
        self.state = CaptureState::Closed;
        info!(iface = %self.iface, "capture closed");
    }
}

/// Deterministic in-memory capture source.
///
/// Stands in for the ring-buffered device in tests and demos: it yields its
/// queued packets in order and then either reports exhaustion or idles.
pub struct MockSource {
    packets: VecDeque<Packet>,
    stats: CaptureStats,
    exhaust_when_empty: bool,
    poll_interval: Duration,
}

impl MockSource {
    /// A source that idles (times out) once drained
    pub fn new() -> Self {
        Self {
            packets: VecDeque::new(),
            stats: CaptureStats::default(),
            exhaust_when_empty: false,
            poll_interval: Duration::from_millis(1),
        }
    }

    /// A source that reports exhaustion once drained
    pub fn with_packets(packets: impl IntoIterator<Item = Packet>) -> Self {
        Self {
            packets: packets.into_iter().collect(),
            stats: CaptureStats::default(),
            exhaust_when_empty: true,
            poll_interval: Duration::from_millis(1),
        }
    }

    /// Queue another packet
    pub fn add_packet(&mut self, packet: Packet) {
        self.packets.push_back(packet);
    }

    /// Record ring drops as a real device would
    pub fn add_dropped(&mut self, n: u64) {
        self.stats.dropped += n;
    }
}

impl Default for MockSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Source for MockSource {
    fn next_packet(&mut self) -> Result<SourcePoll> {
        match self.packets.pop_front() {
            Some(packet) => {
                self.stats.received += 1;
                Ok(SourcePoll::Packet(packet))
            }
            None if self.exhaust_when_empty => Ok(SourcePoll::Exhausted),
            None => {
                std::thread::sleep(self.poll_interval);
                Ok(SourcePoll::Timeout)
            }
        }
    }

    fn stats(&mut self) -> CaptureStats {
        self.stats
    }

    fn close(&mut self) {
        self.packets.clear();
    }
}

/// Build a test packet with sensible defaults
pub fn test_packet(sip: IpAddr, dip: IpAddr, dport: u16, proto: u8, len: u32, inbound: bool) -> Packet {
    Packet {
        sip,
        dip,
        dport,
        proto,
        total_len: len,
        inbound,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{self, metadata};
    use crate::encoder::EncoderType;
    use crossbeam_channel::{bounded, unbounded};
    use std::net::Ipv4Addr;
    use tempfile::TempDir;

    fn packet(dport: u16) -> Packet {
        test_packet(
            IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)),
            IpAddr::V4(Ipv4Addr::new(4, 5, 6, 7)),
            dport,
            6,
            128,
            true,
        )
    }

    #[test]
    fn test_interval_timestamp() {
        assert_eq!(interval_timestamp(1_000_123, 300), 1_000_200 - 300);
        assert_eq!(interval_timestamp(1_000_200, 300), 1_000_200);
        assert_eq!(interval_timestamp(0, 300), 0);
    }

    #[test]
    fn test_validate_iface_name() {
        assert!(validate_iface_name("eth0").is_ok());
        assert!(validate_iface_name("eth.15").is_ok());
        assert!(validate_iface_name("eth:0").is_ok());
        assert!(validate_iface_name("").is_err());
        assert!(validate_iface_name("eth/0").is_err());
        assert!(validate_iface_name("eth 0").is_err());
        assert!(validate_iface_name("thisinterfacenameisfartoolong").is_err());
    }

    // every packet lands in exactly one interval, regardless of when
    // rotations interleave with ingestion
    #[test]
    fn test_rotation_atomicity() {
        let dir = TempDir::new().unwrap();
        let total_packets: u64 = 500;

        // distinct dports yield distinct flows, so flow counts add up
        let source = MockSource::with_packets((1..=total_packets).map(|i| packet(i as u16)));

        let (cmd_tx, cmd_rx) = unbounded();
        let (write_tx, write_rx) = bounded(0);
        let (done_tx, done_rx) = unbounded();
        let (err_tx, _err_rx) = unbounded();

        let capture = Capture::new(
            "mock0".into(),
            CaptureConfig::default(),
            300,
            cmd_rx,
            write_tx,
            done_rx,
            err_tx,
            Box::new(source),
        );

        let db_path = dir.path().to_path_buf();
        let writer_thread = std::thread::spawn(move || {
            let mut writer = db::DbWriter::new(&db_path, "mock0", EncoderType::Lz4);
            for job in write_rx {
                let res = writer.write(&job.map, job.meta, job.timestamp);
                let _ = done_tx.send(res);
            }
        });

        let capture_thread = std::thread::spawn(move || capture.process());

        // rotate a handful of times while packets stream in
        for i in 0..5i64 {
            std::thread::sleep(Duration::from_millis(5));
            let _ = cmd_tx.send(Command::Rotate {
                timestamp: 1_000_000 + i * 300,
            });
        }

        capture_thread.join().unwrap();
        drop(cmd_tx);
        writer_thread.join().unwrap();

        // sum flow counts over every interval ever written for the interface
        let mut written_flows = 0u64;
        let iface_dir = dir.path().join("mock0");
        for entry in std::fs::read_dir(&iface_dir).unwrap() {
            let day_dir = entry.unwrap().path();
            let meta = metadata::read_metadata(&day_dir.join(db::METADATA_FILE_NAME)).unwrap();
            for block in meta.blocks {
                written_flows += block.flow_count;
            }
        }
        assert_eq!(written_flows, total_packets);
    }

    #[test]
    fn test_status_and_close() {
        let (cmd_tx, cmd_rx) = unbounded();
        let (write_tx, write_rx) = bounded(0);
        let (_done_tx, done_rx) = unbounded();
        let (err_tx, _err_rx) = unbounded();

        let mut source = MockSource::new();
        source.add_packet(packet(80));
        source.add_packet(packet(443));

        let capture = Capture::new(
            "mock1".into(),
            CaptureConfig::default(),
            300,
            cmd_rx,
            write_tx,
            done_rx,
            err_tx,
            Box::new(source),
        );
        let handle = std::thread::spawn(move || capture.process());

        // drain any final-flush job so close does not block on the rendezvous
        let drain = std::thread::spawn(move || for _job in write_rx {});

        std::thread::sleep(Duration::from_millis(20));
        let (reply_tx, reply_rx) = bounded(1);
        cmd_tx.send(Command::Status { reply: reply_tx }).unwrap();
        let status = reply_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(status.state, CaptureState::Active);
        assert_eq!(status.flows, 2);
        assert_eq!(status.stats.processed, 2);

        let (close_tx, close_rx) = bounded(1);
        cmd_tx.send(Command::Close { reply: close_tx }).unwrap();
        close_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        handle.join().unwrap();
        drop(cmd_tx);
        drain.join().unwrap();
    }
}
