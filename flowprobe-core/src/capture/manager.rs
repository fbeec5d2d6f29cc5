//! Capture manager
//!
//! Owns all per-interface capture state machines and their writers, drives
//! periodic rotation from a scheduler thread, and performs bounded-grace
//! shutdown. The manager also holds the DB root's advisory write lock, so a
//! second capturing process against the same database is rejected at startup.

use super::{
    interval_timestamp, unix_now, validate_iface_name, Capture, CaptureConfig, Command,
    InterfaceStatus, Source, WriteJob,
};
use crate::db::{DbLock, DbWriter};
use crate::encoder::EncoderType;
use crate::{config, ProbeError, Result, Timestamp};
use crossbeam_channel::{bounded, tick, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Manager configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// DB root directory
    pub db_path: PathBuf,
    /// Block encoder used for new intervals
    pub encoder: EncoderType,
    /// Rotation interval in seconds
    pub rotation_interval: Timestamp,
}

impl ManagerConfig {
    /// Config with the default encoder and rotation interval
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            encoder: EncoderType::default(),
            rotation_interval: config::ROTATION_INTERVAL,
        }
    }
}

struct CaptureHandle {
    cmd_tx: Sender<Command>,
    capture_thread: JoinHandle<()>,
    writer_thread: JoinHandle<()>,
}

/// Owns and coordinates all interface capture state machines
pub struct Manager {
    config: ManagerConfig,
    _lock: DbLock,

    senders: Arc<Mutex<HashMap<String, Sender<Command>>>>,
    handles: HashMap<String, CaptureHandle>,

    error_tx: Sender<(String, ProbeError)>,
    error_rx: Receiver<(String, ProbeError)>,

    scheduler_stop: Sender<()>,
    scheduler_thread: Option<JoinHandle<()>>,
}

impl Manager {
    /// Initialize the manager and start capturing on the given interfaces
    pub fn init(
        config: ManagerConfig,
        interfaces: Vec<(String, CaptureConfig, Box<dyn Source>)>,
    ) -> Result<Self> {
        if interfaces.len() > crate::config::MAX_IFACES {
            return Err(ProbeError::Config(format!(
                "cannot monitor more than {} interfaces",
                crate::config::MAX_IFACES
            )));
        }
        for (name, _, _) in &interfaces {
            validate_iface_name(name)?;
        }

        let lock = DbLock::acquire(&config.db_path)?;
        let (error_tx, error_rx) = unbounded();

        let mut manager = Self {
            config,
            _lock: lock,
            senders: Arc::new(Mutex::new(HashMap::new())),
            handles: HashMap::new(),
            error_tx,
            error_rx,
            scheduler_stop: unbounded().0, // replaced below
            scheduler_thread: None,
        };

        for (name, capture_config, source) in interfaces {
            manager.spawn_interface(name, capture_config, source)?;
        }
        manager.start_scheduler();

        info!(
            db_path = %manager.config.db_path.display(),
            interfaces = manager.handles.len(),
            "capture manager started"
        );

        Ok(manager)
    }

    /// Errors surfaced by capture sources and writers
    pub fn capture_errors(&self) -> &Receiver<(String, ProbeError)> {
        &self.error_rx
    }

    /// Start capturing on an additional interface
    pub fn enable(
        &mut self,
        name: impl Into<String>,
        capture_config: CaptureConfig,
        source: Box<dyn Source>,
    ) -> Result<()> {
        let name = name.into();
        validate_iface_name(&name)?;
        if self.handles.contains_key(&name) {
            return Err(ProbeError::Config(format!(
                "interface {} is already being captured",
                name
            )));
        }
        self.spawn_interface(name, capture_config, source)
    }

    /// Stop capturing on an interface (waits for its final flush)
    pub fn disable(&mut self, name: &str, grace: Duration) -> Result<()> {
        let handle = self.handles.remove(name).ok_or_else(|| {
            ProbeError::Config(format!("interface {} is not being captured", name))
        })?;
        self.senders.lock().remove(name);

        let (reply_tx, reply_rx) = bounded(1);
        let _ = handle.cmd_tx.send(Command::Close { reply: reply_tx });
        if reply_rx.recv_timeout(grace).is_err() {
            warn!(iface = name, "interface did not close within grace period");
            return Ok(());
        }
        let _ = handle.capture_thread.join();
        drop(handle.cmd_tx);
        let _ = handle.writer_thread.join();
        Ok(())
    }

    /// Push a new capture policy to a running interface
    pub fn update_config(&self, name: &str, capture_config: CaptureConfig) -> Result<()> {
        let senders = self.senders.lock();
        let tx = senders.get(name).ok_or_else(|| {
            ProbeError::Config(format!("interface {} is not being captured", name))
        })?;
        tx.send(Command::UpdateConfig {
            config: capture_config,
        })
        .map_err(|_| ProbeError::Capture(format!("interface {} is gone", name)))
    }

    /// Trigger a rotation of all interfaces at the current interval timestamp
    pub fn rotate_all(&self) {
        Self::rotate_interfaces(&self.senders, self.config.rotation_interval);
    }

    /// Collect status snapshots from all interfaces
    pub fn status(&self) -> BTreeMap<String, InterfaceStatus> {
        let senders: Vec<(String, Sender<Command>)> = self
            .senders
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut statuses = BTreeMap::new();
        for (name, tx) in senders {
            let (reply_tx, reply_rx) = bounded(1);
            if tx.send(Command::Status { reply: reply_tx }).is_err() {
                continue;
            }
            if let Ok(status) = reply_rx.recv_timeout(Duration::from_secs(1)) {
                statuses.insert(name, status);
            }
        }
        statuses
    }

    /// Names of all captured interfaces
    pub fn interfaces(&self) -> Vec<String> {
        self.handles.keys().cloned().collect()
    }

    /// Shut down all interfaces, each performing one final flush. Interfaces
    /// that do not finish within the grace period are abandoned.
    pub fn close(mut self, grace: Duration) {
        let _ = self.scheduler_stop.send(());
        if let Some(handle) = self.scheduler_thread.take() {
            let _ = handle.join();
        }

        let deadline = Instant::now() + grace;
        let mut replies = Vec::new();
        for (name, handle) in &self.handles {
            let (reply_tx, reply_rx) = bounded(1);
            let _ = handle.cmd_tx.send(Command::Close { reply: reply_tx });
            replies.push((name.clone(), reply_rx));
        }

        let mut closed = Vec::new();
        for (name, reply_rx) in replies {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if reply_rx.recv_timeout(remaining).is_ok() {
                closed.push(name);
            } else {
                warn!(iface = %name, "abandoning interface after shutdown grace period");
            }
        }

        self.senders.lock().clear();
        for name in closed {
            if let Some(handle) = self.handles.remove(&name) {
                let _ = handle.capture_thread.join();
                drop(handle.cmd_tx);
                let _ = handle.writer_thread.join();
            }
        }
        info!("capture manager closed");
    }

    fn spawn_interface(
        &mut self,
        name: String,
        capture_config: CaptureConfig,
        source: Box<dyn Source>,
    ) -> Result<()> {
        let (cmd_tx, cmd_rx) = unbounded();
        // rendezvous: at most one interval in flight per interface
        let (write_tx, write_rx) = bounded::<WriteJob>(0);
        // completions must never block the writer, or a blocked rendezvous
        // hand-off could deadlock against a blocked completion send
        let (done_tx, done_rx) = unbounded();

        let capture = Capture::new(
            name.clone(),
            capture_config,
            self.config.rotation_interval,
            cmd_rx,
            write_tx,
            done_rx,
            self.error_tx.clone(),
            source,
        );

        let mut writer = DbWriter::new(&self.config.db_path, &name, self.config.encoder);
        let writer_thread = std::thread::Builder::new()
            .name(format!("writer-{}", name))
            .spawn(move || {
                for job in write_rx {
                    let result = writer.write(&job.map, job.meta, job.timestamp);
                    if let Err(e) = &result {
                        warn!(iface = writer.iface(), error = %e, "interval write failed");
                    }
                    let _ = done_tx.send(result);
                }
            })?;

        let capture_thread = std::thread::Builder::new()
            .name(format!("capture-{}", name))
            .spawn(move || capture.process())?;

        self.senders.lock().insert(name.clone(), cmd_tx.clone());
        self.handles.insert(
            name,
            CaptureHandle {
                cmd_tx,
                capture_thread,
                writer_thread,
            },
        );
        Ok(())
    }

    fn start_scheduler(&mut self) {
        let (stop_tx, stop_rx) = bounded(1);
        self.scheduler_stop = stop_tx;

        let senders = Arc::clone(&self.senders);
        let interval = self.config.rotation_interval;
        let ticker = tick(Duration::from_secs(interval.max(1) as u64));

        self.scheduler_thread = Some(
            std::thread::Builder::new()
                .name("rotation-scheduler".into())
                .spawn(move || loop {
                    crossbeam_channel::select! {
                        recv(ticker) -> _ => Self::rotate_interfaces(&senders, interval),
                        recv(stop_rx) -> _ => return,
                    }
                })
                .expect("failed to spawn rotation scheduler"),
        );
    }

    fn rotate_interfaces(
        senders: &Mutex<HashMap<String, Sender<Command>>>,
        interval: Timestamp,
    ) {
        let timestamp = interval_timestamp(unix_now(), interval);
        let senders: Vec<Sender<Command>> = senders.lock().values().cloned().collect();
        for tx in senders {
            let _ = tx.send(Command::Rotate { timestamp });
        }
    }
}
