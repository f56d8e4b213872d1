//! Broadcast hub for live claim updates
//!
//! Owns the set of live connections, assigns sequence ids and fans out change
//! events. One hub instance is the single owner of this state; construct as
//! many as needed (tests build independent hubs).
//!
//! # Connection lifecycle
//! - `register`: retry hint + `connected` acknowledgement, heartbeat started
//! - any failed write (event or heartbeat): connection unregistered on the spot
//! - `unregister`: heartbeat aborted, connection removed; idempotent
//!
//! Delivery is best-effort. There is no replay buffer: a client that reconnects
//! only sees events raised after it registered again.
//!
//! # Watcher lifecycle
//! An attached [`ChangeDetector`] runs only while at least one connection is
//! live: started on the 0 -> 1 transition, stopped on 1 -> 0.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use clientsync_common::config::HubConfig;
use clientsync_common::{Change, ChangeEvent, Error, Frame, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::poller::{ChangeDetector, ChangeSink, PollerHandle};

/// Opaque per-hub connection identifier
pub type ConnectionId = u64;

/// Write side of one live connection
///
/// Writes must not block: a sink that cannot take a frame right now reports a
/// failure and gets unregistered.
pub trait FrameSink: Send + Sync {
    fn try_send(&self, frame: Frame) -> Result<()>;
}

/// Bounded channel sink feeding an SSE response stream
pub struct ChannelSink {
    tx: mpsc::Sender<Frame>,
}

impl ChannelSink {
    /// Create a sink and the receiver its SSE stream drains
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl FrameSink for ChannelSink {
    fn try_send(&self, frame: Frame) -> Result<()> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                Error::Transport("client buffer full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                Error::Transport("client disconnected".to_string())
            }
        })
    }
}

/// Hub timing settings
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub heartbeat_interval: Duration,
    pub retry_hint: Duration,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self::from(&HubConfig::default())
    }
}

impl From<&HubConfig> for HubSettings {
    fn from(config: &HubConfig) -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(config.heartbeat_secs.max(1)),
            retry_hint: Duration::from_millis(config.retry_ms),
        }
    }
}

struct Connection {
    sink: Arc<dyn FrameSink>,
    heartbeat: Option<JoinHandle<()>>,
}

struct HubInner {
    settings: HubSettings,
    connections: Mutex<HashMap<ConnectionId, Connection>>,
    next_connection: AtomicU64,
    sequence: AtomicU64,
    detector: Option<Arc<ChangeDetector>>,
    watcher: Mutex<Option<PollerHandle>>,
}

/// Live-connection registry and event fan-out
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    /// Hub without a change detector (claim-trigger events only)
    pub fn new(settings: HubSettings) -> Self {
        Self::build(settings, None)
    }

    /// Hub that runs `detector` while clients are connected
    pub fn with_detector(settings: HubSettings, detector: Arc<ChangeDetector>) -> Self {
        Self::build(settings, Some(detector))
    }

    fn build(settings: HubSettings, detector: Option<Arc<ChangeDetector>>) -> Self {
        info!(
            heartbeat_secs = settings.heartbeat_interval.as_secs(),
            watcher = detector.is_some(),
            "Broadcast hub initialized"
        );
        Self {
            inner: Arc::new(HubInner {
                settings,
                connections: Mutex::new(HashMap::new()),
                next_connection: AtomicU64::new(1),
                sequence: AtomicU64::new(0),
                detector,
                watcher: Mutex::new(None),
            }),
        }
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<ConnectionId, Connection>> {
        self.inner
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn watcher(&self) -> MutexGuard<'_, Option<PollerHandle>> {
        self.inner.watcher.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.connections().len()
    }

    /// Last sequence id handed out (0 before the first broadcast)
    pub fn last_sequence_id(&self) -> u64 {
        self.inner.sequence.load(Ordering::SeqCst)
    }

    /// Whether the change detector loop is currently running
    pub fn watcher_running(&self) -> bool {
        self.watcher().is_some()
    }

    /// Add a connection, greet it and start its heartbeat
    ///
    /// Must be called from within a Tokio runtime. If the greeting cannot be
    /// written the connection is dropped immediately and never counted.
    pub fn register(&self, sink: Arc<dyn FrameSink>) -> Option<ConnectionId> {
        let id = self.inner.next_connection.fetch_add(1, Ordering::SeqCst);

        if let Err(e) = sink
            .try_send(Frame::Retry(self.inner.settings.retry_hint))
            .and_then(|_| sink.try_send(Frame::connected()))
        {
            warn!(connection = id, "Dropping connection before registration: {}", e);
            return None;
        }

        let heartbeat = self.spawn_heartbeat(id);
        let live = {
            let mut connections = self.connections();
            connections.insert(
                id,
                Connection {
                    sink,
                    heartbeat: Some(heartbeat),
                },
            );
            if connections.len() == 1 {
                self.start_watcher();
            }
            connections.len()
        };

        info!(connection = id, live, "Live client connected");
        Some(id)
    }

    /// Remove a connection; repeated calls are no-ops
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let (removed, live) = {
            let mut connections = self.connections();
            let removed = connections.remove(&id);
            if removed.is_some() && connections.is_empty() {
                self.stop_watcher();
            }
            (removed, connections.len())
        };

        match removed {
            Some(mut connection) => {
                if let Some(heartbeat) = connection.heartbeat.take() {
                    heartbeat.abort();
                }
                info!(connection = id, live, "Live client disconnected");
                true
            }
            None => false,
        }
    }

    /// Stamp `change` with the next sequence id and write it to every connection
    ///
    /// The id is taken and the event written under the connection lock, so
    /// every client sees ids in increasing order. Sink writes never block.
    /// Connections whose write fails are unregistered after the lock is
    /// released; the rest still receive the event.
    pub fn broadcast(&self, change: Change) -> ChangeEvent {
        let (event, delivered, failed) = {
            let connections = self.connections();
            let sequence_id = self.inner.sequence.fetch_add(1, Ordering::SeqCst) + 1;
            let event = change.sequenced(sequence_id);

            let mut failed = Vec::new();
            for (id, connection) in connections.iter() {
                if let Err(e) = connection.sink.try_send(Frame::Change(event.clone())) {
                    warn!(connection = id, sequence_id, "Write failed, unregistering: {}", e);
                    failed.push(*id);
                }
            }
            let delivered = connections.len() - failed.len();
            (event, delivered, failed)
        };

        for id in &failed {
            self.unregister(*id);
        }

        debug!(
            sequence_id = event.sequence_id,
            change_type = %event.change_type(),
            entity_id = event.entity_id(),
            delivered,
            "Broadcast change event"
        );
        event
    }

    /// Write one frame to one connection, unregistering it on failure
    fn write_to(&self, id: ConnectionId, frame: Frame) -> bool {
        let sink = match self.connections().get(&id) {
            Some(connection) => Arc::clone(&connection.sink),
            None => return false,
        };
        match sink.try_send(frame) {
            Ok(()) => true,
            Err(e) => {
                warn!(connection = id, "Heartbeat write failed, unregistering: {}", e);
                self.unregister(id);
                false
            }
        }
    }

    fn spawn_heartbeat(&self, id: ConnectionId) -> JoinHandle<()> {
        let hub = self.clone();
        let period = self.inner.settings.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !hub.write_to(id, Frame::Heartbeat) {
                    break;
                }
            }
        })
    }

    // Called with the connection lock held so transitions stay ordered
    fn start_watcher(&self) {
        let Some(detector) = &self.inner.detector else {
            return;
        };
        let mut watcher = self.watcher();
        if watcher.is_none() {
            info!("First live client connected, starting change detector");
            *watcher = Some(Arc::clone(detector).spawn(self.clone()));
        }
    }

    fn stop_watcher(&self) {
        if let Some(handle) = self.watcher().take() {
            info!("Last live client disconnected, stopping change detector");
            handle.stop();
        }
    }

    /// Drop every connection and stop the watcher
    ///
    /// Sequence ids keep counting so reconnecting clients never see ids reused.
    pub fn reset(&self) {
        let drained: Vec<(ConnectionId, Connection)> = self.connections().drain().collect();
        for (_, mut connection) in drained {
            if let Some(heartbeat) = connection.heartbeat.take() {
                heartbeat.abort();
            }
        }
        self.stop_watcher();
        info!("Broadcast hub reset");
    }
}

impl ChangeSink for BroadcastHub {
    fn publish(&self, change: Change) {
        self.broadcast(change);
    }
}
