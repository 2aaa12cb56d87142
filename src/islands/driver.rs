//! The task that owns the engine.
//!
//! Exactly one tokio task holds the [`IslandEngine`]. Everything else talks
//! to it through an [`EngineHandle`], a cloneable command sender; reads get
//! their answer over a oneshot. The task also schedules flushes, expires
//! peers whose heartbeats stopped and emits the periodic reports.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::config::ArchipelagoConfig;
use super::engine::IslandEngine;
use super::error::DriverStopped;
use super::metrics;
use super::publisher::UpdatePublisher;
use super::remote_transport::RemoteTransport;
use super::transport::{Transport, TransportInfo};
use super::types::{IslandSnapshot, IslandUpdates, Peer, PositionChange};
use super::wire::{InboundEvent, TransportMessage};

/// Floor on the gap between two flushes.
pub const MIN_FLUSH_SPACING: Duration = Duration::from_millis(1);

const COMMAND_BUFFER: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct DriverConfig {
    pub flush_period: Duration,
    pub heartbeat_timeout: Duration,
    pub discovery_interval: Duration,
    pub islands_report_interval: Duration,
}

impl From<&ArchipelagoConfig> for DriverConfig {
    fn from(cfg: &ArchipelagoConfig) -> Self {
        DriverConfig {
            flush_period: cfg.flush_period,
            heartbeat_timeout: cfg.heartbeat_timeout,
            discovery_interval: cfg.discovery_interval,
            islands_report_interval: cfg.islands_report_interval,
        }
    }
}

pub enum Command {
    Heartbeat(PositionChange),
    /// A new session for this peer; any previous state is dropped.
    PeerConnected(String),
    PeerDisconnected(String),
    TransportHeartbeat {
        info: TransportInfo,
        transport: Arc<dyn Transport>,
    },
    TransportDisconnected(u32),
    /// Flush now, publish, and return the batch.
    Flush(oneshot::Sender<IslandUpdates>),
    Islands(oneshot::Sender<Vec<IslandSnapshot>>),
    Island(String, oneshot::Sender<Option<IslandSnapshot>>),
    Peer(String, oneshot::Sender<Option<Peer>>),
    PeerCount(oneshot::Sender<usize>),
}

/// Cloneable access to the engine task.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Command>,
}

impl EngineHandle {
    pub async fn heartbeat(&self, change: PositionChange) -> Result<(), DriverStopped> {
        self.send(Command::Heartbeat(change)).await
    }

    pub async fn peer_connected(&self, peer_id: impl Into<String>) -> Result<(), DriverStopped> {
        self.send(Command::PeerConnected(peer_id.into())).await
    }

    pub async fn peer_disconnected(&self, peer_id: impl Into<String>) -> Result<(), DriverStopped> {
        self.send(Command::PeerDisconnected(peer_id.into())).await
    }

    /// Route an inbound peer event to the matching command.
    pub async fn apply(&self, event: InboundEvent) -> Result<(), DriverStopped> {
        match event {
            InboundEvent::Heartbeat(hb) => self.heartbeat(hb.into_change()).await,
            InboundEvent::Connect { peer_id } => self.peer_connected(peer_id).await,
            InboundEvent::Disconnect { peer_id } => self.peer_disconnected(peer_id).await,
        }
    }

    pub async fn transport_heartbeat(
        &self,
        info: TransportInfo,
        transport: Arc<dyn Transport>,
    ) -> Result<(), DriverStopped> {
        self.send(Command::TransportHeartbeat { info, transport }).await
    }

    pub async fn transport_disconnected(&self, id: u32) -> Result<(), DriverStopped> {
        self.send(Command::TransportDisconnected(id)).await
    }

    pub async fn flush(&self) -> Result<IslandUpdates, DriverStopped> {
        self.request(Command::Flush).await
    }

    pub async fn islands(&self) -> Result<Vec<IslandSnapshot>, DriverStopped> {
        self.request(Command::Islands).await
    }

    pub async fn island(&self, id: impl Into<String>) -> Result<Option<IslandSnapshot>, DriverStopped> {
        let id = id.into();
        self.request(|tx| Command::Island(id, tx)).await
    }

    pub async fn peer(&self, id: impl Into<String>) -> Result<Option<Peer>, DriverStopped> {
        let id = id.into();
        self.request(|tx| Command::Peer(id, tx)).await
    }

    pub async fn peer_count(&self) -> Result<usize, DriverStopped> {
        self.request(Command::PeerCount).await
    }

    async fn send(&self, cmd: Command) -> Result<(), DriverStopped> {
        self.tx.send(cmd).await.map_err(|_| DriverStopped)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, DriverStopped> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| DriverStopped)
    }
}

/// Start the engine task.
pub fn spawn_driver(
    engine: IslandEngine,
    publisher: UpdatePublisher,
    config: DriverConfig,
    shutdown: broadcast::Receiver<()>,
) -> (EngineHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
    let task = tokio::spawn(run_driver(engine, publisher, config, rx, shutdown));
    (EngineHandle { tx }, task)
}

/// Engine task main loop. Stops on shutdown or when every handle is dropped.
pub async fn run_driver(
    mut engine: IslandEngine,
    publisher: UpdatePublisher,
    config: DriverConfig,
    mut commands: mpsc::Receiver<Command>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut last_heartbeat: HashMap<String, Instant> = HashMap::new();

    let flush_timer = tokio::time::sleep(config.flush_period);
    tokio::pin!(flush_timer);

    let mut expiry = interval_after(config.heartbeat_timeout);
    let mut discovery = interval_after(config.discovery_interval);
    let mut report = interval_after(config.islands_report_interval);

    info!(
        flush_period_ms = config.flush_period.as_millis() as u64,
        heartbeat_timeout_ms = config.heartbeat_timeout.as_millis() as u64,
        "engine driver started"
    );

    loop {
        tokio::select! {
            _ = &mut flush_timer => {
                let started = Instant::now();
                flush_and_publish(&mut engine, &publisher).await;
                let next = config.flush_period.saturating_sub(started.elapsed()).max(MIN_FLUSH_SPACING);
                flush_timer.as_mut().reset(Instant::now() + next);
            }
            cmd = commands.recv() => {
                let Some(cmd) = cmd else {
                    info!("all engine handles dropped, stopping driver");
                    break;
                };
                handle_command(cmd, &mut engine, &publisher, &mut last_heartbeat).await;
            }
            _ = expiry.tick() => {
                expire_peers(&mut engine, &mut last_heartbeat, config.heartbeat_timeout);
            }
            _ = discovery.tick() => {
                if let Err(err) = publisher
                    .publish_service_discovery(engine.peer_count(), engine.island_count())
                    .await
                {
                    warn!(error = %err, "failed to publish service discovery");
                }
            }
            _ = report.tick() => {
                if let Err(err) = publisher.publish_islands_report(&engine.islands()).await {
                    warn!(error = %err, "failed to publish islands report");
                }
            }
            _ = shutdown.recv() => {
                info!("engine driver shutting down");
                break;
            }
        }
    }
}

fn interval_after(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

async fn handle_command(
    cmd: Command,
    engine: &mut IslandEngine,
    publisher: &UpdatePublisher,
    last_heartbeat: &mut HashMap<String, Instant>,
) {
    match cmd {
        Command::Heartbeat(change) => {
            last_heartbeat.insert(change.id.clone(), Instant::now());
            engine.update_positions([change]);
        }
        Command::PeerConnected(peer_id) | Command::PeerDisconnected(peer_id) => {
            last_heartbeat.remove(&peer_id);
            engine.remove_peer(&peer_id);
        }
        Command::TransportHeartbeat { info, transport } => {
            engine.on_transport_heartbeat(info, transport);
        }
        Command::TransportDisconnected(id) => engine.on_transport_disconnected(id),
        Command::Flush(reply) => {
            let updates = flush_and_publish(engine, publisher).await;
            let _ = reply.send(updates);
        }
        Command::Islands(reply) => {
            let _ = reply.send(engine.islands());
        }
        Command::Island(id, reply) => {
            let _ = reply.send(engine.island(&id));
        }
        Command::Peer(id, reply) => {
            let _ = reply.send(engine.peer(&id));
        }
        Command::PeerCount(reply) => {
            let _ = reply.send(engine.peer_count());
        }
    }
}

async fn flush_and_publish(engine: &mut IslandEngine, publisher: &UpdatePublisher) -> IslandUpdates {
    let updates = engine.flush().await;
    let engine = &*engine;
    if let Err(err) = publisher.publish_updates(&updates, |id| engine.island(id)).await {
        warn!(error = %err, updates = updates.len(), "failed to publish updates");
    }
    updates
}

/// Remove every peer whose last heartbeat is older than `timeout`.
fn expire_peers(engine: &mut IslandEngine, last_heartbeat: &mut HashMap<String, Instant>, timeout: Duration) {
    let now = Instant::now();
    let expired: Vec<String> = last_heartbeat
        .iter()
        .filter(|&(_, &seen)| now.duration_since(seen) > timeout)
        .map(|(id, _)| id.clone())
        .collect();
    if expired.is_empty() {
        return;
    }
    for peer_id in &expired {
        last_heartbeat.remove(peer_id);
        engine.remove_peer(peer_id);
    }
    metrics::peers_expired(expired.len());
    debug!(expired = expired.len(), "removed peers with stale heartbeats");
}

/// Pump one remote transport connection into the engine.
///
/// Heartbeats (re)register the transport with its current capacity. When
/// `inbound` closes the transport is unregistered and its outstanding
/// credential requests fail.
pub async fn run_transport_session(
    handle: EngineHandle,
    remote: Arc<RemoteTransport>,
    mut inbound: mpsc::Receiver<TransportMessage>,
) -> Result<(), DriverStopped> {
    let id = remote.info().await.id;
    while let Some(msg) = inbound.recv().await {
        if let Some(info) = remote.handle_message(msg).await {
            let transport: Arc<dyn Transport> = remote.clone();
            handle.transport_heartbeat(info, transport).await?;
        }
    }
    remote.close().await;
    info!(transport = id, "transport session closed");
    handle.transport_disconnected(id).await
}
