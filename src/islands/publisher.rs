//! Turns flush results and periodic reports into outbound JSON messages.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use super::error::PublishError;
use super::metrics;
use super::types::{IslandSnapshot, IslandUpdate, IslandUpdates};
use super::wire::{
    island_changed_subject, peer_join_subject, peer_left_subject, DiscoveryStatus, IslandChangedMessage,
    IslandData, IslandStatusMessage, JoinIslandMessage, LeftIslandMessage, ServiceDiscoveryMessage, Vector3,
    ISLANDS_REPORT_SUBJECT, SERVER_NAME, SERVICE_DISCOVERY_SUBJECT,
};

/// A subject-addressed message ready for the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    /// Metric label for the message family.
    pub kind: &'static str,
}

impl OutboundMessage {
    fn encode<T: Serialize>(subject: String, kind: &'static str, msg: &T) -> Result<Self, PublishError> {
        Ok(OutboundMessage {
            subject,
            payload: serde_json::to_vec(msg)?,
            kind,
        })
    }

    /// Decode the payload as JSON.
    pub fn json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Where outbound messages go (a broker connection, a channel, a pipe).
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn publish(&self, message: OutboundMessage) -> Result<(), PublishError>;
}

/// Sink that forwards every message into an mpsc channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<OutboundMessage>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<OutboundMessage>) -> Self {
        ChannelSink { tx }
    }
}

#[async_trait]
impl MessageSink for ChannelSink {
    async fn publish(&self, message: OutboundMessage) -> Result<(), PublishError> {
        self.tx.send(message).await.map_err(|_| PublishError::Closed)
    }
}

/// Sink that writes one `{"subject": ..., "payload": ...}` JSON line per
/// message.
pub struct LineSink<W> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> LineSink<W> {
    pub fn new(writer: W) -> Self {
        LineSink {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[derive(Serialize)]
struct Line<'a> {
    subject: &'a str,
    payload: serde_json::Value,
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> MessageSink for LineSink<W> {
    async fn publish(&self, message: OutboundMessage) -> Result<(), PublishError> {
        let line = Line {
            subject: &message.subject,
            payload: message.json()?,
        };
        let mut bytes = serde_json::to_vec(&line)?;
        bytes.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }
}

pub struct UpdatePublisher {
    sink: Arc<dyn MessageSink>,
    commit_hash: Option<String>,
}

impl UpdatePublisher {
    pub fn new(sink: Arc<dyn MessageSink>, commit_hash: Option<String>) -> Self {
        UpdatePublisher { sink, commit_hash }
    }

    /// Messages for one flush batch.
    ///
    /// A `ChangeTo` produces the island roster for the moved peer plus a
    /// join announcement to the island; a `Leave` produces a departure
    /// announcement. Updates pointing at an island that no longer exists are
    /// skipped.
    pub fn update_messages<F>(&self, updates: &IslandUpdates, island: F) -> Result<Vec<OutboundMessage>, PublishError>
    where
        F: Fn(&str) -> Option<IslandSnapshot>,
    {
        let mut rosters: HashMap<&str, Option<BTreeMap<String, Vector3>>> = HashMap::new();
        let mut out = Vec::with_capacity(updates.len() * 2);

        for (peer_id, update) in updates {
            match update {
                IslandUpdate::ChangeTo {
                    island_id,
                    conn_str,
                    from_island_id,
                } => {
                    let roster = rosters.entry(island_id.as_str()).or_insert_with(|| {
                        island(island_id).map(|snap| {
                            snap.peers
                                .iter()
                                .map(|p| (p.id.clone(), Vector3::from(p.position)))
                                .collect()
                        })
                    });
                    let Some(peers) = roster.clone() else {
                        debug!(peer = %peer_id, island = %island_id, "island gone, skipping update");
                        continue;
                    };

                    let changed = IslandChangedMessage {
                        island_id: island_id.clone(),
                        conn_str: conn_str.clone(),
                        from_island_id: from_island_id.clone(),
                        peers,
                    };
                    out.push(OutboundMessage::encode(
                        island_changed_subject(peer_id),
                        "island_changed",
                        &changed,
                    )?);

                    let join = JoinIslandMessage {
                        island_id: island_id.clone(),
                        peer_id: peer_id.clone(),
                    };
                    out.push(OutboundMessage::encode(peer_join_subject(island_id), "peer_join", &join)?);
                }
                IslandUpdate::Leave { island_id } => {
                    let left = LeftIslandMessage {
                        island_id: island_id.clone(),
                        peer_id: peer_id.clone(),
                    };
                    out.push(OutboundMessage::encode(peer_left_subject(island_id), "peer_left", &left)?);
                }
            }
        }
        Ok(out)
    }

    pub async fn publish_updates<F>(&self, updates: &IslandUpdates, island: F) -> Result<usize, PublishError>
    where
        F: Fn(&str) -> Option<IslandSnapshot>,
    {
        if updates.is_empty() {
            return Ok(0);
        }
        let messages = self.update_messages(updates, island)?;
        self.publish_all(messages).await
    }

    pub async fn publish_islands_report(&self, islands: &[IslandSnapshot]) -> Result<(), PublishError> {
        let report = IslandStatusMessage {
            data: islands.iter().map(IslandData::from).collect(),
        };
        let msg = OutboundMessage::encode(ISLANDS_REPORT_SUBJECT.to_string(), "islands_report", &report)?;
        self.publish_one(msg).await
    }

    pub async fn publish_service_discovery(&self, user_count: usize, island_count: usize) -> Result<(), PublishError> {
        let current_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let discovery = ServiceDiscoveryMessage {
            server_name: SERVER_NAME.to_string(),
            status: DiscoveryStatus {
                current_time,
                commit_hash: self.commit_hash.clone(),
                user_count,
                island_count,
            },
        };
        let msg = OutboundMessage::encode(SERVICE_DISCOVERY_SUBJECT.to_string(), "service_discovery", &discovery)?;
        self.publish_one(msg).await
    }

    async fn publish_all(&self, messages: Vec<OutboundMessage>) -> Result<usize, PublishError> {
        let n = messages.len();
        for msg in messages {
            self.publish_one(msg).await?;
        }
        Ok(n)
    }

    async fn publish_one(&self, msg: OutboundMessage) -> Result<(), PublishError> {
        let kind = msg.kind;
        self.sink.publish(msg).await?;
        metrics::message_published(kind);
        Ok(())
    }
}
