//! JSON wire messages.
//!
//! Three families: inbound peer events fed to the driver, outbound
//! notifications produced by the publisher, and the transport protocol spoken
//! with remote room services. Every enum is tagged by a `type` field.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Deserializer, Serialize};

use super::geometry::Position3D;
use super::transport::TransportKind;
use super::types::{IslandSnapshot, PositionChange, PreferredIsland};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl From<Position3D> for Vector3 {
    fn from(p: Position3D) -> Self {
        Vector3 {
            x: p[0],
            y: p[1],
            z: p[2],
        }
    }
}

impl From<Vector3> for Position3D {
    fn from(v: Vector3) -> Self {
        [v.x, v.y, v.z]
    }
}

// ---------------------------------------------------------------------------
// Inbound peer events
// ---------------------------------------------------------------------------

/// Position report from a peer.
///
/// `preferred_island_id` is tri-state: absent leaves the stored preference
/// alone, `null` or `""` clears it, a string sets it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HeartbeatMessage {
    pub peer_id: String,
    pub position: Vector3,
    #[serde(default, deserialize_with = "preferred_island")]
    pub preferred_island_id: PreferredIsland,
}

impl HeartbeatMessage {
    pub fn into_change(self) -> PositionChange {
        PositionChange::new(self.peer_id, self.position.into())
            .with_preferred_island(self.preferred_island_id)
    }
}

fn preferred_island<'de, D: Deserializer<'de>>(d: D) -> Result<PreferredIsland, D::Error> {
    let value: Option<String> = Option::deserialize(d)?;
    Ok(match value {
        Some(id) if !id.is_empty() => PreferredIsland::Set(id),
        _ => PreferredIsland::Clear,
    })
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum InboundEvent {
    #[serde(rename = "heartbeat")]
    Heartbeat(HeartbeatMessage),

    /// A peer opened a new session; any previous state is discarded.
    #[serde(rename = "connect")]
    Connect { peer_id: String },

    #[serde(rename = "disconnect")]
    Disconnect { peer_id: String },
}

// ---------------------------------------------------------------------------
// Outbound notifications
// ---------------------------------------------------------------------------

pub fn island_changed_subject(peer_id: &str) -> String {
    format!("client-proto.{peer_id}.island_changed")
}

pub fn peer_join_subject(island_id: &str) -> String {
    format!("client-proto.island.{island_id}.peer_join")
}

pub fn peer_left_subject(island_id: &str) -> String {
    format!("client-proto.island.{island_id}.peer_left")
}

pub const ISLANDS_REPORT_SUBJECT: &str = "archipelago.islands";
pub const SERVICE_DISCOVERY_SUBJECT: &str = "service.discovery";
pub const SERVER_NAME: &str = "archipelago";

/// Sent to a peer that moved to a new island, with the island's roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IslandChangedMessage {
    pub island_id: String,
    pub conn_str: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_island_id: Option<String>,
    pub peers: BTreeMap<String, Vector3>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinIslandMessage {
    pub island_id: String,
    pub peer_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeftIslandMessage {
    pub island_id: String,
    pub peer_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IslandData {
    pub id: String,
    pub center: Vector3,
    pub radius: f64,
    pub max_peers: usize,
    pub peers: Vec<String>,
}

impl From<&IslandSnapshot> for IslandData {
    fn from(island: &IslandSnapshot) -> Self {
        IslandData {
            id: island.id.clone(),
            center: island.center.into(),
            radius: island.radius,
            max_peers: island.max_peers,
            peers: island.peer_ids(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IslandStatusMessage {
    pub data: Vec<IslandData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryStatus {
    /// Unix time in milliseconds.
    pub current_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    pub user_count: usize,
    pub island_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDiscoveryMessage {
    pub server_name: String,
    pub status: DiscoveryStatus,
}

// ---------------------------------------------------------------------------
// Transport protocol
// ---------------------------------------------------------------------------

/// Messages exchanged with a remote room service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TransportMessage {
    /// First message from the service: what it is and how big a room may get.
    #[serde(rename = "init")]
    Init {
        max_island_size: usize,
        kind: TransportKind,
    },

    /// Periodic capacity report from the service.
    #[serde(rename = "heartbeat")]
    Heartbeat {
        available_seats: i64,
        users_count: u64,
    },

    /// Credentials request, sent to the service.
    #[serde(rename = "auth_request")]
    AuthRequest {
        request_id: String,
        user_ids: Vec<String>,
        room_id: String,
    },

    #[serde(rename = "auth_response")]
    AuthResponse {
        request_id: String,
        conn_strs: HashMap<String, String>,
    },

    #[serde(rename = "auth_rejected")]
    AuthRejected { request_id: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat(json: &str) -> HeartbeatMessage {
        match serde_json::from_str::<InboundEvent>(json).unwrap() {
            InboundEvent::Heartbeat(hb) => hb,
            other => panic!("expected heartbeat, got {other:?}"),
        }
    }

    #[test]
    fn heartbeat_preference_tri_state() {
        let absent = heartbeat(r#"{"type":"heartbeat","peer_id":"1","position":{"x":1,"y":2,"z":3}}"#);
        assert_eq!(absent.preferred_island_id, PreferredIsland::Unchanged);
        assert_eq!(absent.position, Vector3 { x: 1.0, y: 2.0, z: 3.0 });

        let null = heartbeat(
            r#"{"type":"heartbeat","peer_id":"1","position":{"x":0,"y":0,"z":0},"preferred_island_id":null}"#,
        );
        assert_eq!(null.preferred_island_id, PreferredIsland::Clear);

        let empty = heartbeat(
            r#"{"type":"heartbeat","peer_id":"1","position":{"x":0,"y":0,"z":0},"preferred_island_id":""}"#,
        );
        assert_eq!(empty.preferred_island_id, PreferredIsland::Clear);

        let set = heartbeat(
            r#"{"type":"heartbeat","peer_id":"1","position":{"x":0,"y":0,"z":0},"preferred_island_id":"I3"}"#,
        );
        let change = set.into_change();
        assert_eq!(change.preferred_island, PreferredIsland::Set("I3".into()));
        assert_eq!(change.id, "1");
    }

    #[test]
    fn connect_and_disconnect_events() {
        let ev: InboundEvent = serde_json::from_str(r#"{"type":"connect","peer_id":"p"}"#).unwrap();
        assert_eq!(ev, InboundEvent::Connect { peer_id: "p".into() });
        let ev: InboundEvent = serde_json::from_str(r#"{"type":"disconnect","peer_id":"p"}"#).unwrap();
        assert_eq!(ev, InboundEvent::Disconnect { peer_id: "p".into() });
        assert!(serde_json::from_str::<InboundEvent>(r#"{"type":"teleport","peer_id":"p"}"#).is_err());
    }

    #[test]
    fn transport_messages_are_type_tagged() {
        let msg = TransportMessage::AuthRequest {
            request_id: "r1".into(),
            user_ids: vec!["a".into()],
            room_id: "I1".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "auth_request");
        assert_eq!(json["room_id"], "I1");

        let init: TransportMessage =
            serde_json::from_str(r#"{"type":"init","max_island_size":50,"kind":"livekit"}"#).unwrap();
        assert_eq!(
            init,
            TransportMessage::Init {
                max_island_size: 50,
                kind: TransportKind::Livekit
            }
        );
    }

    #[test]
    fn subjects() {
        assert_eq!(island_changed_subject("p1"), "client-proto.p1.island_changed");
        assert_eq!(peer_join_subject("I2"), "client-proto.island.I2.peer_join");
        assert_eq!(peer_left_subject("I2"), "client-proto.island.I2.peer_left");
    }
}
