//! Room-allocation backends and the registry the engine places islands on.
//!
//! A transport hosts islands as rooms and mints one connection string per
//! peer. The registry tracks each transport's advertised capacity and brokers
//! credential requests; it never mutates its own state when a request fails.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::TransportError;

/// Id of the built-in peer-to-peer transport.
pub const P2P_TRANSPORT_ID: u32 = 0;

/// `available_seats` value meaning "no limit".
pub const UNLIMITED_SEATS: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    P2p,
    Livekit,
    Ws,
    #[serde(other)]
    Unknown,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::P2p => "p2p",
            TransportKind::Livekit => "livekit",
            TransportKind::Ws => "ws",
            TransportKind::Unknown => "unknown",
        }
    }
}

/// Advertised capacity of a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportInfo {
    pub id: u32,
    pub kind: TransportKind,
    /// Free seats, or [`UNLIMITED_SEATS`].
    pub available_seats: i64,
    pub users_count: u64,
    pub max_island_size: usize,
}

impl TransportInfo {
    pub fn is_unlimited(&self) -> bool {
        self.available_seats == UNLIMITED_SEATS
    }
}

/// Capability to mint per-peer connection strings for a room.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connection_strings(
        &self,
        peer_ids: &[String],
        room_id: &str,
    ) -> Result<HashMap<String, String>, TransportError>;
}

/// Built-in transport: peers connect to each other directly, so any room id
/// is valid and credentials are derived locally.
#[derive(Debug, Default, Clone)]
pub struct P2pTransport;

impl P2pTransport {
    pub fn info(max_island_size: usize) -> TransportInfo {
        TransportInfo {
            id: P2P_TRANSPORT_ID,
            kind: TransportKind::P2p,
            available_seats: UNLIMITED_SEATS,
            users_count: 0,
            max_island_size,
        }
    }
}

#[async_trait]
impl Transport for P2pTransport {
    async fn connection_strings(
        &self,
        peer_ids: &[String],
        room_id: &str,
    ) -> Result<HashMap<String, String>, TransportError> {
        Ok(peer_ids
            .iter()
            .map(|peer| (peer.clone(), format!("p2p:{room_id}:{peer}")))
            .collect())
    }
}

struct Registered {
    info: TransportInfo,
    transport: Arc<dyn Transport>,
}

/// Known transports, iterated in ascending id order.
#[derive(Default)]
pub struct TransportRegistry {
    transports: BTreeMap<u32, Registered>,
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transport or refresh its info. Returns `true` if it was new.
    pub fn upsert(&mut self, info: TransportInfo, transport: Arc<dyn Transport>) -> bool {
        self.transports
            .insert(info.id, Registered { info, transport })
            .is_none()
    }

    pub fn remove(&mut self, id: u32) -> Option<TransportInfo> {
        self.transports.remove(&id).map(|entry| entry.info)
    }

    pub fn get(&self, id: u32) -> Option<&TransportInfo> {
        self.transports.get(&id).map(|entry| &entry.info)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TransportInfo> {
        self.transports.values().map(|entry| &entry.info)
    }

    pub fn len(&self) -> usize {
        self.transports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }

    /// Ask transport `transport_id` for credentials for every peer in
    /// `peer_ids`, to join room `room_id`.
    ///
    /// The result is all-or-nothing: a response missing any requested peer
    /// is reported as [`TransportError::MissingCredentials`].
    pub async fn request_connection_strings(
        &self,
        transport_id: u32,
        peer_ids: &[String],
        room_id: &str,
    ) -> Result<HashMap<String, String>, TransportError> {
        let transport = self
            .transports
            .get(&transport_id)
            .map(|entry| Arc::clone(&entry.transport))
            .ok_or(TransportError::UnknownTransport(transport_id))?;

        let conn_strs = transport.connection_strings(peer_ids, room_id).await?;

        if let Some(missing) = peer_ids.iter().find(|id| !conn_strs.contains_key(*id)) {
            return Err(TransportError::MissingCredentials {
                peer_id: missing.clone(),
            });
        }
        Ok(conn_strs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Partial;

    #[async_trait]
    impl Transport for Partial {
        async fn connection_strings(
            &self,
            peer_ids: &[String],
            room_id: &str,
        ) -> Result<HashMap<String, String>, TransportError> {
            Ok(peer_ids
                .iter()
                .take(1)
                .map(|p| (p.clone(), format!("partial:{room_id}")))
                .collect())
        }
    }

    fn livekit(id: u32, seats: i64) -> TransportInfo {
        TransportInfo {
            id,
            kind: TransportKind::Livekit,
            available_seats: seats,
            users_count: 0,
            max_island_size: 50,
        }
    }

    #[tokio::test]
    async fn p2p_mints_a_string_per_peer() {
        let mut registry = TransportRegistry::new();
        registry.upsert(P2pTransport::info(100), Arc::new(P2pTransport));

        let ids = vec!["1".to_string(), "2".to_string()];
        let conn = registry.request_connection_strings(0, &ids, "I4").await.unwrap();
        assert_eq!(conn["1"], "p2p:I4:1");
        assert_eq!(conn["2"], "p2p:I4:2");
    }

    #[tokio::test]
    async fn unknown_transport_is_an_error() {
        let registry = TransportRegistry::new();
        let err = registry
            .request_connection_strings(7, &["1".to_string()], "I1")
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::UnknownTransport(7));
    }

    #[tokio::test]
    async fn partial_response_is_rejected() {
        let mut registry = TransportRegistry::new();
        registry.upsert(livekit(3, 100), Arc::new(Partial));

        let ids = vec!["a".to_string(), "b".to_string()];
        let err = registry
            .request_connection_strings(3, &ids, "I1")
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::MissingCredentials { peer_id: "b".into() });
        assert_eq!(registry.get(3).unwrap().available_seats, 100);
    }

    #[test]
    fn iteration_is_by_ascending_id() {
        let mut registry = TransportRegistry::new();
        assert!(registry.upsert(livekit(9, 10), Arc::new(P2pTransport)));
        assert!(registry.upsert(livekit(2, 10), Arc::new(P2pTransport)));
        assert!(!registry.upsert(livekit(9, 20), Arc::new(P2pTransport)));

        let ids: Vec<u32> = registry.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![2, 9]);
        assert_eq!(registry.get(9).unwrap().available_seats, 20);

        assert_eq!(registry.remove(2).unwrap().id, 2);
        assert!(registry.remove(5).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unknown_kind_deserializes() {
        let kind: TransportKind = serde_json::from_str("\"carrier-pigeon\"").unwrap();
        assert_eq!(kind, TransportKind::Unknown);
        assert_eq!(TransportKind::Livekit.as_str(), "livekit");
    }
}
