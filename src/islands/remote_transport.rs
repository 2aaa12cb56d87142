//! Transport backed by a remote room service.
//!
//! The service speaks [`TransportMessage`]s over whatever connection the
//! caller owns: outbound messages go into an mpsc channel, inbound ones are
//! fed to [`RemoteTransport::handle_message`]. Credential requests wait on a
//! oneshot keyed by a fresh request id and fail after `auth_timeout`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::TransportError;
use super::transport::{Transport, TransportInfo, TransportKind};
use super::wire::TransportMessage;

/// How long a credential request may wait for the service's answer.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(1);

type ConnStrs = HashMap<String, String>;
type PendingReply = oneshot::Sender<Result<ConnStrs, TransportError>>;

pub struct RemoteTransport {
    outbound: mpsc::Sender<TransportMessage>,
    /// Outstanding auth requests: request id → waiting caller.
    pending: Mutex<HashMap<String, PendingReply>>,
    info: Mutex<TransportInfo>,
    auth_timeout: Duration,
}

impl std::fmt::Debug for RemoteTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTransport")
            .field("auth_timeout", &self.auth_timeout)
            .finish_non_exhaustive()
    }
}

impl RemoteTransport {
    /// A transport that has not sent `init` yet: unknown kind, no seats.
    pub fn new(id: u32, outbound: mpsc::Sender<TransportMessage>) -> Self {
        RemoteTransport {
            outbound,
            pending: Mutex::new(HashMap::new()),
            info: Mutex::new(TransportInfo {
                id,
                kind: TransportKind::Unknown,
                available_seats: 0,
                users_count: 0,
                max_island_size: 0,
            }),
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
        }
    }

    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    pub async fn info(&self) -> TransportInfo {
        self.info.lock().await.clone()
    }

    pub async fn pending_requests(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Process one message from the service.
    ///
    /// Returns the refreshed info on `heartbeat`; the caller forwards it to
    /// the engine so the transport is (re)registered with current capacity.
    pub async fn handle_message(&self, msg: TransportMessage) -> Option<TransportInfo> {
        match msg {
            TransportMessage::Init {
                max_island_size,
                kind,
            } => {
                let mut state = self.info.lock().await;
                state.kind = kind;
                state.max_island_size = max_island_size;
                info!(transport = state.id, kind = kind.as_str(), max_island_size, "transport init");
                None
            }
            TransportMessage::Heartbeat {
                available_seats,
                users_count,
            } => {
                let mut state = self.info.lock().await;
                state.available_seats = available_seats;
                state.users_count = users_count;
                Some(state.clone())
            }
            TransportMessage::AuthResponse {
                request_id,
                conn_strs,
            } => {
                self.resolve(&request_id, Ok(conn_strs)).await;
                None
            }
            TransportMessage::AuthRejected { request_id, reason } => {
                self.resolve(&request_id, Err(TransportError::Rejected(reason)))
                    .await;
                None
            }
            TransportMessage::AuthRequest { request_id, .. } => {
                warn!(%request_id, "transport sent an auth_request, ignoring");
                None
            }
        }
    }

    /// Fail every outstanding request. Called when the connection drops.
    pub async fn close(&self) {
        let pending: Vec<PendingReply> = self.pending.lock().await.drain().map(|(_, tx)| tx).collect();
        for tx in pending {
            let _ = tx.send(Err(TransportError::Disconnected));
        }
    }

    async fn resolve(&self, request_id: &str, result: Result<ConnStrs, TransportError>) {
        match self.pending.lock().await.remove(request_id) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            // Late answer to a request that already timed out.
            None => debug!(%request_id, "no pending auth request"),
        }
    }
}

#[async_trait]
impl Transport for RemoteTransport {
    async fn connection_strings(
        &self,
        peer_ids: &[String],
        room_id: &str,
    ) -> Result<ConnStrs, TransportError> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);

        let request = TransportMessage::AuthRequest {
            request_id: request_id.clone(),
            user_ids: peer_ids.to_vec(),
            room_id: room_id.to_string(),
        };
        if self.outbound.send(request).await.is_err() {
            self.pending.lock().await.remove(&request_id);
            return Err(TransportError::Disconnected);
        }

        match tokio::time::timeout(self.auth_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Disconnected),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                warn!(%request_id, %room_id, "auth request timed out");
                Err(TransportError::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn transport() -> (Arc<RemoteTransport>, mpsc::Receiver<TransportMessage>) {
        let (tx, rx) = mpsc::channel(16);
        (Arc::new(RemoteTransport::new(5, tx)), rx)
    }

    #[tokio::test]
    async fn init_and_heartbeat_update_info() {
        let (remote, _rx) = transport();
        assert!(remote
            .handle_message(TransportMessage::Init {
                max_island_size: 40,
                kind: TransportKind::Livekit,
            })
            .await
            .is_none());

        let info = remote
            .handle_message(TransportMessage::Heartbeat {
                available_seats: 120,
                users_count: 7,
            })
            .await
            .unwrap();
        assert_eq!(info.id, 5);
        assert_eq!(info.kind, TransportKind::Livekit);
        assert_eq!(info.max_island_size, 40);
        assert_eq!(info.available_seats, 120);
        assert_eq!(remote.info().await.users_count, 7);
    }

    #[tokio::test]
    async fn auth_round_trip_through_channel() {
        let (remote, mut rx) = transport();

        let service = {
            let remote = Arc::clone(&remote);
            tokio::spawn(async move {
                if let Some(TransportMessage::AuthRequest { request_id, user_ids, room_id }) = rx.recv().await {
                    let conn_strs = user_ids
                        .iter()
                        .map(|u| (u.clone(), format!("livekit:{room_id}?u={u}")))
                        .collect();
                    remote
                        .handle_message(TransportMessage::AuthResponse { request_id, conn_strs })
                        .await;
                }
            })
        };

        let conn = remote
            .connection_strings(&["a".to_string()], "I2")
            .await
            .unwrap();
        assert_eq!(conn["a"], "livekit:I2?u=a");
        service.await.unwrap();
        assert_eq!(remote.pending_requests().await, 0);
    }

    #[tokio::test]
    async fn rejection_is_reported() {
        let (remote, mut rx) = transport();
        let service = {
            let remote = Arc::clone(&remote);
            tokio::spawn(async move {
                if let Some(TransportMessage::AuthRequest { request_id, .. }) = rx.recv().await {
                    remote
                        .handle_message(TransportMessage::AuthRejected {
                            request_id,
                            reason: "room full".into(),
                        })
                        .await;
                }
            })
        };

        let err = remote
            .connection_strings(&["a".to_string()], "I2")
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Rejected("room full".into()));
        service.await.unwrap();
    }

    #[tokio::test]
    async fn unanswered_request_times_out() {
        let (tx, _rx) = mpsc::channel(16);
        let remote = RemoteTransport::new(5, tx).with_auth_timeout(Duration::from_millis(20));
        let err = remote
            .connection_strings(&["a".to_string()], "I1")
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Timeout);
        assert_eq!(remote.pending_requests().await, 0);
    }

    #[tokio::test]
    async fn closed_channel_is_disconnected() {
        let (remote, rx) = transport();
        drop(rx);
        let err = remote
            .connection_strings(&["a".to_string()], "I1")
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Disconnected);
        assert_eq!(remote.pending_requests().await, 0);
    }

    #[tokio::test]
    async fn close_fails_outstanding_requests() {
        let (remote, _rx) = transport();
        let request = {
            let remote = Arc::clone(&remote);
            tokio::spawn(async move { remote.connection_strings(&["a".to_string()], "I1").await })
        };
        while remote.pending_requests().await == 0 {
            tokio::task::yield_now().await;
        }
        remote.close().await;
        assert_eq!(request.await.unwrap().unwrap_err(), TransportError::Disconnected);
    }
}
