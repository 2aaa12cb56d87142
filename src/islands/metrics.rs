//! Prometheus metrics for the island engine.
//!
//! All metric name constants live here. Call sites use the inline helpers
//! below rather than raw strings so renaming stays centralized.

use std::time::Duration;

use metrics::{counter, gauge, histogram};

use super::types::{IslandUpdate, IslandUpdates};

// ---------------------------------------------------------------------------
// Engine state
// ---------------------------------------------------------------------------

/// Current number of islands (gauge).
pub const ISLANDS_COUNT: &str = "archipelago_islands_count";
/// Current number of admitted peers (gauge).
pub const PEERS_COUNT: &str = "archipelago_peers_count";
/// Islands per transport kind (gauge, label `transport`).
pub const ISLANDS_BY_TRANSPORT: &str = "archipelago_islands_by_transport";
/// Peers per transport kind (gauge, label `transport`).
pub const PEERS_BY_TRANSPORT: &str = "archipelago_peers_by_transport";

// ---------------------------------------------------------------------------
// Flush
// ---------------------------------------------------------------------------

/// Wall-clock time of one flush in seconds (histogram).
pub const FLUSH_DURATION: &str = "archipelago_flush_duration_seconds";
/// Updates emitted by flushes (counter, label `action`).
pub const UPDATES_EMITTED: &str = "archipelago_updates_total";
/// Failed island creations or merges caused by transports (counter, label `stage`).
pub const TRANSPORT_FAILURES: &str = "archipelago_transport_failures_total";

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Peers removed because their heartbeat went stale (counter).
pub const EXPIRED_PEERS: &str = "archipelago_expired_peers_total";
/// Outbound messages handed to the sink (counter, label `kind`).
pub const MESSAGES_PUBLISHED: &str = "archipelago_messages_published_total";

// ---------------------------------------------------------------------------
// Inline helpers used at call sites
// ---------------------------------------------------------------------------

/// Record the outcome of one flush.
#[inline]
pub fn record_flush(islands: usize, peers: usize, elapsed: Duration, updates: &IslandUpdates) {
    gauge!(ISLANDS_COUNT).set(islands as f64);
    gauge!(PEERS_COUNT).set(peers as f64);
    histogram!(FLUSH_DURATION).record(elapsed.as_secs_f64());

    let leaves = updates
        .values()
        .filter(|u| matches!(u, IslandUpdate::Leave { .. }))
        .count();
    let changes = updates.len() - leaves;
    counter!(UPDATES_EMITTED, "action" => "change_to").increment(changes as u64);
    counter!(UPDATES_EMITTED, "action" => "leave").increment(leaves as u64);
}

/// Record island and peer counts for one transport kind.
#[inline]
pub fn transport_distribution(kind: &'static str, islands: usize, peers: usize) {
    gauge!(ISLANDS_BY_TRANSPORT, "transport" => kind).set(islands as f64);
    gauge!(PEERS_BY_TRANSPORT, "transport" => kind).set(peers as f64);
}

/// Record a transport-caused failure during `stage` (admission, split, merge).
#[inline]
pub fn transport_failure(stage: &'static str) {
    counter!(TRANSPORT_FAILURES, "stage" => stage).increment(1);
}

#[inline]
pub fn peers_expired(n: usize) {
    counter!(EXPIRED_PEERS).increment(n as u64);
}

#[inline]
pub fn message_published(kind: &'static str) {
    counter!(MESSAGES_PUBLISHED, "kind" => kind).increment(1);
}
