//! Archipelago: proximity clustering for a real-time presence service.
//!
//! Peers report positions; the island engine groups nearby peers into
//! bounded-size islands and binds each island to a transport room. The
//! driver task owns the engine and turns every flush into outbound
//! notifications.

pub mod islands;
