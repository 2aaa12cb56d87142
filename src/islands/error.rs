use thiserror::Error;

/// Failure while asking a transport for connection strings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport {0} is not registered")]
    UnknownTransport(u32),

    #[error("transport rejected the request: {0}")]
    Rejected(String),

    #[error("request timeout")]
    Timeout,

    #[error("transport connection closed")]
    Disconnected,

    #[error("no connection string returned for peer {peer_id}")]
    MissingCredentials { peer_id: String },
}

/// Failure while creating an island.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("cannot create island for {group_size} peer(s): no transport with free capacity")]
    NoTransportAvailable { group_size: usize },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Invalid or missing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Failure while handing a message to the outbound sink.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("sink closed")]
    Closed,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// The driver task has stopped; the handle can no longer reach the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("engine driver stopped")]
pub struct DriverStopped;
