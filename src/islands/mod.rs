//! Island engine and its collaborators.
//!
//! Leaves first: `geometry` and `id_gen` are pure helpers, `transport` and
//! `remote_transport` model room backends, `engine` is the clustering core,
//! `publisher` and `driver` connect it to the outside world.

pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod geometry;
pub mod id_gen;
pub mod metrics;
pub mod publisher;
pub mod remote_transport;
pub mod transport;
pub mod types;
pub mod wire;

pub use config::ArchipelagoConfig;
pub use driver::{spawn_driver, Command, DriverConfig, EngineHandle};
pub use engine::{EngineOptions, IslandEngine};
pub use error::{ConfigError, DriverStopped, EngineError, PublishError, TransportError};
pub use publisher::{MessageSink, UpdatePublisher};
pub use transport::{P2pTransport, Transport, TransportInfo, TransportKind, TransportRegistry};
pub use types::{IslandSnapshot, IslandUpdate, IslandUpdates, Peer, PositionChange, PreferredIsland};
