//! # lib_feedlink
//!
//! Market-data feed client with a connection-resilience and stream-continuity
//! engine: one logical session over a set of redundant feed servers, where the
//! physical connection can be replaced (loss, preferred-host fallback,
//! scheduled checks) without the application losing its item handles.

#![forbid(unsafe_code)]

// Endpoint description and policy
pub mod catalog;
pub mod policy;
pub mod schedule;

// Connection handling
pub mod supervisor;
pub mod transport;

// Control core
pub mod failover;
pub mod reconfig;
pub mod session;
pub mod watchlist;

// Boundaries
pub mod codec;
pub mod config;
pub mod error;

// Re-export the application-facing surface
pub use catalog::{ChannelCatalog, ChannelConfig, ConnectionFlavor, ServerInfo, Target, WarmStandbyGroup, WarmStandbyMode};
pub use codec::{Codec, DataState, JsonCodec, Msg, MsgClass, StreamState, StreamStatus};
pub use config::FeedConfig;
pub use error::{CodecError, ConfigError, ConnectError, PolicyError, SessionError};
pub use failover::{ConnectionState, FailoverCause, FailoverEvent};
pub use policy::{PreferredHostOptions, ReconnectOptions};
pub use schedule::{system_clock, WallClock};
pub use session::{ChannelEvent, ChannelInformation, Notification, PreferredHostInfo, Session, SessionConfig};
pub use transport::{Authenticator, BasicAuthenticator, TcpTransport, Transport};
pub use watchlist::{ItemEvent, ItemHandle, ItemInfo, ItemState, RequestKey};
