//! Transport-agnostic core of a clustered memcached client.
//!
//! Keys are spread across nodes with a consistent-hash ring, each node
//! keeps a bounded pool of sockets with health tracking and automatic
//! revival, and values travel as tagged payloads so they decode back into
//! the types they were stored as.
//!
//! All I/O happens through the [`connection::Connection`] trait; pair this
//! crate with a transport implementation (e.g. `memring-tokio`) or a mock
//! for tests. A typical setup:
//!
//! ```ignore
//! use memring_core::{client::Client, config::ClientConfig};
//!
//! let config = ClientConfig::new(vec![
//!     "cache-a:11211".into(),
//!     "cache-b:11211".into(),
//! ]);
//! let client = Client::<TokioConnection>::connect(config).await?;
//! client.store(StoreMode::Set, "greeting", "hello", Expiration::Never).await;
//! ```

pub mod auth;
pub mod client;
mod cluster;
pub mod config;
pub mod connection;
pub mod error;
pub mod keys;
pub mod locator;
mod node;
pub mod pool;
pub mod protocol;
pub mod transcode;

pub use auth::AuthConfig;
pub use client::{
    CacheResult, CasValue, Client, ClientManager, CounterPolicy, Expiration, Pool, StoreMode,
};
pub use config::ClientConfig;
pub use connection::Connection;
pub use error::Error;
pub use keys::{KeyTransform, KeyTransformer};
pub use locator::{LocatorKind, NodeLocator};
pub use pool::SocketPoolConfig;
pub use protocol::Status;
pub use transcode::{DefaultTranscoder, Payload, Transcoder};
