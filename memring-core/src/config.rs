//! Client configuration. Every pluggable seam is a tagged variant or a
//! trait object here; nothing is constructed from strings at runtime.

use std::sync::Arc;

use crate::auth::AuthConfig;
use crate::keys::KeyTransform;
use crate::locator::LocatorKind;
use crate::pool::SocketPoolConfig;
use crate::protocol::{BinaryCodec, ProtocolCodec};
use crate::transcode::{DefaultTranscoder, Transcoder};

/// Everything needed to stand up a [`crate::client::Client`].
#[derive(Clone)]
pub struct ClientConfig<T: Transcoder = DefaultTranscoder> {
    /// `host:port` endpoints. Hostnames resolve at connect time.
    pub servers: Vec<String>,
    /// Per-node pool sizing and timeouts.
    pub socket_pool: SocketPoolConfig,
    /// SASL credentials, applied to every new socket when present.
    pub authentication: Option<AuthConfig>,
    /// Application-key to protocol-key mapping.
    pub key_transform: KeyTransform,
    /// Key-to-node selection strategy.
    pub node_locator: LocatorKind,
    /// Value conversion. Swapping the transcoder changes the client's
    /// type parameter, so this is a plain field rather than a variant.
    pub transcoder: T,
    /// The wire dialect. The binary codec is the default; alternatives
    /// implement [`ProtocolCodec`].
    pub protocol: Arc<dyn ProtocolCodec>,
}

impl ClientConfig<DefaultTranscoder> {
    /// A config with defaults for everything but the server list.
    pub fn new(servers: Vec<String>) -> Self {
        Self {
            servers,
            socket_pool: SocketPoolConfig::default(),
            authentication: None,
            key_transform: KeyTransform::default(),
            node_locator: LocatorKind::default(),
            transcoder: DefaultTranscoder,
            protocol: Arc::new(BinaryCodec),
        }
    }
}

impl<T: Transcoder> ClientConfig<T> {
    pub fn with_socket_pool(mut self, socket_pool: SocketPoolConfig) -> Self {
        self.socket_pool = socket_pool;
        self
    }

    pub fn with_authentication(mut self, auth: AuthConfig) -> Self {
        self.authentication = Some(auth);
        self
    }

    pub fn with_key_transform(mut self, key_transform: KeyTransform) -> Self {
        self.key_transform = key_transform;
        self
    }

    pub fn with_node_locator(mut self, node_locator: LocatorKind) -> Self {
        self.node_locator = node_locator;
        self
    }

    pub fn with_protocol(mut self, protocol: Arc<dyn ProtocolCodec>) -> Self {
        self.protocol = protocol;
        self
    }

    /// Replace the transcoder, changing the client's value handling.
    pub fn with_transcoder<T2: Transcoder>(self, transcoder: T2) -> ClientConfig<T2> {
        ClientConfig {
            servers: self.servers,
            socket_pool: self.socket_pool,
            authentication: self.authentication,
            key_transform: self.key_transform,
            node_locator: self.node_locator,
            transcoder,
            protocol: self.protocol,
        }
    }
}
