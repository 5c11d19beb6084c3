//! Per-node socket pooling. Each node owns a bounded set of TCP sockets;
//! one operation holds a socket at a time, and a socket that observed any
//! error is destroyed rather than reused, because partial bytes on the
//! wire make the stream unusable.

use bytes::BytesMut;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::timeout;

use crate::auth::{self, AuthConfig};
use crate::connection::Connection;
use crate::error::Error;
use crate::protocol::{Operation, ProtocolCodec, ProtocolError, Response};

/// Pool sizing and timeouts, per node.
#[derive(Debug, Clone)]
pub struct SocketPoolConfig {
    /// Sockets opened eagerly at startup and on revival.
    pub min_pool_size: usize,
    /// Hard cap on sockets per node, idle and checked out together.
    pub max_pool_size: usize,
    /// Limit on TCP connect plus the authentication handshake.
    pub connect_timeout: Duration,
    /// Limit on waiting for a response frame.
    pub receive_timeout: Duration,
    /// How long a dead node rests between revival probes.
    pub dead_timeout: Duration,
    /// Limit on waiting for a free socket when the pool is at capacity.
    pub queue_timeout: Duration,
}

impl Default for SocketPoolConfig {
    fn default() -> Self {
        Self {
            min_pool_size: 1,
            max_pool_size: 16,
            connect_timeout: Duration::from_secs(5),
            receive_timeout: Duration::from_secs(10),
            dead_timeout: Duration::from_secs(10),
            queue_timeout: Duration::from_secs(2),
        }
    }
}

/// A pooled stream: the connection plus its framing buffers and the
/// per-socket opaque counter used to pair responses with requests.
pub(crate) struct Socket<C> {
    conn: C,
    rbuf: BytesMut,
    wbuf: BytesMut,
    opaque: u32,
}

impl<C: Connection> Socket<C> {
    fn new(conn: C) -> Self {
        Self {
            conn,
            rbuf: BytesMut::new(),
            wbuf: BytesMut::new(),
            opaque: 0,
        }
    }

    /// Encode a request into the outbound buffer without flushing it,
    /// returning the opaque assigned to it. Pipelines queue several
    /// requests this way and flush them in one write.
    pub(crate) fn enqueue(&mut self, codec: &dyn ProtocolCodec, op: &Operation) -> u32 {
        self.opaque = self.opaque.wrapping_add(1);
        codec.encode(op, self.opaque, &mut self.wbuf);
        self.opaque
    }

    /// Write the outbound buffer to the stream.
    pub(crate) async fn flush(&mut self) -> Result<(), Error> {
        if self.wbuf.is_empty() {
            return Ok(());
        }
        let out = self.wbuf.split();
        self.conn.write(&out).await
    }

    /// Read one response frame, waiting at most `receive_timeout` per read.
    pub(crate) async fn read_frame(
        &mut self,
        codec: &dyn ProtocolCodec,
        receive_timeout: Duration,
    ) -> Result<Response, Error> {
        loop {
            if let Some(response) = codec.decode(&mut self.rbuf)? {
                return Ok(response);
            }
            let mut chunk = [0u8; 8 * 1024];
            let read = match timeout(receive_timeout, self.conn.read(&mut chunk)).await {
                Ok(result) => result?,
                Err(_) => return Err(Error::ReadTimeout),
            };
            if read == 0 {
                return Err(ProtocolError::UnexpectedEof.into());
            }
            self.rbuf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Write one request and read its paired response.
    pub(crate) async fn roundtrip(
        &mut self,
        codec: &dyn ProtocolCodec,
        op: &Operation,
        receive_timeout: Duration,
    ) -> Result<Response, Error> {
        let opaque = self.enqueue(codec, op);
        self.flush().await?;
        let response = self.read_frame(codec, receive_timeout).await?;
        if response.opaque != opaque {
            return Err(ProtocolError::OpaqueMismatch {
                sent: opaque,
                received: response.opaque,
            }
            .into());
        }
        Ok(response)
    }
}

struct PoolState<C> {
    idle: VecDeque<Socket<C>>,
    open: usize,
}

/// A bounded pool of sockets to one endpoint.
pub(crate) struct SocketPool<C: Connection> {
    endpoint: String,
    auth: Option<AuthConfig>,
    pub(crate) cfg: SocketPoolConfig,
    state: Mutex<PoolState<C>>,
    slots: Semaphore,
}

impl<C: Connection> SocketPool<C> {
    pub(crate) fn new(endpoint: String, auth: Option<AuthConfig>, cfg: SocketPoolConfig) -> Self {
        let slots = Semaphore::new(cfg.max_pool_size);
        Self {
            endpoint,
            auth,
            cfg,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                open: 0,
            }),
            slots,
        }
    }

    pub(crate) fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Check out a socket: an idle one if available, a fresh one if the
    /// pool has room, and otherwise wait up to `queue_timeout` for a
    /// checkout slot.
    pub(crate) async fn acquire(
        &self,
        codec: &dyn ProtocolCodec,
    ) -> Result<SocketLease<'_, C>, Error> {
        let permit = match timeout(self.cfg.queue_timeout, self.slots.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => return Err(Error::PoolExhausted),
        };
        if let Some(socket) = self.pop_idle() {
            return Ok(SocketLease::new(self, socket, permit));
        }
        if !self.reserve(self.cfg.max_pool_size) {
            return Err(Error::PoolExhausted);
        }
        match self.open_socket(codec).await {
            Ok(socket) => Ok(SocketLease::new(self, socket, permit)),
            Err(err) => {
                self.unreserve();
                Err(err)
            }
        }
    }

    /// Open sockets until `min_pool_size` are alive. Best effort: the
    /// first failure stops the fill and is reported to the caller, who
    /// decides whether it matters.
    pub(crate) async fn prefill(&self, codec: &dyn ProtocolCodec) -> Result<(), Error> {
        loop {
            if !self.reserve(self.cfg.min_pool_size) {
                return Ok(());
            }
            match self.open_socket(codec).await {
                Ok(socket) => {
                    let mut state = self.state.lock().expect("pool mutex poisoned");
                    state.idle.push_back(socket);
                }
                Err(err) => {
                    self.unreserve();
                    return Err(err);
                }
            }
        }
    }

    /// Open a socket outside the pool's accounting. Used for prefill,
    /// acquire, and dead-node revival probes.
    pub(crate) async fn open_socket(
        &self,
        codec: &dyn ProtocolCodec,
    ) -> Result<Socket<C>, Error> {
        let conn = match timeout(self.cfg.connect_timeout, C::connect(&self.endpoint)).await {
            Ok(result) => result?,
            Err(_) => return Err(Error::ConnectTimeout),
        };
        let mut socket = Socket::new(conn);
        if let Some(auth) = &self.auth {
            auth::authenticate(&mut socket, codec, auth, self.cfg.receive_timeout).await?;
        }
        tracing::debug!(endpoint = %self.endpoint, "opened socket");
        Ok(socket)
    }

    /// Close every idle socket. Called when the node is marked dead;
    /// checked-out sockets die when their leases observe the failure.
    pub(crate) fn drain(&self) {
        let mut state = self.state.lock().expect("pool mutex poisoned");
        let drained = state.idle.len();
        state.idle.clear();
        state.open -= drained;
        if drained > 0 {
            tracing::debug!(endpoint = %self.endpoint, drained, "drained idle sockets");
        }
    }

    fn pop_idle(&self) -> Option<Socket<C>> {
        let mut state = self.state.lock().expect("pool mutex poisoned");
        state.idle.pop_front()
    }

    /// Atomically claim an open slot if fewer than `limit` sockets exist.
    fn reserve(&self, limit: usize) -> bool {
        let mut state = self.state.lock().expect("pool mutex poisoned");
        if state.open >= limit {
            return false;
        }
        state.open += 1;
        true
    }

    fn unreserve(&self) {
        let mut state = self.state.lock().expect("pool mutex poisoned");
        state.open -= 1;
    }

    fn release(&self, socket: Socket<C>) {
        let mut state = self.state.lock().expect("pool mutex poisoned");
        state.idle.push_front(socket);
    }

    #[cfg(test)]
    fn open_count(&self) -> usize {
        self.state.lock().expect("pool mutex poisoned").open
    }

    #[cfg(test)]
    fn idle_count(&self) -> usize {
        self.state.lock().expect("pool mutex poisoned").idle.len()
    }
}

/// A checked-out socket. Dropping the lease returns a healthy socket to
/// the pool; a poisoned lease destroys its socket instead.
pub(crate) struct SocketLease<'a, C: Connection> {
    pool: &'a SocketPool<C>,
    socket: Option<Socket<C>>,
    _permit: SemaphorePermit<'a>,
}

impl<'a, C: Connection> std::fmt::Debug for SocketLease<'a, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketLease")
            .field("has_socket", &self.socket.is_some())
            .finish()
    }
}

impl<'a, C: Connection> SocketLease<'a, C> {
    fn new(pool: &'a SocketPool<C>, socket: Socket<C>, permit: SemaphorePermit<'a>) -> Self {
        Self {
            pool,
            socket: Some(socket),
            _permit: permit,
        }
    }

    pub(crate) fn socket(&mut self) -> &mut Socket<C> {
        self.socket.as_mut().expect("socket taken before drop")
    }

    /// Destroy the socket instead of returning it to the pool.
    pub(crate) fn poison(&mut self) {
        self.socket = None;
    }
}

impl<C: Connection> Drop for SocketLease<'_, C> {
    fn drop(&mut self) {
        match self.socket.take() {
            Some(socket) => self.pool.release(socket),
            None => self.pool.unreserve(),
        }
    }
}
