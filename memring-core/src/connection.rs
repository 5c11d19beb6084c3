//! The transport seam. The core never opens TCP sockets itself; a runtime
//! crate (or a test mock) implements this trait and everything above it —
//! pooling, health, pipelining — comes for free.

use crate::error::Error;
use async_trait::async_trait;

/// One byte stream to one server. Implementations resolve the endpoint at
/// connect time, so DNS changes are picked up whenever the pool opens a
/// fresh socket. Timeouts are applied by the caller around these methods.
#[async_trait]
pub trait Connection: Send + Sync + Sized + 'static {
    /// Open a stream to a `host:port` endpoint.
    async fn connect(endpoint: &str) -> Result<Self, Error>;

    /// Read available bytes into `buf`, returning how many were read.
    /// A return of zero means the peer closed the stream.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error>;

    /// Write the entire buffer to the stream.
    async fn write(&mut self, data: &[u8]) -> Result<(), Error>;
}
