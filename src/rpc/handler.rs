//! Handler trait implemented by the per-`RpcKind` logic plugged into an
//! [`crate::rpc::server::RpcServer`].

use crate::error::Result;
use crate::rpc::server::ConnectionId;

/// Lets a handler act on the server on behalf of the current event: answer
/// the connection it was invoked for, or reach across to another one (the
/// handshake handler needs this to drop peers the manager has declared
/// inactive).
pub trait ServerContext {
    fn write(&mut self, conn: ConnectionId, bytes: &[u8]) -> Result<()>;
    fn close(&mut self, conn: ConnectionId);
}

/// One handler owns exactly one [`RpcKind`](u8) discriminant. The server
/// looks the handler up by the first byte of a freshly accepted connection
/// and routes every subsequent read to it until the connection closes.
pub trait RpcHandler: Send {
    /// The single-byte discriminant this handler answers to.
    fn kind(&self) -> u8;

    /// A chunk of newly-read bytes for `conn`, which may be a partial
    /// message. Must not block.
    fn feed(&mut self, conn: ConnectionId, bytes: &[u8], ctx: &mut dyn ServerContext) -> Result<()>;

    /// `conn` has been closed, by EOF, read error, or forced disconnect.
    fn disconnected(&mut self, conn: ConnectionId, ctx: &mut dyn ServerContext);
}
