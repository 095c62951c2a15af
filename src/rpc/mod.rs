//! The single-threaded cooperative RPC dispatcher (C4) and the connection
//! handshake protocol built on top of it (C5).

mod client;
mod handler;
mod handshake;
mod parser;
mod server;

pub use client::handshake;
pub use handler::{RpcHandler, ServerContext};
pub use handshake::{HandshakeManager, HandshakeService, PeerId};
pub use parser::{frame_blob, HandshakeEvent, HandshakeParser};
pub use server::{ConnectionId, RpcServer};
