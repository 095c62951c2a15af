//! # Handshake manager wiring
//! Glues the wire parser to an injected [`HandshakeManager`] and exposes the
//! result as one [`RpcHandler`], so a consumer only has to implement the
//! manager trait and attach this handler to a running [`super::server::RpcServer`].

use std::collections::HashMap;

use log::warn;

use crate::error::Result;
use crate::rpc::handler::{RpcHandler, ServerContext};
use crate::rpc::parser::{frame_blob, HandshakeEvent, HandshakeParser};
use crate::rpc::server::ConnectionId;

/// Identifies a connecting peer. Fixed at `u32` independently of the
/// codec's adaptive peer-id width (see the peer id width decision).
pub type PeerId = u32;

/// Server-side state machine invoked by a [`HandshakeService`] as wire
/// events arrive. Implementors own whatever shared resources (queue pairs,
/// control blocks) the handshake needs to stand up a connection.
pub trait HandshakeManager: Send {
    /// The client's blob has arrived in full; build the server-side
    /// response (for example, a freshly created queue pair's serialized
    /// endpoint). `ok = false` suppresses the response frame entirely.
    fn handle_step1(&mut self, peer_id: PeerId, client_blob: &[u8]) -> (bool, Vec<u8>);

    /// The client has sent its closing `"DONE"` marker; finalize the
    /// connection server-side (for example, transition a queue pair to
    /// ready-to-send).
    fn handle_step2(&mut self, peer_id: PeerId) -> bool;

    /// Peers the manager considers no longer live. Any peer returned here
    /// has its connection forcibly closed before the next parse step.
    fn collect_inactive(&mut self) -> Vec<PeerId>;

    /// `peer_id`'s connection has been forcibly closed.
    fn mark_inactive(&mut self, peer_id: PeerId);

    /// Drops all state the manager holds for `peer_id`.
    fn remove(&mut self, peer_id: PeerId);
}

struct Session {
    parser: HandshakeParser,
    peer_id: Option<PeerId>,
}

/// The [`RpcHandler`] that drives a [`HandshakeManager`] from raw bytes.
pub struct HandshakeService<M: HandshakeManager> {
    kind: u8,
    manager: M,
    sessions: HashMap<ConnectionId, Session>,
    peer_to_conn: HashMap<PeerId, ConnectionId>,
}

impl<M: HandshakeManager> HandshakeService<M> {
    pub fn new(kind: u8, manager: M) -> Self {
        HandshakeService {
            kind,
            manager,
            sessions: HashMap::new(),
            peer_to_conn: HashMap::new(),
        }
    }

    fn disconnect_inactive(&mut self, ctx: &mut dyn ServerContext) {
        for peer_id in self.manager.collect_inactive() {
            if let Some(&conn) = self.peer_to_conn.get(&peer_id) {
                ctx.close(conn);
            }
        }
    }

    fn forget(&mut self, conn: ConnectionId) {
        if let Some(session) = self.sessions.remove(&conn) {
            if let Some(peer_id) = session.peer_id {
                self.peer_to_conn.remove(&peer_id);
                self.manager.mark_inactive(peer_id);
                self.manager.remove(peer_id);
            }
        }
    }
}

impl<M: HandshakeManager> RpcHandler for HandshakeService<M> {
    fn kind(&self) -> u8 {
        self.kind
    }

    fn feed(&mut self, conn: ConnectionId, bytes: &[u8], ctx: &mut dyn ServerContext) -> Result<()> {
        self.disconnect_inactive(ctx);

        let events = {
            let session = self.sessions.entry(conn).or_insert_with(|| Session {
                parser: HandshakeParser::new(),
                peer_id: None,
            });
            session.parser.feed(bytes);
            session.parser.drain()?
        };

        for event in events {
            match event {
                HandshakeEvent::Step1 { client_id } => {
                    if let Some(session) = self.sessions.get_mut(&conn) {
                        session.peer_id = Some(client_id);
                    }
                    self.peer_to_conn.insert(client_id, conn);
                }
                HandshakeEvent::Step1Payload { client_id, blob } => {
                    let (ok, server_blob) = self.manager.handle_step1(client_id, &blob);
                    if ok {
                        ctx.write(conn, &frame_blob(&server_blob))?;
                    } else {
                        warn!("handle_step1 rejected peer {}", client_id);
                    }
                }
                HandshakeEvent::Step2 => {
                    let peer_id = self
                        .sessions
                        .get(&conn)
                        .and_then(|s| s.peer_id)
                        .unwrap_or_default();
                    let ok = self.manager.handle_step2(peer_id);
                    ctx.write(conn, if ok { b"OK" } else { b"NK" })?;
                }
            }
        }

        Ok(())
    }

    fn disconnected(&mut self, conn: ConnectionId, _ctx: &mut dyn ServerContext) {
        self.forget(conn);
    }
}
