use std::net::{IpAddr, Ipv4Addr, TcpStream};
use std::sync::{Arc, Mutex};

use conn_core::rpc::{handshake, HandshakeManager, HandshakeService, PeerId, RpcServer};

const KIND: u8 = 9;

#[derive(Default)]
struct RecordingManager {
    accept_step2: bool,
    finalized: Arc<Mutex<Vec<PeerId>>>,
}

impl HandshakeManager for RecordingManager {
    fn handle_step1(&mut self, _peer_id: PeerId, _client_blob: &[u8]) -> (bool, Vec<u8>) {
        (true, b"qp-endpoint-bytes".to_vec())
    }

    fn handle_step2(&mut self, peer_id: PeerId) -> bool {
        if self.accept_step2 {
            self.finalized.lock().unwrap().push(peer_id);
        }
        self.accept_step2
    }

    fn collect_inactive(&mut self) -> Vec<PeerId> {
        Vec::new()
    }

    fn mark_inactive(&mut self, _peer_id: PeerId) {}

    fn remove(&mut self, _peer_id: PeerId) {}
}

fn start_server(accept_step2: bool, finalized: Arc<Mutex<Vec<PeerId>>>) -> (RpcServer, u16) {
    let mut server = RpcServer::new();
    let manager = RecordingManager {
        accept_step2,
        finalized,
    };
    server
        .attach_handler(Box::new(HandshakeService::new(KIND, manager)))
        .unwrap();
    let port = server
        .start_or_change_port(IpAddr::V4(Ipv4Addr::LOCALHOST), 9800)
        .unwrap();
    (server, port)
}

#[test]
fn successful_handshake_returns_server_blob() {
    let finalized = Arc::new(Mutex::new(Vec::new()));
    let (mut server, port) = start_server(true, Arc::clone(&finalized));

    let mut stream =
        TcpStream::connect((Ipv4Addr::LOCALHOST, port)).expect("connect to loopback server");

    let result = handshake(
        &mut stream,
        1234,
        KIND,
        || b"client-connection-info".to_vec(),
        |server_blob| Ok(server_blob.to_vec()),
    );

    assert_eq!(result.unwrap(), b"qp-endpoint-bytes".to_vec());
    assert_eq!(*finalized.lock().unwrap(), vec![1234]);

    server.stop();
}

#[test]
fn step2_rejection_surfaces_as_handshake_error() {
    let finalized = Arc::new(Mutex::new(Vec::new()));
    let (mut server, port) = start_server(false, finalized);

    let mut stream =
        TcpStream::connect((Ipv4Addr::LOCALHOST, port)).expect("connect to loopback server");

    let result = handshake(
        &mut stream,
        5,
        KIND,
        || Vec::new(),
        |server_blob| Ok(server_blob.to_vec()),
    );

    let err = result.expect_err("server should reject step 2");
    assert_eq!(err.kind(), conn_core::ErrorKind::Handshake);

    server.stop();
}
