//! Stands up an `RpcServer` running the two-step connection handshake over
//! loopback, announces it through an in-process directory, and drives a
//! client handshake against it. No RDMA device is touched: the manager
//! below stands in for one that would otherwise create and finalize a
//! queue pair.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;

use conn_core::directory::{InProcessDirectory, ProcessDirectory};
use conn_core::rpc::{handshake, HandshakeManager, HandshakeService, PeerId, RpcServer};

const HANDSHAKE_KIND: u8 = 1;

struct EchoManager;

impl HandshakeManager for EchoManager {
    fn handle_step1(&mut self, peer_id: PeerId, client_blob: &[u8]) -> (bool, Vec<u8>) {
        println!(
            "server: peer {} sent {} bytes of connection info",
            peer_id,
            client_blob.len()
        );
        (true, b"server-descriptor".to_vec())
    }

    fn handle_step2(&mut self, peer_id: PeerId) -> bool {
        println!("server: peer {} finalized its connection", peer_id);
        true
    }

    fn collect_inactive(&mut self) -> Vec<PeerId> {
        Vec::new()
    }

    fn mark_inactive(&mut self, _peer_id: PeerId) {}

    fn remove(&mut self, _peer_id: PeerId) {}
}

fn main() -> conn_core::Result<()> {
    env_logger::init();

    let mut server = RpcServer::new();
    server.attach_handler(Box::new(HandshakeService::new(HANDSHAKE_KIND, EchoManager)))?;
    let bound_port = server.start_or_change_port(IpAddr::V4(Ipv4Addr::LOCALHOST), 9700)?;

    let directory = InProcessDirectory::new();
    directory.announce("1", SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), bound_port))?;

    let addr = directory.resolve("1")?;
    let mut stream = TcpStream::connect(addr).map_err(conn_core::Error::from)?;

    let descriptor = handshake(
        &mut stream,
        42,
        HANDSHAKE_KIND,
        || b"client-descriptor".to_vec(),
        |server_blob| Ok(String::from_utf8_lossy(server_blob).into_owned()),
    )?;
    println!("client: handshake complete, server said '{}'", descriptor);

    thread::sleep(Duration::from_millis(50));
    server.stop();
    Ok(())
}
