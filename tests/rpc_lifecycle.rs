use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, TcpStream};
use std::thread;
use std::time::Duration;

use conn_core::rpc::{ConnectionId, RpcHandler, RpcServer, ServerContext};

const ECHO_KIND: u8 = 3;

struct EchoHandler;

impl RpcHandler for EchoHandler {
    fn kind(&self) -> u8 {
        ECHO_KIND
    }

    fn feed(&mut self, conn: ConnectionId, bytes: &[u8], ctx: &mut dyn ServerContext) -> conn_core::Result<()> {
        if !bytes.is_empty() {
            ctx.write(conn, bytes)?;
        }
        Ok(())
    }

    fn disconnected(&mut self, _conn: ConnectionId, _ctx: &mut dyn ServerContext) {}
}

#[test]
fn echoes_bytes_after_the_kind_discriminant() {
    let mut server = RpcServer::new();
    server.attach_handler(Box::new(EchoHandler)).unwrap();
    let port = server
        .start_or_change_port(IpAddr::V4(Ipv4Addr::LOCALHOST), 9900)
        .unwrap();

    let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
    let mut frame = vec![ECHO_KIND];
    frame.extend_from_slice(b"hello");
    stream.write_all(&frame).unwrap();

    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello");

    server.stop();
}

#[test]
fn start_and_stop_are_idempotent() {
    let mut server = RpcServer::new();
    server.attach_handler(Box::new(EchoHandler)).unwrap();

    let started = server
        .start(IpAddr::V4(Ipv4Addr::LOCALHOST), 9901)
        .unwrap();
    assert!(started);

    let started_again = server
        .start(IpAddr::V4(Ipv4Addr::LOCALHOST), 9901)
        .unwrap();
    assert!(!started_again);

    thread::sleep(Duration::from_millis(20));

    assert!(server.stop());
    assert!(!server.stop());
}

#[test]
fn duplicate_handler_kind_is_rejected() {
    let server = RpcServer::new();
    server.attach_handler(Box::new(EchoHandler)).unwrap();
    assert!(server.attach_handler(Box::new(EchoHandler)).is_err());
}
