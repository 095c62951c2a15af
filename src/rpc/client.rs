//! # Handshake client
//! Drives the client side of the two-step handshake over an already
//! connected socket: send the kind byte, the peer id, the serialized
//! connection request, then wait out the server's response.

use std::io::{Read, Write};
use std::net::TcpStream;

use crate::error::{Error, Result};

fn read_exact_mapped(stream: &mut TcpStream, buf: &mut [u8]) -> Result<()> {
    stream.read_exact(buf).map_err(Error::from)
}

fn write_all_mapped(stream: &mut TcpStream, buf: &[u8]) -> Result<()> {
    stream.write_all(buf).map_err(Error::from)
}

/// Runs the client side of the handshake over `stream`, which must already
/// be connected. `kind` is the `RpcKind` byte the server will dispatch the
/// first read to. `serialize_connection` produces this peer's opaque blob;
/// `setup_connection` consumes the server's blob and returns whatever
/// local descriptor the caller wanted out of the handshake (typically the
/// finalized local half of a queue pair).
pub fn handshake<T>(
    stream: &mut TcpStream,
    peer_id: u32,
    kind: u8,
    serialize_connection: impl FnOnce() -> Vec<u8>,
    setup_connection: impl FnOnce(&[u8]) -> Result<T>,
) -> Result<T> {
    write_all_mapped(stream, &[kind])?;
    write_all_mapped(stream, &peer_id.to_le_bytes())?;

    let client_blob = serialize_connection();
    write_all_mapped(stream, &(client_blob.len() as u32).to_le_bytes())?;
    write_all_mapped(stream, &client_blob)?;

    let mut len_buf = [0u8; 4];
    read_exact_mapped(stream, &mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut server_blob = vec![0u8; len];
    read_exact_mapped(stream, &mut server_blob)?;

    let result = setup_connection(&server_blob)?;

    stream
        .write_all(b"DONE")
        .map_err(|e| Error::handshake(format!("failed to send DONE marker: {}", e)))?;

    let mut ack = [0u8; 2];
    stream
        .read_exact(&mut ack)
        .map_err(|e| Error::handshake(format!("failed to read handshake acknowledgement: {}", e)))?;
    if &ack != b"OK" {
        return Err(Error::handshake(format!(
            "server rejected handshake for peer {}",
            peer_id
        )));
    }

    Ok(result)
}
