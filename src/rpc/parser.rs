//! # Handshake frame parser
//! Consumes the two-step wire framing described for the connection
//! handshake protocol as bytes trickle in from the event loop, and emits
//! one event per completed step.

use std::convert::TryInto;

use crate::error::{Error, Result};

const DONE_MARKER: &[u8; 4] = b"DONE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeEvent {
    /// `client_id` has been read off the wire.
    Step1 { client_id: u32 },
    /// The client's connection-info blob has been read in full.
    Step1Payload { client_id: u32, blob: Vec<u8> },
    /// The client sent its closing `"DONE"` marker.
    Step2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    S0,
    S1 { client_id: u32 },
    S2 { client_id: u32 },
    S3,
}

/// A per-connection state machine over `S0 -> S1 -> S2 -> S3`. Feed it raw
/// bytes as they arrive and drain it for whatever steps have completed.
pub struct HandshakeParser {
    state: State,
    buf: Vec<u8>,
}

impl HandshakeParser {
    pub fn new() -> Self {
        HandshakeParser {
            state: State::S0,
            buf: Vec::new(),
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Advances the state machine as far as the buffered bytes allow,
    /// returning every event produced along the way. `S2 -> S3` fails with
    /// **ProtocolError** if the 4 bytes present aren't exactly `"DONE"`.
    pub fn drain(&mut self) -> Result<Vec<HandshakeEvent>> {
        let mut events = Vec::new();

        loop {
            match self.state {
                State::S0 => {
                    if self.buf.len() < 4 {
                        break;
                    }
                    let client_id = u32::from_le_bytes(self.buf[0..4].try_into().unwrap());
                    self.buf.drain(0..4);
                    self.state = State::S1 { client_id };
                    events.push(HandshakeEvent::Step1 { client_id });
                }
                State::S1 { client_id } => {
                    if self.buf.len() < 4 {
                        break;
                    }
                    let len = u32::from_le_bytes(self.buf[0..4].try_into().unwrap()) as usize;
                    if self.buf.len() < 4 + len {
                        break;
                    }
                    let blob = self.buf[4..4 + len].to_vec();
                    self.buf.drain(0..4 + len);
                    self.state = State::S2 { client_id };
                    events.push(HandshakeEvent::Step1Payload { client_id, blob });
                }
                State::S2 { .. } => {
                    if self.buf.len() < 4 {
                        break;
                    }
                    let marker = &self.buf[0..4];
                    if marker != DONE_MARKER {
                        return Err(Error::protocol(format!(
                            "expected \"DONE\" marker, got {:?}",
                            marker
                        )));
                    }
                    self.buf.drain(0..4);
                    self.state = State::S3;
                    events.push(HandshakeEvent::Step2);
                }
                State::S3 => break,
            }
        }

        Ok(events)
    }
}

impl Default for HandshakeParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Frames `blob` as a server response: `len: u32` little-endian, then the
/// bytes.
pub fn frame_blob(blob: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + blob.len());
    out.extend_from_slice(&(blob.len() as u32).to_le_bytes());
    out.extend_from_slice(blob);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_full_handshake_in_one_feed() {
        let mut p = HandshakeParser::new();
        let mut wire = Vec::new();
        wire.extend_from_slice(&7u32.to_le_bytes());
        wire.extend_from_slice(&3u32.to_le_bytes());
        wire.extend_from_slice(b"hey");
        wire.extend_from_slice(b"DONE");
        p.feed(&wire);

        let events = p.drain().unwrap();
        assert_eq!(
            events,
            vec![
                HandshakeEvent::Step1 { client_id: 7 },
                HandshakeEvent::Step1Payload {
                    client_id: 7,
                    blob: b"hey".to_vec()
                },
                HandshakeEvent::Step2,
            ]
        );
    }

    #[test]
    fn handles_byte_at_a_time_delivery() {
        let mut p = HandshakeParser::new();
        let mut wire = Vec::new();
        wire.extend_from_slice(&42u32.to_le_bytes());
        wire.extend_from_slice(&0u32.to_le_bytes());
        wire.extend_from_slice(b"DONE");

        let mut events = Vec::new();
        for b in wire {
            p.feed(&[b]);
            events.extend(p.drain().unwrap());
        }

        assert_eq!(
            events,
            vec![
                HandshakeEvent::Step1 { client_id: 42 },
                HandshakeEvent::Step1Payload {
                    client_id: 42,
                    blob: vec![]
                },
                HandshakeEvent::Step2,
            ]
        );
    }

    #[test]
    fn rejects_bad_done_marker() {
        let mut p = HandshakeParser::new();
        let mut wire = Vec::new();
        wire.extend_from_slice(&1u32.to_le_bytes());
        wire.extend_from_slice(&0u32.to_le_bytes());
        wire.extend_from_slice(b"NOPE");
        p.feed(&wire);
        assert!(p.drain().is_err());
    }
}
