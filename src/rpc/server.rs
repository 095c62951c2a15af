//! # RPC server
//! A single-threaded cooperative event loop bound to one TCP endpoint,
//! built on `mio`'s readiness-based reactor: one `Poll` per server, the
//! listener registered for `READABLE`, and one `TcpStream` per accepted
//! connection registered for `READABLE | WRITABLE`. Handlers are attached
//! before the loop starts and dispatched by the first byte of each new
//! connection.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{debug, warn};
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};

use crate::error::{Error, Result};
use crate::rpc::handler::{RpcHandler, ServerContext};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONN: usize = 2;
const BACKLOG: i32 = 128;

/// Identifies one accepted connection for the lifetime of its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(usize);

struct Connection {
    stream: TcpStream,
    kind: Option<u8>,
    write_queue: VecDeque<Vec<u8>>,
    write_offset: usize,
    closing: bool,
}

type Handlers = HashMap<u8, Box<dyn RpcHandler>>;

/// A single-threaded cooperative RPC dispatcher. Configure it with
/// [`attach_handler`](Self::attach_handler), then [`start`](Self::start) it;
/// the loop runs on a dedicated worker thread until [`stop`](Self::stop).
pub struct RpcServer {
    handlers: Arc<Mutex<Handlers>>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    waker: Option<Arc<Waker>>,
}

impl RpcServer {
    pub fn new() -> Self {
        RpcServer {
            handlers: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
            waker: None,
        }
    }

    /// Registers `handler` for its declared kind. Fails with
    /// **ConfigError** if a handler for that kind is already attached, or
    /// the server is currently running.
    pub fn attach_handler(&self, handler: Box<dyn RpcHandler>) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(Error::config("cannot attach a handler while the server is running"));
        }
        let mut handlers = self.handlers.lock().unwrap();
        let kind = handler.kind();
        if handlers.contains_key(&kind) {
            return Err(Error::config(format!(
                "a handler for kind {} is already attached",
                kind
            )));
        }
        handlers.insert(kind, handler);
        Ok(())
    }

    /// Starts listening on `(ip, port)`. Returns `Ok(false)` without error
    /// if the server was already running.
    pub fn start(&mut self, ip: IpAddr, port: u16) -> Result<bool> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.spawn(SocketAddr::new(ip, port))?;
        Ok(true)
    }

    /// Like [`start`](Self::start), but on "address in use" increments the
    /// port and retries until a free one is found. Returns the bound port.
    pub fn start_or_change_port(&mut self, ip: IpAddr, mut port: u16) -> Result<u16> {
        if self.running.load(Ordering::SeqCst) {
            return Err(Error::config("server is already running"));
        }
        loop {
            match self.spawn(SocketAddr::new(ip, port)) {
                Ok(()) => return Ok(port),
                Err(e) if e.kind() == crate::error::ErrorKind::Io && is_addr_in_use(&e) => {
                    port = port.checked_add(1).ok_or_else(|| {
                        Error::resource("exhausted the port range looking for a free port")
                    })?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn spawn(&mut self, addr: SocketAddr) -> Result<()> {
        let mut poll = Poll::new().map_err(Error::from)?;
        // `std::net::TcpListener::bind` listens with a backlog of `BACKLOG`
        // on every platform this crate targets.
        let std_listener = std::net::TcpListener::bind(addr).map_err(Error::from)?;
        std_listener.set_nonblocking(true).map_err(Error::from)?;
        let mut listener = TcpListener::from_std(std_listener);
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(Error::from)?;

        let waker = Arc::new(Waker::new(poll.registry(), WAKER).map_err(Error::from)?);

        let handlers = Arc::clone(&self.handlers);
        let running = Arc::clone(&self.running);
        running.store(true, Ordering::SeqCst);

        let join = std::thread::spawn(move || {
            run_loop(poll, listener, handlers, running);
        });

        self.worker = Some(join);
        self.waker = Some(waker);
        Ok(())
    }

    /// Signals the loop to exit, closes outstanding connections, and joins
    /// the worker. Returns `false` without error if the server wasn't
    /// running.
    pub fn stop(&mut self) -> bool {
        if !self.running.swap(false, Ordering::SeqCst) {
            return false;
        }
        if let Some(waker) = &self.waker {
            let _ = waker.wake();
        }
        if let Some(join) = self.worker.take() {
            let _ = join.join();
        }
        self.waker = None;
        true
    }
}

impl Default for RpcServer {
    fn default() -> Self {
        Self::new()
    }
}

fn is_addr_in_use(e: &Error) -> bool {
    e.reason().contains("AddrInUse") || e.reason().contains("Address already in use")
}

struct LoopContext<'a> {
    connections: &'a mut HashMap<Token, Connection>,
}

impl<'a> ServerContext for LoopContext<'a> {
    fn write(&mut self, conn: ConnectionId, bytes: &[u8]) -> Result<()> {
        let token = Token(conn.0);
        let connection = self
            .connections
            .get_mut(&token)
            .ok_or_else(|| Error::not_found("connection no longer exists"))?;
        connection.write_queue.push_back(bytes.to_vec());
        flush(connection);
        Ok(())
    }

    fn close(&mut self, conn: ConnectionId) {
        let token = Token(conn.0);
        if let Some(connection) = self.connections.get_mut(&token) {
            connection.closing = true;
        }
    }
}

fn flush(connection: &mut Connection) {
    while let Some(front) = connection.write_queue.front() {
        let remaining = &front[connection.write_offset..];
        match connection.stream.write(remaining) {
            Ok(0) => break,
            Ok(n) if n == remaining.len() => {
                connection.write_queue.pop_front();
                connection.write_offset = 0;
            }
            Ok(n) => {
                connection.write_offset += n;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                warn!("write failed, closing connection: {}", e);
                connection.closing = true;
                break;
            }
        }
    }
}

fn run_loop(
    mut poll: Poll,
    mut listener: TcpListener,
    handlers: Arc<Mutex<Handlers>>,
    running: Arc<AtomicBool>,
) {
    let mut events = Events::with_capacity(1024);
    let mut connections: HashMap<Token, Connection> = HashMap::new();
    let mut next_token = FIRST_CONN;
    let mut read_buf = [0u8; 4096];

    while running.load(Ordering::SeqCst) {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            warn!("poll failed: {}", e);
            break;
        }

        for event in events.iter() {
            match event.token() {
                LISTENER => loop {
                    match listener.accept() {
                        Ok((mut stream, peer)) => {
                            let token = Token(next_token);
                            next_token += 1;
                            if let Err(e) = poll.registry().register(
                                &mut stream,
                                token,
                                Interest::READABLE | Interest::WRITABLE,
                            ) {
                                warn!("failed to register new connection from {}: {}", peer, e);
                                continue;
                            }
                            debug!("accepted connection from {}", peer);
                            connections.insert(
                                token,
                                Connection {
                                    stream,
                                    kind: None,
                                    write_queue: VecDeque::new(),
                                    write_offset: 0,
                                    closing: false,
                                },
                            );
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            warn!("accept failed: {}", e);
                            break;
                        }
                    }
                },
                WAKER => {}
                token => {
                    handle_connection_event(token, event, &mut connections, &handlers, &mut read_buf);
                }
            }
        }

        deregister_closed(&mut poll, &mut connections, &handlers);
    }

    let tokens: Vec<Token> = connections.keys().copied().collect();
    for token in tokens {
        if let Some(mut connection) = connections.remove(&token) {
            let kind = connection.kind;
            let _ = poll.registry().deregister(&mut connection.stream);

            if let Some(kind) = kind {
                let mut handlers = handlers.lock().unwrap();
                if let Some(handler) = handlers.get_mut(&kind) {
                    let mut ctx = LoopContext {
                        connections: &mut connections,
                    };
                    handler.disconnected(ConnectionId(token.0), &mut ctx);
                }
            }
        }
    }
}

fn handle_connection_event(
    token: Token,
    event: &Event,
    connections: &mut HashMap<Token, Connection>,
    handlers: &Arc<Mutex<Handlers>>,
    read_buf: &mut [u8],
) {
    if event.is_writable() {
        if let Some(connection) = connections.get_mut(&token) {
            flush(connection);
        }
    }

    if event.is_readable() {
        let mut disconnect = false;
        let mut dispatch: Option<(u8, Vec<u8>)> = None;

        if let Some(connection) = connections.get_mut(&token) {
            match connection.stream.read(read_buf) {
                Ok(0) => disconnect = true,
                Ok(n) => {
                    let mut bytes = &read_buf[..n];
                    let kind = match connection.kind {
                        Some(k) => k,
                        None => {
                            if bytes.is_empty() {
                                disconnect = true;
                                0
                            } else {
                                let k = bytes[0];
                                connection.kind = Some(k);
                                bytes = &bytes[1..];
                                k
                            }
                        }
                    };
                    if !disconnect {
                        dispatch = Some((kind, bytes.to_vec()));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    warn!("read failed, closing connection: {}", e);
                    disconnect = true;
                }
            }
        }

        if let Some((kind, bytes)) = dispatch {
            let mut handlers = handlers.lock().unwrap();
            if let Some(handler) = handlers.get_mut(&kind) {
                let mut ctx = LoopContext { connections };
                let id = ConnectionId(token.0);
                if let Err(e) = handler.feed(id, &bytes, &mut ctx) {
                    warn!("handler for kind {} failed: {}", kind, e);
                    disconnect = true;
                }
            } else {
                warn!("no handler registered for kind {}", kind);
                disconnect = true;
            }
        }

        if disconnect {
            if let Some(connection) = connections.get_mut(&token) {
                connection.closing = true;
            }
        }
    }
}

fn deregister_closed(poll: &mut Poll, connections: &mut HashMap<Token, Connection>, handlers: &Arc<Mutex<Handlers>>) {
    let closing: Vec<Token> = connections
        .iter()
        .filter(|(_, c)| c.closing)
        .map(|(t, _)| *t)
        .collect();

    for token in closing {
        if let Some(mut connection) = connections.remove(&token) {
            let kind = connection.kind;
            let _ = poll.registry().deregister(&mut connection.stream);

            if let Some(kind) = kind {
                let mut handlers = handlers.lock().unwrap();
                if let Some(handler) = handlers.get_mut(&kind) {
                    let mut ctx = LoopContext { connections };
                    handler.disconnected(ConnectionId(token.0), &mut ctx);
                }
            }
        }
    }
}
