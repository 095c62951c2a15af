//! # Process directory
//! A small injected-interface client around an external announce/resolve
//! store, so the handshake layer can discover peer endpoints without
//! embedding a concrete backend. `InProcessDirectory` serves tests and
//! single-process demos; `MemcachedDirectory` is the production backend.

use std::collections::HashMap;
use std::env;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use log::debug;

use crate::error::{Error, Result};

/// This host's own address on its first non-loopback interface, suitable
/// for [`ProcessDirectory::announce`]. Fails with **ResourceError** if the
/// interface list can't be read or holds nothing but loopback.
pub fn local_ipv4_addr() -> Result<IpAddr> {
    get_if_addrs::get_if_addrs()
        .map_err(|e| Error::resource(format!("could not get machine network interfaces: {}", e)))?
        .into_iter()
        .find(|i| !i.is_loopback())
        .map(|i| i.ip())
        .ok_or_else(|| Error::resource("no non-loopback network interface found"))
}

const PID_PREFIX: &str = "PID-";
const RETRY_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_MEMCACHED_PORT: u16 = 11211;
const REGISTRY_ENV_VAR: &str = "CONN_CORE_REGISTRY";

/// Announces and resolves `"<host>:<port>"` RPC endpoints by a small
/// process id, and provides a counting barrier primitive for rendezvous
/// between processes.
pub trait ProcessDirectory: Send + Sync {
    /// Publishes `addr` under `id`. Fails with **ConfigError** if `id` is
    /// already announced.
    fn announce(&self, id: &str, addr: SocketAddr) -> Result<()>;

    /// Looks up `id`, retrying with a fixed backoff until it appears.
    fn resolve(&self, id: &str) -> Result<SocketAddr>;

    /// Atomically increments the counter named `key` until it reaches `n`,
    /// then returns. Blocks the calling thread while waiting on peers.
    fn barrier(&self, key: &str, n: u64) -> Result<()>;
}

/// A process-local directory behind a `Mutex`, used by tests and
/// single-process demos in place of an external store.
#[derive(Default)]
pub struct InProcessDirectory {
    entries: Mutex<HashMap<String, String>>,
    counters: Mutex<HashMap<String, u64>>,
}

impl InProcessDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProcessDirectory for InProcessDirectory {
    fn announce(&self, id: &str, addr: SocketAddr) -> Result<()> {
        let key = format!("{}{}", PID_PREFIX, id);
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&key) {
            return Err(Error::config(format!(
                "process '{}' has already announced an endpoint",
                id
            )));
        }
        entries.insert(key, addr.to_string());
        Ok(())
    }

    fn resolve(&self, id: &str) -> Result<SocketAddr> {
        let key = format!("{}{}", PID_PREFIX, id);
        loop {
            {
                let entries = self.entries.lock().unwrap();
                if let Some(value) = entries.get(&key) {
                    return value
                        .parse()
                        .map_err(|e| Error::protocol(format!("malformed directory entry: {}", e)));
                }
            }
            debug!("process '{}' not yet announced, retrying", id);
            thread::sleep(RETRY_DELAY);
        }
    }

    fn barrier(&self, key: &str, n: u64) -> Result<()> {
        {
            let mut counters = self.counters.lock().unwrap();
            *counters.entry(key.to_string()).or_insert(0) += 1;
        }

        loop {
            let count = *self.counters.lock().unwrap().get(key).unwrap_or(&0);
            if count >= n {
                return Ok(());
            }
            thread::sleep(RETRY_DELAY);
        }
    }
}

/// A thin client over a memcached server, used as the production backend.
/// Reads its endpoint from the `CONN_CORE_REGISTRY` environment variable,
/// formatted `"<host>[:<port>]"` (default port 11211).
pub struct MemcachedDirectory {
    client: memcache::Client,
}

impl MemcachedDirectory {
    pub fn connect() -> Result<Self> {
        let endpoint = env::var(REGISTRY_ENV_VAR).map_err(|_| {
            Error::config(format!(
                "environment variable {} is not set",
                REGISTRY_ENV_VAR
            ))
        })?;

        let (host, port) = split_host_port(&endpoint)?;
        let url = format!("memcache://{}:{}", host, port);
        let client = memcache::Client::connect(url.as_str())
            .map_err(|e| Error::resource(format!("failed to connect to memcached: {}", e)))?;

        Ok(MemcachedDirectory { client })
    }
}

fn split_host_port(endpoint: &str) -> Result<(String, u16)> {
    match endpoint.split_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|e| Error::config(format!("bad port in '{}': {}", endpoint, e)))?;
            Ok((host.to_string(), port))
        }
        None => Ok((endpoint.to_string(), DEFAULT_MEMCACHED_PORT)),
    }
}

impl ProcessDirectory for MemcachedDirectory {
    fn announce(&self, id: &str, addr: SocketAddr) -> Result<()> {
        let key = format!("{}{}", PID_PREFIX, id);
        let existing: Option<String> = self
            .client
            .get(&key)
            .map_err(|e| Error::resource(format!("memcached get failed: {}", e)))?;
        if existing.is_some() {
            return Err(Error::config(format!(
                "process '{}' has already announced an endpoint",
                id
            )));
        }
        self.client
            .set(&key, addr.to_string().as_str(), 0)
            .map_err(|e| Error::resource(format!("memcached set failed: {}", e)))
    }

    fn resolve(&self, id: &str) -> Result<SocketAddr> {
        let key = format!("{}{}", PID_PREFIX, id);
        loop {
            let value: Option<String> = self
                .client
                .get(&key)
                .map_err(|e| Error::resource(format!("memcached get failed: {}", e)))?;
            if let Some(value) = value {
                return value
                    .to_socket_addrs()
                    .map_err(Error::from)?
                    .next()
                    .ok_or_else(|| Error::protocol("directory entry resolved to no address"));
            }
            debug!("process '{}' not yet announced, retrying", id);
            thread::sleep(RETRY_DELAY);
        }
    }

    fn barrier(&self, key: &str, n: u64) -> Result<()> {
        // Mirrors `memcached_increment_with_initial`: the first successful
        // round contributes this call's +1 (by creating the key at 1, or by
        // incrementing an existing key by 1); every round after that only
        // polls, incrementing by 0, so a caller blocked here never counts
        // itself twice while waiting for peers to catch up.
        let mut incr = 1u64;
        loop {
            let count = match self.client.increment(key, incr) {
                Ok(v) => v,
                Err(_) if incr == 1 => {
                    self.client
                        .set(key, 1u64, 0)
                        .map_err(|e| Error::resource(format!("memcached set failed: {}", e)))?;
                    1
                }
                Err(e) => {
                    return Err(Error::resource(format!(
                        "memcached increment failed: {}",
                        e
                    )))
                }
            };
            incr = 0;
            if count >= n {
                return Ok(());
            }
            thread::sleep(RETRY_DELAY);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_announce_and_resolve() {
        let dir = InProcessDirectory::new();
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        dir.announce("7", addr).unwrap();
        assert_eq!(dir.resolve("7").unwrap(), addr);
    }

    #[test]
    fn rejects_reannounce_of_existing_key() {
        let dir = InProcessDirectory::new();
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        dir.announce("7", addr).unwrap();
        assert!(dir.announce("7", addr).is_err());
    }

    #[test]
    fn barrier_reaches_target_count() {
        let dir = InProcessDirectory::new();
        assert!(dir.barrier("round-1", 1).is_ok());
    }
}
