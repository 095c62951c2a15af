//! Connection and dispatch primitives for RDMA-backed, multi-process
//! services: a resource registry over one device port, a completion-queue
//! splitter for sharing one queue across independent consumers, a
//! single-threaded cooperative RPC framework, the two-step handshake
//! protocol that bootstraps a queue pair between two processes, and a
//! small process directory client peers use to find each other.
//!
//! This crate never initializes a logger; it only emits records through
//! the [`log`] facade, leaving the choice of sink (`env_logger`, `syslog`,
//! ...) to the binary that links it in.

pub mod codec;
pub mod ctrl;
pub mod directory;
pub mod error;
pub mod poller;
pub mod rpc;

pub use error::{Error, ErrorKind, Result};
