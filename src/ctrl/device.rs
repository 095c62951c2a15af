//! # Device
//! Enumerates RDMA devices, opens a context, and resolves the single active
//! physical port this process will use, with RAII types instead of
//! hand-rolled deleters: an opened `ibverbs::Context` already closes itself
//! on drop, so there is nothing left for this module to release explicitly.

use std::sync::Arc;

use crate::error::{Error, Result};

/// The devices visible to this process, queried once and cached.
pub struct Devices {
    list: ibverbs::DeviceList,
}

impl Devices {
    pub fn enumerate() -> Result<Self> {
        let list = ibverbs::devices()
            .map_err(|e| Error::resource(format!("cannot get device list: {}", e)))?;

        if list.len() == 0 {
            return Err(Error::resource("no RDMA devices were found"));
        }

        Ok(Devices { list })
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.len() == 0
    }

    /// Opens the `index`-th device, querying its attributes eagerly so
    /// later failures surface at open time rather than on first use.
    pub fn open(&self, index: usize) -> Result<Arc<ibverbs::Context>> {
        let dev = self
            .list
            .get(index)
            .ok_or_else(|| Error::not_found(format!("no device at index {}", index)))?;

        let ctx = dev
            .open()
            .map_err(|e| Error::resource(format!("failed to open device: {}", e)))?;

        Ok(Arc::new(ctx))
    }
}

/// A one-based physical port on an opened device, bound to its link-layer
/// id (LID). This crate supports exactly one port per control block (see
/// Non-goals).
pub struct ResolvedPort {
    ctx: Arc<ibverbs::Context>,
    port_id: u8,
    port_lid: u16,
}

impl ResolvedPort {
    /// Selects the `index`-th active physical port (0-based) on `ctx`.
    ///
    /// Fails with a resource error if no port is active at that index, or
    /// if the port's link layer isn't InfiniBand.
    pub fn resolve(ctx: Arc<ibverbs::Context>, index: usize) -> Result<Self> {
        let dev_attr = ctx
            .query_device()
            .map_err(|e| Error::resource(format!("cannot query device attributes: {}", e)))?;

        let mut skipped_active = 0usize;
        for port_id in 1..=dev_attr.phys_port_cnt {
            let port_attr = ctx
                .query_port(port_id)
                .map_err(|e| Error::resource(format!("failed to query port {}: {}", port_id, e)))?;

            if !port_attr.is_active() {
                continue;
            }

            if skipped_active == index {
                if !port_attr.is_infiniband() {
                    return Err(Error::resource(format!(
                        "port {} link layer is {:?}, only InfiniBand is supported",
                        port_id,
                        port_attr.link_layer()
                    )));
                }

                return Ok(ResolvedPort {
                    ctx,
                    port_id,
                    port_lid: port_attr.lid(),
                });
            }

            skipped_active += 1;
        }

        Err(Error::resource(format!(
            "no active InfiniBand port at index {}",
            index
        )))
    }

    pub fn context(&self) -> &Arc<ibverbs::Context> {
        &self.ctx
    }

    /// 1-based port id, as required by verbs calls that take a port number.
    pub fn port_id(&self) -> u8 {
        self.port_id
    }

    pub fn port_lid(&self) -> u16 {
        self.port_lid
    }
}
