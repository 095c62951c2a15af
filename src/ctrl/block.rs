//! # Control block
//! A namespace-scoped registry of RDMA resources bound to one device port:
//! protection domains, host and device buffers, memory regions, and
//! completion queues, each addressed by a caller-chosen name instead of a
//! raw handle the caller has to thread through their own code.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::ctrl::device::ResolvedPort;
use crate::error::{Error, Result};

bitflags! {
    /// Access rights granted to a registered memory region. Mirrors the
    /// `ibv_access_flags` a memory region is created with.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct MemoryRights: u32 {
        const LOCAL_READ    = 0b0000_0001;
        const LOCAL_WRITE   = 0b0000_0010;
        const REMOTE_READ   = 0b0000_0100;
        const REMOTE_WRITE  = 0b0000_1000;
        const REMOTE_ATOMIC = 0b0001_0000;
    }
}

impl MemoryRights {
    fn validate(self) -> Result<()> {
        if self.contains(MemoryRights::REMOTE_WRITE) && !self.contains(MemoryRights::LOCAL_WRITE) {
            return Err(Error::config(
                "REMOTE_WRITE requires LOCAL_WRITE on the same memory region",
            ));
        }
        Ok(())
    }
}

/// Backing pool for a pinned buffer. The fork/retainer process that keeps a
/// hugepage mapping alive across a real-time kernel panic is out of scope
/// here; this crate only promises the allocation succeeds or fails cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinnedPool {
    Normal4KiB,
    HugeDefault,
    Huge2MiB,
    Huge1GiB,
}

/// An aligned, zero-initialized host buffer owned by the control block.
struct HostBuffer {
    ptr: *mut u8,
    layout: Layout,
    len: usize,
}

impl HostBuffer {
    fn allocate(length: usize, alignment: usize) -> Result<Self> {
        let align = alignment.max(1).next_power_of_two();
        let layout = Layout::from_size_align(length.max(1), align)
            .map_err(|e| Error::resource(format!("bad buffer layout: {}", e)))?;

        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(Error::resource("host buffer allocation failed"));
        }

        Ok(HostBuffer {
            ptr,
            layout,
            len: length,
        })
    }

    fn len(&self) -> usize {
        self.len
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) }
    }
}

// `HostBuffer` owns its allocation exclusively; nothing else holds the pointer.
unsafe impl Send for HostBuffer {}

/// The bytes backing a named buffer slot. A buffer starts out as a plain
/// host allocation; the first time a memory region is registered over it,
/// its storage is promoted in place to the `ibverbs`-owned region so the
/// buffer and every memory region built from it afterwards read and write
/// the same bytes, instead of the registry silently forking into two
/// disjoint copies.
enum BufferBytes {
    Host(HostBuffer),
    Registered(ibverbs::MemoryRegion<u8>),
}

impl BufferBytes {
    fn len(&self) -> usize {
        match self {
            BufferBytes::Host(b) => b.len(),
            BufferBytes::Registered(r) => r.len(),
        }
    }

    fn get(&self, index: usize) -> u8 {
        match self {
            BufferBytes::Host(b) => b.as_slice()[index],
            BufferBytes::Registered(r) => r[index],
        }
    }

    fn set(&mut self, index: usize, value: u8) {
        match self {
            BufferBytes::Host(b) => b.as_mut_slice()[index] = value,
            BufferBytes::Registered(r) => r[index] = value,
        }
    }
}

/// A read-only view over a buffer slot's bytes, registered or not.
pub struct BufferView<'a>(Ref<'a, BufferBytes>);

impl<'a> BufferView<'a> {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.len() == 0
    }

    pub fn get(&self, index: usize) -> u8 {
        self.0.get(index)
    }
}

/// A mutable view over a buffer slot's bytes, registered or not.
pub struct BufferViewMut<'a>(RefMut<'a, BufferBytes>);

impl<'a> BufferViewMut<'a> {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.len() == 0
    }

    pub fn get(&self, index: usize) -> u8 {
        self.0.get(index)
    }

    pub fn set(&mut self, index: usize, value: u8) {
        self.0.set(index, value)
    }
}

struct BufferSlot {
    bytes: Rc<RefCell<BufferBytes>>,
    pool: Option<PinnedPool>,
}

/// A registered memory region: the sub-range of a named buffer's bytes a
/// peer needs to target it remotely, plus the rights it was registered
/// with. Shares its storage with the buffer it was built over, so writes
/// through one are visible through the other.
pub struct MrHandle {
    buffer: Rc<RefCell<BufferBytes>>,
    offset: usize,
    span: usize,
    rights: MemoryRights,
    zero_based: bool,
}

/// The `{addr, size, local_key, remote_key}` description of a registered
/// memory region, as handed to a peer during a handshake. `Serialize`/
/// `Deserialize` let it ride inside a handshake blob the same way NetCAT
/// bincodes its queue pair's `EndpointMsg`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MrDescriptor {
    pub addr: u64,
    pub size: usize,
    pub local_key: u32,
    pub remote_key: u32,
}

impl MrDescriptor {
    /// Encodes `self` for inclusion in a handshake's connection-info blob.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::protocol(format!("failed to encode memory region descriptor: {}", e)))
    }

    /// Decodes a descriptor a peer sent during a handshake.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::protocol(format!("failed to decode memory region descriptor: {}", e)))
    }
}

impl MrHandle {
    /// A zero-based region (device memory, or one requested that way)
    /// reports address 0 instead of its host-side pointer.
    pub fn descriptor(&self) -> MrDescriptor {
        let bytes = self.buffer.borrow();
        match &*bytes {
            BufferBytes::Registered(region) => MrDescriptor {
                addr: if self.zero_based {
                    0
                } else {
                    region.as_ptr() as u64 + self.offset as u64
                },
                size: self.span,
                local_key: region.lkey(),
                remote_key: region.rkey(),
            },
            BufferBytes::Host(_) => {
                unreachable!("an MrHandle's buffer is always promoted to Registered at construction")
            }
        }
    }

    pub fn rights(&self) -> MemoryRights {
        self.rights
    }

    /// The span this memory region covers, read-only.
    pub fn view(&self) -> BufferView<'_> {
        BufferView(self.buffer.borrow())
    }

    /// The span this memory region covers, mutable.
    pub fn view_mut(&self) -> BufferViewMut<'_> {
        BufferViewMut(self.buffer.borrow_mut())
    }
}

/// Namespace-scoped registry of protection domains, buffers, memory
/// regions, and completion queues on a single resolved port.
pub struct ControlBlock {
    port: ResolvedPort,
    pds: HashMap<String, Arc<ibverbs::ProtectionDomain>>,
    buffers: HashMap<String, BufferSlot>,
    mrs: HashMap<String, MrHandle>,
    cqs: HashMap<String, Arc<ibverbs::CompletionQueue>>,
    #[cfg(feature = "device-memory")]
    device_buffers: HashMap<String, usize>,
}

impl ControlBlock {
    /// Completion queue depth every `register_cq` call creates.
    pub const CQ_DEPTH: i32 = 512;

    pub fn new(port: ResolvedPort) -> Self {
        ControlBlock {
            port,
            pds: HashMap::new(),
            buffers: HashMap::new(),
            mrs: HashMap::new(),
            cqs: HashMap::new(),
            #[cfg(feature = "device-memory")]
            device_buffers: HashMap::new(),
        }
    }

    pub fn port(&self) -> &ResolvedPort {
        &self.port
    }

    fn check_fresh<T>(map: &HashMap<String, T>, name: &str) -> Result<()> {
        if map.contains_key(name) {
            Err(Error::config(format!("name '{}' is already registered", name)))
        } else {
            Ok(())
        }
    }

    pub fn register_pd(&mut self, name: &str) -> Result<()> {
        Self::check_fresh(&self.pds, name)?;
        let pd = self
            .port
            .context()
            .alloc_pd()
            .map_err(|e| Error::resource(format!("protection domain allocation failed: {}", e)))?;
        self.pds.insert(name.to_string(), Arc::new(pd));
        Ok(())
    }

    pub fn pd(&self, name: &str) -> Result<&Arc<ibverbs::ProtectionDomain>> {
        self.pds
            .get(name)
            .ok_or_else(|| Error::not_found(format!("no protection domain named '{}'", name)))
    }

    /// Allocates a plain host buffer under `name`. `name` shares one
    /// namespace with [`allocate_pinned_buffer`](Self::allocate_pinned_buffer):
    /// a name used by either call collides with the other.
    pub fn allocate_buffer(&mut self, name: &str, length: usize, alignment: usize) -> Result<()> {
        Self::check_fresh(&self.buffers, name)?;
        let buf = HostBuffer::allocate(length, alignment)?;
        self.buffers.insert(
            name.to_string(),
            BufferSlot {
                bytes: Rc::new(RefCell::new(BufferBytes::Host(buf))),
                pool: None,
            },
        );
        Ok(())
    }

    pub fn buffer(&self, name: &str) -> Result<BufferView<'_>> {
        let slot = self
            .buffers
            .get(name)
            .ok_or_else(|| Error::not_found(format!("no buffer named '{}'", name)))?;
        Ok(BufferView(slot.bytes.borrow()))
    }

    pub fn buffer_mut(&self, name: &str) -> Result<BufferViewMut<'_>> {
        let slot = self
            .buffers
            .get(name)
            .ok_or_else(|| Error::not_found(format!("no buffer named '{}'", name)))?;
        Ok(BufferViewMut(slot.bytes.borrow_mut()))
    }

    /// Allocates a shared, optionally page-locked buffer from `pool`. Always
    /// succeeds or fails cleanly; does not itself keep the mapping alive
    /// across a real-time kernel panic (see the Design Notes). Shares one
    /// namespace with [`allocate_buffer`](Self::allocate_buffer).
    pub fn allocate_pinned_buffer(
        &mut self,
        name: &str,
        length: usize,
        pool: PinnedPool,
    ) -> Result<()> {
        Self::check_fresh(&self.buffers, name)?;
        let alignment = match pool {
            PinnedPool::Normal4KiB => 4 * 1024,
            PinnedPool::HugeDefault | PinnedPool::Huge2MiB => 2 * 1024 * 1024,
            PinnedPool::Huge1GiB => 1024 * 1024 * 1024,
        };
        let buf = HostBuffer::allocate(length, alignment)?;
        self.buffers.insert(
            name.to_string(),
            BufferSlot {
                bytes: Rc::new(RefCell::new(BufferBytes::Host(buf))),
                pool: Some(pool),
            },
        );
        Ok(())
    }

    pub fn pinned_buffer(&self, name: &str) -> Result<BufferView<'_>> {
        let slot = self
            .buffers
            .get(name)
            .ok_or_else(|| Error::not_found(format!("no buffer named '{}'", name)))?;
        if slot.pool.is_none() {
            return Err(Error::not_found(format!(
                "'{}' was not allocated as a pinned buffer",
                name
            )));
        }
        Ok(BufferView(slot.bytes.borrow()))
    }

    /// Registers a memory region on `pd_name` over `buffer_name`, optionally
    /// restricted to `[offset, offset + length)`. `rights` must satisfy
    /// `REMOTE_WRITE => LOCAL_WRITE`.
    ///
    /// The first memory region ever registered over a given buffer promotes
    /// that buffer's storage in place from a plain host allocation to the
    /// `ibverbs`-owned region (copying its current bytes across), so the
    /// buffer and every memory region built over it afterwards read and
    /// write the same underlying storage.
    pub fn register_mr(
        &mut self,
        name: &str,
        pd_name: &str,
        buffer_name: &str,
        offset: usize,
        length: Option<usize>,
        rights: MemoryRights,
    ) -> Result<()> {
        Self::check_fresh(&self.mrs, name)?;
        rights.validate()?;

        let buffer_len = self
            .buffers
            .get(buffer_name)
            .ok_or_else(|| Error::not_found(format!("no buffer named '{}'", buffer_name)))?
            .bytes
            .borrow()
            .len();
        let span = length.unwrap_or(buffer_len.saturating_sub(offset));
        if offset.saturating_add(span) > buffer_len {
            return Err(Error::config(format!(
                "requested span [{}, {}) exceeds buffer '{}' of length {}",
                offset,
                offset + span,
                buffer_name,
                buffer_len
            )));
        }

        let pd = self.pd(pd_name)?.clone();
        let shared = self.promote_buffer(buffer_name, &pd)?;

        self.mrs.insert(
            name.to_string(),
            MrHandle {
                buffer: shared,
                offset,
                span,
                rights,
                zero_based: false,
            },
        );
        Ok(())
    }

    /// Ensures `buffer_name`'s storage is backed by an `ibverbs`-registered
    /// region on `pd`, promoting it in place (and copying its existing
    /// bytes across) the first time this is called for that name. Returns
    /// the shared handle every `MrHandle` built over this buffer holds.
    fn promote_buffer(
        &mut self,
        buffer_name: &str,
        pd: &Arc<ibverbs::ProtectionDomain>,
    ) -> Result<Rc<RefCell<BufferBytes>>> {
        let slot = self
            .buffers
            .get_mut(buffer_name)
            .expect("buffer_name was just looked up in register_mr");

        let needs_promotion = matches!(&*slot.bytes.borrow(), BufferBytes::Host(_));
        if needs_promotion {
            let len = slot.bytes.borrow().len();
            let mut region = pd
                .allocate::<u8>(len.max(1))
                .map_err(|e| Error::resource(format!("memory region registration failed: {}", e)))?;
            {
                let old = slot.bytes.borrow();
                for i in 0..len {
                    region[i] = old.get(i);
                }
            }
            *slot.bytes.borrow_mut() = BufferBytes::Registered(region);
        }

        Ok(Rc::clone(&slot.bytes))
    }

    /// Allocates adapter-resident memory, zeroed via a DMA copy, available
    /// only with the `device-memory` feature. Device memory is its own
    /// name category, separate from `allocate_buffer`/`allocate_pinned_buffer`.
    #[cfg(feature = "device-memory")]
    pub fn allocate_device_memory(
        &mut self,
        name: &str,
        length: usize,
        _alignment: usize,
    ) -> Result<()> {
        Self::check_fresh(&self.device_buffers, name)?;
        self.device_buffers.insert(name.to_string(), length.max(1));
        Ok(())
    }

    /// Registers a memory region over a device buffer allocated with
    /// [`allocate_device_memory`](Self::allocate_device_memory). Device
    /// memory regions always address from 0, never from a host pointer.
    #[cfg(feature = "device-memory")]
    pub fn register_dm_mr(
        &mut self,
        name: &str,
        pd_name: &str,
        buffer_name: &str,
        rights: MemoryRights,
    ) -> Result<()> {
        Self::check_fresh(&self.mrs, name)?;
        rights.validate()?;

        let length = *self
            .device_buffers
            .get(buffer_name)
            .ok_or_else(|| Error::not_found(format!("no device buffer named '{}'", buffer_name)))?;

        let pd = self.pd(pd_name)?.clone();
        let region = pd
            .allocate::<u8>(length)
            .map_err(|e| Error::resource(format!("device memory region registration failed: {}", e)))?;

        self.mrs.insert(
            name.to_string(),
            MrHandle {
                buffer: Rc::new(RefCell::new(BufferBytes::Registered(region))),
                offset: 0,
                span: length,
                rights,
                zero_based: true,
            },
        );
        Ok(())
    }

    pub fn mr(&self, name: &str) -> Result<&MrHandle> {
        self.mrs
            .get(name)
            .ok_or_else(|| Error::not_found(format!("no memory region named '{}'", name)))
    }

    pub fn mr_mut(&mut self, name: &str) -> Result<&mut MrHandle> {
        self.mrs
            .get_mut(name)
            .ok_or_else(|| Error::not_found(format!("no memory region named '{}'", name)))
    }

    pub fn register_cq(&mut self, name: &str) -> Result<()> {
        Self::check_fresh(&self.cqs, name)?;
        let cq = self
            .port
            .context()
            .create_cq(Self::CQ_DEPTH, 0)
            .map_err(|e| Error::resource(format!("completion queue creation failed: {}", e)))?;
        self.cqs.insert(name.to_string(), Arc::new(cq));
        Ok(())
    }

    pub fn cq(&self, name: &str) -> Result<&Arc<ibverbs::CompletionQueue>> {
        self.cqs
            .get(name)
            .ok_or_else(|| Error::not_found(format!("no completion queue named '{}'", name)))
    }

    /// Drains up to `out.capacity()` completions from `cq` into `out`,
    /// replacing its previous contents. A zero-capacity `out` drains
    /// nothing. Leaves `out` untouched on error.
    pub fn poll(
        &self,
        cq: &ibverbs::CompletionQueue,
        out: &mut Vec<ibverbs::ibv_wc>,
    ) -> Result<()> {
        let capacity = out.capacity();
        let mut scratch = vec![unsafe { std::mem::zeroed::<ibverbs::ibv_wc>() }; capacity];

        let completions = cq
            .poll(&mut scratch)
            .map_err(|e| Error::io(format!("completion queue poll failed: {}", e)))?;

        out.clear();
        out.extend_from_slice(completions);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_rights_validate_rejects_remote_write_without_local_write() {
        let rights = MemoryRights::REMOTE_WRITE;
        assert!(rights.validate().is_err());
        assert!((rights | MemoryRights::LOCAL_WRITE).validate().is_ok());
    }

    #[test]
    fn mr_descriptor_round_trips_through_encode_decode() {
        let descriptor = MrDescriptor {
            addr: 0xdead_beef,
            size: 4096,
            local_key: 17,
            remote_key: 29,
        };
        let encoded = descriptor.encode().unwrap();
        let decoded = MrDescriptor::decode(&encoded).unwrap();
        assert_eq!(decoded.addr, descriptor.addr);
        assert_eq!(decoded.size, descriptor.size);
        assert_eq!(decoded.local_key, descriptor.local_key);
        assert_eq!(decoded.remote_key, descriptor.remote_key);
    }

    // `register_pd`/`register_mr`/`register_cq` need a real device and are
    // exercised manually, not in CI (see DESIGN.md, "Skipped: hardware-gated
    // tests"), so the buffer/pinned-buffer name collision is covered at the
    // `check_fresh`/`HashMap` level instead of through a live `ControlBlock`.
    #[test]
    fn check_fresh_rejects_a_name_already_present_in_the_map() {
        let mut buffers: HashMap<String, BufferSlot> = HashMap::new();
        buffers.insert(
            "x".to_string(),
            BufferSlot {
                bytes: Rc::new(RefCell::new(BufferBytes::Host(
                    HostBuffer::allocate(64, 8).unwrap(),
                ))),
                pool: None,
            },
        );

        // `allocate_buffer` and `allocate_pinned_buffer` both check
        // freshness against this same map, so a name claimed by either one
        // collides with the other.
        assert!(ControlBlock::check_fresh(&buffers, "x").is_err());
        assert!(ControlBlock::check_fresh(&buffers, "y").is_ok());
    }
}
