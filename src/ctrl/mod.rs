//! Device enumeration, port resolution, and the resource registries built
//! on top of them.

mod block;
mod device;

pub use block::{
    BufferView, BufferViewMut, ControlBlock, MemoryRights, MrDescriptor, MrHandle, PinnedPool,
};
pub use device::{Devices, ResolvedPort};
