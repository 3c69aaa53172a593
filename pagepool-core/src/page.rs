// ============================================================================
// Page handles
// ============================================================================

use std::fmt;

use crate::device::DeviceId;

/// Handle to one page of a `PagePool`.
///
/// A `Page` identifies a slot but does not own memory. Cloning the handle
/// duplicates the *identifier* only; duplicating the *content* into an
/// independent slot is `PagePool::copy_page`.
///
/// `generation` is the slot's generation at issue time. Releasing a page
/// bumps the slot generation, so any handle that outlives its release is
/// rejected by the pool instead of silently aliasing the next holder.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Page {
    pool_id: u64,
    device_id: DeviceId,
    index: u32,
    generation: u32,
}

impl Page {
    pub(crate) fn new(pool_id: u64, device_id: DeviceId, index: u32, generation: u32) -> Self {
        Self {
            pool_id,
            device_id,
            index,
            generation,
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Index of the page within its device buffer.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub(crate) fn pool_id(&self) -> u64 {
        self.pool_id
    }

    /// Immutable description of this page, without the pool binding.
    pub fn descriptor(&self) -> PageDescriptor {
        PageDescriptor {
            device_id: self.device_id,
            index: self.index,
        }
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Page({}#{}@g{} pool={})",
            self.device_id, self.index, self.generation, self.pool_id
        )
    }
}

impl fmt::Display for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.device_id, self.index)
    }
}

/// Plain `(device, index)` pair, e.g. for building attention page tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageDescriptor {
    pub device_id: DeviceId,
    pub index: u32,
}

/// Which device(s) an acquisition or introspection call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceSelector {
    /// Any configured device. Acquisition rotates across devices first-fit;
    /// introspection sums over all of them.
    #[default]
    Any,
    /// Exactly this device.
    Device(DeviceId),
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSelector::Any => f.write_str("any device"),
            DeviceSelector::Device(id) => write!(f, "{id}"),
        }
    }
}

impl From<DeviceId> for DeviceSelector {
    fn from(id: DeviceId) -> Self {
        DeviceSelector::Device(id)
    }
}
