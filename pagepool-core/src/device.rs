//! Abstract device capability consumed by the page pool.
//!
//! The pool never talks to a concrete accelerator API. It only needs to
//! allocate one typed buffer per device and move bytes between slices of it.
//! `HostDevice` backs buffers with ordinary host memory; the `cuda` feature
//! adds a `cudarc` implementation in [`crate::cuda`].

use std::{fmt, ops::Range};

use thiserror::Error;

use crate::config::DType;

/// Logical device identifier as handed out by the model-execution side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Failures reported by the buffer layer.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device out of memory ({requested} bytes requested)")]
    OutOfMemory { requested: u64 },

    #[error("access out of bounds: offset {offset} len {len} exceeds buffer of {size} bytes")]
    OutOfBounds { offset: usize, len: usize, size: usize },

    #[error("device fault: {0}")]
    Fault(String),
}

/// A device capable of allocating page buffers.
pub trait Device: Send + Sync + fmt::Debug {
    fn id(&self) -> DeviceId;

    /// Human readable name used in logs.
    fn name(&self) -> &str;

    /// Largest single buffer this device can address, in bytes.
    fn max_buffer_bytes(&self) -> u64;

    /// Allocate a zero-initialised buffer of `elements` elements of `dtype`.
    fn allocate(&self, dtype: DType, elements: usize) -> Result<Box<dyn DeviceBuffer>, DeviceError>;
}

/// One contiguous device allocation, addressed in bytes.
///
/// Implementations are only ever accessed under the owning pool's
/// per-device lock, so `&mut self` methods never race.
pub trait DeviceBuffer: Send + fmt::Debug {
    fn len_bytes(&self) -> usize;

    /// Copy `src` to the range starting at `dst`. Ranges never overlap.
    fn copy_within(&mut self, src: Range<usize>, dst: usize) -> Result<(), DeviceError>;

    /// Read `out.len()` bytes starting at `offset` into host memory.
    fn read(&self, offset: usize, out: &mut [u8]) -> Result<(), DeviceError>;

    /// Write `data` into the buffer starting at `offset`.
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), DeviceError>;
}

pub(crate) fn check_bounds(offset: usize, len: usize, size: usize) -> Result<(), DeviceError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(DeviceError::OutOfBounds { offset, len, size }),
    }
}

/// Device backed by host memory.
#[derive(Debug, Clone)]
pub struct HostDevice {
    id: DeviceId,
    name: String,
    max_buffer_bytes: u64,
}

impl HostDevice {
    /// Default addressable limit for host buffers (`isize::MAX`, the Rust allocation ceiling).
    pub const DEFAULT_MAX_BUFFER_BYTES: u64 = isize::MAX as u64;

    pub fn new(id: u32) -> Self {
        Self {
            id: DeviceId(id),
            name: format!("host{id}"),
            max_buffer_bytes: Self::DEFAULT_MAX_BUFFER_BYTES,
        }
    }

    /// Cap the buffer size this device accepts.
    pub fn with_max_buffer_bytes(mut self, max_buffer_bytes: u64) -> Self {
        self.max_buffer_bytes = max_buffer_bytes;
        self
    }
}

impl Device for HostDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn max_buffer_bytes(&self) -> u64 {
        self.max_buffer_bytes
    }

    fn allocate(&self, dtype: DType, elements: usize) -> Result<Box<dyn DeviceBuffer>, DeviceError> {
        let bytes = elements
            .checked_mul(dtype.size_bytes())
            .ok_or(DeviceError::OutOfMemory { requested: u64::MAX })?;
        if bytes as u64 > self.max_buffer_bytes {
            return Err(DeviceError::OutOfMemory {
                requested: bytes as u64,
            });
        }

        let mut data = Vec::new();
        data.try_reserve_exact(bytes)
            .map_err(|_| DeviceError::OutOfMemory {
                requested: bytes as u64,
            })?;
        data.resize(bytes, 0u8);
        Ok(Box::new(HostBuffer { data }))
    }
}

/// Host memory buffer handed out by `HostDevice`.
pub struct HostBuffer {
    data: Vec<u8>,
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer")
            .field("len_bytes", &self.data.len())
            .finish()
    }
}

impl DeviceBuffer for HostBuffer {
    fn len_bytes(&self) -> usize {
        self.data.len()
    }

    fn copy_within(&mut self, src: Range<usize>, dst: usize) -> Result<(), DeviceError> {
        let size = self.data.len();
        check_bounds(src.start, src.len(), size)?;
        check_bounds(dst, src.len(), size)?;
        self.data.copy_within(src, dst);
        Ok(())
    }

    fn read(&self, offset: usize, out: &mut [u8]) -> Result<(), DeviceError> {
        check_bounds(offset, out.len(), self.data.len())?;
        out.copy_from_slice(&self.data[offset..offset + out.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), DeviceError> {
        check_bounds(offset, data.len(), self.data.len())?;
        self.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_buffer_is_zeroed_and_sized() {
        let device = HostDevice::new(0);
        let buffer = device.allocate(DType::F16, 64).unwrap();
        assert_eq!(buffer.len_bytes(), 128);

        let mut out = [0xffu8; 128];
        buffer.read(0, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn host_buffer_copy_within() {
        let device = HostDevice::new(0);
        let mut buffer = device.allocate(DType::U8, 8).unwrap();
        buffer.write(0, &[1, 2, 3, 4]).unwrap();
        buffer.copy_within(0..4, 4).unwrap();

        let mut out = [0u8; 8];
        buffer.read(0, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 1, 2, 3, 4]);
    }

    #[test]
    fn host_buffer_rejects_out_of_bounds() {
        let device = HostDevice::new(0);
        let mut buffer = device.allocate(DType::U8, 8).unwrap();
        let err = buffer.write(6, &[0; 4]).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::OutOfBounds {
                offset: 6,
                len: 4,
                size: 8
            }
        ));
        assert!(buffer.copy_within(4..8, 5).is_err());
    }

    #[test]
    fn allocation_respects_max_buffer_bytes() {
        let device = HostDevice::new(3).with_max_buffer_bytes(100);
        assert!(device.allocate(DType::U8, 100).is_ok());
        let err = device.allocate(DType::F16, 51).unwrap_err();
        assert!(matches!(err, DeviceError::OutOfMemory { requested: 102 }));
    }

    #[test]
    fn device_id_display() {
        assert_eq!(DeviceId(7).to_string(), "dev7");
    }
}
