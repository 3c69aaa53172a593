use std::{ops::Range, sync::Arc};

use bytesize::ByteSize;
use log::info;

use crate::config::{ConfigError, PagePoolConfig};
use crate::device::{Device, DeviceBuffer, DeviceError, DeviceId};

/// Physical page storage for one device.
///
/// One contiguous buffer of `alloc_page_count * paged_kv_block_size_elements`
/// elements, split into `alloc_page_count` equal slices. Page `i` occupies
/// bytes `[i * page_size_bytes, (i + 1) * page_size_bytes)`.
#[derive(Debug)]
pub struct DeviceBufferSet {
    device: Arc<dyn Device>,
    buffer: Box<dyn DeviceBuffer>,
    page_size_bytes: usize,
    page_count: usize,
}

impl DeviceBufferSet {
    /// Allocate the page buffer on `device`.
    ///
    /// # Errors
    /// `ConfigError::BufferTooLarge` if the device cannot address the buffer,
    /// `ConfigError::Allocation` if the device refuses the allocation.
    pub fn allocate(device: Arc<dyn Device>, config: &PagePoolConfig) -> Result<Self, ConfigError> {
        let device_id = device.id();
        let total_bytes = config.total_bytes();
        if total_bytes > device.max_buffer_bytes() {
            return Err(ConfigError::BufferTooLarge {
                device: device_id,
                requested: total_bytes,
                max: device.max_buffer_bytes(),
            });
        }

        let buffer = device
            .allocate(config.dtype(), config.total_elements())
            .map_err(|source| ConfigError::Allocation {
                device: device_id,
                source,
            })?;

        if (buffer.len_bytes() as u64) < total_bytes {
            return Err(ConfigError::Allocation {
                device: device_id,
                source: DeviceError::OutOfMemory {
                    requested: total_bytes,
                },
            });
        }

        info!(
            "Allocated page buffer: device={} ({}), pages={}, page_size={}, total={}, dtype={}",
            device_id,
            device.name(),
            config.alloc_page_count(),
            ByteSize(config.page_size_bytes() as u64),
            ByteSize(total_bytes),
            config.dtype()
        );

        Ok(Self {
            device,
            buffer,
            page_size_bytes: config.page_size_bytes(),
            page_count: config.alloc_page_count(),
        })
    }

    pub fn device_id(&self) -> DeviceId {
        self.device.id()
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn page_size_bytes(&self) -> usize {
        self.page_size_bytes
    }

    /// Byte range of page `index` inside the device buffer.
    pub fn page_range(&self, index: u32) -> Range<usize> {
        let start = index as usize * self.page_size_bytes;
        start..start + self.page_size_bytes
    }

    /// Overwrite page `dst` with the content of page `src`.
    pub fn copy_page_slice(&mut self, src: u32, dst: u32) -> Result<(), DeviceError> {
        let src_range = self.page_range(src);
        let dst_offset = self.page_range(dst).start;
        self.buffer.copy_within(src_range, dst_offset)
    }

    /// Read a whole page into host memory.
    pub fn read_page(&self, index: u32) -> Result<Vec<u8>, DeviceError> {
        let range = self.page_range(index);
        let mut out = vec![0u8; range.len()];
        self.buffer.read(range.start, &mut out)?;
        Ok(out)
    }

    /// Write `data` into page `index` starting at `offset_bytes` within the page.
    pub fn write_page(&mut self, index: u32, offset_bytes: usize, data: &[u8]) -> Result<(), DeviceError> {
        crate::device::check_bounds(offset_bytes, data.len(), self.page_size_bytes)?;
        let start = self.page_range(index).start + offset_bytes;
        self.buffer.write(start, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DType;
    use crate::device::HostDevice;

    fn buffer_set(pages: usize, elements: usize) -> DeviceBufferSet {
        let config = PagePoolConfig::new(pages, DType::U8, elements).unwrap();
        DeviceBufferSet::allocate(Arc::new(HostDevice::new(0)), &config).unwrap()
    }

    #[test]
    fn page_ranges_are_disjoint_and_adjacent() {
        let set = buffer_set(4, 32);
        assert_eq!(set.page_range(0), 0..32);
        assert_eq!(set.page_range(3), 96..128);
    }

    #[test]
    fn copy_page_slice_duplicates_content() {
        let mut set = buffer_set(4, 8);
        set.write_page(1, 0, &[7; 8]).unwrap();
        set.copy_page_slice(1, 2).unwrap();
        assert_eq!(set.read_page(2).unwrap(), vec![7; 8]);
        assert_eq!(set.read_page(0).unwrap(), vec![0; 8]);
    }

    #[test]
    fn write_page_stays_inside_the_page() {
        let mut set = buffer_set(2, 8);
        let err = set.write_page(0, 4, &[1; 8]).unwrap_err();
        assert!(matches!(err, DeviceError::OutOfBounds { .. }));
        assert_eq!(set.read_page(1).unwrap(), vec![0; 8]);
    }

    #[test]
    fn rejects_buffers_beyond_device_limit() {
        let config = PagePoolConfig::new(16, DType::F16, 64).unwrap();
        let device = Arc::new(HostDevice::new(1).with_max_buffer_bytes(1024));
        let err = DeviceBufferSet::allocate(device, &config).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::BufferTooLarge {
                device: DeviceId(1),
                requested: 2048,
                max: 1024
            }
        ));
    }
}
