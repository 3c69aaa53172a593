//! Immutable page pool configuration.
//!
//! A `PagePoolConfig` describes the geometry shared by every device in a
//! pool: how many pages each device holds, the element type stored in them,
//! and how many elements make up one page. All derived sizes are computed with
//! checked arithmetic so an impossible configuration is rejected before any
//! device memory is touched.

use std::{fmt, str::FromStr};

use thiserror::Error;

use crate::device::{DeviceError, DeviceId};

/// Fixed-width element types a page can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F16,
    BF16,
    F32,
    F64,
    F8E4M3,
    I8,
    U8,
    I32,
}

impl DType {
    /// Width of one element in bytes.
    pub const fn size_bytes(self) -> usize {
        match self {
            DType::F8E4M3 | DType::I8 | DType::U8 => 1,
            DType::F16 | DType::BF16 => 2,
            DType::F32 | DType::I32 => 4,
            DType::F64 => 8,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            DType::F16 => "float16",
            DType::BF16 => "bfloat16",
            DType::F32 => "float32",
            DType::F64 => "float64",
            DType::F8E4M3 => "float8_e4m3",
            DType::I8 => "int8",
            DType::U8 => "uint8",
            DType::I32 => "int32",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "float16" | "f16" => Ok(DType::F16),
            "bfloat16" | "bf16" => Ok(DType::BF16),
            "float32" | "f32" => Ok(DType::F32),
            "float64" | "f64" => Ok(DType::F64),
            "float8_e4m3" | "f8e4m3" => Ok(DType::F8E4M3),
            "int8" | "i8" => Ok(DType::I8),
            "uint8" | "u8" => Ok(DType::U8),
            "int32" | "i32" => Ok(DType::I32),
            other => Err(ConfigError::UnknownDType(other.to_string())),
        }
    }
}

/// Errors raised while validating configuration or constructing a pool.
///
/// A pool that fails with any of these is never returned to the caller.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("alloc_page_count must be greater than zero")]
    ZeroPageCount,

    #[error("paged_kv_block_size_elements must be greater than zero")]
    ZeroBlockElements,

    #[error("alloc_page_count {0} exceeds the u32 page index range")]
    PageCountTooLarge(usize),

    #[error(
        "pool size overflows: {pages} pages x {elements} elements x {dtype_bytes} bytes"
    )]
    SizeOverflow {
        pages: usize,
        elements: usize,
        dtype_bytes: usize,
    },

    #[error("at least one device is required")]
    NoDevices,

    #[error("device {0} listed more than once")]
    DuplicateDevice(DeviceId),

    #[error("device {device} cannot address {requested} bytes (max {max})")]
    BufferTooLarge {
        device: DeviceId,
        requested: u64,
        max: u64,
    },

    #[error("device {device} failed to allocate its page buffer: {source}")]
    Allocation {
        device: DeviceId,
        #[source]
        source: DeviceError,
    },

    #[error("unknown isolation mode '{0}' (expected 'per_fiber' or 'per_call')")]
    UnknownIsolation(String),

    #[error("unknown dtype '{0}'")]
    UnknownDType(String),

    #[error("fibers_per_device must be greater than zero")]
    ZeroFibers,
}

/// Geometry of a page pool, identical for every device in the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagePoolConfig {
    alloc_page_count: usize,
    dtype: DType,
    paged_kv_block_size_elements: usize,
    page_size_bytes: usize,
    total_bytes: u64,
}

impl PagePoolConfig {
    /// Validate and build a config.
    ///
    /// # Errors
    /// Returns `ConfigError` if either count is zero, the page count does not
    /// fit a `u32` index, or the per-device buffer size overflows.
    pub fn new(
        alloc_page_count: usize,
        dtype: DType,
        paged_kv_block_size_elements: usize,
    ) -> Result<Self, ConfigError> {
        if alloc_page_count == 0 {
            return Err(ConfigError::ZeroPageCount);
        }
        if paged_kv_block_size_elements == 0 {
            return Err(ConfigError::ZeroBlockElements);
        }
        if u32::try_from(alloc_page_count).is_err() {
            return Err(ConfigError::PageCountTooLarge(alloc_page_count));
        }

        let overflow = || ConfigError::SizeOverflow {
            pages: alloc_page_count,
            elements: paged_kv_block_size_elements,
            dtype_bytes: dtype.size_bytes(),
        };

        let page_size_bytes = paged_kv_block_size_elements
            .checked_mul(dtype.size_bytes())
            .ok_or_else(overflow)?;
        let total_bytes = alloc_page_count
            .checked_mul(page_size_bytes)
            .and_then(|total| u64::try_from(total).ok())
            .ok_or_else(overflow)?;

        Ok(Self {
            alloc_page_count,
            dtype,
            paged_kv_block_size_elements,
            page_size_bytes,
            total_bytes,
        })
    }

    /// Size the pool from a per-device memory budget.
    ///
    /// The page count is `budget_bytes / page_size_bytes`, rounded down.
    pub fn from_budget(
        budget_bytes: u64,
        dtype: DType,
        paged_kv_block_size_elements: usize,
    ) -> Result<Self, ConfigError> {
        let page_size_bytes = paged_kv_block_size_elements
            .checked_mul(dtype.size_bytes())
            .ok_or(ConfigError::SizeOverflow {
                pages: 0,
                elements: paged_kv_block_size_elements,
                dtype_bytes: dtype.size_bytes(),
            })?;
        if page_size_bytes == 0 {
            return Err(ConfigError::ZeroBlockElements);
        }
        let pages = usize::try_from(budget_bytes / page_size_bytes as u64)
            .map_err(|_| ConfigError::PageCountTooLarge(usize::MAX))?;
        Self::new(pages, dtype, paged_kv_block_size_elements)
    }

    /// Elements per page for a KV block holding both K and V.
    ///
    /// `2 * tokens_per_page * num_kv_heads * head_dim`
    pub fn kv_block_elements(tokens_per_page: usize, num_kv_heads: usize, head_dim: usize) -> usize {
        2 * tokens_per_page * num_kv_heads * head_dim
    }

    pub fn alloc_page_count(&self) -> usize {
        self.alloc_page_count
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn paged_kv_block_size_elements(&self) -> usize {
        self.paged_kv_block_size_elements
    }

    /// Bytes occupied by one page.
    pub fn page_size_bytes(&self) -> usize {
        self.page_size_bytes
    }

    /// Bytes each device must allocate to back the whole pool.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Elements each device must allocate to back the whole pool.
    pub fn total_elements(&self) -> usize {
        self.alloc_page_count * self.paged_kv_block_size_elements
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_sizes() {
        let config = PagePoolConfig::new(256, DType::F16, 393216).unwrap();
        assert_eq!(config.page_size_bytes(), 786432);
        assert_eq!(config.total_bytes(), 256 * 786432);
        assert_eq!(config.total_elements(), 256 * 393216);
    }

    #[test]
    fn rejects_zero_counts() {
        assert!(matches!(
            PagePoolConfig::new(0, DType::F16, 16),
            Err(ConfigError::ZeroPageCount)
        ));
        assert!(matches!(
            PagePoolConfig::new(16, DType::F16, 0),
            Err(ConfigError::ZeroBlockElements)
        ));
    }

    #[test]
    fn rejects_overflowing_geometry() {
        let err = PagePoolConfig::new(u32::MAX as usize, DType::F64, usize::MAX / 4).unwrap_err();
        assert!(matches!(err, ConfigError::SizeOverflow { .. }));
    }

    #[test]
    fn kv_block_elements_counts_k_and_v() {
        // 2 * 16 * 8 * 128
        assert_eq!(PagePoolConfig::kv_block_elements(16, 8, 128), 32768);
    }

    #[test]
    fn from_budget_rounds_down() {
        let elements = PagePoolConfig::kv_block_elements(16, 8, 128);
        let config = PagePoolConfig::from_budget(1024 * 1024 + 100, DType::F16, elements).unwrap();
        // 64 KiB per page
        assert_eq!(config.alloc_page_count(), 16);
    }

    #[test]
    fn dtype_names_round_trip() {
        for dtype in [DType::F16, DType::BF16, DType::F32, DType::I8] {
            assert_eq!(dtype.name().parse::<DType>().unwrap(), dtype);
        }
        assert_eq!("f16".parse::<DType>().unwrap(), DType::F16);
        assert!(matches!(
            "Float16".parse::<DType>(),
            Err(ConfigError::UnknownDType(_))
        ));
    }
}
