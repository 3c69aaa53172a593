//! Paged KV-cache page pool.
//!
//! Attention key/value state lives in a fixed set of equally sized pages per
//! device. This crate hands those pages out to concurrent generation
//! requests:
//! - `PagePool` acquires, releases and duplicates pages (`copy_page`)
//! - `Reservation` scopes page ownership to a request or a single call
//! - `RequestWorkerPool` runs request jobs on `fibers_per_device` workers per
//!   device under an `IsolationPolicy`

pub mod buffer;
pub mod config;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod device;
mod free_set;
pub mod isolation;
pub mod logging;
mod metrics;
pub mod page;
pub mod pool;
pub mod utils;
pub mod worker;

pub use buffer::DeviceBufferSet;
pub use config::{ConfigError, DType, PagePoolConfig};
#[cfg(feature = "cuda")]
pub use cuda::CudaDevice;
pub use device::{Device, DeviceBuffer, DeviceError, DeviceId, HostDevice};
pub use isolation::{
    InvalidTransition, IsolationPolicy, RequestId, RequestLifecycle, RequestOutcome, RequestState,
    Reservation, ReservationError,
};
pub use page::{DeviceSelector, Page, PageDescriptor};
pub use pool::{PagePool, PoolError};
pub use worker::{RequestWorkerPool, WorkerError, WorkerPoolConfig};

// ============================================================================
// Page layout
// ============================================================================
//
// Each device owns one contiguous buffer. Page i is the byte slice
//
//   [i * page_size_bytes, (i + 1) * page_size_bytes)
//
// with page_size_bytes = paged_kv_block_size_elements * dtype width. Pages
// never move and never overlap; a `Page` handle is just (device, index,
// generation) and the pool translates it to that slice under the device lock.
// ============================================================================
