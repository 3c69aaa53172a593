//! The page pool: exclusive ownership of fixed-size KV pages across devices.
//!
//! Each device gets one `DeviceBufferSet` and one `FreeSet`, guarded together
//! by a per-device mutex. Nothing inside the lock waits on I/O; the only
//! device work done under it is a single page-sized slice copy.
//!
//! Scarcity is fail-fast: `acquire_free_pages` and `copy_page` return
//! `PoolError::Exhausted` instead of blocking, and the caller decides whether
//! to retry, evict or reject.
//!
//! Operations that touch several devices lock them in ascending `DeviceId`
//! order, so two such operations can never deadlock.

use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Instant,
};

use bytesize::ByteSize;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

use crate::buffer::DeviceBufferSet;
use crate::config::{ConfigError, PagePoolConfig};
use crate::device::{Device, DeviceError, DeviceId};
use crate::free_set::{FreeSet, SlotError};
use crate::metrics::core_metrics;
use crate::page::{DeviceSelector, Page};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Errors returned by `PagePool` operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Too few free pages. Expected under load; retry later, evict or reject.
    #[error("out of pages on {target}: {requested} requested, {available} available")]
    Exhausted {
        target: DeviceSelector,
        requested: usize,
        available: usize,
    },

    /// Released, stale, duplicated or foreign handle. A caller bug.
    #[error("invalid page handle {page:?}: {reason}")]
    InvalidHandle { page: Page, reason: String },

    #[error("device {0} is not part of this pool")]
    UnknownDevice(DeviceId),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("device {device} failed: {source}")]
    Device {
        device: DeviceId,
        #[source]
        source: DeviceError,
    },
}

impl PoolError {
    /// Whether the caller may reasonably retry the same call later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PoolError::Exhausted { .. })
    }
}

#[derive(Debug)]
struct DeviceState {
    free: FreeSet,
    buffers: DeviceBufferSet,
}

#[derive(Debug)]
struct DeviceSlot {
    id: DeviceId,
    state: Mutex<DeviceState>,
}

/// Fixed pool of equally sized pages on one or more devices.
///
/// The pool is `Sync`; share it as `Arc<PagePool>` between workers.
#[derive(Debug)]
pub struct PagePool {
    id: u64,
    config: PagePoolConfig,
    /// Sorted by ascending device id; this is the global lock order.
    devices: Vec<DeviceSlot>,
    /// Rotating start point for `DeviceSelector::Any` acquisitions.
    cursor: AtomicUsize,
}

impl PagePool {
    /// Allocate page buffers on every device and build the pool.
    ///
    /// # Errors
    /// `ConfigError` if `devices` is empty, lists a device twice, or any
    /// device cannot allocate its buffer. Buffers allocated before the
    /// failure are dropped; no partially built pool escapes.
    pub fn new(config: PagePoolConfig, devices: Vec<Arc<dyn Device>>) -> Result<Self, ConfigError> {
        if devices.is_empty() {
            return Err(ConfigError::NoDevices);
        }

        let mut devices = devices;
        devices.sort_by_key(|device| device.id());
        for pair in devices.windows(2) {
            if pair[0].id() == pair[1].id() {
                return Err(ConfigError::DuplicateDevice(pair[0].id()));
            }
        }

        // alloc_page_count is validated to fit u32 by PagePoolConfig::new.
        let capacity = config.alloc_page_count() as u32;
        let mut slots = Vec::with_capacity(devices.len());
        for device in devices {
            let id = device.id();
            let buffers = DeviceBufferSet::allocate(device, &config)?;
            slots.push(DeviceSlot {
                id,
                state: Mutex::new(DeviceState {
                    free: FreeSet::new(capacity),
                    buffers,
                }),
            });
        }

        let pool = Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            config,
            devices: slots,
            cursor: AtomicUsize::new(0),
        };

        let total_pages = pool.config.alloc_page_count() * pool.devices.len();
        if let Ok(total) = i64::try_from(total_pages) {
            core_metrics().capacity_pages.add(total, &[]);
        }

        info!(
            "Page pool ready: pool={}, devices={}, pages_per_device={}, page_size={}, per_device={}",
            pool.id,
            pool.devices.len(),
            pool.config.alloc_page_count(),
            ByteSize(pool.config.page_size_bytes() as u64),
            ByteSize(pool.config.total_bytes())
        );

        Ok(pool)
    }

    /// Acquire `count` distinct free pages, all on one device.
    ///
    /// With `DeviceSelector::Any`, devices are tried first-fit starting from a
    /// rotating cursor so consecutive callers spread across devices.
    ///
    /// # Errors
    /// `Exhausted` if no targeted device has `count` free pages (the free sets
    /// are left untouched), `UnknownDevice` for an unconfigured device,
    /// `InvalidArgument` for `count == 0`.
    pub fn acquire_free_pages(
        &self,
        count: usize,
        selector: impl Into<DeviceSelector>,
    ) -> Result<Vec<Page>, PoolError> {
        let selector = selector.into();
        if count == 0 {
            return Err(PoolError::InvalidArgument(
                "acquire_free_pages count must be >= 1".to_string(),
            ));
        }

        let pages = match selector {
            DeviceSelector::Device(id) => {
                let slot = self.slot(id)?;
                let mut state = slot.state.lock();
                let available = state.free.free_count();
                state
                    .free
                    .take(count)
                    .map(|issued| self.mint(slot.id, issued))
                    .ok_or(PoolError::Exhausted {
                        target: selector,
                        requested: count,
                        available,
                    })
            }
            DeviceSelector::Any => {
                let n = self.devices.len();
                let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
                let mut best_available = 0;
                let mut found = None;
                for step in 0..n {
                    let slot = &self.devices[(start + step) % n];
                    let mut state = slot.state.lock();
                    if let Some(issued) = state.free.take(count) {
                        found = Some(self.mint(slot.id, issued));
                        break;
                    }
                    best_available = best_available.max(state.free.free_count());
                }
                found.ok_or(PoolError::Exhausted {
                    target: selector,
                    requested: count,
                    available: best_available,
                })
            }
        };

        match &pages {
            Ok(pages) => {
                let metrics = core_metrics();
                metrics.acquired_pages.add(pages.len() as u64, &[]);
                metrics.pages_in_use.add(pages.len() as i64, &[]);
                debug!(
                    "Acquired pages: pool={} device={} count={}",
                    self.id,
                    pages[0].device_id(),
                    pages.len()
                );
            }
            Err(PoolError::Exhausted { available, .. }) => {
                core_metrics().exhausted.add(1, &[]);
                debug!(
                    "Pool exhausted: pool={} target={} requested={} available={}",
                    self.id, selector, count, available
                );
            }
            Err(_) => {}
        }
        pages
    }

    /// Return previously acquired pages to their free sets.
    ///
    /// All handles are validated before anything is released: if any handle
    /// is invalid (already released, stale, foreign, or listed twice) the call
    /// fails with `InvalidHandle` and no page is released. Freed pages become
    /// visible to acquirers only after every device lock taken here is dropped.
    pub fn release_pages(&self, pages: &[Page]) -> Result<(), PoolError> {
        if pages.is_empty() {
            return Ok(());
        }

        // Group by slot position; BTreeMap iteration gives ascending lock order.
        let mut by_slot: BTreeMap<usize, Vec<&Page>> = BTreeMap::new();
        for page in pages {
            self.check_owner(page)?;
            let position = self
                .position(page.device_id())
                .ok_or_else(|| self.invalid(page, "device is not part of this pool".to_string()))?;
            by_slot.entry(position).or_default().push(page);
        }

        let mut guards: Vec<(MutexGuard<'_, DeviceState>, Vec<&Page>)> = by_slot
            .into_iter()
            .map(|(position, group)| (self.devices[position].state.lock(), group))
            .collect();

        let mut seen = HashSet::with_capacity(pages.len());
        for (state, group) in &guards {
            for page in group {
                self.validate(state, page)?;
                if !seen.insert((page.device_id(), page.index())) {
                    return Err(self.invalid(page, "listed more than once in one release".to_string()));
                }
            }
        }

        for (state, group) in &mut guards {
            for page in group.iter() {
                state
                    .free
                    .release(page.index(), page.generation())
                    .map_err(|err| self.invalid(page, err.to_string()))?;
            }
        }
        drop(guards);

        let metrics = core_metrics();
        metrics.released_pages.add(pages.len() as u64, &[]);
        metrics.pages_in_use.add(-(pages.len() as i64), &[]);
        debug!("Released pages: pool={} count={}", self.id, pages.len());
        Ok(())
    }

    /// Duplicate `source` into a fresh page on the same device.
    ///
    /// The device lock is held across acquisition and copy, so no observer
    /// ever sees the destination allocated but unpopulated. On a device fault
    /// the destination goes back to the free set and `source` is untouched.
    pub fn copy_page(&self, source: &Page) -> Result<Page, PoolError> {
        self.check_owner(source)?;
        let slot = self.slot(source.device_id())?;
        let mut state = slot.state.lock();
        self.validate(&state, source)?;

        let Some((dst_index, dst_generation)) = state.free.pop() else {
            core_metrics().exhausted.add(1, &[]);
            debug!(
                "Pool exhausted on copy: pool={} source={}",
                self.id, source
            );
            return Err(PoolError::Exhausted {
                target: DeviceSelector::Device(slot.id),
                requested: 1,
                available: 0,
            });
        };

        let start = Instant::now();
        if let Err(source_err) = state.buffers.copy_page_slice(source.index(), dst_index) {
            let rollback = state.free.release(dst_index, dst_generation);
            debug_assert!(rollback.is_ok(), "freshly popped page must release");
            core_metrics().device_faults.add(1, &[]);
            error!(
                "Page copy failed: pool={} device={} src={} dst={} error={}",
                self.id,
                slot.id,
                source.index(),
                dst_index,
                source_err
            );
            return Err(PoolError::Device {
                device: slot.id,
                source: source_err,
            });
        }
        drop(state);

        let metrics = core_metrics();
        metrics
            .copy_duration_us
            .record(start.elapsed().as_secs_f64() * 1e6, &[]);
        metrics.page_copies.add(1, &[]);
        metrics.acquired_pages.add(1, &[]);
        metrics.pages_in_use.add(1, &[]);

        let copy = Page::new(self.id, slot.id, dst_index, dst_generation);
        debug!("Copied page: pool={} {} -> {}", self.id, source, copy);
        Ok(copy)
    }

    /// Read the full content of a page.
    pub fn read_page(&self, page: &Page) -> Result<Vec<u8>, PoolError> {
        self.check_owner(page)?;
        let slot = self.slot(page.device_id())?;
        let state = slot.state.lock();
        self.validate(&state, page)?;
        state.buffers.read_page(page.index()).map_err(|source| {
            core_metrics().device_faults.add(1, &[]);
            PoolError::Device {
                device: slot.id,
                source,
            }
        })
    }

    /// Write `data` into a page starting at `offset_bytes` within the page.
    pub fn write_page(&self, page: &Page, offset_bytes: usize, data: &[u8]) -> Result<(), PoolError> {
        let page_size = self.config.page_size_bytes();
        if offset_bytes
            .checked_add(data.len())
            .is_none_or(|end| end > page_size)
        {
            return Err(PoolError::InvalidArgument(format!(
                "write of {} bytes at offset {} exceeds page size {}",
                data.len(),
                offset_bytes,
                page_size
            )));
        }

        self.check_owner(page)?;
        let slot = self.slot(page.device_id())?;
        let mut state = slot.state.lock();
        self.validate(&state, page)?;
        state
            .buffers
            .write_page(page.index(), offset_bytes, data)
            .map_err(|source| {
                core_metrics().device_faults.add(1, &[]);
                PoolError::Device {
                    device: slot.id,
                    source,
                }
            })
    }

    /// Whether `page` is a live handle issued by this pool.
    pub fn is_valid(&self, page: &Page) -> bool {
        if page.pool_id() != self.id {
            return false;
        }
        match self.position(page.device_id()) {
            Some(position) => self.devices[position]
                .state
                .lock()
                .free
                .validate(page.index(), page.generation())
                .is_ok(),
            None => false,
        }
    }

    /// Total pages on the selected device(s). Unknown devices count as zero.
    pub fn page_count(&self, selector: impl Into<DeviceSelector>) -> usize {
        match selector.into() {
            DeviceSelector::Any => self.config.alloc_page_count() * self.devices.len(),
            DeviceSelector::Device(id) => {
                if self.position(id).is_some() {
                    self.config.alloc_page_count()
                } else {
                    0
                }
            }
        }
    }

    /// Free pages on the selected device(s). Unknown devices count as zero.
    pub fn free_count(&self, selector: impl Into<DeviceSelector>) -> usize {
        self.sum_over(selector.into(), |state| state.free.free_count())
    }

    /// Issued pages on the selected device(s). Unknown devices count as zero.
    pub fn allocated_count(&self, selector: impl Into<DeviceSelector>) -> usize {
        self.sum_over(selector.into(), |state| state.free.allocated_count())
    }

    /// Fraction of all pages currently issued (0.0 to 1.0).
    pub fn utilization(&self) -> f64 {
        let total = self.page_count(DeviceSelector::Any);
        self.allocated_count(DeviceSelector::Any) as f64 / total as f64
    }

    /// Configured device ids in ascending order.
    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.devices.iter().map(|slot| slot.id).collect()
    }

    pub fn config(&self) -> &PagePoolConfig {
        &self.config
    }

    pub fn page_size_bytes(&self) -> usize {
        self.config.page_size_bytes()
    }

    /// Unique id of this pool instance; handles carry it.
    pub fn id(&self) -> u64 {
        self.id
    }

    fn sum_over(&self, selector: DeviceSelector, f: impl Fn(&DeviceState) -> usize) -> usize {
        match selector {
            DeviceSelector::Any => self.devices.iter().map(|slot| f(&*slot.state.lock())).sum(),
            DeviceSelector::Device(id) => self
                .position(id)
                .map(|position| f(&*self.devices[position].state.lock()))
                .unwrap_or(0),
        }
    }

    fn position(&self, id: DeviceId) -> Option<usize> {
        self.devices.binary_search_by_key(&id, |slot| slot.id).ok()
    }

    fn slot(&self, id: DeviceId) -> Result<&DeviceSlot, PoolError> {
        self.position(id)
            .map(|position| &self.devices[position])
            .ok_or(PoolError::UnknownDevice(id))
    }

    fn mint(&self, device_id: DeviceId, issued: Vec<(u32, u32)>) -> Vec<Page> {
        issued
            .into_iter()
            .map(|(index, generation)| Page::new(self.id, device_id, index, generation))
            .collect()
    }

    fn check_owner(&self, page: &Page) -> Result<(), PoolError> {
        if page.pool_id() != self.id {
            return Err(self.invalid(page, format!("handle belongs to pool {}", page.pool_id())));
        }
        Ok(())
    }

    fn validate(&self, state: &DeviceState, page: &Page) -> Result<(), PoolError> {
        state
            .free
            .validate(page.index(), page.generation())
            .map_err(|err: SlotError| self.invalid(page, err.to_string()))
    }

    fn invalid(&self, page: &Page, reason: String) -> PoolError {
        core_metrics().invalid_handles.add(1, &[]);
        warn!("Invalid page handle: pool={} page={:?} reason={}", self.id, page, reason);
        PoolError::InvalidHandle {
            page: page.clone(),
            reason,
        }
    }
}

impl Drop for PagePool {
    fn drop(&mut self) {
        let metrics = core_metrics();
        let total_pages = self.config.alloc_page_count() * self.devices.len();
        let in_use: usize = self
            .devices
            .iter_mut()
            .map(|slot| slot.state.get_mut().free.allocated_count())
            .sum();
        if let (Ok(total), Ok(in_use)) = (i64::try_from(total_pages), i64::try_from(in_use)) {
            metrics.capacity_pages.add(-total, &[]);
            metrics.pages_in_use.add(-in_use, &[]);
        }
        if in_use > 0 {
            debug!("Dropping pool {} with {} pages still issued", self.id, in_use);
        }
    }
}
