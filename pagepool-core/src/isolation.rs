//! Isolation policies and scoped page reservations.
//!
//! A `Reservation` is the unit of page ownership handed to request code. It
//! remembers every page it acquired and gives them back to the pool exactly
//! once: either through `finish` or, on any other exit path (early return,
//! error, panic unwind), through `Drop`.
//!
//! Under `IsolationPolicy::PerFiber` one reservation lives as long as the
//! request and spans many calls on the same worker. Under
//! `IsolationPolicy::PerCall` every call gets its own reservation that is
//! dropped when the call returns.

use std::{fmt, str::FromStr, sync::Arc};

use log::{debug, error};
use thiserror::Error;

use crate::config::ConfigError;
use crate::page::{DeviceSelector, Page};
use crate::pool::{PagePool, PoolError};

/// Identifier of an inbound generation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req{}", self.0)
    }
}

/// How pool capacity is partitioned between concurrent requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IsolationPolicy {
    /// Pages are held per request on its worker across calls, until the
    /// request is finished.
    #[default]
    PerFiber,
    /// Pages are reserved per call and released before the call returns.
    PerCall,
}

impl IsolationPolicy {
    pub const fn as_str(self) -> &'static str {
        match self {
            IsolationPolicy::PerFiber => "per_fiber",
            IsolationPolicy::PerCall => "per_call",
        }
    }
}

impl fmt::Display for IsolationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IsolationPolicy {
    type Err = ConfigError;

    /// Case-sensitive: only `per_fiber` and `per_call` are accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "per_fiber" => Ok(IsolationPolicy::PerFiber),
            "per_call" => Ok(IsolationPolicy::PerCall),
            other => Err(ConfigError::UnknownIsolation(other.to_string())),
        }
    }
}

/// Lifecycle of one request's page ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Unassigned,
    Reserved,
    Completed,
    Failed,
    Cancelled,
    Released,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Failed | RequestState::Cancelled
        )
    }
}

/// How a request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Completed,
    Failed,
    Cancelled,
}

impl From<RequestOutcome> for RequestState {
    fn from(outcome: RequestOutcome) -> Self {
        match outcome {
            RequestOutcome::Completed => RequestState::Completed,
            RequestOutcome::Failed => RequestState::Failed,
            RequestOutcome::Cancelled => RequestState::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("request {request}: illegal transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub request: RequestId,
    pub from: RequestState,
    pub to: RequestState,
}

/// Why `Reservation::finish` did not end cleanly.
#[derive(Debug, Error)]
pub enum ReservationError {
    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    /// Some tracked handles were already released outside the reservation.
    /// Every still-valid page was released regardless.
    #[error("{released} pages released, {stale} handles were stale: {source}")]
    StaleHandles {
        released: usize,
        stale: usize,
        #[source]
        source: PoolError,
    },
}

impl ReservationError {
    /// Pages actually returned to the pool by the failed call.
    pub fn released(&self) -> usize {
        match self {
            ReservationError::Transition(_) => 0,
            ReservationError::StaleHandles { released, .. } => *released,
        }
    }
}

/// Outcome of giving a reservation's pages back.
struct ReleaseReport {
    released: usize,
    stale: Vec<Page>,
}

/// `Unassigned -> Reserved -> {Completed, Failed, Cancelled} -> Released`
///
/// `Unassigned` may jump straight to a terminal state. `Released` is final
/// and reachable exactly once.
#[derive(Debug)]
pub struct RequestLifecycle {
    request: RequestId,
    state: RequestState,
}

impl RequestLifecycle {
    pub fn new(request: RequestId) -> Self {
        Self {
            request,
            state: RequestState::Unassigned,
        }
    }

    pub fn request(&self) -> RequestId {
        self.request
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn reserve(&mut self) -> Result<(), InvalidTransition> {
        match self.state {
            RequestState::Unassigned | RequestState::Reserved => {
                self.state = RequestState::Reserved;
                Ok(())
            }
            from => Err(self.illegal(from, RequestState::Reserved)),
        }
    }

    pub fn finish(&mut self, outcome: RequestOutcome) -> Result<(), InvalidTransition> {
        let to = RequestState::from(outcome);
        match self.state {
            RequestState::Unassigned | RequestState::Reserved => {
                self.state = to;
                Ok(())
            }
            from => Err(self.illegal(from, to)),
        }
    }

    pub fn release(&mut self) -> Result<(), InvalidTransition> {
        if self.state.is_terminal() {
            self.state = RequestState::Released;
            Ok(())
        } else {
            Err(self.illegal(self.state, RequestState::Released))
        }
    }

    fn illegal(&self, from: RequestState, to: RequestState) -> InvalidTransition {
        InvalidTransition {
            request: self.request,
            from,
            to,
        }
    }
}

/// Pages owned by one request (per-fiber) or one call (per-call).
///
/// Every page acquired or copied through the reservation is tracked and
/// returned to the pool when the reservation finishes or is dropped.
pub struct Reservation {
    pool: Arc<PagePool>,
    device: DeviceSelector,
    pages: Vec<Page>,
    lifecycle: RequestLifecycle,
}

impl Reservation {
    /// Open a reservation that acquires from `device`.
    pub fn new(pool: Arc<PagePool>, request: RequestId, device: DeviceSelector) -> Self {
        Self {
            pool,
            device,
            pages: Vec::new(),
            lifecycle: RequestLifecycle::new(request),
        }
    }

    pub fn request(&self) -> RequestId {
        self.lifecycle.request()
    }

    pub fn state(&self) -> RequestState {
        self.lifecycle.state()
    }

    pub fn device(&self) -> DeviceSelector {
        self.device
    }

    pub fn pool(&self) -> &Arc<PagePool> {
        &self.pool
    }

    /// Pages currently held, in acquisition order.
    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Acquire `count` pages for this request.
    pub fn acquire(&mut self, count: usize) -> Result<Vec<Page>, PoolError> {
        self.ensure_active()?;
        let pages = self.pool.acquire_free_pages(count, self.device)?;
        self.mark_reserved();
        self.pages.extend(pages.iter().cloned());
        Ok(pages)
    }

    /// Duplicate `source` into a new page owned by this request.
    pub fn copy_page(&mut self, source: &Page) -> Result<Page, PoolError> {
        self.ensure_active()?;
        let copy = self.pool.copy_page(source)?;
        self.mark_reserved();
        self.pages.push(copy.clone());
        Ok(copy)
    }

    /// Release some of this request's pages early.
    ///
    /// Every page must be held by this reservation; otherwise nothing is
    /// released and `InvalidHandle` is returned.
    pub fn release(&mut self, pages: &[Page]) -> Result<(), PoolError> {
        if let Some(stranger) = pages.iter().find(|page| !self.pages.contains(page)) {
            return Err(PoolError::InvalidHandle {
                page: stranger.clone(),
                reason: format!("not held by {}", self.request()),
            });
        }
        self.pool.release_pages(pages)?;
        self.pages.retain(|held| !pages.contains(held));
        Ok(())
    }

    /// Move to a terminal state and give every held page back.
    ///
    /// Returns the number of pages released. Handles that were already
    /// released behind the reservation's back are reported as
    /// `StaleHandles`; every other page is still released and the request
    /// still ends `Released`. A second call fails with `Transition` and
    /// releases nothing.
    pub fn finish(&mut self, outcome: RequestOutcome) -> Result<usize, ReservationError> {
        self.lifecycle.finish(outcome)?;
        let report = self.release_all();
        self.lifecycle.release()?;
        debug!(
            "Request finished: request={} outcome={:?} released_pages={}",
            self.request(),
            outcome,
            report.released
        );
        match report.stale.first() {
            None => Ok(report.released),
            Some(page) => Err(ReservationError::StaleHandles {
                released: report.released,
                stale: report.stale.len(),
                source: PoolError::InvalidHandle {
                    page: page.clone(),
                    reason: format!("released outside the reservation of {}", self.request()),
                },
            }),
        }
    }

    fn ensure_active(&self) -> Result<(), PoolError> {
        match self.state() {
            RequestState::Unassigned | RequestState::Reserved => Ok(()),
            state => Err(PoolError::InvalidArgument(format!(
                "{} is {:?} and can no longer acquire pages",
                self.request(),
                state
            ))),
        }
    }

    fn mark_reserved(&mut self) {
        // Only called after ensure_active, so the transition is legal.
        let _ = self.lifecycle.reserve();
    }

    fn release_all(&mut self) -> ReleaseReport {
        let pages = std::mem::take(&mut self.pages);
        let (valid, mut stale): (Vec<Page>, Vec<Page>) =
            pages.into_iter().partition(|page| self.pool.is_valid(page));

        let mut released = 0;
        if self.pool.release_pages(&valid).is_ok() {
            released = valid.len();
        } else {
            // A handle went stale between the check and the release.
            for page in valid {
                match self.pool.release_pages(std::slice::from_ref(&page)) {
                    Ok(()) => released += 1,
                    Err(_) => stale.push(page),
                }
            }
        }

        if !stale.is_empty() {
            error!(
                "Reservation held stale handles: request={} stale={} released={}",
                self.request(),
                stale.len(),
                released
            );
        }
        ReleaseReport { released, stale }
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("request", &self.request())
            .field("state", &self.state())
            .field("device", &self.device)
            .field("pages", &self.pages.len())
            .finish()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.state() == RequestState::Released {
            return;
        }
        if !self.state().is_terminal() {
            // Dropped without an explicit outcome: error path or unwind.
            let _ = self.lifecycle.finish(RequestOutcome::Failed);
        }
        let report = self.release_all();
        let _ = self.lifecycle.release();
        if report.released > 0 {
            debug!(
                "Reservation dropped: request={} released_pages={}",
                self.request(),
                report.released
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DType, PagePoolConfig};
    use crate::device::{Device, HostDevice};
    use std::panic::{AssertUnwindSafe, catch_unwind};

    fn pool(pages: usize) -> Arc<PagePool> {
        let config = PagePoolConfig::new(pages, DType::F16, 32).unwrap();
        let devices: Vec<Arc<dyn Device>> = vec![Arc::new(HostDevice::new(0))];
        Arc::new(PagePool::new(config, devices).unwrap())
    }

    #[test]
    fn isolation_parses_case_sensitively() {
        assert_eq!("per_fiber".parse::<IsolationPolicy>().unwrap(), IsolationPolicy::PerFiber);
        assert_eq!("per_call".parse::<IsolationPolicy>().unwrap(), IsolationPolicy::PerCall);
        assert!(matches!(
            "PER_CALL".parse::<IsolationPolicy>(),
            Err(ConfigError::UnknownIsolation(_))
        ));
        assert!("per-call".parse::<IsolationPolicy>().is_err());
        assert_eq!(IsolationPolicy::default().to_string(), "per_fiber");
    }

    #[test]
    fn lifecycle_releases_exactly_once() {
        let mut lifecycle = RequestLifecycle::new(RequestId(1));
        lifecycle.reserve().unwrap();
        lifecycle.finish(RequestOutcome::Cancelled).unwrap();
        assert_eq!(lifecycle.state(), RequestState::Cancelled);

        assert!(lifecycle.reserve().is_err());
        assert!(lifecycle.finish(RequestOutcome::Completed).is_err());

        lifecycle.release().unwrap();
        assert_eq!(lifecycle.state(), RequestState::Released);
        let err = lifecycle.release().unwrap_err();
        assert_eq!(err.from, RequestState::Released);
    }

    #[test]
    fn lifecycle_requires_outcome_before_release() {
        let mut lifecycle = RequestLifecycle::new(RequestId(2));
        assert!(lifecycle.release().is_err());
        lifecycle.finish(RequestOutcome::Failed).unwrap();
        lifecycle.release().unwrap();
    }

    #[test]
    fn reservation_tracks_acquired_and_copied_pages() {
        let pool = pool(8);
        let mut reservation = Reservation::new(Arc::clone(&pool), RequestId(1), DeviceSelector::Any);
        assert_eq!(reservation.state(), RequestState::Unassigned);

        let pages = reservation.acquire(2).unwrap();
        let fork = reservation.copy_page(&pages[1]).unwrap();
        assert_eq!(reservation.len(), 3);
        assert_eq!(reservation.state(), RequestState::Reserved);
        assert_eq!(pool.free_count(DeviceSelector::Any), 5);

        reservation.release(std::slice::from_ref(&fork)).unwrap();
        assert_eq!(reservation.len(), 2);
        assert_eq!(pool.free_count(DeviceSelector::Any), 6);

        assert_eq!(reservation.finish(RequestOutcome::Completed).unwrap(), 2);
        assert_eq!(reservation.state(), RequestState::Released);
        assert_eq!(pool.free_count(DeviceSelector::Any), 8);

        assert!(matches!(
            reservation.finish(RequestOutcome::Completed),
            Err(ReservationError::Transition(_))
        ));
        assert!(reservation.acquire(1).is_err());
        assert_eq!(pool.free_count(DeviceSelector::Any), 8);
    }

    #[test]
    fn finish_releases_remaining_pages_when_a_handle_went_stale() {
        let pool = pool(8);
        let mut reservation = Reservation::new(Arc::clone(&pool), RequestId(4), DeviceSelector::Any);
        let pages = reservation.acquire(4).unwrap();

        // Released on the pool directly, so the reservation still tracks it.
        pool.release_pages(&pages[..1]).unwrap();
        assert_eq!(pool.free_count(DeviceSelector::Any), 5);

        let err = reservation.finish(RequestOutcome::Completed).unwrap_err();
        match &err {
            ReservationError::StaleHandles {
                released,
                stale,
                source,
            } => {
                assert_eq!(*released, 3);
                assert_eq!(*stale, 1);
                assert!(matches!(source, PoolError::InvalidHandle { page, .. } if *page == pages[0]));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.released(), 3);
        assert_eq!(reservation.state(), RequestState::Released);
        assert_eq!(pool.free_count(DeviceSelector::Any), 8);

        drop(reservation);
        assert_eq!(pool.free_count(DeviceSelector::Any), 8);
    }

    #[test]
    fn drop_releases_remaining_pages_when_a_handle_went_stale() {
        let pool = pool(8);
        {
            let mut reservation = Reservation::new(Arc::clone(&pool), RequestId(5), DeviceSelector::Any);
            let pages = reservation.acquire(3).unwrap();
            pool.release_pages(&pages[1..2]).unwrap();
        }
        assert_eq!(pool.free_count(DeviceSelector::Any), 8);
    }

    #[test]
    fn reservation_rejects_pages_it_does_not_hold() {
        let pool = pool(4);
        let mut a = Reservation::new(Arc::clone(&pool), RequestId(1), DeviceSelector::Any);
        let mut b = Reservation::new(Arc::clone(&pool), RequestId(2), DeviceSelector::Any);
        let pages = a.acquire(1).unwrap();

        assert!(matches!(
            b.release(&pages),
            Err(PoolError::InvalidHandle { .. })
        ));
        assert!(pool.is_valid(&pages[0]));
    }

    #[test]
    fn drop_releases_on_error_path() {
        let pool = pool(4);

        fn failing_call(pool: &Arc<PagePool>) -> Result<(), PoolError> {
            let mut reservation = Reservation::new(Arc::clone(pool), RequestId(7), DeviceSelector::Any);
            reservation.acquire(3)?;
            reservation.acquire(3)?;
            Ok(())
        }

        let err = failing_call(&pool).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(pool.free_count(DeviceSelector::Any), 4);
    }

    #[test]
    fn drop_releases_on_panic() {
        let pool = pool(4);
        let before = pool.free_count(DeviceSelector::Any);

        let result = catch_unwind(AssertUnwindSafe(|| {
            let mut reservation = Reservation::new(Arc::clone(&pool), RequestId(9), DeviceSelector::Any);
            reservation.acquire(2).unwrap();
            panic!("step failed mid-operation");
        }));

        assert!(result.is_err());
        assert_eq!(pool.free_count(DeviceSelector::Any), before);
    }
}
