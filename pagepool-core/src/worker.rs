use std::{
    any::Any,
    collections::HashMap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread::JoinHandle,
};

use log::{debug, error, info, warn};
use logforth::diagnostic::ThreadLocalDiagnostic;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::config::ConfigError;
use crate::device::DeviceId;
use crate::isolation::{IsolationPolicy, RequestId, RequestOutcome, Reservation, ReservationError};
use crate::metrics::core_metrics;
use crate::pool::{PagePool, PoolError};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("page pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("worker {device}-fiber{worker} is gone")]
    WorkerGone { device: DeviceId, worker: usize },

    #[error("job panicked on worker {device}-fiber{worker}")]
    JobPanicked { device: DeviceId, worker: usize },

    #[error("device {0} has no workers")]
    UnknownDevice(DeviceId),

    #[error("failed to spawn worker: {0}")]
    Spawn(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    pub fibers_per_device: usize,
    pub isolation: IsolationPolicy,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            fibers_per_device: 1,
            isolation: IsolationPolicy::PerFiber,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobStatus {
    Ok,
    Failed,
    Panicked,
}

/// Type-erased job. Sends its own typed result and reports how it ended.
type Job = Box<dyn FnOnce(&mut Reservation) -> JobStatus + Send>;

enum Command {
    Run {
        request: RequestId,
        job: Job,
    },
    Finish {
        request: RequestId,
        outcome: RequestOutcome,
        reply: oneshot::Sender<Result<usize, WorkerError>>,
    },
}

struct Worker {
    tx: Option<mpsc::UnboundedSender<Command>>,
    thread: Option<JoinHandle<()>>,
}

struct DeviceWorkers {
    device: DeviceId,
    workers: Vec<Worker>,
    next: AtomicUsize,
}

#[derive(Debug, Clone, Copy)]
struct Assignment {
    device_pos: usize,
    worker: usize,
}

/// Fixed set of request workers, `fibers_per_device` per device.
///
/// Each worker is a dedicated OS thread draining its own channel, so the
/// jobs of one worker run strictly in submission order. Under
/// `IsolationPolicy::PerFiber` a request sticks to the worker it first
/// landed on and keeps its `Reservation` there until `finish`.
pub struct RequestWorkerPool {
    pool: Arc<PagePool>,
    config: WorkerPoolConfig,
    devices: Vec<DeviceWorkers>,
    assignments: Mutex<HashMap<RequestId, Assignment>>,
}

impl RequestWorkerPool {
    /// Spawn workers for every device of `pool`.
    pub fn spawn(pool: Arc<PagePool>, config: WorkerPoolConfig) -> Result<Self, WorkerError> {
        if config.fibers_per_device == 0 {
            return Err(PoolError::from(ConfigError::ZeroFibers).into());
        }

        let mut devices = Vec::new();
        for device in pool.device_ids() {
            let mut workers = Vec::with_capacity(config.fibers_per_device);
            for index in 0..config.fibers_per_device {
                let (tx, rx) = mpsc::unbounded_channel();
                let worker_pool = Arc::clone(&pool);
                let isolation = config.isolation;
                let thread = std::thread::Builder::new()
                    .name(format!("{device}-fiber{index}"))
                    .spawn(move || worker_loop(worker_pool, device, index, isolation, rx))
                    .map_err(|e| WorkerError::Spawn(format!("{device}-fiber{index}: {e}")))?;
                workers.push(Worker {
                    tx: Some(tx),
                    thread: Some(thread),
                });
            }
            devices.push(DeviceWorkers {
                device,
                workers,
                next: AtomicUsize::new(0),
            });
        }

        info!(
            "Request workers started: devices={} fibers_per_device={} isolation={}",
            devices.len(),
            config.fibers_per_device,
            config.isolation
        );

        Ok(Self {
            pool,
            config,
            devices,
            assignments: Mutex::new(HashMap::new()),
        })
    }

    /// Run `job` for `request` on a worker of `device` and await its result.
    ///
    /// Pages acquired through the reservation count against the request.
    /// Under `PerCall` they are released when the job returns; under
    /// `PerFiber` they stay held until `finish`. For a request already
    /// assigned to a worker, `device` is ignored and the job runs on that
    /// worker.
    ///
    /// The job is queued while the assignment table is locked, so a
    /// concurrent `finish` for the same request either sees this job ahead
    /// of it on the worker queue or runs first and leaves the job to open a
    /// fresh reservation that a later `finish` can reach.
    pub async fn submit<T, F>(&self, request: RequestId, device: DeviceId, job: F) -> Result<T, WorkerError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Reservation) -> Result<T, PoolError> + Send + 'static,
    {
        let (reply_rx, worker_device, worker) = {
            let mut assignments = self.assignments.lock();
            let assignment = self.assign(&mut assignments, request, device)?;
            let worker_device = self.devices[assignment.device_pos].device;
            let worker = assignment.worker;

            let (reply_tx, reply_rx) = oneshot::channel();
            let job: Job = Box::new(move |reservation: &mut Reservation| {
                let (status, reply) = match catch_unwind(AssertUnwindSafe(|| job(reservation))) {
                    Ok(Ok(value)) => (JobStatus::Ok, Ok(value)),
                    Ok(Err(err)) => (JobStatus::Failed, Err(WorkerError::Pool(err))),
                    Err(payload) => {
                        error!(
                            "Job panicked: request={} device={} worker={} message={}",
                            request,
                            worker_device,
                            worker,
                            panic_message(payload.as_ref())
                        );
                        core_metrics().worker_panics.add(1, &[]);
                        (
                            JobStatus::Panicked,
                            Err(WorkerError::JobPanicked {
                                device: worker_device,
                                worker,
                            }),
                        )
                    }
                };
                let _ = reply_tx.send(reply);
                status
            });

            self.send(assignment, Command::Run { request, job })?;
            (reply_rx, worker_device, worker)
        };

        reply_rx.await.map_err(|_| WorkerError::WorkerGone {
            device: worker_device,
            worker,
        })?
    }

    /// Tear down `request`: move it to `outcome` and release its pages.
    ///
    /// Returns the number of pages released. Unknown requests and the
    /// `PerCall` policy, which holds nothing between calls, return `0`.
    /// If some of the request's handles had already been released directly
    /// on the pool, the remaining pages are still released and the
    /// `InvalidHandle` is returned as `WorkerError::Pool`.
    pub async fn finish(&self, request: RequestId, outcome: RequestOutcome) -> Result<usize, WorkerError> {
        if self.config.isolation == IsolationPolicy::PerCall {
            return Ok(0);
        }

        let (assignment, reply_rx) = {
            let mut assignments = self.assignments.lock();
            let Some(assignment) = assignments.remove(&request) else {
                return Ok(0);
            };
            let (reply_tx, reply_rx) = oneshot::channel();
            self.send(
                assignment,
                Command::Finish {
                    request,
                    outcome,
                    reply: reply_tx,
                },
            )?;
            (assignment, reply_rx)
        };

        reply_rx.await.map_err(|_| WorkerError::WorkerGone {
            device: self.devices[assignment.device_pos].device,
            worker: assignment.worker,
        })?
    }

    /// Close every worker channel and join the threads.
    ///
    /// Requests still holding pages under `PerFiber` are cancelled and their
    /// pages released. Calls after shutdown fail with `WorkerGone`.
    pub fn shutdown(&mut self) {
        for device in &mut self.devices {
            for worker in &mut device.workers {
                worker.tx.take();
            }
        }
        for device in &mut self.devices {
            for (index, worker) in device.workers.iter_mut().enumerate() {
                if let Some(thread) = worker.thread.take()
                    && thread.join().is_err()
                {
                    error!("Request worker panicked: device={} worker={}", device.device, index);
                }
            }
        }
        self.assignments.lock().clear();
    }

    pub fn pool(&self) -> &Arc<PagePool> {
        &self.pool
    }

    pub fn fibers_per_device(&self) -> usize {
        self.config.fibers_per_device
    }

    pub fn isolation(&self) -> IsolationPolicy {
        self.config.isolation
    }

    pub fn worker_count(&self) -> usize {
        self.devices.iter().map(|d| d.workers.len()).sum()
    }

    fn assign(
        &self,
        assignments: &mut HashMap<RequestId, Assignment>,
        request: RequestId,
        device: DeviceId,
    ) -> Result<Assignment, WorkerError> {
        let pick = |device: DeviceId| -> Result<Assignment, WorkerError> {
            let device_pos = self
                .devices
                .iter()
                .position(|d| d.device == device)
                .ok_or(WorkerError::UnknownDevice(device))?;
            let workers = &self.devices[device_pos];
            let worker = workers.next.fetch_add(1, Ordering::Relaxed) % workers.workers.len();
            Ok(Assignment { device_pos, worker })
        };

        match self.config.isolation {
            IsolationPolicy::PerCall => pick(device),
            IsolationPolicy::PerFiber => {
                if let Some(assignment) = assignments.get(&request) {
                    return Ok(*assignment);
                }
                let assignment = pick(device)?;
                debug!(
                    "Request assigned: request={} device={} worker={}",
                    request, device, assignment.worker
                );
                assignments.insert(request, assignment);
                Ok(assignment)
            }
        }
    }

    fn send(&self, assignment: Assignment, command: Command) -> Result<(), WorkerError> {
        let workers = &self.devices[assignment.device_pos];
        let gone = || WorkerError::WorkerGone {
            device: workers.device,
            worker: assignment.worker,
        };
        let tx = workers.workers[assignment.worker].tx.as_ref().ok_or_else(gone)?;
        tx.send(command).map_err(|_| gone())
    }
}

impl Drop for RequestWorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    pool: Arc<PagePool>,
    device: DeviceId,
    index: usize,
    isolation: IsolationPolicy,
    mut rx: mpsc::UnboundedReceiver<Command>,
) {
    ThreadLocalDiagnostic::insert("device_id", device.to_string());
    ThreadLocalDiagnostic::insert("worker", index.to_string());

    debug!("Request worker initialized: device={} worker={}", device, index);

    let mut held: HashMap<RequestId, Reservation> = HashMap::new();

    while let Some(command) = rx.blocking_recv() {
        match command {
            Command::Run { request, job } => {
                core_metrics().worker_calls.add(1, &[]);
                match isolation {
                    IsolationPolicy::PerFiber => {
                        let reservation = held
                            .entry(request)
                            .or_insert_with(|| Reservation::new(Arc::clone(&pool), request, device.into()));
                        if job(reservation) == JobStatus::Panicked
                            && let Some(mut reservation) = held.remove(&request)
                        {
                            let _ = reservation.finish(RequestOutcome::Failed);
                        }
                    }
                    IsolationPolicy::PerCall => {
                        let mut reservation = Reservation::new(Arc::clone(&pool), request, device.into());
                        let outcome = match job(&mut reservation) {
                            JobStatus::Ok => RequestOutcome::Completed,
                            JobStatus::Failed | JobStatus::Panicked => RequestOutcome::Failed,
                        };
                        if let Err(e) = reservation.finish(outcome) {
                            warn!("Per-call reservation not finished cleanly: {}", e);
                        }
                    }
                }
            }
            Command::Finish {
                request,
                outcome,
                reply,
            } => {
                let result = match held.remove(&request) {
                    Some(mut reservation) => match reservation.finish(outcome) {
                        Ok(released) => Ok(released),
                        Err(ReservationError::StaleHandles { source, .. }) => Err(WorkerError::Pool(source)),
                        Err(ReservationError::Transition(e)) => {
                            warn!("Request already finished on worker: {}", e);
                            Ok(0)
                        }
                    },
                    None => Ok(0),
                };
                let _ = reply.send(result);
            }
        }
    }

    for (request, mut reservation) in held.drain() {
        match reservation.finish(RequestOutcome::Cancelled) {
            Ok(released) => info!(
                "Cancelled request at shutdown: request={} device={} released_pages={}",
                request, device, released
            ),
            Err(e) => warn!(
                "Cancelled request at shutdown: request={} device={} released_pages={} error={}",
                request,
                device,
                e.released(),
                e
            ),
        }
    }

    debug!("Request worker shutting down: device={} worker={}", device, index);
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DType, PagePoolConfig};
    use crate::device::{Device, HostDevice};
    use crate::page::DeviceSelector;

    fn pool(devices: u32, pages: usize) -> Arc<PagePool> {
        let config = PagePoolConfig::new(pages, DType::F16, 16).unwrap();
        let devices: Vec<Arc<dyn Device>> = (0..devices)
            .map(|d| Arc::new(HostDevice::new(d)) as Arc<dyn Device>)
            .collect();
        Arc::new(PagePool::new(config, devices).unwrap())
    }

    fn workers(pool: &Arc<PagePool>, fibers: usize, isolation: IsolationPolicy) -> RequestWorkerPool {
        RequestWorkerPool::spawn(
            Arc::clone(pool),
            WorkerPoolConfig {
                fibers_per_device: fibers,
                isolation,
            },
        )
        .unwrap()
    }

    #[test]
    fn zero_fibers_is_rejected() {
        let pool = pool(1, 4);
        let err = RequestWorkerPool::spawn(
            pool,
            WorkerPoolConfig {
                fibers_per_device: 0,
                isolation: IsolationPolicy::PerCall,
            },
        )
        .err()
        .unwrap();
        assert!(matches!(err, WorkerError::Pool(PoolError::Config(ConfigError::ZeroFibers))));
    }

    #[tokio::test]
    async fn worker_count_covers_every_device() {
        let pool = pool(2, 4);
        let workers = workers(&pool, 3, IsolationPolicy::PerFiber);
        assert_eq!(workers.worker_count(), 6);
        assert_eq!(workers.fibers_per_device(), 3);
        assert_eq!(workers.isolation(), IsolationPolicy::PerFiber);
    }

    #[tokio::test]
    async fn per_call_releases_when_the_call_returns() {
        let pool = pool(1, 16);
        let workers = workers(&pool, 2, IsolationPolicy::PerCall);

        let held = workers
            .submit(RequestId(1), DeviceId(0), |r| Ok(r.acquire(4)?.len()))
            .await
            .unwrap();
        assert_eq!(held, 4);
        assert_eq!(pool.free_count(DeviceSelector::Any), 16);
        assert_eq!(workers.finish(RequestId(1), RequestOutcome::Completed).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn per_call_failure_restores_free_count() {
        let pool = pool(1, 16);
        let workers = workers(&pool, 1, IsolationPolicy::PerCall);

        let err = workers
            .submit(RequestId(1), DeviceId(0), |r| -> Result<(), PoolError> {
                r.acquire(4)?;
                Err(PoolError::InvalidArgument("model step failed".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Pool(PoolError::InvalidArgument(_))));
        assert_eq!(pool.free_count(DeviceSelector::Any), 16);
    }

    #[tokio::test]
    async fn per_fiber_accumulates_until_finish() {
        let pool = pool(1, 16);
        let workers = workers(&pool, 2, IsolationPolicy::PerFiber);
        let request = RequestId(42);

        for _ in 0..3 {
            workers
                .submit(request, DeviceId(0), |r| r.acquire(2).map(|_| ()))
                .await
                .unwrap();
        }
        let held = workers.submit(request, DeviceId(0), |r| Ok(r.len())).await.unwrap();
        assert_eq!(held, 6);
        assert_eq!(pool.free_count(DeviceSelector::Any), 10);

        let released = workers.finish(request, RequestOutcome::Completed).await.unwrap();
        assert_eq!(released, 6);
        assert_eq!(pool.free_count(DeviceSelector::Any), 16);

        assert_eq!(workers.finish(request, RequestOutcome::Completed).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn per_fiber_requests_stick_to_one_worker() {
        let pool = pool(1, 8);
        let workers = workers(&pool, 4, IsolationPolicy::PerFiber);
        let request = RequestId(5);

        let thread_name = || -> Result<String, PoolError> {
            Ok(std::thread::current().name().unwrap_or_default().to_string())
        };
        let first = workers.submit(request, DeviceId(0), move |_| thread_name()).await.unwrap();
        for _ in 0..5 {
            let next = workers.submit(request, DeviceId(0), move |_| thread_name()).await.unwrap();
            assert_eq!(next, first);
        }
        assert!(first.starts_with("dev0-fiber"));
    }

    #[tokio::test]
    async fn cancelled_request_releases_its_pages() {
        let pool = pool(1, 8);
        let workers = workers(&pool, 1, IsolationPolicy::PerFiber);

        workers
            .submit(RequestId(1), DeviceId(0), |r| r.acquire(5).map(|_| ()))
            .await
            .unwrap();
        assert_eq!(pool.free_count(DeviceSelector::Any), 3);
        assert_eq!(workers.finish(RequestId(1), RequestOutcome::Cancelled).await.unwrap(), 5);
        assert_eq!(pool.free_count(DeviceSelector::Any), 8);
    }

    #[tokio::test]
    async fn finish_reports_handles_released_behind_the_reservation() {
        let pool = pool(1, 8);
        let workers = workers(&pool, 1, IsolationPolicy::PerFiber);
        let request = RequestId(6);

        workers
            .submit(request, DeviceId(0), |r| {
                let pages = r.acquire(4)?;
                r.pool().release_pages(&pages[..1])
            })
            .await
            .unwrap();
        assert_eq!(pool.free_count(DeviceSelector::Any), 5);

        let err = workers.finish(request, RequestOutcome::Completed).await.unwrap_err();
        assert!(matches!(err, WorkerError::Pool(PoolError::InvalidHandle { .. })));
        assert_eq!(pool.free_count(DeviceSelector::Any), 8);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn finish_racing_queued_submits_leaks_nothing() {
        let pool = pool(1, 256);
        let workers = Arc::new(workers(&pool, 2, IsolationPolicy::PerFiber));

        for round in 0..32u64 {
            let request = RequestId(round);
            let mut submits = Vec::new();
            for _ in 0..8 {
                let workers = Arc::clone(&workers);
                submits.push(tokio::spawn(async move {
                    workers
                        .submit(request, DeviceId(0), |r| r.acquire(1).map(|_| ()))
                        .await
                }));
            }
            let cancel = {
                let workers = Arc::clone(&workers);
                tokio::spawn(async move { workers.finish(request, RequestOutcome::Cancelled).await })
            };

            for submit in submits {
                submit.await.unwrap().unwrap();
            }
            cancel.await.unwrap().unwrap();

            // Submits queued after the cancel opened a new lifecycle; it must
            // still be reachable by finish.
            workers.finish(request, RequestOutcome::Cancelled).await.unwrap();
            assert_eq!(pool.free_count(DeviceSelector::Any), 256);
        }
    }

    #[tokio::test]
    async fn exhaustion_reaches_the_caller() {
        let pool = pool(1, 4);
        let workers = workers(&pool, 1, IsolationPolicy::PerFiber);

        let err = workers
            .submit(RequestId(1), DeviceId(0), |r| r.acquire(5).map(|_| ()))
            .await
            .unwrap_err();
        match err {
            WorkerError::Pool(e) => assert!(e.is_retryable()),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(pool.free_count(DeviceSelector::Any), 4);
    }

    #[tokio::test]
    async fn panicking_job_releases_and_worker_survives() {
        let pool = pool(1, 8);
        let workers = workers(&pool, 1, IsolationPolicy::PerCall);

        let err = workers
            .submit(RequestId(1), DeviceId(0), |r| -> Result<(), PoolError> {
                r.acquire(3)?;
                panic!("kernel launch failed");
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WorkerError::JobPanicked {
                device: DeviceId(0),
                worker: 0
            }
        ));
        assert_eq!(pool.free_count(DeviceSelector::Any), 8);

        let held = workers
            .submit(RequestId(2), DeviceId(0), |r| Ok(r.acquire(2)?.len()))
            .await
            .unwrap();
        assert_eq!(held, 2);
    }

    #[tokio::test]
    async fn per_fiber_panic_fails_the_request() {
        let pool = pool(1, 8);
        let workers = workers(&pool, 1, IsolationPolicy::PerFiber);
        let request = RequestId(3);

        workers
            .submit(request, DeviceId(0), |r| r.acquire(2).map(|_| ()))
            .await
            .unwrap();
        let err = workers
            .submit(request, DeviceId(0), |_| -> Result<(), PoolError> { panic!("boom") })
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::JobPanicked { .. }));
        assert_eq!(pool.free_count(DeviceSelector::Any), 8);
        assert_eq!(workers.finish(request, RequestOutcome::Failed).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_device_is_rejected() {
        let pool = pool(1, 4);
        let workers = workers(&pool, 1, IsolationPolicy::PerCall);
        let err = workers
            .submit(RequestId(1), DeviceId(7), |_| Ok(()))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::UnknownDevice(DeviceId(7))));
    }

    #[tokio::test]
    async fn shutdown_releases_held_requests() {
        let pool = pool(1, 8);
        let mut workers = workers(&pool, 2, IsolationPolicy::PerFiber);

        for id in 0..2 {
            workers
                .submit(RequestId(id), DeviceId(0), |r| r.acquire(3).map(|_| ()))
                .await
                .unwrap();
        }
        assert_eq!(pool.free_count(DeviceSelector::Any), 2);

        workers.shutdown();
        assert_eq!(pool.free_count(DeviceSelector::Any), 8);

        let err = workers
            .submit(RequestId(9), DeviceId(0), |_| Ok(()))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::WorkerGone { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_never_share_pages() {
        let pool = pool(2, 64);
        let workers = Arc::new(workers(&pool, 4, IsolationPolicy::PerFiber));

        let mut tasks = Vec::new();
        for id in 0..16u64 {
            let workers = Arc::clone(&workers);
            tasks.push(tokio::spawn(async move {
                let device = DeviceId((id % 2) as u32);
                let mut pages = Vec::new();
                for _ in 0..3 {
                    let mut acquired = workers
                        .submit(RequestId(id), device, |r| r.acquire(2))
                        .await
                        .unwrap();
                    pages.append(&mut acquired);
                }
                pages
            }));
        }

        let mut all = Vec::new();
        for task in tasks {
            all.extend(task.await.unwrap());
        }
        let unique: std::collections::HashSet<_> = all.iter().map(|p| p.descriptor()).collect();
        assert_eq!(unique.len(), 96);
        assert_eq!(pool.free_count(DeviceSelector::Any), 128 - 96);

        for id in 0..16u64 {
            assert_eq!(workers.finish(RequestId(id), RequestOutcome::Completed).await.unwrap(), 6);
        }
        assert_eq!(pool.free_count(DeviceSelector::Any), 128);
    }
}
