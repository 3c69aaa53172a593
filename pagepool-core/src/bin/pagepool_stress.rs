//! Page pool stress driver.
//!
//! Simulates concurrent generation requests against a host-memory page pool:
//! every request grows its sequence one page per step, forks a page with
//! `copy_page` every few steps and is then completed or cancelled. At the end
//! the pool must be back to all pages free.
//!
//! Usage:
//!   cargo run --release --bin pagepool_stress -- --isolation per_call --requests 256

use std::{
    error::Error,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use bytesize::ByteSize;
use clap::Parser;
use log::{error, info, warn};
use pagepool_core::utils::parse_memory_size;
use pagepool_core::{
    DType, Device, DeviceId, DeviceSelector, HostDevice, IsolationPolicy, PagePool, PagePoolConfig,
    PoolError, RequestId, RequestOutcome, RequestWorkerPool, Reservation, WorkerError, WorkerPoolConfig,
    logging,
};

#[derive(Parser, Debug)]
#[command(name = "pagepool_stress", about = "Concurrent request simulation against a page pool")]
struct Cli {
    /// Number of host devices to simulate
    #[arg(long, default_value_t = 2)]
    devices: u32,

    /// Pages per device (ignored when --budget is set)
    #[arg(long, default_value_t = 256)]
    alloc_page_count: usize,

    /// Per-device memory budget, e.g. 24gb or 512MiB; overrides --alloc-page-count
    #[arg(long, value_parser = parse_memory_size)]
    budget: Option<ByteSize>,

    /// Element type of the page buffers (float16, bfloat16, float32, ...)
    #[arg(long, default_value = "float16")]
    dtype: DType,

    /// Elements per page
    #[arg(long, default_value_t = 4096)]
    block_elements: usize,

    /// Isolation policy: per_fiber or per_call
    #[arg(long, default_value = "per_fiber")]
    isolation: IsolationPolicy,

    /// Workers per device
    #[arg(long, default_value_t = 2)]
    fibers_per_device: usize,

    /// Concurrent requests to simulate
    #[arg(long, default_value_t = 32)]
    requests: u64,

    /// Steps (one new page each) per request
    #[arg(long, default_value_t = 16)]
    steps: usize,

    /// Fork the newest page with copy_page every N steps (0 disables)
    #[arg(long, default_value_t = 4)]
    fork_every: usize,

    /// Cancel every Nth request halfway through (0 disables)
    #[arg(long, default_value_t = 8)]
    cancel_every: u64,

    /// Retries of a step that hit an exhausted pool before the request fails
    #[arg(long, default_value_t = 50)]
    max_retries: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Default)]
struct Stats {
    calls: AtomicU64,
    retries: AtomicU64,
    forks: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicU64,
    failed: AtomicU64,
}

fn build_pool(cli: &Cli) -> Result<Arc<PagePool>, Box<dyn Error>> {
    let config = match cli.budget {
        Some(budget) => PagePoolConfig::from_budget(budget.as_u64(), cli.dtype, cli.block_elements)?,
        None => PagePoolConfig::new(cli.alloc_page_count, cli.dtype, cli.block_elements)?,
    };
    let devices: Vec<Arc<dyn Device>> = (0..cli.devices)
        .map(|id| Arc::new(HostDevice::new(id)) as Arc<dyn Device>)
        .collect();

    info!(
        "Creating page pool: devices={} pages_per_device={} page_size={} per_device={}",
        cli.devices,
        config.alloc_page_count(),
        ByteSize(config.page_size_bytes() as u64),
        ByteSize(config.total_bytes())
    );
    Ok(Arc::new(PagePool::new(config, devices)?))
}

/// One simulated inference step, executed on a worker.
///
/// Per-fiber requests keep their pages across steps, so each step adds one
/// page. Per-call steps start empty and must hold the whole sequence
/// (`held + 1` pages) for the duration of the call.
fn step(
    isolation: IsolationPolicy,
    held: usize,
    fork: bool,
) -> impl FnOnce(&mut Reservation) -> Result<bool, PoolError> + Send + 'static {
    move |reservation| {
        let needed = match isolation {
            IsolationPolicy::PerFiber => 1,
            IsolationPolicy::PerCall => held + 1,
        };
        let pages = reservation.acquire(needed)?;
        let newest = &pages[pages.len() - 1];
        let token = (held as u8).to_le_bytes();
        reservation.pool().write_page(newest, 0, &token)?;
        if fork {
            let forked = reservation.copy_page(newest)?;
            if reservation.pool().read_page(&forked)?[..token.len()] != token {
                return Err(PoolError::InvalidArgument(format!("fork of {newest} lost its content")));
            }
        }
        Ok(fork)
    }
}

async fn run_request(
    workers: Arc<RequestWorkerPool>,
    cli: Arc<Cli>,
    stats: Arc<Stats>,
    id: u64,
) -> Result<(), WorkerError> {
    let request = RequestId(id);
    let device = DeviceId((id % cli.devices as u64) as u32);
    let cancel_at = (cli.cancel_every > 0 && id % cli.cancel_every == 0).then_some(cli.steps / 2);

    for held in 0..cli.steps {
        if cancel_at == Some(held) {
            workers.finish(request, RequestOutcome::Cancelled).await?;
            stats.cancelled.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let fork = cli.fork_every > 0 && held % cli.fork_every == cli.fork_every - 1;
        let mut attempt = 0;
        loop {
            stats.calls.fetch_add(1, Ordering::Relaxed);
            match workers.submit(request, device, step(cli.isolation, held, fork)).await {
                Ok(forked) => {
                    if forked {
                        stats.forks.fetch_add(1, Ordering::Relaxed);
                    }
                    break;
                }
                Err(WorkerError::Pool(e)) if e.is_retryable() && attempt < cli.max_retries => {
                    attempt += 1;
                    stats.retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                Err(e) => {
                    workers.finish(request, RequestOutcome::Failed).await?;
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    warn!("Request failed: request={} step={} error={}", request, held, e);
                    return Ok(());
                }
            }
        }
    }

    workers.finish(request, RequestOutcome::Completed).await?;
    stats.completed.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Arc::new(Cli::parse());
    logging::init_stdout(&cli.log_level);

    let pool = build_pool(&cli)?;
    let workers = Arc::new(RequestWorkerPool::spawn(
        Arc::clone(&pool),
        WorkerPoolConfig {
            fibers_per_device: cli.fibers_per_device,
            isolation: cli.isolation,
        },
    )?);
    let stats = Arc::new(Stats::default());

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;

    let started = Instant::now();
    runtime.block_on(async {
        let mut tasks = Vec::with_capacity(cli.requests as usize);
        for id in 0..cli.requests {
            tasks.push(tokio::spawn(run_request(
                Arc::clone(&workers),
                Arc::clone(&cli),
                Arc::clone(&stats),
                id,
            )));
        }
        for task in tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Request driver error: {}", e),
                Err(e) => error!("Request task panicked: {}", e),
            }
        }
    });
    let elapsed = started.elapsed();
    drop(workers);

    info!(
        "Stress run finished: isolation={} elapsed={:?} calls={} retries={} forks={} completed={} cancelled={} failed={}",
        cli.isolation,
        elapsed,
        stats.calls.load(Ordering::Relaxed),
        stats.retries.load(Ordering::Relaxed),
        stats.forks.load(Ordering::Relaxed),
        stats.completed.load(Ordering::Relaxed),
        stats.cancelled.load(Ordering::Relaxed),
        stats.failed.load(Ordering::Relaxed),
    );

    let leaked = pool.allocated_count(DeviceSelector::Any);
    if leaked > 0 {
        return Err(format!("{leaked} pages still allocated after all requests finished").into());
    }
    info!("All {} pages returned to the pool", pool.page_count(DeviceSelector::Any));
    Ok(())
}
