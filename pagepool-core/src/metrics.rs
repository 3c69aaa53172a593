use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter, UpDownCounter},
};
use std::sync::OnceLock;

pub(crate) struct CoreMetrics {
    pub pages_in_use: UpDownCounter<i64>,
    pub capacity_pages: UpDownCounter<i64>,

    pub acquired_pages: Counter<u64>,
    pub released_pages: Counter<u64>,
    pub page_copies: Counter<u64>,
    pub copy_duration_us: Histogram<f64>,

    pub exhausted: Counter<u64>,
    pub invalid_handles: Counter<u64>,
    pub device_faults: Counter<u64>,

    pub worker_calls: Counter<u64>,
    pub worker_panics: Counter<u64>,
}

fn init_meter() -> Meter {
    global::meter("pagepool-core")
}

pub(crate) fn core_metrics() -> &'static CoreMetrics {
    static METRICS: OnceLock<CoreMetrics> = OnceLock::new();
    METRICS.get_or_init(|| {
        let meter = init_meter();

        CoreMetrics {
            pages_in_use: meter
                .i64_up_down_counter("pagepool_pages_in_use")
                .with_unit("pages")
                .with_description("Pages currently issued across all pools and devices")
                .build(),
            capacity_pages: meter
                .i64_up_down_counter("pagepool_capacity_pages")
                .with_unit("pages")
                .with_description("Total pages backed by live pools")
                .build(),

            acquired_pages: meter
                .u64_counter("pagepool_acquired_pages_total")
                .with_description("Pages handed out by acquire_free_pages and copy_page")
                .build(),
            released_pages: meter
                .u64_counter("pagepool_released_pages_total")
                .with_description("Pages returned to a free set")
                .build(),
            page_copies: meter
                .u64_counter("pagepool_page_copies_total")
                .with_description("Successful copy_page duplications")
                .build(),
            copy_duration_us: meter
                .f64_histogram("pagepool_copy_duration_us")
                .with_unit("us")
                .with_description("copy_page latency in microseconds, lock held")
                .build(),

            exhausted: meter
                .u64_counter("pagepool_exhausted_total")
                .with_description("Acquisitions rejected because too few pages were free")
                .build(),
            invalid_handles: meter
                .u64_counter("pagepool_invalid_handle_total")
                .with_description("Calls rejected for stale, released, or foreign page handles")
                .build(),
            device_faults: meter
                .u64_counter("pagepool_device_faults_total")
                .with_description("Device buffer operations that failed")
                .build(),

            worker_calls: meter
                .u64_counter("pagepool_worker_calls_total")
                .with_description("Jobs executed by request workers")
                .build(),
            worker_panics: meter
                .u64_counter("pagepool_worker_panics_total")
                .with_description("Jobs that panicked on a request worker")
                .build(),
        }
    })
}
