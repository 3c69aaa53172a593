//! Stdout logging for binaries and benches.
//!
//! The library itself only uses the `log` facade. Worker threads attach
//! `device_id` and `worker` through `ThreadLocalDiagnostic`, which shows up
//! on every record they emit once this logger is installed.

use std::sync::Once;

use log::LevelFilter;
use logforth::append::Stdout;
use logforth::diagnostic::ThreadLocalDiagnostic;

/// Install a stdout logger at `level` ("error", "warn", "info", "debug",
/// "trace"). Unparseable levels fall back to `info`. Only the first call
/// takes effect.
pub fn init_stdout(level: &str) {
    static INIT: Once = Once::new();

    let filter = level.parse::<LevelFilter>().unwrap_or(LevelFilter::Info);
    INIT.call_once(|| {
        logforth::builder()
            .dispatch(|d| {
                d.filter(filter)
                    .diagnostic(ThreadLocalDiagnostic::default())
                    .append(Stdout::default())
            })
            .apply();
    });
}
