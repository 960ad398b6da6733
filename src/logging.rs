//! Tracing initialisation.
//!
//! Log output goes to stderr so that `--json` command output on stdout stays
//! machine-readable. The filter is read from `KBA_LOG` (same syntax as
//! `RUST_LOG`, e.g. `kb_assist=debug,reqwest=warn`) and defaults to `info`.
//! Setting `KBA_LOG_FORMAT=json` switches to structured JSON lines.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Initialize the global tracing subscriber.
///
/// Idempotent: later calls are no-ops, which keeps tests that share a
/// process from fighting over the global dispatcher.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env("KBA_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
        let json = std::env::var("KBA_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr);

        let result = if json {
            builder.json().try_init()
        } else {
            builder.try_init()
        };
        if let Err(e) = result {
            eprintln!("tracing already initialised: {}", e);
        }
    });
}
