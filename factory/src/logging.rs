//! Operator-facing tracing for factory runs.
//!
//! - **Tracing (this module)**: progress and diagnostics via `RUST_LOG`,
//!   written to stderr. Stdout is reserved for the final run status.
//! - **Run artifacts (`io/run_dir`)**: prompts, logs, iteration records and
//!   `result.json` under `.factory/runs/<run-id>/`. Always written, unaffected
//!   by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter when `RUST_LOG` is unset: progress from this crate, warnings elsewhere.
pub const DEFAULT_FILTER: &str = "factory=info,warn";

/// Initialize the tracing subscriber.
///
/// ```bash
/// RUST_LOG=factory=debug factory run task.md
/// ```
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
