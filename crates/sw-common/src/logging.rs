//! Logging setup for Spillway processes.
//!
//! Every component logs through `tracing` with structured fields rather than
//! formatted text. The fields operators filter on:
//!
//! - `service`: breaker owner, `amqp` for the publishing client
//! - `action`: breaker key such as `publish:orders` or `establish-connection`
//! - `queue`: target queue of a publish, dump or replay
//! - `id`: dump store record id
//! - `code` and `level`: last-error code and syslog severity
//!
//! `LOG_FORMAT=json` emits one flattened JSON object per event with file and
//! line, which keeps those fields queryable. Any other value gives compact
//! text. `RUST_LOG` filters as usual (default `info`), for example
//! `RUST_LOG=sw_dump=debug,sw_breaker=debug` to follow a replay pass.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber for `service_name`. The first call wins.
pub fn init_logging(service_name: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = if json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()
    } else {
        registry.with(fmt::layer().compact().with_target(true)).try_init()
    }
    .is_ok();

    if installed {
        tracing::debug!(service = %service_name, json, "Logging initialized");
    }
}
