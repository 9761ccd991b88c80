//! Tracing setup for host and worker processes.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Filter used when `RUST_LOG` is unset, from `REMOTEHOST_LOG`.
fn default_filter() -> EnvFilter {
    let base_level = match std::env::var("REMOTEHOST_LOG").as_deref() {
        Ok("trace") => "trace",
        Ok("debug") => "debug",
        Ok("warn") | Ok("warning") => "warn",
        Ok("error") => "error",
        _ => "info",
    };

    EnvFilter::new(format!(
        "remotehost={level},remotehost_demo_worker={level},remotehost::bridge::codec=off",
        level = base_level
    ))
}

/// Install a global subscriber writing to stderr.
///
/// `RUST_LOG` takes precedence over `REMOTEHOST_LOG`; `LOG_FORMAT=json` switches to JSON lines.
/// A subscriber that is already installed is left in place.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        default_filter()
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}
