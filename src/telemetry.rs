//! Tracing subscriber setup for the `otel` feature.
//!
//! Enabled with CLIENTFORGE_TRACING=1. Events go to stderr through the fmt
//! layer, filtered by RUST_LOG (default "info").

use std::env;

use once_cell::sync::OnceCell;
use tracing_subscriber::prelude::*;

static INIT: OnceCell<()> = OnceCell::new();

/// Keeps the subscriber alive for the lifetime of `main`.
#[derive(Debug)]
pub struct TelemetryGuard {
    _private: (),
}

fn tracing_enabled_env() -> bool {
    env::var("CLIENTFORGE_TRACING").ok().as_deref() == Some("1")
}

fn filter_directive() -> String {
    env::var("RUST_LOG")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "info".to_string())
}

/// True once the fmt subscriber owns stderr output.
pub(crate) fn tracing_active() -> bool {
    INIT.get().is_some()
}

pub fn telemetry_init() -> Option<TelemetryGuard> {
    if INIT.get().is_some() || !tracing_enabled_env() {
        return None;
    }

    let env_filter = tracing_subscriber::EnvFilter::new(filter_directive());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);
    let registry = tracing_subscriber::registry().with(env_filter).with(fmt_layer);

    if registry.try_init().is_err() {
        eprintln!("clientforge: tracing init skipped (global subscriber already set)");
        return None;
    }
    let _ = INIT.set(());
    Some(TelemetryGuard { _private: () })
}
