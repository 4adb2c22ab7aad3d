//! Tracing subscriber setup for controller and worker processes.
//!
//! `RUST_LOG` wins when set. Otherwise `XPY_LOG` picks the level for the `xpy`
//! targets (default `info`). `LOG_FORMAT=json` switches to JSON lines. Output
//! goes to stderr so stdout stays free for frames.

use tokio::sync::mpsc;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::bridge::protocol::ToController;
use crate::worker_tracing_layer::WorkerTracingLayer;

fn env_filter() -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    let level = match std::env::var("XPY_LOG").as_deref() {
        Ok("trace") => "trace",
        Ok("debug") => "debug",
        Ok("warn") | Ok("warning") => "warn",
        Ok("error") => "error",
        _ => "info",
    };
    EnvFilter::new(format!(
        "xpy={level},xpy_calc={level},xpy::bridge::codec=off"
    ))
}

/// Install the global subscriber. A second call is a no-op.
pub fn init_tracing() {
    let filter = env_filter();
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

/// Install a subscriber that ships events to the controller instead of printing them.
pub fn init_worker_tracing(tx: mpsc::Sender<ToController>) {
    let subscriber = tracing_subscriber::registry()
        .with(env_filter())
        .with(WorkerTracingLayer::new(tx));
    let _ = subscriber.try_init();
}
