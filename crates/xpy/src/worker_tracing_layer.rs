//! Tracing layer for child-process workers.
//!
//! Ships events to the controller as `worker_log` frames, preserving target and level.

use tokio::sync::mpsc;
use tracing::{Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::bridge::protocol::ToController;

/// Encoding a shipped event must not emit another shipped event.
const CODEC_TARGET: &str = "xpy::bridge::codec";

pub struct WorkerTracingLayer {
    tx: mpsc::Sender<ToController>,
}

impl WorkerTracingLayer {
    pub fn new(tx: mpsc::Sender<ToController>) -> Self {
        Self { tx }
    }

    fn level_to_string(level: &Level) -> &'static str {
        match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        }
    }
}

impl<S> Layer<S> for WorkerTracingLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let target = metadata.target();
        if target.starts_with(CODEC_TARGET) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        // Full channel: drop the event rather than block the worker thread.
        let _ = self.tx.try_send(ToController::WorkerLog {
            target: target.to_string(),
            level: Self::level_to_string(metadata.level()).to_string(),
            message: visitor.finish(),
        });
    }
}

/// Collects the message plus any structured fields as `key=value` pairs.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            return self.message;
        }
        let fields = self.fields.join(" ");
        if self.message.is_empty() {
            fields
        } else {
            format!("{} {}", self.message, fields)
        }
    }
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }
}

#[cfg(test)]
mod tests {
    use tracing_subscriber::layer::SubscriberExt;

    use super::*;

    #[test]
    fn ships_events_with_target_level_and_fields() {
        let (tx, mut rx) = mpsc::channel(8);
        let subscriber = tracing_subscriber::registry().with(WorkerTracingLayer::new(tx));

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(target: "xpy::worker", id = 3, "Dropping nested-call reply");
            tracing::info!(target: "xpy::bridge::codec", "Encoding frame");
        });

        assert_eq!(
            rx.try_recv().unwrap(),
            ToController::WorkerLog {
                target: "xpy::worker".to_string(),
                level: "warn".to_string(),
                message: "Dropping nested-call reply id=3".to_string(),
            }
        );
        assert!(rx.try_recv().is_err(), "codec events must not be shipped");
    }

    #[test]
    fn full_channel_drops_events() {
        let (tx, mut rx) = mpsc::channel(1);
        let subscriber = tracing_subscriber::registry().with(WorkerTracingLayer::new(tx));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("first");
            tracing::info!("second");
        });

        assert!(matches!(
            rx.try_recv().unwrap(),
            ToController::WorkerLog { message, .. } if message == "first"
        ));
        assert!(rx.try_recv().is_err());
    }
}
