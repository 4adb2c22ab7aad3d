//! Cooperative interrupt flag shared between controller and worker.
//!
//! One byte for the lifetime of a worker. The controller stores
//! [`INTERRUPT_REQUESTED`]; the engine polls it at its own checkpoints and
//! raises a cancellation; the worker dispatcher resets it to [`IDLE`] before
//! each top-level command so a stale request never reaches a later run.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

pub const IDLE: u8 = 0;
pub const INTERRUPT_REQUESTED: u8 = 2;

#[derive(Debug, Clone, Default)]
pub struct InterruptSignal {
    flag: Arc<AtomicU8>,
}

impl InterruptSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.flag.store(INTERRUPT_REQUESTED, Ordering::Release);
    }

    pub fn clear(&self) {
        self.flag.store(IDLE, Ordering::Release);
    }

    /// Raw flag value. Values other than 0 and 2 are left to the engine.
    pub fn load(&self) -> u8 {
        self.flag.load(Ordering::Acquire)
    }

    pub fn is_requested(&self) -> bool {
        self.load() == INTERRUPT_REQUESTED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_idle() {
        let signal = InterruptSignal::new();
        assert_eq!(signal.load(), IDLE);
        assert!(!signal.is_requested());
    }

    #[test]
    fn clones_share_the_flag() {
        let controller = InterruptSignal::new();
        let worker = controller.clone();

        controller.request();
        assert!(worker.is_requested());
        assert_eq!(worker.load(), INTERRUPT_REQUESTED);

        worker.clear();
        assert!(!controller.is_requested());
    }

    #[test]
    fn observed_across_threads() {
        let signal = InterruptSignal::new();
        let remote = signal.clone();
        let poller = std::thread::spawn(move || {
            while !remote.is_requested() {
                std::thread::yield_now();
            }
        });
        signal.request();
        poller.join().unwrap();
    }
}
