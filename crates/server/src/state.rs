//! Application state

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::ServerConfig;
use crate::registry::ConnectionRegistry;

/// Shared application state
pub struct AppState {
    pub registry: ConnectionRegistry,
    pub config: ServerConfig,
    pub clock: MonotonicClock,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            config,
            clock: MonotonicClock::default(),
        }
    }
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Wall-clock millis that never repeat or go backwards, used to stamp
/// frames relayed to UI connections.
#[derive(Default)]
pub struct MonotonicClock {
    last: AtomicU64,
}

impl MonotonicClock {
    pub fn next(&self) -> u64 {
        self.next_after(unix_millis())
    }

    fn next_after(&self, now: u64) -> u64 {
        let mut current = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(current + 1);
            match self.last.compare_exchange_weak(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(actual) => current = actual,
            }
        }
    }
}
