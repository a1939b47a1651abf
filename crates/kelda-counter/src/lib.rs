//! kelda-counter — named monotonic counters for observability.
//!
//! Each subsystem constructs a `Counter` once and bumps named counts as it
//! works. The process-global registry is snapshotted by the daemon's debug
//! endpoint. `EventTimer` brackets one reconcile pass with start/end logs.

use std::collections::BTreeMap;
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

type Registry = BTreeMap<&'static str, BTreeMap<String, u64>>;

fn registry() -> &'static Mutex<Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(BTreeMap::new()))
}

/// A handle for one subsystem's counters.
#[derive(Debug, Clone, Copy)]
pub struct Counter {
    subsystem: &'static str,
}

impl Counter {
    /// Register `subsystem` in the global registry.
    pub fn new(subsystem: &'static str) -> Counter {
        let mut reg = lock();
        reg.entry(subsystem).or_default();
        Counter { subsystem }
    }

    /// Increment the named count. Safe for concurrent callers.
    pub fn inc(&self, name: &str) {
        let mut reg = lock();
        *reg.entry(self.subsystem)
            .or_default()
            .entry(name.to_string())
            .or_insert(0) += 1;
    }

    /// The current value of the named count.
    pub fn get(&self, name: &str) -> u64 {
        let reg = lock();
        reg.get(self.subsystem)
            .and_then(|counts| counts.get(name))
            .copied()
            .unwrap_or(0)
    }
}

fn lock() -> std::sync::MutexGuard<'static, Registry> {
    match registry().lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A snapshot of every subsystem's counters, for the debug endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot(pub BTreeMap<&'static str, BTreeMap<String, u64>>);

/// Snapshot the whole registry.
pub fn dump() -> Snapshot {
    Snapshot(lock().clone())
}

/// Times one pass of a reconcile loop and counts completed passes.
pub struct EventTimer {
    name: &'static str,
    counter: Counter,
    started: Option<Instant>,
}

impl EventTimer {
    pub fn new(name: &'static str) -> EventTimer {
        EventTimer {
            name,
            counter: Counter::new(name),
            started: None,
        }
    }

    /// Mark the start of a pass.
    pub fn log_start(&mut self) {
        self.started = Some(Instant::now());
        debug!(loop_ = self.name, "start");
    }

    /// Mark the end of a pass, logging its duration.
    pub fn log_end(&mut self) {
        let elapsed = self.started.take().map(|s| s.elapsed());
        self.counter.inc("Run Loop");
        match elapsed {
            Some(d) => info!(loop_ = self.name, elapsed_ms = d.as_millis() as u64, "end"),
            None => info!(loop_ = self.name, "end"),
        }
    }
}
