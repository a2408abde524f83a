//! Per-target circuit breaker.
//!
//! State is a map from target name to the instant (ms since epoch) until
//! which the circuit stays open. A missing entry means closed. Failures only
//! ever push the deadline out; a success clears it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Time source, injectable so tests can drive the breaker deterministically.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

pub struct CircuitBreaker {
    clock: Arc<dyn Clock>,
    open_until: Mutex<HashMap<String, u64>>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let open = self.entries().len();
        f.debug_struct("CircuitBreaker")
            .field("tracked", &open)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            open_until: Mutex::new(HashMap::new()),
        }
    }

    /// Every update is a single insert or remove, so a poisoned map is
    /// still consistent and is used as is.
    fn entries(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.open_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_open(&self, name: &str) -> bool {
        let now = self.clock.now_ms();
        self.open_until(name).map(|until| until > now).unwrap_or(false)
    }

    /// Stored open-until instant, if any.
    pub fn open_until(&self, name: &str) -> Option<u64> {
        self.entries().get(name).copied()
    }

    /// Open the circuit for `cooldown_ms`. Non-positive cooldowns are a no-op.
    pub fn mark_failure(&self, name: &str, cooldown_ms: i64) {
        if cooldown_ms <= 0 {
            return;
        }
        let until = self.clock.now_ms().saturating_add(cooldown_ms as u64);
        let recorded = {
            let mut map = self.entries();
            let entry = map.entry(name.to_string()).or_insert(until);
            if *entry < until {
                *entry = until;
            }
            *entry
        };
        tracing::warn!(upstream = name, cooldown_ms, open_until = recorded, "Circuit opened");
    }

    pub fn mark_success(&self, name: &str) {
        if self.entries().remove(name).is_some() {
            tracing::debug!(upstream = name, "Circuit closed");
        }
    }
}
