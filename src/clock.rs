//! Источник монотонного времени для меток событий очереди.

use crate::events::Timestamp;
use parking_lot::Mutex;
use std::time::Instant;

/// Monotonic timestamp source, seconds resolution as `f64`.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Часы на основе `Instant`, отсчёт от момента создания
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Timestamp {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Часы с ручным управлением для детерминированных проверок
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Timestamp>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, value: Timestamp) {
        *self.now.lock() = value;
    }

    pub fn advance(&self, delta: Timestamp) {
        *self.now.lock() += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.lock()
    }
}
