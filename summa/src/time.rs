//! Clock handle threaded through the engine.
//!
//! Hold expiries, idempotency TTLs, worker leases and daily limit windows
//! all read time through this handle instead of the system clock, so the
//! `mock-time` feature can drive them deterministically in tests.

use jiff::Timestamp;
#[cfg(feature = "mock-time")]
use std::sync::{Arc, Mutex};

/// Where the engine reads the current time from.
#[derive(Clone, Default)]
pub enum TimeSource {
    #[default]
    System,
    /// A settable clock shared by everyone holding this handle.
    #[cfg(feature = "mock-time")]
    Mock(Arc<Mutex<Timestamp>>),
}

impl TimeSource {
    pub fn system() -> Self {
        Self::System
    }

    #[cfg(feature = "mock-time")]
    pub fn mock(initial_time: Timestamp) -> Self {
        Self::Mock(Arc::new(Mutex::new(initial_time)))
    }

    pub fn now(&self) -> Timestamp {
        match self {
            Self::System => Timestamp::now(),
            #[cfg(feature = "mock-time")]
            Self::Mock(time) => *time.lock().unwrap(),
        }
    }

    /// Move a mock clock forward. No-op on the system clock.
    #[cfg(feature = "mock-time")]
    pub fn advance(&self, duration: jiff::Span) {
        if let Self::Mock(time) = self {
            let mut time = time.lock().unwrap();
            *time = time
                .checked_add(duration)
                .expect("mock clock out of range");
        }
    }

    /// Pin a mock clock to an instant. No-op on the system clock.
    #[cfg(feature = "mock-time")]
    pub fn set(&self, timestamp: Timestamp) {
        if let Self::Mock(time) = self {
            *time.lock().unwrap() = timestamp;
        }
    }
}
