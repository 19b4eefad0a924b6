//! MAC Timer API
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use std::sync::Arc;
use std::time::Instant;

/// Timer trait provides mechanisms for accessing monotonic times
/// to assist with procotol implementations.
///
/// All methods are monotonic and relative to the same unknown epoc
pub trait Timer {
    /// Returns the number of millisecond ticks since some unknown epoc
    fn ticks_ms(&self) -> u64;

    /// Returns the number of microsecond ticks since some unknown epoc
    fn ticks_us(&self) -> u64;
}

impl <T: Timer + ?Sized> Timer for Arc<T> {
    fn ticks_ms(&self) -> u64 {
        (**self).ticks_ms()
    }

    fn ticks_us(&self) -> u64 {
        (**self).ticks_us()
    }
}

/// Wall-clock timer backed by [`Instant`], ticks count from creation
#[derive(Clone, Debug)]
pub struct SystemTimer {
    start: Instant,
}

impl SystemTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now()
        }
    }
}

impl Default for SystemTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer for SystemTimer {
    fn ticks_ms(&self) -> u64 {
        Instant::now().duration_since(self.start).as_millis() as u64
    }

    fn ticks_us(&self) -> u64 {
        Instant::now().duration_since(self.start).as_micros() as u64
    }
}

#[cfg(any(test, feature="mocks"))]
pub mod mock {
    use std::sync::Arc;
    use parking_lot::Mutex;

    /// Mock timer implementation to assist with testing,
    /// clones share the same underlying time
    #[derive(Clone, Debug)]
    pub struct MockTimer (Arc<Mutex<u64>>);

    impl MockTimer {
        pub fn new() -> Self {
            Self(Arc::new(Mutex::new(0)))
        }

        pub fn set_ms(&self, val: u64) {
            *self.0.lock() = val * 1000;
        }

        /// Advance time by `ms` milliseconds
        pub fn advance_ms(&self, ms: u64) {
            *self.0.lock() += ms * 1000;
        }
    }

    impl Default for MockTimer {
        fn default() -> Self {
            Self::new()
        }
    }

    impl super::Timer for MockTimer {
        fn ticks_ms(&self) -> u64 {
            *self.0.lock() / 1000
        }

        fn ticks_us(&self) -> u64 {
            *self.0.lock()
        }
    }
}
