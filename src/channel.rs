//! Physical channel interface
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use std::time::Duration;

use crate::{Ts, timer::Timer};

/// Shared broadcast channel consumed by the MAC.
///
/// The channel has no notion of addresses, every intact transmission is
/// delivered to every other attached station. Collision detection and
/// airtime modelling are the channel's concern and not visible here.
pub trait Channel: Timer + Send + Sync {
    /// Broadcast `data`, blocking for the duration of the transmission.
    /// Returns the number of bytes put on air.
    fn transmit(&self, data: &[u8]) -> usize;

    /// Block until a transmission is heard and return its contents
    fn receive(&self) -> Vec<u8>;

    /// Wait up to `timeout` for a transmission
    fn receive_timeout(&self, timeout: Duration) -> Option<Vec<u8>>;

    /// Carrier sense, true while any station is transmitting
    fn in_use(&self) -> bool;

    /// Milliseconds since the channel was last in use (0 while in use)
    fn idle_time(&self) -> Ts;

    /// Channel clock in milliseconds, not synchronised between stations
    fn clock(&self) -> Ts {
        self.ticks_ms()
    }
}

#[cfg(any(test, feature="mocks"))]
pub mod mock {
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use parking_lot::{Condvar, Mutex};

    use crate::{Ts, timer::Timer};
    use super::Channel;

    type DropFilter = Box<dyn Fn(usize, &[u8]) -> bool + Send + Sync>;

    struct Station {
        id: usize,
        rx: Mutex<VecDeque<Vec<u8>>>,
        ready: Condvar,
    }

    impl Station {
        fn deliver(&self, data: &[u8]) {
            self.rx.lock().push_back(data.to_vec());
            self.ready.notify_one();
        }
    }

    struct Inner<T> {
        timer: T,
        ms_per_byte: u64,
        stations: Mutex<Vec<Arc<Station>>>,
        busy_until: Mutex<Ts>,
        last_use: Mutex<Ts>,
        forced_busy: AtomicBool,
        filter: Mutex<Option<DropFilter>>,
        log: Mutex<Vec<(usize, Vec<u8>)>>,
    }

    /// In-memory broadcast medium shared by any number of [`MockChannel`]s
    #[derive(Clone)]
    pub struct MockMedium<T> {
        inner: Arc<Inner<T>>,
    }

    impl <T: Timer + Send + Sync> MockMedium<T> {
        /// Create a medium with instantaneous transmissions
        pub fn new(timer: T) -> Self {
            Self::with_airtime(timer, 0)
        }

        /// Create a medium where each transmitted byte occupies the channel for `ms_per_byte`
        pub fn with_airtime(timer: T, ms_per_byte: u64) -> Self {
            Self {
                inner: Arc::new(Inner {
                    timer,
                    ms_per_byte,
                    stations: Mutex::new(Vec::new()),
                    busy_until: Mutex::new(0),
                    last_use: Mutex::new(0),
                    forced_busy: AtomicBool::new(false),
                    filter: Mutex::new(None),
                    log: Mutex::new(Vec::new()),
                }),
            }
        }

        /// Attach a new station to the medium
        pub fn attach(&self) -> MockChannel<T> {
            let mut stations = self.inner.stations.lock();
            let station = Arc::new(Station {
                id: stations.len(),
                rx: Mutex::new(VecDeque::new()),
                ready: Condvar::new(),
            });
            stations.push(station.clone());

            MockChannel {
                medium: self.inner.clone(),
                station,
            }
        }

        /// Force carrier sense to report a busy channel
        pub fn set_busy(&self, busy: bool) {
            self.inner.forced_busy.store(busy, Ordering::SeqCst);
        }

        /// Lose transmissions for which `f(sender_id, bytes)` returns true
        pub fn drop_if<F>(&self, f: F)
        where
            F: Fn(usize, &[u8]) -> bool + Send + Sync + 'static,
        {
            *self.inner.filter.lock() = Some(Box::new(f));
        }

        /// Every transmission put on air so far, with the sending station id
        pub fn transmissions(&self) -> Vec<(usize, Vec<u8>)> {
            self.inner.log.lock().clone()
        }
    }

    /// Station endpoint on a [`MockMedium`]
    #[derive(Clone)]
    pub struct MockChannel<T> {
        medium: Arc<Inner<T>>,
        station: Arc<Station>,
    }

    impl <T> MockChannel<T> {
        pub fn id(&self) -> usize {
            self.station.id
        }

        /// Queue bytes as if they had been heard on the medium
        pub fn inject(&self, data: &[u8]) {
            self.station.deliver(data);
        }

        /// Number of received transmissions not yet consumed
        pub fn pending(&self) -> usize {
            self.station.rx.lock().len()
        }
    }

    impl <T: Timer> Timer for MockChannel<T> {
        fn ticks_ms(&self) -> u64 {
            self.medium.timer.ticks_ms()
        }

        fn ticks_us(&self) -> u64 {
            self.medium.timer.ticks_us()
        }
    }

    impl <T: Timer + Send + Sync> Channel for MockChannel<T> {
        fn transmit(&self, data: &[u8]) -> usize {
            let now = self.medium.timer.ticks_ms();
            let airtime = data.len() as u64 * self.medium.ms_per_byte;

            self.medium.log.lock().push((self.station.id, data.to_vec()));
            *self.medium.busy_until.lock() = now + airtime;

            if airtime > 0 {
                std::thread::sleep(Duration::from_millis(airtime));
            }
            *self.medium.last_use.lock() = self.medium.timer.ticks_ms();

            let lost = match self.medium.filter.lock().as_ref() {
                Some(f) => f(self.station.id, data),
                None => false,
            };
            if lost {
                return data.len();
            }

            let stations = self.medium.stations.lock().clone();
            for s in stations.iter().filter(|s| s.id != self.station.id) {
                s.deliver(data);
            }

            data.len()
        }

        fn receive(&self) -> Vec<u8> {
            let mut rx = self.station.rx.lock();
            loop {
                if let Some(data) = rx.pop_front() {
                    return data;
                }
                self.station.ready.wait(&mut rx);
            }
        }

        fn receive_timeout(&self, timeout: Duration) -> Option<Vec<u8>> {
            let mut rx = self.station.rx.lock();
            if rx.is_empty() {
                let _ = self.station.ready.wait_for(&mut rx, timeout);
            }
            rx.pop_front()
        }

        fn in_use(&self) -> bool {
            self.medium.forced_busy.load(Ordering::SeqCst)
                || self.medium.timer.ticks_ms() < *self.medium.busy_until.lock()
        }

        fn idle_time(&self) -> Ts {
            if self.in_use() {
                return 0;
            }
            self.medium.timer.ticks_ms().saturating_sub(*self.medium.last_use.lock())
        }
    }
}
