//! Station clock and contention policy state
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

//! [`Clock`] is shared by the facade and both engines. Every accessor takes
//! the internal lock for the duration of a single read or update, and no
//! I/O is ever performed while it is held.

use core::fmt;

use parking_lot::Mutex;
use rand_core::{OsRng, RngCore};

use crate::{Ts, timer::Timer, mac::config::MacConfig, status::{SlotSelection, Status}};

#[derive(Debug, Clone, PartialEq)]
struct ClockState {
    /// Added to channel time, only ever grows
    offset: Ts,

    beacons_enabled: bool,
    beacon_interval_ms: u64,
    /// Channel time of the last beacon candidate
    last_beacon: Ts,

    collision_window: u32,
    backoff_count: u32,
    ack_wait_start: Ts,

    last_event: Status,
    debug: bool,
    slot_selection: SlotSelection,
}

/// Network time, backoff bookkeeping and runtime policy for a station
pub struct Clock<T> {
    timer: T,

    difs_ms: u64,
    slot_boundary_ms: u64,
    ack_timeout_ms: u64,
    cw_initial: u32,
    cw_max: u32,

    state: Mutex<ClockState>,
}

/// Snapshot of the runtime settings, rendered for help and diagnostics
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub local_time: Ts,
    pub debug: bool,
    pub slot_selection: SlotSelection,
    pub beacons_enabled: bool,
    pub beacon_interval_ms: u64,
    pub collision_window: u32,
    pub backoff_count: u32,
    pub last_event: Status,
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Local time: {} ms", self.local_time)?;
        writeln!(f, "Debug on: {}", self.debug)?;
        writeln!(f, "Slot selection: {}", self.slot_selection)?;
        if self.beacons_enabled {
            writeln!(f, "Beacon interval: {} ms", self.beacon_interval_ms)?;
        } else {
            writeln!(f, "Beacons disabled")?;
        }
        writeln!(f, "Collision window: {}", self.collision_window)?;
        writeln!(f, "Backoff count: {}", self.backoff_count)?;
        write!(f, "Last event: {}", self.last_event)
    }
}

impl <T: Timer> Clock<T> {
    pub fn new(timer: T, config: &MacConfig) -> Self {
        let start = timer.ticks_ms();

        Self {
            timer,

            difs_ms: config.difs_ms(),
            slot_boundary_ms: config.slot_boundary_ms,
            ack_timeout_ms: config.ack_timeout_ms,
            cw_initial: config.cw_initial,
            cw_max: config.cw_max,

            state: Mutex::new(ClockState {
                offset: 0,
                beacons_enabled: config.beacons_enabled,
                beacon_interval_ms: config.beacon_interval_ms,
                last_beacon: start,
                collision_window: config.cw_initial,
                backoff_count: 0,
                ack_wait_start: start,
                last_event: Status::Success,
                debug: config.debug,
                slot_selection: match config.fixed_slot_selection {
                    true => SlotSelection::Fixed,
                    false => SlotSelection::Random,
                },
            }),
        }
    }

    /// Synchronised network time (channel time plus offset), saturating at `Ts::MAX`
    pub fn now(&self) -> Ts {
        let s = self.state.lock();
        self.timer.ticks_ms().saturating_add(s.offset)
    }

    pub fn offset(&self) -> Ts {
        self.state.lock().offset
    }

    /// DIFS extended so the wait ends on the next slot boundary
    pub fn rounded_difs(&self) -> u64 {
        let now = self.now();
        self.difs_ms + (self.slot_boundary_ms - now % self.slot_boundary_ms)
    }

    /// Returns the local time to advertise if a beacon is due.
    ///
    /// The beacon timestamp is recorded whenever a time is returned, so at
    /// most one candidate is produced per interval whether or not it is sent.
    pub fn beacon_due(&self) -> Option<Ts> {
        let mut s = self.state.lock();
        let now = self.timer.ticks_ms();

        if !s.beacons_enabled || now.saturating_sub(s.last_beacon) < s.beacon_interval_ms {
            return None;
        }

        s.last_beacon = now;
        Some(now.saturating_add(s.offset))
    }

    /// Slave to a remote timestamp if it is ahead of local time.
    /// Returns true if the offset was advanced.
    pub fn absorb_beacon(&self, remote: Ts) -> bool {
        let mut s = self.state.lock();
        let local = self.timer.ticks_ms().saturating_add(s.offset);

        if remote <= local {
            return false;
        }

        s.offset = s.offset.saturating_add(remote - local);
        true
    }

    pub fn start_ack_timer(&self) {
        let now = self.timer.ticks_ms();
        self.state.lock().ack_wait_start = now;
    }

    pub fn ack_timed_out(&self) -> bool {
        let now = self.timer.ticks_ms();
        now.saturating_sub(self.state.lock().ack_wait_start) >= self.ack_timeout_ms
    }

    /// Double the collision window (capped) and draw a new backoff count.
    /// Returns the new `(window, backoff)`.
    pub fn escalate_backoff(&self) -> (u32, u32) {
        let mut s = self.state.lock();

        s.collision_window = (s.collision_window.saturating_mul(2)).min(self.cw_max);
        s.backoff_count = match s.slot_selection {
            SlotSelection::Fixed => s.collision_window,
            SlotSelection::Random => OsRng.next_u32() % (s.collision_window + 1),
        };

        (s.collision_window, s.backoff_count)
    }

    pub fn reset_collision_window(&self) {
        self.state.lock().collision_window = self.cw_initial;
    }

    pub fn collision_window(&self) -> u32 {
        self.state.lock().collision_window
    }

    pub fn set_collision_window(&self, window: u32) {
        self.state.lock().collision_window = window;
    }

    pub fn backoff_count(&self) -> u32 {
        self.state.lock().backoff_count
    }

    pub fn set_backoff_count(&self, count: u32) {
        self.state.lock().backoff_count = count;
    }

    /// Consume one backoff slot, returning the remaining count
    pub fn decrement_backoff(&self) -> u32 {
        let mut s = self.state.lock();
        s.backoff_count = s.backoff_count.saturating_sub(1);
        s.backoff_count
    }

    pub fn last_event(&self) -> Status {
        self.state.lock().last_event
    }

    pub fn set_last_event(&self, status: Status) {
        self.state.lock().last_event = status;
    }

    pub fn debug(&self) -> bool {
        self.state.lock().debug
    }

    pub fn set_debug(&self, debug: bool) {
        self.state.lock().debug = debug;
    }

    pub fn slot_selection(&self) -> SlotSelection {
        self.state.lock().slot_selection
    }

    pub fn set_slot_selection(&self, selection: SlotSelection) {
        self.state.lock().slot_selection = selection;
    }

    pub fn beacons_enabled(&self) -> bool {
        self.state.lock().beacons_enabled
    }

    pub fn beacon_interval_ms(&self) -> u64 {
        self.state.lock().beacon_interval_ms
    }

    /// Set the beacon interval, `None` disables beacons
    pub fn set_beacon_interval(&self, interval_ms: Option<u64>) {
        let mut s = self.state.lock();
        match interval_ms {
            Some(i) => {
                s.beacon_interval_ms = i;
                s.beacons_enabled = true;
            },
            None => s.beacons_enabled = false,
        }
    }

    pub fn settings(&self) -> Settings {
        let s = self.state.lock();

        Settings {
            local_time: self.timer.ticks_ms().saturating_add(s.offset),
            debug: s.debug,
            slot_selection: s.slot_selection,
            beacons_enabled: s.beacons_enabled,
            beacon_interval_ms: s.beacon_interval_ms,
            collision_window: s.collision_window,
            backoff_count: s.backoff_count,
            last_event: s.last_event,
        }
    }
}
