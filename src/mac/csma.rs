//! CSMA/CA transmit engine
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, trace, info, warn};

use crate::{Address, Ts};
use crate::channel::Channel;
use crate::clock::Clock;
use crate::frame::Frame;
use crate::queue::OutboundQueue;
use crate::status::Status;
use crate::timer::Timer;

use super::config::MacConfig;

/// Transmit engine states
#[derive(Debug, Clone, PartialEq)]
pub enum CsmaState {
    /// Checking for beacons, ACKs and queued frames
    Idle,
    /// Channel busy, contention restarts with DIFS once it clears
    WaitIdle,
    /// Waiting out DIFS until the deadline, then backoff or transmit
    Difs { until: Ts, backoff: bool },
    /// Counting down backoff slots, the current slot ends at the deadline
    Backoff { until: Ts },
    /// Head of the data queue ready to go on air
    Transmit,
    /// Unicast DATA on air, waiting for its ACK
    AwaitAck,
    /// ACK waiting for an idle channel
    AckIdle { ack: Frame },
    /// ACK waiting out SIFS until the deadline
    Sifs { ack: Frame, until: Ts },
}

/// Transmit side of a station, owns the contention state machine
pub struct CsmaSender<C: Channel> {
    address: Address,
    config: MacConfig,

    channel: Arc<C>,
    clock: Arc<Clock<Arc<C>>>,
    outbound: Arc<OutboundQueue>,

    pub(crate) state: CsmaState,
    /// Unicast DATA awaiting acknowledgement
    in_flight: bool,
}

impl <C: Channel> CsmaSender<C> {
    pub fn new(address: Address, channel: Arc<C>, clock: Arc<Clock<Arc<C>>>, outbound: Arc<OutboundQueue>, config: MacConfig) -> Self {
        Self {
            address,
            config,
            channel,
            clock,
            outbound,
            state: CsmaState::Idle,
            in_flight: false,
        }
    }

    pub fn state(&self) -> &CsmaState {
        &self.state
    }

    /// Run the engine until `running` is cleared
    pub fn run(&mut self, running: &AtomicBool) {
        debug!("Starting transmit engine for {}", self.address);

        while running.load(Ordering::SeqCst) {
            self.step();
            std::thread::sleep(Duration::from_millis(self.config.poll_ms));
        }

        debug!("Transmit engine for {} stopped", self.address);
    }

    /// Advance the state machine by one evaluation
    pub fn step(&mut self) {
        let now = self.channel.ticks_ms();

        trace!("TX tick at {} state: {:?}", now, self.state);

        let state = core::mem::replace(&mut self.state, CsmaState::Idle);

        self.state = match state {
            CsmaState::Idle => self.idle(now),
            CsmaState::WaitIdle => {
                if let Some(ack) = self.outbound.pop_ack() {
                    CsmaState::AckIdle { ack }
                } else if self.channel.in_use() {
                    CsmaState::WaitIdle
                } else {
                    self.start_difs(now, true)
                }
            },
            CsmaState::Difs { until, backoff } => {
                if self.channel.in_use() {
                    debug!("Channel busy during DIFS");
                    CsmaState::WaitIdle
                } else if now < until {
                    CsmaState::Difs { until, backoff }
                } else if backoff && self.clock.backoff_count() > 0 {
                    CsmaState::Backoff { until: now + self.config.slot_ms }
                } else {
                    CsmaState::Transmit
                }
            },
            CsmaState::Backoff { until } => {
                if self.channel.in_use() {
                    // Countdown pauses, the remaining count is kept
                    debug!("Channel busy during backoff, {} slots remaining", self.clock.backoff_count());
                    CsmaState::WaitIdle
                } else if now < until {
                    CsmaState::Backoff { until }
                } else {
                    match self.clock.decrement_backoff() {
                        0 => CsmaState::Transmit,
                        _ => CsmaState::Backoff { until: now + self.config.slot_ms },
                    }
                }
            },
            CsmaState::Transmit => self.transmit_head(),
            CsmaState::AwaitAck => self.await_ack(now),
            CsmaState::AckIdle { ack } => {
                if self.channel.in_use() {
                    CsmaState::AckIdle { ack }
                } else {
                    CsmaState::Sifs { ack, until: now + self.config.sifs_ms }
                }
            },
            CsmaState::Sifs { ack, until } => {
                if self.channel.in_use() {
                    CsmaState::AckIdle { ack }
                } else if now < until {
                    CsmaState::Sifs { ack, until }
                } else {
                    debug!("Sending ACK to {} seq {}", ack.dest, ack.seq);
                    self.channel.transmit(&ack.encode());
                    self.resume()
                }
            },
        };
    }

    fn idle(&mut self, now: Ts) -> CsmaState {
        if let Some(time) = self.clock.beacon_due() {
            match self.outbound.push_beacon(self.address, time) {
                true => debug!("Queued beacon with time {}", time),
                false => debug!("Skipped beacon, no room in queue"),
            }
        }

        if let Some(ack) = self.outbound.pop_ack() {
            return CsmaState::AckIdle { ack };
        }

        match self.outbound.head() {
            None => CsmaState::Idle,
            Some(_) if self.channel.in_use() => CsmaState::WaitIdle,
            // A non-zero count means a paused countdown to resume
            Some(_) => self.start_difs(now, self.clock.backoff_count() > 0),
        }
    }

    fn start_difs(&self, now: Ts, backoff: bool) -> CsmaState {
        CsmaState::Difs { until: now + self.clock.rounded_difs(), backoff }
    }

    /// Return to whatever an ACK transmission interrupted
    fn resume(&self) -> CsmaState {
        match self.in_flight {
            true => CsmaState::AwaitAck,
            false => CsmaState::Idle,
        }
    }

    fn transmit_head(&mut self) -> CsmaState {
        let head = match self.outbound.head() {
            Some(h) => h,
            None => return CsmaState::Idle,
        };

        // Another station may have started since DIFS or the last slot
        if self.channel.in_use() {
            debug!("Channel busy at transmit, deferring seq {}", head.frame.seq);
            return CsmaState::WaitIdle;
        }

        if self.clock.debug() {
            info!("Sending {} at {} (window {}, backoff {})",
                head.frame, self.clock.now(), self.clock.collision_window(), self.clock.backoff_count());
        }

        // Marked first so an ACK racing the end of transmission is matched
        self.outbound.mark_sent();
        self.channel.transmit(&head.frame.encode());

        if head.needs_ack() {
            self.clock.start_ack_timer();
            self.in_flight = true;
            CsmaState::AwaitAck
        } else {
            // Broadcasts and beacons are resolved once on air
            self.outbound.pop_head();
            CsmaState::Idle
        }
    }

    /// Resolve the unicast frame on air.
    ///
    /// The retry limit is checked before the ACK timer, so once the last
    /// retransmission is on air without an ACK already matched the frame is
    /// abandoned on the next evaluation rather than after a further timeout.
    fn await_ack(&mut self, now: Ts) -> CsmaState {
        let head = match self.outbound.head() {
            Some(h) => h,
            None => {
                self.in_flight = false;
                return CsmaState::Idle;
            }
        };

        if head.acked {
            self.in_flight = false;
            self.outbound.pop_head();
            self.clock.reset_collision_window();
            self.clock.set_last_event(Status::TxDelivered);

            debug!("Delivered seq {} to {}", head.frame.seq, head.frame.dest);
            if self.clock.debug() {
                info!("TX delivered");
            }

            CsmaState::Idle

        } else if head.retries >= self.config.retry_limit {
            self.in_flight = false;
            let purged = self.outbound.abandon_head().map(|(_, n)| n).unwrap_or(0);
            self.clock.reset_collision_window();
            self.clock.set_last_event(Status::TxFailed);

            warn!("Delivery of seq {} to {} failed after {} retries, purged {} queued frame(s)",
                head.frame.seq, head.frame.dest, head.retries, purged);
            if self.clock.debug() {
                info!("TX failed");
            }

            CsmaState::Idle

        } else if self.clock.ack_timed_out() {
            self.in_flight = false;
            let (window, backoff) = self.clock.escalate_backoff();
            let retries = self.outbound.mark_retry();

            debug!("ACK timeout for seq {} at {}, retry {}", head.frame.seq, now, retries);
            if self.clock.debug() {
                info!("Collision window changed to: {}", window);
                info!("Backoff count changed to: {}", backoff);
            }

            match self.channel.in_use() {
                true => CsmaState::WaitIdle,
                false => self.start_difs(now, true),
            }

        } else if let Some(ack) = self.outbound.pop_ack() {
            CsmaState::AckIdle { ack }

        } else {
            CsmaState::AwaitAck
        }
    }
}
