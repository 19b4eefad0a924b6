//! Outbound and inbound frame queues
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use heapless::Deque;
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::{Address, Ts};
use crate::error::MacError;
use crate::frame::{Frame, Kind};
use crate::mac::config::{ACK_CAPACITY, OUTBOUND_CAPACITY};
use crate::sequence::{seq_next, SendSequences};

/// Queued outbound frame with its delivery state
#[derive(Debug, Clone, PartialEq)]
pub struct Pending {
    pub frame: Frame,
    /// Retransmissions so far
    pub retries: u8,
    /// Put on air at least once
    pub sent: bool,
    /// Matching ACK received
    pub acked: bool,
}

impl Pending {
    fn new(frame: Frame) -> Self {
        Self {
            frame,
            retries: 0,
            sent: false,
            acked: false,
        }
    }

    /// Whether the frame waits for an ACK once sent
    pub fn needs_ack(&self) -> bool {
        self.frame.kind == Kind::Data && !self.frame.dest.is_broadcast()
    }
}

struct Outbound {
    acks: Deque<Frame, ACK_CAPACITY>,
    frames: Deque<Pending, OUTBOUND_CAPACITY>,
    seqs: SendSequences,
    /// Beacons are numbered apart from broadcast DATA
    beacon_seq: u16,
}

impl Outbound {
    /// Keep only the frames for which `f` returns true, preserving order
    fn retain<F: Fn(&Pending) -> bool>(&mut self, f: F) -> usize {
        let mut kept = Deque::new();
        let mut removed = 0;

        while let Some(p) = self.frames.pop_front() {
            if f(&p) {
                let _ = kept.push_back(p);
            } else {
                removed += 1;
            }
        }

        self.frames = kept;
        removed
    }
}

/// Outbound frames awaiting transmission.
///
/// ACKs live in their own lane which is always drained first, DATA and
/// BEACON frames are sent strictly one at a time from the head of the
/// data queue.
pub struct OutboundQueue {
    inner: Mutex<Outbound>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Outbound {
                acks: Deque::new(),
                frames: Deque::new(),
                seqs: SendSequences::default(),
                beacon_seq: 0,
            }),
        }
    }

    /// Number the payload for `dest` and queue it for transmission.
    ///
    /// The sequence number is only consumed if the frame is queued.
    pub fn submit(&self, dest: Address, source: Address, payload: &[u8]) -> Result<u16, MacError> {
        let mut q = self.inner.lock();

        if q.frames.is_full() {
            return Err(MacError::InsufficientBufferSpace);
        }

        let seq = q.seqs.next(dest);
        let _ = q.frames.push_back(Pending::new(Frame::data(dest, source, seq, payload)));

        Ok(seq)
    }

    /// Queue a beacon at the front, replacing any beacon still waiting.
    ///
    /// Returns false if there was no room for it.
    pub fn push_beacon(&self, source: Address, time: Ts) -> bool {
        let mut q = self.inner.lock();

        // Never jump ahead of a frame already on air
        if q.frames.front().map(|p| p.sent).unwrap_or(false) {
            return false;
        }

        let replaced = q.retain(|p| p.frame.kind != Kind::Beacon);
        if replaced > 0 {
            debug!("Coalescing {} queued beacon(s)", replaced);
        }

        if q.frames.is_full() {
            return false;
        }

        let seq = q.beacon_seq;
        match q.frames.push_front(Pending::new(Frame::beacon(source, seq, time))) {
            Ok(_) => {
                q.beacon_seq = seq_next(seq);
                true
            },
            Err(_) => false,
        }
    }

    /// Queue an ACK ahead of all data, returns false if the lane is full
    pub fn push_ack(&self, ack: Frame) -> bool {
        let mut q = self.inner.lock();
        match q.acks.push_back(ack) {
            Ok(_) => true,
            Err(a) => {
                warn!("ACK lane full, dropping ACK for {} seq {}", a.dest, a.seq);
                false
            }
        }
    }

    pub fn pop_ack(&self) -> Option<Frame> {
        self.inner.lock().acks.pop_front()
    }

    pub fn has_ack(&self) -> bool {
        !self.inner.lock().acks.is_empty()
    }

    /// Snapshot of the head of the data queue
    pub fn head(&self) -> Option<Pending> {
        self.inner.lock().frames.front().cloned()
    }

    /// Record that the head has been put on air
    pub fn mark_sent(&self) {
        if let Some(p) = self.inner.lock().frames.front_mut() {
            p.sent = true;
        }
    }

    /// Record a retransmission of the head, returning the retry count
    pub fn mark_retry(&self) -> u8 {
        match self.inner.lock().frames.front_mut() {
            Some(p) => {
                p.retries += 1;
                p.frame.retry = true;
                p.retries
            },
            None => 0,
        }
    }

    /// Mark the head acknowledged if `ack` matches the frame on air
    pub fn acknowledge(&self, ack: &Frame) -> bool {
        match self.inner.lock().frames.front_mut() {
            Some(p) if p.sent && !p.acked && ack.is_ack_for(&p.frame) => {
                p.acked = true;
                true
            },
            _ => false,
        }
    }

    /// Remove the resolved head
    pub fn pop_head(&self) -> Option<Pending> {
        self.inner.lock().frames.pop_front()
    }

    /// Abandon the head after delivery failure.
    ///
    /// Other frames queued for the same destination are purged and its
    /// sequence numbering restarts at 0. Returns the head and the purge count.
    pub fn abandon_head(&self) -> Option<(Pending, usize)> {
        let mut q = self.inner.lock();

        let head = q.frames.pop_front()?;
        let dest = head.frame.dest;

        let purged = q.retain(|p| p.frame.dest != dest);
        q.seqs.reset(dest);

        Some((head, purged))
    }

    /// Next sequence number that would be used for `dest`
    pub fn next_seq(&self, dest: Address) -> u16 {
        self.inner.lock().seqs.peek(dest)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().frames.is_empty()
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded queue of in-order frames awaiting the user's receive call
pub struct InboundQueue {
    capacity: usize,
    frames: Mutex<VecDeque<Frame>>,
    ready: Condvar,
}

impl InboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            ready: Condvar::new(),
        }
    }

    /// Queue a frame without blocking, handing it back if full
    pub fn try_push(&self, frame: Frame) -> Result<(), Frame> {
        let mut q = self.frames.lock();
        if q.len() >= self.capacity {
            return Err(frame);
        }

        q.push_back(frame);
        self.ready.notify_one();

        Ok(())
    }

    /// Block until a frame is available
    pub fn pop(&self) -> Frame {
        let mut q = self.frames.lock();
        loop {
            if let Some(f) = q.pop_front() {
                return f;
            }
            self.ready.wait(&mut q);
        }
    }

    /// Block for up to `timeout` for a frame
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        let mut q = self.frames.lock();
        loop {
            if let Some(f) = q.pop_front() {
                return Some(f);
            }
            if self.ready.wait_until(&mut q, deadline).timed_out() {
                return q.pop_front();
            }
        }
    }

    /// Free slots remaining
    pub fn room(&self) -> usize {
        self.capacity.saturating_sub(self.frames.lock().len())
    }

    pub fn is_full(&self) -> bool {
        self.room() == 0
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
