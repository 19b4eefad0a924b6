//! Sequence number tracking and reassembly
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use std::collections::HashMap;

use log::debug;

use crate::Address;
use crate::frame::{Frame, SEQ_MASK, SEQ_MODULUS};
use crate::mac::config::REORDER_WINDOW;

/// Broadcast sequence numbers remembered behind the newest seen per source
pub const BROADCAST_HISTORY: u16 = 32;

/// Next sequence number, wrapping at 4096
pub fn seq_next(seq: u16) -> u16 {
    seq.wrapping_add(1) & SEQ_MASK
}

/// Forward distance from `from` to `to` modulo 4096
pub fn seq_distance(from: u16, to: u16) -> u16 {
    to.wrapping_sub(from) & SEQ_MASK
}

/// Position of a received sequence number relative to the expected one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqOrder {
    Expected,
    /// Ahead of expected by the given distance (at least 1)
    Ahead(u16),
    /// Already delivered
    Behind,
}

pub fn classify(expected: u16, seq: u16) -> SeqOrder {
    match seq_distance(expected, seq) {
        0 => SeqOrder::Expected,
        d if d < SEQ_MODULUS / 2 => SeqOrder::Ahead(d),
        _ => SeqOrder::Behind,
    }
}

/// Outbound sequence numbers per destination
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendSequences {
    next: HashMap<Address, u16>,
}

impl SendSequences {
    /// Fetch the sequence number for the next frame to `dest`
    pub fn next(&mut self, dest: Address) -> u16 {
        let n = self.next.entry(dest).or_insert(0);
        let seq = *n;
        *n = seq_next(seq);
        seq
    }

    /// Look at the next sequence number without consuming it
    pub fn peek(&self, dest: Address) -> u16 {
        self.next.get(&dest).copied().unwrap_or(0)
    }

    /// Restart numbering for `dest` at 0
    pub fn reset(&mut self, dest: Address) {
        self.next.remove(&dest);
    }
}

/// Fixed slot storage for frames received ahead of the expected sequence.
///
/// Slot `i` holds sequence `expected + 1 + i`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReorderWindow<const N: usize> {
    slots: [Option<Frame>; N],
}

impl <const N: usize> ReorderWindow<N> {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| None),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Store a frame at `offset`, returns false if outside the window
    pub fn insert(&mut self, offset: usize, frame: Frame) -> bool {
        match self.slots.get_mut(offset) {
            Some(slot) => {
                *slot = Some(frame);
                true
            },
            None => false,
        }
    }

    /// Remove slot 0 and shift the window forward by one
    pub fn take_front(&mut self) -> Option<Frame> {
        let front = self.slots[0].take();
        self.slots.rotate_left(1);
        front
    }

    /// Number of occupied slots at the front of the window
    pub fn contiguous(&self) -> usize {
        self.slots.iter().take_while(|s| s.is_some()).count()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl <const N: usize> Default for ReorderWindow<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Receive state for a unicast peer
#[derive(Debug, Clone, PartialEq)]
pub struct PeerState {
    /// One past the highest contiguously delivered sequence
    pub expected: u16,
    pub window: ReorderWindow<REORDER_WINDOW>,
}

impl PeerState {
    fn new() -> Self {
        Self {
            expected: 0,
            window: ReorderWindow::new(),
        }
    }
}

/// Outcome of offering a DATA frame to the sequence tracker
#[derive(Debug, Clone, PartialEq)]
pub enum Accept {
    /// Frames now deliverable, in order
    Deliver(Vec<Frame>),
    /// Held in the reorder window, `missing` is the distance ahead of expected
    Buffered { missing: u16 },
    /// Too far ahead of expected to hold
    Beyond { missing: u16 },
    /// Already delivered
    Duplicate,
    /// In order, but the run it completes does not fit in the available room
    NoRoom,
}

/// Duplicate filter for one broadcast source.
///
/// Bit `i` of `seen` records delivery of `newest - i`, so late frames
/// within the history are delivered once and only true repeats are dropped.
#[derive(Debug, Clone, Copy, PartialEq)]
struct BroadcastHistory {
    newest: u16,
    seen: u32,
}

impl BroadcastHistory {
    fn new(seq: u16) -> Self {
        Self { newest: seq, seen: 1 }
    }

    fn accept(&mut self, seq: u16) -> bool {
        match classify(seq_next(self.newest), seq) {
            SeqOrder::Expected | SeqOrder::Ahead(_) => {
                let shift = seq_distance(self.newest, seq) as u32;
                self.seen = self.seen.checked_shl(shift).unwrap_or(0) | 1;
                self.newest = seq;
                true
            },
            SeqOrder::Behind => {
                let back = seq_distance(seq, self.newest);
                if back >= BROADCAST_HISTORY {
                    return false;
                }

                let bit = 1u32 << back;
                if self.seen & bit != 0 {
                    return false;
                }
                self.seen |= bit;
                true
            },
        }
    }
}

/// Inbound sequence tracking for every peer heard from
#[derive(Debug, Default)]
pub struct Peers {
    unicast: HashMap<Address, PeerState>,
    broadcast: HashMap<Address, BroadcastHistory>,
    beacons: HashMap<Address, BroadcastHistory>,
}

impl Peers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a unicast DATA frame, `room` is the free space for delivery
    pub fn accept(&mut self, frame: Frame, room: usize) -> Accept {
        let peer = self.unicast.entry(frame.source).or_insert_with(|| {
            debug!("New peer {}", frame.source);
            PeerState::new()
        });

        // A first transmission of sequence 0 that cannot be a wrap into the
        // window means the sender restarted numbering for us
        if frame.seq == 0 && !frame.retry && peer.expected != 0 {
            match classify(peer.expected, 0) {
                SeqOrder::Ahead(d) if (d as usize) <= REORDER_WINDOW => (),
                _ => {
                    debug!("Peer {} restarted its sequence (expected {})", frame.source, peer.expected);
                    *peer = PeerState::new();
                },
            }
        }

        match classify(peer.expected, frame.seq) {
            SeqOrder::Expected => {
                if 1 + peer.window.contiguous() > room {
                    return Accept::NoRoom;
                }

                peer.expected = seq_next(frame.seq);
                let mut ready = vec![frame];

                while let Some(f) = peer.window.take_front() {
                    peer.expected = seq_next(peer.expected);
                    ready.push(f);
                }

                Accept::Deliver(ready)
            },
            SeqOrder::Ahead(missing) => {
                match peer.window.insert(missing as usize - 1, frame) {
                    true => Accept::Buffered { missing },
                    false => Accept::Beyond { missing },
                }
            },
            SeqOrder::Behind => Accept::Duplicate,
        }
    }

    /// Broadcast DATA duplicate filter, returns true if the frame is new.
    ///
    /// Broadcasts have no reorder window and are delivered as they arrive.
    pub fn accept_broadcast(&mut self, source: Address, seq: u16) -> bool {
        Self::accept_history(&mut self.broadcast, source, seq)
    }

    /// Beacon duplicate filter, beacons are numbered apart from broadcast DATA
    pub fn accept_beacon(&mut self, source: Address, seq: u16) -> bool {
        Self::accept_history(&mut self.beacons, source, seq)
    }

    fn accept_history(map: &mut HashMap<Address, BroadcastHistory>, source: Address, seq: u16) -> bool {
        match map.get_mut(&source) {
            Some(h) => h.accept(seq),
            None => {
                map.insert(source, BroadcastHistory::new(seq));
                true
            },
        }
    }

    /// Expected sequence from a unicast peer, if it has been heard from
    pub fn expected(&self, source: Address) -> Option<u16> {
        self.unicast.get(&source).map(|p| p.expected)
    }

    #[cfg(test)]
    pub(crate) fn peer(&self, source: Address) -> Option<&PeerState> {
        self.unicast.get(&source)
    }
}
