//! 802.11 DCF style MAC layer
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

//! A contention based link layer that provides acknowledged, ordered
//! point-to-point delivery and best-effort broadcast over a shared,
//! half-duplex broadcast [`Channel`].
//!
//! A [`mac::LinkLayer`] owns two background engines, a CSMA/CA transmitter
//! and a receiver, that share the outbound / inbound queues and the
//! station [`clock::Clock`].

use core::fmt;

pub mod timer;

pub mod channel;

pub mod frame;

pub mod clock;

pub mod status;

pub mod queue;

pub mod sequence;

pub mod mac;

pub mod error;

pub mod prelude;

pub use channel::Channel;

/// Timestamps are 64-bit in milliseconds
pub type Ts = u64;

/// 16-bit station address, all-ones is reserved for broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub u16);

impl Address {
    pub const BROADCAST: Address = Address(0xFFFF);

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl From<u16> for Address {
    fn from(v: u16) -> Self {
        Address(v)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_broadcast() {
            write!(f, "bcast")
        } else {
            write!(f, "{}", self.0)
        }
    }
}
