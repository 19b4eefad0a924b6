
use crate::error::MacError;
use crate::frame::MAX_PAYLOAD_LEN;

/// Capacity of the outbound data queue (DATA and BEACON frames)
pub const OUTBOUND_CAPACITY: usize = 4;

/// Capacity of the outbound ACK lane
pub const ACK_CAPACITY: usize = 2 * OUTBOUND_CAPACITY;

/// Per-peer reorder window slots, sized to cover a full sender queue twice
pub const REORDER_WINDOW: usize = 2 * OUTBOUND_CAPACITY;

/// Configuration for the DCF MAC
#[derive(Clone, PartialEq, Debug)]
pub struct MacConfig {
    /// Short interframe space in ms, precedes ACK transmission
    pub sifs_ms: u64,

    /// Backoff slot duration in ms
    pub slot_ms: u64,

    /// DIFS waits are extended to end on a multiple of this boundary (ms)
    pub slot_boundary_ms: u64,

    /// Collision window after a reset
    pub cw_initial: u32,
    /// Upper bound for the collision window
    pub cw_max: u32,

    /// Number of retransmissions before a frame is abandoned
    pub retry_limit: u8,

    /// Timeout for a DATA frame ACK in ms
    pub ack_timeout_ms: u64,

    /// Enable beacon frame transmission
    pub beacons_enabled: bool,
    /// Beacon period in ms
    pub beacon_interval_ms: u64,

    /// Use the full collision window instead of a random slot
    pub fixed_slot_selection: bool,

    /// Emit diagnostic output
    pub debug: bool,

    /// Polling period for idle-channel and ACK waits in ms
    pub poll_ms: u64,

    /// Largest accepted payload in bytes
    pub max_payload: usize,

    /// Capacity of the inbound (delivered frame) queue
    pub inbound_capacity: usize,
}

impl Default for MacConfig {
    fn default() -> Self {
        Self {
            sifs_ms: 100,
            slot_ms: 200,
            slot_boundary_ms: 50,

            cw_initial: 1,
            cw_max: 31,
            retry_limit: 5,

            // Slot time plus the measured ACK round trip
            ack_timeout_ms: 200 + 2129,

            beacons_enabled: true,
            beacon_interval_ms: 3000,

            fixed_slot_selection: false,
            debug: false,

            poll_ms: 10,

            max_payload: MAX_PAYLOAD_LEN,
            inbound_capacity: 4,
        }
    }
}

impl MacConfig {
    /// Distributed interframe space, the idle time required before contending
    pub fn difs_ms(&self) -> u64 {
        self.sifs_ms + 2 * self.slot_ms
    }

    pub fn validate(&self) -> Result<(), MacError> {
        if self.inbound_capacity == 0 {
            return Err(MacError::BadBufferSize);
        }
        if self.max_payload > MAX_PAYLOAD_LEN {
            return Err(MacError::BadBufferSize);
        }
        if self.slot_boundary_ms == 0 || self.cw_initial == 0 || self.cw_initial > self.cw_max {
            return Err(MacError::IllegalArgument);
        }

        Ok(())
    }
}
