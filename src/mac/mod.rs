//! Medium Access Control (MAC) layer module.
//! Contains the MAC trait and the [`LinkLayer`] station.
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info};

use crate::Address;
use crate::channel::Channel;
use crate::clock::{Clock, Settings};
use crate::error::MacError;
use crate::frame::Frame;
use crate::queue::{InboundQueue, OutboundQueue};
use crate::status::{Command, Status, HELP};

pub mod config;
use config::MacConfig;

pub mod csma;
use csma::CsmaSender;

pub mod receiver;
use receiver::Receiver;

/// Payload received from a peer
#[derive(Debug, Clone, PartialEq)]
pub struct Transmission {
    pub source: Address,
    pub dest: Address,
    pub payload: Bytes,
}

impl From<Frame> for Transmission {
    fn from(f: Frame) -> Self {
        Self {
            source: f.source,
            dest: f.dest,
            payload: f.payload_bytes(),
        }
    }
}

/// Generic MAC trait, implemented by all MACs
pub trait Mac {
    type Error;

    /// Queue a payload for transmission, returning the number of bytes accepted
    fn send(&self, dest: Address, payload: &[u8]) -> Result<usize, Self::Error>;

    /// Block until a payload is received
    fn recv(&self) -> Transmission;

    /// Most recent event recorded by the station
    fn status(&self) -> Status;

    /// Apply a runtime command
    fn command(&self, cmd: Command) -> Result<(), Self::Error>;
}

/// A station on a shared [`Channel`].
///
/// Creating a station starts its transmit and receive engines, which run
/// until the station is dropped.
pub struct LinkLayer<C: Channel + 'static> {
    address: Address,
    config: MacConfig,

    clock: Arc<Clock<Arc<C>>>,
    outbound: Arc<OutboundQueue>,
    inbound: Arc<InboundQueue>,

    running: Arc<AtomicBool>,
}

impl <C: Channel + 'static> LinkLayer<C> {
    pub fn new(address: Address, channel: C, config: MacConfig) -> Result<Self, MacError> {
        config.validate()?;

        if address.is_broadcast() {
            return Err(MacError::BadMacAddress);
        }

        let channel = Arc::new(channel);
        let clock = Arc::new(Clock::new(channel.clone(), &config));
        let outbound = Arc::new(OutboundQueue::new());
        let inbound = Arc::new(InboundQueue::new(config.inbound_capacity));

        let mut sender = CsmaSender::new(address, channel.clone(), clock.clone(), outbound.clone(), config.clone());
        let mut receiver = Receiver::new(address, channel, clock.clone(), outbound.clone(), inbound.clone());

        let running = Arc::new(AtomicBool::new(true));

        let r = running.clone();
        thread::Builder::new()
            .name(format!("mac-tx-{}", address))
            .spawn(move || sender.run(&r))?;

        let r = running.clone();
        if let Err(e) = thread::Builder::new()
            .name(format!("mac-rx-{}", address))
            .spawn(move || receiver.run(&r)) {
            // Stop the transmit engine already started
            running.store(false, Ordering::SeqCst);
            return Err(e.into());
        }

        debug!("Station {} started", address);
        clock.set_last_event(Status::Success);

        Ok(Self {
            address,
            config,
            clock,
            outbound,
            inbound,
            running,
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Block for up to `timeout` for a payload
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Transmission> {
        let frame = self.inbound.pop_timeout(timeout)?;
        self.log_received(&frame);
        Some(frame.into())
    }

    /// Apply a numeric `(code, value)` command
    pub fn command_code(&self, code: i32, value: i32) -> Result<(), MacError> {
        let cmd = Command::parse(code, value).map_err(|e| self.record(e))?;
        self.command(cmd)
    }

    /// Snapshot of the runtime settings
    pub fn settings(&self) -> Settings {
        self.clock.settings()
    }

    /// Frames queued for transmission, including any in flight
    pub fn pending(&self) -> usize {
        self.outbound.len()
    }

    fn enqueue(&self, dest: Address, payload: &[u8]) -> Result<usize, MacError> {
        if dest == self.address {
            return Err(MacError::BadAddress);
        }
        if payload.len() > self.config.max_payload {
            return Err(MacError::IllegalArgument);
        }

        let seq = self.outbound.submit(dest, self.address, payload)?;

        debug!("Queued {} bytes for {} seq {}", payload.len(), dest, seq);
        if self.clock.debug() {
            info!("Attempting to send {} bytes to {} at {} (backoff {}, window {})",
                payload.len(), dest, self.clock.now(), self.clock.backoff_count(), self.clock.collision_window());
        }

        Ok(payload.len())
    }

    /// Record a rejection as the last event
    fn record(&self, e: MacError) -> MacError {
        if self.clock.debug() {
            info!("{}", e.status());
        }
        self.clock.set_last_event(e.status());
        e
    }

    fn log_received(&self, frame: &Frame) {
        if self.clock.debug() {
            info!("Received {} at {}", frame, self.clock.now());
        }
    }
}

impl <C: Channel + 'static> Drop for LinkLayer<C> {
    fn drop(&mut self) {
        debug!("Stopping station {}", self.address);
        self.running.store(false, Ordering::SeqCst);
    }
}

impl <C: Channel + 'static> Mac for LinkLayer<C> {
    type Error = MacError;

    fn send(&self, dest: Address, payload: &[u8]) -> Result<usize, Self::Error> {
        self.enqueue(dest, payload).map_err(|e| self.record(e))
    }

    fn recv(&self) -> Transmission {
        let frame = self.inbound.pop();
        self.log_received(&frame);
        frame.into()
    }

    fn status(&self) -> Status {
        let status = self.clock.last_event();
        if self.clock.debug() {
            info!("Current status: {}", status);
        }
        status
    }

    fn command(&self, cmd: Command) -> Result<(), Self::Error> {
        debug!("Command: {:?}", cmd);

        match cmd {
            Command::Help => {
                info!("{}", HELP);
                info!("{}", self.clock.settings());
            },
            Command::Debug(on) => {
                self.clock.set_debug(on);
                if on {
                    info!("{}", self.clock.settings());
                }
            },
            Command::SlotSelection(s) => {
                self.clock.set_slot_selection(s);
                if self.clock.debug() {
                    info!("Slot selection: {}", s);
                }
            },
            Command::BeaconInterval(secs) => {
                self.clock.set_beacon_interval(secs.map(|s| s as u64 * 1000));
                if self.clock.debug() {
                    info!("{}", self.clock.settings());
                }
            },
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::time::Instant;

    use rand::{Rng, thread_rng};

    use crate::channel::mock::MockMedium;
    use crate::frame::Kind;
    use crate::status::SlotSelection;
    use crate::timer::SystemTimer;

    use super::*;

    const A: Address = Address(1);
    const B: Address = Address(2);
    const C: Address = Address(3);

    fn fast_config() -> MacConfig {
        MacConfig {
            sifs_ms: 2,
            slot_ms: 4,
            slot_boundary_ms: 2,
            ack_timeout_ms: 400,
            beacons_enabled: false,
            poll_ms: 1,
            ..Default::default()
        }
    }

    fn setup() -> MockMedium<SystemTimer> {
        let _ = simplelog::SimpleLogger::init(log::LevelFilter::Debug, simplelog::Config::default());
        MockMedium::new(SystemTimer::new())
    }

    fn wait_for<F: Fn() -> bool>(timeout: Duration, f: F) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        f()
    }

    fn on_air(medium: &MockMedium<SystemTimer>, station: usize, kind: Kind) -> Vec<Frame> {
        medium.transmissions().iter()
            .filter(|(id, _)| *id == station)
            .filter_map(|(_, b)| Frame::decode(b).ok())
            .filter(|f| f.kind == kind)
            .collect()
    }

    #[test]
    fn unicast_delivery() {
        let medium = setup();
        let (ca, cb) = (medium.attach(), medium.attach());
        let (ida, idb) = (ca.id(), cb.id());

        let a = LinkLayer::new(A, ca, fast_config()).unwrap();
        let b = LinkLayer::new(B, cb, fast_config()).unwrap();

        let mut payload = [0u8; 100];
        thread_rng().fill(&mut payload[..]);

        assert_eq!(a.send(B, &payload).unwrap(), 100);

        let t = b.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(t.source, A);
        assert_eq!(t.dest, B);
        assert_eq!(&t.payload[..], &payload[..]);

        assert!(wait_for(Duration::from_secs(2), || a.status() == Status::TxDelivered));
        assert_eq!(a.pending(), 0);

        assert_eq!(on_air(&medium, ida, Kind::Data).len(), 1);
        assert_eq!(on_air(&medium, idb, Kind::Ack).len(), 1);
        assert_eq!(on_air(&medium, ida, Kind::Data)[0].seq, 0);
    }

    #[test]
    fn lost_acks_fail_and_reset_sequence() {
        let medium = setup();
        medium.drop_if(|_id, data| {
            Frame::decode(data).map(|f| f.kind == Kind::Ack).unwrap_or(false)
        });

        let (ca, cb) = (medium.attach(), medium.attach());
        let ida = ca.id();

        let config = MacConfig { ack_timeout_ms: 40, ..fast_config() };
        let a = LinkLayer::new(A, ca, config.clone()).unwrap();
        let b = LinkLayer::new(B, cb, config).unwrap();

        a.send(B, &[1, 2, 3]).unwrap();
        a.send(B, &[4, 5, 6]).unwrap();

        assert!(wait_for(Duration::from_secs(10), || a.status() == Status::TxFailed));
        assert_eq!(a.pending(), 0);
        assert_eq!(a.settings().collision_window, 1);

        // First transmission plus the retries, the queued frame was purged
        let sent = on_air(&medium, ida, Kind::Data);
        assert_eq!(sent.len(), 6);
        assert!(sent.iter().all(|f| f.seq == 0));
        assert!(sent[1..].iter().all(|f| f.retry));

        // Retransmissions are not delivered twice
        assert_eq!(&b.recv_timeout(Duration::from_secs(1)).unwrap().payload[..], &[1, 2, 3]);
        assert!(b.recv_timeout(Duration::from_millis(100)).is_none());

        a.send(B, &[7]).unwrap();
        assert!(wait_for(Duration::from_secs(2), || on_air(&medium, ida, Kind::Data).len() > 6));

        let next = &on_air(&medium, ida, Kind::Data)[6];
        assert_eq!(next.seq, 0);
        assert!(!next.retry);
    }

    #[test]
    fn restarted_sequence_delivered_after_failure() {
        let medium = setup();
        medium.drop_if(|_id, data| {
            Frame::decode(data).map(|f| f.kind == Kind::Ack).unwrap_or(false)
        });

        let (ca, cb) = (medium.attach(), medium.attach());

        let config = MacConfig { ack_timeout_ms: 40, ..fast_config() };
        let a = LinkLayer::new(A, ca, config.clone()).unwrap();
        let b = LinkLayer::new(B, cb, config).unwrap();

        a.send(B, &[1]).unwrap();
        a.send(B, &[2]).unwrap();
        assert!(wait_for(Duration::from_secs(10), || a.status() == Status::TxFailed));
        assert_eq!(&b.recv_timeout(Duration::from_secs(1)).unwrap().payload[..], &[1]);

        // Link recovers, numbering restarts at 0 and the receiver follows
        medium.drop_if(|_id, _data| false);
        a.send(B, &[7]).unwrap();

        let t = b.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(&t.payload[..], &[7]);
        assert!(wait_for(Duration::from_secs(2), || a.status() == Status::TxDelivered));
        assert_eq!(a.pending(), 0);

        a.send(B, &[8]).unwrap();
        assert_eq!(&b.recv_timeout(Duration::from_secs(2)).unwrap().payload[..], &[8]);
    }

    #[test]
    fn broadcast_reaches_all_stations() {
        let medium = setup();
        let (ca, cb, cc) = (medium.attach(), medium.attach(), medium.attach());
        let ida = ca.id();

        let a = LinkLayer::new(A, ca, fast_config()).unwrap();
        let b = LinkLayer::new(B, cb, fast_config()).unwrap();
        let c = LinkLayer::new(C, cc, fast_config()).unwrap();

        a.send(Address::BROADCAST, b"hello").unwrap();

        for s in [&b, &c].iter() {
            let t = s.recv_timeout(Duration::from_secs(2)).unwrap();
            assert_eq!(t.source, A);
            assert_eq!(t.dest, Address::BROADCAST);
            assert_eq!(&t.payload[..], b"hello");
        }

        assert!(wait_for(Duration::from_secs(1), || a.pending() == 0));
        assert_eq!(on_air(&medium, ida, Kind::Data).len(), 1);
        assert_eq!(a.status(), Status::Success);
    }

    #[test]
    fn ordered_stream_between_peers() {
        let medium = setup();
        let (ca, cb) = (medium.attach(), medium.attach());

        let a = LinkLayer::new(A, ca, fast_config()).unwrap();
        let b = LinkLayer::new(B, cb, fast_config()).unwrap();

        let drain = |s: &LinkLayer<_>, out: &mut Vec<u8>, timeout| {
            while let Some(t) = s.recv_timeout(timeout) {
                out.push(t.payload[0]);
            }
        };

        let (mut at_a, mut at_b) = (vec![], vec![]);
        for i in 0..10u8 {
            assert!(wait_for(Duration::from_secs(2), || a.send(B, &[i]).is_ok()));
            // Traffic in the other direction shares the channel
            assert!(wait_for(Duration::from_secs(2), || b.send(A, &[i]).is_ok()));

            drain(&a, &mut at_a, Duration::from_millis(1));
            drain(&b, &mut at_b, Duration::from_millis(1));
        }

        drain(&a, &mut at_a, Duration::from_millis(500));
        drain(&b, &mut at_b, Duration::from_millis(500));

        let expected: Vec<u8> = (0..10).collect();
        assert_eq!(at_a, expected);
        assert_eq!(at_b, expected);
    }

    #[test]
    fn send_rejections() {
        let medium = setup();
        medium.set_busy(true);

        let a = LinkLayer::new(A, medium.attach(), fast_config()).unwrap();
        assert_eq!(a.status(), Status::Success);

        assert!(matches!(a.send(A, &[1]), Err(MacError::BadAddress)));
        assert_eq!(a.status(), Status::BadAddress);

        assert!(matches!(a.send(B, &vec![0u8; 2039]), Err(MacError::IllegalArgument)));
        assert_eq!(a.status(), Status::IllegalArgument);
        assert_eq!(a.send(B, &vec![0u8; 2038]).unwrap(), 2038);

        // A busy channel holds every frame in the queue
        for _ in 0..3 {
            a.send(B, &[1]).unwrap();
        }
        assert!(matches!(a.send(B, &[1]), Err(MacError::InsufficientBufferSpace)));
        assert_eq!(a.status(), Status::InsufficientBufferSpace);
        assert_eq!(a.pending(), 4);
    }

    #[test]
    fn start_up_rejections() {
        let medium = setup();

        let r = LinkLayer::new(Address::BROADCAST, medium.attach(), fast_config());
        assert!(matches!(r, Err(MacError::BadMacAddress)));

        let config = MacConfig { inbound_capacity: 0, ..fast_config() };
        let r = LinkLayer::new(A, medium.attach(), config);
        assert!(matches!(r, Err(MacError::BadBufferSize)));
    }

    #[test]
    fn commands() {
        let medium = setup();
        let a = LinkLayer::new(A, medium.attach(), fast_config()).unwrap();

        a.command_code(0, 0).unwrap();

        a.command_code(1, 1).unwrap();
        assert!(a.settings().debug);

        a.command_code(2, 1).unwrap();
        assert_eq!(a.settings().slot_selection, SlotSelection::Fixed);

        a.command_code(3, 7).unwrap();
        assert!(a.settings().beacons_enabled);
        assert_eq!(a.settings().beacon_interval_ms, 7000);

        a.command_code(3, -1).unwrap();
        assert!(!a.settings().beacons_enabled);

        assert!(matches!(a.command_code(3, -2), Err(MacError::IllegalArgument)));
        assert!(matches!(a.command_code(12, 0), Err(MacError::IllegalArgument)));
        assert_eq!(a.status(), Status::IllegalArgument);

        a.command(Command::Debug(false)).unwrap();
        assert!(!a.settings().debug);
    }

    #[test]
    fn beacons_on_air() {
        let medium = setup();
        let ca = medium.attach();
        let ida = ca.id();
        let _listener = medium.attach();

        let config = MacConfig { beacons_enabled: true, beacon_interval_ms: 20, ..fast_config() };
        let _a = LinkLayer::new(A, ca, config).unwrap();

        assert!(wait_for(Duration::from_secs(2), || on_air(&medium, ida, Kind::Beacon).len() >= 2));

        let beacons = on_air(&medium, ida, Kind::Beacon);
        assert!(beacons.iter().all(|b| b.dest == Address::BROADCAST));
        assert!(beacons[1].beacon_time() > beacons[0].beacon_time());
        assert_ne!(beacons[0].seq, beacons[1].seq);
    }

    #[test]
    fn broadcast_amid_beacons_delivered() {
        let medium = setup();
        let (ca, cb) = (medium.attach(), medium.attach());
        let ida = ca.id();

        let config = MacConfig { beacons_enabled: true, beacon_interval_ms: 5, ..fast_config() };
        let a = LinkLayer::new(A, ca, config.clone()).unwrap();
        let b = LinkLayer::new(B, cb, config).unwrap();

        assert!(wait_for(Duration::from_secs(2), || on_air(&medium, ida, Kind::Beacon).len() >= 2));

        for i in 0..5u8 {
            a.send(Address::BROADCAST, &[i]).unwrap();
            let t = b.recv_timeout(Duration::from_secs(2)).unwrap();
            assert_eq!(&t.payload[..], &[i]);
        }
    }

    #[test]
    fn dropped_station_stops_engines() {
        let medium = setup();
        let ca = medium.attach();
        let ida = ca.id();
        let _listener = medium.attach();

        let config = MacConfig { beacons_enabled: true, beacon_interval_ms: 5, ..fast_config() };
        let a = LinkLayer::new(A, ca, config).unwrap();
        assert!(wait_for(Duration::from_secs(2), || !on_air(&medium, ida, Kind::Beacon).is_empty()));

        drop(a);
        thread::sleep(Duration::from_millis(100));
        let stopped = on_air(&medium, ida, Kind::Beacon).len();

        thread::sleep(Duration::from_millis(100));
        assert_eq!(on_air(&medium, ida, Kind::Beacon).len(), stopped);
    }
}
