//! Receive engine
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, trace, info, warn};

use crate::Address;
use crate::channel::Channel;
use crate::clock::Clock;
use crate::frame::{DecodeError, Frame, Kind};
use crate::queue::{InboundQueue, OutboundQueue};
use crate::sequence::{Accept, Peers};
use crate::status::Status;

/// Longest wait on the channel before the stop flag is checked again
const RX_POLL: Duration = Duration::from_millis(50);

/// Receive side of a station, dispatches every frame heard on the channel
pub struct Receiver<C: Channel> {
    address: Address,

    channel: Arc<C>,
    clock: Arc<Clock<Arc<C>>>,
    outbound: Arc<OutboundQueue>,
    inbound: Arc<InboundQueue>,

    peers: Peers,
}

impl <C: Channel> Receiver<C> {
    pub fn new(address: Address, channel: Arc<C>, clock: Arc<Clock<Arc<C>>>, outbound: Arc<OutboundQueue>, inbound: Arc<InboundQueue>) -> Self {
        Self {
            address,
            channel,
            clock,
            outbound,
            inbound,
            peers: Peers::new(),
        }
    }

    /// Handle each transmission heard on the channel until `running` is cleared
    pub fn run(&mut self, running: &AtomicBool) {
        debug!("Starting receive engine for {}", self.address);

        while running.load(Ordering::SeqCst) {
            if let Some(data) = self.channel.receive_timeout(RX_POLL) {
                self.handle(&data);
            }
        }

        debug!("Receive engine for {} stopped", self.address);
    }

    /// Handle a single received transmission
    pub fn handle(&mut self, data: &[u8]) {
        let frame = match Frame::decode(data) {
            Ok(f) => f,
            Err(DecodeError::UnknownKind(k)) => {
                trace!("Ignoring frame of unknown kind {}", k);
                return;
            },
            Err(e) => {
                debug!("Dropping damaged frame: {}", e);
                self.clock.set_last_event(Status::UnspecifiedError);
                return;
            },
        };

        if self.clock.debug() {
            info!("Received {} at {}", frame, self.clock.now());
        }

        match frame.kind {
            Kind::Beacon if frame.dest.is_broadcast() => self.handle_beacon(frame),
            Kind::Data if self.inbound.is_full() => {
                warn!("Inbound queue full, dropping {}", frame);
                self.clock.set_last_event(Status::InsufficientBufferSpace);
            },
            Kind::Data if frame.dest.is_broadcast() => {
                if self.peers.accept_broadcast(frame.source, frame.seq) {
                    self.deliver(frame);
                } else {
                    trace!("Duplicate broadcast {}", frame);
                }
            },
            Kind::Ack if frame.dest == self.address => {
                match self.outbound.acknowledge(&frame) {
                    true => debug!("ACK for seq {} from {}", frame.seq, frame.source),
                    false => trace!("Ignoring stray {}", frame),
                }
            },
            Kind::Data if frame.dest == self.address => self.handle_data(frame),
            _ => trace!("Ignoring {}", frame),
        }
    }

    fn handle_beacon(&mut self, frame: Frame) {
        if !self.clock.beacons_enabled() || !self.peers.accept_beacon(frame.source, frame.seq) {
            return;
        }

        let remote = match frame.beacon_time() {
            Some(t) => t,
            None => {
                debug!("Malformed beacon from {}", frame.source);
                return;
            }
        };

        if self.clock.absorb_beacon(remote) {
            debug!("Clock advanced to {} by beacon from {}", remote, frame.source);
        }
    }

    fn handle_data(&mut self, frame: Frame) {
        let ack = Frame::ack(&frame);
        let (source, seq) = (frame.source, frame.seq);

        match self.peers.accept(frame, self.inbound.room()) {
            Accept::Deliver(frames) => {
                for f in frames {
                    self.deliver(f);
                }
                self.outbound.push_ack(ack);
            },
            Accept::Buffered { missing } => {
                warn!("Sequence gap from {}: got {} with {} frame(s) missing", source, seq, missing);
                self.outbound.push_ack(ack);
            },
            Accept::Beyond { missing } => {
                warn!("Sequence gap from {}: got {} with {} frame(s) missing, outside reorder window", source, seq, missing);
            },
            Accept::Duplicate => {
                debug!("Duplicate seq {} from {}, resending ACK", seq, source);
                self.outbound.push_ack(ack);
            },
            Accept::NoRoom => {
                warn!("No room to deliver seq {} from {}", seq, source);
                self.clock.set_last_event(Status::InsufficientBufferSpace);
            },
        }
    }

    fn deliver(&self, frame: Frame) {
        trace!("Delivering {}", frame);

        if let Err(f) = self.inbound.try_push(frame) {
            warn!("Inbound queue full, dropping {}", f);
            self.clock.set_last_event(Status::InsufficientBufferSpace);
        }
    }
}

#[cfg(test)]
mod test {
    use crate::channel::mock::{MockChannel, MockMedium};
    use crate::mac::config::MacConfig;
    use crate::timer::mock::MockTimer;

    use super::*;

    const ME: Address = Address(5);
    const PEER: Address = Address(6);
    const OTHER: Address = Address(7);

    struct Harness {
        timer: MockTimer,
        clock: Arc<Clock<Arc<MockChannel<MockTimer>>>>,
        outbound: Arc<OutboundQueue>,
        inbound: Arc<InboundQueue>,
        receiver: Receiver<MockChannel<MockTimer>>,
    }

    fn setup(inbound_capacity: usize) -> Harness {
        let _ = simplelog::SimpleLogger::init(log::LevelFilter::Debug, simplelog::Config::default());

        let timer = MockTimer::new();
        let medium = MockMedium::new(timer.clone());
        let channel = Arc::new(medium.attach());

        let clock = Arc::new(Clock::new(channel.clone(), &MacConfig::default()));
        let outbound = Arc::new(OutboundQueue::new());
        let inbound = Arc::new(InboundQueue::new(inbound_capacity));
        let receiver = Receiver::new(ME, channel, clock.clone(), outbound.clone(), inbound.clone());

        Harness { timer, clock, outbound, inbound, receiver }
    }

    impl Harness {
        fn rx(&mut self, frame: &Frame) {
            self.receiver.handle(&frame.encode());
        }

        fn acks(&self) -> Vec<u16> {
            let mut seqs = vec![];
            while let Some(a) = self.outbound.pop_ack() {
                assert_eq!(a.kind, Kind::Ack);
                seqs.push(a.seq);
            }
            seqs
        }

        fn delivered(&self) -> Vec<u16> {
            let mut seqs = vec![];
            while !self.inbound.is_empty() {
                seqs.push(self.inbound.pop().seq);
            }
            seqs
        }
    }

    fn data(seq: u16) -> Frame {
        Frame::data(ME, PEER, seq, &[seq as u8; 4])
    }

    #[test]
    fn deliver_and_ack() {
        let mut h = setup(4);
        let f = data(0);
        h.rx(&f);

        assert_eq!(h.outbound.pop_ack(), Some(Frame::ack(&f)));
        assert_eq!(h.inbound.pop(), f);
        assert_eq!(h.clock.last_event(), Status::Success);
    }

    #[test]
    fn reassembles_out_of_order() {
        let mut h = setup(4);
        for seq in [0, 1, 3, 2].iter() {
            h.rx(&data(*seq));
        }

        assert_eq!(h.delivered(), vec![0, 1, 2, 3]);
        assert_eq!(h.acks(), vec![0, 1, 3, 2]);
    }

    #[test]
    fn duplicate_resends_ack() {
        let mut h = setup(4);
        h.rx(&data(0));
        h.rx(&data(0));

        assert_eq!(h.delivered(), vec![0]);
        assert_eq!(h.acks(), vec![0, 0]);
    }

    #[test]
    fn beyond_window_not_acked() {
        let mut h = setup(4);
        h.rx(&data(100));

        assert!(h.acks().is_empty());
        assert!(h.inbound.is_empty());
    }

    #[test]
    fn corrupt_frame_dropped() {
        let mut h = setup(4);
        let mut raw = data(0).encode().to_vec();
        raw[7] ^= 0x10;

        h.receiver.handle(&raw);
        h.receiver.handle(&raw[..4]);

        assert_eq!(h.clock.last_event(), Status::UnspecifiedError);
        assert!(h.acks().is_empty());
        assert!(h.inbound.is_empty());
    }

    #[test]
    fn full_inbound_rejects_data() {
        let mut h = setup(1);
        h.rx(&data(0));
        h.rx(&data(1));

        assert_eq!(h.clock.last_event(), Status::InsufficientBufferSpace);
        assert_eq!(h.acks(), vec![0]);

        // Sender retry succeeds once there is room
        assert_eq!(h.delivered(), vec![0]);
        h.rx(&data(1));
        assert_eq!(h.delivered(), vec![1]);
    }

    #[test]
    fn reorder_run_needs_room() {
        let mut h = setup(2);
        h.rx(&data(1));
        h.rx(&data(2));
        h.inbound.try_push(Frame::data(ME, OTHER, 0, &[])).unwrap();

        // Frame 0 would release three frames into one free slot
        h.rx(&data(0));
        assert_eq!(h.clock.last_event(), Status::InsufficientBufferSpace);
        assert_eq!(h.acks(), vec![1, 2]);
        assert_eq!(h.inbound.len(), 1);
    }

    #[test]
    fn ack_marks_head() {
        let mut h = setup(4);
        h.outbound.submit(PEER, ME, &[1, 2]).unwrap();
        let head = h.outbound.head().unwrap();
        h.outbound.mark_sent();

        // Wrong sequence and wrong addressee are ignored
        h.rx(&Frame::ack(&Frame::data(PEER, ME, 9, &[])));
        h.rx(&Frame::ack(&Frame::data(PEER, OTHER, 0, &[])));
        assert!(!h.outbound.head().unwrap().acked);

        h.rx(&Frame::ack(&head.frame));
        assert!(h.outbound.head().unwrap().acked);
        assert!(h.inbound.is_empty());
    }

    #[test]
    fn beacon_syncs_clock() {
        let mut h = setup(4);
        h.timer.set_ms(1000);

        h.rx(&Frame::beacon(PEER, 0, 5000));
        assert_eq!(h.clock.now(), 5000);

        // Repeated sequence is treated as a duplicate
        h.rx(&Frame::beacon(PEER, 0, 9000));
        assert_eq!(h.clock.now(), 5000);

        // Older time never moves the clock back
        h.rx(&Frame::beacon(OTHER, 0, 2000));
        assert_eq!(h.clock.now(), 5000);

        h.clock.set_beacon_interval(None);
        h.rx(&Frame::beacon(PEER, 1, 9000));
        assert_eq!(h.clock.now(), 5000);

        assert!(h.inbound.is_empty());
        assert!(h.acks().is_empty());
    }

    #[test]
    fn broadcast_delivered_without_ack() {
        let mut h = setup(4);
        let b = |seq| Frame::data(Address::BROADCAST, PEER, seq, &[1]);

        h.rx(&b(4));
        h.rx(&b(4));
        h.rx(&b(6));
        h.rx(&b(5));
        h.rx(&b(5));

        // Late arrivals are delivered as they arrive, repeats are not
        assert_eq!(h.delivered(), vec![4, 6, 5]);
        assert!(h.acks().is_empty());
    }

    #[test]
    fn broadcast_after_beacon_delivered() {
        let mut h = setup(4);

        h.rx(&Frame::beacon(PEER, 7, 100));
        h.rx(&Frame::data(Address::BROADCAST, PEER, 0, &[1]));
        h.rx(&Frame::beacon(PEER, 8, 200));
        h.rx(&Frame::data(Address::BROADCAST, PEER, 1, &[2]));

        assert_eq!(h.delivered(), vec![0, 1]);
    }

    #[test]
    fn restarted_peer_delivered() {
        let mut h = setup(8);
        for seq in 0..3 {
            h.rx(&data(seq));
        }
        assert_eq!(h.delivered(), vec![0, 1, 2]);

        // Sender gave up on seq 2 and started again from 0
        h.rx(&data(0));
        assert_eq!(h.delivered(), vec![0]);
        assert_eq!(h.acks(), vec![0, 1, 2, 0]);

        let mut retry = data(0);
        retry.retry = true;
        h.rx(&retry);
        assert!(h.delivered().is_empty());
    }

    #[test]
    fn run_handles_until_stopped() {
        let Harness { mut receiver, inbound, outbound, .. } = setup(4);
        let channel = receiver.channel.clone();
        let running = Arc::new(AtomicBool::new(true));
        let r = running.clone();

        let handle = std::thread::spawn(move || receiver.run(&r));

        channel.inject(&data(0).encode());
        assert_eq!(inbound.pop_timeout(Duration::from_secs(1)).map(|f| f.seq), Some(0));

        running.store(false, Ordering::SeqCst);
        handle.join().unwrap();
        assert!(outbound.has_ack());
    }

    #[test]
    fn other_stations_traffic_ignored() {
        let mut h = setup(4);
        h.rx(&Frame::data(OTHER, PEER, 0, &[1]));
        h.rx(&Frame::ack(&Frame::data(PEER, OTHER, 0, &[])));

        assert!(h.inbound.is_empty());
        assert!(h.acks().is_empty());
        assert_eq!(h.clock.last_event(), Status::Success);
    }
}
