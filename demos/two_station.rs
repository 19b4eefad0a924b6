//! Two station DCF MAC example application
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use rand::Rng;
use structopt::StructOpt;

use dot11_mac::prelude::*;
use dot11_mac::channel::mock::MockMedium;


#[derive(Debug, StructOpt)]
struct Options {

    #[structopt(long, default_value="1")]
    /// Address of the sending station
    pub sender: u16,

    #[structopt(long, default_value="2")]
    /// Address of the receiving station
    pub receiver: u16,

    #[structopt(long, default_value="2s", parse(try_from_str = humantime::parse_duration))]
    /// Period between transmissions
    pub period: Duration,

    #[structopt(long, default_value="64")]
    /// Payload length in bytes
    pub length: usize,

    #[structopt(long, default_value="0")]
    /// Channel airtime per byte in ms
    pub airtime: u64,

    #[structopt(long)]
    /// Broadcast instead of addressing the receiver
    pub broadcast: bool,

    #[structopt(long)]
    /// Use the full collision window for backoff
    pub fixed_slots: bool,

    #[structopt(long)]
    /// Enable station diagnostics
    pub debug: bool,

    #[structopt(long, default_value = "info")]
    /// Configure log level
    pub log_level: simplelog::LevelFilter,
}


fn main() -> anyhow::Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    // Bind exit handler
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    }).expect("Error setting Ctrl-C handler");

    // Load options
    let opts = Options::from_args();

    // Initialise logging
    let _ = simplelog::SimpleLogger::init(opts.log_level, simplelog::Config::default());

    info!("Starting two_station");

    let config = MacConfig {
        debug: opts.debug,
        fixed_slot_selection: opts.fixed_slots,
        ..Default::default()
    };

    debug!("Initialising medium");
    let medium = MockMedium::with_airtime(SystemTimer::new(), opts.airtime);

    let a = LinkLayer::new(Address(opts.sender), medium.attach(), config.clone())
        .map_err(|e| anyhow::anyhow!("Error initialising sender: {}", e))?;
    let b = LinkLayer::new(Address(opts.receiver), medium.attach(), config)
        .map_err(|e| anyhow::anyhow!("Error initialising receiver: {}", e))?;

    let dest = match opts.broadcast {
        true => Address::BROADCAST,
        false => b.address(),
    };

    debug!("Starting loop");

    let mut rng = rand::thread_rng();
    let mut last_tx: Option<Instant> = None;
    let mut last_status = a.status();

    while running.load(Ordering::SeqCst) {

        // Periodic transmit
        if last_tx.map(|t| t.elapsed() >= opts.period).unwrap_or(true) {
            let mut data = vec![0u8; opts.length];
            rng.fill(&mut data[..]);

            match a.send(dest, &data) {
                Ok(n) => info!("TX {} bytes to {}", n, dest),
                Err(e) => warn!("TX rejected: {}", e),
            }

            last_tx = Some(Instant::now());
        }

        // Check for RX'd payloads
        if let Some(t) = b.recv_timeout(Duration::from_millis(50)) {
            info!("RX {} bytes from {}: {:02x?}", t.payload.len(), t.source, &t.payload[..t.payload.len().min(8)]);
        }

        let status = a.status();
        if status != last_status {
            info!("Sender status: {}", status);
            last_status = status;
        }

        thread::sleep(Duration::from_millis(10));
    }

    info!("Exiting, sender settings:\n{}", a.settings());

    Ok(())
}
