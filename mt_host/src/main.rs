//! Simulated trading host: drives the bridge the way the embedded terminal does.
//!
//! It loads connection profiles from a JSON file, constructs one `Registry`, and runs:
//!
//! - one thread per algorithm instance (handles `1..=N`): attach, publish a random-walk
//!   quote every tick, answer commands from the mailbox, detach on exit;
//! - one remote driver that connects through the loopback transport, pings, and cycles
//!   through the host commands against every attached handle.
//!
//! Usage example (CLI):
//! ```bash
//! mt_host --profiles ./profiles.json --profile default --instances 4 --commands 20
//! ```
//!
//! The profile file holds an array such as `[{"name": "default", "port": 8222}]`.
#![warn(missing_docs)]
mod args;
mod host;
mod model;
mod remote;

use crate::args::Args;
use crate::model::price_feed::PriceFeed;
use crate::remote::RemoteDriver;
use clap::Parser;
use log::{error, info};
use mt_common::{BridgeError, JsonProfileStore, Result};
use mt_service::Registry;
use mt_service::transport::LoopbackHub;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::thread;
use std::time::Duration;

/// Typical EURUSD spread used by every simulated feed.
const DEFAULT_SPREAD: f64 = 0.0002;

fn main() -> Result<(), BridgeError> {
    init_logger();
    let args = Args::parse();
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            info!("Ctrl+C received. Shutting down host...");
            shutdown.store(true, Ordering::SeqCst);
        })
        .expect("Error setting Ctrl+C handler");
    }

    let store = JsonProfileStore::from_path(args.profiles.trim())?;
    info!("Profiles: {:?}", store.names());

    let hub = LoopbackHub::new();
    let registry = Arc::new(Registry::new(store, hub.clone())?);
    let tick = Duration::from_millis(args.tick_ms);

    let mut instances = Vec::with_capacity(usize::from(args.instances));
    for i in 1..=args.instances {
        let handle = i32::from(i);
        let registry = Arc::clone(&registry);
        let shutdown = Arc::clone(&shutdown);
        let profile = args.profile.clone();
        let feed = PriceFeed::new(&args.symbol, 1.1 + f64::from(i) * 0.001, DEFAULT_SPREAD);
        let worker = thread::Builder::new()
            .name(format!("instance-{}", handle))
            .spawn(move || {
                if let Err(e) = host::run_instance(registry, handle, &profile, feed, tick, shutdown) {
                    error!("Instance {} failed: {}", handle, e);
                }
            })?;
        instances.push(worker);
    }

    let outcome = RemoteDriver::connect(&hub, &args.profile, &shutdown).and_then(|driver| {
        driver.start_ping_thread(Arc::clone(&shutdown));
        driver.run(args.commands, tick, &shutdown)
    });
    if let Err(e) = &outcome {
        error!("Remote driver failed: {}", e);
    }

    shutdown.store(true, Ordering::SeqCst);
    for worker in instances {
        if worker.join().is_err() {
            error!("An instance thread panicked");
        }
    }
    registry.shutdown();
    info!("Host stopped. Sessions left: {}", registry.handles().len());
    outcome
}

fn init_logger() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();
}
