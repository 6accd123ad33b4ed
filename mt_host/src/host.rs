//! One simulated algorithm instance.
//!
//! Mirrors what the embedded host does per instance: attach once, then on every tick
//! publish a quote, poll the mailbox, execute a pending command, and post its response.
//! The instance sleeps between ticks but wakes early when its sink reports a command.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{select, unbounded};
use log::{debug, info, warn};
use mt_common::{BridgeError, NO_COMMAND, Response, Result};
use mt_service::{CommandSink, Registry};
use serde_json::{Value, json};

use crate::model::host_command::HostCommand;
use crate::model::price_feed::PriceFeed;

/// Runs one instance until `shutdown` is raised or its session disappears.
pub fn run_instance(
    registry: Arc<Registry>,
    handle: i32,
    profile: &str,
    mut feed: PriceFeed,
    tick: Duration,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let (wake_tx, wake_rx) = unbounded::<i32>();
    let sink: Arc<dyn CommandSink> = Arc::new(move |h: i32| {
        let _ = wake_tx.send(h);
    });

    let quote = feed.next_quote();
    registry.attach(handle, profile, &quote.symbol, quote.bid, quote.ask, sink)?;
    info!("Instance {} attached to '{}'", handle, profile);

    while !shutdown.load(Ordering::Relaxed) {
        select! {
            recv(wake_rx) -> msg => {
                // The sink is released on detach; a closed channel means the session is gone.
                if msg.is_err() {
                    warn!("Instance {}: session is gone, stopping", handle);
                    return Ok(());
                }
                debug!("Instance {}: woken by a command", handle);
            }
            default(tick) => {
                let quote = feed.next_quote();
                match registry.publish_quote(handle, &quote.symbol, quote.bid, quote.ask) {
                    Ok(()) => {}
                    Err(BridgeError::UnknownHandle(_)) => {
                        warn!("Instance {}: session is gone, stopping", handle);
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        match handle_pending(&registry, handle, &mut feed) {
            Ok(_) => {}
            Err(BridgeError::UnknownHandle(_)) => {
                warn!("Instance {}: session is gone, stopping", handle);
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }

    registry.detach(handle);
    info!("Instance {} detached", handle);
    Ok(())
}

/// Executes the command pending on `handle`, if any. Returns whether one was handled.
pub fn handle_pending(registry: &Registry, handle: i32, feed: &mut PriceFeed) -> Result<bool> {
    let code = registry.poll_command_type(handle);
    if code == NO_COMMAND {
        return Ok(false);
    }

    let payload = match HostCommand::try_from(code) {
        Ok(HostCommand::GetQuote) => serde_json::to_value(feed.current())?,
        Ok(HostCommand::Echo) => Value::Array(
            (0..)
                .map_while(|i| registry.fetch_command_param(handle, i))
                .collect(),
        ),
        Ok(HostCommand::SetSpread) => match registry
            .fetch_command_param(handle, 0)
            .and_then(|v| v.as_f64())
        {
            Some(spread) => {
                feed.set_spread(spread);
                json!(true)
            }
            None => json!({ "error": "spread parameter missing or not a number" }),
        },
        Err(e) => json!({ "error": e.to_string() }),
    };

    debug!("Instance {}: command {} -> {}", handle, code, payload);
    registry.post_response(handle, Response::new(payload))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mt_common::{Command, ConnectionProfile, MemoryProfileStore};
    use mt_service::transport::LoopbackHub;

    fn attached() -> Registry {
        let store = MemoryProfileStore::new(vec![ConnectionProfile::new("sim", 1)]).unwrap();
        let registry = Registry::new(store, LoopbackHub::new()).unwrap();
        let sink: Arc<dyn CommandSink> = Arc::new(|_: i32| {});
        registry.attach(1, "sim", "EURUSD", 1.1, 1.2, sink).unwrap();
        registry
    }

    fn deliver(registry: &Registry, command: Command) {
        registry.session(1).unwrap().deliver_command(command).unwrap();
    }

    #[test]
    fn idle_mailbox_is_left_alone() {
        let registry = attached();
        let mut feed = PriceFeed::new("EURUSD", 1.1, 0.0002);
        assert!(!handle_pending(&registry, 1, &mut feed).unwrap());
    }

    #[test]
    fn echo_returns_all_parameters() {
        let registry = attached();
        let mut feed = PriceFeed::new("EURUSD", 1.1, 0.0002);
        deliver(&registry, Command::new(2, vec![json!(10), json!("x")]));

        assert!(handle_pending(&registry, 1, &mut feed).unwrap());
        let response = registry.session(1).unwrap().take_response().unwrap();
        assert_eq!(response.payload, json!([10, "x"]));
        assert_eq!(registry.poll_command_type(1), NO_COMMAND);
    }

    #[test]
    fn set_spread_updates_feed() {
        let registry = attached();
        let mut feed = PriceFeed::new("EURUSD", 1.1, 0.0002);
        deliver(&registry, Command::new(3, vec![json!(0.001)]));

        handle_pending(&registry, 1, &mut feed).unwrap();
        assert_eq!(feed.spread(), 0.001);
        let response = registry.session(1).unwrap().take_response().unwrap();
        assert_eq!(response.payload, json!(true));
    }

    #[test]
    fn unknown_command_gets_an_error_payload() {
        let registry = attached();
        let mut feed = PriceFeed::new("EURUSD", 1.1, 0.0002);
        deliver(&registry, Command::new(42, Vec::new()));

        handle_pending(&registry, 1, &mut feed).unwrap();
        let response = registry.session(1).unwrap().take_response().unwrap();
        assert!(response.payload.get("error").is_some());
    }

    #[test]
    fn detached_instance_sees_empty_mailbox() {
        let registry = attached();
        let mut feed = PriceFeed::new("EURUSD", 1.1, 0.0002);
        deliver(&registry, Command::new(1, Vec::new()));
        let session = registry.session(1).unwrap();
        registry.detach(1);

        assert_eq!(registry.poll_command_type(1), NO_COMMAND);
        assert!(!handle_pending(&registry, 1, &mut feed).unwrap());
        assert!(session.is_closed());
    }
}
