//! Data model of the simulated host.
//!
//! - `price_feed`: random-walk bid/ask generator driving each instance's ticks.
//! - `host_command`: command codes the simulated instances understand.
pub mod host_command;
pub mod price_feed;
