//!
//! Common types and utilities shared by the bridge service and the host.
//!
//! This crate aggregates:
//! - `error`: unified error type `BridgeError` used across the workspace.
//! - `result`: handy `Result<T, BridgeError>` alias.
//! - `quote`: the last-write-wins market quote published by the host.
//! - `command`: remote commands and the responses the host posts back.
//! - `profile`: named connection profiles and the stores that resolve them.
#![warn(missing_docs)]
pub mod command;
pub mod error;
pub mod profile;
pub mod quote;
pub mod result;

pub use command::{Command, NO_COMMAND, Response};
pub use error::BridgeError;
pub use profile::{ConnectionProfile, JsonProfileStore, MemoryProfileStore, ProfileStore};
pub use quote::Quote;
pub use result::Result;
