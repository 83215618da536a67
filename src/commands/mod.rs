//! CLI command implementations for metric-collector.
//!
//! The `agent` and `server` subcommands run the long-lived services in
//! [`crate::agent`] and [`crate::server`]; this module holds the one-shot
//! commands:
//! - `keygen`: RSA key pair generation

pub mod keygen;

pub use keygen::command_keygen;
