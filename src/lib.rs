//! metric-collector: a telemetry agent and the collector it reports to.
//!
//! The agent polls process and host statistics and posts them as gauges and
//! counters. The collector ingests them through a middleware chain that
//! checks the sender subnet, verifies signatures, decrypts and decompresses,
//! then merges each value into one of three storage backends.

pub mod agent;
pub mod cli;
pub mod codec;
pub mod commands;
pub mod config;
pub mod handlers;
pub mod metric;
pub mod metrics;
pub mod restorer;
pub mod retry;
pub mod server;
pub mod snapshot;
pub mod state;
pub mod storage;
pub mod system;
