//! Broker protocol: transport handle, wire types, and progress reporting.

pub mod client;
pub mod progress;
pub mod protocol;

pub use client::BrokerClient;
pub use progress::{BrokerProgress, NoProgress, ProgressSink, STAGE_RUNNING};
pub use protocol::*;
