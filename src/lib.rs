//! Offload agent: a worker that polls a task broker, prepares each task's
//! files, runs it on a capability-specific executor and reports the result.

pub mod broker;
pub mod config;
pub mod engine;
pub mod error;
pub mod exec;
pub mod fetch;
pub mod ollama;
pub mod session;
pub mod sysinfo;
pub mod workdir;
pub mod ws;
