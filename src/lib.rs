//! High-resolution CPU and scheduling-delay profiler for Linux.
//!
//! A sampling agent reads per-process counters from `/proc` and per-task
//! delay accounting from the kernel's taskstats netlink interface, keeps a
//! bounded in-memory history, and serves sample windows to local clients
//! over a loopback endpoint. Clients difference consecutive samples and
//! summarize the deltas with high-dynamic-range histograms.

pub mod client;
pub mod config;
pub mod error;
pub mod export;
pub mod identity;
pub mod model;
pub mod proc;
pub mod ring;
pub mod sampler;
pub mod server;
pub mod stats;
pub mod taskstats;
