//! Library crate for edge-scan-rs exposing reusable modules.
pub mod candidates;
pub mod config;
pub mod error;
pub mod geo;
pub mod ports;
pub mod prober;
pub mod ranker;
pub mod regions;
pub mod resolver;
pub mod scheduler;
pub mod server;
pub mod types;
