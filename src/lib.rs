//! Library crate for shadow-scan exposing the scan engine and its HTTP surface.
pub mod clock;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod journal;
pub mod logging;
pub mod ports;
pub mod progress;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod types;
