//! Subscribe to sensor readings over MQTT and persist each one into a
//! DuckDB table.
//!
//! The binary in `main.rs` only loads configuration and hands over to
//! `server::run()`; the modules below hold the actual work so they can be
//! tested without a broker.
pub mod config;
pub mod handlers;
pub mod metrics;
pub mod mqtt;
pub mod reading;
pub mod recorder;
pub mod server;
pub mod store;
