//! Labgate - publishes per-student lab environments behind an nginx reverse proxy
//!
//! This library provides:
//! - Route records that round-trip through a metadata comment in the proxy config
//! - A route store whose only durable state is the generated nginx configuration
//! - Port allocation by probing localhost within a configured range
//! - Optional self-signed wildcard certificates per lab
//! - Lab provisioning through compose projects, one per student and lab

pub mod certs;
pub mod compose;
pub mod config;
pub mod error;
pub mod labs;
pub mod lock;
pub mod ports;
pub mod provision;
pub mod reload;
pub mod route;
pub mod store;
pub mod synth;

pub use error::{Error, Result};
