//! Core types, wire protocol, codec, config, and errors for pixel-fleet.

pub mod client_state;
pub mod codec;
pub mod config;
pub mod error;
pub mod protocol;
pub mod throttle;
pub mod types;
