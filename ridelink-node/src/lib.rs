//! # ridelink-node: ridelink host process
//!
//! Runs one end of a ridelink link from a TOML config and an operator
//! console on stdin.
//!
//! ## Roles
//!
//! - **Source**: pushes console lines through the self-healing pipe and
//!   tracks the session status (stream or radio transport).
//! - **Display**: accepts the source on the listener, logs inbound frames
//!   and sends console lines back over the reverse channel.

pub mod config;
pub mod console;
pub mod service;
