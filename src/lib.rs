//! ICMP echo engine for keep-alive style liveness probes.
//!
//! [`EchoEngine`] owns one raw IPv4 ICMP socket and multiplexes any number of
//! concurrent [`EchoEngine::ping`] calls over it, correlating replies by ICMP
//! identifier. The wire format lives in [`icmp::packet`].

pub mod config;
pub mod dns;
pub mod engine;
pub mod icmp;

pub use config::EngineConfig;
pub use engine::EchoEngine;
pub use icmp::{EngineError, Outcome, Transport};
