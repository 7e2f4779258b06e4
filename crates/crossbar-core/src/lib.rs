//! Core types for the crossbar fabric: the wire frame codec, addressing,
//! runtime configuration, and the two line-oriented text formats consumed
//! at startup (firewall rules, per-node traffic scripts).

pub mod config;
pub mod frame;
pub mod net;
pub mod rules;
pub mod script;
