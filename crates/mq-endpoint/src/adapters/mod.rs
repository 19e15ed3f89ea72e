//! Adapters connecting the outbound ports to concrete transports.

pub mod broker;
