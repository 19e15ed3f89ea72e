//! Domain types: configuration, correlation, destinations, exchanges and the
//! pending-request registry.

pub mod config;
pub mod correlation;
pub mod destination;
pub mod error;
pub mod exchange;
pub mod pending;
