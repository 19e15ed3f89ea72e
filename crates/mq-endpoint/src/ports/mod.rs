//! Ports: the traits the endpoint depends on.

pub mod outbound;
