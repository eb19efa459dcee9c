//! Core library for the `stress-tester` CLI.
//!
//! Drives concurrent synthetic traffic against a gateway-fronted
//! microservice ecosystem (orders, payments, products). The binary wires
//! these modules together; integration tests drive them directly.

pub mod auth;
pub mod client;
pub mod dispatch;
pub mod flow;
pub mod metrics;
pub mod scenarios;
pub mod scheduler;
pub mod types;
