//! Admission - Reserve/Complete admission control for metered resources
//!
//! Callers reserve capacity against named limits before doing work and
//! report actual usage afterwards. Two engines implement the protocol: an
//! in-process memory engine and a durable engine that keeps every limit as
//! an account in a double-entry ledger. A fairness scheduler and a
//! request-coalescing batcher sit on the client side.

pub mod api;
pub mod backend;
pub mod config;
pub mod error;
pub mod grpc;
pub mod ledger;
pub mod ratelimit;
