//! Kirosu swarm hub and worker agent.
//!
//! This crate provides the hub RPC server, the worker agent poll/lease/
//! execute/ack loop, and the client used by submitters and workers to reach
//! the hub over line-delimited JSON-RPC.

pub mod agent;
pub mod client;
pub mod config;
pub mod hub;
pub mod provider;
pub mod splitter;
pub mod store;
