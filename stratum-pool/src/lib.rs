//! Stratum mining pool engine.
//!
//! Accepts miner connections over the Stratum line protocol, hands out jobs
//! built from a node's block template, and validates the shares miners
//! submit against per-connection and per-block targets. Found blocks are
//! passed back to the node.

pub mod algorithm;
pub mod auth;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod job_manager;
pub mod merkle;
pub mod node;
pub mod pool;
pub mod stratum;
pub mod template;
pub mod tracing;
pub mod types;
pub mod u256;
pub mod vardiff;
