//! FlowProbe - Workflow debugging harness: execution ledger, LLM response cache,
//! database snapshots and scenario replay

pub mod cache;
pub mod cli;
pub mod clock;
pub mod config;
pub mod environment;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod persist;
pub mod scenario;
pub mod store;
