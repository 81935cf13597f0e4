//! agentcore: run coding-agent jobs against cached repository clones.
//!
//! A job is submitted through the [`orchestrator`], persisted by [`jobs`] in
//! the dual-backend [`store`], and executed by the [`runner`]: resolve a
//! [`profiles`] entry, acquire the repository through [`repos`] (guarded by
//! [`lock`]), run the agent subprocess, then record the outcome. [`server`]
//! exposes the REST API and [`client`] talks to it.

pub mod client;
pub mod config;
pub mod drain;
pub mod errors;
pub mod jobs;
pub mod lock;
pub mod orchestrator;
pub mod pr;
pub mod profiles;
pub mod repos;
pub mod runner;
pub mod server;
pub mod store;
pub mod telemetry;
