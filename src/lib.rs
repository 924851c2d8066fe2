// ABOUTME: Library root for rollout - exposes public types for testing.
// ABOUTME: The main binary is in main.rs.

pub mod build;
pub mod cancel;
pub mod config;
pub mod descriptor;
pub mod diagnostics;
pub mod error;
pub mod executor;
pub mod notify;
pub mod orchestrator;
pub mod output;
pub mod pipeline;
pub mod ssh;
pub mod status;
pub mod types;
