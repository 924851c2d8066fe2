// ABOUTME: Command module aggregator for the rollout CLI.
// ABOUTME: Re-exports the deploy, scale, rollback, remove, status and health handlers.

mod context;
mod deploy;
mod inspect;

pub use deploy::{deploy, rollback, scale};
pub use inspect::{health, remove, status};
