//! forja: a budgeted, guarded control plane for multi-agent code generation.
//!
//! A job moves through PLANNING → FE_EXEC → BE_EXEC → VALIDATING → DONE, one
//! agent call per step. Every call passes the guardrail pipeline, is charged
//! to the job's [`ledger`], and is checkpointed so a [`worker`] can resume it
//! from the [`queue`] after a crash.

pub mod anthropic;
pub mod artifacts;
pub mod cli;
pub mod config;
pub mod error;
pub mod guardrails;
pub mod history;
pub mod invoker;
pub mod ledger;
pub mod orchestrator;
pub mod prompts;
pub mod queue;
pub mod rate_limiter;
pub mod review;
pub mod router;
pub mod state_machine;
pub mod telemetry;
pub mod ui;
pub mod worker;

#[cfg(test)]
mod test_support;
