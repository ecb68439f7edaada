//! Scenario harness for epochguard.
//!
//! This crate provides:
//! - Built-in scenarios: small programs with a known detection outcome
//! - A runner that executes them and judges each run
//! - Structured evidence: a JSONL log, its validator, and a SHA-256
//!   artifact index

#![forbid(unsafe_code)]

pub mod runner;
pub mod scenarios;
pub mod structured_log;

pub use runner::{HarnessError, RunReport, ScenarioRunner};
pub use scenarios::{Expectation, Scenario, ScenarioResult};
