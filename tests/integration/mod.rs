//! Integration test suite for foreman.
//!
//! These tests drive the factory against real git repositories in temporary
//! directories, with a scripted provider standing in for the agent CLI.
//!
//! # Test Categories
//!
//! - `factory_e2e`: dispatch, retry, escalation, abort and the event stream
//! - `judge_scenarios`: judge verdicts deciding task outcomes
//! - `session_recovery`: crash recovery, resume and out-of-process abort
//!
//! # CI Compatibility
//!
//! No agent binary is invoked, so these tests are safe to run in CI. They
//! do need `git` and `sh` on the PATH.

mod fixtures;

mod factory_e2e;
mod judge_scenarios;
mod session_recovery;
