//! Evidence-gated orchestrator for an untrusted coding-agent executor.
//!
//! The executor's own claims are never trusted: a task is COMPLETE only when
//! independently verified files exist on disk. The architecture enforces a
//! strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (status derivation, quality
//!   checks, decomposition, ambiguity gate). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem evidence, process
//!   execution, config and session persistence). Isolated to enable mocking in
//!   tests.
//!
//! Executor wrappers ([`review`], [`chunking`], [`orchestrator::gate`]) layer
//! on the [`io::executor::Executor`] trait, and [`orchestrator`] composes them
//! with the [`locks`] manager into the task pipeline behind the CLI.

pub mod chunking;
pub mod core;
pub mod events;
pub mod exit_codes;
pub mod io;
pub mod locks;
pub mod logging;
pub mod orchestrator;
pub mod review;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
