//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod ambiguity;
pub mod decompose;
pub mod quality;
pub mod retry;
pub mod status;
pub mod targets;
pub mod types;
