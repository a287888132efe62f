//! Core engine for Dagon.
//!
//! Defines the ports the engine consumes (`CommandChannel`, `SandboxDriver`)
//! and the logic built on top of them: the per-task state machine, the
//! cross-task reference staging protocol and the DAG workflow engine with
//! checkpoint/resume. Concrete channels and backend drivers live in
//! `dagon-infra`.

pub mod channel;
pub mod escape;
pub mod reference;
pub mod sandbox;
pub mod task;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;
