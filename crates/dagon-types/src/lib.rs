//! Shared domain types for Dagon.
//!
//! This crate contains the data model used across the engine: backend and
//! placement configuration, task results, sandbox descriptions, checkpoint
//! records, engine configuration and the workflow definition file format.
//!
//! Zero infrastructure dependencies -- only serde and chrono.

pub mod backend;
pub mod checkpoint;
pub mod config;
pub mod sandbox;
pub mod task;
pub mod workflow;
