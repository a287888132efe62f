//! Observability for Dagon: structured logging setup.

pub mod tracing_setup;
