//! Infrastructure layer for Dagon.
//!
//! Contains the implementations of the ports defined in `dagon-core`: the
//! local and secure-shell command channels, one sandbox driver per backend,
//! the engine configuration loader and the workflow definition loader.

pub mod backend;
pub mod channel;
pub mod config;
pub mod definition;

#[cfg(test)]
pub(crate) mod testing;
