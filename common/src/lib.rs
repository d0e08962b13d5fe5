//! Common types and utilities shared across the llamactl crates.
//!
//! This crate provides the run configuration for a llama.cpp server, the
//! command-line builder derived from it, and platform helpers for locating
//! backend installs and wiring library search paths.
//!
//! # Architecture
//!
//! The `common` crate sits at the bottom of the dependency hierarchy:
//! - Has NO dependencies on other workspace crates
//! - Normalizes loosely-typed user configuration exactly once, at the boundary
//! - Everything downstream consumes the typed [`LlamacppConfig`]

pub mod args;
pub mod config;
pub mod errors;
pub mod platform;

pub use args::ArgumentBuilder;
pub use config::LlamacppConfig;
pub use errors::{ConfigError, Result};
