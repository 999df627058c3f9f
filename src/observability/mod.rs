//! Logging setup for the library and the CLI.

pub mod tracing;
