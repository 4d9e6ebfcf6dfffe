//! # lib_common
//!
//! Shared plumbing for the market history tooling. Every module sits behind a
//! cargo feature so binaries only pull in the drivers they actually use.
//!
//! - **`configs`**: `.env` loading and tolerant numeric parsing of env knobs.
//! - **`connections`**: pooled PostgreSQL access.
//! - **`loggers`**: `tracing` subscriber setup with console and rolling JSON files.
//! - **`retrieve`**: a raw HTTP client that surfaces status, headers and body.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Environment-driven configuration helpers.
#[cfg(feature = "configs")]
pub mod configs;

/// Persistent connections to external services.
#[cfg(feature = "connections")]
pub mod connections;

/// Logging setup built on `tracing`.
#[cfg(feature = "loggers")]
pub mod loggers;

/// HTTP retrieval clients.
#[cfg(feature = "retrieve")]
pub mod retrieve;
