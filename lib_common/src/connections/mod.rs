//! # Connections Module
//!
//! This module handles persistent connections to external services.

/// Module for PostgreSQL connection pooling and health checks.
pub mod db_postgres;

pub use db_postgres::{Database, DbError};
