//! # Core Runtime Module
//!
//! Provides foundational runtime infrastructure for the sync engine:
//! - Logging and tracing infrastructure
//! - Configuration management
//! - Event bus system
//!
//! ## Overview
//!
//! Other crates depend on this one for the capability bundle they are
//! constructed from (`CoreConfig`), the logging conventions, and the typed
//! broadcast channel through which the engine reports what it did.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
