//! Core types and utilities for the index price pipeline
//!
//! This crate provides shared types used across all components:
//! - Instrument, price and bar definitions
//! - Bucket alignment and averaging
//! - Pipeline configuration
//! - Error types

pub mod types;
pub mod config;
pub mod errors;

pub use types::*;
pub use config::*;
pub use errors::*;
