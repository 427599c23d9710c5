//! Carbide Common - Shared types and utilities
//!
//! This crate provides the error definitions, checksum helpers and
//! configuration types used across the Carbide storage engine.

pub mod checksum;
pub mod config;
pub mod error;

pub use checksum::{Checksum, ChecksumCalculator};
pub use config::{SpaceConfig, align_down, align_up, is_aligned};
pub use error::{Error, Result};
