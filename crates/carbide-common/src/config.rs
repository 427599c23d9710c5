//! Configuration types for Carbide
//!
//! This module defines the tuning knobs of the space-management core.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Align a value up to the nearest multiple of `unit` (a power of two)
#[inline]
#[must_use]
pub const fn align_up(value: u64, unit: u64) -> u64 {
    (value + unit - 1) & !(unit - 1)
}

/// Align a value down to the nearest multiple of `unit` (a power of two)
#[inline]
#[must_use]
pub const fn align_down(value: u64, unit: u64) -> u64 {
    value & !(unit - 1)
}

/// Check whether a value is a multiple of `unit` (a power of two)
#[inline]
#[must_use]
pub const fn is_aligned(value: u64, unit: u64) -> bool {
    value & (unit - 1) == 0
}

/// Tuning parameters for the space-management core of one device
///
/// All sizes are in bytes. The allocation unit is the granularity the
/// allocator hands out space at; the block size is the granularity data
/// is padded, checksummed and written at. The allocation unit is always
/// a multiple of the block size.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceConfig {
    /// Allocation granularity (power of two, >= block_size)
    pub alloc_unit: u64,
    /// I/O and checksum granularity (power of two)
    pub block_size: u64,
    /// Maximum physical footprint of a single blob (multiple of alloc_unit)
    pub max_blob_size: u64,
    /// Writes smaller than this are routed through the deferred path
    pub prefer_deferred_size: u64,
}

impl SpaceConfig {
    /// Default I/O block size (4 KiB)
    pub const DEFAULT_BLOCK_SIZE: u64 = 4096;

    /// Default allocation unit (4 KiB)
    pub const DEFAULT_ALLOC_UNIT: u64 = 4096;

    /// Default maximum blob size (64 KiB)
    pub const DEFAULT_MAX_BLOB_SIZE: u64 = 64 * 1024;

    /// Default deferred-write threshold (32 KiB)
    pub const DEFAULT_PREFER_DEFERRED_SIZE: u64 = 32 * 1024;

    /// Width of the per-blob unused bitmask; caps max_blob_size / block_size
    pub const UNUSED_MASK_BITS: u64 = 64;

    /// Create a validated configuration
    pub fn new(
        alloc_unit: u64,
        block_size: u64,
        max_blob_size: u64,
        prefer_deferred_size: u64,
    ) -> Result<Self> {
        let config = Self {
            alloc_unit,
            block_size,
            max_blob_size,
            prefer_deferred_size,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration consistency
    pub fn validate(&self) -> Result<()> {
        if !self.block_size.is_power_of_two() {
            return Err(Error::config(format!(
                "block_size {} is not a power of two",
                self.block_size
            )));
        }
        if !self.alloc_unit.is_power_of_two() {
            return Err(Error::config(format!(
                "alloc_unit {} is not a power of two",
                self.alloc_unit
            )));
        }
        if self.alloc_unit < self.block_size {
            return Err(Error::config(format!(
                "alloc_unit {} is below block_size {}",
                self.alloc_unit, self.block_size
            )));
        }
        if self.max_blob_size == 0 || !is_aligned(self.max_blob_size, self.alloc_unit) {
            return Err(Error::config(format!(
                "max_blob_size {} is not a multiple of alloc_unit {}",
                self.max_blob_size, self.alloc_unit
            )));
        }
        if self.max_blob_size / self.block_size > Self::UNUSED_MASK_BITS {
            return Err(Error::config(format!(
                "max_blob_size {} exceeds {} blocks of {}",
                self.max_blob_size,
                Self::UNUSED_MASK_BITS,
                self.block_size
            )));
        }
        if self.prefer_deferred_size > self.max_blob_size {
            return Err(Error::config(format!(
                "prefer_deferred_size {} exceeds max_blob_size {}",
                self.prefer_deferred_size, self.max_blob_size
            )));
        }
        Ok(())
    }

    /// Round a length up to allocation-unit granularity
    #[inline]
    #[must_use]
    pub const fn round_to_alloc_unit(&self, length: u64) -> u64 {
        align_up(length, self.alloc_unit)
    }

    /// Round a length up to block granularity
    #[inline]
    #[must_use]
    pub const fn round_to_block(&self, length: u64) -> u64 {
        align_up(length, self.block_size)
    }
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            alloc_unit: Self::DEFAULT_ALLOC_UNIT,
            block_size: Self::DEFAULT_BLOCK_SIZE,
            max_blob_size: Self::DEFAULT_MAX_BLOB_SIZE,
            prefer_deferred_size: Self::DEFAULT_PREFER_DEFERRED_SIZE,
        }
    }
}
