//! Carbide Storage Engine - space management and write path
//!
//! This crate implements the physical space-management core of the
//! Carbide storage engine:
//! - Bitmap free-space allocation with a two-level search index
//! - Blob and extent-map bookkeeping for one object
//! - The write path: punch hole, blob reuse, allocation, I/O scheduling
//! - Divertor seams for physical reads and writes

pub mod alloc;
pub mod bitmap;
pub mod blob;
pub mod extent;
pub mod io;
pub mod writer;

// Re-exports
pub use alloc::BitmapAllocator;
pub use bitmap::{BitRun, SimpleBitmap};
pub use blob::{Blob, BlobArena, BlobId};
pub use extent::{Extent, ExtentMap, ExtentMapEntry};
pub use io::{IoRecord, MemDevice, ReadDivertor, WriteDivertor};
pub use writer::{PendingWriteResult, StatfsDelta, Writer};
