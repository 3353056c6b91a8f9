//! Purpose: Lock-free, append-only writers over memory-mapped files.
//! Exports: `Mapper` (the builder surface), `ConcurrentFile` (the writer
//! surface), naming and policy types.
//! Role: Writers atomically carve out disjoint byte ranges by advancing a
//! shared offset, fill them without any lock on the I/O path, and commit a
//! completion cursor. Rolling swaps in a fresh file when the current one
//! fills; multi-process mode keeps the cursors in a 32-byte in-file header
//! and agrees on roll targets through a shared coordination file.
//! Invariants: internal storage modules stay private; the public surface is
//! re-exported here.
mod core;
mod mapper;
mod roll;

pub use crate::core::concurrent::{ByteOrder, ConcurrentFile, YieldPolicy};
pub use crate::core::error::{Error, ErrorKind};
pub use crate::mapper::{Mapper, RollOptions};
pub use crate::roll::coordinator::FileCompleteFn;
pub use crate::roll::provider::{FileNameProvider, TimestampFileNames};
