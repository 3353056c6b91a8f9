//! Purpose: Writer-facing traits shared by fixed-capacity and rolling files.
//! Exports: `ConcurrentFile`, `ByteOrder`, `YieldPolicy`, `MappedFile`, `FixedFile`.
//! Role: `MappedFile` is the reserve/commit plane the engines implement;
//! `ConcurrentFile` is the public surface the mapper hands out.
//! Invariants: every reservation commits exactly once, on every exit path.
use std::path::{Path, PathBuf};

use crate::core::error::Error;
use crate::core::region::MappedRegion;

/// Byte order for UTF-16 writes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

/// How losing threads wait on contended spin loops.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum YieldPolicy {
    /// Busy-spin with a CPU relax hint.
    BusySpin,
    /// Yield the thread to the scheduler on every failed attempt.
    #[default]
    Yield,
}

impl YieldPolicy {
    pub(crate) fn idle(self) {
        match self {
            YieldPolicy::BusySpin => std::hint::spin_loop(),
            YieldPolicy::Yield => std::thread::yield_now(),
        }
    }
}

/// A writable file shared by concurrent writers.
///
/// Writes return `Ok(None)` when the payload could not fit because the file
/// is out of room. Rolling writers never report that state; they roll to a
/// fresh file instead and only fail for payloads that could never fit.
pub trait ConcurrentFile: Send + Sync + std::fmt::Debug {
    /// Write the bytes, returning the absolute offset they were placed at.
    fn write(&self, src: &[u8]) -> Result<Option<u32>, Error>;

    /// Write one byte per character; non-ASCII characters become `?`.
    fn write_ascii(&self, text: &str) -> Result<Option<u32>, Error>;

    /// Write UTF-16 code units in the given byte order.
    fn write_utf16(&self, text: &str, order: ByteOrder) -> Result<Option<u32>, Error>;

    /// Reserve `length` bytes and let `fill` populate them in place. The
    /// callback must fill the entire slice.
    fn write_with(
        &self,
        length: u32,
        fill: &mut dyn FnMut(&mut [u8]),
    ) -> Result<Option<u32>, Error>;

    /// True while writes issued through this instance have not all settled.
    fn is_pending(&self) -> bool;

    /// True once the file has been finalized and every reservation settled.
    fn is_finished(&self) -> bool;

    /// Force the overflow protocol so no further writes are accepted.
    fn finish(&self);

    fn path(&self) -> PathBuf;

    /// Fails with `Pending` while writes are outstanding. Idempotent.
    fn close(&self) -> Result<(), Error>;
}

/// The reserve/commit plane: atomically carve a byte range, fill it, then
/// signal completion. Implemented by the single- and multi-process engines
/// and by the framing wrapper.
pub(crate) trait MappedFile: Send + Sync {
    /// Carve out `length` bytes, returning the absolute offset of the range
    /// or `None` once the file cannot take the write.
    fn reserve(&self, length: u32) -> Option<u32>;

    /// Advance the completion cursor past a reserved range.
    fn commit(&self, length: u32);

    fn region(&self) -> &MappedRegion;

    fn capacity(&self) -> u32;

    fn has_available_capacity(&self) -> bool;

    fn is_pending(&self) -> bool;

    fn is_finished(&self) -> bool;

    fn finish(&self);

    fn path(&self) -> &Path;

    fn close(&self) -> Result<(), Error>;

    fn write_bytes(&self, src: &[u8]) -> Option<u32> {
        let length = u32::try_from(src.len()).ok()?;
        let offset = self.reserve(length)?;
        let guard = CommitGuard::new(self, length);
        self.region().put_bytes(offset as usize, src);
        drop(guard);
        Some(offset)
    }

    fn write_ascii(&self, text: &str) -> Option<u32> {
        self.write_bytes(&ascii_bytes(text))
    }

    fn write_utf16(&self, text: &str, order: ByteOrder) -> Option<u32> {
        self.write_bytes(&utf16_bytes(text, order))
    }

    fn write_with(&self, length: u32, fill: &mut dyn FnMut(&mut [u8])) -> Option<u32> {
        let offset = self.reserve(length)?;
        let guard = CommitGuard::new(self, length);
        // SAFETY: the reservation covers exactly this range.
        let buf = unsafe { self.region().slice_mut(offset as usize, length as usize) };
        fill(buf);
        drop(guard);
        Some(offset)
    }
}

/// Commits a reserved length when dropped, so the completion cursor catches
/// up even when the payload copy panics.
pub(crate) struct CommitGuard<'a, F: MappedFile + ?Sized> {
    file: &'a F,
    length: u32,
}

impl<'a, F: MappedFile + ?Sized> CommitGuard<'a, F> {
    pub(crate) fn new(file: &'a F, length: u32) -> Self {
        Self { file, length }
    }
}

impl<F: MappedFile + ?Sized> Drop for CommitGuard<'_, F> {
    fn drop(&mut self) {
        self.file.commit(self.length);
    }
}

pub(crate) fn ascii_bytes(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
        .collect()
}

pub(crate) fn utf16_bytes(text: &str, order: ByteOrder) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(text.len() * 2);
    for unit in text.encode_utf16() {
        match order {
            ByteOrder::LittleEndian => bytes.extend_from_slice(&unit.to_le_bytes()),
            ByteOrder::BigEndian => bytes.extend_from_slice(&unit.to_be_bytes()),
        }
    }
    bytes
}

/// Adapts a fixed-capacity `MappedFile` to the public writer surface.
pub(crate) struct FixedFile<F: MappedFile> {
    inner: F,
}

impl<F: MappedFile> FixedFile<F> {
    pub(crate) fn new(inner: F) -> Self {
        Self { inner }
    }
}

impl<F: MappedFile> std::fmt::Debug for FixedFile<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedFile").finish()
    }
}

impl<F: MappedFile> ConcurrentFile for FixedFile<F> {
    fn write(&self, src: &[u8]) -> Result<Option<u32>, Error> {
        Ok(self.inner.write_bytes(src))
    }

    fn write_ascii(&self, text: &str) -> Result<Option<u32>, Error> {
        Ok(MappedFile::write_ascii(&self.inner, text))
    }

    fn write_utf16(&self, text: &str, order: ByteOrder) -> Result<Option<u32>, Error> {
        Ok(MappedFile::write_utf16(&self.inner, text, order))
    }

    fn write_with(
        &self,
        length: u32,
        fill: &mut dyn FnMut(&mut [u8]),
    ) -> Result<Option<u32>, Error> {
        Ok(MappedFile::write_with(&self.inner, length, fill))
    }

    fn is_pending(&self) -> bool {
        self.inner.is_pending()
    }

    fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    fn finish(&self) {
        self.inner.finish();
    }

    fn path(&self) -> PathBuf {
        self.inner.path().to_path_buf()
    }

    fn close(&self) -> Result<(), Error> {
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use super::{ascii_bytes, utf16_bytes, ByteOrder};

    #[test]
    fn ascii_replaces_non_ascii() {
        assert_eq!(ascii_bytes("a\u{e9}b"), b"a?b");
    }

    #[test]
    fn utf16_respects_byte_order() {
        assert_eq!(utf16_bytes("A", ByteOrder::LittleEndian), vec![0x41, 0x00]);
        assert_eq!(utf16_bytes("A", ByteOrder::BigEndian), vec![0x00, 0x41]);
    }
}
