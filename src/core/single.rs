//! Purpose: Single-process reservation engine with in-memory cursors.
//! Role: No on-disk coordination state; the file is raw payload bytes and
//! cannot be reopened once created.
//! Invariants: `write_complete <= next_write_offset` at all times; the first
//! reservation to overflow capacity records the truncation point.
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::core::concurrent::MappedFile;
use crate::core::error::{Error, ErrorKind};
use crate::core::region::MappedRegion;

#[derive(Debug)]
pub(crate) struct SingleProcessFile {
    region: MappedRegion,
    next_write_offset: AtomicU64,
    write_complete: AtomicU64,
    final_file_size: AtomicI64,
    capacity: u64,
}

impl SingleProcessFile {
    /// Create and map a fresh file of exactly `capacity` bytes. An existing
    /// file at the path is rejected: this engine keeps its cursors in
    /// memory, so a previous file cannot be resumed.
    pub(crate) fn map(path: &Path, capacity: u32, fill_with_zeros: bool) -> Result<Self, Error> {
        if capacity == 0 || capacity > i32::MAX as u32 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("capacity must be in 1..={}", i32::MAX)));
        }
        let region = MappedRegion::create(path, capacity as usize, fill_with_zeros)?;
        Ok(Self {
            region,
            next_write_offset: AtomicU64::new(0),
            write_complete: AtomicU64::new(0),
            final_file_size: AtomicI64::new(-1),
            capacity: capacity as u64,
        })
    }

    fn reserve_len(&self, length: u64) -> Option<u32> {
        let mut offset;
        loop {
            offset = self.next_write_offset.load(Ordering::Acquire);
            if offset >= self.capacity {
                // Already finalized; nothing more can ever be written.
                return None;
            }
            if self
                .next_write_offset
                .compare_exchange(offset, offset + length, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        if offset + length > self.capacity {
            // First reservation past capacity. Commit the phantom length so
            // write_complete can still catch up to next_write_offset, then
            // record where writing ceased so close can truncate.
            self.write_complete.fetch_add(length, Ordering::AcqRel);
            self.final_file_size.store(offset as i64, Ordering::Release);
            return None;
        }

        Some(offset as u32)
    }
}

impl MappedFile for SingleProcessFile {
    fn reserve(&self, length: u32) -> Option<u32> {
        self.reserve_len(length as u64)
    }

    fn commit(&self, length: u32) {
        self.write_complete.fetch_add(length as u64, Ordering::AcqRel);
    }

    fn region(&self) -> &MappedRegion {
        &self.region
    }

    fn capacity(&self) -> u32 {
        self.capacity as u32
    }

    fn has_available_capacity(&self) -> bool {
        self.next_write_offset.load(Ordering::Acquire) < self.capacity
    }

    fn is_pending(&self) -> bool {
        self.next_write_offset.load(Ordering::Acquire)
            != self.write_complete.load(Ordering::Acquire)
    }

    fn is_finished(&self) -> bool {
        let complete = self.write_complete.load(Ordering::Acquire);
        let next = self.next_write_offset.load(Ordering::Acquire);
        complete == next
            && complete >= self.capacity
            && self.final_file_size.load(Ordering::Acquire) > 0
    }

    fn finish(&self) {
        // Forces the overflow branch, which records the final file size.
        let _ = self.reserve_len(i32::MAX as u64);
    }

    fn path(&self) -> &Path {
        self.region.path()
    }

    fn close(&self) -> Result<(), Error> {
        if self.region.is_closed() {
            return Ok(());
        }
        if self.is_pending() {
            return Err(Error::new(ErrorKind::Pending)
                .with_message("there are pending writes")
                .with_path(self.region.path()));
        }
        let final_size = self.final_file_size.load(Ordering::Acquire);
        let truncate_to = (final_size >= 0).then_some(final_size as u64);
        self.region.close(truncate_to)
    }
}

#[cfg(test)]
mod tests {
    use super::SingleProcessFile;
    use crate::core::concurrent::{ByteOrder, MappedFile};
    use crate::core::error::ErrorKind;
    use std::path::PathBuf;

    fn scratch(name: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(name);
        (dir, path)
    }

    #[test]
    fn small_write_lands_at_offset_zero() {
        let (_dir, path) = scratch("hello.bin");
        let file = SingleProcessFile::map(&path, 128, false).expect("map");

        assert_eq!(file.write_bytes(b"Hello World!"), Some(0));
        assert!(!file.is_finished());
        assert!(!file.is_pending());
        file.close().expect("close");

        let bytes = std::fs::read(&path).expect("read");
        assert_eq!(&bytes[..12], b"Hello World!");
    }

    #[test]
    fn existing_file_is_rejected() {
        let (_dir, path) = scratch("dup.bin");
        let _first = SingleProcessFile::map(&path, 64, false).expect("map");

        let err = SingleProcessFile::map(&path, 64, false).expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn overflow_returns_none_and_truncates_on_close() {
        let (_dir, path) = scratch("overflow.bin");
        let file = SingleProcessFile::map(&path, 20, false).expect("map");

        assert_eq!(file.write_bytes(b"buffer1"), Some(0));
        assert_eq!(file.write_bytes(b"buffer2"), Some(7));
        assert_eq!(file.write_bytes(b"buffer3"), None);

        // The phantom commit lets the completion cursor catch up, so the
        // file is finished rather than pending.
        assert!(!file.is_pending());
        assert!(file.is_finished());

        file.close().expect("close");
        assert_eq!(std::fs::metadata(&path).expect("meta").len(), 14);
    }

    #[test]
    fn writes_after_finish_are_refused() {
        let (_dir, path) = scratch("finish.bin");
        let file = SingleProcessFile::map(&path, 64, false).expect("map");

        assert_eq!(file.write_bytes(b"once"), Some(0));
        file.finish();
        assert!(file.is_finished());
        assert_eq!(file.write_bytes(b"again"), None);

        file.close().expect("close");
        assert_eq!(std::fs::metadata(&path).expect("meta").len(), 4);
    }

    #[test]
    fn exact_capacity_write_succeeds_then_refuses() {
        let (_dir, path) = scratch("exact.bin");
        let file = SingleProcessFile::map(&path, 8, false).expect("map");

        assert_eq!(file.write_bytes(b"12345678"), Some(0));
        assert_eq!(file.write_bytes(b"x"), None);
        assert!(!file.is_pending());
    }

    #[test]
    fn close_fails_while_pending() {
        let (_dir, path) = scratch("pending.bin");
        let file = SingleProcessFile::map(&path, 64, false).expect("map");

        let offset = file.reserve(4).expect("reserve");
        let err = file.close().expect_err("pending close should fail");
        assert_eq!(err.kind(), ErrorKind::Pending);

        file.region().put_bytes(offset as usize, b"late");
        file.commit(4);
        file.close().expect("close");
    }

    #[test]
    fn ascii_and_utf16_round_trip() {
        let (_dir, path) = scratch("text.bin");
        let file = SingleProcessFile::map(&path, 64, false).expect("map");

        assert_eq!(MappedFile::write_ascii(&file, "ok\u{2713}"), Some(0));
        assert_eq!(
            MappedFile::write_utf16(&file, "hi", ByteOrder::LittleEndian),
            Some(3)
        );
        file.close().expect("close");

        let bytes = std::fs::read(&path).expect("read");
        assert_eq!(&bytes[..3], b"ok?");
        assert_eq!(&bytes[3..7], &[b'h', 0x00, b'i', 0x00]);
    }

    #[test]
    fn write_with_fills_in_place() {
        let (_dir, path) = scratch("fill.bin");
        let file = SingleProcessFile::map(&path, 64, false).expect("map");

        let offset = MappedFile::write_with(&file, 12, &mut |buf| {
            buf[..4].copy_from_slice(&7i32.to_le_bytes());
            buf[4..].copy_from_slice(&42i64.to_le_bytes());
        });
        assert_eq!(offset, Some(0));
        assert!(!file.is_pending());
        file.close().expect("close");

        let bytes = std::fs::read(&path).expect("read");
        assert_eq!(i32::from_le_bytes(bytes[0..4].try_into().expect("i32")), 7);
        assert_eq!(i64::from_le_bytes(bytes[4..12].try_into().expect("i64")), 42);
    }
}
