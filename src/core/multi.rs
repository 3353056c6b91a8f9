//! Purpose: Multi-process reservation engine with cursors in a 32-byte
//! in-file header.
//! Role: Any number of processes map the same file; reservations CAS the
//! shared `next_write` word, so writers never overlap. Reopen-able.
//! Invariants: header fields are little-endian 64-bit words at naturally
//! aligned offsets; the nested CAS initialization is monotonic, so a late
//! opener can never observe a partially initialized header as usable.
//! Invariants: only the instance that triggered overflow truncates at close.
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::core::concurrent::MappedFile;
use crate::core::error::{Error, ErrorKind};
use crate::core::region::MappedRegion;

pub(crate) const HEADER_SIZE: u32 = 32;

const OFFSET_DATA_START: usize = 0;
const OFFSET_FILE_SIZE: usize = 8;
const OFFSET_NEXT_WRITE: usize = 16;
const OFFSET_WRITE_COMPLETE: usize = 24;

#[derive(Debug)]
pub(crate) struct MultiProcessFile {
    region: MappedRegion,
    file_len: u64,
    // Writes issued through this instance, distinct from the header-wide
    // completion cursor shared by every process.
    local_reserved: AtomicU64,
    local_completed: AtomicU64,
    truncate_size: AtomicI64,
}

impl MultiProcessFile {
    /// Map the file at `path`, creating it with `HEADER_SIZE + capacity`
    /// bytes when absent. A lost create race falls back to mapping the
    /// winner's file.
    pub(crate) fn map(path: &Path, capacity: u32, fill_with_zeros: bool) -> Result<Self, Error> {
        if path.exists() {
            return Self::open_existing(path);
        }
        match Self::create_new(path, capacity, fill_with_zeros) {
            Ok(file) => Ok(file),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Self::open_existing(path),
            Err(err) => Err(err),
        }
    }

    fn create_new(path: &Path, capacity: u32, fill_with_zeros: bool) -> Result<Self, Error> {
        if capacity == 0 || capacity > i32::MAX as u32 - HEADER_SIZE {
            return Err(Error::new(ErrorKind::Usage).with_message(format!(
                "capacity must be in 1..={}",
                i32::MAX as u32 - HEADER_SIZE
            )));
        }
        let file_len = HEADER_SIZE as usize + capacity as usize;
        let region = MappedRegion::create(path, file_len, fill_with_zeros)?;
        Ok(Self::attach(region))
    }

    fn open_existing(path: &Path) -> Result<Self, Error> {
        let region = MappedRegion::open(path)?;
        if region.len() <= HEADER_SIZE as usize {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("file is too small to hold the header")
                .with_path(path));
        }
        Ok(Self::attach(region))
    }

    fn attach(region: MappedRegion) -> Self {
        let file_len = region.len() as u64;
        let file = Self {
            region,
            file_len,
            local_reserved: AtomicU64::new(0),
            local_completed: AtomicU64::new(0),
            truncate_size: AtomicI64::new(-1),
        };
        file.initialize_header();
        file
    }

    /// Nested so a crashed creator cannot leave a later opener with
    /// `data_start` set but dead cursors: only the winner of the outer CAS
    /// advances the inner fields.
    fn initialize_header(&self) {
        let header = HEADER_SIZE as u64;
        if self.region.cas_u64(OFFSET_DATA_START, 0, header)
            && self.region.cas_u64(OFFSET_NEXT_WRITE, 0, header)
        {
            self.region.cas_u64(OFFSET_WRITE_COMPLETE, 0, header);
        }
    }

    fn reserve_len(&self, length: u64) -> Option<u32> {
        self.local_reserved.fetch_add(1, Ordering::AcqRel);

        let mut offset;
        loop {
            offset = self.region.get_u64(OFFSET_NEXT_WRITE);
            if offset >= self.file_len {
                // Finalized by some writer; balance the local counters since
                // no commit will follow.
                self.local_completed.fetch_add(1, Ordering::AcqRel);
                return None;
            }
            if self.region.cas_u64(OFFSET_NEXT_WRITE, offset, offset + length) {
                break;
            }
        }

        if offset + length > self.file_len {
            // First reservation past capacity: phantom-commit the full
            // length so the completion cursor converges, record that this
            // instance performs the truncate, and publish where writing
            // ceased for readers in other processes.
            self.commit_len(length);
            self.truncate_size.store(offset as i64, Ordering::Release);
            self.region.put_u64(OFFSET_FILE_SIZE, offset);
            return None;
        }

        Some(offset as u32)
    }

    fn commit_len(&self, length: u64) {
        self.region.add_u64(OFFSET_WRITE_COMPLETE, length);
        self.local_completed.fetch_add(1, Ordering::AcqRel);
    }
}

impl MappedFile for MultiProcessFile {
    fn reserve(&self, length: u32) -> Option<u32> {
        self.reserve_len(length as u64)
    }

    fn commit(&self, length: u32) {
        self.commit_len(length as u64);
    }

    fn region(&self) -> &MappedRegion {
        &self.region
    }

    fn capacity(&self) -> u32 {
        (self.file_len - HEADER_SIZE as u64) as u32
    }

    fn has_available_capacity(&self) -> bool {
        self.region.get_u64(OFFSET_NEXT_WRITE) < self.file_len
    }

    fn is_pending(&self) -> bool {
        self.local_completed.load(Ordering::Acquire) != self.local_reserved.load(Ordering::Acquire)
    }

    fn is_finished(&self) -> bool {
        let complete = self.region.get_u64(OFFSET_WRITE_COMPLETE);
        let next = self.region.get_u64(OFFSET_NEXT_WRITE);
        complete == next
            && complete >= self.file_len
            && self.region.get_u64(OFFSET_FILE_SIZE) > 0
    }

    fn finish(&self) {
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
        let truncate = self.truncate_size.load(Ordering::Acquire);
        let truncate_to = (truncate >= 0).then_some(truncate as u64);
        self.region.close(truncate_to)
    }
}

#[cfg(test)]
mod tests {
    use super::{MultiProcessFile, HEADER_SIZE};
    use crate::core::concurrent::MappedFile;
    use crate::core::error::ErrorKind;
    use std::path::{Path, PathBuf};

    fn scratch(name: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(name);
        (dir, path)
    }

    fn header_word(path: &Path, offset: usize) -> u64 {
        let bytes = std::fs::read(path).expect("read");
        u64::from_le_bytes(bytes[offset..offset + 8].try_into().expect("word"))
    }

    #[test]
    fn fresh_map_initializes_header() {
        let (_dir, path) = scratch("fresh.bin");
        let file = MultiProcessFile::map(&path, 128, false).expect("map");

        assert_eq!(file.capacity(), 128);
        assert_eq!(header_word(&path, 0), HEADER_SIZE as u64);
        assert_eq!(header_word(&path, 16), HEADER_SIZE as u64);
        assert_eq!(header_word(&path, 24), HEADER_SIZE as u64);
        assert_eq!(header_word(&path, 8), 0);
    }

    #[test]
    fn two_instances_interleave_without_overlap() {
        let (_dir, path) = scratch("handshake.bin");
        let first = MultiProcessFile::map(&path, 128, false).expect("map first");
        let second = MultiProcessFile::map(&path, 128, false).expect("map second");

        assert_eq!(first.write_bytes(b"Hello "), Some(HEADER_SIZE));
        assert_eq!(second.write_bytes(b"World!"), Some(HEADER_SIZE + 6));

        second.close().expect("close second");
        first.close().expect("close first");

        let bytes = std::fs::read(&path).expect("read");
        assert_eq!(&bytes[HEADER_SIZE as usize..HEADER_SIZE as usize + 12], b"Hello World!");
    }

    #[test]
    fn reopen_resumes_after_close() {
        let (_dir, path) = scratch("reopen.bin");
        {
            let file = MultiProcessFile::map(&path, 128, false).expect("map");
            assert_eq!(file.write_bytes(b"one"), Some(HEADER_SIZE));
            file.close().expect("close");
        }

        let reopened = MultiProcessFile::map(&path, 128, false).expect("reopen");
        assert_eq!(reopened.write_bytes(b"two"), Some(HEADER_SIZE + 3));
        reopened.close().expect("close");

        let bytes = std::fs::read(&path).expect("read");
        assert_eq!(&bytes[HEADER_SIZE as usize..HEADER_SIZE as usize + 6], b"onetwo");
    }

    #[test]
    fn only_the_overflowing_instance_truncates() {
        let (_dir, path) = scratch("trunc.bin");
        let bystander = MultiProcessFile::map(&path, 20, false).expect("map");
        let culprit = MultiProcessFile::map(&path, 20, false).expect("map");

        assert_eq!(bystander.write_bytes(b"buffer1"), Some(HEADER_SIZE));
        assert_eq!(bystander.write_bytes(b"buffer2"), Some(HEADER_SIZE + 7));
        assert_eq!(culprit.write_bytes(b"buffer3"), None);

        bystander.close().expect("close bystander");
        assert_eq!(std::fs::metadata(&path).expect("meta").len(), 52);

        culprit.close().expect("close culprit");
        assert_eq!(
            std::fs::metadata(&path).expect("meta").len(),
            (HEADER_SIZE + 14) as u64
        );
    }

    #[test]
    fn phantom_commit_uses_the_full_length() {
        let (_dir, path) = scratch("phantom.bin");
        let file = MultiProcessFile::map(&path, 20, false).expect("map");

        assert_eq!(file.write_bytes(b"buffer1"), Some(HEADER_SIZE));
        assert_eq!(file.write_bytes(b"buffer2"), Some(HEADER_SIZE + 7));
        assert_eq!(file.write_bytes(b"buffer3"), None);
        assert!(file.is_finished());
        assert!(!file.is_pending());

        // 32 + 7 + 7 + 7: the overflow commit is the requested length, not
        // the remaining room.
        assert_eq!(file.region().get_u64(24), 53);
        assert_eq!(file.region().get_u64(16), 53);
        assert_eq!(file.region().get_u64(8), 46);
    }

    #[test]
    fn abandoned_zeroed_file_gets_initialized_by_the_opener() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("abandoned.bin");
        // A creator that died before running the initialization handshake
        // leaves a zeroed file behind.
        std::fs::write(&path, vec![0u8; 160]).expect("seed");

        let file = MultiProcessFile::map(&path, 128, false).expect("map");
        assert_eq!(header_word(&path, 0), HEADER_SIZE as u64);
        assert_eq!(header_word(&path, 16), HEADER_SIZE as u64);
        assert_eq!(header_word(&path, 24), HEADER_SIZE as u64);
        assert_eq!(file.write_bytes(b"recovered"), Some(HEADER_SIZE));
    }

    #[test]
    fn undersized_existing_file_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tiny.bin");
        std::fs::write(&path, [0u8; 16]).expect("write");

        let err = MultiProcessFile::map(&path, 128, false).expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn pending_is_local_to_the_instance() {
        let (_dir, path) = scratch("local.bin");
        let writer = MultiProcessFile::map(&path, 128, false).expect("map");
        let observer = MultiProcessFile::map(&path, 128, false).expect("map");

        let offset = writer.reserve(4).expect("reserve");
        assert!(writer.is_pending());
        assert!(!observer.is_pending());

        writer.region().put_bytes(offset as usize, b"data");
        writer.commit(4);
        assert!(!writer.is_pending());
    }
}
