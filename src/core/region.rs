// Memory-mapped byte range with raw atomic word access and bulk copy.
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use memmap2::MmapMut;

use crate::core::error::{Error, ErrorKind};

/// A contiguous mapped byte range backed by a regular file.
///
/// The region is valid from creation until the owning file object drops it.
/// `close` is idempotent per instance: it flushes the mapping, optionally
/// truncates the backing file, and marks the region closed; the mapping and
/// the handle are released on drop.
#[derive(Debug)]
pub(crate) struct MappedRegion {
    // Declared before `file` so the mapping is torn down before the handle.
    map: MmapMut,
    file: File,
    path: PathBuf,
    ptr: *mut u8,
    len: usize,
    closed: AtomicBool,
}

// SAFETY: the mapping stays valid for the lifetime of the region, and all
// shared mutation goes through atomic words or ranges the reservation
// protocol hands out exclusively.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Create the backing file with the given length and map it read/write.
    ///
    /// Fails with `AlreadyExists` when the path is already present.
    /// `fill_with_zeros` pre-faults every page by writing zeroes through the
    /// fresh mapping.
    pub(crate) fn create(path: &Path, len: usize, fill_with_zeros: bool) -> Result<Self, Error> {
        if len == 0 {
            return Err(Error::new(ErrorKind::Usage).with_message("length must be non-zero"));
        }
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| Error::new(open_error_kind(&err)).with_path(path).with_source(err))?;
        file.set_len(len as u64)
            .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?;
        let mut map = unsafe {
            MmapMut::map_mut(&file)
                .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?
        };
        if fill_with_zeros {
            map.fill(0);
        }
        let ptr = map.as_mut_ptr();
        Ok(Self {
            map,
            file,
            path: path.to_path_buf(),
            ptr,
            len,
            closed: AtomicBool::new(false),
        })
    }

    /// Map an existing file read/write; the file length determines the
    /// region length.
    pub(crate) fn open(path: &Path) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| Error::new(open_error_kind(&err)).with_path(path).with_source(err))?;
        let len = file
            .metadata()
            .map(|meta| meta.len() as usize)
            .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?;
        if len == 0 {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("backing file is empty")
                .with_path(path));
        }
        let mut map = unsafe {
            MmapMut::map_mut(&file)
                .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?
        };
        let ptr = map.as_mut_ptr();
        Ok(Self {
            map,
            file,
            path: path.to_path_buf(),
            ptr,
            len,
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Flush the mapping, optionally truncate the backing file, and mark the
    /// region closed. Later calls are no-ops.
    pub(crate) fn close(&self, truncate_to: Option<u64>) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.map
            .flush()
            .map_err(|err| Error::new(ErrorKind::Io).with_path(&self.path).with_source(err))?;
        if let Some(len) = truncate_to {
            self.file
                .set_len(len)
                .map_err(|err| Error::new(ErrorKind::Io).with_path(&self.path).with_source(err))?;
        }
        Ok(())
    }

    fn atomic_u64(&self, offset: usize) -> &AtomicU64 {
        debug_assert!(offset % 8 == 0, "unaligned 64-bit access at {offset}");
        assert!(offset + 8 <= self.len);
        // SAFETY: in bounds, naturally aligned, and the mapping outlives self.
        unsafe { &*(self.ptr.add(offset) as *const AtomicU64) }
    }

    fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        debug_assert!(offset % 4 == 0, "unaligned 32-bit access at {offset}");
        assert!(offset + 4 <= self.len);
        // SAFETY: in bounds, naturally aligned, and the mapping outlives self.
        unsafe { &*(self.ptr.add(offset) as *const AtomicU32) }
    }

    pub(crate) fn get_u64(&self, offset: usize) -> u64 {
        self.atomic_u64(offset).load(Ordering::Acquire)
    }

    pub(crate) fn put_u64(&self, offset: usize, value: u64) {
        self.atomic_u64(offset).store(value, Ordering::Release);
    }

    pub(crate) fn cas_u64(&self, offset: usize, current: u64, new: u64) -> bool {
        self.atomic_u64(offset)
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn add_u64(&self, offset: usize, value: u64) {
        self.atomic_u64(offset).fetch_add(value, Ordering::AcqRel);
    }

    pub(crate) fn cas_u32(&self, offset: usize, current: u32, new: u32) -> bool {
        self.atomic_u32(offset)
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn put_u32(&self, offset: usize, value: u32) {
        self.atomic_u32(offset).store(value, Ordering::Release);
    }

    pub(crate) fn get_u8(&self, offset: usize) -> u8 {
        assert!(offset < self.len);
        // SAFETY: in bounds; volatile so stores from other processes are
        // re-read each call.
        unsafe { std::ptr::read_volatile(self.ptr.add(offset)) }
    }

    pub(crate) fn put_u8(&self, offset: usize, value: u8) {
        assert!(offset < self.len);
        // SAFETY: in bounds.
        unsafe { std::ptr::write_volatile(self.ptr.add(offset), value) }
    }

    pub(crate) fn put_bytes(&self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= self.len);
        // SAFETY: in bounds; the caller holds a reservation covering the
        // destination range, so no other writer touches it.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.add(offset), src.len()) }
    }

    /// Exclusive view of a reserved range.
    ///
    /// # Safety
    ///
    /// The caller must hold an unfinished reservation covering exactly
    /// `[offset, offset + len)`; the reservation protocol guarantees no
    /// other slice overlaps it.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        assert!(offset + len <= self.len);
        unsafe { std::slice::from_raw_parts_mut(self.ptr.add(offset), len) }
    }
}

fn open_error_kind(err: &io::Error) -> ErrorKind {
    match err.kind() {
        io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        _ => ErrorKind::Io,
    }
}

#[cfg(test)]
mod tests {
    use super::MappedRegion;
    use crate::core::error::ErrorKind;

    #[test]
    fn create_open_and_share_words() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("region.bin");

        let writer = MappedRegion::create(&path, 4096, false).expect("create");
        writer.put_u64(0, 0xDEAD_BEEF);
        writer.put_bytes(64, b"hello");

        let reader = MappedRegion::open(&path).expect("open");
        assert_eq!(reader.len(), 4096);
        assert_eq!(reader.get_u64(0), 0xDEAD_BEEF);
        assert_eq!(reader.get_u8(64), b'h');
        assert_eq!(reader.get_u8(68), b'o');
    }

    #[test]
    fn cas_succeeds_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cas.bin");
        let region = MappedRegion::create(&path, 64, false).expect("create");

        assert!(region.cas_u64(8, 0, 32));
        assert!(!region.cas_u64(8, 0, 99));
        assert_eq!(region.get_u64(8), 32);
    }

    #[test]
    fn create_rejects_existing_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("dup.bin");
        let _first = MappedRegion::create(&path, 64, false).expect("create");

        let err = MappedRegion::create(&path, 64, false).expect_err("should collide");
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn close_truncates_and_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("trunc.bin");
        let region = MappedRegion::create(&path, 128, true).expect("create");

        region.close(Some(48)).expect("close");
        region.close(Some(7)).expect("second close is a no-op");
        assert!(region.is_closed());
        assert_eq!(std::fs::metadata(&path).expect("meta").len(), 48);
    }
}
