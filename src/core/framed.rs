//! Purpose: Length-prefix framing over any mapped file.
//! Role: Each write reserves four extra bytes and stores the total length,
//! little-endian, at the start of the range as its final step. A reader
//! observing a non-zero length field can therefore trust the bytes behind
//! it; a zero field means the frame is still being written.
use std::path::Path;
use std::sync::atomic::{fence, Ordering};

use crate::core::concurrent::{ascii_bytes, utf16_bytes, ByteOrder, CommitGuard, MappedFile};
use crate::core::error::Error;
use crate::core::region::MappedRegion;

pub(crate) const FRAME_HEADER_SIZE: u32 = 4;

pub(crate) struct Framed<F> {
    inner: F,
}

impl<F: MappedFile> Framed<F> {
    pub(crate) fn new(inner: F) -> Self {
        Self { inner }
    }

    fn write_framed(&self, payload: &[u8]) -> Option<u32> {
        let length = FRAME_HEADER_SIZE + u32::try_from(payload.len()).ok()?;
        let offset = self.inner.reserve(length)?;
        let guard = CommitGuard::new(&self.inner, length);
        let region = self.inner.region();
        region.put_bytes((offset + FRAME_HEADER_SIZE) as usize, payload);
        store_frame_header(region, offset, length);
        drop(guard);
        Some(offset)
    }
}

/// Publish the frame header after the payload. Frame offsets are not
/// necessarily 4-byte aligned, so the length is byte-copied behind a
/// release fence instead of going through an atomic word.
fn store_frame_header(region: &MappedRegion, offset: u32, length: u32) {
    fence(Ordering::Release);
    region.put_bytes(offset as usize, &length.to_le_bytes());
}

impl<F: MappedFile> MappedFile for Framed<F> {
    fn reserve(&self, length: u32) -> Option<u32> {
        self.inner.reserve(length)
    }

    fn commit(&self, length: u32) {
        self.inner.commit(length);
    }

    fn region(&self) -> &MappedRegion {
        self.inner.region()
    }

    fn capacity(&self) -> u32 {
        self.inner.capacity()
    }

    fn has_available_capacity(&self) -> bool {
        self.inner.has_available_capacity()
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

    fn path(&self) -> &Path {
        self.inner.path()
    }

    fn close(&self) -> Result<(), Error> {
        self.inner.close()
    }

    fn write_bytes(&self, src: &[u8]) -> Option<u32> {
        self.write_framed(src)
    }

    fn write_ascii(&self, text: &str) -> Option<u32> {
        self.write_framed(&ascii_bytes(text))
    }

    fn write_utf16(&self, text: &str, order: ByteOrder) -> Option<u32> {
        self.write_framed(&utf16_bytes(text, order))
    }

    fn write_with(&self, length: u32, fill: &mut dyn FnMut(&mut [u8])) -> Option<u32> {
        let total = FRAME_HEADER_SIZE + length;
        let offset = self.inner.reserve(total)?;
        let guard = CommitGuard::new(&self.inner, total);
        let region = self.inner.region();
        // SAFETY: the reservation covers the header and the payload range.
        let buf = unsafe {
            region.slice_mut((offset + FRAME_HEADER_SIZE) as usize, length as usize)
        };
        fill(buf);
        store_frame_header(region, offset, total);
        drop(guard);
        Some(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::Framed;
    use crate::core::concurrent::MappedFile;
    use crate::core::single::SingleProcessFile;

    #[test]
    fn frame_header_holds_total_length() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("framed.bin");
        let file = Framed::new(SingleProcessFile::map(&path, 128, false).expect("map"));

        assert_eq!(file.write_bytes(b"hi"), Some(0));
        file.close().expect("close");

        let bytes = std::fs::read(&path).expect("read");
        assert_eq!(&bytes[..6], &[0x06, 0x00, 0x00, 0x00, b'h', b'i']);
    }

    #[test]
    fn frames_concatenate_and_decode() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("frames.bin");
        let file = Framed::new(SingleProcessFile::map(&path, 256, false).expect("map"));

        let payloads: [&[u8]; 3] = [b"alpha", b"be", b"gamma!"];
        for payload in payloads {
            assert!(file.write_bytes(payload).is_some());
        }
        file.close().expect("close");

        let bytes = std::fs::read(&path).expect("read");
        let mut decoded = Vec::new();
        let mut cursor = 0usize;
        for _ in 0..payloads.len() {
            let total =
                u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().expect("len")) as usize;
            decoded.push(bytes[cursor + 4..cursor + total].to_vec());
            cursor += total;
        }
        assert_eq!(decoded, payloads.map(<[u8]>::to_vec).to_vec());
    }

    #[test]
    fn oversized_frame_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tight.bin");
        let file = Framed::new(SingleProcessFile::map(&path, 8, false).expect("map"));

        // 5 payload bytes + 4 header bytes cannot fit 8.
        assert_eq!(file.write_bytes(b"12345"), None);
        assert!(!file.is_pending());
    }
}
