//! Purpose: Writer facade that retries against whichever file is current.
//! Role: A reservation returning "no room" is the ordinary rolling trigger;
//! the loop re-resolves the current file and tries again. It terminates
//! because every retry either succeeds or advances the current file.
use std::path::PathBuf;

use crate::core::concurrent::{
    ascii_bytes, utf16_bytes, ByteOrder, ConcurrentFile, MappedFile,
};
use crate::core::error::{Error, ErrorKind};
use crate::core::framed::FRAME_HEADER_SIZE;
use crate::roll::coordinator::RollCoordinator;
use crate::roll::FileSource;

pub(crate) struct RollingFile<S: FileSource> {
    coordinator: RollCoordinator<S>,
    // Longest payload that can ever fit a single file, accounting for the
    // frame header when framing is on.
    max_write: u32,
}

impl<S: FileSource> RollingFile<S> {
    pub(crate) fn new(coordinator: RollCoordinator<S>, framed: bool) -> Self {
        let capacity = coordinator.current_file().capacity();
        let max_write = if framed {
            capacity.saturating_sub(FRAME_HEADER_SIZE)
        } else {
            capacity
        };
        Self {
            coordinator,
            max_write,
        }
    }

    fn check_length(&self, length: usize) -> Result<u32, Error> {
        let length = u32::try_from(length)
            .ok()
            .filter(|len| *len <= self.max_write)
            .ok_or_else(|| {
                Error::new(ErrorKind::Usage).with_message(format!(
                    "length {length} exceeds the per-file capacity of {}",
                    self.max_write
                ))
            })?;
        Ok(length)
    }

    fn write_loop(
        &self,
        mut attempt: impl FnMut(&dyn MappedFile) -> Option<u32>,
    ) -> Result<u32, Error> {
        loop {
            let file = self.coordinator.file_for_write()?;
            if let Some(offset) = attempt(file.as_ref()) {
                return Ok(offset);
            }
            // The file filled between the capacity check and the
            // reservation; roll and retry.
        }
    }
}

impl<S: FileSource> std::fmt::Debug for RollingFile<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollingFile").finish()
    }
}

impl<S: FileSource> ConcurrentFile for RollingFile<S> {
    fn write(&self, src: &[u8]) -> Result<Option<u32>, Error> {
        self.check_length(src.len())?;
        self.write_loop(|file| file.write_bytes(src)).map(Some)
    }

    fn write_ascii(&self, text: &str) -> Result<Option<u32>, Error> {
        let bytes = ascii_bytes(text);
        self.check_length(bytes.len())?;
        self.write_loop(|file| file.write_bytes(&bytes)).map(Some)
    }

    fn write_utf16(&self, text: &str, order: ByteOrder) -> Result<Option<u32>, Error> {
        let bytes = utf16_bytes(text, order);
        self.check_length(bytes.len())?;
        self.write_loop(|file| file.write_bytes(&bytes)).map(Some)
    }

    fn write_with(
        &self,
        length: u32,
        fill: &mut dyn FnMut(&mut [u8]),
    ) -> Result<Option<u32>, Error> {
        self.check_length(length as usize)?;
        self.write_loop(|file| MappedFile::write_with(file, length, &mut *fill))
            .map(Some)
    }

    fn is_pending(&self) -> bool {
        self.coordinator.current_file().is_pending()
    }

    fn is_finished(&self) -> bool {
        // Never finished; there is always a fresh file to roll to.
        false
    }

    fn finish(&self) {
        self.coordinator.current_file().finish();
    }

    fn path(&self) -> PathBuf {
        self.coordinator.current_file().path().to_path_buf()
    }

    fn close(&self) -> Result<(), Error> {
        self.coordinator.close()
    }
}
