//! Purpose: Builder surface that validates configuration and produces a
//! concurrent writer.
//! Exports: `Mapper`, `RollOptions`.
//! Role: The only place the concrete engines, the framing wrapper, and the
//! rolling machinery are wired together.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::core::concurrent::{ConcurrentFile, FixedFile, YieldPolicy};
use crate::core::error::{Error, ErrorKind};
use crate::core::framed::Framed;
use crate::core::multi::MultiProcessFile;
use crate::core::single::SingleProcessFile;
use crate::roll::coordination::CoordinationFile;
use crate::roll::coordinator::{FileCompleteFn, RollCoordinator};
use crate::roll::multi::MultiProcessSource;
use crate::roll::provider::{FileNameProvider, TimestampFileNames, DEFAULT_DATE_FORMAT};
use crate::roll::rolling::RollingFile;
use crate::roll::single::SingleProcessSource;

/// Builder for concurrent writers.
///
/// `location` is the file path for a fixed-capacity writer, or the parent
/// directory for created files when rolling is enabled.
pub struct Mapper {
    location: Option<PathBuf>,
    capacity: u32,
    fill_with_zeros: bool,
    multi_process: bool,
    framed: bool,
    roll: RollOptions,
}

impl Mapper {
    pub fn new() -> Self {
        Self {
            location: None,
            capacity: 0,
            fill_with_zeros: true,
            multi_process: false,
            framed: false,
            roll: RollOptions::default(),
        }
    }

    pub fn location(mut self, location: impl Into<PathBuf>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Usable data capacity of each created file, in bytes.
    pub fn capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    /// Pre-fault created files by writing zeroes through the fresh mapping.
    /// Defaults to true.
    pub fn fill_with_zeros(mut self, fill_with_zeros: bool) -> Self {
        self.fill_with_zeros = fill_with_zeros;
        self
    }

    /// Keep the reservation cursors in a 32-byte in-file header so multiple
    /// processes can write to the same file. Defaults to false.
    pub fn multi_process(mut self, multi_process: bool) -> Self {
        self.multi_process = multi_process;
        self
    }

    /// Prefix every write with its 4-byte little-endian length, written
    /// after the payload. Defaults to false.
    pub fn framed(mut self, framed: bool) -> Self {
        self.framed = framed;
        self
    }

    pub fn roll(mut self, configure: impl FnOnce(RollOptions) -> RollOptions) -> Self {
        self.roll = configure(self.roll);
        self
    }

    pub fn map(self) -> Result<Box<dyn ConcurrentFile>, Error> {
        let location = self
            .location
            .ok_or_else(|| Error::new(ErrorKind::Usage).with_message("location is required"))?;
        if self.capacity == 0 {
            return Err(Error::new(ErrorKind::Usage).with_message("capacity must be non-zero"));
        }

        if !self.roll.enabled {
            return if self.multi_process {
                let file = MultiProcessFile::map(&location, self.capacity, self.fill_with_zeros)?;
                Ok(boxed(file, self.framed))
            } else {
                let file = SingleProcessFile::map(&location, self.capacity, self.fill_with_zeros)?;
                Ok(boxed(file, self.framed))
            };
        }

        let roll = self.roll;
        let provider: Box<dyn FileNameProvider> = match roll.provider {
            Some(provider) => provider,
            None => Box::new(
                TimestampFileNames::new(
                    location.clone(),
                    roll.file_name_prefix,
                    roll.file_name_suffix,
                )
                .with_format(roll.date_format),
            ),
        };

        if self.multi_process {
            let coordination_path = roll
                .coordination_file
                .unwrap_or_else(|| location.join("coordination.dat"));
            let coordination = CoordinationFile::map(
                &coordination_path,
                provider,
                roll.preallocate,
                roll.yield_policy,
            )?;
            let source = MultiProcessSource::new(
                coordination,
                self.capacity,
                self.fill_with_zeros,
                self.framed,
                roll.yield_policy,
                roll.preallocate,
                roll.preallocate_check_interval,
            )?;
            let coordinator = RollCoordinator::new(
                source,
                roll.yield_policy,
                roll.async_close,
                roll.file_complete,
            )?;
            Ok(Box::new(RollingFile::new(coordinator, self.framed)))
        } else {
            let source = SingleProcessSource::new(
                self.capacity,
                self.fill_with_zeros,
                self.framed,
                provider,
                roll.yield_policy,
                roll.preallocate,
                roll.preallocate_check_interval,
            );
            let coordinator = RollCoordinator::new(
                source,
                roll.yield_policy,
                roll.async_close,
                roll.file_complete,
            )?;
            Ok(Box::new(RollingFile::new(coordinator, self.framed)))
        }
    }
}

impl Default for Mapper {
    fn default() -> Self {
        Self::new()
    }
}

fn boxed<F: crate::core::concurrent::MappedFile + 'static>(
    file: F,
    framed: bool,
) -> Box<dyn ConcurrentFile> {
    if framed {
        Box::new(FixedFile::new(Framed::new(file)))
    } else {
        Box::new(FixedFile::new(file))
    }
}

/// Rolling configuration, set through [`Mapper::roll`].
pub struct RollOptions {
    enabled: bool,
    provider: Option<Box<dyn FileNameProvider>>,
    file_name_prefix: String,
    file_name_suffix: String,
    date_format: String,
    yield_policy: YieldPolicy,
    async_close: bool,
    preallocate: bool,
    preallocate_check_interval: Duration,
    file_complete: Option<FileCompleteFn>,
    coordination_file: Option<PathBuf>,
}

impl Default for RollOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: None,
            file_name_prefix: String::new(),
            file_name_suffix: String::new(),
            date_format: DEFAULT_DATE_FORMAT.to_string(),
            yield_policy: YieldPolicy::default(),
            async_close: false,
            preallocate: false,
            preallocate_check_interval: Duration::from_millis(100),
            file_complete: None,
            coordination_file: None,
        }
    }
}

impl RollOptions {
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Replace the default timestamp-based naming with a custom provider.
    pub fn file_provider(mut self, provider: impl FileNameProvider + 'static) -> Self {
        self.provider = Some(Box::new(provider));
        self
    }

    /// Filename prefix for created files; used only with the default
    /// provider.
    pub fn file_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.file_name_prefix = prefix.into();
        self
    }

    /// Filename suffix for created files; used only with the default
    /// provider.
    pub fn file_name_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.file_name_suffix = suffix.into();
        self
    }

    /// `chrono` format string for the timestamp portion of default file
    /// names.
    pub fn date_format(mut self, format: impl Into<String>) -> Self {
        self.date_format = format.into();
        self
    }

    /// How losing threads wait when rolls or the coordination lock are
    /// contended. Defaults to yielding.
    pub fn yield_policy(mut self, yield_policy: YieldPolicy) -> Self {
        self.yield_policy = yield_policy;
        self
    }

    /// Close retired files on a one-shot background thread instead of
    /// inline on the rolling writer. Defaults to false.
    pub fn async_close(mut self, async_close: bool) -> Self {
        self.async_close = async_close;
        self
    }

    /// Keep the next file mapped ahead of time so the roll swap is
    /// instant. Defaults to false.
    pub fn preallocate(mut self, preallocate: bool) -> Self {
        self.preallocate = preallocate;
        self
    }

    /// How often the preallocator checks whether it should map a new file.
    /// Should be small enough that writers cannot exhaust a file within
    /// one interval. Defaults to 100 milliseconds.
    pub fn preallocate_check_interval(mut self, interval: Duration) -> Self {
        self.preallocate_check_interval = interval;
        self
    }

    /// Run on every rolled file after it has been closed.
    pub fn file_complete(mut self, callback: impl Fn(&Path) + Send + Sync + 'static) -> Self {
        self.file_complete = Some(Arc::new(callback));
        self
    }

    /// Path of the shared coordination file for multi-process rolling.
    /// Defaults to `coordination.dat` inside the mapper location.
    pub fn coordination_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.coordination_file = Some(path.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::Mapper;
    use crate::core::error::ErrorKind;

    #[test]
    fn location_is_required() {
        let err = Mapper::new().capacity(64).map().expect_err("no location");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn capacity_must_be_non_zero() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = Mapper::new()
            .location(dir.path().join("zero.bin"))
            .map()
            .expect_err("zero capacity");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn maps_a_plain_fixed_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = Mapper::new()
            .location(dir.path().join("plain.bin"))
            .capacity(128)
            .map()
            .expect("map");
        assert_eq!(file.write(b"hello").expect("write"), Some(0));
        file.close().expect("close");
    }
}
