// Pluggable naming for the files a rolling writer creates.
use std::path::PathBuf;

use chrono::Local;

/// Produces the next file path in a roll sequence.
pub trait FileNameProvider: Send + Sync {
    fn next_file(&self) -> PathBuf;
}

pub(crate) const DEFAULT_DATE_FORMAT: &str = "%Y%m%d_%H%M%S_%3f";

/// Default provider: `<prefix><timestamp><maybe -N><suffix>` inside a fixed
/// directory, where `-N` is the smallest non-negative suffix yielding a
/// path that does not exist yet (`-0` renders as nothing). Collisions with
/// files created between the check and the create are benign; the caller
/// retries with a fresh name.
pub struct TimestampFileNames {
    directory: PathBuf,
    prefix: String,
    suffix: String,
    format: String,
}

impl TimestampFileNames {
    pub fn new(
        directory: impl Into<PathBuf>,
        prefix: impl Into<String>,
        suffix: impl Into<String>,
    ) -> Self {
        let directory = directory.into();
        let _ = std::fs::create_dir_all(&directory);
        Self {
            directory,
            prefix: prefix.into(),
            suffix: suffix.into(),
            format: DEFAULT_DATE_FORMAT.to_string(),
        }
    }

    /// Override the `chrono` format string used for the timestamp portion.
    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = format.into();
        self
    }
}

impl FileNameProvider for TimestampFileNames {
    fn next_file(&self) -> PathBuf {
        let stamp = Local::now().format(&self.format).to_string();
        let mut idx = 0u32;
        loop {
            let name = if idx == 0 {
                format!("{}{}{}", self.prefix, stamp, self.suffix)
            } else {
                format!("{}{}-{}{}", self.prefix, stamp, idx, self.suffix)
            };
            let path = self.directory.join(name);
            if !path.exists() {
                return path;
            }
            idx += 1;
        }
    }
}
