// Rolling machinery: coordinator, file sources, naming, cross-process
// coordination.
pub(crate) mod coordination;
pub(crate) mod coordinator;
pub(crate) mod multi;
pub mod provider;
pub(crate) mod rolling;
pub(crate) mod single;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::concurrent::MappedFile;
use crate::core::error::Error;

pub(crate) type SharedFile = Arc<dyn MappedFile>;

/// Sized slot wrapper so the current-file reference can live in an
/// `ArcSwap` (which cannot hold a fat pointer directly).
pub(crate) struct FileSlot(pub(crate) SharedFile);

/// Supplies the mapped files a rolling coordinator installs.
pub(crate) trait FileSource: Send + Sync {
    /// The file the coordinator starts with.
    fn initial_file(&self) -> Result<SharedFile, Error> {
        self.next_file()
    }

    /// The successor for a roll.
    fn next_file(&self) -> Result<SharedFile, Error>;

    /// Stop background work and release any unpublished file.
    fn shutdown(&self) -> Result<(), Error>;
}

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(0);

/// Process-wide monotonic id used to name background threads.
pub(crate) fn next_worker_id() -> u64 {
    NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed)
}
