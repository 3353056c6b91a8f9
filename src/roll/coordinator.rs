//! Purpose: Swap the active file when the current one exhausts capacity.
//! Role: Writers race on a CAS-guarded `allocating` flag; exactly one
//! becomes the swapper, closes the retired file (inline or on a one-shot
//! background thread) and installs the successor. Losers adopt whatever the
//! winner installed.
//! Invariants: at most one writer holds `allocating`; a thread that
//! acquired it while `current` was still the file it observed is the sole
//! swapper for that file.
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use arc_swap::ArcSwap;
use tracing::error;

use crate::core::concurrent::YieldPolicy;
use crate::core::error::Error;
use crate::roll::{next_worker_id, FileSlot, FileSource, SharedFile};

/// Invoked with the path of every rolled file after it has been closed.
pub type FileCompleteFn = Arc<dyn Fn(&Path) + Send + Sync>;

pub(crate) struct RollCoordinator<S: FileSource> {
    allocating: AtomicBool,
    current: ArcSwap<FileSlot>,
    source: S,
    yield_policy: YieldPolicy,
    async_close: bool,
    file_complete: Option<FileCompleteFn>,
    closers: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: FileSource> RollCoordinator<S> {
    pub(crate) fn new(
        source: S,
        yield_policy: YieldPolicy,
        async_close: bool,
        file_complete: Option<FileCompleteFn>,
    ) -> Result<Self, Error> {
        let first = source.initial_file()?;
        Ok(Self {
            allocating: AtomicBool::new(false),
            current: ArcSwap::from_pointee(FileSlot(first)),
            source,
            yield_policy,
            async_close,
            file_complete,
            closers: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn current_file(&self) -> SharedFile {
        self.current.load().0.clone()
    }

    /// The file to use for the next reservation, rolling if the current one
    /// is exhausted.
    pub(crate) fn file_for_write(&self) -> Result<SharedFile, Error> {
        let observed = self.current.load_full();
        if observed.0.has_available_capacity() {
            return Ok(observed.0.clone());
        }

        while self
            .allocating
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.yield_policy.idle();
        }

        let result = (|| {
            let reloaded = self.current.load_full();
            if !Arc::ptr_eq(&reloaded, &observed) {
                // Another writer already rolled; adopt its file.
                return Ok(reloaded.0.clone());
            }
            self.close_file(observed.0.clone(), self.async_close);
            let next = self.source.next_file()?;
            self.current.store(Arc::new(FileSlot(next.clone())));
            Ok(next)
        })();
        self.allocating.store(false, Ordering::Release);
        result
    }

    /// Wait for the file's writes to settle, close it, and report it
    /// complete. Failures are logged; a roll must not take the write path
    /// down with it.
    fn close_file(&self, file: SharedFile, async_close: bool) {
        let yield_policy = self.yield_policy;
        let callback = self.file_complete.clone();
        let task = move || {
            while file.is_pending() {
                yield_policy.idle();
            }
            match file.close() {
                Ok(()) => {
                    if let Some(on_complete) = &callback {
                        on_complete(file.path());
                    }
                }
                Err(err) => {
                    error!(path = %file.path().display(), error = %err, "failed to close rolled file");
                }
            }
        };

        if async_close {
            let spawned = thread::Builder::new()
                .name(format!("carve-close-{}", next_worker_id()))
                .spawn(task);
            match spawned {
                Ok(handle) => self.closers.lock().unwrap().push(handle),
                Err(err) => error!(error = %err, "failed to spawn close thread"),
            }
        } else {
            task();
        }
    }

    /// Stop the source, close the current file synchronously, and join any
    /// outstanding async closers.
    pub(crate) fn close(&self) -> Result<(), Error> {
        self.source.shutdown()?;
        let current = self.current.load_full();
        self.close_file(current.0.clone(), false);
        for handle in self.closers.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
        Ok(())
    }
}
