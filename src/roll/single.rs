//! Purpose: Successor files for single-process rolling, mapped inline or
//! kept hot by a preallocator thread.
//! Invariants: a preallocated file is never published to consumers before
//! a roll takes it, so shutdown may delete it.
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tracing::warn;

use crate::core::concurrent::YieldPolicy;
use crate::core::error::{Error, ErrorKind};
use crate::core::framed::Framed;
use crate::core::single::SingleProcessFile;
use crate::roll::provider::FileNameProvider;
use crate::roll::{next_worker_id, FileSlot, FileSource, SharedFile};

pub(crate) struct SingleProcessSource {
    state: Arc<SourceState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct SourceState {
    capacity: u32,
    fill_with_zeros: bool,
    framed: bool,
    provider: Box<dyn FileNameProvider>,
    yield_policy: YieldPolicy,
    check_interval: Duration,
    keep_running: AtomicBool,
    preallocated: ArcSwapOption<FileSlot>,
}

impl SourceState {
    fn map_file(&self, path: &Path) -> Result<SharedFile, Error> {
        let file = SingleProcessFile::map(path, self.capacity, self.fill_with_zeros)?;
        Ok(if self.framed {
            Arc::new(Framed::new(file))
        } else {
            Arc::new(file)
        })
    }
}

impl SingleProcessSource {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        capacity: u32,
        fill_with_zeros: bool,
        framed: bool,
        provider: Box<dyn FileNameProvider>,
        yield_policy: YieldPolicy,
        preallocate: bool,
        check_interval: Duration,
    ) -> Self {
        let state = Arc::new(SourceState {
            capacity,
            fill_with_zeros,
            framed,
            provider,
            yield_policy,
            check_interval,
            keep_running: AtomicBool::new(true),
            preallocated: ArcSwapOption::from(None),
        });

        let worker = if preallocate {
            let worker_state = Arc::clone(&state);
            let handle = thread::Builder::new()
                .name(format!("carve-prealloc-{}", next_worker_id()))
                .spawn(move || preallocate_loop(&worker_state))
                .ok();
            if handle.is_none() {
                warn!("failed to spawn preallocator; rolls will allocate inline");
            }
            handle
        } else {
            None
        };

        Self {
            state,
            worker: Mutex::new(worker),
        }
    }

    fn preallocating(&self) -> bool {
        self.worker.lock().unwrap().is_some()
    }
}

impl FileSource for SingleProcessSource {
    fn next_file(&self) -> Result<SharedFile, Error> {
        if self.preallocating() {
            loop {
                if let Some(slot) = self.state.preallocated.swap(None) {
                    return Ok(slot.0.clone());
                }
                if !self.state.keep_running.load(Ordering::Acquire) {
                    return Err(Error::new(ErrorKind::Usage)
                        .with_message("file source is shut down"));
                }
                // Not preallocated yet; wait for the worker to catch up.
                self.state.yield_policy.idle();
            }
        } else {
            self.state.map_file(&self.state.provider.next_file())
        }
    }

    fn shutdown(&self) -> Result<(), Error> {
        self.state.keep_running.store(false, Ordering::Release);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
        if let Some(slot) = self.state.preallocated.swap(None) {
            slot.0.close()?;
            // Never published; nobody else can hold it.
            std::fs::remove_file(slot.0.path()).map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_path(slot.0.path())
                    .with_source(err)
            })?;
        }
        Ok(())
    }
}

fn preallocate_loop(state: &SourceState) {
    while state.keep_running.load(Ordering::Acquire) {
        if state.preallocated.load().is_none() {
            let path = state.provider.next_file();
            match state.map_file(&path) {
                Ok(file) => state.preallocated.store(Some(Arc::new(FileSlot(file)))),
                Err(err) => {
                    if state.keep_running.load(Ordering::Acquire) {
                        warn!(path = %path.display(), error = %err, "preallocation failed");
                    }
                    let _ = std::fs::remove_file(&path);
                }
            }
        } else {
            thread::park_timeout(state.check_interval);
        }
    }
}
