//! Purpose: Successor files for multi-process rolling, agreed through the
//! coordination file.
//! Role: Every roll consults `CoordinationFile::next` with the locally
//! cached payload; matching contents mean this instance maps the newly
//! announced file, diverged contents mean a peer already advanced and its
//! choice is adopted.
//! Invariants: on a swap the new current is installed before the
//! preallocated slot is cleared; the reverse order would let a racing
//! preallocator re-observe the stale preallocation.
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tracing::warn;

use crate::core::concurrent::YieldPolicy;
use crate::core::error::{Error, ErrorKind};
use crate::core::framed::Framed;
use crate::core::multi::MultiProcessFile;
use crate::roll::coordination::{current_path, preallocated_path, CoordinationFile};
use crate::roll::{next_worker_id, FileSlot, FileSource, SharedFile};

pub(crate) struct MultiProcessSource {
    state: Arc<MultiState>,
    initial: Mutex<Option<SharedFile>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct MultiState {
    coordination: CoordinationFile,
    capacity: u32,
    fill_with_zeros: bool,
    framed: bool,
    yield_policy: YieldPolicy,
    check_interval: Duration,
    keep_running: AtomicBool,
    // Last coordination payload this instance has seen.
    contents: Mutex<String>,
    current: ArcSwapOption<FileSlot>,
    preallocated: ArcSwapOption<FileSlot>,
}

impl MultiState {
    fn map_file(&self, path: &Path) -> Result<SharedFile, Error> {
        let file = MultiProcessFile::map(path, self.capacity, self.fill_with_zeros)?;
        Ok(if self.framed {
            Arc::new(Framed::new(file))
        } else {
            Arc::new(file)
        })
    }

    /// Advance (or adopt) the coordination payload and remember it locally.
    fn advance_coordination(&self) -> String {
        let mut contents = self.contents.lock().unwrap();
        let new_contents = self.coordination.next(&contents);
        *contents = new_contents.clone();
        new_contents
    }

    fn current_file_path(&self) -> Option<PathBuf> {
        self.current
            .load_full()
            .map(|slot| slot.0.path().to_path_buf())
    }
}

impl MultiProcessSource {
    pub(crate) fn new(
        coordination: CoordinationFile,
        capacity: u32,
        fill_with_zeros: bool,
        framed: bool,
        yield_policy: YieldPolicy,
        preallocate: bool,
        check_interval: Duration,
    ) -> Result<Self, Error> {
        let state = Arc::new(MultiState {
            coordination,
            capacity,
            fill_with_zeros,
            framed,
            yield_policy,
            check_interval,
            keep_running: AtomicBool::new(true),
            contents: Mutex::new(String::new()),
            current: ArcSwapOption::from(None),
            preallocated: ArcSwapOption::from(None),
        });

        // Bootstrap before the preallocator starts so the worker never races
        // the initial handshake.
        let contents = state.advance_coordination();
        let first = state.map_file(Path::new(current_path(&contents)))?;
        state.current.store(Some(Arc::new(FileSlot(first.clone()))));
        if preallocate {
            if let Some(pre) = preallocated_path(&contents) {
                let file = state.map_file(Path::new(pre))?;
                state.preallocated.store(Some(Arc::new(FileSlot(file))));
            }
        }

        let worker = if preallocate {
            let worker_state = Arc::clone(&state);
            let handle = thread::Builder::new()
                .name(format!("carve-prealloc-{}", next_worker_id()))
                .spawn(move || preallocate_loop(&worker_state))
                .ok();
            if handle.is_none() {
                warn!("failed to spawn preallocator; rolls will wait for peers");
            }
            handle
        } else {
            None
        };

        Ok(Self {
            state,
            initial: Mutex::new(Some(first)),
            worker: Mutex::new(worker),
        })
    }

    fn preallocating(&self) -> bool {
        self.worker.lock().unwrap().is_some()
    }
}

impl FileSource for MultiProcessSource {
    fn initial_file(&self) -> Result<SharedFile, Error> {
        match self.initial.lock().unwrap().take() {
            Some(file) => Ok(file),
            None => self.next_file(),
        }
    }

    fn next_file(&self) -> Result<SharedFile, Error> {
        let state = &self.state;
        let file = if self.preallocating() {
            loop {
                if let Some(slot) = state.preallocated.load_full() {
                    break slot.0.clone();
                }
                if !state.keep_running.load(Ordering::Acquire) {
                    return Err(Error::new(ErrorKind::Usage)
                        .with_message("file source is shut down"));
                }
                state.yield_policy.idle();
            }
        } else {
            let contents = state.advance_coordination();
            state.map_file(Path::new(current_path(&contents)))?
        };

        state.current.store(Some(Arc::new(FileSlot(file.clone()))));
        // Clearing the preallocated slot must happen last; see the module
        // invariants.
        state.preallocated.store(None);
        Ok(file)
    }

    fn shutdown(&self) -> Result<(), Error> {
        self.state.keep_running.store(false, Ordering::Release);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
        if let Some(slot) = self.state.preallocated.swap(None) {
            // Close our mapping only; a peer process may already be using
            // the file, so it is never deleted here.
            slot.0.close()?;
        }
        self.state.coordination.close()
    }
}

fn preallocate_loop(state: &MultiState) {
    while state.keep_running.load(Ordering::Acquire) {
        if state.preallocated.load().is_some() {
            thread::park_timeout(state.check_interval);
            continue;
        }

        let local_current = state.current_file_path();
        let contents = state.advance_coordination();
        let announced_current = current_path(&contents).to_string();

        let target = match preallocated_path(&contents) {
            // A peer advanced without preallocation; its current file is
            // what we will swap to.
            None => announced_current.clone(),
            Some(pre) => {
                if local_current.as_deref() != Some(Path::new(&announced_current)) {
                    // More than one file behind; jump straight to current.
                    announced_current.clone()
                } else {
                    pre.to_string()
                }
            }
        };

        match state.map_file(Path::new(&target)) {
            Ok(file) => state.preallocated.store(Some(Arc::new(FileSlot(file)))),
            Err(err) => {
                if state.keep_running.load(Ordering::Acquire) {
                    warn!(path = %target, error = %err, "preallocation failed");
                }
            }
        }
    }
}
