// Copyright Alexey Kotvitskiy
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
    sync::{Arc, Condvar, Mutex, mpsc},
    thread::{self, JoinHandle},
};

use rand::Rng;
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    segment::TMP_SEGMENT_PREFIX,
};

/// Where the next segment's allocation currently stands.
///
/// `Finished` is reset back to `NotStarted` when roll-over consumes the
/// allocated file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AllocationState {
    NotStarted,
    InProgress,
    Finished,
}

/// A placeholder segment file produced by the allocator, waiting to be
/// renamed into its sequence-numbered name at roll-over.
pub(crate) struct AllocatedSegment {
    pub(crate) path: PathBuf,
    pub(crate) file: File,
}

struct AllocSlot {
    state: AllocationState,
    result: Option<Result<AllocatedSegment>>,
}

struct AllocShared {
    wal_dir: PathBuf,
    max_segment_size: u64,
    preallocate: bool,
    reserved_bytes: u64,
    inject_error_fraction: f64,
    slot: Mutex<AllocSlot>,
    finished: Condvar,
}

/// Single-worker background executor that creates (and optionally
/// preallocates) the next segment file so roll-over is cheap.
pub(crate) struct SegmentAllocator {
    shared: Arc<AllocShared>,
    request_tx: Mutex<Option<mpsc::Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SegmentAllocator {
    pub(crate) fn start(
        wal_dir: impl AsRef<Path>,
        max_segment_size: u64,
        preallocate: bool,
        reserved_bytes: u64,
        inject_error_fraction: f64,
    ) -> Result<SegmentAllocator> {
        let shared = Arc::new(AllocShared {
            wal_dir: wal_dir.as_ref().to_path_buf(),
            max_segment_size,
            preallocate,
            reserved_bytes,
            inject_error_fraction,
            slot: Mutex::new(AllocSlot { state: AllocationState::NotStarted, result: None }),
            finished: Condvar::new(),
        });

        let (request_tx, request_rx) = mpsc::channel::<()>();
        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("wal-alloc".to_owned())
                .spawn(move || {
                    while request_rx.recv().is_ok() {
                        let result = allocate_segment(&shared);
                        if let Err(err) = &result {
                            warn!(%err, "segment allocation failed");
                        };
                        let mut slot = shared.slot.lock().expect("alloc mutex poisoned");
                        slot.result = Some(result);
                        slot.state = AllocationState::Finished;
                        drop(slot);
                        shared.finished.notify_all();
                    }
                })
                .map_err(io::Error::from)?
        };

        Ok(SegmentAllocator {
            shared,
            request_tx: Mutex::new(Some(request_tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub(crate) fn state(&self) -> AllocationState {
        self.shared.slot.lock().expect("alloc mutex poisoned").state
    }

    /// Submits the allocation of the next segment to the worker.
    pub(crate) fn async_allocate(&self) -> Result<()> {
        {
            let mut slot = self.shared.slot.lock().expect("alloc mutex poisoned");
            if slot.state != AllocationState::NotStarted {
                return Err(Error::IllegalState(
                    "segment allocation already requested".to_owned(),
                ));
            };
            slot.state = AllocationState::InProgress;
            slot.result = None;
        }

        let request_tx = self.request_tx.lock().expect("alloc mutex poisoned");
        match request_tx.as_ref().map(|tx| tx.send(())) {
            Some(Ok(())) => Ok(()),
            _ => {
                let mut slot = self.shared.slot.lock().expect("alloc mutex poisoned");
                slot.state = AllocationState::NotStarted;
                Err(Error::ShuttingDown)
            },
        }
    }

    /// Blocks until the in-flight allocation finishes, consumes its result,
    /// and resets the state machine to `NotStarted`.
    pub(crate) fn wait_and_take(&self) -> Result<AllocatedSegment> {
        let mut slot = self.shared.slot.lock().expect("alloc mutex poisoned");
        loop {
            match slot.state {
                AllocationState::Finished => {
                    slot.state = AllocationState::NotStarted;
                    return slot.result.take().expect("finished allocation has a result");
                },
                AllocationState::InProgress => {
                    slot = self.shared.finished.wait(slot).expect("alloc mutex poisoned");
                },
                AllocationState::NotStarted => {
                    return Err(Error::IllegalState(
                        "no segment allocation in flight".to_owned(),
                    ));
                },
            }
        }
    }

    /// Stops the worker. Any in-flight allocation completes normally first.
    pub(crate) fn shutdown(&self) {
        self.request_tx.lock().expect("alloc mutex poisoned").take();
        let worker = self.worker.lock().expect("alloc mutex poisoned").take();
        if let Some(worker) = worker {
            let _ = worker.join();
        };
    }
}

fn allocate_segment(shared: &AllocShared) -> Result<AllocatedSegment> {
    let tmp = tempfile::Builder::new()
        .prefix(TMP_SEGMENT_PREFIX)
        .rand_bytes(6)
        .tempfile_in(&shared.wal_dir)?;
    let (file, path) = tmp.keep().map_err(|e| Error::from(e.error))?;
    debug!(placeholder = %path.display(), "created placeholder segment");

    if shared.inject_error_fraction > 0.0
        && rand::thread_rng().gen_bool(shared.inject_error_fraction)
    {
        return Err(io::Error::other("injected IOError in segment preallocation").into());
    };

    if shared.preallocate {
        verify_sufficient_disk_space(
            &shared.wal_dir,
            shared.max_segment_size,
            shared.reserved_bytes,
        )?;
        file.set_len(shared.max_segment_size)?;
    };

    Ok(AllocatedSegment { path, file })
}

/// Checks that the WAL filesystem keeps at least `requested + reserved`
/// bytes free.
#[cfg(unix)]
fn verify_sufficient_disk_space(path: &Path, requested: u64, reserved: u64) -> Result<()> {
    use std::{ffi::CString, os::unix::ffi::OsStrExt};

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::InvalidArgument("WAL path contains NUL".to_owned()))?;
    // SAFETY: `c_path` is a valid NUL-terminated path and `stat` is a plain
    // output struct.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(io::Error::last_os_error().into());
    };

    let available = stat.f_bavail as u64 * stat.f_frsize as u64;
    if available < requested + reserved {
        return Err(io::Error::other(format!(
            "insufficient disk space to preallocate segment: {available} bytes available, \
             {requested} requested, {reserved} reserved"
        ))
        .into());
    };
    Ok(())
}

#[cfg(not(unix))]
fn verify_sufficient_disk_space(_path: &Path, _requested: u64, _reserved: u64) -> Result<()> {
    Ok(())
}
