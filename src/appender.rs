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
    io,
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use rand::Rng;
use rand_distr::{Distribution, Normal};
use tracing::{debug, warn};

use crate::{
    LogCore, WriterState,
    alloc::AllocationState,
    batch::EntryBatch,
    error::{Error, Result},
    index::LogIndexEntry,
    metrics::{
        APPEND_DURATION_HISTOGRAM, BYTES_LOGGED, ENTRY_BATCHES_PER_GROUP_HISTOGRAM,
        GROUP_COMMIT_DURATION_HISTOGRAM, SYNC_DURATION_HISTOGRAM,
    },
    types::EntryKind,
};

/// Manages the dedicated thread that drains the entry batch queue and
/// appends to the active segment.
pub(crate) struct AppendThread {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AppendThread {
    pub(crate) fn new() -> AppendThread {
        AppendThread { handle: Mutex::new(None) }
    }

    pub(crate) fn start(&self, core: Arc<LogCore>) -> Result<()> {
        let mut handle = self.handle.lock().expect("append thread mutex poisoned");
        debug_assert!(handle.is_none(), "append thread already started");
        let joined = thread::Builder::new()
            .name("wal-append".to_owned())
            .spawn(move || run(core))
            .map_err(io::Error::from)?;
        *handle = Some(joined);
        Ok(())
    }

    /// Joins the thread. The queue must already be shut down, which makes
    /// the run loop exit after its final drain.
    pub(crate) fn shutdown(&self) {
        let handle = self.handle.lock().expect("append thread mutex poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        };
    }
}

fn run(core: Arc<LogCore>) {
    loop {
        let mut batches: Vec<Arc<EntryBatch>> = Vec::new();
        if !core.queue.blocking_drain_to(&mut batches) {
            // Final drain: whatever was still enqueued will never be
            // appended.
            for batch in batches {
                batch.fail_pending(Error::ShuttingDown);
            }
            break;
        };

        ENTRY_BATCHES_PER_GROUP_HISTOGRAM.observe(batches.len() as f64);
        let group_timer = Instant::now();

        let mut all_commits = true;
        for batch in &batches {
            let data = batch.wait_ready();
            if let Err(err) = core.do_append(batch, &data) {
                warn!(tablet_id = %core.tablet_id, %err, "error appending batch to WAL");
                batch.mark_failed_to_append();
                if let Some(callback) = batch.take_callback() {
                    callback(Err(err));
                };
            };
            if all_commits && batch.kind() != EntryKind::Commit {
                all_commits = false;
            };
        }

        // One fsync covers the whole group. Commit-only groups skip it:
        // commits only record decisions about already-durable replicates
        // and are re-derived on replay.
        let sync_result = if all_commits { Ok(()) } else { core.sync() };
        match sync_result {
            Err(err) => {
                warn!(tablet_id = %core.tablet_id, %err, "error syncing WAL");
                // Nothing in the group is durable. Every batch whose
                // callback has not fired yet gets the sync error, including
                // those whose individual append returned OK.
                for batch in batches {
                    if let Some(callback) = batch.take_callback() {
                        callback(Err(err.clone()));
                    };
                }
            },
            Ok(()) => {
                for batch in batches {
                    if !batch.failed_to_append() {
                        batch.mark_appended_ok();
                        if let Some(callback) = batch.take_callback() {
                            callback(Ok(()));
                        };
                    };
                    // Destroy each batch before the next callback runs so
                    // cumulative memory stays bounded.
                    drop(batch);
                }
            },
        }
        GROUP_COMMIT_DURATION_HISTOGRAM.observe(group_timer.elapsed().as_secs_f64());
    }
    debug!(tablet_id = %core.tablet_id, "exiting WAL append thread");
}

impl LogCore {
    /// Appends one ready batch to the active segment, rolling over first if
    /// the batch would overflow it, then updates the reader bound, the log
    /// index and the footer statistics.
    pub(crate) fn do_append(&self, batch: &EntryBatch, data: &[u8]) -> Result<()> {
        let fraction = self.options.fault_injection.append_io_error_fraction;
        if fraction > 0.0 && rand::thread_rng().gen_bool(fraction) {
            return Err(io::Error::other("injected IOError in WAL append").into());
        };
        // Flush markers traverse the pipeline but are never persisted.
        if data.is_empty() {
            return Ok(());
        };

        let mut writer = self.writer.lock().expect("writer mutex poisoned");

        if writer.unhealthy {
            warn!(
                tablet_id = %self.tablet_id,
                "active segment marked unhealthy; forcing roll-over",
            );
            if self.allocator.state() == AllocationState::NotStarted {
                self.allocator.async_allocate()?;
            };
            self.roll_over(&mut writer)?;
            writer.unhealthy = false;
            writer.consecutive_append_failures = 0;
        };

        match self.allocator.state() {
            AllocationState::NotStarted => {
                let projected =
                    writer.active().written_offset() + data.len() as u64 + 4;
                if projected > self.options.max_segment_size() {
                    debug!(
                        tablet_id = %self.tablet_id,
                        "max segment size reached; starting new segment allocation",
                    );
                    self.allocator.async_allocate()?;
                    if !self.options.async_preallocate_segments {
                        self.roll_over(&mut writer)?;
                    };
                };
            },
            AllocationState::Finished => self.roll_over(&mut writer)?,
            AllocationState::InProgress => {
                debug!(tablet_id = %self.tablet_id, "segment allocation already in progress");
            },
        }

        let append_timer = Instant::now();
        let start_offset = match writer.active_mut().append_entry_batch(data, self.codec) {
            Ok(offset) => {
                writer.consecutive_append_failures = 0;
                offset
            },
            Err(err) => {
                writer.consecutive_append_failures += 1;
                if writer.consecutive_append_failures >= 2 {
                    writer.unhealthy = true;
                };
                return Err(err);
            },
        };
        APPEND_DURATION_HISTOGRAM.observe(append_timer.elapsed().as_secs_f64());
        BYTES_LOGGED.inc_by(data.len() as u64);

        // Publish how far replayers may read the active segment.
        self.reader.update_last_segment_offset(writer.active().written_offset());

        // Only replicate entries are indexed; commits and flush markers are
        // never looked up by Raft index.
        writer.footer.num_entries += batch.count() as u64;
        if batch.kind() == EntryKind::Replicate {
            for entry in batch.entries() {
                if let Some(op_id) = entry.replicate_op_id() {
                    self.index.add_entry(&LogIndexEntry {
                        op_id: op_id.clone(),
                        segment_sequence_number: writer.active_sequence_number,
                        offset_in_segment: start_offset,
                    })?;
                    writer.footer.observe_replicate_index(op_id.index);
                };
            }
        };

        Ok(())
    }

    /// Group sync of the active segment, honoring `force_fsync_all` and the
    /// fault-injection hooks.
    pub(crate) fn sync(&self) -> Result<()> {
        let injection = &self.options.fault_injection;
        if injection.inject_sync_latency {
            if let Ok(normal) =
                Normal::new(injection.sync_latency_ms_mean, injection.sync_latency_ms_stddev)
            {
                let sleep_ms = normal.sample(&mut rand::thread_rng());
                if sleep_ms > 0.0 {
                    warn!(sleep_ms, "injecting latency into WAL sync");
                    thread::sleep(Duration::from_millis(sleep_ms as u64));
                };
            };
        };
        if injection.sync_io_error_fraction > 0.0
            && rand::thread_rng().gen_bool(injection.sync_io_error_fraction)
        {
            return Err(io::Error::other("injected IOError in WAL sync").into());
        };

        if self.options.force_fsync_all {
            let sync_timer = Instant::now();
            let writer = self.writer.lock().expect("writer mutex poisoned");
            self.sync_segment(&writer)?;
            SYNC_DURATION_HISTOGRAM.observe(sync_timer.elapsed().as_secs_f64());
        };
        Ok(())
    }

    pub(crate) fn sync_segment(&self, writer: &WriterState) -> Result<()> {
        writer.active().sync()
    }
}
