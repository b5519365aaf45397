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

//! Per-tablet write-ahead log (WAL) for a replicated tabular store.
//!
//! Every state-changing operation (a replicated proposal or a local commit
//! decision) is persisted here before it is applied, and the log is read
//! back at bootstrap to rebuild the replica's state.
//!
//! The log is a sequence of segment files of framed, CRC32C-checked entry
//! batches. Producers reserve a batch, serialize it off the hot path and
//! hand it to a dedicated append thread through a byte-bounded queue; the
//! appender drains the queue in groups and fsyncs once per group, so
//! durability cost is amortized over every batch that was waiting. A
//! background worker preallocates the next segment so roll-over stays off
//! the append path, and a sparse on-disk index maps each replicated
//! operation to the batch record that holds it.
//!
//! The WAL does not interpret operation payloads and enforces no consensus
//! rules; retention is driven by the two watermarks the consensus layer
//! passes to [`Log::gc`].

pub mod batch;
mod codec;
pub mod compression;
pub mod config;
pub mod error;
pub mod index;
pub mod reader;
pub mod segment;
pub mod types;
mod alloc;
mod appender;
mod metrics;
mod queue;

use std::{
    collections::BTreeMap,
    fs::{self, File},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock, mpsc},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::{
    alloc::{AllocatedSegment, AllocationState, SegmentAllocator},
    appender::AppendThread,
    batch::EntryBatch,
    metrics::ROLL_DURATION_HISTOGRAM,
    queue::EntryBatchQueue,
    segment::{TMP_SEGMENT_PREFIX, WritableSegment, segment_file_name},
};
pub use crate::{
    batch::{ReservedEntryBatch, StatusCallback},
    compression::CodecType,
    config::{FaultInjection, LogOptions},
    error::{Error, Result},
    index::{LogIndex, LogIndexEntry},
    reader::LogReader,
    segment::{BatchScanner, ReadableSegment, ScannedBatch},
    types::{
        CommitMsg, EntryKind, LogEntry, LogEntryBatchPb, OpId, RaftIndex, ReplicateMsg,
        RetentionIndexes, SegmentFooterPb, SegmentHeaderPb, SegmentSequenceNumber,
    },
};

/// Lifecycle of the log: `Initialized → Writing → Closed`, one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LogState {
    Initialized,
    Writing,
    Closed,
}

/// Schema recorded in the next segment's header, updatable without
/// blocking producers.
struct SchemaSlot {
    schema: Vec<u8>,
    version: u32,
}

/// Writer-side state: the active segment and its accumulating footer.
/// Touched only by the append thread and by administrative operations
/// (roll-over, close), which serialize on this lock.
pub(crate) struct WriterState {
    active: Option<WritableSegment>,
    pub(crate) active_sequence_number: SegmentSequenceNumber,
    pub(crate) footer: SegmentFooterPb,
    pub(crate) consecutive_append_failures: u32,
    pub(crate) unhealthy: bool,
}

impl WriterState {
    pub(crate) fn active(&self) -> &WritableSegment {
        self.active.as_ref().expect("log has no active segment")
    }

    pub(crate) fn active_mut(&mut self) -> &mut WritableSegment {
        self.active.as_mut().expect("log has no active segment")
    }
}

/// State shared between the facade, the append thread and the allocator.
pub(crate) struct LogCore {
    pub(crate) options: LogOptions,
    wal_dir: PathBuf,
    pub(crate) tablet_id: String,
    pub(crate) codec: CodecType,
    state: RwLock<LogState>,
    schema: Mutex<SchemaSlot>,
    last_entry_op_id: RwLock<Option<OpId>>,
    pub(crate) queue: EntryBatchQueue,
    pub(crate) index: Arc<LogIndex>,
    pub(crate) reader: Arc<LogReader>,
    pub(crate) writer: Mutex<WriterState>,
    pub(crate) allocator: SegmentAllocator,
    append_thread: AppendThread,
}

/// The per-tablet WAL facade.
///
/// Producers call [`Log::reserve`] followed by [`Log::async_append`] (or one
/// of the convenience wrappers); the registered callback fires exactly once
/// with the batch's fate. Dropping the log closes it.
pub struct Log {
    core: Arc<LogCore>,
}

impl Log {
    /// Opens the WAL in `wal_dir`, replaying segment metadata left by a
    /// previous incarnation, allocating a fresh active segment and starting
    /// the append and allocation workers.
    pub fn open(
        options: LogOptions,
        wal_dir: impl AsRef<Path>,
        tablet_id: impl Into<String>,
        schema: Vec<u8>,
        schema_version: u32,
    ) -> Result<Log> {
        options.validate()?;
        let tablet_id = tablet_id.into();
        let wal_dir = wal_dir.as_ref().to_path_buf();
        fs::create_dir_all(&wal_dir)?;
        remove_stale_tmp_files(&wal_dir);

        let codec = CodecType::from_name(&options.compression_codec)?;
        let index = Arc::new(LogIndex::open(&wal_dir)?);
        let reader = Arc::new(LogReader::open(&wal_dir, index.clone())?);

        // Continue where a previous incarnation left off in terms of
        // sequence numbers.
        let active_sequence_number = reader.highest_sequence_number();
        if reader.num_segments() != 0 {
            info!(
                tablet_id = %tablet_id,
                num_segments = reader.num_segments(),
                "using existing WAL segments",
            );
        };
        if options.force_fsync_all {
            info!(tablet_id = %tablet_id, "log is configured to fsync on every append group");
        };

        let allocator = SegmentAllocator::start(
            &wal_dir,
            options.max_segment_size(),
            options.preallocate_segments,
            options.fs_wal_dir_reserved_bytes,
            options.fault_injection.preallocate_io_error_fraction,
        )?;

        let core = Arc::new(LogCore {
            queue: EntryBatchQueue::new(options.group_commit_queue_size_bytes),
            options,
            wal_dir,
            tablet_id,
            codec,
            state: RwLock::new(LogState::Initialized),
            schema: Mutex::new(SchemaSlot { schema, version: schema_version }),
            last_entry_op_id: RwLock::new(None),
            index,
            reader,
            writer: Mutex::new(WriterState {
                active: None,
                active_sequence_number,
                footer: SegmentFooterPb::default(),
                consecutive_append_failures: 0,
                unhealthy: false,
            }),
            allocator,
            append_thread: AppendThread::new(),
        });

        if let Err(err) = Log::finish_open(&core) {
            core.queue.shutdown();
            core.allocator.shutdown();
            core.append_thread.shutdown();
            return Err(err);
        };
        Ok(Log { core })
    }

    /// A new segment is always created when the log starts.
    fn finish_open(core: &Arc<LogCore>) -> Result<()> {
        core.allocator.async_allocate()?;
        {
            let mut writer = core.writer.lock().expect("writer mutex poisoned");
            let allocated = core.allocator.wait_and_take()?;
            core.switch_to_allocated_segment(&mut writer, allocated)?;
        }
        core.append_thread.start(core.clone())?;
        *core.state.write().expect("state lock poisoned") = LogState::Writing;
        Ok(())
    }

    /// Validates and enqueues a batch of same-kind entries, returning the
    /// handle the producer must complete with [`Log::async_append`].
    ///
    /// Blocks while the queue is over its byte capacity. Advances the
    /// accepted high-water mark returned by [`Log::latest_entry_op_id`].
    pub fn reserve(&self, kind: EntryKind, batch: LogEntryBatchPb) -> Result<ReservedEntryBatch> {
        self.core.check_writing()?;

        if kind == EntryKind::Unknown {
            return Err(Error::InvalidArgument("cannot reserve a batch of unknown kind".into()));
        };
        for entry in &batch.entries {
            if entry.kind() != kind {
                return Err(Error::InvalidArgument(format!(
                    "entry of kind {:?} disagrees with batch kind {:?}",
                    entry.kind(),
                    kind
                )));
            };
            match kind {
                EntryKind::FlushMarker
                    if entry.replicate.is_some() || entry.commit.is_some() =>
                {
                    return Err(Error::InvalidArgument(
                        "flush marker entries must carry no payload".into(),
                    ));
                },
                EntryKind::Replicate if entry.replicate_op_id().is_none() => {
                    return Err(Error::InvalidArgument(
                        "replicate entry is missing its op id".into(),
                    ));
                },
                _ => {},
            }
        }

        let batch = Arc::new(EntryBatch::new(kind, batch));
        batch.mark_reserved();

        // The high-water mark tracks the highest *accepted* operation, not
        // the highest durable one; consumers needing a durable anchor must
        // use the batch callback or wait_until_all_flushed.
        if let Some(op_id) = batch.max_replicate_op_id() {
            let mut last = self.core.last_entry_op_id.write().expect("op id lock poisoned");
            if last.as_ref() < Some(&op_id) {
                *last = Some(op_id);
            };
        };

        if !self.core.queue.blocking_put(batch.clone()) {
            return Err(Error::ShuttingDown);
        };
        Ok(ReservedEntryBatch(batch))
    }

    /// Serializes the reserved batch outside any log-global lock, attaches
    /// its completion callback and releases it to the append thread.
    pub fn async_append(&self, reserved: ReservedEntryBatch, callback: StatusCallback) {
        reserved.0.serialize_and_mark_ready(callback);
    }

    /// Reserves and appends a batch of replicate messages. The payload
    /// buffers are shared with the caller, which keeps ownership of its
    /// messages while the append is in flight.
    pub fn async_append_replicates(
        &self,
        replicates: &[ReplicateMsg],
        callback: StatusCallback,
    ) -> Result<()> {
        let entries = replicates.iter().map(|r| LogEntry::replicate(r.clone())).collect();
        let reserved = self.reserve(EntryKind::Replicate, LogEntryBatchPb { entries })?;
        self.async_append(reserved, callback);
        Ok(())
    }

    /// Reserves and appends a single commit message.
    pub fn async_append_commit(
        &self,
        commit: CommitMsg,
        callback: StatusCallback,
    ) -> Result<()> {
        let fraction = self.core.options.fault_injection.crash_before_append_commit_fraction;
        if fraction > 0.0 && rand::thread_rng().gen_bool(fraction) {
            error!(tablet_id = %self.core.tablet_id, "injected crash before appending commit");
            std::process::abort();
        };

        let entries = vec![LogEntry::commit(commit)];
        let reserved = self.reserve(EntryKind::Commit, LogEntryBatchPb { entries })?;
        self.async_append(reserved, callback);
        Ok(())
    }

    /// Blocks until everything enqueued before this call has been fully
    /// processed: appended and, unless commit-only, fsynced.
    ///
    /// Implemented with a flush-marker batch that traverses the queue but
    /// writes no bytes to disk.
    pub fn wait_until_all_flushed(&self) -> Result<()> {
        let batch = LogEntryBatchPb { entries: vec![LogEntry::flush_marker()] };
        let reserved = self.reserve(EntryKind::FlushMarker, batch)?;
        let (tx, rx) = mpsc::channel();
        self.async_append(
            reserved,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        rx.recv().map_err(|_| Error::ShuttingDown)?
    }

    /// Highest replicate [`OpId`] accepted by [`Log::reserve`], or the
    /// minimum op id if none was accepted yet. An upper bound, not a
    /// durability guarantee.
    pub fn latest_entry_op_id(&self) -> OpId {
        self.core
            .last_entry_op_id
            .read()
            .expect("op id lock poisoned")
            .clone()
            .unwrap_or_default()
    }

    /// Deletes the longest prefix of closed segments no longer needed under
    /// `retention`, trims the reader and GCs the log index. Returns how
    /// many segment files were removed.
    pub fn gc(&self, retention: RetentionIndexes) -> Result<usize> {
        info!(
            tablet_id = %self.core.tablet_id,
            for_durability = retention.for_durability,
            for_peers = retention.for_peers,
            "running WAL GC",
        );

        let segments_to_delete = {
            let state = self.core.state.write().expect("state lock poisoned");
            if *state != LogState::Writing {
                return Err(Error::IllegalState("log is not in writing state".into()));
            };

            let snapshot = self.core.reader.segments_snapshot();
            let prefix_len = gc_prefix_len(
                &snapshot,
                retention,
                self.core.options.min_segments_to_retain,
                self.core.options.max_segments_to_retain,
            );
            if prefix_len == 0 {
                debug!(tablet_id = %self.core.tablet_id, "no segments to delete");
                return Ok(0);
            };

            let to_delete = snapshot[..prefix_len].to_vec();
            // Unreference the prefix before touching any file.
            self.core
                .reader
                .trim_segments_up_to_and_including(to_delete[prefix_len - 1].sequence_number())?;
            to_delete
        };

        let mut num_deleted = 0;
        for segment in &segments_to_delete {
            info!(
                tablet_id = %self.core.tablet_id,
                segment = %segment.path().display(),
                min_replicate_index = segment.footer().and_then(|f| f.min_replicate_index),
                max_replicate_index = segment.footer().and_then(|f| f.max_replicate_index),
                "deleting WAL segment",
            );
            match fs::remove_file(segment.path()) {
                Ok(()) => num_deleted += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    warn!(
                        segment = %segment.path().display(),
                        "segment file already gone; treating as deleted",
                    );
                    num_deleted += 1;
                },
                Err(err) => return Err(err.into()),
            }
        }

        if let Some(min_remaining) = self.core.reader.min_replicate_index() {
            self.core.index.gc(min_remaining)?;
        };
        Ok(num_deleted)
    }

    /// Total bytes the next [`Log::gc`] call with `retention` would
    /// reclaim.
    pub fn gcable_data_size(&self, retention: RetentionIndexes) -> Result<u64> {
        self.core.check_writing()?;
        let snapshot = self.core.reader.segments_snapshot();
        let prefix_len = gc_prefix_len(
            &snapshot,
            retention,
            self.core.options.min_segments_to_retain,
            self.core.options.max_segments_to_retain,
        );
        Ok(snapshot[..prefix_len].iter().map(|s| s.file_size()).sum())
    }

    /// Cumulative replay size, keyed by each closed segment's max replicate
    /// index: the value is how many bytes must be replayed if everything up
    /// to that index is already durable.
    pub fn replay_size_map(&self) -> Result<BTreeMap<RaftIndex, u64>> {
        self.core.check_writing()?;
        let snapshot = self.core.reader.segments_snapshot();
        let mut replay_size = BTreeMap::new();
        let mut cumulative = 0;
        for segment in snapshot.iter().rev() {
            let Some(footer) = segment.footer() else { continue };
            cumulative += segment.file_size();
            replay_size.insert(footer.max_replicate_index.unwrap_or(0), cumulative);
        }
        Ok(replay_size)
    }

    /// Synchronously closes the active segment and switches to a freshly
    /// allocated one. Administrative operation; the append path rolls on
    /// its own as segments fill.
    pub fn allocate_segment_and_roll_over(&self) -> Result<()> {
        self.core.check_writing()?;
        let mut writer = self.core.writer.lock().expect("writer mutex poisoned");
        if self.core.allocator.state() == AllocationState::NotStarted {
            self.core.allocator.async_allocate()?;
        };
        self.core.roll_over(&mut writer)
    }

    /// Records the schema stamped into the header of the next segment.
    pub fn set_schema_for_next_segment(&self, schema: Vec<u8>, version: u32) {
        let mut slot = self.core.schema.lock().expect("schema lock poisoned");
        slot.schema = schema;
        slot.version = version;
    }

    /// Registry of readable segments, for bootstrap replay and peer
    /// catch-up.
    pub fn reader(&self) -> &Arc<LogReader> {
        &self.core.reader
    }

    /// The persistent replicate-index → batch-location mapping.
    pub fn index(&self) -> &Arc<LogIndex> {
        &self.core.index
    }

    /// Shuts down the queue and workers, fails still-pending batches with
    /// [`Error::ShuttingDown`], closes the active segment and transitions
    /// to `Closed`. Idempotent.
    pub fn close(&self) -> Result<()> {
        self.core.queue.shutdown();
        self.core.append_thread.shutdown();
        self.core.allocator.shutdown();

        let mut state = self.core.state.write().expect("state lock poisoned");
        match *state {
            LogState::Writing => {
                {
                    let mut writer = self.core.writer.lock().expect("writer mutex poisoned");
                    self.core.close_current_segment(&mut writer)?;
                    let closed = writer.active.take().expect("log has no active segment");
                    self.core.replace_segment_in_reader(&closed)?;
                }
                *state = LogState::Closed;
                info!(tablet_id = %self.core.tablet_id, "WAL closed");
                Ok(())
            },
            LogState::Closed => {
                debug!(tablet_id = %self.core.tablet_id, "WAL already closed");
                Ok(())
            },
            LogState::Initialized => {
                *state = LogState::Closed;
                Ok(())
            },
        }
    }
}

impl Drop for Log {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(tablet_id = %self.core.tablet_id, %err, "error closing WAL");
        };
    }
}

impl LogCore {
    fn check_writing(&self) -> Result<()> {
        let state = self.state.read().expect("state lock poisoned");
        if *state != LogState::Writing {
            return Err(Error::IllegalState(format!(
                "log is not in writing state: {:?}",
                *state
            )));
        };
        Ok(())
    }

    /// Closes the outgoing active segment: stamps the close timestamp into
    /// the accumulated footer and writes it out, fsyncing unconditionally.
    pub(crate) fn close_current_segment(&self, writer: &mut WriterState) -> Result<()> {
        if writer.footer.min_replicate_index.is_none() {
            debug!(
                tablet_id = %self.tablet_id,
                segment = %writer.active().path().display(),
                "closing a segment without any replicate message",
            );
        };
        writer.footer.close_timestamp_micros = now_micros();
        let footer = writer.footer.clone();
        writer.active_mut().write_footer_and_close(&footer)
    }

    /// Rolls the log to the segment produced by the allocator: syncs and
    /// closes the outgoing segment, then swaps the allocated one in.
    pub(crate) fn roll_over(&self, writer: &mut WriterState) -> Result<()> {
        let roll_timer = Instant::now();
        // Surfaces any allocation error; blocks if allocation is in flight.
        let allocated = self.allocator.wait_and_take()?;

        self.sync_segment(writer)?;
        self.close_current_segment(writer)?;
        self.switch_to_allocated_segment(writer, allocated)?;

        info!(
            tablet_id = %self.tablet_id,
            segment = %writer.active().path().display(),
            "rolled over to a new WAL segment",
        );
        ROLL_DURATION_HISTOGRAM.observe(roll_timer.elapsed().as_secs_f64());
        Ok(())
    }

    /// Renames the allocated placeholder to its sequence-numbered name,
    /// writes the new header, and re-registers segments with the reader:
    /// the outgoing active segment (if any) is replaced by its closed
    /// readable form, and the new one is appended as the active tail.
    pub(crate) fn switch_to_allocated_segment(
        &self,
        writer: &mut WriterState,
        allocated: AllocatedSegment,
    ) -> Result<()> {
        writer.active_sequence_number += 1;
        let new_path = self.wal_dir.join(segment_file_name(writer.active_sequence_number));
        fs::rename(&allocated.path, &new_path)?;
        if self.options.force_fsync_all {
            File::open(&self.wal_dir)?.sync_all()?;
        };

        let header = {
            let slot = self.schema.lock().expect("schema lock poisoned");
            SegmentHeaderPb {
                sequence_number: writer.active_sequence_number,
                tablet_id: self.tablet_id.clone().into_bytes(),
                schema: slot.schema.clone(),
                schema_version: slot.version,
                compression_codec: self.codec as i32,
            }
        };
        let mut new_segment = WritableSegment::new(new_path.clone(), allocated.file);
        new_segment.write_header(header.clone())?;

        // The footer accumulates anew for the new segment.
        writer.footer = SegmentFooterPb::default();

        if let Some(closed) = writer.active.take() {
            self.replace_segment_in_reader(&closed)?;
        };

        let readable = ReadableSegment::open_with_header(
            &new_path,
            header,
            new_segment.written_offset(),
        )?;
        self.reader.append_empty_segment(readable)?;

        writer.active = Some(new_segment);
        Ok(())
    }

    /// Swaps the placeholder entry for the now-closed segment so replayers
    /// see its real footer.
    pub(crate) fn replace_segment_in_reader(&self, closed: &WritableSegment) -> Result<()> {
        debug_assert!(closed.is_closed(), "replacing a segment that was never closed");
        let readable = ReadableSegment::open(closed.path())?;
        self.reader.replace_last(readable)
    }
}

/// Length of the deletable prefix of `segments` under `retention`.
///
/// A segment is deletable only if enough segments remain after it, it has a
/// footer, and its operations are no longer needed for durability; a
/// segment still needed by a lagging peer survives unless the remaining
/// count exceeds `max_retain`. Ties break toward keeping, and an unfooted
/// segment stops the scan.
fn gc_prefix_len(
    segments: &[Arc<ReadableSegment>],
    retention: RetentionIndexes,
    min_retain: usize,
    max_retain: usize,
) -> usize {
    let mut remaining = segments.len();
    let mut prefix_len = 0;
    for segment in segments {
        if remaining <= min_retain {
            break;
        };
        let Some(footer) = segment.footer() else { break };
        let max_idx = footer.max_replicate_index.unwrap_or(0);
        if max_idx >= retention.for_durability {
            break;
        };
        if max_idx >= retention.for_peers && remaining <= max_retain {
            break;
        };
        prefix_len += 1;
        remaining -= 1;
    }
    prefix_len
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Removes placeholder files a crashed allocator may have left behind.
fn remove_stale_tmp_files(wal_dir: &Path) {
    let Ok(dir_entries) = fs::read_dir(wal_dir) else { return };
    for dir_entry in dir_entries.flatten() {
        let name = dir_entry.file_name();
        if name.to_str().is_some_and(|n| n.starts_with(TMP_SEGMENT_PREFIX)) {
            warn!(file = ?name, "removing stale placeholder segment file");
            let _ = fs::remove_file(dir_entry.path());
        };
    }
}

#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;

    use bytes::Bytes;
    use prost::Message;
    use tempfile::tempdir;

    use super::*;

    /// Builds a closed (or unfooted) segment file and returns its readable
    /// form, for driving the GC prefix computation directly.
    fn build_segment(dir: &Path, seqno: u64, max_index: Option<u64>, close: bool) -> Arc<ReadableSegment> {
        let path = dir.join(segment_file_name(seqno));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .unwrap();
        let mut segment = WritableSegment::new(path.clone(), file);
        segment
            .write_header(SegmentHeaderPb {
                sequence_number: seqno,
                tablet_id: b"tablet-test".to_vec(),
                schema: Vec::new(),
                schema_version: 0,
                compression_codec: CodecType::NoCompression as i32,
            })
            .unwrap();

        let mut footer = SegmentFooterPb::default();
        if let Some(max_index) = max_index {
            let entries = vec![LogEntry::replicate(ReplicateMsg {
                id: Some(OpId::new(1, max_index)),
                payload: Bytes::from_static(b"op"),
            })];
            let data = LogEntryBatchPb { entries }.encode_to_vec();
            segment.append_entry_batch(&data, CodecType::NoCompression).unwrap();
            footer.num_entries = 1;
            footer.observe_replicate_index(max_index);
        };
        if close {
            segment.write_footer_and_close(&footer).unwrap();
        };
        Arc::new(ReadableSegment::open(&path).unwrap())
    }

    #[test]
    fn test_gc_prefix_respects_retention_indexes() {
        let dir = tempdir().unwrap();
        let mut segments: Vec<_> = (1..=6)
            .map(|i| build_segment(dir.path(), i, Some(i * 10), true))
            .collect();
        segments.push(build_segment(dir.path(), 7, None, false));

        // Matches the durability watermark: 10 and 20 are deletable, 30 is
        // kept because a peer still needs it.
        let prefix =
            gc_prefix_len(&segments, RetentionIndexes::new(35, 25), 2, 10);
        assert_eq!(prefix, 2);
    }

    #[test]
    fn test_gc_prefix_honors_min_segments_to_retain() {
        let dir = tempdir().unwrap();
        let segments: Vec<_> = (1..=3)
            .map(|i| build_segment(dir.path(), i, Some(i * 10), true))
            .collect();

        // Everything is deletable by the watermarks, but two must remain.
        let prefix =
            gc_prefix_len(&segments, RetentionIndexes::new(1000, 1000), 2, 10);
        assert_eq!(prefix, 1);
    }

    #[test]
    fn test_gc_prefix_deletes_peer_needed_segments_over_cap() {
        let dir = tempdir().unwrap();
        let segments: Vec<_> = (1..=5)
            .map(|i| build_segment(dir.path(), i, Some(i * 10), true))
            .collect();

        // Peers still need everything, but only three segments may remain.
        let prefix = gc_prefix_len(&segments, RetentionIndexes::new(1000, 0), 1, 3);
        assert_eq!(prefix, 2);
    }

    #[test]
    fn test_gc_prefix_stops_at_unfooted_segment() {
        let dir = tempdir().unwrap();
        let segments = vec![
            build_segment(dir.path(), 1, Some(10), false),
            build_segment(dir.path(), 2, Some(20), true),
        ];

        let prefix =
            gc_prefix_len(&segments, RetentionIndexes::new(1000, 1000), 1, 10);
        assert_eq!(prefix, 0);
    }

    #[test]
    fn test_gc_with_zero_durability_watermark() {
        let dir = tempdir().unwrap();
        let segments: Vec<_> = (1..=3)
            .map(|i| build_segment(dir.path(), i, Some(i * 10), true))
            .collect();

        // Nothing is below for_durability = 0, so nothing may go.
        let prefix = gc_prefix_len(&segments, RetentionIndexes::new(0, 0), 1, 10);
        assert_eq!(prefix, 0);
    }
}
