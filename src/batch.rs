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

use std::sync::{Arc, Condvar, Mutex};

use prost::Message;

use crate::{
    error::{Error, Result},
    types::{EntryKind, LogEntry, LogEntryBatchPb, OpId},
};

/// Completion callback of one entry batch.
///
/// Fired exactly once: with `Ok(())` after the batch's bytes are in the
/// active segment and, unless the group was commit-only, after the group's
/// fsync returned, or with the error that failed the batch.
pub type StatusCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// One-way progression of an entry batch through the append pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum BatchState {
    Initialized,
    Reserved,
    Serialized,
    Ready,
    AppendedOk,
    AppendFailed,
}

struct BatchSync {
    state: BatchState,
    /// Serialized bytes, populated by the producer's serialize step.
    buffer: Vec<u8>,
    callback: Option<StatusCallback>,
    /// Failure recorded before the producer attached its callback; it is
    /// delivered the moment the callback arrives so the contract of firing
    /// exactly once holds even across shutdown.
    early_failure: Option<Error>,
}

/// The unit of atomic append, shared between the reserving producer and the
/// append thread.
///
/// The entries themselves are immutable after construction; the mutable
/// handshake state (serialize buffer, callback, readiness) lives behind a
/// dedicated lock so producers serialize outside any log-global lock.
pub struct EntryBatch {
    kind: EntryKind,
    pb: LogEntryBatchPb,
    count: usize,
    total_size_bytes: usize,
    sync: Mutex<BatchSync>,
    ready: Condvar,
}

impl EntryBatch {
    pub(crate) fn new(kind: EntryKind, pb: LogEntryBatchPb) -> EntryBatch {
        let count = pb.entries.len();
        // Flush markers traverse the queue but are never written to disk.
        let total_size_bytes =
            if kind == EntryKind::FlushMarker { 0 } else { pb.encoded_len() };
        EntryBatch {
            kind,
            pb,
            count,
            total_size_bytes,
            sync: Mutex::new(BatchSync {
                state: BatchState::Initialized,
                buffer: Vec::new(),
                callback: None,
                early_failure: None,
            }),
            ready: Condvar::new(),
        }
    }

    #[inline]
    pub(crate) fn kind(&self) -> EntryKind {
        self.kind
    }

    #[inline]
    pub(crate) fn count(&self) -> usize {
        self.count
    }

    #[inline]
    pub(crate) fn total_size_bytes(&self) -> usize {
        self.total_size_bytes
    }

    #[inline]
    pub(crate) fn entries(&self) -> &[LogEntry] {
        &self.pb.entries
    }

    /// Returns the highest replicate [`OpId`] in the batch, if any.
    pub(crate) fn max_replicate_op_id(&self) -> Option<OpId> {
        self.pb.entries.iter().filter_map(|e| e.replicate_op_id()).max().cloned()
    }

    pub(crate) fn mark_reserved(&self) {
        let mut sync = self.sync.lock().expect("batch mutex poisoned");
        debug_assert_eq!(sync.state, BatchState::Initialized);
        sync.state = BatchState::Reserved;
    }

    /// Producer side of the handshake: serializes the entries, attaches the
    /// callback, and signals readiness to the append thread.
    ///
    /// Serialization happens before the batch lock is taken. If the batch
    /// was already failed (log shut down between reserve and append), the
    /// callback fires immediately with that error.
    pub(crate) fn serialize_and_mark_ready(&self, callback: StatusCallback) {
        let buffer = if self.kind == EntryKind::FlushMarker {
            // The serialize step of a flush marker is a no-op.
            Vec::new()
        } else {
            self.pb.encode_to_vec()
        };

        let mut sync = self.sync.lock().expect("batch mutex poisoned");
        if let Some(err) = sync.early_failure.take() {
            sync.state = BatchState::AppendFailed;
            drop(sync);
            callback(Err(err));
            return;
        };

        debug_assert_eq!(sync.state, BatchState::Reserved);
        sync.state = BatchState::Serialized;
        sync.buffer = buffer;
        sync.callback = Some(callback);
        sync.state = BatchState::Ready;
        drop(sync);
        self.ready.notify_one();
    }

    /// Append-thread side of the handshake: blocks until the producer has
    /// signalled readiness, then takes the serialized bytes.
    pub(crate) fn wait_ready(&self) -> Vec<u8> {
        let mut sync = self.sync.lock().expect("batch mutex poisoned");
        while sync.state < BatchState::Ready {
            sync = self.ready.wait(sync).expect("batch mutex poisoned");
        }
        std::mem::take(&mut sync.buffer)
    }

    pub(crate) fn mark_appended_ok(&self) {
        let mut sync = self.sync.lock().expect("batch mutex poisoned");
        debug_assert_eq!(sync.state, BatchState::Ready);
        sync.state = BatchState::AppendedOk;
    }

    pub(crate) fn mark_failed_to_append(&self) {
        let mut sync = self.sync.lock().expect("batch mutex poisoned");
        sync.state = BatchState::AppendFailed;
    }

    pub(crate) fn failed_to_append(&self) -> bool {
        self.sync.lock().expect("batch mutex poisoned").state == BatchState::AppendFailed
    }

    /// Removes the callback, if it has not been taken yet.
    pub(crate) fn take_callback(&self) -> Option<StatusCallback> {
        self.sync.lock().expect("batch mutex poisoned").callback.take()
    }

    /// Fails a batch that will never be appended (shutdown path).
    ///
    /// If the producer has already attached its callback, it fires now;
    /// otherwise the error is parked and delivered on attachment.
    pub(crate) fn fail_pending(&self, err: Error) {
        let mut sync = self.sync.lock().expect("batch mutex poisoned");
        if sync.state >= BatchState::Ready {
            sync.state = BatchState::AppendFailed;
            let callback = sync.callback.take();
            drop(sync);
            if let Some(callback) = callback {
                callback(Err(err));
            };
        } else {
            sync.early_failure = Some(err);
        }
    }
}

/// Opaque handle to a reserved entry batch, returned by
/// [`Log::reserve`](crate::Log::reserve) and consumed by
/// [`Log::async_append`](crate::Log::async_append).
pub struct ReservedEntryBatch(pub(crate) Arc<EntryBatch>);

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use bytes::Bytes;

    use super::*;
    use crate::types::ReplicateMsg;

    fn replicate_batch(indexes: &[u64]) -> LogEntryBatchPb {
        let entries = indexes
            .iter()
            .map(|&i| {
                LogEntry::replicate(ReplicateMsg {
                    id: Some(OpId::new(1, i)),
                    payload: Bytes::from_static(b"payload"),
                })
            })
            .collect();
        LogEntryBatchPb { entries }
    }

    #[test]
    fn test_handshake_delivers_serialized_bytes() {
        let batch = Arc::new(EntryBatch::new(EntryKind::Replicate, replicate_batch(&[1, 2])));
        batch.mark_reserved();

        let appender = {
            let batch = batch.clone();
            std::thread::spawn(move || batch.wait_ready())
        };

        let (tx, rx) = mpsc::channel();
        batch.serialize_and_mark_ready(Box::new(move |result| tx.send(result).unwrap()));

        let buffer = appender.join().unwrap();
        assert_eq!(buffer.len(), batch.total_size_bytes());
        assert!(!buffer.is_empty());

        batch.mark_appended_ok();
        batch.take_callback().unwrap()(Ok(()));
        assert!(rx.recv().unwrap().is_ok());
    }

    #[test]
    fn test_flush_marker_serializes_to_nothing() {
        let pb = LogEntryBatchPb { entries: vec![LogEntry::flush_marker()] };
        let batch = EntryBatch::new(EntryKind::FlushMarker, pb);
        assert_eq!(batch.total_size_bytes(), 0);

        batch.mark_reserved();
        batch.serialize_and_mark_ready(Box::new(|_| {}));
        assert!(batch.wait_ready().is_empty());
    }

    #[test]
    fn test_callback_taken_only_once() {
        let batch = EntryBatch::new(EntryKind::Replicate, replicate_batch(&[1]));
        batch.mark_reserved();
        batch.serialize_and_mark_ready(Box::new(|_| {}));
        batch.wait_ready();

        assert!(batch.take_callback().is_some());
        assert!(batch.take_callback().is_none());
    }

    #[test]
    fn test_fail_before_callback_attached_delivers_lazily() {
        let batch = EntryBatch::new(EntryKind::Replicate, replicate_batch(&[1]));
        batch.mark_reserved();
        batch.fail_pending(Error::ShuttingDown);

        let (tx, rx) = mpsc::channel();
        batch.serialize_and_mark_ready(Box::new(move |result| tx.send(result).unwrap()));
        assert!(matches!(rx.recv().unwrap(), Err(Error::ShuttingDown)));
    }

    #[test]
    fn test_max_replicate_op_id() {
        let batch = EntryBatch::new(EntryKind::Replicate, replicate_batch(&[3, 7, 5]));
        assert_eq!(batch.max_replicate_op_id(), Some(OpId::new(1, 7)));
    }
}
