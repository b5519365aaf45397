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
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex},
};

use crate::batch::EntryBatch;

struct QueueInner {
    batches: VecDeque<Arc<EntryBatch>>,
    bytes: usize,
    shut_down: bool,
}

/// Bounded multi-producer single-consumer queue with byte capacity.
///
/// `blocking_drain_to` moves *everything* currently enqueued in one step:
/// this is the group-commit primitive, ensuring the append thread never
/// processes a batch alone when more work is already queued behind it.
pub(crate) struct EntryBatchQueue {
    max_bytes: usize,
    inner: Mutex<QueueInner>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl EntryBatchQueue {
    pub(crate) fn new(max_bytes: usize) -> EntryBatchQueue {
        EntryBatchQueue {
            max_bytes,
            inner: Mutex::new(QueueInner {
                batches: VecDeque::new(),
                bytes: 0,
                shut_down: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    /// Enqueues a batch, blocking until its bytes fit within capacity.
    ///
    /// Returns `false` if the queue has been shut down. An oversize batch is
    /// admitted whenever the queue is empty, so a single batch larger than
    /// the whole capacity cannot deadlock its producer.
    pub(crate) fn blocking_put(&self, batch: Arc<EntryBatch>) -> bool {
        let size = batch.total_size_bytes();
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        loop {
            if inner.shut_down {
                return false;
            };
            if inner.bytes + size <= self.max_bytes || inner.batches.is_empty() {
                break;
            };
            inner = self.not_full.wait(inner).expect("queue mutex poisoned");
        }
        inner.bytes += size;
        inner.batches.push_back(batch);
        drop(inner);
        self.not_empty.notify_one();
        true
    }

    /// Blocks until at least one batch is available, then moves all
    /// currently enqueued batches into `out` and returns `true`.
    ///
    /// Once the queue is shut down, the call returns `false` immediately,
    /// still moving whatever batches remained enqueued into `out`.
    pub(crate) fn blocking_drain_to(&self, out: &mut Vec<Arc<EntryBatch>>) -> bool {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        loop {
            if inner.shut_down {
                out.extend(inner.batches.drain(..));
                inner.bytes = 0;
                drop(inner);
                self.not_full.notify_all();
                return false;
            };
            if !inner.batches.is_empty() {
                out.extend(inner.batches.drain(..));
                inner.bytes = 0;
                drop(inner);
                self.not_full.notify_all();
                return true;
            };
            inner = self.not_empty.wait(inner).expect("queue mutex poisoned");
        }
    }

    /// Causes all current and future `blocking_put` calls to fail.
    pub(crate) fn shutdown(&self) {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        inner.shut_down = true;
        drop(inner);
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }
}
