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

use lazy_static::lazy_static;
use prometheus::{
    Histogram, IntCounter, exponential_buckets, register_histogram, register_int_counter,
};

lazy_static! {
    pub static ref BYTES_LOGGED: IntCounter = register_int_counter!(
        "tablet_wal_bytes_logged",
        "Number of bytes appended to the WAL since service start."
    )
    .unwrap();
    pub static ref ENTRY_BATCHES_PER_GROUP_HISTOGRAM: Histogram = register_histogram!(
        "tablet_wal_entry_batches_per_group",
        "Bucketed histogram of how many entry batches are drained per commit group.",
        exponential_buckets(1.0, 2.0, 12).unwrap()
    )
    .unwrap();
    pub static ref APPEND_DURATION_HISTOGRAM: Histogram = register_histogram!(
        "tablet_wal_append_duration",
        "Bucketed histogram of single batch append duration.",
        exponential_buckets(0.00001, 2.0, 26).unwrap()
    )
    .unwrap();
    pub static ref SYNC_DURATION_HISTOGRAM: Histogram = register_histogram!(
        "tablet_wal_sync_duration",
        "Bucketed histogram of WAL fsync duration.",
        exponential_buckets(0.00001, 2.0, 26).unwrap()
    )
    .unwrap();
    pub static ref GROUP_COMMIT_DURATION_HISTOGRAM: Histogram = register_histogram!(
        "tablet_wal_group_commit_duration",
        "Bucketed histogram of end-to-end commit group processing duration.",
        exponential_buckets(0.00001, 2.0, 26).unwrap()
    )
    .unwrap();
    pub static ref ROLL_DURATION_HISTOGRAM: Histogram = register_histogram!(
        "tablet_wal_roll_duration",
        "Bucketed histogram of segment roll-over duration.",
        exponential_buckets(0.00001, 2.0, 26).unwrap()
    )
    .unwrap();
}
