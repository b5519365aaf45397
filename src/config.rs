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

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The sequence number preceding the very first allocated segment.
pub const INITIAL_SEGMENT_SEQUENCE_NUMBER: u64 = 0;

/// Configures a WAL. Passed at [`Log::open`](crate::Log::open); there is no
/// process-wide WAL state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LogOptions {
    /// Size threshold, in mebibytes, at which the active segment is rolled.
    pub segment_size_mb: u64,
    /// If true, every non-commit-only group triggers an fsync. If false,
    /// fsync is still forced on roll-over and close.
    pub force_fsync_all: bool,
    /// If true, roll-over may return before the next segment is
    /// materialized; otherwise the roll is synchronous.
    pub async_preallocate_segments: bool,
    /// Whether to extend new segment files to their maximum size on
    /// creation.
    pub preallocate_segments: bool,
    /// Name of the compression codec for segment payloads. An empty string
    /// means no compression.
    pub compression_codec: String,
    /// Floor on the retained segment count regardless of retention indexes.
    /// Must be at least 1.
    pub min_segments_to_retain: usize,
    /// Ceiling above which a segment may be deleted even if still needed by
    /// peers (but never if needed for durability).
    pub max_segments_to_retain: usize,
    /// Bytes that must remain free on the WAL filesystem; preallocation
    /// aborts if it would violate this.
    pub fs_wal_dir_reserved_bytes: u64,
    /// Byte capacity of the group commit queue.
    pub group_commit_queue_size_bytes: usize,
    /// Testing-only fault hooks, all disabled by default.
    pub fault_injection: FaultInjection,
}

impl Default for LogOptions {
    fn default() -> LogOptions {
        LogOptions {
            segment_size_mb: 8,
            force_fsync_all: false,
            async_preallocate_segments: true,
            preallocate_segments: true,
            compression_codec: "lz4".to_owned(),
            min_segments_to_retain: 2,
            max_segments_to_retain: 10,
            fs_wal_dir_reserved_bytes: 0,
            group_commit_queue_size_bytes: 4 * 1024 * 1024,
            fault_injection: FaultInjection::default(),
        }
    }
}

impl LogOptions {
    /// Roll threshold in bytes.
    #[inline]
    pub(crate) fn max_segment_size(&self) -> u64 {
        self.segment_size_mb * 1024 * 1024
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.min_segments_to_retain < 1 {
            return Err(Error::InvalidArgument(
                "min-segments-to-retain must be at least 1".to_owned(),
            ));
        };
        if self.segment_size_mb == 0 {
            return Err(Error::InvalidArgument("segment-size-mb must be positive".to_owned()));
        };
        if self.group_commit_queue_size_bytes == 0 {
            return Err(Error::InvalidArgument(
                "group-commit-queue-size-bytes must be positive".to_owned(),
            ));
        };
        self.fault_injection.validate()
    }
}

/// Fault-injection hooks, recognized but inert unless explicitly enabled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FaultInjection {
    /// If true, injects normally distributed latency into log sync.
    pub inject_sync_latency: bool,
    /// Mean of the injected sync latency, in milliseconds.
    pub sync_latency_ms_mean: f64,
    /// Standard deviation of the injected sync latency, in milliseconds.
    pub sync_latency_ms_stddev: f64,
    /// Fraction of appends that fail with an injected I/O error.
    pub append_io_error_fraction: f64,
    /// Fraction of group syncs that fail with an injected I/O error.
    pub sync_io_error_fraction: f64,
    /// Fraction of preallocations that fail with an injected I/O error.
    pub preallocate_io_error_fraction: f64,
    /// Fraction of commit appends that crash the process before enqueueing.
    pub crash_before_append_commit_fraction: f64,
}

impl FaultInjection {
    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("append-io-error-fraction", self.append_io_error_fraction),
            ("sync-io-error-fraction", self.sync_io_error_fraction),
            ("preallocate-io-error-fraction", self.preallocate_io_error_fraction),
            ("crash-before-append-commit-fraction", self.crash_before_append_commit_fraction),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::InvalidArgument(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        LogOptions::default().validate().unwrap();
    }

    #[test]
    fn test_min_segments_floor() {
        let opts = LogOptions { min_segments_to_retain: 0, ..Default::default() };
        assert!(matches!(opts.validate(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_fraction_bounds() {
        let opts = LogOptions {
            fault_injection: FaultInjection {
                append_io_error_fraction: 1.5,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(opts.validate(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_kebab_case_round_trip() {
        let opts = LogOptions { segment_size_mb: 1, ..Default::default() };
        let json = serde_json::to_string(&opts).unwrap();
        assert!(json.contains("segment-size-mb"));
        let back: LogOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back.segment_size_mb, 1);
    }
}
