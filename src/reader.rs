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
    fs,
    path::Path,
    sync::{Arc, RwLock},
};

use tracing::{info, warn};

use crate::{
    error::{Error, Result},
    index::{LogIndex, LogIndexEntry},
    segment::{ReadableSegment, parse_segment_file_name},
    types::{LogEntryBatchPb, OpId, RaftIndex, SegmentOffset, SegmentSequenceNumber},
};

/// Process-local registry of the readable segments of one tablet's WAL,
/// ordered by sequence number.
///
/// `snapshot` takes the lock shared; `append`/`replace`/`trim` take it
/// exclusively, so readers never observe a segment without a reachable
/// prefix.
pub struct LogReader {
    log_index: Arc<LogIndex>,
    segments: RwLock<Vec<Arc<ReadableSegment>>>,
}

impl LogReader {
    /// Opens all pre-existing segments in `wal_dir`, recovering the footer
    /// of any segment that was not closed cleanly.
    pub(crate) fn open(wal_dir: impl AsRef<Path>, log_index: Arc<LogIndex>) -> Result<LogReader> {
        let mut found = Vec::new();
        for dir_entry in fs::read_dir(wal_dir.as_ref())? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name();
            let Some(seqno) = name.to_str().and_then(parse_segment_file_name) else {
                continue;
            };
            found.push((seqno, dir_entry.path()));
        }
        found.sort_by_key(|(seqno, _)| *seqno);

        let mut segments: Vec<Arc<ReadableSegment>> = Vec::with_capacity(found.len());
        for (seqno, path) in found {
            let mut segment = ReadableSegment::open(&path)?;
            if segment.sequence_number() != seqno {
                return Err(Error::corruption(
                    format!(
                        "segment {} declares sequence number {} in its header",
                        path.display(),
                        segment.sequence_number()
                    ),
                    0,
                ));
            };
            if let Some(prev) = segments.last() {
                if prev.sequence_number() >= seqno {
                    return Err(Error::corruption(
                        format!("duplicate segment sequence number {seqno}"),
                        0,
                    ));
                };
            };
            if !segment.has_footer() {
                warn!(
                    segment = %path.display(),
                    "segment has no footer; recovering bounds by scan",
                );
                segment.rebuild_footer_by_scan()?;
            };
            segments.push(Arc::new(segment));
        }

        if !segments.is_empty() {
            info!(num_segments = segments.len(), "opened existing WAL segments");
        };
        Ok(LogReader { log_index, segments: RwLock::new(segments) })
    }

    /// Adds a new, still-empty active segment at the tail.
    pub(crate) fn append_empty_segment(&self, segment: ReadableSegment) -> Result<()> {
        let mut segments = self.segments.write().expect("reader lock poisoned");
        if let Some(last) = segments.last() {
            if last.sequence_number() >= segment.sequence_number() {
                return Err(Error::IllegalState(format!(
                    "cannot append segment {} after segment {}",
                    segment.sequence_number(),
                    last.sequence_number()
                )));
            };
        };
        segments.push(Arc::new(segment));
        Ok(())
    }

    /// Swaps the tail segment for its freshly closed, footered counterpart.
    pub(crate) fn replace_last(&self, segment: ReadableSegment) -> Result<()> {
        let mut segments = self.segments.write().expect("reader lock poisoned");
        let last = segments.last_mut().ok_or_else(|| {
            Error::IllegalState("cannot replace last segment of an empty reader".to_owned())
        })?;
        if last.sequence_number() != segment.sequence_number() {
            return Err(Error::IllegalState(format!(
                "expected replacement for segment {}, got {}",
                last.sequence_number(),
                segment.sequence_number()
            )));
        };
        *last = Arc::new(segment);
        Ok(())
    }

    /// Publishes how far the active segment may be read.
    pub(crate) fn update_last_segment_offset(&self, offset: SegmentOffset) {
        let segments = self.segments.read().expect("reader lock poisoned");
        if let Some(last) = segments.last() {
            last.update_readable_offset(offset);
        };
    }

    /// Returns a stable ordered copy of the current segments.
    pub fn segments_snapshot(&self) -> Vec<Arc<ReadableSegment>> {
        self.segments.read().expect("reader lock poisoned").clone()
    }

    pub fn num_segments(&self) -> usize {
        self.segments.read().expect("reader lock poisoned").len()
    }

    /// Removes every segment with a sequence number up to and including
    /// `seqno` from the registry.
    pub(crate) fn trim_segments_up_to_and_including(
        &self,
        seqno: SegmentSequenceNumber,
    ) -> Result<()> {
        let mut segments = self.segments.write().expect("reader lock poisoned");
        segments.retain(|s| s.sequence_number() > seqno);
        Ok(())
    }

    /// Minimum replicate index across the remaining segments' footers; used
    /// to drive log index chunk GC.
    pub fn min_replicate_index(&self) -> Option<RaftIndex> {
        let segments = self.segments.read().expect("reader lock poisoned");
        segments
            .iter()
            .filter_map(|s| s.footer().and_then(|f| f.min_replicate_index))
            .min()
    }

    /// Highest sequence number currently registered, or zero when empty.
    pub(crate) fn highest_sequence_number(&self) -> SegmentSequenceNumber {
        let segments = self.segments.read().expect("reader lock poisoned");
        segments.last().map_or(0, |s| s.sequence_number())
    }

    /// Reads and decodes the batch record a log index entry points at.
    pub fn read_batch(&self, entry: &LogIndexEntry) -> Result<LogEntryBatchPb> {
        let segment = {
            let segments = self.segments.read().expect("reader lock poisoned");
            segments
                .binary_search_by_key(&entry.segment_sequence_number, |s| s.sequence_number())
                .ok()
                .map(|i| segments[i].clone())
                .ok_or_else(|| {
                    Error::NotFound(format!(
                        "segment {} is no longer registered",
                        entry.segment_sequence_number
                    ))
                })?
        };
        segment.read_batch_at(entry.offset_in_segment)
    }

    /// Resolves a Raft index to its full [`OpId`] through the log index.
    pub fn lookup_op_id(&self, index: RaftIndex) -> Result<OpId> {
        let index_entry = self.log_index.get_entry(index)?;
        let batch = self.read_batch(&index_entry)?;
        batch
            .entries
            .iter()
            .filter_map(|e| e.replicate_op_id())
            .find(|op_id| op_id.index == index)
            .cloned()
            .ok_or_else(|| {
                Error::corruption(
                    format!("indexed batch does not contain replicate {index}"),
                    index_entry.offset_in_segment,
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;

    use bytes::Bytes;
    use prost::Message;
    use tempfile::tempdir;

    use super::*;
    use crate::{
        compression::CodecType,
        segment::{WritableSegment, segment_file_name},
        types::{LogEntry, ReplicateMsg, SegmentFooterPb, SegmentHeaderPb},
    };

    fn write_segment(dir: &Path, seqno: u64, indexes: &[u64], close: bool) {
        let path = dir.join(segment_file_name(seqno));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .unwrap();
        let mut segment = WritableSegment::new(path, file);
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
        for &index in indexes {
            let entries = vec![LogEntry::replicate(ReplicateMsg {
                id: Some(OpId::new(1, index)),
                payload: Bytes::from(format!("op-{index}")),
            })];
            let data = LogEntryBatchPb { entries }.encode_to_vec();
            segment.append_entry_batch(&data, CodecType::NoCompression).unwrap();
            footer.num_entries += 1;
            footer.observe_replicate_index(index);
        }
        if close {
            segment.write_footer_and_close(&footer).unwrap();
        };
    }

    fn open_reader(dir: &Path) -> LogReader {
        let index = Arc::new(LogIndex::open(dir).unwrap());
        LogReader::open(dir, index).unwrap()
    }

    #[test]
    fn test_open_sorts_and_snapshots() {
        let dir = tempdir().unwrap();
        write_segment(dir.path(), 2, &[10, 11], true);
        write_segment(dir.path(), 1, &[1, 2], true);

        let reader = open_reader(dir.path());
        let snapshot = reader.segments_snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].sequence_number(), 1);
        assert_eq!(snapshot[1].sequence_number(), 2);
        assert_eq!(reader.highest_sequence_number(), 2);
        assert_eq!(reader.min_replicate_index(), Some(1));
    }

    #[test]
    fn test_open_recovers_unfooted_segment() {
        let dir = tempdir().unwrap();
        write_segment(dir.path(), 1, &[1, 2], true);
        write_segment(dir.path(), 2, &[3, 4], false);

        let reader = open_reader(dir.path());
        let snapshot = reader.segments_snapshot();
        assert!(snapshot[1].footer_was_rebuilt());
        assert_eq!(snapshot[1].footer().unwrap().max_replicate_index, Some(4));
    }

    #[test]
    fn test_trim_removes_prefix() {
        let dir = tempdir().unwrap();
        for seqno in 1..=4 {
            write_segment(dir.path(), seqno, &[seqno * 10], true);
        }

        let reader = open_reader(dir.path());
        reader.trim_segments_up_to_and_including(2).unwrap();
        let snapshot = reader.segments_snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].sequence_number(), 3);
        assert_eq!(reader.min_replicate_index(), Some(30));
    }

    #[test]
    fn test_append_rejects_non_monotonic_seqno() {
        let dir = tempdir().unwrap();
        write_segment(dir.path(), 3, &[1], true);
        let reader = open_reader(dir.path());

        write_segment(dir.path(), 2, &[2], true);
        let stale = ReadableSegment::open(dir.path().join(segment_file_name(2))).unwrap();
        assert!(matches!(reader.append_empty_segment(stale), Err(Error::IllegalState(_))));
    }

    #[test]
    fn test_read_batch_and_lookup_through_index() {
        let dir = tempdir().unwrap();
        write_segment(dir.path(), 1, &[7], true);

        let index = Arc::new(LogIndex::open(dir.path()).unwrap());
        let reader = LogReader::open(dir.path(), index.clone()).unwrap();

        // Index the record the way the appender would.
        let segment = &reader.segments_snapshot()[0];
        let scanned = segment.scan_batches(0).next().unwrap().unwrap();
        index
            .add_entry(&LogIndexEntry {
                op_id: OpId::new(1, 7),
                segment_sequence_number: 1,
                offset_in_segment: scanned.offset,
            })
            .unwrap();

        assert_eq!(reader.lookup_op_id(7).unwrap(), OpId::new(1, 7));
        assert!(matches!(reader.lookup_op_id(8), Err(Error::NotFound(_))));
    }
}
