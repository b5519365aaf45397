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
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use tracing::warn;

use crate::{
    codec::{
        self, FOOTER_SCAN_WINDOW, MAGIC_AND_LEN, RECORD_HEADER_LEN, RecordHeader,
    },
    compression::CodecType,
    error::{Error, Result},
    types::{LogEntryBatchPb, SegmentFooterPb, SegmentHeaderPb, SegmentOffset, SegmentSequenceNumber},
};

pub(crate) const SEGMENT_FILE_PREFIX: &str = "wal-";
/// Prefix of placeholder files created by the segment allocator.
pub(crate) const TMP_SEGMENT_PREFIX: &str = ".tmp.newsegment";

/// Returns the on-disk file name for a segment sequence number.
pub(crate) fn segment_file_name(seqno: SegmentSequenceNumber) -> String {
    format!("{SEGMENT_FILE_PREFIX}{seqno:016}")
}

/// Parses a segment sequence number back out of a file name.
pub(crate) fn parse_segment_file_name(name: &str) -> Option<SegmentSequenceNumber> {
    let digits = name.strip_prefix(SEGMENT_FILE_PREFIX)?;
    if digits.len() != 16 {
        return None;
    };
    digits.parse().ok()
}

/// The active segment while it is being appended to.
///
/// Single-producer by contract: only the append thread (and administrative
/// roll-over/close, which serialize with it) touches a `WritableSegment`.
/// No method fsyncs implicitly except `write_footer_and_close`.
pub(crate) struct WritableSegment {
    path: PathBuf,
    file: File,
    header: Option<SegmentHeaderPb>,
    written_offset: SegmentOffset,
    first_entry_offset: SegmentOffset,
    closed: bool,
}

impl WritableSegment {
    /// Wraps an allocated (and possibly preallocated) segment file.
    pub(crate) fn new(path: PathBuf, file: File) -> WritableSegment {
        WritableSegment {
            path,
            file,
            header: None,
            written_offset: 0,
            first_entry_offset: 0,
            closed: false,
        }
    }

    /// Writes the segment header. Must be called exactly once, before any
    /// batch is appended.
    pub(crate) fn write_header(&mut self, header: SegmentHeaderPb) -> Result<()> {
        if self.header.is_some() {
            return Err(Error::IllegalState("segment header already written".to_owned()));
        };
        let block = codec::encode_header_block(&header);
        self.file.write_all_at(&block, 0)?;
        self.written_offset = block.len() as u64;
        self.first_entry_offset = self.written_offset;
        self.header = Some(header);
        Ok(())
    }

    /// Appends one framed batch record and returns the record's start
    /// offset within the segment.
    pub(crate) fn append_entry_batch(
        &mut self,
        batch_data: &[u8],
        codec: CodecType,
    ) -> Result<SegmentOffset> {
        if self.header.is_none() {
            return Err(Error::IllegalState("segment header not written yet".to_owned()));
        };
        if self.closed {
            return Err(Error::IllegalState("segment is closed".to_owned()));
        };
        let record = codec::encode_batch_record(batch_data, codec)?;
        let start = self.written_offset;
        self.file.write_all_at(&record, start)?;
        self.written_offset += record.len() as u64;
        Ok(start)
    }

    /// Fsyncs the segment's data.
    pub(crate) fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Writes the footer, trims any preallocated space so the file ends
    /// exactly at the footer, fsyncs, and closes the segment for appends.
    pub(crate) fn write_footer_and_close(&mut self, footer: &SegmentFooterPb) -> Result<()> {
        if self.closed {
            return Err(Error::IllegalState("segment is already closed".to_owned()));
        };
        let block = codec::encode_footer_block(footer);
        self.file.write_all_at(&block, self.written_offset)?;
        self.written_offset += block.len() as u64;

        if self.file.metadata()?.len() > self.written_offset {
            self.file.set_len(self.written_offset)?;
        };
        self.file.sync_data()?;
        self.closed = true;
        Ok(())
    }

    #[inline]
    pub(crate) fn written_offset(&self) -> SegmentOffset {
        self.written_offset
    }

    #[inline]
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }
}

/// One decoded batch record together with its location in the segment.
#[derive(Debug, Clone)]
pub struct ScannedBatch {
    /// Byte offset of the enclosing batch record.
    pub offset: SegmentOffset,
    pub batch: LogEntryBatchPb,
}

/// Read-only view of a segment: the active one (bounded by the durable
/// write offset) or a closed one.
#[derive(Debug)]
pub struct ReadableSegment {
    path: PathBuf,
    file: File,
    header: SegmentHeaderPb,
    footer: Option<SegmentFooterPb>,
    /// True when the footer was reconstructed by scanning an unclosed
    /// segment rather than parsed from disk.
    footer_rebuilt: bool,
    first_entry_offset: SegmentOffset,
    /// Where entry records end: the footer start for a closed segment, the
    /// last cleanly decoded offset for a recovered one.
    entries_end: SegmentOffset,
    file_size: u64,
    /// Durable bound for readers of the still-active segment.
    readable_to_offset: AtomicU64,
}

impl ReadableSegment {
    /// Opens a segment file read-only, parsing its header and, if present,
    /// its footer. A segment without a footer is left unclosed; callers
    /// decide whether to recover it by scan.
    pub(crate) fn open(path: impl AsRef<Path>) -> Result<ReadableSegment> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).open(&path)?;
        let file_size = file.metadata()?.len();

        let mut magic_and_len = [0u8; MAGIC_AND_LEN as usize];
        file.read_exact_at(&mut magic_and_len, 0)?;
        if &magic_and_len[..8] != codec::SEGMENT_MAGIC {
            return Err(crate::error::CodecError::BadSegmentMagic.into());
        };
        let header_len = u32::from_le_bytes(magic_and_len[8..12].try_into().unwrap()) as u64;
        let mut block = vec![0u8; (MAGIC_AND_LEN + header_len) as usize];
        file.read_exact_at(&mut block, 0)?;
        let (header, first_entry_offset) = codec::decode_header_block(&block)?;

        let tail_start = first_entry_offset.max(file_size.saturating_sub(FOOTER_SCAN_WINDOW));
        let mut tail = vec![0u8; (file_size - tail_start) as usize];
        file.read_exact_at(&mut tail, tail_start)?;

        let (footer, entries_end) = match codec::find_footer_in_tail(&tail) {
            Some((footer, block_len)) => (Some(footer), file_size - block_len),
            None => (None, file_size),
        };

        Ok(ReadableSegment {
            path,
            file,
            header,
            footer,
            footer_rebuilt: false,
            first_entry_offset,
            entries_end,
            file_size,
            readable_to_offset: AtomicU64::new(entries_end),
        })
    }

    /// Opens the just-allocated active segment with its already known
    /// header, skipping the on-disk parse. Nothing is readable until the
    /// appender advances the durable offset.
    pub(crate) fn open_with_header(
        path: impl AsRef<Path>,
        header: SegmentHeaderPb,
        first_entry_offset: SegmentOffset,
    ) -> Result<ReadableSegment> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).open(&path)?;
        let file_size = file.metadata()?.len();
        Ok(ReadableSegment {
            path,
            file,
            header,
            footer: None,
            footer_rebuilt: false,
            first_entry_offset,
            entries_end: file_size,
            file_size,
            readable_to_offset: AtomicU64::new(first_entry_offset),
        })
    }

    /// Reconstructs the footer of an unclosed segment by scanning its
    /// records, stopping at the first torn or corrupt record.
    ///
    /// The recovered bounds make the segment usable for replay and GC; the
    /// rebuilt footer is never written back to disk.
    pub(crate) fn rebuild_footer_by_scan(&mut self) -> Result<()> {
        let mut footer = SegmentFooterPb::default();
        let mut offset = self.first_entry_offset;

        loop {
            match self.read_record_at(offset, self.file_size) {
                Ok(Some((batch, next_offset))) => {
                    footer.num_entries += batch.entries.len() as u64;
                    for entry in &batch.entries {
                        if let Some(op_id) = entry.replicate_op_id() {
                            footer.observe_replicate_index(op_id.index);
                        };
                    }
                    offset = next_offset;
                },
                Ok(None) => break,
                Err(Error::Io(err)) => return Err(Error::Io(err)),
                Err(err) => {
                    // Expected after a crash: the tail record was torn.
                    warn!(
                        segment = %self.path.display(),
                        last_good_offset = offset,
                        %err,
                        "recovering unclosed segment: scan stopped",
                    );
                    break;
                },
            }
        }

        self.entries_end = offset;
        self.readable_to_offset.store(offset, Ordering::Release);
        self.footer = Some(footer);
        self.footer_rebuilt = true;
        Ok(())
    }

    /// Sequential scan of decoded entry batches starting at `from`.
    ///
    /// The scan is bounded by the durable readable offset while the segment
    /// is active, and by the footer for closed segments. On a closed
    /// segment a bad record yields [`Error::Corruption`]; on anything
    /// unclosed it ends the scan, and the truncation reason is available
    /// from [`BatchScanner::interrupted`].
    pub fn scan_batches(&self, from: SegmentOffset) -> BatchScanner<'_> {
        BatchScanner {
            segment: self,
            offset: from.max(self.first_entry_offset),
            limit: self.read_limit(),
            strict: self.footer.is_some() && !self.footer_rebuilt,
            interrupted: None,
            done: false,
        }
    }

    /// Random-access read of the batch record starting exactly at `offset`.
    pub fn read_batch_at(&self, offset: SegmentOffset) -> Result<LogEntryBatchPb> {
        match self.read_record_at(offset, self.read_limit())? {
            Some((batch, _)) => Ok(batch),
            None => Err(Error::corruption("no batch record at offset", offset)),
        }
    }

    /// Reads and decodes the record at `offset`, bounded by `limit`.
    ///
    /// Returns `Ok(None)` at a clean end of data: the limit, or a zeroed
    /// record header inside preallocated space.
    fn read_record_at(
        &self,
        offset: SegmentOffset,
        limit: SegmentOffset,
    ) -> Result<Option<(LogEntryBatchPb, SegmentOffset)>> {
        if offset + RECORD_HEADER_LEN > limit {
            return Ok(None);
        };

        let mut header_buf = [0u8; RECORD_HEADER_LEN as usize];
        self.file.read_exact_at(&mut header_buf, offset)?;
        let header = RecordHeader::decode(&header_buf).map_err(Error::Codec)?;
        if header.len == 0 {
            // Preallocated space past the written tail is zeroes.
            return Ok(None);
        };

        let payload_end = offset + RECORD_HEADER_LEN + header.len as u64;
        if payload_end > limit {
            return Err(Error::corruption(
                format!("batch record of {} bytes extends past readable end", header.len),
                offset,
            ));
        };

        let mut payload = vec![0u8; header.len as usize];
        self.file.read_exact_at(&mut payload, offset + RECORD_HEADER_LEN)?;
        let batch = codec::decode_batch_payload(&payload, header, self.codec())
            .map_err(|e| Error::corruption(e.to_string(), offset))?;
        Ok(Some((batch, payload_end)))
    }

    /// Called by the log reader while this segment is still being written,
    /// so reads stay bounded by durable data.
    pub(crate) fn update_readable_offset(&self, offset: SegmentOffset) {
        self.readable_to_offset.store(offset, Ordering::Release);
    }

    #[inline]
    fn read_limit(&self) -> SegmentOffset {
        if self.footer.is_some() {
            self.entries_end
        } else {
            self.readable_to_offset.load(Ordering::Acquire)
        }
    }

    #[inline]
    pub(crate) fn codec(&self) -> CodecType {
        self.header.codec()
    }

    #[inline]
    pub fn header(&self) -> &SegmentHeaderPb {
        &self.header
    }

    #[inline]
    pub fn sequence_number(&self) -> SegmentSequenceNumber {
        self.header.sequence_number
    }

    #[inline]
    pub fn has_footer(&self) -> bool {
        self.footer.is_some()
    }

    /// Returns the parsed (or scan-recovered) footer, if any.
    #[inline]
    pub fn footer(&self) -> Option<&SegmentFooterPb> {
        self.footer.as_ref()
    }

    /// True when the footer came from scan recovery, not from disk.
    #[inline]
    pub fn footer_was_rebuilt(&self) -> bool {
        self.footer_rebuilt
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    #[inline]
    pub(crate) fn first_entry_offset(&self) -> SegmentOffset {
        self.first_entry_offset
    }
}

/// Iterator over the batch records of one segment. See
/// [`ReadableSegment::scan_batches`].
pub struct BatchScanner<'a> {
    segment: &'a ReadableSegment,
    offset: SegmentOffset,
    limit: SegmentOffset,
    strict: bool,
    interrupted: Option<String>,
    done: bool,
}

impl BatchScanner<'_> {
    /// Offset just past the last cleanly decoded record.
    #[inline]
    pub fn offset(&self) -> SegmentOffset {
        self.offset
    }

    /// Why the scan stopped early on an unclosed segment, if it did.
    #[inline]
    pub fn interrupted(&self) -> Option<&str> {
        self.interrupted.as_deref()
    }
}

impl Iterator for BatchScanner<'_> {
    type Item = Result<ScannedBatch>;

    fn next(&mut self) -> Option<Result<ScannedBatch>> {
        if self.done {
            return None;
        };
        match self.segment.read_record_at(self.offset, self.limit) {
            Ok(Some((batch, next_offset))) => {
                let scanned = ScannedBatch { offset: self.offset, batch };
                self.offset = next_offset;
                Some(Ok(scanned))
            },
            Ok(None) => {
                self.done = true;
                None
            },
            Err(Error::Io(err)) => {
                self.done = true;
                Some(Err(Error::Io(err)))
            },
            Err(err) => {
                self.done = true;
                if self.strict {
                    Some(Err(err))
                } else {
                    self.interrupted = Some(err.to_string());
                    None
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use prost::Message;
    use tempfile::tempdir;

    use super::*;
    use crate::types::{LogEntry, OpId, ReplicateMsg};

    fn test_header(seqno: u64, codec: CodecType) -> SegmentHeaderPb {
        SegmentHeaderPb {
            sequence_number: seqno,
            tablet_id: b"tablet-test".to_vec(),
            schema: b"schema".to_vec(),
            schema_version: 1,
            compression_codec: codec as i32,
        }
    }

    fn replicate_batch_data(indexes: &[u64]) -> Vec<u8> {
        let entries = indexes
            .iter()
            .map(|&i| {
                LogEntry::replicate(ReplicateMsg {
                    id: Some(OpId::new(1, i)),
                    payload: Bytes::from(format!("op-{i}")),
                })
            })
            .collect();
        LogEntryBatchPb { entries }.encode_to_vec()
    }

    fn create_writable(dir: &Path, name: &str) -> WritableSegment {
        let path = dir.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .unwrap();
        WritableSegment::new(path, file)
    }

    #[test]
    fn test_segment_file_name_round_trip() {
        let name = segment_file_name(42);
        assert_eq!(name, "wal-0000000000000042");
        assert_eq!(parse_segment_file_name(&name), Some(42));
        assert_eq!(parse_segment_file_name("wal-short"), None);
        assert_eq!(parse_segment_file_name(".tmp.newsegmentabc123"), None);
    }

    #[test]
    fn test_write_close_reopen_scan() {
        let dir = tempdir().unwrap();
        let mut segment = create_writable(dir.path(), &segment_file_name(1));
        segment.write_header(test_header(1, CodecType::NoCompression)).unwrap();

        let first = segment
            .append_entry_batch(&replicate_batch_data(&[1, 2]), CodecType::NoCompression)
            .unwrap();
        let second = segment
            .append_entry_batch(&replicate_batch_data(&[3]), CodecType::NoCompression)
            .unwrap();
        assert!(second > first);

        let footer = SegmentFooterPb {
            num_entries: 3,
            min_replicate_index: Some(1),
            max_replicate_index: Some(3),
            close_timestamp_micros: 123,
        };
        segment.write_footer_and_close(&footer).unwrap();
        assert!(segment.is_closed());

        let readable = ReadableSegment::open(segment.path()).unwrap();
        assert_eq!(readable.sequence_number(), 1);
        assert!(readable.has_footer());
        assert_eq!(readable.footer().unwrap().max_replicate_index, Some(3));

        let batches: Vec<_> =
            readable.scan_batches(0).collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].offset, first);
        assert_eq!(batches[1].offset, second);
        assert_eq!(batches[0].batch.entries.len(), 2);

        let random = readable.read_batch_at(second).unwrap();
        assert_eq!(random.entries[0].replicate_op_id().unwrap().index, 3);
    }

    #[test]
    fn test_write_header_only_once() {
        let dir = tempdir().unwrap();
        let mut segment = create_writable(dir.path(), &segment_file_name(1));
        segment.write_header(test_header(1, CodecType::NoCompression)).unwrap();
        assert!(matches!(
            segment.write_header(test_header(1, CodecType::NoCompression)),
            Err(Error::IllegalState(_))
        ));
    }

    #[test]
    fn test_append_before_header_fails() {
        let dir = tempdir().unwrap();
        let mut segment = create_writable(dir.path(), &segment_file_name(1));
        assert!(matches!(
            segment.append_entry_batch(b"data", CodecType::NoCompression),
            Err(Error::IllegalState(_))
        ));
    }

    #[test]
    fn test_close_truncates_preallocated_space() {
        let dir = tempdir().unwrap();
        let mut segment = create_writable(dir.path(), &segment_file_name(1));
        segment.file.set_len(1 << 20).unwrap();
        segment.write_header(test_header(1, CodecType::NoCompression)).unwrap();
        segment
            .append_entry_batch(&replicate_batch_data(&[1]), CodecType::NoCompression)
            .unwrap();
        segment.write_footer_and_close(&SegmentFooterPb::default()).unwrap();

        let on_disk = std::fs::metadata(segment.path()).unwrap().len();
        assert_eq!(on_disk, segment.written_offset());

        let readable = ReadableSegment::open(segment.path()).unwrap();
        assert!(readable.has_footer());
    }

    #[test]
    fn test_unclosed_segment_recovered_by_scan() {
        let dir = tempdir().unwrap();
        let mut segment = create_writable(dir.path(), &segment_file_name(3));
        // Preallocated segments leave a zeroed tail when the process dies.
        segment.file.set_len(1 << 16).unwrap();
        segment.write_header(test_header(3, CodecType::NoCompression)).unwrap();
        segment
            .append_entry_batch(&replicate_batch_data(&[5, 6]), CodecType::NoCompression)
            .unwrap();
        segment
            .append_entry_batch(&replicate_batch_data(&[7]), CodecType::NoCompression)
            .unwrap();
        let good_end = segment.written_offset();
        drop(segment);

        let mut readable = ReadableSegment::open(dir.path().join(segment_file_name(3))).unwrap();
        assert!(!readable.has_footer());

        readable.rebuild_footer_by_scan().unwrap();
        assert!(readable.footer_was_rebuilt());
        let footer = readable.footer().unwrap();
        assert_eq!(footer.num_entries, 3);
        assert_eq!(footer.min_replicate_index, Some(5));
        assert_eq!(footer.max_replicate_index, Some(7));
        assert_eq!(readable.entries_end, good_end);
    }

    #[test]
    fn test_torn_tail_record_stops_recovery_scan() {
        let dir = tempdir().unwrap();
        let mut segment = create_writable(dir.path(), &segment_file_name(4));
        segment.write_header(test_header(4, CodecType::NoCompression)).unwrap();
        segment
            .append_entry_batch(&replicate_batch_data(&[1]), CodecType::NoCompression)
            .unwrap();
        let good_end = segment.written_offset();
        segment
            .append_entry_batch(&replicate_batch_data(&[2]), CodecType::NoCompression)
            .unwrap();
        // Tear the second record in half.
        segment.file.set_len(good_end + 5).unwrap();
        drop(segment);

        let mut readable = ReadableSegment::open(dir.path().join(segment_file_name(4))).unwrap();
        readable.rebuild_footer_by_scan().unwrap();
        assert_eq!(readable.footer().unwrap().num_entries, 1);
        assert_eq!(readable.entries_end, good_end);

        let batches: Vec<_> = readable.scan_batches(0).collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(batches.len(), 1);
    }

    #[test]
    fn test_corrupt_record_in_closed_segment_is_strict() {
        let dir = tempdir().unwrap();
        let mut segment = create_writable(dir.path(), &segment_file_name(5));
        segment.write_header(test_header(5, CodecType::NoCompression)).unwrap();
        let start = segment
            .append_entry_batch(&replicate_batch_data(&[1]), CodecType::NoCompression)
            .unwrap();
        segment.write_footer_and_close(&SegmentFooterPb::default()).unwrap();

        // Flip a payload byte after close.
        let file = OpenOptions::new().write(true).open(segment.path()).unwrap();
        file.write_all_at(&[0xFF], start + RECORD_HEADER_LEN + 1).unwrap();

        let readable = ReadableSegment::open(segment.path()).unwrap();
        let results: Vec<_> = readable.scan_batches(0).collect();
        assert!(matches!(results.last().unwrap(), Err(Error::Corruption { .. })));
    }

    #[test]
    fn test_compressed_segment_round_trip() {
        let dir = tempdir().unwrap();
        for codec in [CodecType::Snappy, CodecType::Lz4, CodecType::Zstd] {
            let name = format!("wal-{:016}", codec as u64 + 10);
            let mut segment = create_writable(dir.path(), &name);
            segment.write_header(test_header(codec as u64 + 10, codec)).unwrap();
            segment.append_entry_batch(&replicate_batch_data(&[1, 2, 3]), codec).unwrap();
            segment.write_footer_and_close(&SegmentFooterPb::default()).unwrap();

            let readable = ReadableSegment::open(segment.path()).unwrap();
            let batches: Vec<_> =
                readable.scan_batches(0).collect::<Result<Vec<_>>>().unwrap();
            assert_eq!(batches.len(), 1);
            assert_eq!(batches[0].batch.entries.len(), 3);
        }
    }

    #[test]
    fn test_active_segment_bounded_by_readable_offset() {
        let dir = tempdir().unwrap();
        let mut segment = create_writable(dir.path(), &segment_file_name(6));
        let header = test_header(6, CodecType::NoCompression);
        segment.write_header(header.clone()).unwrap();
        let first_entry_offset = segment.written_offset();

        segment
            .append_entry_batch(&replicate_batch_data(&[1]), CodecType::NoCompression)
            .unwrap();
        let durable = segment.written_offset();
        segment
            .append_entry_batch(&replicate_batch_data(&[2]), CodecType::NoCompression)
            .unwrap();

        let readable =
            ReadableSegment::open_with_header(segment.path(), header, first_entry_offset)
                .unwrap();
        // Nothing readable until the appender publishes the durable offset.
        assert_eq!(readable.scan_batches(0).count(), 0);

        readable.update_readable_offset(durable);
        let batches: Vec<_> = readable.scan_batches(0).collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].batch.entries[0].replicate_op_id().unwrap().index, 1);
    }
}
