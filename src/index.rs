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

//! Persistent mapping from Raft index to the physical location of the
//! enclosing batch record.
//!
//! The index is sparse: only replicate entries are indexed. Entries live in
//! fixed-stride chunk files under the `index/` subdirectory, so a lookup is
//! one positional read: `chunk = index / N`, `slot = index % N`.

use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use tracing::{info, warn};

use crate::{
    error::{Error, Result},
    types::{OpId, RaftIndex, SegmentOffset, SegmentSequenceNumber},
};

const INDEX_DIR_NAME: &str = "index";
/// Entries per chunk file; one chunk is then 24 MB.
const DEFAULT_ENTRIES_PER_CHUNK: u64 = 1_000_000;
/// On-disk slot: term, segment sequence number, offset, little-endian.
const SLOT_LEN: u64 = 24;

/// Physical location of one replicate entry's enclosing batch record.
///
/// The offset is the start of the whole batch record; replay decodes the
/// batch and selects the entry by its [`OpId`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogIndexEntry {
    pub op_id: OpId,
    pub segment_sequence_number: SegmentSequenceNumber,
    pub offset_in_segment: SegmentOffset,
}

/// On-disk index of replicate entries, chunked by Raft index range.
///
/// A segment sequence number of zero marks an empty slot; real sequence
/// numbers start at one.
pub struct LogIndex {
    dir: PathBuf,
    entries_per_chunk: u64,
    open_chunks: Mutex<HashMap<u64, Arc<File>>>,
}

impl LogIndex {
    /// Opens (creating if needed) the index under `wal_dir/index`.
    pub(crate) fn open(wal_dir: impl AsRef<Path>) -> Result<LogIndex> {
        LogIndex::with_entries_per_chunk(wal_dir, DEFAULT_ENTRIES_PER_CHUNK)
    }

    /// Like [`LogIndex::open`] with a custom chunk stride. Small strides
    /// exercise chunk rollover in tests.
    pub(crate) fn with_entries_per_chunk(
        wal_dir: impl AsRef<Path>,
        entries_per_chunk: u64,
    ) -> Result<LogIndex> {
        let dir = wal_dir.as_ref().join(INDEX_DIR_NAME);
        fs::create_dir_all(&dir)?;
        Ok(LogIndex { dir, entries_per_chunk, open_chunks: Mutex::new(HashMap::new()) })
    }

    /// Records the location of one replicate entry.
    pub(crate) fn add_entry(&self, entry: &LogIndexEntry) -> Result<()> {
        let index = entry.op_id.index;
        let chunk = self.open_chunk(index / self.entries_per_chunk, true)?;
        let slot = index % self.entries_per_chunk;

        let mut buf = [0u8; SLOT_LEN as usize];
        buf[..8].copy_from_slice(&entry.op_id.term.to_le_bytes());
        buf[8..16].copy_from_slice(&entry.segment_sequence_number.to_le_bytes());
        buf[16..24].copy_from_slice(&entry.offset_in_segment.to_le_bytes());
        chunk.write_all_at(&buf, slot * SLOT_LEN)?;
        Ok(())
    }

    /// Looks up the physical location of the replicate entry at `index`.
    pub fn get_entry(&self, index: RaftIndex) -> Result<LogIndexEntry> {
        let chunk = self.open_chunk(index / self.entries_per_chunk, false)?;
        let slot = index % self.entries_per_chunk;

        let mut buf = [0u8; SLOT_LEN as usize];
        chunk.read_exact_at(&mut buf, slot * SLOT_LEN)?;
        let term = u64::from_le_bytes(buf[..8].try_into().unwrap());
        let segment_sequence_number = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let offset_in_segment = u64::from_le_bytes(buf[16..24].try_into().unwrap());

        if segment_sequence_number == 0 {
            return Err(Error::NotFound(format!("no log index entry for index {index}")));
        };
        Ok(LogIndexEntry {
            op_id: OpId::new(term, index),
            segment_sequence_number,
            offset_in_segment,
        })
    }

    /// Discards chunks whose maximum covered index is strictly below
    /// `min_index_to_retain`. Partial chunks are never rewritten.
    pub(crate) fn gc(&self, min_index_to_retain: RaftIndex) -> Result<()> {
        let mut deletable = Vec::new();
        for dir_entry in fs::read_dir(&self.dir)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name();
            let Some(start_index) =
                name.to_str().and_then(|n| n.parse::<u64>().ok())
            else {
                warn!(file = ?name, "skipping unrecognized file in WAL index dir");
                continue;
            };
            if start_index + self.entries_per_chunk <= min_index_to_retain {
                deletable.push((start_index, dir_entry.path()));
            };
        }

        let mut open_chunks = self.open_chunks.lock().expect("index mutex poisoned");
        for (start_index, path) in deletable {
            info!(
                chunk = %path.display(),
                min_index_to_retain,
                "deleting GCable log index chunk",
            );
            open_chunks.remove(&(start_index / self.entries_per_chunk));
            match fs::remove_file(&path) {
                Ok(()) => {},
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {},
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn open_chunk(&self, chunk_id: u64, create: bool) -> Result<Arc<File>> {
        let mut open_chunks = self.open_chunks.lock().expect("index mutex poisoned");
        if let Some(file) = open_chunks.get(&chunk_id) {
            return Ok(file.clone());
        };

        let path = self.dir.join(format!("{:020}", chunk_id * self.entries_per_chunk));
        let result = OpenOptions::new().read(true).write(true).create(create).open(&path);
        let file = match result {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!(
                    "log index chunk {} does not exist",
                    path.display()
                )));
            },
            Err(err) => return Err(err.into()),
        };
        // Chunks are fixed-stride files; size them up front.
        if file.metadata()?.len() < self.entries_per_chunk * SLOT_LEN {
            file.set_len(self.entries_per_chunk * SLOT_LEN)?;
        };

        let file = Arc::new(file);
        open_chunks.insert(chunk_id, file.clone());
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn entry(term: u64, index: u64, seqno: u64, offset: u64) -> LogIndexEntry {
        LogIndexEntry {
            op_id: OpId::new(term, index),
            segment_sequence_number: seqno,
            offset_in_segment: offset,
        }
    }

    #[test]
    fn test_add_and_get_round_trip() {
        let dir = tempdir().unwrap();
        let index = LogIndex::open(dir.path()).unwrap();

        index.add_entry(&entry(2, 17, 3, 4096)).unwrap();
        let found = index.get_entry(17).unwrap();
        assert_eq!(found, entry(2, 17, 3, 4096));
    }

    #[test]
    fn test_absent_entry_is_not_found() {
        let dir = tempdir().unwrap();
        let index = LogIndex::open(dir.path()).unwrap();

        index.add_entry(&entry(1, 5, 1, 64)).unwrap();
        assert!(matches!(index.get_entry(6), Err(Error::NotFound(_))));
        // A whole missing chunk is also NotFound.
        assert!(matches!(index.get_entry(5_000_000), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_chunk_rollover() {
        let dir = tempdir().unwrap();
        let index = LogIndex::with_entries_per_chunk(dir.path(), 4).unwrap();

        for i in 1..=10 {
            index.add_entry(&entry(1, i, 1, i * 100)).unwrap();
        }
        for i in 1..=10 {
            assert_eq!(index.get_entry(i).unwrap().offset_in_segment, i * 100);
        }

        // Indexes 0..4, 4..8 and 8..12 each land in their own chunk file.
        let chunks = fs::read_dir(dir.path().join(INDEX_DIR_NAME)).unwrap().count();
        assert_eq!(chunks, 3);
    }

    #[test]
    fn test_gc_discards_only_fully_dead_chunks() {
        let dir = tempdir().unwrap();
        let index = LogIndex::with_entries_per_chunk(dir.path(), 4).unwrap();

        for i in 1..=10 {
            index.add_entry(&entry(1, i, 1, i * 100)).unwrap();
        }

        // Chunk [0, 4) has max index 3 < 6; chunk [4, 8) still covers 6.
        index.gc(6).unwrap();
        assert!(matches!(index.get_entry(2), Err(Error::NotFound(_))));
        assert_eq!(index.get_entry(6).unwrap().offset_in_segment, 600);
        assert_eq!(index.get_entry(9).unwrap().offset_in_segment, 900);

        let chunks = fs::read_dir(dir.path().join(INDEX_DIR_NAME)).unwrap().count();
        assert_eq!(chunks, 2);
    }
}
