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

use bytes::Bytes;

use crate::compression::CodecType;

pub type SegmentSequenceNumber = u64;
pub type RaftIndex = u64;
pub(crate) type SegmentOffset = u64;

/// Identifier of a single consensus operation: a `(term, index)` pair.
///
/// Ordering is lexicographic by `(term, index)`, which matches the total
/// order the consensus layer assigns to operations.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Message)]
pub struct OpId {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(uint64, tag = "2")]
    pub index: u64,
}

impl OpId {
    pub fn new(term: u64, index: u64) -> OpId {
        OpId { term, index }
    }
}

/// Kind of a log entry. All entries of a batch share a single kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum EntryKind {
    /// Reserved for future kinds.
    Unknown = 0,
    /// A consensus proposal carrying an [`OpId`] and an opaque payload.
    Replicate = 1,
    /// A local commit decision referencing a previously logged replicate.
    Commit = 2,
    /// Zero-payload sentinel used only to drain the append pipeline.
    FlushMarker = 3,
}

/// A replicated operation as handed to the WAL by the consensus layer.
///
/// The payload is an opaque [`Bytes`] buffer: cloning a `ReplicateMsg` into
/// a batch shares the underlying buffer with the producer, which retains
/// ownership of the message for its own in-flight tracking.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReplicateMsg {
    #[prost(message, optional, tag = "1")]
    pub id: Option<OpId>,
    #[prost(bytes = "bytes", tag = "2")]
    pub payload: Bytes,
}

/// A commit decision about a previously logged replicate.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommitMsg {
    #[prost(message, optional, tag = "1")]
    pub committed_op_id: Option<OpId>,
    #[prost(bytes = "bytes", tag = "2")]
    pub result: Bytes,
}

/// One entry of an entry batch. Exactly one of `replicate`/`commit` is set
/// for those kinds; a flush marker carries neither.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogEntry {
    #[prost(enumeration = "EntryKind", tag = "1")]
    pub kind: i32,
    #[prost(message, optional, tag = "2")]
    pub replicate: Option<ReplicateMsg>,
    #[prost(message, optional, tag = "3")]
    pub commit: Option<CommitMsg>,
}

impl LogEntry {
    pub fn replicate(msg: ReplicateMsg) -> LogEntry {
        LogEntry { kind: EntryKind::Replicate as i32, replicate: Some(msg), commit: None }
    }

    pub fn commit(msg: CommitMsg) -> LogEntry {
        LogEntry { kind: EntryKind::Commit as i32, replicate: None, commit: Some(msg) }
    }

    pub(crate) fn flush_marker() -> LogEntry {
        LogEntry { kind: EntryKind::FlushMarker as i32, replicate: None, commit: None }
    }

    /// Returns the replicate [`OpId`] if this is a replicate entry.
    #[inline]
    pub fn replicate_op_id(&self) -> Option<&OpId> {
        self.replicate.as_ref().and_then(|r| r.id.as_ref())
    }
}

/// The unit of atomic append: an ordered sequence of same-kind entries.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogEntryBatchPb {
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<LogEntry>,
}

/// Header written once at the start of every segment file.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SegmentHeaderPb {
    #[prost(uint64, tag = "1")]
    pub sequence_number: SegmentSequenceNumber,
    #[prost(bytes = "vec", tag = "2")]
    pub tablet_id: Vec<u8>,
    /// Opaque schema descriptor recorded for the tablet applier.
    #[prost(bytes = "vec", tag = "3")]
    pub schema: Vec<u8>,
    #[prost(uint32, tag = "4")]
    pub schema_version: u32,
    #[prost(enumeration = "CodecType", tag = "5")]
    pub compression_codec: i32,
}

impl SegmentHeaderPb {
    /// Returns the declared codec, mapping unrecognized values to none.
    #[inline]
    pub fn codec(&self) -> CodecType {
        CodecType::try_from(self.compression_codec).unwrap_or(CodecType::NoCompression)
    }
}

/// Footer written when a segment is closed. Absence means an unclean
/// shutdown while the segment was active.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SegmentFooterPb {
    #[prost(uint64, tag = "1")]
    pub num_entries: u64,
    #[prost(uint64, optional, tag = "2")]
    pub min_replicate_index: Option<RaftIndex>,
    #[prost(uint64, optional, tag = "3")]
    pub max_replicate_index: Option<RaftIndex>,
    #[prost(uint64, tag = "4")]
    pub close_timestamp_micros: u64,
}

impl SegmentFooterPb {
    /// Folds one replicate index into the min/max bounds.
    pub(crate) fn observe_replicate_index(&mut self, index: RaftIndex) {
        self.min_replicate_index =
            Some(self.min_replicate_index.map_or(index, |min| min.min(index)));
        self.max_replicate_index =
            Some(self.max_replicate_index.map_or(index, |max| max.max(index)));
    }
}

/// Pair of retention watermarks supplied by the consensus layer to drive GC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionIndexes {
    /// Highest index applied to durable tablet state; nothing below it must
    /// be replayed for durability.
    pub for_durability: RaftIndex,
    /// Lowest index any still-lagging peer needs to catch up.
    pub for_peers: RaftIndex,
}

impl RetentionIndexes {
    pub fn new(for_durability: RaftIndex, for_peers: RaftIndex) -> RetentionIndexes {
        RetentionIndexes { for_durability, for_peers }
    }
}
