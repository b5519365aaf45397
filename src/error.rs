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

use std::{io, sync::Arc};

/// Type alias for [`std::result::Result`] with predefined [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Enum of errors that can occur when encoding or decoding segment blocks.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CodecError {
    #[error("Bad segment magic")]
    BadSegmentMagic,
    #[error("Failed to decode segment header: {0}")]
    HeaderDecode(Arc<prost::DecodeError>),
    #[error("Failed to decode segment footer: {0}")]
    FooterDecode(Arc<prost::DecodeError>),
    #[error("Failed to decode entry batch: {0}")]
    BatchDecode(Arc<prost::DecodeError>),
    /// CRC32C check failed on a batch record payload.
    #[error("CRC mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    CrcMismatch { stored: u32, computed: u32 },
    #[error("Buf too small to read block: required: {required}, remaining: {remaining}")]
    BufTooSmall { required: u64, remaining: u64 },
    #[error("Record of {len} bytes exceeds readable bounds")]
    RecordOutOfBounds { len: u64 },
    #[error("Unknown compression codec id: {0}")]
    UnknownCodec(i32),
    #[error("Compression failed: {0}")]
    Compress(String),
    #[error("Decompression failed: {0}")]
    Decompress(String),
}

/// Enum of errors that can occur at the WAL.
///
/// The error is cheap to clone so that a single group-sync failure can be
/// delivered through every batch callback of the drained group.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The log is closed or closing.
    #[error("WAL is shutting down")]
    ShuttingDown,
    /// A file operation failed.
    #[error("I/O: {0}")]
    Io(#[source] Arc<io::Error>),
    /// CRC or framing inconsistency in a closed segment.
    #[error("Corruption past offset {last_good_offset}: {reason}")]
    Corruption { reason: String, last_good_offset: u64 },
    /// An entry disagrees with its batch, or an option failed validation.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// A file or index entry is missing.
    #[error("Not found: {0}")]
    NotFound(String),
    /// Queue capacity was not granted within the caller's deadline.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
    /// An operation was attempted in the wrong lifecycle state.
    #[error("Illegal state: {0}")]
    IllegalState(String),
    /// Segment block codec error.
    #[error("Codec: {0}")]
    Codec(#[from] CodecError),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(Arc::new(err))
    }
}

impl Error {
    /// Builds an [`Error::Corruption`] noting the last byte offset that
    /// decoded cleanly.
    pub(crate) fn corruption(reason: impl Into<String>, last_good_offset: u64) -> Error {
        Error::Corruption { reason: reason.into(), last_good_offset }
    }
}
