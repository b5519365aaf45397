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

//! On-disk framing of one WAL segment:
//!
//! ```text
//! [ b"kudulogf" | u32-le header-len | header pb ]
//! [ u32-le payload-len | u32-le crc32c(payload) | payload ]*
//! [ b"closedls" | u32-le footer-len | footer pb ]?
//! ```
//!
//! The batch payload is the serialized entry batch. When the header
//! declares a codec it is `[u32-le uncompressed-len | compressed bytes]`
//! instead. The CRC always covers the stored payload bytes.

use prost::Message;

use crate::{
    compression::CodecType,
    error::CodecError,
    types::{LogEntryBatchPb, SegmentFooterPb, SegmentHeaderPb},
};

/// Magic prefix of every segment file.
pub(crate) const SEGMENT_MAGIC: &[u8; 8] = b"kudulogf";
/// Magic prefix of the optional footer block.
pub(crate) const FOOTER_MAGIC: &[u8; 8] = b"closedls";
/// Size of a magic string plus the u32 length that follows it.
pub(crate) const MAGIC_AND_LEN: u64 = 12;
/// Size of a batch record header: u32 payload length + u32 payload CRC32C.
pub(crate) const RECORD_HEADER_LEN: u64 = 8;
/// Size of the uncompressed-length prefix of a compressed payload.
pub(crate) const COMPRESSION_PREFIX_LEN: u64 = 4;
/// Window scanned backwards from EOF to locate the footer block.
pub(crate) const FOOTER_SCAN_WINDOW: u64 = 4096;

/// Metadata header of one framed batch record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecordHeader {
    pub(crate) len: u32,
    pub(crate) crc: u32,
}

impl RecordHeader {
    /// Decodes a [`RecordHeader`] from the beginning of the given buffer.
    pub(crate) fn decode(buf: &[u8]) -> Result<RecordHeader, CodecError> {
        if (buf.len() as u64) < RECORD_HEADER_LEN {
            return Err(CodecError::BufTooSmall {
                required: RECORD_HEADER_LEN,
                remaining: buf.len() as u64,
            });
        };
        // SAFETY: Length checked at the line above.
        let len = u32::from_le_bytes(buf[..4].try_into().unwrap());
        let crc = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        Ok(RecordHeader { len, crc })
    }
}

/// Encodes the header block: magic, length, serialized header.
pub(crate) fn encode_header_block(header: &SegmentHeaderPb) -> Vec<u8> {
    let pb = header.encode_to_vec();
    let mut out = Vec::with_capacity(MAGIC_AND_LEN as usize + pb.len());
    out.extend_from_slice(SEGMENT_MAGIC);
    out.extend_from_slice(&(pb.len() as u32).to_le_bytes());
    out.extend_from_slice(&pb);
    out
}

/// Decodes the header block from the beginning of a segment file.
///
/// Returns the parsed header and the number of bytes it occupies on disk,
/// which is also the offset of the first entry-batch record.
pub(crate) fn decode_header_block(buf: &[u8]) -> Result<(SegmentHeaderPb, u64), CodecError> {
    if (buf.len() as u64) < MAGIC_AND_LEN {
        return Err(CodecError::BufTooSmall {
            required: MAGIC_AND_LEN,
            remaining: buf.len() as u64,
        });
    };
    if &buf[..8] != SEGMENT_MAGIC {
        return Err(CodecError::BadSegmentMagic);
    };
    // SAFETY: Length checked at the top of the function.
    let len = u32::from_le_bytes(buf[8..12].try_into().unwrap()) as u64;
    let end = MAGIC_AND_LEN + len;
    if (buf.len() as u64) < end {
        return Err(CodecError::BufTooSmall { required: end, remaining: buf.len() as u64 });
    };
    let header = SegmentHeaderPb::decode(&buf[MAGIC_AND_LEN as usize..end as usize])
        .map_err(|e| CodecError::HeaderDecode(e.into()))?;
    Ok((header, end))
}

/// Encodes the footer block: magic, length, serialized footer.
pub(crate) fn encode_footer_block(footer: &SegmentFooterPb) -> Vec<u8> {
    let pb = footer.encode_to_vec();
    let mut out = Vec::with_capacity(MAGIC_AND_LEN as usize + pb.len());
    out.extend_from_slice(FOOTER_MAGIC);
    out.extend_from_slice(&(pb.len() as u32).to_le_bytes());
    out.extend_from_slice(&pb);
    out
}

/// Locates the footer block in the tail window of a segment file.
///
/// A closed segment ends exactly at its footer, so the block is found by
/// scanning the window backwards for the footer magic and accepting only a
/// candidate whose declared length lands precisely on the end of the window
/// and whose payload decodes. Returns the footer and the block's total
/// on-disk length, or `None` for an unclosed segment.
pub(crate) fn find_footer_in_tail(tail: &[u8]) -> Option<(SegmentFooterPb, u64)> {
    if (tail.len() as u64) < MAGIC_AND_LEN {
        return None;
    };
    let last_candidate = tail.len() - MAGIC_AND_LEN as usize;
    for pos in (0..=last_candidate).rev() {
        if &tail[pos..pos + 8] != FOOTER_MAGIC {
            continue;
        };
        // SAFETY: pos + 12 <= tail.len() by the loop bound.
        let len = u32::from_le_bytes(tail[pos + 8..pos + 12].try_into().unwrap()) as usize;
        if pos + MAGIC_AND_LEN as usize + len != tail.len() {
            continue;
        };
        if let Ok(footer) = SegmentFooterPb::decode(&tail[pos + MAGIC_AND_LEN as usize..]) {
            return Some((footer, MAGIC_AND_LEN + len as u64));
        };
    }
    None
}

/// Frames one serialized entry batch into a batch record, compressing the
/// payload first if `codec` says so.
pub(crate) fn encode_batch_record(
    batch_data: &[u8],
    codec: CodecType,
) -> Result<Vec<u8>, CodecError> {
    let payload = if codec.is_compressed() {
        let compressed = codec.compress(batch_data)?;
        let mut payload =
            Vec::with_capacity(COMPRESSION_PREFIX_LEN as usize + compressed.len());
        payload.extend_from_slice(&(batch_data.len() as u32).to_le_bytes());
        payload.extend_from_slice(&compressed);
        payload
    } else {
        batch_data.to_vec()
    };

    let crc = crc32c::crc32c(&payload);
    let mut out = Vec::with_capacity(RECORD_HEADER_LEN as usize + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Verifies a stored payload against its record header and decodes it.
pub(crate) fn decode_batch_payload(
    payload: &[u8],
    header: RecordHeader,
    codec: CodecType,
) -> Result<LogEntryBatchPb, CodecError> {
    let computed = crc32c::crc32c(payload);
    if computed != header.crc {
        return Err(CodecError::CrcMismatch { stored: header.crc, computed });
    };

    if codec.is_compressed() {
        if (payload.len() as u64) < COMPRESSION_PREFIX_LEN {
            return Err(CodecError::BufTooSmall {
                required: COMPRESSION_PREFIX_LEN,
                remaining: payload.len() as u64,
            });
        };
        // SAFETY: Length checked at the line above.
        let uncompressed_len =
            u32::from_le_bytes(payload[..4].try_into().unwrap()) as usize;
        let raw = codec.decompress(&payload[COMPRESSION_PREFIX_LEN as usize..], uncompressed_len)?;
        LogEntryBatchPb::decode(raw.as_slice()).map_err(|e| CodecError::BatchDecode(e.into()))
    } else {
        LogEntryBatchPb::decode(payload).map_err(|e| CodecError::BatchDecode(e.into()))
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::types::{LogEntry, OpId, ReplicateMsg};

    fn sample_batch() -> LogEntryBatchPb {
        let entries = (1..=3)
            .map(|i| {
                LogEntry::replicate(ReplicateMsg {
                    id: Some(OpId::new(1, i)),
                    payload: Bytes::from(format!("payload-{i}")),
                })
            })
            .collect();
        LogEntryBatchPb { entries }
    }

    #[test]
    fn test_header_block_round_trip() {
        let header = SegmentHeaderPb {
            sequence_number: 7,
            tablet_id: b"tablet-0001".to_vec(),
            schema: b"k:int64,v:string".to_vec(),
            schema_version: 3,
            compression_codec: CodecType::Lz4 as i32,
        };

        let block = encode_header_block(&header);
        let (decoded, consumed) = decode_header_block(&block).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(consumed, block.len() as u64);
        assert_eq!(decoded.codec(), CodecType::Lz4);
    }

    #[test]
    fn test_header_block_rejects_bad_magic() {
        let header = SegmentHeaderPb::default();
        let mut block = encode_header_block(&header);
        block[0] ^= 0xFF;
        assert!(matches!(decode_header_block(&block), Err(CodecError::BadSegmentMagic)));
    }

    #[test]
    fn test_footer_found_only_at_exact_eof() {
        let footer = SegmentFooterPb {
            num_entries: 12,
            min_replicate_index: Some(3),
            max_replicate_index: Some(14),
            close_timestamp_micros: 1_700_000_000_000_000,
        };

        let mut tail = vec![0xABu8; 100];
        tail.extend_from_slice(&encode_footer_block(&footer));

        let (found, block_len) = find_footer_in_tail(&tail).unwrap();
        assert_eq!(found, footer);
        assert_eq!(block_len as usize, tail.len() - 100);

        // The same block followed by trailing garbage no longer ends at EOF.
        tail.extend_from_slice(&[0u8; 16]);
        assert!(find_footer_in_tail(&tail).is_none());
    }

    #[test]
    fn test_footer_absent_in_zeroed_tail() {
        assert!(find_footer_in_tail(&[0u8; 256]).is_none());
    }

    #[test]
    fn test_batch_record_round_trip_uncompressed() {
        let batch = sample_batch();
        let data = batch.encode_to_vec();
        let record = encode_batch_record(&data, CodecType::NoCompression).unwrap();

        let header = RecordHeader::decode(&record).unwrap();
        assert_eq!(header.len as usize, record.len() - RECORD_HEADER_LEN as usize);

        let payload = &record[RECORD_HEADER_LEN as usize..];
        let decoded = decode_batch_payload(payload, header, CodecType::NoCompression).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn test_batch_record_round_trip_compressed() {
        let batch = sample_batch();
        let data = batch.encode_to_vec();
        for codec in [CodecType::Snappy, CodecType::Lz4, CodecType::Zstd] {
            let record = encode_batch_record(&data, codec).unwrap();
            let header = RecordHeader::decode(&record).unwrap();
            let payload = &record[RECORD_HEADER_LEN as usize..];
            let decoded = decode_batch_payload(payload, header, codec).unwrap();
            assert_eq!(decoded, batch, "{codec:?}");
        }
    }

    #[test]
    fn test_batch_record_detects_corruption() {
        let batch = sample_batch();
        let data = batch.encode_to_vec();
        let mut record = encode_batch_record(&data, CodecType::NoCompression).unwrap();
        let last = record.len() - 1;
        record[last] ^= 0xFF;

        let header = RecordHeader::decode(&record).unwrap();
        let payload = &record[RECORD_HEADER_LEN as usize..];
        let err = decode_batch_payload(payload, header, CodecType::NoCompression).unwrap_err();
        assert!(matches!(err, CodecError::CrcMismatch { .. }));
    }
}
