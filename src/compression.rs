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

use crate::error::{CodecError, Error, Result};

/// Compression codec recorded in a segment header.
///
/// The set is closed: codecs are dispatched through a static table of
/// `{compress, decompress}` function pairs keyed by codec id, not through a
/// runtime-registered hierarchy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum CodecType {
    NoCompression = 0,
    Snappy = 1,
    Lz4 = 2,
    Zstd = 3,
}

impl CodecType {
    /// Resolves a codec from its configured name.
    ///
    /// An empty string means no compression; names are case-insensitive.
    pub fn from_name(name: &str) -> Result<CodecType> {
        match name.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(CodecType::NoCompression),
            "snappy" => Ok(CodecType::Snappy),
            "lz4" => Ok(CodecType::Lz4),
            "zstd" => Ok(CodecType::Zstd),
            other => Err(Error::InvalidArgument(format!("unknown compression codec: {other}"))),
        }
    }

    #[inline]
    pub(crate) fn is_compressed(self) -> bool {
        self != CodecType::NoCompression
    }

    /// Compresses `src` with this codec.
    pub(crate) fn compress(self, src: &[u8]) -> Result<Vec<u8>, CodecError> {
        let pair = codec_table(self).ok_or(CodecError::UnknownCodec(self as i32))?;
        (pair.compress)(src)
    }

    /// Decompresses `src`, which must expand to exactly `uncompressed_len`
    /// bytes.
    pub(crate) fn decompress(
        self,
        src: &[u8],
        uncompressed_len: usize,
    ) -> Result<Vec<u8>, CodecError> {
        let pair = codec_table(self).ok_or(CodecError::UnknownCodec(self as i32))?;
        let out = (pair.decompress)(src, uncompressed_len)?;
        if out.len() != uncompressed_len {
            return Err(CodecError::Decompress(format!(
                "expected {} uncompressed bytes, got {}",
                uncompressed_len,
                out.len()
            )));
        };
        Ok(out)
    }
}

/// One `{compress, decompress}` pair of the codec table.
struct CodecPair {
    compress: fn(&[u8]) -> Result<Vec<u8>, CodecError>,
    decompress: fn(&[u8], usize) -> Result<Vec<u8>, CodecError>,
}

/// Returns the function pair for `codec`, or `None` for the uncompressed
/// codec (callers must not frame an uncompressed payload through the table).
fn codec_table(codec: CodecType) -> Option<&'static CodecPair> {
    static SNAPPY: CodecPair = CodecPair { compress: snappy_compress, decompress: snappy_decompress };
    static LZ4: CodecPair = CodecPair { compress: lz4_compress, decompress: lz4_decompress };
    static ZSTD: CodecPair = CodecPair { compress: zstd_compress, decompress: zstd_decompress };

    match codec {
        CodecType::NoCompression => None,
        CodecType::Snappy => Some(&SNAPPY),
        CodecType::Lz4 => Some(&LZ4),
        CodecType::Zstd => Some(&ZSTD),
    }
}

fn snappy_compress(src: &[u8]) -> Result<Vec<u8>, CodecError> {
    snap::raw::Encoder::new()
        .compress_vec(src)
        .map_err(|e| CodecError::Compress(e.to_string()))
}

fn snappy_decompress(src: &[u8], _uncompressed_len: usize) -> Result<Vec<u8>, CodecError> {
    snap::raw::Decoder::new()
        .decompress_vec(src)
        .map_err(|e| CodecError::Decompress(e.to_string()))
}

fn lz4_compress(src: &[u8]) -> Result<Vec<u8>, CodecError> {
    Ok(lz4_flex::block::compress(src))
}

fn lz4_decompress(src: &[u8], uncompressed_len: usize) -> Result<Vec<u8>, CodecError> {
    lz4_flex::block::decompress(src, uncompressed_len)
        .map_err(|e| CodecError::Decompress(e.to_string()))
}

fn zstd_compress(src: &[u8]) -> Result<Vec<u8>, CodecError> {
    zstd::bulk::compress(src, 0).map_err(|e| CodecError::Compress(e.to_string()))
}

fn zstd_decompress(src: &[u8], uncompressed_len: usize) -> Result<Vec<u8>, CodecError> {
    zstd::bulk::decompress(src, uncompressed_len)
        .map_err(|e| CodecError::Decompress(e.to_string()))
}
