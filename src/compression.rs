// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::error::Error;
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Block compression codec, as named in spec §4.2.
///
/// `Lzo`, `QuickLz` and `Bmz` are recognized wire tags for interoperability
/// with the original system's encoding but are not implemented codecs here
/// (see `DESIGN.md`); compressing with them returns
/// [`Error::UnsupportedCompressor`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum CompressionType {
    /// No compression.
    None,
    /// zlib (deflate) compression.
    Zlib,
    /// LZO compression (wire-compatible tag only).
    Lzo,
    /// QuickLZ compression (wire-compatible tag only).
    QuickLz,
    /// BMZ compression (wire-compatible tag only).
    Bmz,
    /// Snappy-style compression (wire-compatible tag only).
    Snappy,
    /// zstd compression.
    Zstd,
    /// lz4 compression.
    Lz4,
}

impl CompressionType {
    /// Compresses `data`, returning the compressed bytes.
    pub fn compress(self, data: &[u8]) -> crate::Result<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),

            #[cfg(feature = "zlib")]
            Self::Zlib => {
                use flate2::{write::ZlibEncoder, Compression};
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data)?;
                Ok(encoder.finish()?)
            }
            #[cfg(not(feature = "zlib"))]
            Self::Zlib => Err(Error::UnsupportedCompressor(self)),

            #[cfg(feature = "zstd")]
            Self::Zstd => zstd::stream::encode_all(data, 0).map_err(Into::into),
            #[cfg(not(feature = "zstd"))]
            Self::Zstd => Err(Error::UnsupportedCompressor(self)),

            #[cfg(feature = "lz4")]
            Self::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
            #[cfg(not(feature = "lz4"))]
            Self::Lz4 => Err(Error::UnsupportedCompressor(self)),

            Self::Lzo | Self::QuickLz | Self::Bmz | Self::Snappy => {
                Err(Error::UnsupportedCompressor(self))
            }
        }
    }

    /// Decompresses `data` into `decompressed_len` bytes.
    pub fn decompress(self, data: &[u8], decompressed_len: usize) -> crate::Result<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),

            #[cfg(feature = "zlib")]
            Self::Zlib => {
                use flate2::read::ZlibDecoder;
                let mut decoder = ZlibDecoder::new(data);
                let mut out = Vec::with_capacity(decompressed_len);
                decoder.read_to_end(&mut out)?;
                Ok(out)
            }
            #[cfg(not(feature = "zlib"))]
            Self::Zlib => Err(Error::UnsupportedCompressor(self)),

            #[cfg(feature = "zstd")]
            Self::Zstd => zstd::stream::decode_all(data).map_err(Into::into),
            #[cfg(not(feature = "zstd"))]
            Self::Zstd => Err(Error::UnsupportedCompressor(self)),

            #[cfg(feature = "lz4")]
            Self::Lz4 => lz4_flex::decompress_size_prepended(data)
                .map_err(|_| Error::Decompress(self)),
            #[cfg(not(feature = "lz4"))]
            Self::Lz4 => Err(Error::UnsupportedCompressor(self)),

            Self::Lzo | Self::QuickLz | Self::Bmz | Self::Snappy => {
                Err(Error::UnsupportedCompressor(self))
            }
        }
    }
}

impl Encode for CompressionType {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        let tag: u8 = match self {
            Self::None => 0,
            Self::Zlib => 1,
            Self::Lzo => 2,
            Self::QuickLz => 3,
            Self::Bmz => 4,
            Self::Snappy => 5,
            Self::Zstd => 6,
            Self::Lz4 => 7,
        };
        writer.write_u8(tag)?;
        Ok(())
    }
}

impl Decode for CompressionType {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let tag = reader.read_u8()?;
        match tag {
            0 => Ok(Self::None),
            1 => Ok(Self::Zlib),
            2 => Ok(Self::Lzo),
            3 => Ok(Self::QuickLz),
            4 => Ok(Self::Bmz),
            5 => Ok(Self::Snappy),
            6 => Ok(Self::Zstd),
            7 => Ok(Self::Lz4),
            tag => Err(DecodeError::InvalidTag(("CompressionType", tag))),
        }
    }
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Zlib => "zlib",
            Self::Lzo => "lzo",
            Self::QuickLz => "quicklz",
            Self::Bmz => "bmz",
            Self::Snappy => "snappy",
            Self::Zstd => "zstd",
            Self::Lz4 => "lz4",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_none() {
        let data = b"hello world".to_vec();
        let compressed = CompressionType::None.compress(&data).unwrap();
        let decompressed = CompressionType::None
            .decompress(&compressed, data.len())
            .unwrap();
        assert_eq!(data, decompressed);
    }

    #[cfg(feature = "zlib")]
    #[test]
    fn roundtrip_zlib() {
        let data = b"hello world hello world hello world".to_vec();
        let compressed = CompressionType::Zlib.compress(&data).unwrap();
        let decompressed = CompressionType::Zlib
            .decompress(&compressed, data.len())
            .unwrap();
        assert_eq!(data, decompressed);
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn roundtrip_zstd() {
        let data = b"hello world hello world hello world".to_vec();
        let compressed = CompressionType::Zstd.compress(&data).unwrap();
        let decompressed = CompressionType::Zstd
            .decompress(&compressed, data.len())
            .unwrap();
        assert_eq!(data, decompressed);
    }

    #[cfg(feature = "lz4")]
    #[test]
    fn roundtrip_lz4() {
        let data = b"hello world hello world hello world".to_vec();
        let compressed = CompressionType::Lz4.compress(&data).unwrap();
        let decompressed = CompressionType::Lz4
            .decompress(&compressed, data.len())
            .unwrap();
        assert_eq!(data, decompressed);
    }

    #[test]
    fn unsupported_codec_errors() {
        assert!(CompressionType::Lzo.compress(b"x").is_err());
        assert!(CompressionType::QuickLz.compress(b"x").is_err());
        assert!(CompressionType::Bmz.compress(b"x").is_err());
    }

    #[test]
    fn encode_decode_tag_roundtrip() {
        for variant in [
            CompressionType::None,
            CompressionType::Zlib,
            CompressionType::Lzo,
            CompressionType::QuickLz,
            CompressionType::Bmz,
            CompressionType::Snappy,
            CompressionType::Zstd,
            CompressionType::Lz4,
        ] {
            let bytes = variant.encode_into_vec();
            let decoded = CompressionType::decode_from(&mut &bytes[..]).unwrap();
            assert_eq!(variant, decoded);
        }
    }
}
