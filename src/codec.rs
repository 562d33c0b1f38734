//! Compression codec provider (SPEC_FULL.md ss4.8).

use std::io::Read;

use crate::wire::CompressionType;

#[derive(Debug, thiserror::Error)]
pub enum DecompressionError {
    #[error("lz4 decompression failed: {0}")]
    Lz4(String),
    #[error("zlib decompression failed: {0}")]
    Zlib(String),
    #[error("zstd decompression failed: {0}")]
    Zstd(String),
}

/// Decodes a compressed payload into its uncompressed form.
pub trait Codec: Send + Sync {
    fn decode(&self, payload: &[u8], uncompressed_size: u32) -> Result<Vec<u8>, DecompressionError>;
}

struct NoneCodec;
impl Codec for NoneCodec {
    fn decode(&self, payload: &[u8], _uncompressed_size: u32) -> Result<Vec<u8>, DecompressionError> {
        Ok(payload.to_vec())
    }
}

struct Lz4Codec;
impl Codec for Lz4Codec {
    fn decode(&self, payload: &[u8], uncompressed_size: u32) -> Result<Vec<u8>, DecompressionError> {
        let mut decoder = lz4::Decoder::new(payload).map_err(|e| DecompressionError::Lz4(e.to_string()))?;
        let mut out = Vec::with_capacity(uncompressed_size as usize);
        decoder
            .read_to_end(&mut out)
            .map_err(|e| DecompressionError::Lz4(e.to_string()))?;
        Ok(out)
    }
}

struct ZlibCodec;
impl Codec for ZlibCodec {
    fn decode(&self, payload: &[u8], uncompressed_size: u32) -> Result<Vec<u8>, DecompressionError> {
        let mut decoder = flate2::read::ZlibDecoder::new(payload);
        let mut out = Vec::with_capacity(uncompressed_size as usize);
        decoder
            .read_to_end(&mut out)
            .map_err(|e| DecompressionError::Zlib(e.to_string()))?;
        Ok(out)
    }
}

struct ZstdCodec;
impl Codec for ZstdCodec {
    fn decode(&self, payload: &[u8], uncompressed_size: u32) -> Result<Vec<u8>, DecompressionError> {
        zstd::stream::decode_all(payload)
            .map(|out| {
                debug_assert!(out.len() <= uncompressed_size as usize * 4, "sanity bound only");
                out
            })
            .map_err(|e| DecompressionError::Zstd(e.to_string()))
    }
}

/// Resolves a [`CompressionType`] to a concrete [`Codec`].
///
/// Stateless: codecs carry no per-message state, so `get` simply dispatches
/// to a static singleton rather than constructing one per call.
pub struct CompressionCodecProvider;

impl CompressionCodecProvider {
    pub fn get(compression: CompressionType) -> &'static dyn Codec {
        match compression {
            CompressionType::None => &NoneCodec,
            CompressionType::Lz4 => &Lz4Codec,
            CompressionType::Zlib => &ZlibCodec,
            CompressionType::Zstd => &ZstdCodec,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_codec_passes_through() {
        let codec = CompressionCodecProvider::get(CompressionType::None);
        let data = b"hello world".to_vec();
        assert_eq!(codec.decode(&data, data.len() as u32).unwrap(), data);
    }

    #[test]
    fn zlib_roundtrip() {
        use std::io::Write;
        let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"roundtrip payload").unwrap();
        let compressed = encoder.finish().unwrap();

        let codec = CompressionCodecProvider::get(CompressionType::Zlib);
        let decoded = codec.decode(&compressed, "roundtrip payload".len() as u32).unwrap();
        assert_eq!(decoded, b"roundtrip payload");
    }

    #[test]
    fn zstd_roundtrip() {
        let compressed = zstd::stream::encode_all(&b"zstd payload"[..], 0).unwrap();
        let codec = CompressionCodecProvider::get(CompressionType::Zstd);
        let decoded = codec.decode(&compressed, "zstd payload".len() as u32).unwrap();
        assert_eq!(decoded, b"zstd payload");
    }

    #[test]
    fn lz4_roundtrip() {
        let mut encoder = lz4::EncoderBuilder::new().build(Vec::new()).unwrap();
        use std::io::Write;
        encoder.write_all(b"lz4 payload").unwrap();
        let (compressed, result) = encoder.finish();
        result.unwrap();

        let codec = CompressionCodecProvider::get(CompressionType::Lz4);
        let decoded = codec.decode(&compressed, "lz4 payload".len() as u32).unwrap();
        assert_eq!(decoded, b"lz4 payload");
    }
}
