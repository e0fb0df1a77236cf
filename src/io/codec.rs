//! Binary payload planes for cache entries.
//!
//! A payload is a sequence of little-endian planes written back to back.
//! The entry record carries the shapes, so planes have no headers of
//! their own; the reader fails on short or trailing data.

use crate::types::{PipelineError, PipelineResult};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

#[derive(Debug, Default)]
pub struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_f32<I: IntoIterator<Item = f32>>(&mut self, values: I) {
        for v in values {
            self.buf.extend_from_slice(&v.to_le_bytes());
        }
    }

    pub fn put_u16<I: IntoIterator<Item = u16>>(&mut self, values: I) {
        for v in values {
            self.buf.extend_from_slice(&v.to_le_bytes());
        }
    }

    pub fn put_u8<I: IntoIterator<Item = u8>>(&mut self, values: I) {
        self.buf.extend(values);
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> PipelineResult<&'a [u8]> {
        let end = self.pos.checked_add(len).filter(|end| *end <= self.buf.len()).ok_or_else(|| {
            PipelineError::InvalidFormat(format!(
                "payload truncated: need {} bytes at offset {}, have {}",
                len,
                self.pos,
                self.buf.len()
            ))
        })?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    pub fn f32_plane(&mut self, count: usize) -> PipelineResult<Vec<f32>> {
        let bytes = self.take(count * 4)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }

    pub fn u16_plane(&mut self, count: usize) -> PipelineResult<Vec<u16>> {
        let bytes = self.take(count * 2)?;
        Ok(bytes.chunks_exact(2).map(|b| u16::from_le_bytes([b[0], b[1]])).collect())
    }

    pub fn u8_plane(&mut self, count: usize) -> PipelineResult<Vec<u8>> {
        Ok(self.take(count)?.to_vec())
    }

    /// Ensure every byte was consumed
    pub fn finish(self) -> PipelineResult<()> {
        if self.pos != self.buf.len() {
            return Err(PipelineError::InvalidFormat(format!(
                "payload has {} trailing bytes",
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}

pub fn compress(payload: &[u8]) -> PipelineResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(payload.len() / 2), Compression::fast());
    encoder.write_all(payload)?;
    Ok(encoder.finish()?)
}

pub fn decompress(compressed: &[u8]) -> PipelineResult<Vec<u8>> {
    let mut decoder = GzDecoder::new(compressed);
    let mut payload = Vec::new();
    decoder
        .read_to_end(&mut payload)
        .map_err(|e| PipelineError::InvalidFormat(format!("failed to decompress payload: {}", e)))?;
    Ok(payload)
}

/// Hex BLAKE3 digest of an uncompressed payload
pub fn digest(payload: &[u8]) -> String {
    blake3::hash(payload).to_hex().to_string()
}
