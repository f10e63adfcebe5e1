//! Little-endian byte buffer used by the bytecode container, the proto
//! serializer, and the ordered-table wire format.
//!
//! Reads track a cursor so nested structures can be consumed sequentially;
//! writes append. Blobs are `u32` length-prefixed. Compression wraps a
//! deflate stream in a small marker frame so `is_compressed` can detect it
//! without attempting inflation.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use sha2::{Digest, Sha256};

/// Marker prefix of a compressed blob: `b"CZ"` + `u32` uncompressed length.
const COMPRESS_MARK: [u8; 2] = [b'C', b'Z'];

#[derive(Debug, Clone, Default)]
pub struct ByteBuf {
    data: Vec<u8>,
    read_pos: usize,
}

impl ByteBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data, read_pos: 0 }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.read_pos)
    }

    pub fn read_pos(&self) -> usize {
        self.read_pos
    }

    pub fn seek(&mut self, pos: usize) {
        self.read_pos = pos.min(self.data.len());
    }

    pub fn write_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn write_str(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.data.extend_from_slice(s.as_bytes());
    }

    pub fn write_blob(&mut self, blob: &[u8]) {
        self.write_u32(blob.len() as u32);
        self.data.extend_from_slice(blob);
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        let b = *self.data.get(self.read_pos)?;
        self.read_pos += 1;
        Some(b)
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        let bytes = self.read_exact(2)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        let bytes = self.read_exact(4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_i64(&mut self) -> Option<i64> {
        let bytes = self.read_exact(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Some(i64::from_le_bytes(buf))
    }

    pub fn read_f64(&mut self) -> Option<f64> {
        let bytes = self.read_exact(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Some(f64::from_le_bytes(buf))
    }

    pub fn read_exact(&mut self, n: usize) -> Option<&[u8]> {
        if self.remaining() < n {
            return None;
        }
        let start = self.read_pos;
        self.read_pos += n;
        Some(&self.data[start..start + n])
    }

    pub fn read_str(&mut self) -> Option<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_exact(len)?;
        String::from_utf8(bytes.to_vec()).ok()
    }

    pub fn read_blob(&mut self) -> Option<Vec<u8>> {
        let len = self.read_u32()? as usize;
        Some(self.read_exact(len)?.to_vec())
    }
}

/// Whether `data` carries the compression marker frame.
pub fn is_compressed(data: &[u8]) -> bool {
    data.len() >= 6 && data[0..2] == COMPRESS_MARK
}

/// Wraps `data` in the marker frame around a zlib stream.
pub fn compress(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() / 2 + 8);
    out.extend_from_slice(&COMPRESS_MARK);
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    let mut encoder = ZlibEncoder::new(out, Compression::default());
    encoder.write_all(data).expect("deflate to vec");
    encoder.finish().expect("deflate to vec")
}

/// Inflates a marker-framed blob. Returns the input unchanged when the
/// marker is absent.
pub fn uncompress(data: &[u8]) -> Result<Vec<u8>, String> {
    if !is_compressed(data) {
        return Ok(data.to_vec());
    }
    let raw_len =
        u32::from_le_bytes([data[2], data[3], data[4], data[5]]) as usize;
    let mut decoder = ZlibDecoder::new(&data[6..]);
    let mut out = Vec::with_capacity(raw_len);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| format!("inflate failure: {}", e))?;
    if out.len() != raw_len {
        return Err(format!(
            "inflate length mismatch: expected {} bytes, got {}",
            raw_len,
            out.len()
        ));
    }
    Ok(out)
}

/// Short hex digest used as a chunk name for anonymous buffers.
pub fn digest_name(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut name = String::with_capacity(18);
    name.push('=');
    for byte in digest.iter().take(8) {
        name.push_str(&format!("{:02x}", byte));
    }
    name
}
