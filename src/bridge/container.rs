//! The binary container distinguishing compiled bytecode from source text.
//!
//! Layout, bit-exact: magic `FF 6C 73 EE` (`0xFF 'l' 's' 0xEE`), then one
//! `u32` length-prefixed payload blob. The payload may carry the byte
//! buffer's compression marker and inflates to raw engine bytecode.

use crate::bytes::{self, ByteBuf};
use crate::error::ScriptError;

pub const CONTAINER_MAGIC: [u8; 4] = [0xFF, b'l', b's', 0xEE];

pub fn is_container(data: &[u8]) -> bool {
    data.len() > 4 && data[0..4] == CONTAINER_MAGIC
}

/// Frames raw bytecode into a container, optionally compressing the
/// payload.
pub fn wrap(bytecode: &[u8], compress: bool) -> Vec<u8> {
    let payload = if compress {
        bytes::compress(bytecode)
    } else {
        bytecode.to_vec()
    };
    let mut buf = ByteBuf::new();
    buf.write_bytes(&CONTAINER_MAGIC);
    buf.write_blob(&payload);
    buf.into_vec()
}

/// Strips and validates the container framing, inflating the payload when
/// the compression marker is present.
pub fn unwrap(data: &[u8]) -> Result<Vec<u8>, ScriptError> {
    if !is_container(data) {
        return Err(ScriptError::guest("missing bytecode container magic"));
    }
    let mut buf = ByteBuf::from_vec(data.to_vec());
    buf.seek(CONTAINER_MAGIC.len());
    let payload = buf
        .read_blob()
        .ok_or_else(|| ScriptError::guest("truncated bytecode container"))?;
    if bytes::is_compressed(&payload) {
        return bytes::uncompress(&payload).map_err(ScriptError::guest);
    }
    Ok(payload)
}
