//! Hand-rolled little-endian framing for the streams the module speaks:
//! the replicated log, peer member-status control, the service control
//! duplex, client ingress/egress and the module snapshot stream.
//!
//! Every message is `u32 type tag` followed by fixed fields and
//! length-prefixed strings/blobs. Decoding never panics: truncated or
//! unknown frames surface as [`CodecError`].

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

pub mod client;
pub mod log;
pub mod peer;
pub mod service;
pub mod snapshot;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("truncated frame")]
    Truncated,
    #[error("unknown message type: {0}")]
    UnknownType(u32),
    #[error("invalid field value: {0}")]
    InvalidValue(u32),
    #[error("invalid utf-8 in string field")]
    Utf8,
}

/// Checked reader over a received frame.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() < n {
            return Err(CodecError::Truncated);
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    pub fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.u8()? != 0)
    }

    pub fn u32(&mut self) -> Result<u32, CodecError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("4 bytes")))
    }

    pub fn i32(&mut self) -> Result<i32, CodecError> {
        Ok(self.u32()? as i32)
    }

    pub fn i64(&mut self) -> Result<i64, CodecError> {
        let bytes = self.take(8)?;
        Ok(i64::from_le_bytes(bytes.try_into().expect("8 bytes")))
    }

    pub fn string(&mut self) -> Result<String, CodecError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::Utf8)
    }

    pub fn bytes(&mut self) -> Result<Bytes, CodecError> {
        let len = self.u32()? as usize;
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }
}

pub(crate) fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

pub(crate) fn put_bytes(buf: &mut BytesMut, value: &Bytes) {
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value);
}
