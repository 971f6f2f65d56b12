//! Fixed-layout records exchanged with the emulator over the interrupt queues.
//!
//! Both records mirror the C structures used on the emulator side, so integers
//! are written in the host's native byte order and the response carries the
//! trailing padding the C compiler inserts after `success`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Failure to interpret an inbound payload as a wire record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed {record}: expected at least {expected} bytes, got {actual}")]
    Truncated {
        record: &'static str,
        expected: usize,
        actual: usize,
    },
}

fn ensure_len(record: &'static str, expected: usize, src: &[u8]) -> Result<(), DecodeError> {
    if src.len() < expected {
        return Err(DecodeError::Truncated {
            record,
            expected,
            actual: src.len(),
        });
    }
    Ok(())
}

/// Interrupt exit reported by the emulated core.
///
/// `id` is an opaque token assigned by the emulator and must be echoed back
/// unchanged in the matching [`ExitResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExitRequest {
    pub id: u64,
    pub irq_number: u32,
    /// EXC_RETURN value the core loaded into `pc` to leave the handler.
    pub return_type: u32,
}

impl ExitRequest {
    /// `id: u64 | irq_number: u32 | return_type: u32`
    pub const WIRE_SIZE: usize = 16;

    pub fn new(id: u64, irq_number: u32, return_type: u32) -> Self {
        Self {
            id,
            irq_number,
            return_type,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::WIRE_SIZE);
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into<B: BufMut>(&self, dst: &mut B) {
        dst.put_u64_ne(self.id);
        dst.put_u32_ne(self.irq_number);
        dst.put_u32_ne(self.return_type);
    }

    /// Decode a request from the front of `src`. Bytes past the record are ignored.
    pub fn decode(mut src: &[u8]) -> Result<Self, DecodeError> {
        ensure_len("exit request", Self::WIRE_SIZE, src)?;
        Ok(Self {
            id: src.get_u64_ne(),
            irq_number: src.get_u32_ne(),
            return_type: src.get_u32_ne(),
        })
    }
}

/// Acknowledgement for a previously received [`ExitRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExitResponse {
    pub id: u64,
    pub success: bool,
}

impl ExitResponse {
    /// `id: u64 | success: u32 | padding: u32`
    pub const WIRE_SIZE: usize = 16;

    pub fn new(id: u64, success: bool) -> Self {
        Self { id, success }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::WIRE_SIZE);
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into<B: BufMut>(&self, dst: &mut B) {
        dst.put_u64_ne(self.id);
        dst.put_u32_ne(u32::from(self.success));
        dst.put_u32_ne(0);
    }

    /// Any non-zero `success` word decodes as `true`.
    pub fn decode(mut src: &[u8]) -> Result<Self, DecodeError> {
        ensure_len("exit response", Self::WIRE_SIZE, src)?;
        let id = src.get_u64_ne();
        let success = src.get_u32_ne() != 0;
        Ok(Self { id, success })
    }
}
