//! Frame layout, parsing, and serialization.
//!
//! Request frame (after the outer length prefix, all little-endian):
//!
//! ```text
//! [4]  magic  'T','R','T',0x01
//! u16  version = 1
//! u16  flags
//! u32  model_len
//! u32  n_inputs
//! u32  req_id            (reserved word; echoed unchanged in the response)
//! [model_len] model id, ascii
//! repeat n_inputs:
//!   u8  dtype   u8 ndims   [ndims] i32 dims   u32 blob_len
//! concatenated blobs, in input order
//! ```
//!
//! Response frame:
//!
//! ```text
//! u32 req_id   u32 status   u32 n_outputs
//! repeat n_outputs: u32 blob_len
//! concatenated blobs
//! ```

use eig_core::types::{DType, TensorDesc};

use crate::error::ProtocolError;

/// First four bytes of every request frame.
pub const MAGIC: [u8; 4] = *b"TRT\x01";

/// The only protocol version this gateway speaks.
pub const PROTOCOL_VERSION: u16 = 1;

/// Fixed request header size in bytes.
pub const HEADER_LEN: usize = 20;

/// Fixed response header size in bytes (req_id, status, n_outputs).
pub const RESPONSE_HEADER_LEN: usize = 12;

/// Model ids longer than this are rejected with `OversizedField`.
pub const MAX_MODEL_ID_LEN: u32 = 256;

/// Maximum tensor rank accepted on the wire.
pub const MAX_DIMS: u8 = 8;

/// Cap on the outer frame length. Larger frames are rejected with
/// status 1 before any body bytes are read, bounding per-connection
/// memory.
pub const MAX_FRAME_LEN: u32 = 64 << 20;

/// A parsed request. Model id and blobs borrow from the frame buffer.
#[derive(Debug, PartialEq, Eq)]
pub struct Request<'a> {
    pub req_id: u32,
    pub flags: u16,
    pub model_id: &'a str,
    pub inputs: Vec<TensorDesc>,
    pub blobs: Vec<&'a [u8]>,
}

/// One input tensor handed to [`encode_request`].
#[derive(Debug)]
pub struct RequestInput<'a> {
    pub dtype: DType,
    pub shape: Vec<i32>,
    pub blob: &'a [u8],
}

// ─── Bounds-checked reader ───────────────────────────────────────────────────

struct FrameReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self.pos.checked_add(n).ok_or(ProtocolError::Truncated)?;
        if end > self.buf.len() {
            return Err(ProtocolError::Truncated);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32, ProtocolError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

// ─── Request parsing ─────────────────────────────────────────────────────────

/// Parses one inner request frame (the bytes after the outer length
/// prefix).
pub fn parse_request(frame: &[u8]) -> Result<Request<'_>, ProtocolError> {
    let mut r = FrameReader::new(frame);

    let magic = r.take(4)?;
    if magic != MAGIC {
        return Err(ProtocolError::BadMagic);
    }
    let version = r.u16()?;
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::BadVersion(version));
    }
    let flags = r.u16()?;
    let model_len = r.u32()?;
    let n_inputs = r.u32()?;
    let req_id = r.u32()?;

    if model_len > MAX_MODEL_ID_LEN {
        return Err(ProtocolError::OversizedField {
            field: "model_id",
            len: model_len,
            max: MAX_MODEL_ID_LEN,
        });
    }
    let model_bytes = r.take(model_len as usize)?;
    let model_id = std::str::from_utf8(model_bytes)
        .ok()
        .filter(|s| s.is_ascii())
        .ok_or(ProtocolError::BadModelId)?;

    let mut inputs = Vec::new();
    for _ in 0..n_inputs {
        let dtype = DType::try_from(r.u8()?).map_err(ProtocolError::BadDType)?;
        let ndims = r.u8()?;
        if ndims > MAX_DIMS {
            return Err(ProtocolError::TooManyDims(ndims));
        }
        let mut shape = Vec::with_capacity(ndims as usize);
        for _ in 0..ndims {
            let dim = r.i32()?;
            if dim <= 0 {
                return Err(ProtocolError::BadShape(dim));
            }
            shape.push(dim);
        }
        let byte_len = r.u32()?;
        inputs.push(TensorDesc {
            dtype,
            shape,
            byte_len,
        });
    }

    // Total payload the descriptors promise. The sum of at most 2^32
    // u32 values fits u64, but keep the arithmetic checked anyway.
    let mut want: u64 = 0;
    for desc in &inputs {
        want = want
            .checked_add(desc.byte_len as u64)
            .ok_or(ProtocolError::Truncated)?;
    }
    if (r.remaining() as u64) < want {
        return Err(ProtocolError::Truncated);
    }

    let mut blobs = Vec::with_capacity(inputs.len());
    for desc in &inputs {
        blobs.push(r.take(desc.byte_len as usize)?);
    }

    Ok(Request {
        req_id,
        flags,
        model_id,
        inputs,
        blobs,
    })
}

/// Best-effort request id recovery from a frame that may not parse.
/// Returns 0 unless the header is present and carries our magic.
pub fn read_req_id(frame: &[u8]) -> u32 {
    if frame.len() >= HEADER_LEN && frame[..4] == MAGIC {
        u32::from_le_bytes([frame[16], frame[17], frame[18], frame[19]])
    } else {
        0
    }
}

// ─── Serialization ───────────────────────────────────────────────────────────

/// Serializes a complete request, outer length prefix included.
pub fn encode_request(
    req_id: u32,
    model_id: &str,
    inputs: &[RequestInput<'_>],
) -> Result<Vec<u8>, ProtocolError> {
    if !model_id.is_ascii() {
        return Err(ProtocolError::BadModelId);
    }
    if model_id.len() as u64 > MAX_MODEL_ID_LEN as u64 {
        return Err(ProtocolError::OversizedField {
            field: "model_id",
            len: model_id.len() as u32,
            max: MAX_MODEL_ID_LEN,
        });
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + model_id.len());
    frame.extend_from_slice(&MAGIC);
    frame.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
    frame.extend_from_slice(&0u16.to_le_bytes()); // flags
    frame.extend_from_slice(&(model_id.len() as u32).to_le_bytes());
    frame.extend_from_slice(&(inputs.len() as u32).to_le_bytes());
    frame.extend_from_slice(&req_id.to_le_bytes());
    frame.extend_from_slice(model_id.as_bytes());

    for input in inputs {
        if input.shape.len() > MAX_DIMS as usize {
            return Err(ProtocolError::TooManyDims(input.shape.len() as u8));
        }
        frame.push(input.dtype as u8);
        frame.push(input.shape.len() as u8);
        for &dim in &input.shape {
            if dim <= 0 {
                return Err(ProtocolError::BadShape(dim));
            }
            frame.extend_from_slice(&dim.to_le_bytes());
        }
        let blob_len =
            u32::try_from(input.blob.len()).map_err(|_| ProtocolError::FrameTooLarge {
                len: input.blob.len() as u64,
                max: u32::MAX as u64,
            })?;
        frame.extend_from_slice(&blob_len.to_le_bytes());
    }
    for input in inputs {
        frame.extend_from_slice(input.blob);
    }

    prefix_frame(frame)
}

/// Serializes a complete response, outer length prefix included.
/// `outputs` may be empty — status-only frames are valid.
pub fn encode_response(
    req_id: u32,
    status: u32,
    outputs: &[&[u8]],
) -> Result<Vec<u8>, ProtocolError> {
    let payload: u64 = outputs.iter().map(|o| o.len() as u64).sum();
    let inner = RESPONSE_HEADER_LEN as u64 + 4 * outputs.len() as u64 + payload;
    if inner > u32::MAX as u64 {
        return Err(ProtocolError::FrameTooLarge {
            len: inner,
            max: u32::MAX as u64,
        });
    }

    let mut frame = Vec::with_capacity(inner as usize);
    frame.extend_from_slice(&req_id.to_le_bytes());
    frame.extend_from_slice(&status.to_le_bytes());
    frame.extend_from_slice(&(outputs.len() as u32).to_le_bytes());
    for output in outputs {
        frame.extend_from_slice(&(output.len() as u32).to_le_bytes());
    }
    for output in outputs {
        frame.extend_from_slice(output);
    }

    prefix_frame(frame)
}

fn prefix_frame(inner: Vec<u8>) -> Result<Vec<u8>, ProtocolError> {
    let len = u32::try_from(inner.len()).map_err(|_| ProtocolError::FrameTooLarge {
        len: inner.len() as u64,
        max: u32::MAX as u64,
    })?;
    let mut wire = Vec::with_capacity(4 + inner.len());
    wire.extend_from_slice(&len.to_le_bytes());
    wire.extend_from_slice(&inner);
    Ok(wire)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
