//! Wire protocol for the edge inference gateway.
//!
//! # Framing
//!
//! Every message is a length-prefixed frame: a little-endian `u32` outer
//! length followed by that many payload bytes. The codec here operates on
//! the inner frame only — connection code owns the prefix and the 64 MiB
//! cap on it.
//!
//! # Zero-copy contract
//!
//! `parse_request` borrows the model id and every input blob directly
//! from the receive buffer. The only allocation is the descriptor
//! sequence; payload bytes are never copied by the codec.
//!
//! # Bounds discipline
//!
//! Every multi-byte read is bounds-checked before it happens, and all
//! length arithmetic is checked. A frame cut at any byte offset parses to
//! [`ProtocolError::Truncated`] without touching memory past the cut.

mod error;
mod frame;

pub use error::ProtocolError;
pub use frame::{
    HEADER_LEN, MAGIC, MAX_DIMS, MAX_FRAME_LEN, MAX_MODEL_ID_LEN, PROTOCOL_VERSION,
    RESPONSE_HEADER_LEN, Request, RequestInput, encode_request, encode_response, parse_request,
    read_req_id,
};
