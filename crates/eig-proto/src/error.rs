//! Typed framing errors.

/// Everything that can go wrong while decoding or encoding a frame.
///
/// All variants map to wire status 1 — a connection whose framing
/// integrity is suspect is never reused.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("bad magic")]
    BadMagic,

    #[error("unsupported protocol version {0}")]
    BadVersion(u16),

    #[error("unknown dtype byte {0:#04x}")]
    BadDType(u8),

    #[error("{field} length {len} exceeds limit {max}")]
    OversizedField {
        field: &'static str,
        len: u32,
        max: u32,
    },

    #[error("tensor rank {0} exceeds limit")]
    TooManyDims(u8),

    #[error("non-positive shape dimension {0}")]
    BadShape(i32),

    #[error("model id is not ascii")]
    BadModelId,

    #[error("frame truncated")]
    Truncated,

    #[error("frame length {len} exceeds cap {max}")]
    FrameTooLarge { len: u64, max: u64 },
}

impl ProtocolError {
    /// Wire status code for response frames.
    pub const fn status_code(&self) -> u32 {
        1
    }
}
