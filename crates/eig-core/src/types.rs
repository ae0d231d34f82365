//! Tensor element types and binding descriptors shared by the wire
//! protocol and the accelerator backend.

/// Tensor element type as carried on the wire and declared by engines.
///
/// The encoding is a closed set — unknown bytes are rejected at the
/// protocol boundary rather than defaulted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DType {
    Fp32 = 0,
    Fp16 = 1,
    Int8 = 2,
    Int32 = 3,
}

impl DType {
    /// Size in bytes of one element.
    pub const fn size_of(self) -> usize {
        match self {
            DType::Fp32 | DType::Int32 => 4,
            DType::Fp16 => 2,
            DType::Int8 => 1,
        }
    }
}

impl TryFrom<u8> for DType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(DType::Fp32),
            1 => Ok(DType::Fp16),
            2 => Ok(DType::Int8),
            3 => Ok(DType::Int32),
            other => Err(other),
        }
    }
}

/// One input tensor as described by a request frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorDesc {
    pub dtype: DType,
    /// NCHW or whatever layout the engine expects; every dim is positive.
    pub shape: Vec<i32>,
    /// Declared payload length of the accompanying blob.
    pub byte_len: u32,
}

/// Whether a binding feeds the engine or is produced by it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

/// One declared input or output slot of a loaded engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindingDesc {
    pub name: String,
    pub direction: Direction,
    pub dtype: DType,
    pub shape: Vec<i64>,
}

impl BindingDesc {
    /// Total byte length of the binding: product of dims × element size.
    ///
    /// `None` when a dim is non-positive or the product overflows.
    pub fn byte_len(&self) -> Option<usize> {
        let mut volume: u64 = 1;
        for &dim in &self.shape {
            if dim <= 0 {
                return None;
            }
            volume = volume.checked_mul(dim as u64)?;
        }
        let bytes = volume.checked_mul(self.dtype.size_of() as u64)?;
        usize::try_from(bytes).ok()
    }
}
