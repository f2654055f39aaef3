//! Binary Buffer Codec
//!
//! Converts numeric buffers to and from their base64 wire form, detects the
//! host byte order once per process, and swaps element bytes in place when a
//! peer's order differs from ours.

mod ndarray;

pub use ndarray::{DType, Element, NdArray, NdArrayRep, Scalar};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while decoding or reshaping binary buffers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BufferError {
    #[error("Invalid base64 payload: {0}")]
    InvalidBase64(String),

    #[error("Unknown dtype '{0}'")]
    UnknownDType(String),

    #[error("Unknown byte order '{0}'")]
    UnknownByteOrder(String),

    #[error("Buffer of {len} bytes does not hold whole {dtype} elements")]
    Misaligned { len: usize, dtype: DType },

    #[error("Shape {shape:?} expects {expected} elements, buffer holds {actual}")]
    ShapeMismatch {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },

    #[error("Element type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: DType, found: DType },

    #[error("Index {index} out of bounds for buffer of {len} elements")]
    OutOfBounds { index: usize, len: usize },

    #[error("Value {value:?} does not fit in {dtype}")]
    OutOfRange { value: Scalar, dtype: DType },
}

/// Byte order of multi-byte elements in a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            ByteOrder::Little => "little",
            ByteOrder::Big => "big",
        }
    }

    pub fn parse(name: &str) -> Result<Self, BufferError> {
        match name {
            "little" => Ok(ByteOrder::Little),
            "big" => Ok(ByteOrder::Big),
            other => Err(BufferError::UnknownByteOrder(other.to_string())),
        }
    }
}

/// Host byte order, probed once.
pub static BYTE_ORDER: Lazy<ByteOrder> = Lazy::new(detect_byte_order);

fn detect_byte_order() -> ByteOrder {
    let probe = 0x0102_0304u32.to_ne_bytes();
    if probe[0] == 0x04 {
        ByteOrder::Little
    } else {
        ByteOrder::Big
    }
}

/// The byte order of the running host.
pub fn host_byte_order() -> ByteOrder {
    *BYTE_ORDER
}

/// Encode raw bytes as standard base64.
pub fn buffer_to_base64(buffer: &[u8]) -> String {
    STANDARD.encode(buffer)
}

/// Decode standard base64 into raw bytes.
pub fn base64_to_buffer(encoded: &str) -> Result<Vec<u8>, BufferError> {
    STANDARD
        .decode(encoded)
        .map_err(|e| BufferError::InvalidBase64(e.to_string()))
}

/// Reverse the byte order of every 2-byte element in place.
///
/// Trailing bytes that do not form a whole element are left untouched.
pub fn swap16(bytes: &mut [u8]) {
    for element in bytes.chunks_exact_mut(2) {
        element.swap(0, 1);
    }
}

/// Reverse the byte order of every 4-byte element in place.
pub fn swap32(bytes: &mut [u8]) {
    for element in bytes.chunks_exact_mut(4) {
        element.reverse();
    }
}

/// Reverse the byte order of every 8-byte element in place.
pub fn swap64(bytes: &mut [u8]) {
    for element in bytes.chunks_exact_mut(8) {
        element.reverse();
    }
}

/// Swap elements of the given width; single-byte widths are a no-op.
pub fn swap_elements(bytes: &mut [u8], width: usize) {
    match width {
        2 => swap16(bytes),
        4 => swap32(bytes),
        8 => swap64(bytes),
        _ => {}
    }
}
