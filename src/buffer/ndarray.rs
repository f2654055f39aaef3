//! Typed numeric buffers and their `__ndarray__` wire representation.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{base64_to_buffer, buffer_to_base64, host_byte_order, swap_elements, BufferError, ByteOrder};

/// Closed set of element types a buffer may carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DType {
    Bool,
    Uint8,
    Int8,
    Uint16,
    Int16,
    Uint32,
    Int32,
    Uint64,
    Int64,
    Float32,
    Float64,
}

impl DType {
    pub const ALL: [DType; 11] = [
        DType::Bool,
        DType::Uint8,
        DType::Int8,
        DType::Uint16,
        DType::Int16,
        DType::Uint32,
        DType::Int32,
        DType::Uint64,
        DType::Int64,
        DType::Float32,
        DType::Float64,
    ];

    /// Wire tag for this element type.
    pub fn name(&self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::Uint8 => "uint8",
            DType::Int8 => "int8",
            DType::Uint16 => "uint16",
            DType::Int16 => "int16",
            DType::Uint32 => "uint32",
            DType::Int32 => "int32",
            DType::Uint64 => "uint64",
            DType::Int64 => "int64",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
        }
    }

    pub fn parse(name: &str) -> Result<Self, BufferError> {
        DType::ALL
            .iter()
            .copied()
            .find(|dtype| dtype.name() == name)
            .ok_or_else(|| BufferError::UnknownDType(name.to_string()))
    }

    /// Width of one element in bytes.
    pub fn item_size(&self) -> usize {
        match self {
            DType::Bool | DType::Uint8 | DType::Int8 => 1,
            DType::Uint16 | DType::Int16 => 2,
            DType::Uint32 | DType::Int32 | DType::Float32 => 4,
            DType::Uint64 | DType::Int64 | DType::Float64 => 8,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single element read out of a buffer, widened to the nearest
/// 64-bit representation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
}

impl Scalar {
    fn as_f64(self) -> f64 {
        match self {
            Scalar::Bool(b) => u8::from(b) as f64,
            Scalar::Int(i) => i as f64,
            Scalar::UInt(u) => u as f64,
            Scalar::Float(f) => f,
        }
    }

    fn as_i64(self, dtype: DType) -> Result<i64, BufferError> {
        match self {
            Scalar::Bool(b) => Ok(i64::from(b)),
            Scalar::Int(i) => Ok(i),
            Scalar::UInt(u) => i64::try_from(u).map_err(|_| self.out_of_range(dtype)),
            Scalar::Float(f) if f.is_finite() && f >= i64::MIN as f64 && f < i64::MAX as f64 => {
                Ok(f as i64)
            }
            Scalar::Float(_) => Err(self.out_of_range(dtype)),
        }
    }

    fn as_u64(self, dtype: DType) -> Result<u64, BufferError> {
        match self {
            Scalar::Bool(b) => Ok(u64::from(b)),
            Scalar::Int(i) => u64::try_from(i).map_err(|_| self.out_of_range(dtype)),
            Scalar::UInt(u) => Ok(u),
            Scalar::Float(f) if f.is_finite() && f > -1.0 && f < u64::MAX as f64 => Ok(f as u64),
            Scalar::Float(_) => Err(self.out_of_range(dtype)),
        }
    }

    fn out_of_range(self, dtype: DType) -> BufferError {
        BufferError::OutOfRange { value: self, dtype }
    }

    fn as_bool(self) -> bool {
        match self {
            Scalar::Bool(b) => b,
            Scalar::Int(i) => i != 0,
            Scalar::UInt(u) => u != 0,
            Scalar::Float(f) => f != 0.0,
        }
    }
}

/// A primitive type that can be stored in an [`NdArray`].
pub trait Element: Copy {
    const DTYPE: DType;

    fn write_ne(self, out: &mut Vec<u8>);

    /// Read one element from exactly `DTYPE.item_size()` bytes.
    fn read_ne(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($ty:ty, $dtype:ident) => {
        impl Element for $ty {
            const DTYPE: DType = DType::$dtype;

            fn write_ne(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_ne_bytes());
            }

            fn read_ne(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                <$ty>::from_ne_bytes(raw)
            }
        }
    };
}

impl_element!(u8, Uint8);
impl_element!(i8, Int8);
impl_element!(u16, Uint16);
impl_element!(i16, Int16);
impl_element!(u32, Uint32);
impl_element!(i32, Int32);
impl_element!(u64, Uint64);
impl_element!(i64, Int64);
impl_element!(f32, Float32);
impl_element!(f64, Float64);

impl Element for bool {
    const DTYPE: DType = DType::Bool;

    fn write_ne(self, out: &mut Vec<u8>) {
        out.push(u8::from(self));
    }

    fn read_ne(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

/// A typed, shaped numeric buffer. Bytes are always held in host order.
#[derive(Clone, Debug, PartialEq)]
pub struct NdArray {
    dtype: DType,
    shape: Vec<usize>,
    data: Vec<u8>,
}

/// The `{"__ndarray__", shape, dtype, order}` wire form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NdArrayRep {
    #[serde(rename = "__ndarray__")]
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Vec<usize>>,
    pub dtype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<String>,
}

impl NdArray {
    /// Build a one-dimensional buffer from typed values.
    pub fn from_slice<T: Element>(values: &[T]) -> Self {
        let mut data = Vec::with_capacity(values.len() * T::DTYPE.item_size());
        for &value in values {
            value.write_ne(&mut data);
        }
        Self {
            dtype: T::DTYPE,
            shape: vec![values.len()],
            data,
        }
    }

    /// Build a buffer from raw bytes in the given byte order.
    ///
    /// A missing shape means a flat buffer of all elements.
    pub fn from_bytes(
        dtype: DType,
        mut data: Vec<u8>,
        shape: Option<Vec<usize>>,
        order: ByteOrder,
    ) -> Result<Self, BufferError> {
        let size = dtype.item_size();
        if data.len() % size != 0 {
            return Err(BufferError::Misaligned {
                len: data.len(),
                dtype,
            });
        }
        let count = data.len() / size;
        let shape = shape.unwrap_or_else(|| vec![count]);
        let expected: usize = shape.iter().product();
        if expected != count {
            return Err(BufferError::ShapeMismatch {
                shape,
                expected,
                actual: count,
            });
        }
        if order != host_byte_order() {
            swap_elements(&mut data, size);
        }
        Ok(Self { dtype, shape, data })
    }

    /// Build a one-dimensional buffer, casting each scalar to `dtype`.
    pub fn from_scalars(dtype: DType, values: &[Scalar]) -> Result<Self, BufferError> {
        let mut data = Vec::with_capacity(values.len() * dtype.item_size());
        for value in values {
            write_scalar(dtype, *value, &mut data)?;
        }
        Ok(Self {
            dtype,
            shape: vec![values.len()],
            data,
        })
    }

    pub fn reshape(mut self, shape: Vec<usize>) -> Result<Self, BufferError> {
        let expected: usize = shape.iter().product();
        if expected != self.len() {
            return Err(BufferError::ShapeMismatch {
                shape,
                expected,
                actual: self.len(),
            });
        }
        self.shape = shape;
        Ok(self)
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.data.len() / self.dtype.item_size()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of rows along the first axis.
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(1)
    }

    /// Raw bytes in host order.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Copy out typed values; the element type must match exactly.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>, BufferError> {
        if T::DTYPE != self.dtype {
            return Err(BufferError::TypeMismatch {
                expected: T::DTYPE,
                found: self.dtype,
            });
        }
        Ok(self
            .data
            .chunks_exact(self.dtype.item_size())
            .map(T::read_ne)
            .collect())
    }

    pub fn scalars(&self) -> Vec<Scalar> {
        self.data
            .chunks_exact(self.dtype.item_size())
            .map(|bytes| read_scalar(self.dtype, bytes))
            .collect()
    }

    pub fn get(&self, index: usize) -> Option<Scalar> {
        let size = self.dtype.item_size();
        self.data
            .get(index * size..(index + 1) * size)
            .map(|bytes| read_scalar(self.dtype, bytes))
    }

    /// Overwrite one element, casting to this buffer's element type.
    pub fn set(&mut self, index: usize, value: Scalar) -> Result<(), BufferError> {
        let len = self.len();
        if index >= len {
            return Err(BufferError::OutOfBounds { index, len });
        }
        let size = self.dtype.item_size();
        let mut encoded = Vec::with_capacity(size);
        write_scalar(self.dtype, value, &mut encoded)?;
        self.data[index * size..(index + 1) * size].copy_from_slice(&encoded);
        Ok(())
    }

    /// Append one element to a flat buffer.
    pub fn push(&mut self, value: Scalar) -> Result<(), BufferError> {
        write_scalar(self.dtype, value, &mut self.data)?;
        self.shape = vec![self.len()];
        Ok(())
    }

    /// Append the rows of `other`; element types and row shapes must match.
    pub fn append_rows(&mut self, other: &NdArray) -> Result<(), BufferError> {
        if other.dtype != self.dtype {
            return Err(BufferError::TypeMismatch {
                expected: self.dtype,
                found: other.dtype,
            });
        }
        let row_shape = self.shape.get(1..).unwrap_or_default();
        let other_row_shape = other.shape.get(1..).unwrap_or_default();
        if row_shape != other_row_shape {
            return Err(BufferError::ShapeMismatch {
                shape: other.shape.clone(),
                expected: row_shape.iter().product(),
                actual: other_row_shape.iter().product(),
            });
        }
        self.data.extend_from_slice(&other.data);
        let rows = self.rows() + other.rows();
        if let Some(first) = self.shape.first_mut() {
            *first = rows;
        } else {
            self.shape = vec![rows];
        }
        Ok(())
    }

    /// Drop `count` rows from the front of the first axis.
    pub fn drop_rows(&mut self, count: usize) {
        let count = count.min(self.rows());
        let row_bytes = self.row_len() * self.dtype.item_size();
        self.data.drain(..count * row_bytes);
        if let Some(first) = self.shape.first_mut() {
            *first -= count;
        }
    }

    /// Split along the first axis into one buffer per row.
    pub fn split_rows(&self) -> Vec<NdArray> {
        let row_shape: Vec<usize> = self.shape.get(1..).unwrap_or_default().to_vec();
        let row_bytes = self.row_len() * self.dtype.item_size();
        if row_bytes == 0 {
            return Vec::new();
        }
        self.data
            .chunks_exact(row_bytes)
            .map(|bytes| NdArray {
                dtype: self.dtype,
                shape: row_shape.clone(),
                data: bytes.to_vec(),
            })
            .collect()
    }

    fn row_len(&self) -> usize {
        self.shape.get(1..).unwrap_or_default().iter().product()
    }

    /// Base64 of the bytes laid out in `order`.
    pub fn to_base64(&self, order: ByteOrder) -> String {
        if order == host_byte_order() {
            return buffer_to_base64(&self.data);
        }
        let mut swapped = self.data.clone();
        swap_elements(&mut swapped, self.dtype.item_size());
        buffer_to_base64(&swapped)
    }

    pub fn to_rep(&self) -> NdArrayRep {
        let order = host_byte_order();
        NdArrayRep {
            data: self.to_base64(order),
            shape: Some(self.shape.clone()),
            dtype: self.dtype.name().to_string(),
            order: Some(order.as_str().to_string()),
        }
    }

    /// Decode the wire form. A missing `order` means little-endian.
    pub fn from_rep(rep: &NdArrayRep) -> Result<Self, BufferError> {
        let dtype = DType::parse(&rep.dtype)?;
        let order = match &rep.order {
            Some(order) => ByteOrder::parse(order)?,
            None => ByteOrder::Little,
        };
        let data = base64_to_buffer(&rep.data)?;
        Self::from_bytes(dtype, data, rep.shape.clone(), order)
    }
}

fn read_scalar(dtype: DType, bytes: &[u8]) -> Scalar {
    match dtype {
        DType::Bool => Scalar::Bool(bool::read_ne(bytes)),
        DType::Uint8 => Scalar::UInt(u8::read_ne(bytes) as u64),
        DType::Int8 => Scalar::Int(i8::read_ne(bytes) as i64),
        DType::Uint16 => Scalar::UInt(u16::read_ne(bytes) as u64),
        DType::Int16 => Scalar::Int(i16::read_ne(bytes) as i64),
        DType::Uint32 => Scalar::UInt(u32::read_ne(bytes) as u64),
        DType::Int32 => Scalar::Int(i32::read_ne(bytes) as i64),
        DType::Uint64 => Scalar::UInt(u64::read_ne(bytes)),
        DType::Int64 => Scalar::Int(i64::read_ne(bytes)),
        DType::Float32 => Scalar::Float(f32::read_ne(bytes) as f64),
        DType::Float64 => Scalar::Float(f64::read_ne(bytes)),
    }
}

/// Cast `value` to `dtype` and append its bytes. Integers that do not fit
/// the element type are rejected and nothing is written.
fn write_scalar(dtype: DType, value: Scalar, out: &mut Vec<u8>) -> Result<(), BufferError> {
    fn narrow<T: TryFrom<W>, W>(wide: W, value: Scalar, dtype: DType) -> Result<T, BufferError> {
        T::try_from(wide).map_err(|_| value.out_of_range(dtype))
    }

    match dtype {
        DType::Bool => value.as_bool().write_ne(out),
        DType::Uint8 => narrow::<u8, _>(value.as_u64(dtype)?, value, dtype)?.write_ne(out),
        DType::Int8 => narrow::<i8, _>(value.as_i64(dtype)?, value, dtype)?.write_ne(out),
        DType::Uint16 => narrow::<u16, _>(value.as_u64(dtype)?, value, dtype)?.write_ne(out),
        DType::Int16 => narrow::<i16, _>(value.as_i64(dtype)?, value, dtype)?.write_ne(out),
        DType::Uint32 => narrow::<u32, _>(value.as_u64(dtype)?, value, dtype)?.write_ne(out),
        DType::Int32 => narrow::<i32, _>(value.as_i64(dtype)?, value, dtype)?.write_ne(out),
        DType::Uint64 => value.as_u64(dtype)?.write_ne(out),
        DType::Int64 => value.as_i64(dtype)?.write_ne(out),
        DType::Float32 => (value.as_f64() as f32).write_ne(out),
        DType::Float64 => value.as_f64().write_ne(out),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float64_wire_form() {
        let array = NdArray::from_slice(&[1.0f64, 2.0, 3.0, 4.0]);
        let rep = array.to_rep();
        assert_eq!(rep.dtype, "float64");
        assert_eq!(rep.shape, Some(vec![4]));
        assert_eq!(base64_to_buffer(&rep.data).unwrap().len(), 32);

        let decoded = NdArray::from_rep(&rep).unwrap();
        assert_eq!(decoded, array);
        assert_eq!(decoded.to_vec::<f64>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_every_dtype_round_trips() {
        let values = [Scalar::Int(0), Scalar::Int(1), Scalar::Int(7)];
        for dtype in DType::ALL {
            let array = NdArray::from_scalars(dtype, &values).unwrap();
            assert_eq!(array.as_bytes().len(), 3 * dtype.item_size());
            let decoded = NdArray::from_rep(&array.to_rep()).unwrap();
            assert_eq!(decoded, array, "dtype {dtype}");
            assert_eq!(DType::parse(dtype.name()).unwrap(), dtype);
        }
    }

    #[test]
    fn test_unknown_dtype_rejected() {
        let rep = NdArrayRep {
            data: buffer_to_base64(&[0; 8]),
            shape: None,
            dtype: "complex128".to_string(),
            order: None,
        };
        assert_eq!(
            NdArray::from_rep(&rep),
            Err(BufferError::UnknownDType("complex128".to_string()))
        );
    }

    #[test]
    fn test_foreign_byte_order_is_swapped() {
        let values = [0x0102_0304i32, -2];
        let mut big = Vec::new();
        for value in values {
            big.extend_from_slice(&value.to_be_bytes());
        }
        let array = NdArray::from_bytes(DType::Int32, big.clone(), None, ByteOrder::Big).unwrap();
        assert_eq!(array.to_vec::<i32>().unwrap(), values.to_vec());
        assert_eq!(
            base64_to_buffer(&array.to_base64(ByteOrder::Big)).unwrap(),
            big
        );
    }

    #[test]
    fn test_irregular_buffers_rejected() {
        let misaligned = NdArray::from_bytes(DType::Float32, vec![0; 6], None, ByteOrder::Little);
        assert!(matches!(misaligned, Err(BufferError::Misaligned { .. })));

        let bad_shape = NdArray::from_bytes(
            DType::Uint8,
            vec![0; 6],
            Some(vec![4, 2]),
            ByteOrder::Little,
        );
        assert!(matches!(bad_shape, Err(BufferError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_row_operations() {
        let mut grid = NdArray::from_slice(&[1u16, 2, 3, 4, 5, 6])
            .reshape(vec![3, 2])
            .unwrap();
        let more = NdArray::from_slice(&[7u16, 8]).reshape(vec![1, 2]).unwrap();
        grid.append_rows(&more).unwrap();
        assert_eq!(grid.shape(), &[4, 2]);

        grid.drop_rows(2);
        assert_eq!(grid.shape(), &[2, 2]);
        assert_eq!(grid.to_vec::<u16>().unwrap(), vec![5, 6, 7, 8]);

        let rows = grid.split_rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].to_vec::<u16>().unwrap(), vec![7, 8]);

        let wrong = NdArray::from_slice(&[1i16, 2]);
        assert!(grid.append_rows(&wrong).is_err());
    }

    #[test]
    fn test_set_and_push_cast_values() {
        let mut array = NdArray::from_slice(&[1.5f32, 2.5]);
        array.set(0, Scalar::Int(9)).unwrap();
        array.push(Scalar::Float(3.25)).unwrap();
        assert_eq!(array.to_vec::<f32>().unwrap(), vec![9.0, 2.5, 3.25]);
        assert_eq!(array.shape(), &[3]);
        assert_eq!(array.get(2), Some(Scalar::Float(3.25)));
        assert!(array.set(3, Scalar::Int(0)).is_err());
    }

    #[test]
    fn test_out_of_range_values_are_rejected() {
        let mut unsigned = NdArray::from_slice(&[1u64, 2]);
        assert_eq!(
            unsigned.set(0, Scalar::Int(-1)),
            Err(BufferError::OutOfRange {
                value: Scalar::Int(-1),
                dtype: DType::Uint64
            })
        );
        assert_eq!(unsigned.to_vec::<u64>().unwrap(), vec![1, 2]);

        let mut signed = NdArray::from_slice(&[1i64]);
        assert!(matches!(
            signed.push(Scalar::UInt(u64::MAX)),
            Err(BufferError::OutOfRange { .. })
        ));
        assert_eq!(signed.len(), 1);
        assert_eq!(signed.shape(), &[1]);

        let mut bytes = NdArray::from_slice(&[0u8]);
        assert!(bytes.push(Scalar::Int(256)).is_err());
        assert!(bytes.push(Scalar::Float(f64::NAN)).is_err());
        bytes.push(Scalar::Int(255)).unwrap();
        assert_eq!(bytes.to_vec::<u8>().unwrap(), vec![0, 255]);

        assert!(NdArray::from_scalars(DType::Int8, &[Scalar::Int(1), Scalar::Int(-129)]).is_err());
    }
}
