//! Attribute layout for point records.
//!
//! A [`Schema`] names the dimensions stored per point and fixes their
//! packed byte layout. Queries use one schema for the stored records
//! and another for the caller's requested output.

use bytes::BufMut;
use serde::{Deserialize, Serialize};

/// Scalar storage type of one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DimKind {
    F64,
    F32,
    I64,
    I32,
    U64,
    U32,
    U16,
    U8,
}

impl DimKind {
    pub fn size(self) -> usize {
        match self {
            DimKind::F64 | DimKind::I64 | DimKind::U64 => 8,
            DimKind::F32 | DimKind::I32 | DimKind::U32 => 4,
            DimKind::U16 => 2,
            DimKind::U8 => 1,
        }
    }

    /// Append `value` to `buf` in this kind's packed form.
    pub fn write(self, buf: &mut Vec<u8>, value: f64) {
        match self {
            DimKind::F64 => buf.put_f64_le(value),
            DimKind::F32 => buf.put_f32_le(value as f32),
            DimKind::I64 => buf.put_i64_le(value as i64),
            DimKind::I32 => buf.put_i32_le(value as i32),
            DimKind::U64 => buf.put_u64_le(value as u64),
            DimKind::U32 => buf.put_u32_le(value as u32),
            DimKind::U16 => buf.put_u16_le(value as u16),
            DimKind::U8 => buf.put_u8(value as u8),
        }
    }

    /// Read a packed value back as f64. `bytes` must hold at least
    /// [`DimKind::size`] bytes.
    pub fn read(self, bytes: &[u8]) -> f64 {
        match self {
            DimKind::F64 => f64::from_le_bytes(bytes[..8].try_into().unwrap()),
            DimKind::F32 => f32::from_le_bytes(bytes[..4].try_into().unwrap()) as f64,
            DimKind::I64 => i64::from_le_bytes(bytes[..8].try_into().unwrap()) as f64,
            DimKind::I32 => i32::from_le_bytes(bytes[..4].try_into().unwrap()) as f64,
            DimKind::U64 => u64::from_le_bytes(bytes[..8].try_into().unwrap()) as f64,
            DimKind::U32 => u32::from_le_bytes(bytes[..4].try_into().unwrap()) as f64,
            DimKind::U16 => u16::from_le_bytes(bytes[..2].try_into().unwrap()) as f64,
            DimKind::U8 => bytes[0] as f64,
        }
    }
}

/// One named dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dim {
    pub name: String,
    pub kind: DimKind,
}

impl Dim {
    pub fn new(name: &str, kind: DimKind) -> Dim {
        Dim {
            name: name.to_string(),
            kind,
        }
    }

    pub fn is_spatial(&self) -> bool {
        matches!(self.name.as_str(), "X" | "Y" | "Z")
    }
}

/// An ordered set of dimensions with a fixed packed layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    dims: Vec<Dim>,
}

impl Schema {
    pub fn new(dims: Vec<Dim>) -> Schema {
        Schema { dims }
    }

    /// X, Y, Z as f64: the minimal spatial layout.
    pub fn xyz() -> Schema {
        Schema::new(vec![
            Dim::new("X", DimKind::F64),
            Dim::new("Y", DimKind::F64),
            Dim::new("Z", DimKind::F64),
        ])
    }

    pub fn dims(&self) -> &[Dim] {
        &self.dims
    }

    /// Packed bytes per point.
    pub fn point_size(&self) -> usize {
        self.dims.iter().map(|dim| dim.kind.size()).sum()
    }

    /// Byte offset of the named dimension within a packed record.
    pub fn offset_of(&self, name: &str) -> Option<(usize, DimKind)> {
        let mut offset = 0;
        for dim in &self.dims {
            if dim.name == name {
                return Some((offset, dim.kind));
            }
            offset += dim.kind.size();
        }
        None
    }

    /// Read the named dimension out of a packed record.
    pub fn value(&self, record: &[u8], name: &str) -> Option<f64> {
        self.offset_of(name)
            .map(|(offset, kind)| kind.read(&record[offset..]))
    }
}
