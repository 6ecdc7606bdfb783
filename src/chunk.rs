//! Chunk payloads and the codec seam.
//!
//! The binary chunk format is an external collaborator: the index only
//! needs bytes-in/points-out. [`RawCodec`] is the packed little-endian
//! reference codec used by the local backends and the tests.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CloudtreeError, Result};
use crate::id::Id;
use crate::schema::Schema;
use crate::types::Point3;

/// One decoded point: its location, the depth it rests at, and its
/// full packed record in the stored schema.
#[derive(Debug, Clone, PartialEq)]
pub struct PointRecord {
    pub point: Point3,
    pub depth: u64,
    pub data: Bytes,
}

impl PointRecord {
    pub fn new(point: Point3, depth: u64, data: Bytes) -> PointRecord {
        PointRecord { point, depth, data }
    }
}

/// Opaque chunk codec: turns stored chunk bytes into point records and
/// back.
pub trait Codec: Send + Sync {
    fn decode(&self, schema: &Schema, data: &[u8]) -> Result<Vec<PointRecord>>;
    fn encode(&self, schema: &Schema, points: &[PointRecord]) -> Result<Bytes>;
}

/// Packed little-endian codec: per point, a u64 depth followed by the
/// record bytes laid out by the schema.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawCodec;

impl Codec for RawCodec {
    fn decode(&self, schema: &Schema, data: &[u8]) -> Result<Vec<PointRecord>> {
        let stride = 8 + schema.point_size();
        if data.len() % stride != 0 {
            return Err(CloudtreeError::MalformedBlock(format!(
                "chunk length {} is not a multiple of the point stride {stride}",
                data.len()
            )));
        }

        let mut buf = data;
        let mut points = Vec::with_capacity(data.len() / stride);
        while buf.has_remaining() {
            let depth = buf.get_u64_le();
            let record = Bytes::copy_from_slice(&buf[..schema.point_size()]);
            buf.advance(schema.point_size());

            let point = Point3::new(
                schema.value(&record, "X").unwrap_or(0.0),
                schema.value(&record, "Y").unwrap_or(0.0),
                schema.value(&record, "Z").unwrap_or(0.0),
            );
            points.push(PointRecord::new(point, depth, record));
        }
        Ok(points)
    }

    fn encode(&self, schema: &Schema, points: &[PointRecord]) -> Result<Bytes> {
        let stride = 8 + schema.point_size();
        let mut data = BytesMut::with_capacity(points.len() * stride);
        for record in points {
            if record.data.len() != schema.point_size() {
                return Err(CloudtreeError::MalformedBlock(format!(
                    "record length {} does not match the schema's {}",
                    record.data.len(),
                    schema.point_size()
                )));
            }
            data.put_u64_le(record.depth);
            data.extend_from_slice(&record.data);
        }
        Ok(data.freeze())
    }
}

/// Pack per-dimension values into a record laid out by `schema`.
/// Spatial values come from `point`; the rest are taken from `extra`
/// in schema order.
pub fn pack_record(schema: &Schema, point: &Point3, extra: &[f64]) -> Bytes {
    let mut record = Vec::with_capacity(schema.point_size());
    let mut next = extra.iter();
    for dim in schema.dims() {
        let value = match dim.name.as_str() {
            "X" => point.x,
            "Y" => point.y,
            "Z" => point.z,
            _ => next.next().copied().unwrap_or(0.0),
        };
        dim.kind.write(&mut record, value);
    }
    Bytes::from(record)
}

/// A decoded chunk held by the cache: the chunk's id, depth, and its
/// points.
#[derive(Debug)]
pub struct ChunkReader {
    id: Id,
    depth: u64,
    bytes: u64,
    points: Vec<PointRecord>,
}

impl ChunkReader {
    pub fn new(id: Id, depth: u64, bytes: u64, points: Vec<PointRecord>) -> ChunkReader {
        ChunkReader {
            id,
            depth,
            bytes,
            points,
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn depth(&self) -> u64 {
        self.depth
    }

    /// Stored size, used for cache accounting.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn points(&self) -> &[PointRecord] {
        &self.points
    }
}
