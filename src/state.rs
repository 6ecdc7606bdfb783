//! Tree cursors.
//!
//! The tree is only ever walked through these two cursors: a
//! [`PointState`] addresses a cell within a hierarchy block, a
//! [`ChunkState`] addresses the chunk on storage that covers the same
//! region. Neither blocks nor queries compute child ids by hand.

use std::collections::VecDeque;

use crate::error::{CloudtreeError, Result};
use crate::id::Id;
use crate::structure::Structure;
use crate::types::{Bounds, Dir, Point3};

/// A cursor over tree cells: node id, depth, bounding region, and (in
/// tubular mode) the z-slice tick.
///
/// Directions taken at or past the base zone accumulate in a deferred
/// queue, oldest first; they are the within-block path that cold-block
/// addressing normalizes against, and they reset when a consumer
/// anchors the cursor to a block via [`PointState::drain_deferred`].
#[derive(Debug, Clone)]
pub struct PointState<'a> {
    structure: &'a Structure,
    id: Id,
    depth: u64,
    bounds: Bounds,
    tick: u64,
    deferred: VecDeque<Dir>,
}

impl<'a> PointState<'a> {
    pub fn new(structure: &'a Structure, bounds: Bounds) -> PointState<'a> {
        PointState {
            structure,
            id: Id::ROOT,
            depth: 0,
            bounds,
            tick: 0,
            deferred: VecDeque::new(),
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn depth(&self) -> u64 {
        self.depth
    }

    pub fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn structure(&self) -> &Structure {
        self.structure
    }

    /// Directions taken at or past the base zone, oldest first.
    pub fn deferred(&self) -> &VecDeque<Dir> {
        &self.deferred
    }

    /// Take the deferred directions, leaving the queue empty.
    pub fn drain_deferred(&mut self) -> VecDeque<Dir> {
        std::mem::take(&mut self.deferred)
    }

    /// Advance one level in the given direction.
    pub fn climb(&self, dir: Dir) -> Result<PointState<'a>> {
        let tubular = self.structure.tubular();
        let mut next = self.clone();

        next.depth += 1;
        next.bounds = self.bounds.go(dir, tubular);
        if tubular {
            next.tick = (self.tick << 1) | dir.up() as u64;
        }
        next.id = self.id.child(self.structure.dimensions(), self.slot(dir))?;

        if next.depth >= self.structure.base_depth() {
            next.deferred.push_back(dir);
        }

        Ok(next)
    }

    /// Advance one level toward `point`, choosing the direction from the
    /// cell midpoint.
    pub fn descend(&self, point: &Point3) -> Result<PointState<'a>> {
        let mut mid = self.bounds.mid();
        if self.structure.tubular() {
            mid.z = self.tick_mid();
        }
        self.climb(Dir::from_point(point, &mid))
    }

    // Center of the current z slice; the bounds keep the full z range
    // in tubular mode, so the slice is derived from the tick.
    fn tick_mid(&self) -> f64 {
        let height = (self.bounds.max.z - self.bounds.min.z) / (1u64 << self.depth) as f64;
        self.bounds.min.z + (self.tick as f64 + 0.5) * height
    }

    fn slot(&self, dir: Dir) -> u64 {
        if self.structure.dimensions() == 2 {
            dir.horizontal()
        } else {
            dir.index()
        }
    }
}

/// A cursor over chunks: which stored chunk covers the current region
/// at the current depth.
///
/// Two regimes: while [`ChunkState::all_directions`] holds, every
/// descent names a direction and spawns a distinct child chunk; past
/// the sparse threshold the directions collapse and the chunk grows by
/// the fan-out instead.
#[derive(Debug, Clone)]
pub struct ChunkState<'a> {
    structure: &'a Structure,
    bounds: Bounds,
    depth: u64,
    chunk_id: Id,
    points_per_chunk: u128,
}

impl<'a> ChunkState<'a> {
    pub fn new(structure: &'a Structure, bounds: Bounds) -> ChunkState<'a> {
        ChunkState {
            structure,
            bounds,
            depth: structure.nominal_chunk_depth(),
            chunk_id: structure.nominal_chunk_index(),
            points_per_chunk: structure.points_per_chunk() as u128,
        }
    }

    pub fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    pub fn depth(&self) -> u64 {
        self.depth
    }

    pub fn chunk_id(&self) -> Id {
        self.chunk_id
    }

    pub fn points_per_chunk(&self) -> Id {
        Id::new(self.points_per_chunk)
    }

    /// True while descent still names a direction per child.
    pub fn all_directions(&self) -> bool {
        let sparse = self.structure.sparse_depth_begin();
        sparse == 0 || self.depth + 1 <= sparse
    }

    /// Dense descent. Calling this past the sparse boundary is a
    /// programming error.
    pub fn climb(&self, dir: Dir) -> Result<ChunkState<'a>> {
        if !self.all_directions() {
            return Err(CloudtreeError::InvariantViolated(
                "directional chunk climb past the sparse boundary",
            ));
        }

        let slot = if self.structure.dimensions() == 2 {
            dir.horizontal()
        } else {
            dir.index()
        };

        let mut next = self.clone();
        next.depth += 1;
        next.bounds = self.bounds.go(dir, self.structure.tubular());
        next.chunk_id = self
            .chunk_id
            .child(self.structure.dimensions(), 0)?
            .value()
            .checked_add(
                (slot as u128)
                    .checked_mul(self.points_per_chunk)
                    .ok_or(CloudtreeError::InvariantViolated("chunk id overflow"))?,
            )
            .map(Id::new)
            .ok_or(CloudtreeError::InvariantViolated("chunk id overflow"))?;

        Ok(next)
    }

    /// Sparse descent: the chunk keeps its region and grows by the
    /// fan-out.
    pub fn climb_sparse(&self) -> Result<ChunkState<'a>> {
        let mut next = self.clone();
        next.depth += 1;
        next.chunk_id = self.chunk_id.child(self.structure.dimensions(), 0)?;
        next.points_per_chunk = self
            .points_per_chunk
            .checked_mul(self.structure.factor() as u128)
            .ok_or(CloudtreeError::InvariantViolated("chunk size overflow"))?;
        Ok(next)
    }
}
