//! Spatial point retrieval.
//!
//! A [`Query`] walks the tree against a query box and depth range and
//! emits matching points in two phases: the resident base points
//! first, then chunked data fetched through the cache. The
//! [`Query::next`] contract makes it a restartable, lazy, finite point
//! sequence: each call appends zero or more packed points to the
//! caller's buffer and says whether more may follow.
//!
//! The chunked traversal prunes on the hierarchy's counts, so a
//! dataset queried without its hierarchy saved yields base points
//! only.

use tracing::debug;

use crate::cache::{Block, Cache, FetchInfo, FetchInfoSet};
use crate::chunk::PointRecord;
use crate::error::{CloudtreeError, Result};
use crate::reader::Reader;
use crate::schema::Schema;
use crate::state::{ChunkState, PointState};
use crate::types::{Bounds, Dir, Point3};

/// A running point query. See the module docs.
pub struct Query<'a> {
    reader: &'a Reader,
    cache: &'a Cache,

    qbox: Bounds,
    depth_begin: u64,
    depth_end: u64,

    out_schema: Schema,
    scale: f64,
    offset: Point3,

    fetches: FetchInfoSet,
    block: Option<Block<'a>>,
    chunk_index: usize,

    num_points: u64,
    base_done: bool,
    done: bool,
}

impl<'a> Query<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        reader: &'a Reader,
        out_schema: Schema,
        cache: &'a Cache,
        qbox: Bounds,
        depth_begin: u64,
        depth_end: u64,
        scale: f64,
        offset: Point3,
    ) -> Query<'a> {
        Query {
            reader,
            cache,
            qbox,
            depth_begin,
            depth_end: depth_end.min(reader.structure().max_chunk_depth()),
            out_schema,
            scale,
            offset,
            fetches: FetchInfoSet::new(),
            block: None,
            chunk_index: 0,
            num_points: 0,
            base_done: false,
            done: false,
        }
    }

    /// Append zero or more packed points to `buffer`. Returns `true`
    /// while more points may still be produced; `false` once the query
    /// is drained. The caller may consume or resize the buffer between
    /// calls.
    pub fn next(&mut self, buffer: &mut Vec<u8>) -> Result<bool> {
        if self.done {
            return Ok(false);
        }

        if self.depth_begin >= self.depth_end {
            self.done = true;
            return Err(CloudtreeError::InvalidConfig(format!(
                "query depth range [{}, {}) is empty",
                self.depth_begin, self.depth_end
            )));
        }

        if !self.base_done {
            self.base_done = true;
            self.get_base(buffer)?;
            return Ok(true);
        }

        if self.block.is_none() {
            if self.fetches.is_empty() {
                self.done = true;
                return Ok(false);
            }
            self.block = Some(self.cache.acquire(self.reader, &self.fetches)?);
            self.chunk_index = 0;
        }

        self.get_chunked(buffer)
    }

    /// Stop the query; subsequent `next` calls return `false` and the
    /// cache lease is released.
    pub fn cancel(&mut self) {
        self.done = true;
        self.block = None;
    }

    pub fn done(&self) -> bool {
        self.done
    }

    /// Points emitted so far.
    pub fn num_points(&self) -> u64 {
        self.num_points
    }

    // Base phase: scan resident points, then plan the chunk fetches.
    fn get_base(&mut self, buffer: &mut Vec<u8>) -> Result<()> {
        let reader = self.reader;
        for record in reader.base() {
            self.process_point(buffer, record);
        }

        let chunks = ChunkState::new(reader.structure(), *reader.bounds());
        let cells = PointState::new(reader.structure(), *reader.bounds());
        self.get_fetches(&chunks, &cells)?;
        debug!(
            base_points = reader.base().len(),
            chunks = self.fetches.len(),
            "base phase complete"
        );
        Ok(())
    }

    // One chunk per call.
    fn get_chunked(&mut self, buffer: &mut Vec<u8>) -> Result<bool> {
        let (chunk, last) = match &self.block {
            Some(block) => {
                let chunks = block.chunks();
                (
                    chunks.get(self.chunk_index).cloned(),
                    self.chunk_index + 1 >= chunks.len(),
                )
            }
            None => (None, true),
        };

        match chunk {
            Some(chunk) => {
                for record in chunk.points() {
                    self.process_point(buffer, record);
                }
                self.chunk_index += 1;
                if last {
                    self.block = None;
                    self.done = true;
                }
                Ok(!self.done)
            }
            None => {
                self.block = None;
                self.done = true;
                Ok(false)
            }
        }
    }

    // Collect the chunks to load. Chunk and cell cursors advance in
    // lockstep; a region whose cell count is zero has no points at
    // this depth or deeper, so the whole branch is skipped.
    fn get_fetches(&mut self, chunks: &ChunkState<'_>, cells: &PointState<'_>) -> Result<()> {
        if !self.qbox.overlaps(chunks.bounds()) || chunks.depth() >= self.depth_end {
            return Ok(());
        }

        if self.reader.hierarchy().total(cells)? == 0 {
            return Ok(());
        }

        if chunks.depth() >= self.depth_begin {
            self.fetches.insert(FetchInfo {
                id: chunks.chunk_id(),
                depth: chunks.depth(),
                bounds: *chunks.bounds(),
            });
        }

        if chunks.all_directions() {
            for dir in Dir::iter(self.reader.structure().factor()) {
                self.get_fetches(&chunks.climb(dir)?, &cells.climb(dir)?)?;
            }
        } else {
            // Sparse regime: the chunk keeps its region, so the cell
            // cursor cannot refine further.
            self.get_fetches(&chunks.climb_sparse()?, cells)?;
        }
        Ok(())
    }

    // Box and depth predicates, then the scale/offset transform and
    // schema packing.
    fn process_point(&mut self, buffer: &mut Vec<u8>, record: &PointRecord) -> bool {
        if record.depth < self.depth_begin || record.depth >= self.depth_end {
            return false;
        }
        if !self.qbox.contains(&record.point) {
            return false;
        }

        for dim in self.out_schema.dims() {
            let value = match dim.name.as_str() {
                "X" => (record.point.x - self.offset.x) * self.scale,
                "Y" => (record.point.y - self.offset.y) * self.scale,
                "Z" => (record.point.z - self.offset.z) * self.scale,
                name => self.reader.schema().value(&record.data, name).unwrap_or(0.0),
            };
            dim.kind.write(buffer, value);
        }

        self.num_points += 1;
        true
    }
}
