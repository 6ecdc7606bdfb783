//! Hierarchy blocks: per-cell point counts for a contiguous range of
//! tree node ids.
//!
//! Only [`HierarchyBlock::count`] must be thread-safe; `get`, `save`,
//! and the deserializing constructors run in single-threaded phases.
//!
//! Wire format, shared by both variants: a flat array of 24-byte
//! little-endian records `(tube, tick, cell)`, in any order, with
//! absent cells omitted. The `tube` field is the id normalized against
//! the block root; which variant a reader reconstructs is decided by
//! the block's depth relative to the sparse threshold, not by the
//! bytes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{CloudtreeError, Result};
use crate::id::Id;
use crate::storage::Endpoint;

const RECORD_LEN: usize = 24;

/// A single cell count. Increments are atomic so parallel ingest never
/// loses an update.
#[derive(Debug, Default)]
pub struct HierarchyCell {
    val: AtomicU64,
}

impl HierarchyCell {
    fn new(val: u64) -> HierarchyCell {
        HierarchyCell {
            val: AtomicU64::new(val),
        }
    }

    /// Adjust the count by `delta`. Two's-complement addition makes
    /// negative deltas exact as long as the running sum stays
    /// non-negative.
    pub fn count(&self, delta: i64) {
        self.val.fetch_add(delta as u64, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.val.load(Ordering::Relaxed)
    }
}

/// Tick-ordered cells for one node. The map itself needs a lock since
/// insertion is not lock-free; the cells inside are atomic.
#[derive(Debug, Default)]
pub struct HierarchyTube {
    cells: Mutex<BTreeMap<u64, HierarchyCell>>,
}

impl HierarchyTube {
    pub fn count(&self, tick: u64, delta: i64) {
        self.cells.lock().entry(tick).or_default().count(delta);
    }

    pub fn get(&self, tick: u64) -> u64 {
        self.cells.lock().get(&tick).map(HierarchyCell::get).unwrap_or(0)
    }

    fn set(&self, tick: u64, val: u64) {
        self.cells.lock().insert(tick, HierarchyCell::new(val));
    }

    /// Sum across all ticks: the population of the full z column.
    pub fn total(&self) -> u64 {
        self.cells.lock().values().map(HierarchyCell::get).sum()
    }

    // Non-empty cells, tick order.
    fn snapshot(&self) -> Vec<(u64, u64)> {
        self.cells
            .lock()
            .iter()
            .map(|(tick, cell)| (*tick, cell.get()))
            .filter(|(_, val)| *val != 0)
            .collect()
    }
}

fn decode_records(data: &[u8]) -> Result<Vec<(u64, u64, u64)>> {
    if data.len() % RECORD_LEN != 0 {
        return Err(CloudtreeError::MalformedBlock(format!(
            "length {} is not a multiple of {RECORD_LEN}",
            data.len()
        )));
    }

    let mut buf = data;
    let mut records = Vec::with_capacity(data.len() / RECORD_LEN);
    while buf.has_remaining() {
        let tube = buf.get_u64_le();
        let tick = buf.get_u64_le();
        let cell = buf.get_u64_le();
        records.push((tube, tick, cell));
    }
    Ok(records)
}

fn encode_records(cells: &[(u64, u64, u64)]) -> Bytes {
    let mut data = BytesMut::with_capacity(cells.len() * RECORD_LEN);
    for (tube, tick, cell) in cells {
        data.put_u64_le(*tube);
        data.put_u64_le(*tick);
        data.put_u64_le(*cell);
    }
    data.freeze()
}

/// Dense block: a pre-sized vector of tubes indexed by normalized id.
/// No outer lock; the vector's size is fixed at construction.
#[derive(Debug)]
pub struct ContiguousBlock {
    id: Id,
    tubes: Vec<HierarchyTube>,
}

impl ContiguousBlock {
    pub fn new(id: Id, max_points: u64) -> Result<ContiguousBlock> {
        let len = usize::try_from(max_points)
            .map_err(|_| CloudtreeError::InvalidConfig(format!(
                "contiguous block span {max_points} does not fit memory"
            )))?;

        let mut tubes = Vec::new();
        tubes.resize_with(len, HierarchyTube::default);
        Ok(ContiguousBlock { id, tubes })
    }

    pub fn from_bytes(id: Id, max_points: u64, data: &[u8]) -> Result<ContiguousBlock> {
        let block = ContiguousBlock::new(id, max_points)?;
        for (tube, tick, cell) in decode_records(data)? {
            let slot = block.tubes.get(tube as usize).ok_or_else(|| {
                CloudtreeError::MalformedBlock(format!(
                    "tube {tube} outside block span {max_points}"
                ))
            })?;
            slot.set(tick, cell);
        }
        Ok(block)
    }

    pub fn id(&self) -> Id {
        self.id
    }

    fn normalize(&self, id: Id) -> Result<usize> {
        if id < self.id {
            return Err(CloudtreeError::InvariantViolated(
                "id below the block root",
            ));
        }
        let norm = (id - self.id).simple()? as usize;
        if norm >= self.tubes.len() {
            return Err(CloudtreeError::InvariantViolated(
                "id beyond the block span",
            ));
        }
        Ok(norm)
    }

    /// Thread-safe count adjustment.
    pub fn count(&self, id: Id, tick: u64, delta: i64) -> Result<()> {
        self.tubes[self.normalize(id)?].count(tick, delta);
        Ok(())
    }

    pub fn get(&self, id: Id, tick: u64) -> Result<u64> {
        Ok(self.tubes[self.normalize(id)?].get(tick))
    }

    /// Sum across the node's ticks.
    pub fn total(&self, id: Id) -> Result<u64> {
        Ok(self.tubes[self.normalize(id)?].total())
    }

    pub fn save(&self, endpoint: &dyn Endpoint, postfix: &str) -> Result<()> {
        let cells = self.cells();
        let data = encode_records(&cells);
        debug!(block = %self.id, cells = cells.len(), "saving contiguous block");
        endpoint.put(&format!("{}{}", self.id, postfix), data)
    }

    /// Non-empty cells as `(normalized id, tick, count)`.
    pub fn cells(&self) -> Vec<(u64, u64, u64)> {
        let mut out = Vec::new();
        for (tube, slot) in self.tubes.iter().enumerate() {
            for (tick, val) in slot.snapshot() {
                out.push((tube as u64, tick, val));
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.tubes.iter().all(|tube| tube.snapshot().is_empty())
    }
}

/// Sparse block: a normalized-id map of tubes. The map is guarded by a
/// block-level lock, held for lookups and insertions; a tube's own
/// cells handle further concurrency.
#[derive(Debug)]
pub struct SparseBlock {
    id: Id,
    span: u128,
    tubes: Mutex<BTreeMap<u64, Arc<HierarchyTube>>>,
}

impl SparseBlock {
    pub fn new(id: Id, span: u128) -> SparseBlock {
        SparseBlock {
            id,
            span,
            tubes: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn from_bytes(id: Id, span: u128, data: &[u8]) -> Result<SparseBlock> {
        let block = SparseBlock::new(id, span);
        {
            let mut tubes = block.tubes.lock();
            for (tube, tick, cell) in decode_records(data)? {
                if (tube as u128) >= span {
                    return Err(CloudtreeError::MalformedBlock(format!(
                        "tube {tube} outside block span {span}"
                    )));
                }
                tubes
                    .entry(tube)
                    .or_insert_with(|| Arc::new(HierarchyTube::default()))
                    .set(tick, cell);
            }
        }
        Ok(block)
    }

    pub fn id(&self) -> Id {
        self.id
    }

    fn normalize(&self, id: Id) -> Result<u64> {
        if id < self.id {
            return Err(CloudtreeError::InvariantViolated(
                "id below the block root",
            ));
        }
        let norm = (id - self.id).value();
        if norm >= self.span {
            return Err(CloudtreeError::InvariantViolated(
                "id beyond the block span",
            ));
        }
        (Id::new(norm)).simple()
    }

    /// Thread-safe count adjustment. The block lock covers the tube
    /// lookup only; the increment happens on the tube's own cells.
    pub fn count(&self, id: Id, tick: u64, delta: i64) -> Result<()> {
        let norm = self.normalize(id)?;
        let tube = self
            .tubes
            .lock()
            .entry(norm)
            .or_insert_with(|| Arc::new(HierarchyTube::default()))
            .clone();
        tube.count(tick, delta);
        Ok(())
    }

    pub fn get(&self, id: Id, tick: u64) -> Result<u64> {
        let norm = self.normalize(id)?;
        let tube = self.tubes.lock().get(&norm).cloned();
        Ok(tube.map(|tube| tube.get(tick)).unwrap_or(0))
    }

    /// Sum across the node's ticks.
    pub fn total(&self, id: Id) -> Result<u64> {
        let norm = self.normalize(id)?;
        let tube = self.tubes.lock().get(&norm).cloned();
        Ok(tube.map(|tube| tube.total()).unwrap_or(0))
    }

    pub fn save(&self, endpoint: &dyn Endpoint, postfix: &str) -> Result<()> {
        let cells = self.cells();
        let data = encode_records(&cells);
        debug!(block = %self.id, cells = cells.len(), "saving sparse block");
        endpoint.put(&format!("{}{}", self.id, postfix), data)
    }

    pub fn cells(&self) -> Vec<(u64, u64, u64)> {
        let tubes: Vec<(u64, Arc<HierarchyTube>)> = self
            .tubes
            .lock()
            .iter()
            .map(|(norm, tube)| (*norm, tube.clone()))
            .collect();

        let mut out = Vec::new();
        for (norm, tube) in tubes {
            for (tick, val) in tube.snapshot() {
                out.push((norm, tick, val));
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.cells().is_empty()
    }
}

/// A hierarchy block, statically dispatched over its two storage
/// layouts. Contiguous blocks pay memory for indexed access and are
/// used below the sparse threshold; sparse blocks allocate nothing
/// upfront and cover the deep, thinly populated levels.
#[derive(Debug)]
pub enum HierarchyBlock {
    Contiguous(ContiguousBlock),
    Sparse(SparseBlock),
}

impl HierarchyBlock {
    pub fn new(id: Id, span: u128, sparse: bool) -> Result<HierarchyBlock> {
        if sparse {
            Ok(HierarchyBlock::Sparse(SparseBlock::new(id, span)))
        } else {
            let span = Id::new(span).simple()?;
            Ok(HierarchyBlock::Contiguous(ContiguousBlock::new(id, span)?))
        }
    }

    pub fn from_bytes(id: Id, span: u128, sparse: bool, data: &[u8]) -> Result<HierarchyBlock> {
        if sparse {
            Ok(HierarchyBlock::Sparse(SparseBlock::from_bytes(
                id, span, data,
            )?))
        } else {
            let span = Id::new(span).simple()?;
            Ok(HierarchyBlock::Contiguous(ContiguousBlock::from_bytes(
                id, span, data,
            )?))
        }
    }

    pub fn id(&self) -> Id {
        match self {
            HierarchyBlock::Contiguous(block) => block.id(),
            HierarchyBlock::Sparse(block) => block.id(),
        }
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, HierarchyBlock::Sparse(_))
    }

    pub fn count(&self, id: Id, tick: u64, delta: i64) -> Result<()> {
        match self {
            HierarchyBlock::Contiguous(block) => block.count(id, tick, delta),
            HierarchyBlock::Sparse(block) => block.count(id, tick, delta),
        }
    }

    pub fn get(&self, id: Id, tick: u64) -> Result<u64> {
        match self {
            HierarchyBlock::Contiguous(block) => block.get(id, tick),
            HierarchyBlock::Sparse(block) => block.get(id, tick),
        }
    }

    /// Sum across the node's ticks.
    pub fn total(&self, id: Id) -> Result<u64> {
        match self {
            HierarchyBlock::Contiguous(block) => block.total(id),
            HierarchyBlock::Sparse(block) => block.total(id),
        }
    }

    pub fn save(&self, endpoint: &dyn Endpoint, postfix: &str) -> Result<()> {
        match self {
            HierarchyBlock::Contiguous(block) => block.save(endpoint, postfix),
            HierarchyBlock::Sparse(block) => block.save(endpoint, postfix),
        }
    }

    /// Non-empty cells as `(normalized id, tick, count)`.
    pub fn cells(&self) -> Vec<(u64, u64, u64)> {
        match self {
            HierarchyBlock::Contiguous(block) => block.cells(),
            HierarchyBlock::Sparse(block) => block.cells(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            HierarchyBlock::Contiguous(block) => block.is_empty(),
            HierarchyBlock::Sparse(block) => block.is_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryEndpoint;

    #[test]
    fn counts_accumulate_and_absent_cells_read_zero() {
        let block = ContiguousBlock::new(Id::from(10), 8).unwrap();
        block.count(Id::from(13), 0, 5).unwrap();
        block.count(Id::from(13), 0, -2).unwrap();
        block.count(Id::from(13), 7, 1).unwrap();

        assert_eq!(block.get(Id::from(13), 0).unwrap(), 3);
        assert_eq!(block.get(Id::from(13), 7).unwrap(), 1);
        assert_eq!(block.get(Id::from(12), 0).unwrap(), 0);
    }

    #[test]
    fn normalization_is_range_checked() {
        let block = ContiguousBlock::new(Id::from(10), 8).unwrap();
        assert!(matches!(
            block.count(Id::from(9), 0, 1),
            Err(CloudtreeError::InvariantViolated(_))
        ));
        assert!(matches!(
            block.get(Id::from(18), 0),
            Err(CloudtreeError::InvariantViolated(_))
        ));
    }

    #[test]
    fn contiguous_round_trip() {
        let endpoint = MemoryEndpoint::new();
        let block = ContiguousBlock::new(Id::from(0), 16).unwrap();
        block.count(Id::from(3), 0, 100).unwrap();
        block.count(Id::from(3), 2, 7).unwrap();
        block.count(Id::from(15), 0, 1).unwrap();
        block.save(&endpoint, "").unwrap();

        let data = endpoint.get("0").unwrap();
        assert_eq!(data.len() % 24, 0);

        let restored = ContiguousBlock::from_bytes(Id::from(0), 16, &data).unwrap();
        assert_eq!(restored.cells(), block.cells());
    }

    #[test]
    fn sparse_round_trip_with_postfix() {
        let endpoint = MemoryEndpoint::new();
        let block = SparseBlock::new(Id::from(100), 64);
        block.count(Id::from(130), 4, 9).unwrap();
        block.count(Id::from(100), 0, 2).unwrap();
        block.save(&endpoint, "-3").unwrap();

        let data = endpoint.get("100-3").unwrap();
        let restored = SparseBlock::from_bytes(Id::from(100), 64, &data).unwrap();
        assert_eq!(restored.cells(), block.cells());
        assert_eq!(restored.get(Id::from(130), 4).unwrap(), 9);
    }

    #[test]
    fn malformed_bytes_are_rejected() {
        let err = ContiguousBlock::from_bytes(Id::from(0), 4, &[0u8; 23]);
        assert!(matches!(err, Err(CloudtreeError::MalformedBlock(_))));

        // A record whose tube lies outside the span.
        let mut data = Vec::new();
        for v in [9u64, 0, 1] {
            data.extend_from_slice(&v.to_le_bytes());
        }
        let err = ContiguousBlock::from_bytes(Id::from(0), 4, &data);
        assert!(matches!(err, Err(CloudtreeError::MalformedBlock(_))));

        let err = SparseBlock::from_bytes(Id::from(0), 4, &data);
        assert!(matches!(err, Err(CloudtreeError::MalformedBlock(_))));
    }

    #[test]
    fn parallel_counts_lose_nothing() {
        let block = HierarchyBlock::new(Id::from(0), 32, false).unwrap();
        let threads: u64 = 4;
        let per_thread: u64 = 50_000;

        std::thread::scope(|scope| {
            for _ in 0..threads {
                scope.spawn(|| {
                    for _ in 0..per_thread {
                        block.count(Id::from(17), 0, 1).unwrap();
                    }
                });
            }
        });

        assert_eq!(
            block.get(Id::from(17), 0).unwrap(),
            threads * per_thread
        );
    }

    #[test]
    fn parallel_sparse_counts_lose_nothing() {
        let block = HierarchyBlock::new(Id::from(0), 1 << 20, true).unwrap();
        let threads: u64 = 4;
        let per_thread: u64 = 20_000;

        std::thread::scope(|scope| {
            for t in 0..threads {
                let block = &block;
                scope.spawn(move || {
                    for i in 0..per_thread {
                        // Overlapping tubes across threads.
                        block.count(Id::from((t + i) % 7), 0, 1).unwrap();
                    }
                });
            }
        });

        let total: u64 = (0..7)
            .map(|i| block.get(Id::from(i), 0).unwrap())
            .sum();
        assert_eq!(total, threads * per_thread);
    }
}
