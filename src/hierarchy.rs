//! The root of the count index.
//!
//! A [`Hierarchy`] owns one always-resident contiguous base block plus
//! a map of cold blocks materialized on first touch, routes every
//! count and lookup to the owning block, and answers box queries as a
//! JSON tree of per-cell populations.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::{Map, Value};
use tracing::debug;

use crate::block::{ContiguousBlock, HierarchyBlock};
use crate::error::{CloudtreeError, Result};
use crate::id::Id;
use crate::state::PointState;
use crate::storage::Endpoint;
use crate::structure::Structure;
use crate::types::{Bounds, Dir, Point3};

struct QueryRange {
    qbox: Bounds,
    depth_begin: u64,
    depth_end: u64,
}

/// The count index over a tree structure.
pub struct Hierarchy {
    structure: Structure,
    bounds: Bounds,
    base: ContiguousBlock,
    cold: RwLock<FxHashMap<Id, Arc<HierarchyBlock>>>,
    endpoint: Option<Arc<dyn Endpoint>>,
    postfix: String,
}

impl Hierarchy {
    /// An empty hierarchy for ingest.
    pub fn new(structure: Structure, bounds: Bounds) -> Result<Hierarchy> {
        let span = structure.base_index_span().simple()?;
        Ok(Hierarchy {
            base: ContiguousBlock::new(Id::ROOT, span)?,
            structure,
            bounds,
            cold: RwLock::new(FxHashMap::default()),
            endpoint: None,
            postfix: String::new(),
        })
    }

    /// Reconstruct from storage: the base block is read from key
    /// `"0<postfix>"` and cold blocks load lazily as lookups touch
    /// them. A missing base key yields an empty hierarchy.
    pub fn load(
        structure: Structure,
        bounds: Bounds,
        endpoint: Arc<dyn Endpoint>,
        postfix: &str,
    ) -> Result<Hierarchy> {
        let span = structure.base_index_span().simple()?;
        let key = format!("0{postfix}");

        let base = match endpoint.try_size(&key)? {
            Some(_) => {
                let data = endpoint.get(&key)?;
                debug!(key = %key, bytes = data.len(), "loading base block");
                ContiguousBlock::from_bytes(Id::ROOT, span, &data)?
            }
            None => ContiguousBlock::new(Id::ROOT, span)?,
        };

        Ok(Hierarchy {
            base,
            structure,
            bounds,
            cold: RwLock::new(FxHashMap::default()),
            endpoint: Some(endpoint),
            postfix: postfix.to_string(),
        })
    }

    pub fn structure(&self) -> &Structure {
        &self.structure
    }

    pub fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    /// Adjust the count at the cursor's cell. Thread-safe; concurrent
    /// calls never lose updates.
    pub fn count(&self, state: &PointState<'_>, delta: i64) -> Result<()> {
        if state.depth() < self.structure.base_depth() {
            self.base.count(state.id(), state.tick(), delta)
        } else {
            let block = self
                .cold_block(state.id(), state.depth(), true)?
                .ok_or(CloudtreeError::InvariantViolated(
                    "cold block was not materialized for count",
                ))?;
            block.count(state.id(), state.tick(), delta)
        }
    }

    /// Read the count at the cursor's cell; absent blocks report zero.
    pub fn get(&self, state: &PointState<'_>) -> Result<u64> {
        if state.depth() < self.structure.base_depth() {
            self.base.get(state.id(), state.tick())
        } else {
            match self.cold_block(state.id(), state.depth(), false)? {
                Some(block) => block.get(state.id(), state.tick()),
                None => Ok(0),
            }
        }
    }

    /// The population of the cursor's full z column: the sum over all
    /// ticks of its node. Equal to `get` outside tubular mode.
    pub fn total(&self, state: &PointState<'_>) -> Result<u64> {
        if state.depth() < self.structure.base_depth() {
            self.base.total(state.id())
        } else {
            match self.cold_block(state.id(), state.depth(), false)? {
                Some(block) => block.total(state.id()),
                None => Ok(0),
            }
        }
    }

    /// Count `point` into every cell along its path from the root down
    /// to `depth` inclusive.
    pub fn track(&self, point: &Point3, depth: u64) -> Result<()> {
        let mut state = PointState::new(&self.structure, self.bounds);
        loop {
            self.count(&state, 1)?;
            if state.depth() == depth {
                return Ok(());
            }
            state = state.descend(point)?;
        }
    }

    /// Evaluate a box query against the counts, producing a JSON tree
    /// of `{"n": count}` nodes keyed by direction. Nodes above
    /// `depth_begin` are walked but not emitted; nodes at or past
    /// `depth_end` are pruned.
    pub fn query(&self, qbox: &Bounds, depth_begin: u64, depth_end: u64) -> Result<Value> {
        if depth_begin >= depth_end {
            return Err(CloudtreeError::InvalidConfig(format!(
                "query depth range [{depth_begin}, {depth_end}) is empty"
            )));
        }

        let range = QueryRange {
            qbox: *qbox,
            depth_begin,
            depth_end: depth_end.min(self.structure.max_depth()),
        };

        let mut root = Map::new();
        let state = PointState::new(&self.structure, self.bounds);
        self.traverse(&mut root, &range, state)?;
        Ok(Value::Object(root))
    }

    /// Persist the base block and every loaded cold block under
    /// `"<blockRootId><postfix>"`.
    pub fn save(&self, endpoint: &dyn Endpoint, postfix: &str) -> Result<()> {
        self.base.save(endpoint, postfix)?;

        let blocks: Vec<Arc<HierarchyBlock>> =
            self.cold.read().values().cloned().collect();
        for block in blocks {
            if !block.is_empty() {
                block.save(endpoint, postfix)?;
            }
        }
        Ok(())
    }

    /// Union of counts: add every cell of `other` into this hierarchy.
    /// Used to combine hierarchies built by parallel subset builders.
    pub fn merge(&self, other: &Hierarchy) -> Result<()> {
        if self.structure != other.structure {
            return Err(CloudtreeError::InvalidConfig(
                "cannot merge hierarchies with different structures".into(),
            ));
        }

        for (norm, tick, val) in other.base.cells() {
            self.base.count(Id::from(norm), tick, val as i64)?;
        }

        let blocks: Vec<(Id, Arc<HierarchyBlock>)> = other
            .cold
            .read()
            .iter()
            .map(|(root, block)| (*root, block.clone()))
            .collect();

        for (root, block) in blocks {
            let depth = self.depth_of(root);
            for (norm, tick, val) in block.cells() {
                let id = root + Id::new(norm as u128);
                let target = self.cold_block(id, depth, true)?.ok_or(
                    CloudtreeError::InvariantViolated(
                        "cold block was not materialized for merge",
                    ),
                )?;
                target.count(id, tick, val as i64)?;
            }
        }
        Ok(())
    }

    /// Roots of the currently loaded cold blocks and whether each uses
    /// the sparse layout.
    pub fn cold_blocks(&self) -> Vec<(Id, bool)> {
        let mut roots: Vec<(Id, bool)> = self
            .cold
            .read()
            .values()
            .map(|block| (block.id(), block.is_sparse()))
            .collect();
        roots.sort();
        roots
    }

    // Block root, span, and layout for the cell at (id, depth).
    fn locate(&self, id: Id, depth: u64) -> (Id, u128, bool) {
        let level = self.structure.level_begin(depth);
        let span = self.structure.block_span(depth);
        let offset = (id - level).value();
        let root = Id::new(level.value() + offset / span * span);
        (root, span, self.structure.block_is_sparse(depth))
    }

    fn depth_of(&self, id: Id) -> u64 {
        let mut depth = 0;
        while depth < self.structure.max_depth()
            && self.structure.level_begin(depth + 1) <= id
        {
            depth += 1;
        }
        depth
    }

    fn cold_block(
        &self,
        id: Id,
        depth: u64,
        create: bool,
    ) -> Result<Option<Arc<HierarchyBlock>>> {
        let (root, span, sparse) = self.locate(id, depth);

        if let Some(block) = self.cold.read().get(&root) {
            return Ok(Some(block.clone()));
        }

        let mut cold = self.cold.write();
        if let Some(block) = cold.get(&root) {
            return Ok(Some(block.clone()));
        }

        if let Some(endpoint) = &self.endpoint {
            let key = format!("{root}{}", self.postfix);
            if endpoint.try_size(&key)?.is_some() {
                let data = endpoint.get(&key)?;
                debug!(key = %key, bytes = data.len(), sparse, "loading cold block");
                let block = Arc::new(HierarchyBlock::from_bytes(root, span, sparse, &data)?);
                cold.insert(root, block.clone());
                return Ok(Some(block));
            }
        }

        if create {
            let block = Arc::new(HierarchyBlock::new(root, span, sparse)?);
            cold.insert(root, block.clone());
            Ok(Some(block))
        } else {
            Ok(None)
        }
    }

    fn child_dirs(&self) -> impl Iterator<Item = Dir> {
        // Tubular trees split spatially as quadtrees but still descend
        // both tick branches.
        let n = if self.structure.tubular() {
            8
        } else {
            self.structure.factor()
        };
        Dir::iter(n)
    }

    fn traverse(
        &self,
        json: &mut Map<String, Value>,
        range: &QueryRange,
        state: PointState<'_>,
    ) -> Result<()> {
        if !range.qbox.overlaps(state.bounds()) || state.depth() >= range.depth_end {
            return Ok(());
        }

        let count = self.get(&state)?;
        if count == 0 {
            return Ok(());
        }

        if state.depth() >= range.depth_begin {
            self.accumulate(json, range, state, count)
        } else {
            // Below the emission floor: recurse into the same output
            // node, so branches meeting at depth_begin merge there.
            for dir in self.child_dirs() {
                self.traverse(json, range, state.climb(dir)?)?;
            }
            Ok(())
        }
    }

    fn accumulate(
        &self,
        json: &mut Map<String, Value>,
        range: &QueryRange,
        state: PointState<'_>,
        count: u64,
    ) -> Result<()> {
        let prev = json.get("n").and_then(Value::as_u64).unwrap_or(0);
        json.insert("n".to_string(), Value::from(prev + count));

        if state.depth() + 1 >= range.depth_end {
            return Ok(());
        }

        for dir in self.child_dirs() {
            let child = state.climb(dir)?;
            if !range.qbox.overlaps(child.bounds()) {
                continue;
            }
            let child_count = self.get(&child)?;
            if child_count == 0 {
                continue;
            }

            let token = dir.token(self.structure.dimensions());
            let slot = json
                .entry(token.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(map) = slot {
                self.accumulate(map, range, child, child_count)?;
            }
        }
        Ok(())
    }
}
