//! Tree parameterization.
//!
//! A [`Structure`] is built once from configuration, validated, and then
//! shared read-only by every cursor, block, and query. It fixes the
//! tree's fan-out, its depth zones (null / base / cold), the chunk
//! sizing, and the sparse threshold past which chunks stop subdividing.

use serde::{Deserialize, Serialize};

use crate::error::{CloudtreeError, Result};
use crate::id::Id;

/// Depth at which the hierarchy derived from a tree structure begins
/// tracking cells.
pub const HIERARCHY_START_DEPTH: u64 = 6;

/// Configuration surface for [`Structure`]. Unknown keys are rejected.
///
/// ```
/// use cloudtree::structure::{Structure, StructureConfig};
///
/// let config: StructureConfig = serde_json::from_str(
///     r#"{"baseDepth": 6, "dimensions": 2, "pointsPerChunk": 256}"#,
/// ).unwrap();
/// let structure = Structure::new(config).unwrap();
/// assert_eq!(structure.factor(), 4);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StructureConfig {
    #[serde(default)]
    pub null_depth: u64,

    #[serde(default = "StructureConfig::default_base_depth")]
    pub base_depth: u64,

    /// End of the cold zone; zero leaves it unbounded.
    #[serde(default)]
    pub cold_depth: u64,

    #[serde(default = "StructureConfig::default_points_per_chunk")]
    pub points_per_chunk: u64,

    #[serde(default = "StructureConfig::default_dimensions")]
    pub dimensions: u32,

    #[serde(default)]
    pub num_points_hint: u64,

    #[serde(default)]
    pub tubular: bool,

    #[serde(default = "StructureConfig::default_true")]
    pub dynamic_chunks: bool,

    #[serde(default)]
    pub prefix_ids: bool,

    /// Depth at or past which chunks grow instead of splitting; zero
    /// means never sparse.
    #[serde(default)]
    pub sparse_depth: u64,
}

impl StructureConfig {
    const fn default_base_depth() -> u64 {
        10
    }

    const fn default_points_per_chunk() -> u64 {
        4096
    }

    const fn default_dimensions() -> u32 {
        3
    }

    const fn default_true() -> bool {
        true
    }

    pub fn from_json(json: &str) -> Result<StructureConfig> {
        serde_json::from_str(json)
            .map_err(|e| CloudtreeError::InvalidConfig(format!("structure: {e}")))
    }
}

impl Default for StructureConfig {
    fn default() -> Self {
        StructureConfig {
            null_depth: 0,
            base_depth: Self::default_base_depth(),
            cold_depth: 0,
            points_per_chunk: Self::default_points_per_chunk(),
            dimensions: Self::default_dimensions(),
            num_points_hint: 0,
            tubular: false,
            dynamic_chunks: true,
            prefix_ids: false,
            sparse_depth: 0,
        }
    }
}

/// Immutable tree parameterization. See the module docs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Structure {
    null_depth: u64,
    base_depth: u64,
    cold_depth: u64,
    points_per_chunk: u64,
    dimensions: u32,
    num_points_hint: u64,
    tubular: bool,
    dynamic_chunks: bool,
    prefix_ids: bool,
    sparse_depth: u64,
}

impl Structure {
    pub fn new(config: StructureConfig) -> Result<Structure> {
        if config.dimensions != 2 && config.dimensions != 3 {
            return Err(CloudtreeError::InvalidConfig(format!(
                "dimensions must be 2 or 3, got {}",
                config.dimensions
            )));
        }

        if config.base_depth < config.null_depth {
            return Err(CloudtreeError::InvalidConfig(format!(
                "baseDepth {} is below nullDepth {}",
                config.base_depth, config.null_depth
            )));
        }

        if config.cold_depth > 0 && config.cold_depth < config.base_depth {
            return Err(CloudtreeError::InvalidConfig(format!(
                "coldDepth {} is below baseDepth {}",
                config.cold_depth, config.base_depth
            )));
        }

        if config.points_per_chunk == 0 {
            return Err(CloudtreeError::InvalidConfig(
                "pointsPerChunk must be positive".into(),
            ));
        }

        let max_depth = Id::max_depth(config.dimensions);
        for (name, depth) in [
            ("baseDepth", config.base_depth),
            ("coldDepth", config.cold_depth),
            ("sparseDepth", config.sparse_depth),
        ] {
            if depth > max_depth {
                return Err(CloudtreeError::InvalidConfig(format!(
                    "{name} {depth} exceeds the addressable depth {max_depth}"
                )));
            }
        }

        let structure = Structure {
            null_depth: config.null_depth,
            base_depth: config.base_depth,
            cold_depth: config.cold_depth,
            points_per_chunk: config.points_per_chunk,
            dimensions: config.dimensions,
            num_points_hint: config.num_points_hint,
            tubular: config.tubular,
            dynamic_chunks: config.dynamic_chunks,
            prefix_ids: config.prefix_ids,
            sparse_depth: config.sparse_depth,
        };

        // Ids within the base zone must downcast to a machine word.
        if structure.base_index_span().simple().is_err() {
            return Err(CloudtreeError::InvalidConfig(format!(
                "baseDepth {} spans more nodes than a base block can address",
                structure.base_depth
            )));
        }

        Ok(structure)
    }

    /// The hierarchy's own structure, derived from the tree structure it
    /// counts for: cells start at [`HIERARCHY_START_DEPTH`], the base
    /// zone is widened to at least 12 levels, and the cold zone is left
    /// unbounded.
    pub fn hierarchy_from(tree: &Structure) -> Result<Structure> {
        Structure::new(StructureConfig {
            null_depth: 0,
            base_depth: tree.base_depth.max(12),
            cold_depth: 0,
            points_per_chunk: tree.points_per_chunk,
            dimensions: tree.dimensions,
            num_points_hint: tree.num_points_hint,
            tubular: tree.tubular,
            dynamic_chunks: true,
            prefix_ids: false,
            sparse_depth: tree.sparse_depth.saturating_sub(HIERARCHY_START_DEPTH),
        })
    }

    pub fn dimensions(&self) -> u32 {
        self.dimensions
    }

    /// Fan-out per split: `2^dimensions`.
    pub fn factor(&self) -> u64 {
        1 << self.dimensions
    }

    pub fn null_depth(&self) -> u64 {
        self.null_depth
    }

    pub fn base_depth(&self) -> u64 {
        self.base_depth
    }

    pub fn cold_depth(&self) -> u64 {
        self.cold_depth
    }

    pub fn points_per_chunk(&self) -> u64 {
        self.points_per_chunk
    }

    pub fn num_points_hint(&self) -> u64 {
        self.num_points_hint
    }

    pub fn tubular(&self) -> bool {
        self.tubular
    }

    pub fn dynamic_chunks(&self) -> bool {
        self.dynamic_chunks
    }

    pub fn prefix_ids(&self) -> bool {
        self.prefix_ids
    }

    /// Depth at which chunked descent collapses; zero means never.
    pub fn sparse_depth_begin(&self) -> u64 {
        self.sparse_depth
    }

    /// The deepest depth the id arithmetic can address.
    pub fn max_depth(&self) -> u64 {
        Id::max_depth(self.dimensions)
    }

    /// The deepest depth chunk ids can address: chunk ids carry the
    /// chunk size in their low bits, so they run out of headroom a few
    /// levels before node ids do.
    pub fn max_chunk_depth(&self) -> u64 {
        let ppc_bits = u64::BITS as u64 - self.points_per_chunk.leading_zeros() as u64;
        (u128::BITS as u64 - 2).saturating_sub(ppc_bits) / self.dimensions as u64
    }

    /// The id of the first node at `depth`, i.e. the total number of
    /// nodes across all shallower levels.
    pub fn level_begin(&self, depth: u64) -> Id {
        let mut id = Id::ROOT;
        for _ in 0..depth {
            id = (id << self.dimensions) + 1u64;
        }
        id
    }

    /// Total nodes across depths `[0, baseDepth)`: the span of the
    /// always-resident base block.
    pub fn base_index_span(&self) -> Id {
        self.level_begin(self.base_depth)
    }

    /// Depth of the chunk tree's root.
    pub fn nominal_chunk_depth(&self) -> u64 {
        self.base_depth
    }

    /// Id seed of the chunk tree's root.
    pub fn nominal_chunk_index(&self) -> Id {
        self.level_begin(self.base_depth)
    }

    /// Span, in node ids, of the hierarchy block covering `depth`. Spans
    /// are fixed in the dense zone and grow by the fan-out per level
    /// past the sparse threshold.
    pub(crate) fn block_span(&self, depth: u64) -> u128 {
        let ppc = self.points_per_chunk as u128;
        if self.sparse_depth == 0 || depth <= self.sparse_depth {
            return ppc;
        }

        let mut span = ppc;
        for _ in self.sparse_depth..depth {
            span = span.saturating_mul(self.factor() as u128);
        }
        span
    }

    /// Whether the block covering `depth` uses the sparse variant.
    pub(crate) fn block_is_sparse(&self, depth: u64) -> bool {
        self.sparse_depth > 0 && depth >= self.sparse_depth
    }
}
