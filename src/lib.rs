//! Hierarchical spatial index for out-of-core point clouds.
//!
//! Points are organized into an octree (quadtree in tubular mode)
//! whose per-cell populations live in chunked hierarchy blocks, with
//! everything persisted through a key-to-bytes storage endpoint.
//! Queries evaluate a box against the counts as a JSON tree, or
//! stream matching points back at selectable levels of detail.
//!
//! ```rust
//! use cloudtree::{Bounds, Hierarchy, Point3, Structure, StructureConfig};
//!
//! let structure = Structure::new(StructureConfig {
//!     base_depth: 4,
//!     dimensions: 2,
//!     ..Default::default()
//! })?;
//! let bounds = Bounds::new(Point3::flat(0.0, 0.0), Point3::flat(4.0, 4.0));
//!
//! let hierarchy = Hierarchy::new(structure, bounds)?;
//! hierarchy.track(&Point3::flat(1.0, 1.0), 3)?;
//!
//! let counts = hierarchy.query(&bounds, 0, 3)?;
//! assert_eq!(counts["n"], 1);
//! # Ok::<(), cloudtree::CloudtreeError>(())
//! ```

pub mod block;
pub mod cache;
pub mod chunk;
pub mod error;
pub mod hierarchy;
pub mod id;
pub mod query;
pub mod reader;
pub mod schema;
pub mod state;
pub mod storage;
pub mod structure;
pub mod types;

pub use error::{CloudtreeError, Result};

pub use id::Id;
pub use structure::{Structure, StructureConfig, HIERARCHY_START_DEPTH};
pub use types::{Bounds, Dir, Point3};

pub use block::{ContiguousBlock, HierarchyBlock, HierarchyCell, HierarchyTube, SparseBlock};
pub use hierarchy::Hierarchy;
pub use state::{ChunkState, PointState};

pub use cache::{Block, Cache, ChunkSource, FetchInfo, FetchInfoSet};
pub use chunk::{pack_record, ChunkReader, Codec, PointRecord, RawCodec};
pub use query::Query;
pub use reader::{Reader, HIERARCHY_PREFIX};
pub use schema::{Dim, DimKind, Schema};
pub use storage::{Endpoint, FsEndpoint, MemoryEndpoint, SubEndpoint};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common imports
pub mod prelude {
    pub use crate::{Bounds, CloudtreeError, Dir, Id, Point3, Result};

    pub use crate::{Hierarchy, Structure, StructureConfig};

    pub use crate::{Cache, Query, RawCodec, Reader, Schema};

    pub use crate::{Endpoint, FsEndpoint, MemoryEndpoint};
}
