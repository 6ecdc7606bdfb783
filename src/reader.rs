//! Dataset reader: the query-side bundle of structure, schema,
//! storage, codec, hierarchy, and the resident base points.

use std::sync::Arc;

use tracing::debug;

use crate::cache::{Cache, ChunkSource, FetchInfo};
use crate::chunk::{ChunkReader, Codec, PointRecord};
use crate::error::Result;
use crate::hierarchy::Hierarchy;
use crate::id::Id;
use crate::query::Query;
use crate::schema::Schema;
use crate::storage::{Endpoint, SubEndpoint};
use crate::structure::Structure;
use crate::types::{Bounds, Point3};

/// Key of the resident base point data.
const BASE_KEY: &str = "base";

/// Key prefix under which hierarchy blocks live, keeping them apart
/// from chunk data on a shared endpoint.
pub const HIERARCHY_PREFIX: &str = "h/";

/// Read-side view of an indexed dataset.
pub struct Reader {
    structure: Structure,
    bounds: Bounds,
    schema: Schema,
    endpoint: Arc<dyn Endpoint>,
    codec: Arc<dyn Codec>,
    hierarchy: Hierarchy,
    base: Vec<PointRecord>,
    postfix: String,
}

impl Reader {
    pub fn open(
        structure: Structure,
        bounds: Bounds,
        schema: Schema,
        endpoint: Arc<dyn Endpoint>,
        codec: Arc<dyn Codec>,
    ) -> Result<Reader> {
        Reader::open_subset(structure, bounds, schema, endpoint, codec, "")
    }

    /// Open one subset of a partitioned build; `postfix` is appended to
    /// every storage key (e.g. `"-3"` for subset #3).
    ///
    /// The hierarchy is loaded against the structure derived from the
    /// tree structure, the same derivation the builder counts under.
    pub fn open_subset(
        structure: Structure,
        bounds: Bounds,
        schema: Schema,
        endpoint: Arc<dyn Endpoint>,
        codec: Arc<dyn Codec>,
        postfix: &str,
    ) -> Result<Reader> {
        let hierarchy = Hierarchy::load(
            Structure::hierarchy_from(&structure)?,
            bounds,
            Arc::new(SubEndpoint::new(endpoint.clone(), HIERARCHY_PREFIX)),
            postfix,
        )?;

        let base_key = format!("{BASE_KEY}{postfix}");
        let base = match endpoint.try_size(&base_key)? {
            Some(_) => {
                let data = endpoint.get(&base_key)?;
                let points = codec.decode(&schema, &data)?;
                debug!(points = points.len(), "loaded base point data");
                points
            }
            None => Vec::new(),
        };

        Ok(Reader {
            structure,
            bounds,
            schema,
            endpoint,
            codec,
            hierarchy,
            base,
            postfix: postfix.to_string(),
        })
    }

    pub fn structure(&self) -> &Structure {
        &self.structure
    }

    pub fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn hierarchy(&self) -> &Hierarchy {
        &self.hierarchy
    }

    /// Points resident in the base zone.
    pub fn base(&self) -> &[PointRecord] {
        &self.base
    }

    /// Begin a spatial point query. `scale` and `offset` transform the
    /// emitted spatial values as `(p - offset) * scale`.
    #[allow(clippy::too_many_arguments)]
    pub fn query<'a>(
        &'a self,
        out_schema: Schema,
        cache: &'a Cache,
        qbox: Bounds,
        depth_begin: u64,
        depth_end: u64,
        scale: f64,
        offset: Point3,
    ) -> Query<'a> {
        Query::new(
            self,
            out_schema,
            cache,
            qbox,
            depth_begin,
            depth_end,
            scale,
            offset,
        )
    }

    fn chunk_key(&self, id: Id) -> String {
        format!("{id}{}", self.postfix)
    }
}

impl ChunkSource for Reader {
    fn chunk_size(&self, info: &FetchInfo) -> Result<Option<u64>> {
        self.endpoint.try_size(&self.chunk_key(info.id))
    }

    fn fetch_chunk(&self, info: &FetchInfo) -> Result<Option<ChunkReader>> {
        let key = self.chunk_key(info.id);
        if self.endpoint.try_size(&key)?.is_none() {
            return Ok(None);
        }

        let data = self.endpoint.get(&key)?;
        let points = self.codec.decode(&self.schema, &data)?;
        Ok(Some(ChunkReader::new(
            info.id,
            info.depth,
            data.len() as u64,
            points,
        )))
    }
}
