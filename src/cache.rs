//! Chunk cache.
//!
//! Queries hand the cache a set of chunks to fetch and receive a
//! scoped [`Block`] lease: while the lease lives, every requested
//! chunk stays resident. Eviction is LRU by chunk byte size, and
//! duplicate requests for a chunk already being fetched coalesce onto
//! the same in-flight load.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::chunk::ChunkReader;
use crate::error::{CloudtreeError, Result};
use crate::id::Id;
use crate::types::Bounds;

/// One chunk to load: its id, its depth, and the region it covers.
#[derive(Debug, Clone, Copy)]
pub struct FetchInfo {
    pub id: Id,
    pub depth: u64,
    pub bounds: Bounds,
}

impl PartialEq for FetchInfo {
    fn eq(&self, other: &FetchInfo) -> bool {
        self.id == other.id && self.depth == other.depth
    }
}

impl Eq for FetchInfo {}

impl PartialOrd for FetchInfo {
    fn partial_cmp(&self, other: &FetchInfo) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FetchInfo {
    fn cmp(&self, other: &FetchInfo) -> std::cmp::Ordering {
        (self.id, self.depth).cmp(&(other.id, other.depth))
    }
}

/// The chunks a query wants resident, id-ordered.
pub type FetchInfoSet = BTreeSet<FetchInfo>;

/// Where the cache pulls chunks from. Implemented by the reader; kept
/// as a seam so the cache can be exercised on its own.
pub trait ChunkSource {
    /// Stored size of the chunk, or `None` if it does not exist.
    fn chunk_size(&self, info: &FetchInfo) -> Result<Option<u64>>;

    /// Fetch and decode the chunk; `None` if it does not exist.
    fn fetch_chunk(&self, info: &FetchInfo) -> Result<Option<ChunkReader>>;
}

struct Slot {
    // None while the fetch is in flight.
    reader: Option<Arc<ChunkReader>>,
    bytes: u64,
    refs: usize,
    stamp: u64,
}

struct Inner {
    resident: FxHashMap<Id, Slot>,
    used: u64,
    seq: u64,
}

/// LRU chunk cache, safe under concurrent [`Cache::acquire`].
pub struct Cache {
    max_bytes: u64,
    inner: Mutex<Inner>,
    ready: Condvar,
}

impl Cache {
    pub fn new(max_bytes: u64) -> Cache {
        Cache {
            max_bytes,
            inner: Mutex::new(Inner {
                resident: FxHashMap::default(),
                used: 0,
                seq: 0,
            }),
            ready: Condvar::new(),
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Bytes currently resident, pinned or not.
    pub fn used_bytes(&self) -> u64 {
        self.inner.lock().used
    }

    /// Pin every chunk in `fetches` into residency and return the
    /// lease. Chunks absent from storage are skipped; a fetch set whose
    /// stored size exceeds the budget fails with `CacheExhausted`.
    pub fn acquire<'a>(
        &'a self,
        source: &dyn ChunkSource,
        fetches: &FetchInfoSet,
    ) -> Result<Block<'a>> {
        let mut present = Vec::new();
        let mut needed = 0;
        for info in fetches {
            if let Some(size) = source.chunk_size(info)? {
                needed += size;
                present.push(*info);
            }
        }

        if needed > self.max_bytes {
            return Err(CloudtreeError::CacheExhausted {
                needed,
                budget: self.max_bytes,
            });
        }

        let mut ids = Vec::with_capacity(present.len());
        let mut chunks = Vec::with_capacity(present.len());
        for info in present {
            match self.acquire_one(source, &info) {
                Ok(Some(chunk)) => {
                    ids.push(info.id);
                    chunks.push(chunk);
                }
                Ok(None) => {}
                Err(e) => {
                    self.release(&ids);
                    return Err(e);
                }
            }
        }

        Ok(Block {
            cache: self,
            ids,
            chunks,
        })
    }

    fn acquire_one(
        &self,
        source: &dyn ChunkSource,
        info: &FetchInfo,
    ) -> Result<Option<Arc<ChunkReader>>> {
        loop {
            let mut inner = self.inner.lock();
            inner.seq += 1;
            let stamp = inner.seq;

            match inner.resident.get_mut(&info.id) {
                Some(slot) if slot.reader.is_some() => {
                    slot.refs += 1;
                    slot.stamp = stamp;
                    return Ok(slot.reader.clone());
                }
                Some(_) => {
                    // Someone else is fetching this chunk; coalesce.
                    self.ready.wait(&mut inner);
                    continue;
                }
                None => {
                    inner.resident.insert(
                        info.id,
                        Slot {
                            reader: None,
                            bytes: 0,
                            refs: 0,
                            stamp,
                        },
                    );
                }
            }

            drop(inner);
            let fetched = source.fetch_chunk(info);

            let mut inner = self.inner.lock();
            return match fetched {
                Ok(Some(chunk)) => {
                    let bytes = chunk.bytes();
                    let reader = Arc::new(chunk);
                    debug!(chunk = %info.id, bytes, "chunk fetched");

                    let slot = inner.resident.get_mut(&info.id).ok_or(
                        CloudtreeError::InvariantViolated("in-flight slot vanished"),
                    )?;
                    slot.reader = Some(reader.clone());
                    slot.bytes = bytes;
                    slot.refs = 1;
                    inner.used += bytes;

                    self.evict(&mut inner);
                    self.ready.notify_all();
                    Ok(Some(reader))
                }
                Ok(None) => {
                    inner.resident.remove(&info.id);
                    self.ready.notify_all();
                    Ok(None)
                }
                Err(e) => {
                    inner.resident.remove(&info.id);
                    self.ready.notify_all();
                    Err(e)
                }
            };
        }
    }

    fn release(&self, ids: &[Id]) {
        let mut inner = self.inner.lock();
        for id in ids {
            if let Some(slot) = inner.resident.get_mut(id) {
                slot.refs = slot.refs.saturating_sub(1);
            }
        }
        self.evict(&mut inner);
        self.ready.notify_all();
    }

    // Drop unpinned chunks, least recently stamped first, until the
    // budget holds. Pinned residency may overshoot the budget while
    // leases are live.
    fn evict(&self, inner: &mut Inner) {
        while inner.used > self.max_bytes {
            let victim = inner
                .resident
                .iter()
                .filter(|(_, slot)| slot.refs == 0 && slot.reader.is_some())
                .min_by_key(|(_, slot)| slot.stamp)
                .map(|(id, _)| *id);

            match victim {
                Some(id) => {
                    if let Some(slot) = inner.resident.remove(&id) {
                        inner.used -= slot.bytes;
                        debug!(chunk = %id, bytes = slot.bytes, "chunk evicted");
                    }
                }
                None => break,
            }
        }
    }
}

/// A scoped lease over a set of resident chunks. Dropping the lease
/// unpins them for eviction.
pub struct Block<'a> {
    cache: &'a Cache,
    ids: Vec<Id>,
    chunks: Vec<Arc<ChunkReader>>,
}

impl Block<'_> {
    pub fn chunks(&self) -> &[Arc<ChunkReader>] {
        &self.chunks
    }
}

impl Drop for Block<'_> {
    fn drop(&mut self) {
        self.cache.release(&self.ids);
    }
}
