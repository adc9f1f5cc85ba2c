//! Most-recently-used tile cache with a process-wide byte budget.
//!
//! All cache handlers share **one** pool: a hash map plus a key-linked LRU
//! list and a byte counter, guarded by a single global mutex. Entries are
//! keyed by `(handler, x, y, z)` so any number of storages can share the
//! budget. Critical sections only manipulate pointers and counters; pixel
//! work (write-back of dirty tiles) happens after the lock is released.
//!
//! Contracts:
//! - `GET`: on a hit, promote to the MRU end and hand out a reference; miss:
//!   forward to the inner source and cache a non-null result.
//! - `SET`: insert (displacing any entry at the same key) and forward, so
//!   the write also reaches the backend.
//! - `VOID`: drop the entry, mark the tile stored, clear its storage
//!   link, drop a matching hot tile.
//! - `REFETCH`: like `VOID` but the storage link survives, so the next
//!   `GET` re-enters the cache path.
//! - `FLUSH`: store every dirty tile belonging to this handler.
//! - `IDLE`: the *wash*, store the dirty tile furthest from the MRU end
//!   within the wash window; reports whether anything was done.
//! - Eviction: on insert, while the pool exceeds the budget, the LRU tail
//!   is dropped; a dirty evictee writes itself back when its last
//!   reference goes away.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock, Weak};

use tracing::warn;

use crate::config;
use crate::handler::InnerSource;
use crate::source::{SharedSource, TileCommand, TileReply, TileSource};
use crate::storage::TileStorage;
use crate::tile::Tile;

/// Share of the LRU tail considered by the wash, in percent.
const WASH_PERCENTAGE: usize = 20;

/// Key of a cached tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CacheKey {
    handler: u64,
    x: i32,
    y: i32,
    z: i32,
}

/// A cached tile and its LRU links.
struct CacheEntry {
    tile: Tile,
    prev: Option<CacheKey>,
    next: Option<CacheKey>,
}

/// The process-wide pool.
struct CachePool {
    entries: HashMap<CacheKey, CacheEntry>,
    head: Option<CacheKey>,
    tail: Option<CacheKey>,
    total: u64,
}

impl CachePool {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            head: None,
            tail: None,
            total: 0,
        }
    }

    /// Splices `key` out of the LRU list (entry stays in the map).
    fn unlink(&mut self, key: CacheKey) {
        let (prev, next) = match self.entries.get(&key) {
            Some(e) => (e.prev, e.next),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(e) = self.entries.get_mut(&p) {
                    e.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(e) = self.entries.get_mut(&n) {
                    e.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if let Some(e) = self.entries.get_mut(&key) {
            e.prev = None;
            e.next = None;
        }
    }

    /// Pushes `key` to the MRU end.
    fn link_head(&mut self, key: CacheKey) {
        let old_head = self.head;
        if let Some(e) = self.entries.get_mut(&key) {
            e.prev = None;
            e.next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(e) = self.entries.get_mut(&h) {
                e.prev = Some(key);
            }
        }
        self.head = Some(key);
        if self.tail.is_none() {
            self.tail = Some(key);
        }
    }

    /// Removes `key` entirely, returning its tile.
    fn remove(&mut self, key: CacheKey) -> Option<Tile> {
        if !self.entries.contains_key(&key) {
            return None;
        }
        self.unlink(key);
        let entry = self.entries.remove(&key)?;
        self.total = self.total.saturating_sub(entry.tile.size() as u64);
        Some(entry.tile)
    }

    /// Drops the LRU tail entry.
    fn pop_tail(&mut self) -> Option<Tile> {
        let key = self.tail?;
        self.remove(key)
    }
}

fn pool() -> &'static Mutex<CachePool> {
    static POOL: OnceLock<Mutex<CachePool>> = OnceLock::new();
    POOL.get_or_init(|| Mutex::new(CachePool::new()))
}

/// Sum of tile sizes currently held by the pool, in bytes.
pub fn pool_total_bytes() -> u64 {
    pool().lock().unwrap().total
}

/// Number of entries currently held by the pool.
pub fn pool_entry_count() -> usize {
    pool().lock().unwrap().entries.len()
}

/// Drains the pool, dropping pending writes (tiles are marked stored
/// first, per the shutdown contract).
pub(crate) fn shutdown_pool() {
    let drained: Vec<Tile> = {
        let mut pool = pool().lock().unwrap();
        pool.head = None;
        pool.tail = None;
        pool.total = 0;
        pool.entries.drain().map(|(_, e)| e.tile).collect()
    };
    for tile in &drained {
        tile.mark_stored();
    }
}

/// The cache link of a storage chain.
pub struct CacheHandler {
    id: u64,
    inner: InnerSource,
    storage: OnceLock<Weak<TileStorage>>,
}

impl CacheHandler {
    pub(crate) fn new() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            inner: InnerSource::new(),
            storage: OnceLock::new(),
        }
    }

    pub(crate) fn set_inner(&self, source: SharedSource) {
        self.inner.set(source);
    }

    pub(crate) fn set_storage(&self, storage: Weak<TileStorage>) {
        let _ = self.storage.set(storage);
    }

    fn key(&self, x: i32, y: i32, z: i32) -> CacheKey {
        CacheKey {
            handler: self.id,
            x,
            y,
            z,
        }
    }

    /// Registers `tile` at (x, y, z), displacing any previous entry and
    /// evicting from the LRU tail while the pool exceeds the budget.
    ///
    /// Also stamps the tile's coordinates and storage back-pointer; this
    /// is where a fresh tile becomes traceable back to its storage.
    pub(crate) fn insert(&self, tile: &Tile, x: i32, y: i32, z: i32) {
        tile.set_coords(x, y, z);
        if let Some(storage) = self.storage.get() {
            tile.set_storage(storage.clone());
        }

        let budget = config::get().tile_cache_size;
        let key = self.key(x, y, z);
        let (displaced, evicted) = {
            let mut pool = pool().lock().unwrap();
            let displaced = pool.remove(key);
            let mut evicted: Vec<Tile> = Vec::new();
            pool.entries.insert(
                key,
                CacheEntry {
                    tile: tile.clone(),
                    prev: None,
                    next: None,
                },
            );
            pool.total += tile.size() as u64;
            pool.link_head(key);

            while pool.total > budget {
                match pool.pop_tail() {
                    Some(t) => evicted.push(t),
                    None => break,
                }
            }
            (displaced, evicted)
        };

        // pixel work happens outside the pool lock
        if let Some(old) = displaced {
            if !old.same(tile) {
                old.mark_stored();
                drop_hot_tile_if(&old);
            }
        }
        for t in evicted {
            drop_hot_tile_if(&t);
            // a dirty evictee writes itself back on final drop
        }
    }

    /// Cache lookup without forwarding; used by the zoom handler to let
    /// previously synthesized mipmaps short-circuit the recursion.
    pub(crate) fn cached_tile(&self, x: i32, y: i32, z: i32) -> Option<Tile> {
        self.lookup(x, y, z)
    }

    /// Cache lookup; a hit is promoted to the MRU end.
    fn lookup(&self, x: i32, y: i32, z: i32) -> Option<Tile> {
        let key = self.key(x, y, z);
        let mut pool = pool().lock().unwrap();
        if !pool.entries.contains_key(&key) {
            return None;
        }
        pool.unlink(key);
        pool.link_head(key);
        Some(pool.entries.get(&key).unwrap().tile.clone())
    }

    fn has(&self, x: i32, y: i32, z: i32) -> bool {
        self.lookup(x, y, z).is_some()
    }

    fn get(&self, x: i32, y: i32, z: i32) -> Option<Tile> {
        if let Some(tile) = self.lookup(x, y, z) {
            return Some(tile);
        }
        let tile = match self.inner.get() {
            Some(inner) => inner.get_tile(x, y, z),
            None => None,
        }?;
        self.insert(&tile, x, y, z);
        Some(tile)
    }

    /// `VOID`: drop the materialization entirely.
    fn void_at(&self, x: i32, y: i32, z: i32) {
        let removed = pool().lock().unwrap().remove(self.key(x, y, z));
        if let Some(tile) = removed {
            drop_hot_tile_if(&tile);
            tile.void();
            tile.clear_storage();
        }
    }

    /// `REFETCH`: invalidate content, keep the tile identity.
    fn invalidate_at(&self, x: i32, y: i32, z: i32) {
        let removed = pool().lock().unwrap().remove(self.key(x, y, z));
        if let Some(tile) = removed {
            drop_hot_tile_if(&tile);
            tile.mark_stored();
        }
    }

    /// `REINIT`: wipe everything this handler has cached.
    fn reinit(&self) {
        if let Some(storage) = self.storage.get().and_then(Weak::upgrade) {
            storage.drop_hot_tile();
        }
        let drained: Vec<Tile> = {
            let mut pool = pool().lock().unwrap();
            let keys: Vec<CacheKey> = pool
                .entries
                .keys()
                .filter(|k| k.handler == self.id)
                .copied()
                .collect();
            keys.into_iter().filter_map(|k| pool.remove(k)).collect()
        };
        for tile in drained {
            tile.mark_stored();
        }
    }

    /// `FLUSH`: write this handler's dirty tiles through.
    fn flush_all(&self) {
        let dirty: Vec<Tile> = {
            let pool = pool().lock().unwrap();
            pool.entries
                .iter()
                .filter(|(k, e)| k.handler == self.id && !e.tile.is_stored())
                .map(|(_, e)| e.tile.clone())
                .collect()
        };
        for tile in dirty {
            tile.store();
        }
    }

    /// `IDLE`: store the least-recently-used dirty tile within the wash
    /// window, spreading write-back cost over idle time.
    fn wash(&self) -> bool {
        let candidate: Option<Tile> = {
            let pool = pool().lock().unwrap();
            let length = pool.entries.len();
            let wash_tiles = WASH_PERCENTAGE * length / 100;
            let mut candidate = None;
            let mut cursor = pool.head;
            let mut count = 0usize;
            while let Some(key) = cursor {
                let entry = match pool.entries.get(&key) {
                    Some(e) => e,
                    None => {
                        warn!("cache LRU list points at a missing entry");
                        break;
                    }
                };
                count += 1;
                if !entry.tile.is_stored() && count > length - wash_tiles {
                    candidate = Some(entry.tile.clone());
                }
                cursor = entry.next;
            }
            candidate
        };
        match candidate {
            Some(tile) => {
                tile.store();
                true
            }
            None => false,
        }
    }
}

/// Detaches the storage hot tile if it is this tile.
fn drop_hot_tile_if(tile: &Tile) {
    if let Some(storage) = tile.storage() {
        storage.drop_hot_tile_if(tile);
    }
}

impl TileSource for CacheHandler {
    fn command(&self, cmd: TileCommand, x: i32, y: i32, z: i32) -> TileReply {
        match cmd {
            TileCommand::Get => match self.get(x, y, z) {
                Some(tile) => TileReply::Tile(tile),
                None => TileReply::None,
            },
            TileCommand::Set(tile) => {
                self.insert(&tile, x, y, z);
                let forwarded = self.inner.forward(TileCommand::Set(tile), x, y, z);
                TileReply::Flag(forwarded.flag())
            }
            TileCommand::IsCached => TileReply::Flag(self.has(x, y, z)),
            TileCommand::Exist => {
                if self.has(x, y, z) {
                    TileReply::Flag(true)
                } else {
                    self.inner.forward(TileCommand::Exist, x, y, z)
                }
            }
            TileCommand::Idle => {
                if self.wash() {
                    TileReply::Flag(true)
                } else {
                    self.inner.forward(TileCommand::Idle, x, y, z)
                }
            }
            TileCommand::Refetch => {
                self.invalidate_at(x, y, z);
                self.inner.forward(TileCommand::Refetch, x, y, z)
            }
            TileCommand::Void => {
                self.void_at(x, y, z);
                self.inner.forward(TileCommand::Void, x, y, z)
            }
            TileCommand::Reinit => {
                self.reinit();
                self.inner.forward(TileCommand::Reinit, x, y, z)
            }
            TileCommand::Flush => {
                self.flush_all();
                self.inner.forward(TileCommand::Flush, x, y, z)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::TileReply;

    struct NullSource;
    impl TileSource for NullSource {
        fn command(&self, _cmd: TileCommand, _x: i32, _y: i32, _z: i32) -> TileReply {
            TileReply::None
        }
    }

    fn handler() -> CacheHandler {
        let h = CacheHandler::new();
        h.set_inner(std::sync::Arc::new(NullSource));
        h
    }

    #[test]
    fn test_insert_then_get_hits() {
        let h = handler();
        let t = Tile::new(64);
        h.insert(&t, 3, 4, 0);
        let hit = h.get(3, 4, 0).expect("cached tile");
        assert!(hit.same(&t));
        assert_eq!(hit.coords(), (3, 4, 0));
        h.void_at(3, 4, 0);
        assert!(h.get(3, 4, 0).is_none());
    }

    #[test]
    fn test_insert_displaces_same_key() {
        let h = handler();
        let a = Tile::new(64);
        let b = Tile::new(64);
        h.insert(&a, 0, 0, 0);
        h.insert(&b, 0, 0, 0);
        let hit = h.get(0, 0, 0).unwrap();
        assert!(hit.same(&b));
        h.void_at(0, 0, 0);
    }

    #[test]
    fn test_is_cached_does_not_touch_inner() {
        let h = handler();
        assert!(!h.has(9, 9, 0));
        let t = Tile::new(16);
        h.insert(&t, 9, 9, 0);
        assert!(h.has(9, 9, 0));
        h.void_at(9, 9, 0);
    }

    #[test]
    fn test_refetch_keeps_storage_link_semantics() {
        let h = handler();
        let t = Tile::new(16);
        h.insert(&t, 1, 1, 0);
        h.invalidate_at(1, 1, 0);
        assert!(!h.has(1, 1, 0));
        assert!(t.is_stored());
        h.void_at(1, 1, 0);
    }

    #[test]
    fn test_reinit_clears_only_this_handler() {
        let h1 = handler();
        let h2 = handler();
        let a = Tile::new(16);
        let b = Tile::new(16);
        h1.insert(&a, 0, 0, 0);
        h2.insert(&b, 0, 0, 0);
        h1.reinit();
        assert!(!h1.has(0, 0, 0));
        assert!(h2.has(0, 0, 0));
        h2.reinit();
    }
}
