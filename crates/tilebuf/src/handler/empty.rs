//! Shared zero tile for unmaterialized regions.
//!
//! The handler owns one zero-filled tile of the backend's geometry. A
//! level-0 `GET` that the chain below cannot satisfy is answered with a
//! COW duplicate of that tile, registered in the cache so the next read
//! hits. The duplicate unclones on first write, so the shared slab stays
//! pristine for the process lifetime.
//!
//! Misses at z > 0 stay misses: mipmap synthesis above this handler owns
//! those.

use std::sync::Arc;

use crate::handler::cache::CacheHandler;
use crate::handler::InnerSource;
use crate::source::{SharedSource, TileCommand, TileReply, TileSource};
use crate::tile::Tile;

pub struct EmptyHandler {
    inner: InnerSource,
    cache: Arc<CacheHandler>,
    tile: Tile,
}

impl EmptyHandler {
    pub(crate) fn new(tile_size: usize, cache: Arc<CacheHandler>) -> Self {
        Self {
            inner: InnerSource::new(),
            cache,
            tile: Tile::new_zero(tile_size),
        }
    }

    pub(crate) fn set_inner(&self, source: SharedSource) {
        self.inner.set(source);
    }

    /// The shared zero tile (for tests and diagnostics).
    pub(crate) fn zero_tile(&self) -> &Tile {
        &self.tile
    }

    fn get(&self, x: i32, y: i32, z: i32) -> Option<Tile> {
        if let Some(tile) = self.inner.forward(TileCommand::Get, x, y, z).into_tile() {
            return Some(tile);
        }
        if z != 0 {
            return None;
        }
        let tile = self.tile.dup();
        self.cache.insert(&tile, x, y, z);
        Some(tile)
    }
}

impl TileSource for EmptyHandler {
    fn command(&self, cmd: TileCommand, x: i32, y: i32, z: i32) -> TileReply {
        match cmd {
            TileCommand::Get => match self.get(x, y, z) {
                Some(tile) => TileReply::Tile(tile),
                None => TileReply::None,
            },
            other => self.inner.forward(other, x, y, z),
        }
    }
}
