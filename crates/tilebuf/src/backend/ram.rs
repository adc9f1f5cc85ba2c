//! Heap-backed tile storage.
//!
//! Tiles are kept in a map keyed by (x, y, z). `SET` stores a COW
//! duplicate of the incoming tile and `GET` hands a COW duplicate back, so
//! no pixels move until somebody writes: a stored tile is a snapshot that
//! later writes to the live tile cannot disturb.

use std::collections::HashMap;
use std::sync::Mutex;

use tilebuf_core::{PixelFormat, Rect};

use crate::backend::TileBackend;
use crate::source::{TileCommand, TileReply, TileSource};
use crate::tile::Tile;

pub struct RamBackend {
    tile_width: i32,
    tile_height: i32,
    format: PixelFormat,
    extent: Mutex<Rect>,
    tiles: Mutex<HashMap<(i32, i32, i32), Tile>>,
}

impl RamBackend {
    /// Creates a heap backend with the given tile geometry.
    pub fn new(tile_width: i32, tile_height: i32, format: PixelFormat, extent: Rect) -> Self {
        Self {
            tile_width,
            tile_height,
            format,
            extent: Mutex::new(extent),
            tiles: Mutex::new(HashMap::new()),
        }
    }

    /// Number of materialized tiles (for tests and diagnostics).
    pub fn stored_tile_count(&self) -> usize {
        self.tiles.lock().unwrap().len()
    }
}

impl TileSource for RamBackend {
    fn command(&self, cmd: TileCommand, x: i32, y: i32, z: i32) -> TileReply {
        match cmd {
            TileCommand::Get => {
                let tiles = self.tiles.lock().unwrap();
                match tiles.get(&(x, y, z)) {
                    Some(tile) => TileReply::Tile(tile.dup()),
                    None => TileReply::None,
                }
            }
            TileCommand::Set(tile) => {
                let snapshot = tile.dup();
                snapshot.mark_stored();
                snapshot.clear_storage();
                self.tiles.lock().unwrap().insert((x, y, z), snapshot);
                tile.mark_stored();
                TileReply::Flag(true)
            }
            TileCommand::Exist => {
                TileReply::Flag(self.tiles.lock().unwrap().contains_key(&(x, y, z)))
            }
            TileCommand::Void => {
                self.tiles.lock().unwrap().remove(&(x, y, z));
                TileReply::None
            }
            TileCommand::Reinit => {
                self.tiles.lock().unwrap().clear();
                TileReply::None
            }
            _ => TileReply::None,
        }
    }
}

impl TileBackend for RamBackend {
    fn tile_width(&self) -> i32 {
        self.tile_width
    }

    fn tile_height(&self) -> i32 {
        self.tile_height
    }

    fn format(&self) -> PixelFormat {
        self.format
    }

    fn extent(&self) -> Rect {
        *self.extent.lock().unwrap()
    }

    fn set_extent(&self, extent: Rect) {
        *self.extent.lock().unwrap() = extent;
    }
}
