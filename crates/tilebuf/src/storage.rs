//! Tile storage: a handler chain over a backend.
//!
//! A storage assembles the chain
//!
//! ```text
//! head → cache → zoom → empty → backend
//! ```
//!
//! for one tile geometry and pixel format, and exposes the whole thing as
//! a single tile source. The cache handler is additionally reachable as a
//! direct field because the hot paths (single-pixel access, COW copies,
//! linear buffers) poke it without going through command dispatch. When
//! the config asks for tile-op tracing, a logging handler is spliced in
//! front of the backend.
//!
//! Storages created from a bare format are **shared**: a process-wide
//! cache keyed by `(tile_width, tile_height, format, ram-or-swap)` hands
//! out the same storage to every compatible buffer, and a region allocator
//! inside the storage gives each such buffer a disjoint, tile-aligned
//! window (its shift). Cached storages survive until [`shutdown`] tears
//! them down in FIFO order.
//!
//! [`shutdown`]: crate::config::shutdown

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use tracing::warn;

use tilebuf_core::{PixelFormat, Rect};

use crate::backend::{FileBackend, RamBackend, TileBackend};
use crate::config;
use crate::handler::cache::CacheHandler;
use crate::handler::empty::EmptyHandler;
use crate::handler::log::LogHandler;
use crate::handler::zoom::ZoomHandler;
use crate::source::{SharedSource, TileCommand, TileReply, TileSource};
use crate::tile::{Slab, Tile};

/// Width of one allocator row in a shared storage.
const STORAGE_ROW_SPAN: i32 = 1 << 24;

/// Packs buffer windows into a shared storage's index space.
///
/// Regions are padded up to whole tiles plus one spare tile per axis, so
/// neighboring allocations never share a tile.
struct RegionAllocator {
    x_used: i32,
    y_used: i32,
    row_height: i32,
}

impl RegionAllocator {
    fn new() -> Self {
        Self {
            x_used: 0,
            y_used: 0,
            row_height: 0,
        }
    }

    fn allocate(&mut self, extent: &Rect, tile_width: i32, tile_height: i32) -> (i32, i32) {
        let width = extent.width.max(1);
        let height = extent.height.max(1);
        let needed_w = ((width - 1) / tile_width + 2) * tile_width;
        let needed_h = ((height - 1) / tile_height + 2) * tile_height;

        if self.x_used + needed_w > STORAGE_ROW_SPAN {
            self.y_used += self.row_height;
            self.x_used = 0;
            self.row_height = 0;
        }

        let shift = (self.x_used - extent.x, self.y_used - extent.y);
        self.x_used += needed_w;
        if self.row_height < needed_h {
            self.row_height = needed_h;
        }
        shift
    }
}

pub struct TileStorage {
    tile_width: i32,
    tile_height: i32,
    tile_size: usize,
    format: PixelFormat,
    backend: Arc<dyn TileBackend>,
    head: SharedSource,
    cache: Arc<CacheHandler>,
    hot_tile: Mutex<Option<Tile>>,
    seen_zoom: AtomicI32,
    store_lock: Mutex<()>,
    alloc: Mutex<RegionAllocator>,
}

impl TileStorage {
    /// Builds the handler chain over `backend`.
    pub fn new(backend: Arc<dyn TileBackend>) -> Arc<TileStorage> {
        let tile_width = backend.tile_width();
        let tile_height = backend.tile_height();
        let tile_size = backend.tile_size();
        let format = backend.format();
        let trace = config::get().trace_tile_ops;

        Arc::new_cyclic(|weak: &Weak<TileStorage>| {
            let terminal: SharedSource = if trace {
                Arc::new(LogHandler::new(backend.clone() as SharedSource))
            } else {
                backend.clone() as SharedSource
            };

            let cache = Arc::new(CacheHandler::new());
            cache.set_storage(weak.clone());

            let empty = Arc::new(EmptyHandler::new(tile_size, Arc::clone(&cache)));
            empty.set_inner(terminal);

            let zoom = Arc::new(ZoomHandler::new(
                tile_width,
                tile_height,
                tile_size,
                format,
                Arc::clone(&cache),
            ));
            zoom.set_storage(weak.clone());
            zoom.set_inner(empty as SharedSource);

            cache.set_inner(Arc::clone(&zoom) as SharedSource);

            TileStorage {
                tile_width,
                tile_height,
                tile_size,
                format,
                backend,
                head: Arc::clone(&cache) as SharedSource,
                cache,
                hot_tile: Mutex::new(None),
                seen_zoom: AtomicI32::new(0),
                store_lock: Mutex::new(()),
                alloc: Mutex::new(RegionAllocator::new()),
            }
        })
    }

    /// Tile width in pixels.
    #[inline]
    pub fn tile_width(&self) -> i32 {
        self.tile_width
    }

    /// Tile height in pixels.
    #[inline]
    pub fn tile_height(&self) -> i32 {
        self.tile_height
    }

    /// Slab size of one tile in bytes.
    #[inline]
    pub fn tile_size(&self) -> usize {
        self.tile_size
    }

    /// Native pixel format.
    #[inline]
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// The terminal backend.
    pub fn backend(&self) -> &Arc<dyn TileBackend> {
        &self.backend
    }

    /// The cache link (hot paths bypass command dispatch through this).
    pub(crate) fn cache(&self) -> &Arc<CacheHandler> {
        &self.cache
    }

    /// Returns the hot tile if it covers level-0 tile (tx, ty).
    pub(crate) fn hot_tile(&self, tx: i32, ty: i32) -> Option<Tile> {
        let guard = self.hot_tile.lock().unwrap();
        match guard.as_ref() {
            Some(tile) if tile.coords() == (tx, ty, 0) => Some(tile.clone()),
            _ => None,
        }
    }

    pub(crate) fn set_hot_tile(&self, tile: Tile) {
        *self.hot_tile.lock().unwrap() = Some(tile);
    }

    /// Drops the hot tile shortcut.
    pub fn drop_hot_tile(&self) {
        *self.hot_tile.lock().unwrap() = None;
    }

    pub(crate) fn drop_hot_tile_if(&self, tile: &Tile) {
        let mut guard = self.hot_tile.lock().unwrap();
        if guard.as_ref().is_some_and(|hot| hot.same(tile)) {
            *guard = None;
        }
    }

    /// Deepest mipmap level ever synthesized for this storage.
    #[inline]
    pub fn seen_zoom(&self) -> i32 {
        self.seen_zoom.load(Ordering::Relaxed)
    }

    pub(crate) fn note_zoom(&self, z: i32) {
        self.seen_zoom.fetch_max(z, Ordering::Relaxed);
    }

    /// Invalidates the mipmap pyramid above level-0 tile (x, y).
    pub(crate) fn void_pyramid(&self, x: i32, y: i32) {
        let seen = self.seen_zoom();
        for z in 1..=seen {
            self.head.void(x >> z, y >> z, z);
        }
    }

    /// Serialized write-through of one dirty tile.
    pub(crate) fn store_tile(&self, tile: &Tile) -> bool {
        let _guard = self.store_lock.lock().unwrap();
        if tile.is_stored() {
            return true;
        }
        let (x, y, z) = tile.coords();
        self.head.set_tile(x, y, z, tile.clone())
    }

    /// Terminal write-back for a tile dropping its last reference.
    ///
    /// Goes straight to the backend: the cache must not resurrect an entry
    /// for a tile that is mid-drop.
    pub(crate) fn write_back(&self, x: i32, y: i32, z: i32, slab: Arc<Slab>, size: usize) {
        let tile = Tile::for_write_back(slab, size, x, y, z);
        self.backend.command(TileCommand::Set(tile), x, y, z);
    }

    /// Hands out a disjoint, tile-aligned window for a buffer sharing this
    /// storage. Returns the buffer's shift.
    pub(crate) fn allocate_region(&self, extent: &Rect) -> (i32, i32) {
        self.alloc
            .lock()
            .unwrap()
            .allocate(extent, self.tile_width, self.tile_height)
    }
}

impl TileSource for TileStorage {
    fn command(&self, cmd: TileCommand, x: i32, y: i32, z: i32) -> TileReply {
        self.head.command(cmd, x, y, z)
    }
}

struct StorageCacheEntry {
    tile_width: i32,
    tile_height: i32,
    format: PixelFormat,
    ram: bool,
    storage: Arc<TileStorage>,
}

fn storage_cache() -> &'static Mutex<Vec<StorageCacheEntry>> {
    static CACHE: OnceLock<Mutex<Vec<StorageCacheEntry>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(Vec::new()))
}

/// Returns the process-wide storage for `(tile_width, tile_height, format,
/// ram-or-swap)`, creating and caching it on first use.
pub(crate) fn acquire_shared(
    tile_width: i32,
    tile_height: i32,
    format: PixelFormat,
) -> Arc<TileStorage> {
    let want_ram = config::swap_disabled();
    let mut cache = storage_cache().lock().unwrap();
    for entry in cache.iter() {
        if entry.tile_width == tile_width
            && entry.tile_height == tile_height
            && entry.format == format
            && entry.ram == want_ram
        {
            return Arc::clone(&entry.storage);
        }
    }

    let (backend, ram): (Arc<dyn TileBackend>, bool) = if want_ram {
        (
            Arc::new(RamBackend::new(
                tile_width,
                tile_height,
                format,
                Rect::infinite_plane(),
            )),
            true,
        )
    } else {
        match config::next_swap_path()
            .ok_or(())
            .and_then(|path| FileBackend::create(path, tile_width, tile_height, format).map_err(|e| {
                warn!("swap backend creation failed, falling back to RAM: {e}");
            })) {
            Ok(file) => (Arc::new(file), false),
            Err(()) => (
                Arc::new(RamBackend::new(
                    tile_width,
                    tile_height,
                    format,
                    Rect::infinite_plane(),
                )),
                true,
            ),
        }
    };

    let storage = TileStorage::new(backend);
    cache.push(StorageCacheEntry {
        tile_width,
        tile_height,
        format,
        ram,
        storage: Arc::clone(&storage),
    });
    storage
}

/// Destroys cached storages in FIFO order.
pub(crate) fn shutdown_storage_cache() {
    let drained: Vec<StorageCacheEntry> = {
        let mut cache = storage_cache().lock().unwrap();
        cache.drain(..).collect()
    };
    for entry in drained {
        entry.storage.drop_hot_tile();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ram_storage() -> Arc<TileStorage> {
        TileStorage::new(Arc::new(RamBackend::new(
            4,
            4,
            PixelFormat::Y_F32,
            Rect::infinite_plane(),
        )))
    }

    #[test]
    fn test_chain_serves_zero_tiles_for_misses() {
        let s = ram_storage();
        let t = s.get_tile(10, 10, 0).expect("empty handler fills in");
        assert!(t.is_zero_tile());
        t.with_data(|d| assert!(d.iter().all(|&b| b == 0)));
        s.reinit();
    }

    #[test]
    fn test_write_then_read_through_chain() {
        let s = ram_storage();
        let t = s.get_tile(0, 0, 0).unwrap();
        t.lock();
        t.with_data_mut(|d| d.fill(0x11));
        t.unlock();

        let again = s.get_tile(0, 0, 0).unwrap();
        again.with_data(|d| assert!(d.iter().all(|&v| v == 0x11)));
        s.reinit();
    }

    #[test]
    fn test_mipmap_synthesis_and_seen_zoom() {
        let s = ram_storage();
        let t = s.get_tile(0, 0, 0).unwrap();
        t.lock();
        t.with_data_mut(|d| {
            for chunk in d.chunks_exact_mut(4) {
                chunk.copy_from_slice(&1.0f32.to_ne_bytes());
            }
        });
        t.unlock();

        assert_eq!(s.seen_zoom(), 0);
        let mip = s.get_tile(0, 0, 1).expect("synthesized mipmap");
        assert!(s.seen_zoom() >= 1);
        // tile (0,0,0) covers the top-left quadrant of the z=1 tile
        mip.with_data(|d| {
            let v = f32::from_ne_bytes(d[0..4].try_into().unwrap());
            assert_eq!(v, 1.0);
        });
        s.reinit();
    }

    #[test]
    fn test_region_allocator_disjoint_and_aligned() {
        let mut alloc = RegionAllocator::new();
        let extent = Rect::new(0, 0, 20, 20);
        let (ax, ay) = alloc.allocate(&extent, 4, 4);
        let (bx, by) = alloc.allocate(&extent, 4, 4);
        assert_eq!(ax % 4, 0);
        assert_eq!(ay % 4, 0);
        // second window starts beyond the padded first one
        assert!(bx >= ax + 20 || by > ay);
        assert_eq!((bx - ax) % 4, 0);
        assert_eq!(by, ay);
    }

    #[test]
    fn test_acquire_shared_reuses_by_key() {
        let a = acquire_shared(8, 8, PixelFormat::Y_U8);
        let b = acquire_shared(8, 8, PixelFormat::Y_U8);
        assert!(Arc::ptr_eq(&a, &b));
        let c = acquire_shared(8, 8, PixelFormat::Y_F32);
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
