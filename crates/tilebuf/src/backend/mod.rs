//! Terminal tile backends.
//!
//! A backend is the end of a storage chain: it produces, stores and voids
//! tiles by their (x, y, z) indices, and owns the tile geometry and pixel
//! format of its storage. Backends must answer `GET`, `SET`, `EXIST` and
//! `VOID`; everything else may be ignored.
//!
//! Variants:
//! - [`RamBackend`]: heap-backed, tiles shared copy-on-write
//! - [`FileBackend`]: one swap file with header, Z-order index, payloads
//! - [`DirBackend`]: one file per tile under a directory

pub mod dir;
pub mod file;
pub mod ram;

use std::path::Path;

use tilebuf_core::{PixelFormat, Rect};

use crate::source::TileSource;

pub use dir::DirBackend;
pub use file::FileBackend;
pub use ram::RamBackend;

/// Terminal storage for a tile chain.
///
/// The geometry invariant holds for every backend:
/// `tile_width * tile_height * bytes_per_pixel(format) == tile_size`.
pub trait TileBackend: TileSource {
    /// Tile width in pixels.
    fn tile_width(&self) -> i32;

    /// Tile height in pixels.
    fn tile_height(&self) -> i32;

    /// Native pixel format of stored tiles.
    fn format(&self) -> PixelFormat;

    /// Slab size of one tile in bytes.
    fn tile_size(&self) -> usize {
        self.tile_width() as usize * self.tile_height() as usize
            * self.format().bytes_per_pixel()
    }

    /// The extent this backend was created with (or read from its header).
    ///
    /// Backends that do not constrain their extent report the infinite
    /// plane.
    fn extent(&self) -> Rect;

    /// Records a new extent; persisted into the header on the next
    /// [`sync_header`](Self::sync_header) for backends that carry one.
    fn set_extent(&self, extent: Rect);

    /// On-disk location, for file-backed variants.
    fn path(&self) -> Option<&Path> {
        None
    }

    /// Rewrites the on-disk header, for backends that carry one.
    fn sync_header(&self) {}
}
