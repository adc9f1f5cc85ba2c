//! # tilebuf
//!
//! Tiled raster buffers: a virtual, potentially unbounded 2D raster
//! backed by fixed-size tiles.
//!
//! The crate is organized as a storage chain under a windowed view:
//!
//! - [`Tile`] - Fixed-size pixel slabs, shared copy-on-write
//! - [`TileSource`] - The command protocol every chain node answers
//! - handlers - [`cache`](handler::cache) (process-wide MRU byte budget),
//!   [`zoom`](handler::zoom) (mipmap synthesis), [`empty`](handler::empty)
//!   (shared zero tile), [`log`](handler::log) (tracing)
//! - backends - [`RamBackend`], [`FileBackend`] (swap file),
//!   [`DirBackend`] (tile per file)
//! - [`TileStorage`] - Chain assembly and the storage identity cache
//! - [`Buffer`] - The user-facing view: extent, abyss, shift, soft format
//! - [`BufferIterator`] - Tile-aware multi-buffer scanline iteration
//! - [`io`] - The native save/load format
//!
//! ## Quick start
//!
//! ```rust
//! use tilebuf::{AbyssPolicy, Buffer};
//! use tilebuf_core::{PixelFormat, Rect};
//!
//! let buffer = Buffer::new(Rect::new(0, 0, 256, 256), PixelFormat::Y_F32);
//! buffer.set_pixel(10, 10, None, &1.0f32.to_ne_bytes());
//!
//! let mut out = [0u8; 4];
//! buffer.get_pixel(10, 10, None, &mut out, AbyssPolicy::None);
//! assert_eq!(f32::from_ne_bytes(out), 1.0);
//! ```
//!
//! ## Error model
//!
//! Pixel accessors never fail: reads outside the abyss resolve through
//! the [`AbyssPolicy`], missing tiles degrade to zeros with a log entry.
//! Only file opening and [`io`] return [`Result`](tilebuf_core::Result)s.

pub mod access;
pub mod backend;
pub mod buffer;
pub mod config;
pub mod handler;
pub mod io;
pub mod iter;
pub mod linear;
pub mod sampler;
pub mod source;
pub mod storage;
pub mod tile;

pub use backend::{DirBackend, FileBackend, RamBackend, TileBackend};
pub use buffer::{AbyssPolicy, Buffer};
pub use config::BufferConfig;
pub use io::{load, save};
pub use iter::{Access, BufferIterator};
pub use linear::LinearView;
pub use sampler::{Matrix2, Sampler, SamplerKind};
pub use source::{SharedSource, TileCommand, TileReply, TileSource};
pub use storage::TileStorage;
pub use tile::{tile_index, tile_offset, Tile};

// Re-export the core geometry and format types for convenience.
pub use tilebuf_core::{BaseType, Channels, PixelFormat, Rect};
