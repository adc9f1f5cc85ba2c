//! # tilebuf-core
//!
//! Core types for tiled raster buffers.
//!
//! This crate provides the small foundation shared by the tilebuf
//! workspace:
//!
//! - [`Rect`] - Signed rectangles, including the infinite-plane sentinel
//! - [`PixelFormat`] - Component type × channel layout, with conversions
//! - [`Error`], [`Result`] - The failure surface of the workspace
//!
//! ## Crate Structure
//!
//! `tilebuf-core` has no internal dependencies; the buffer crate builds on
//! it:
//!
//! ```text
//! tilebuf-core (this crate)
//!    ^
//!    |
//!    +-- tilebuf (tiles, handler chain, backends, buffers, iterators)
//! ```
//!
//! ## Feature Flags
//!
//! - `serde` - Enable serialization for the plain-data types

#![warn(missing_docs)]

pub mod error;
pub mod format;
pub mod rect;

// Re-exports for convenience
pub use error::{Error, Result};
pub use format::{
    convert, decode_pixel, encode_pixel, luminance_rec709, BaseType, Channels, PixelFormat,
    REC709_LUMA,
};
pub use rect::Rect;
