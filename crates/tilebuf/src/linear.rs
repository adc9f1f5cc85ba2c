//! Linear buffers and linear views.
//!
//! A **linear buffer** is an ordinary buffer whose storage holds the whole
//! extent in a single tile, so its pixels are one contiguous row-major
//! slab. [`Buffer::linear_new_from_data`] goes further and adopts
//! caller-provided memory as that slab, with an optional release callback
//! that runs when the last reference to the slab drops.
//!
//! A **linear view** ([`LinearView`]) is the complementary read/write
//! window: it materializes any buffer region as one contiguous array and
//! scatters it back when closed (or dropped). Only one view may be open
//! on a buffer at a time; a second open is refused with a log entry.

use std::sync::Arc;

use tracing::warn;

use tilebuf_core::{PixelFormat, Rect};

use crate::backend::RamBackend;
use crate::buffer::{AbyssPolicy, Buffer};
use crate::tile::{ReleaseFn, Tile};

/// A contiguous read/write window over a buffer region.
///
/// Dropping the view writes the pixels back; [`close`](LinearView::close)
/// does the same eagerly.
pub struct LinearView {
    buffer: Buffer,
    extent: Rect,
    format: PixelFormat,
    rowstride: usize,
    data: Vec<u8>,
}

impl LinearView {
    /// The window's rectangle.
    #[inline]
    pub fn extent(&self) -> Rect {
        self.extent
    }

    /// Bytes per row.
    #[inline]
    pub fn rowstride(&self) -> usize {
        self.rowstride
    }

    /// The pixels, row-major.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The pixels, row-major, mutable.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Writes the window back into the buffer.
    pub fn close(self) {}
}

impl Drop for LinearView {
    fn drop(&mut self) {
        self.buffer.set(
            Some(&self.extent),
            0,
            Some(self.format),
            &self.data,
            self.rowstride,
        );
        *self.buffer.inner.linear_open.lock().unwrap() = false;
    }
}

impl Buffer {
    /// Creates a buffer whose storage keeps the whole extent in one tile.
    pub fn linear_new(extent: Rect, format: PixelFormat) -> Buffer {
        let tile_width = extent.width.max(1);
        let tile_height = extent.height.max(1);
        let backend = Arc::new(RamBackend::new(tile_width, tile_height, format, extent));
        Buffer::new_for_backend_shifted(extent, backend, -extent.x, -extent.y)
    }

    /// Creates a linear buffer over caller-provided pixel memory.
    ///
    /// `rowstride` is in bytes; 0 means tightly packed. The release
    /// callback (if any) runs exactly once, when the last tile sharing the
    /// memory is dropped. Ill-sized data is adjusted with a warning.
    pub fn linear_new_from_data(
        mut data: Vec<u8>,
        format: PixelFormat,
        extent: Rect,
        rowstride: usize,
        release: Option<ReleaseFn>,
    ) -> Buffer {
        let bpp = format.bytes_per_pixel();
        let rowstride_px = if rowstride == 0 {
            extent.width.max(1)
        } else {
            (rowstride / bpp) as i32
        };
        let tile_height = extent.height.max(1);
        let expected = rowstride_px as usize * tile_height as usize * bpp;
        if data.len() != expected {
            warn!(
                "linear data is {} bytes, expected {}; adjusting",
                data.len(),
                expected
            );
            data.resize(expected, 0);
        }

        let backend = Arc::new(RamBackend::new(rowstride_px, tile_height, format, extent));
        let buffer = Buffer::new_for_backend_shifted(extent, backend, -extent.x, -extent.y);

        let tile = match release {
            Some(release) => Tile::from_vec_with_release(data, release),
            None => Tile::from_vec(data),
        };
        tile.set_storage(Arc::downgrade(buffer.storage()));
        buffer.storage().cache().insert(&tile, 0, 0, 0);
        buffer
    }

    /// Opens a contiguous view over `extent` (default: the whole buffer)
    /// in `format` (default: the soft format).
    ///
    /// Returns `None` while another view is open on this buffer.
    pub fn linear_open(
        &self,
        extent: Option<&Rect>,
        format: Option<PixelFormat>,
    ) -> Option<LinearView> {
        {
            let mut open = self.inner.linear_open.lock().unwrap();
            if *open {
                warn!("a linear view is already open on this buffer");
                return None;
            }
            *open = true;
        }

        let extent = extent.copied().unwrap_or_else(|| self.extent());
        let format = format.unwrap_or_else(|| self.format());
        let rowstride = extent.width.max(0) as usize * format.bytes_per_pixel();
        let mut data = vec![0u8; rowstride * extent.height.max(0) as usize];
        self.get(&extent, 1.0, Some(format), &mut data, rowstride, AbyssPolicy::None);

        Some(LinearView {
            buffer: self.clone(),
            extent,
            format,
            rowstride,
            data,
        })
    }
}
