//! Buffers: windowed views over tile storages.
//!
//! A [`Buffer`] does not own pixels; it frames a [`TileStorage`] with:
//!
//! - an **extent**: the rectangle exposed to users (possibly the infinite
//!   plane for unconstrained backends),
//! - an **abyss**: the sub-rectangle where real data lives; reads outside
//!   it are resolved by the [`AbyssPolicy`] of the read call, writes
//!   outside it are dropped,
//! - a **shift**: the offset from buffer coordinates to storage
//!   coordinates; sub-buffers accumulate their parents' shifts,
//! - a **soft format**: a view-only pixel format override that must match
//!   the storage's native format in bytes per pixel.
//!
//! Buffers created from a bare format share a process-cached storage and
//! receive a disjoint window in it; buffers over an explicit backend get a
//! storage of their own. Sub-buffers borrow the parent's storage and
//! compose shift and abyss with it.

use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::warn;

use tilebuf_core::{convert, encode_pixel, PixelFormat, Rect};

use crate::access;
use crate::backend::{FileBackend, TileBackend};
use crate::config;
use crate::iter::{Access, BufferIterator};
use crate::sampler::{make_sampler, CachedSampler, Matrix2, SamplerKind};
use crate::source::TileSource;
use crate::storage::{acquire_shared, TileStorage};
use crate::tile::{tile_index, tile_offset, Tile};

/// How reads outside the abyss are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AbyssPolicy {
    /// Zeroed bytes in the destination format.
    #[default]
    None,
    /// The value at the nearest pixel inside the abyss.
    Clamp,
    /// The abyss tiles the plane: coordinates wrap with the non-negative
    /// remainder.
    Loop,
    /// Opaque black, converted from RGBA float.
    Black,
    /// Opaque white, converted from RGBA float.
    White,
}

static ALLOCATED: AtomicI64 = AtomicI64::new(0);
static DEALLOCATED: AtomicI64 = AtomicI64::new(0);

pub(crate) struct BufferInner {
    storage: Arc<TileStorage>,
    parent: Option<Buffer>,
    extent: Mutex<Rect>,
    abyss: Rect,
    shift_x: i32,
    shift_y: i32,
    format: PixelFormat,
    soft_format: Mutex<PixelFormat>,
    sampler: Mutex<Option<CachedSampler>>,
    pub(crate) linear_open: Mutex<bool>,
    lock_count: AtomicI32,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        DEALLOCATED.fetch_add(1, Ordering::Relaxed);
    }
}

/// A windowed view over a tile storage. Clones share the view.
#[derive(Clone)]
pub struct Buffer {
    pub(crate) inner: Arc<BufferInner>,
}

impl Buffer {
    fn build(
        storage: Arc<TileStorage>,
        parent: Option<Buffer>,
        extent: Rect,
        abyss: Rect,
        shift_x: i32,
        shift_y: i32,
    ) -> Buffer {
        ALLOCATED.fetch_add(1, Ordering::Relaxed);
        let format = storage.format();
        Buffer {
            inner: Arc::new(BufferInner {
                storage,
                parent,
                extent: Mutex::new(extent),
                abyss,
                shift_x,
                shift_y,
                format,
                soft_format: Mutex::new(format),
                sampler: Mutex::new(None),
                linear_open: Mutex::new(false),
                lock_count: AtomicI32::new(0),
            }),
        }
    }

    /// Creates a RAM-backed buffer (swap-backed if the config names a swap
    /// directory). The storage is shared process-wide by geometry and
    /// format; this buffer receives its own disjoint window in it.
    pub fn new(extent: Rect, format: PixelFormat) -> Buffer {
        let cfg = config::get();
        let storage = acquire_shared(cfg.tile_width, cfg.tile_height, format);
        let (shift_x, shift_y) = storage.allocate_region(&extent);
        Self::build(storage, None, extent, extent, shift_x, shift_y)
    }

    /// Creates a buffer over an explicit backend, with a storage of its
    /// own. A missing extent is inherited from the backend, or becomes the
    /// infinite plane when the backend does not constrain one.
    pub fn new_for_backend(extent: Option<Rect>, backend: Arc<dyn TileBackend>) -> Buffer {
        let extent = extent.unwrap_or_else(|| {
            let e = backend.extent();
            if e.is_empty() {
                Rect::infinite_plane()
            } else {
                e
            }
        });
        let storage = TileStorage::new(backend);
        Self::build(storage, None, extent, extent, 0, 0)
    }

    /// Opens an existing buffer file, inheriting extent and format from
    /// its header.
    pub fn open(path: impl AsRef<std::path::Path>) -> tilebuf_core::Result<Buffer> {
        let backend = Arc::new(FileBackend::open(path)?);
        Ok(Self::new_for_backend(None, backend))
    }

    /// Dedicated-storage buffer with an explicit shift; linear buffers use
    /// this to pin their extent onto tile (0, 0).
    pub(crate) fn new_for_backend_shifted(
        extent: Rect,
        backend: Arc<dyn TileBackend>,
        shift_x: i32,
        shift_y: i32,
    ) -> Buffer {
        let storage = TileStorage::new(backend);
        Self::build(storage, None, extent, extent, shift_x, shift_y)
    }

    /// Creates a sub-buffer: a window over `window` (in this buffer's
    /// coordinates) with its own origin at (0, 0).
    ///
    /// The window's origin becomes the child's shift, so
    /// `sub.get_pixel(q) == parent.get_pixel(q + window.origin)`. The
    /// child's abyss is the parent's abyss seen through that shift;
    /// nested sub-buffers accumulate shifts and narrow the abyss.
    pub fn create_sub_buffer(&self, window: Rect) -> Buffer {
        self.create_sub_buffer_shifted(window, 0, 0)
    }

    /// Creates a sub-buffer with an extra shift on top of the window
    /// origin.
    pub fn create_sub_buffer_shifted(&self, window: Rect, shift_x: i32, shift_y: i32) -> Buffer {
        let own_x = window.x + shift_x;
        let own_y = window.y + shift_y;
        let extent = Rect::new(0, 0, window.width, window.height);
        let abyss = self.abyss().translate(-own_x, -own_y);
        Self::build(
            Arc::clone(self.storage()),
            Some(self.clone()),
            extent,
            abyss,
            own_x + self.inner.shift_x,
            own_y + self.inner.shift_y,
        )
    }

    /// Duplicates this buffer: a fresh buffer of the same extent and
    /// native format, with the pixels copied tile-plane COW where
    /// possible.
    pub fn dup(&self) -> Buffer {
        let extent = self.extent();
        let copy = Buffer::new(extent, self.inner.format);
        Buffer::copy(self, Some(&extent), &copy, Some(&extent));
        copy
    }

    /// The user-visible rectangle.
    pub fn extent(&self) -> Rect {
        *self.inner.extent.lock().unwrap()
    }

    /// Replaces the extent.
    ///
    /// Succeeds only on top-level buffers: a sub-buffer's window is
    /// constrained by its parent chain and is refused with a log entry.
    pub fn set_extent(&self, extent: Rect) -> bool {
        if self.inner.parent.is_some() {
            warn!("refusing to change the extent of a sub-buffer");
            return false;
        }
        *self.inner.extent.lock().unwrap() = extent;
        self.storage().backend().set_extent(extent);
        true
    }

    /// The rectangle where real data lives.
    #[inline]
    pub fn abyss(&self) -> Rect {
        self.inner.abyss
    }

    /// Width of the extent.
    #[inline]
    pub fn width(&self) -> i32 {
        self.extent().width
    }

    /// Height of the extent.
    #[inline]
    pub fn height(&self) -> i32 {
        self.extent().height
    }

    /// The soft (view) pixel format.
    pub fn format(&self) -> PixelFormat {
        *self.inner.soft_format.lock().unwrap()
    }

    /// The storage's native pixel format.
    #[inline]
    pub fn native_format(&self) -> PixelFormat {
        self.inner.format
    }

    /// Overrides the soft format. The override must match the native
    /// format in bytes per pixel; a mismatch is refused with a log entry
    /// and the previous soft format stays in effect.
    pub fn set_format(&self, format: PixelFormat) -> bool {
        if format.bytes_per_pixel() != self.inner.format.bytes_per_pixel() {
            warn!(
                "soft format {} rejected: {} bytes/px, native {} has {}",
                format,
                format.bytes_per_pixel(),
                self.inner.format,
                self.inner.format.bytes_per_pixel()
            );
            return false;
        }
        *self.inner.soft_format.lock().unwrap() = format;
        true
    }

    #[inline]
    pub(crate) fn shift(&self) -> (i32, i32) {
        (self.inner.shift_x, self.inner.shift_y)
    }

    /// The tile storage servicing this buffer.
    pub fn storage(&self) -> &Arc<TileStorage> {
        &self.inner.storage
    }

    /// The stable on-disk name of a file-backed buffer, if any.
    pub fn path(&self) -> Option<std::path::PathBuf> {
        self.storage().backend().path().map(|p| p.to_path_buf())
    }

    /// Fetches a tile through the storage chain, stamping coordinates and
    /// the storage back-pointer so write-back can find its way home.
    pub(crate) fn get_tile(&self, tx: i32, ty: i32, z: i32) -> Option<Tile> {
        let tile = self.storage().get_tile(tx, ty, z)?;
        if !tile.has_storage() {
            tile.set_storage(Arc::downgrade(self.storage()));
        }
        tile.set_coords(tx, ty, z);
        Some(tile)
    }

    /// Writes a rectangle of pixels from a linear user buffer.
    ///
    /// `format` defaults to the soft format; `rowstride` 0 means computed
    /// from the width. `level` addresses a mipmap level (the rectangle is
    /// given in level-0 coordinates and scaled down internally).
    pub fn set(
        &self,
        rect: Option<&Rect>,
        level: i32,
        format: Option<PixelFormat>,
        src: &[u8],
        rowstride: usize,
    ) {
        let format = format.unwrap_or_else(|| self.format());
        access::iterate_write(self, rect, src, rowstride, format, level);
    }

    /// Reads a rectangle of pixels into a linear user buffer, optionally
    /// scaled. See the scaled-get rules in [`access`].
    pub fn get(
        &self,
        rect: &Rect,
        scale: f64,
        format: Option<PixelFormat>,
        dst: &mut [u8],
        rowstride: usize,
        policy: AbyssPolicy,
    ) {
        let format = format.unwrap_or_else(|| self.format());
        access::buffer_get(self, rect, scale, format, dst, rowstride, policy);
    }

    /// Single-pixel read in the given format.
    pub fn get_pixel(&self, x: i32, y: i32, format: Option<PixelFormat>, dst: &mut [u8], policy: AbyssPolicy) {
        let format = format.unwrap_or_else(|| self.format());
        access::get_pixel(self, x, y, format, dst, policy);
    }

    /// Single-pixel write in the given format. Writes outside the abyss
    /// are dropped.
    pub fn set_pixel(&self, x: i32, y: i32, format: Option<PixelFormat>, src: &[u8]) {
        let format = format.unwrap_or_else(|| self.format());
        access::set_pixel(self, x, y, format, src);
    }

    /// Samples at a (possibly fractional) position through a sampler.
    ///
    /// One sampler instance is cached across calls while `format` and
    /// `kind` are stable.
    pub fn sample(
        &self,
        x: f64,
        y: f64,
        scale: Option<&Matrix2>,
        dst: &mut [u8],
        format: Option<PixelFormat>,
        kind: SamplerKind,
        policy: AbyssPolicy,
    ) {
        let format = format.unwrap_or_else(|| self.format());
        if kind == SamplerKind::Nearest && format == self.format() {
            access::get_pixel(self, x.floor() as i32, y.floor() as i32, format, dst, policy);
            return;
        }
        let mut cached = self.inner.sampler.lock().unwrap();
        let rebuild = match cached.as_ref() {
            Some(c) => c.kind != kind || c.format != format,
            None => true,
        };
        if rebuild {
            *cached = Some(make_sampler(kind, format));
        }
        cached.as_ref().unwrap().sampler.sample(self, x, y, scale, dst, policy);
    }

    /// Drops the cached sampler instance.
    pub fn sample_cleanup(&self) {
        *self.inner.sampler.lock().unwrap() = None;
    }

    /// Copies a rectangle between buffers.
    ///
    /// When both buffers share native format and tile geometry and the
    /// shifted rectangles align modulo the tile size, the interior is
    /// copied as a COW tile plane (shared slabs, no pixel movement) and
    /// only the four border bands go through the converting fallback.
    pub fn copy(src: &Buffer, src_rect: Option<&Rect>, dst: &Buffer, dst_rect: Option<&Rect>) {
        let src_rect = src_rect.copied().unwrap_or_else(|| src.extent());
        if src_rect.is_empty() {
            return;
        }
        let mut dest = dst_rect.copied().unwrap_or(src_rect);
        dest.width = src_rect.width;
        dest.height = src_rect.height;

        let tile_width = dst.storage().tile_width();
        let tile_height = dst.storage().tile_height();
        let (src_sx, src_sy) = src.shift();
        let (dst_sx, dst_sy) = dst.shift();

        let aligned = src.inner.format == dst.inner.format
            && src.format() == dst.format()
            && src.storage().tile_width() == tile_width
            && src.storage().tile_height() == tile_height
            && ((src_rect.x + src_sx) - (dest.x + dst_sx)).rem_euclid(tile_width) == 0
            && ((src_rect.y + src_sy) - (dest.y + dst_sy)).rem_euclid(tile_height) == 0;

        if !aligned {
            Self::copy_fallback(src, &src_rect, dst, &dest);
            return;
        }

        // trim to the tile grid of the destination storage
        let mut cow = dest;
        while tile_offset(cow.x + dst_sx, tile_width) != 0 && cow.width > 0 {
            cow.x += 1;
            cow.width -= 1;
        }
        while tile_offset(cow.y + dst_sy, tile_height) != 0 && cow.height > 0 {
            cow.y += 1;
            cow.height -= 1;
        }
        cow.width -= cow.width.rem_euclid(tile_width);
        cow.height -= cow.height.rem_euclid(tile_height);

        if cow.width <= 0 || cow.height <= 0 {
            Self::copy_fallback(src, &src_rect, dst, &dest);
            return;
        }

        dst.storage().drop_hot_tile();

        let mut dst_y = cow.y + dst_sy;
        while dst_y < cow.y + dst_sy + cow.height {
            let mut dst_x = cow.x + dst_sx;
            while dst_x < cow.x + dst_sx + cow.width {
                let src_x = dst_x - dst_sx - (dest.x - src_rect.x) + src_sx;
                let src_y = dst_y - dst_sy - (dest.y - src_rect.y) + src_sy;
                let stx = tile_index(src_x, tile_width);
                let sty = tile_index(src_y, tile_height);
                let dtx = tile_index(dst_x, tile_width);
                let dty = tile_index(dst_y, tile_height);

                match src.get_tile(stx, sty, 0) {
                    Some(src_tile) => {
                        let dst_tile = src_tile.dup();
                        dst_tile.set_storage(Arc::downgrade(dst.storage()));
                        dst.storage().set_tile(dtx, dty, 0, dst_tile);
                    }
                    None => warn!("missing tile ({stx}, {sty}) during copy, skipping"),
                }
                dst_x += tile_width;
            }
            dst_y += tile_height;
        }

        // the four border bands around the COW interior
        let top = Rect::new(dest.x, dest.y, dest.width, cow.y - dest.y);
        let bottom = Rect::new(
            dest.x,
            cow.bottom(),
            dest.width,
            dest.bottom() - cow.bottom(),
        );
        let left = Rect::new(dest.x, cow.y, cow.x - dest.x, cow.height);
        let right = Rect::new(cow.right(), cow.y, dest.right() - cow.right(), cow.height);

        for band in [top, bottom, left, right] {
            if band.is_empty() {
                continue;
            }
            let src_band = Rect::new(
                src_rect.x + (band.x - dest.x),
                src_rect.y + (band.y - dest.y),
                band.width,
                band.height,
            );
            Self::copy_fallback(src, &src_band, dst, &band);
        }
    }

    /// Iterator-based converting copy.
    fn copy_fallback(src: &Buffer, src_rect: &Rect, dst: &Buffer, dst_rect: &Rect) {
        let src_fmt = src.format();
        let dst_fmt = dst.format();
        let mut iter = BufferIterator::new(
            dst.clone(),
            *dst_rect,
            dst_fmt,
            Access::Write,
            AbyssPolicy::None,
        );
        let read = iter.add(
            src.clone(),
            *src_rect,
            src_fmt,
            Access::Read,
            AbyssPolicy::None,
        );
        while iter.next() {
            let length = iter.length();
            let (dst_data, src_data) = iter.data_pair(0, read);
            convert(src_fmt, dst_fmt, src_data, dst_data, length);
        }
    }

    /// Zeroes a rectangle (iterator path; fully voided tiles are a future
    /// optimization).
    pub fn clear(&self, rect: Option<&Rect>) {
        let rect = rect.copied().unwrap_or_else(|| self.extent());
        if rect.is_empty() {
            return;
        }
        let mut iter = BufferIterator::new(
            self.clone(),
            rect,
            self.format(),
            Access::Write,
            AbyssPolicy::None,
        );
        while iter.next() {
            iter.data_mut(0).fill(0);
        }
    }

    /// Fills a rectangle with one color, given as RGBA float.
    pub fn set_color(&self, rect: Option<&Rect>, color: [f32; 4]) {
        let rect = rect.copied().unwrap_or_else(|| self.extent());
        if rect.is_empty() {
            return;
        }
        let format = self.format();
        let bpp = format.bytes_per_pixel();
        let mut pixel = vec![0u8; bpp];
        encode_pixel(format, color, &mut pixel);

        let mut iter =
            BufferIterator::new(self.clone(), rect, format, Access::Write, AbyssPolicy::None);
        while iter.next() {
            for chunk in iter.data_mut(0).chunks_exact_mut(bpp) {
                chunk.copy_from_slice(&pixel);
            }
        }
    }

    /// Tiles `pattern` across the buffer, wrapping the offsets.
    ///
    /// The offsets alone position the pattern; the fill covers the whole
    /// extent regardless of `rect`, and copies are clipped by the abyss.
    pub fn set_pattern(
        &self,
        rect: Option<&Rect>,
        pattern: &Buffer,
        x_offset: f64,
        y_offset: f64,
    ) {
        // TODO: constrain the fill to `rect`
        let _ = rect;

        let pat_width = pattern.width();
        let pat_height = pattern.height();
        if pat_width <= 0 || pat_height <= 0 {
            return;
        }
        let width = self.width();
        let height = self.height();

        let mut x_offset = x_offset;
        let mut y_offset = y_offset;
        while x_offset < 0.0 {
            x_offset += pat_width as f64;
        }
        while y_offset < 0.0 {
            y_offset += pat_height as f64;
        }
        let x_offset = x_offset % pat_width as f64;
        let y_offset = y_offset % pat_height as f64;

        let src_rect = Rect::new(0, 0, pat_width, pat_height);
        let cols = width / pat_width + 1;
        let rows = height / pat_height + 1;

        for row in 0..=rows + 1 {
            for col in 0..=cols + 1 {
                let dst_rect = Rect::new(
                    x_offset as i32 + (col - 1) * pat_width,
                    y_offset as i32 + (row - 1) * pat_height,
                    pat_width,
                    pat_height,
                );
                Buffer::copy(pattern, Some(&src_rect), self, Some(&dst_rect));
            }
        }
    }

    /// Drops the hot tile, refreshes the backend header from the extent,
    /// and pushes a `FLUSH` down the chain.
    pub fn flush(&self) {
        self.storage().drop_hot_tile();
        self.storage().backend().set_extent(self.extent());
        self.storage().flush();
    }

    /// Cooperative lock counter for cross-process file backends.
    pub fn lock(&self) {
        self.inner.lock_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Releases the cooperative lock.
    pub fn unlock(&self) {
        let was = self.inner.lock_count.fetch_sub(1, Ordering::Relaxed);
        if was <= 0 {
            warn!("buffer unlock without matching lock");
        }
    }

    /// Buffers alive minus buffers dropped, for leak tests.
    pub fn leaks() -> i64 {
        ALLOCATED.load(Ordering::Relaxed) - DEALLOCATED.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("extent", &self.extent())
            .field("abyss", &self.abyss())
            .field("shift", &(self.inner.shift_x, self.inner.shift_y))
            .field("format", &self.format())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_buffer_basics() {
        let b = Buffer::new(Rect::new(0, 0, 20, 20), PixelFormat::Y_F32);
        assert_eq!(b.extent(), Rect::new(0, 0, 20, 20));
        assert_eq!(b.abyss(), b.extent());
        assert_eq!(b.format(), PixelFormat::Y_F32);
        assert_eq!(b.native_format(), PixelFormat::Y_F32);
    }

    #[test]
    fn test_soft_format_bpp_guard() {
        let b = Buffer::new(Rect::new(0, 0, 8, 8), PixelFormat::RGBA_U8);
        // same width: 4 bytes
        assert!(b.set_format(PixelFormat::Y_F32));
        assert_eq!(b.format(), PixelFormat::Y_F32);
        // different width: refused, previous soft format kept
        assert!(!b.set_format(PixelFormat::Y_U8));
        assert_eq!(b.format(), PixelFormat::Y_F32);
    }

    #[test]
    fn test_sub_buffer_window_semantics() {
        let parent = Buffer::new(Rect::new(0, 0, 20, 20), PixelFormat::Y_F32);
        let child = parent.create_sub_buffer(Rect::new(5, 5, 10, 10));
        assert_eq!(child.extent(), Rect::new(0, 0, 10, 10));
        // the parent's abyss, seen through the window origin
        assert_eq!(child.abyss(), Rect::new(-5, -5, 20, 20));

        parent.set_pixel(7, 8, None, &2.0f32.to_ne_bytes());
        let mut out = [0u8; 4];
        child.get_pixel(2, 3, None, &mut out, AbyssPolicy::None);
        assert_eq!(f32::from_ne_bytes(out), 2.0);

        child.set_pixel(0, 0, None, &3.0f32.to_ne_bytes());
        let mut out = [0u8; 4];
        parent.get_pixel(5, 5, None, &mut out, AbyssPolicy::None);
        assert_eq!(f32::from_ne_bytes(out), 3.0);
    }

    #[test]
    fn test_sub_buffer_shift_accumulates() {
        let parent = Buffer::new(Rect::new(0, 0, 20, 20), PixelFormat::Y_F32);
        let (psx, psy) = parent.shift();
        let child = parent.create_sub_buffer_shifted(Rect::new(1, 2, 4, 4), 3, 7);
        assert_eq!(child.shift(), (psx + 4, psy + 9));
    }

    #[test]
    fn test_set_extent_refused_on_sub_buffer() {
        let parent = Buffer::new(Rect::new(0, 0, 16, 16), PixelFormat::Y_U8);
        let child = parent.create_sub_buffer(Rect::new(0, 0, 8, 8));
        assert!(!child.set_extent(Rect::new(0, 0, 4, 4)));
        assert!(parent.set_extent(Rect::new(0, 0, 32, 32)));
        assert_eq!(parent.extent(), Rect::new(0, 0, 32, 32));
    }

    #[test]
    fn test_two_buffers_do_not_alias() {
        let a = Buffer::new(Rect::new(0, 0, 10, 10), PixelFormat::Y_U8);
        let b = Buffer::new(Rect::new(0, 0, 10, 10), PixelFormat::Y_U8);
        a.set_pixel(0, 0, None, &[200]);
        let mut v = [0u8];
        b.get_pixel(0, 0, None, &mut v, AbyssPolicy::None);
        assert_eq!(v[0], 0);
        let mut v = [0u8];
        a.get_pixel(0, 0, None, &mut v, AbyssPolicy::None);
        assert_eq!(v[0], 200);
    }

    #[test]
    fn test_set_pattern_wraps_offsets_across_extent() {
        let pattern = Buffer::new(Rect::new(0, 0, 2, 2), PixelFormat::Y_F32);
        pattern.set_pixel(0, 0, None, &1.0f32.to_ne_bytes());
        pattern.set_pixel(1, 0, None, &2.0f32.to_ne_bytes());
        pattern.set_pixel(0, 1, None, &3.0f32.to_ne_bytes());
        pattern.set_pixel(1, 1, None, &4.0f32.to_ne_bytes());

        let read = |b: &Buffer, x: i32, y: i32| -> f32 {
            let mut out = [0u8; 4];
            b.get_pixel(x, y, None, &mut out, AbyssPolicy::None);
            f32::from_ne_bytes(out)
        };
        // offsets (3, -1) wrap to (1, 1) against the 2x2 pattern
        let expected = |x: i32, y: i32| -> f32 {
            let px = (x - 1).rem_euclid(2) as usize;
            let py = (y - 1).rem_euclid(2) as usize;
            [[1.0, 2.0], [3.0, 4.0]][py][px]
        };

        let buffer = Buffer::new(Rect::new(0, 0, 8, 8), PixelFormat::Y_F32);
        buffer.set_pattern(None, &pattern, 3.0, -1.0);
        for y in 0..8 {
            for x in 0..8 {
                assert_eq!(read(&buffer, x, y), expected(x, y), "at ({x}, {y})");
            }
        }

        // the rectangle argument does not constrain the fill
        let constrained = Buffer::new(Rect::new(0, 0, 8, 8), PixelFormat::Y_F32);
        constrained.set_pattern(Some(&Rect::new(2, 2, 3, 3)), &pattern, 3.0, -1.0);
        for y in 0..8 {
            for x in 0..8 {
                assert_eq!(read(&constrained, x, y), expected(x, y), "at ({x}, {y})");
            }
        }
    }
}
