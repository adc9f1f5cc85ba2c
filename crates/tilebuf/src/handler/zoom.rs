//! Mipmap synthesis: level z tiles built from the four tiles below.
//!
//! A `GET` at z = 0 passes straight through. A `GET` at z > 0 first tries
//! the chain below; on a miss the handler fetches the four children at
//! `(2x+i, 2y+j, z-1)` **through itself**, so cached and previously
//! synthesized mipmaps short-circuit the recursion. Each present child is
//! downsampled into its quadrant of a fresh tile; absent quadrants are
//! zeroed. The result is registered in the cache before it is returned, so
//! subsequent reads hit.
//!
//! The downsample mode depends on the component type: floating-point and
//! 8-bit formats get a 2×2 box filter average, everything else top-left
//! nearest subsampling.

use std::sync::{Arc, OnceLock, Weak};

use half::f16;
use tilebuf_core::{BaseType, PixelFormat};

use crate::handler::cache::CacheHandler;
use crate::handler::InnerSource;
use crate::source::{SharedSource, TileCommand, TileReply, TileSource};
use crate::storage::TileStorage;
use crate::tile::Tile;

pub struct ZoomHandler {
    inner: InnerSource,
    cache: Arc<CacheHandler>,
    storage: OnceLock<Weak<TileStorage>>,
    tile_width: i32,
    tile_height: i32,
    tile_size: usize,
    format: PixelFormat,
}

impl ZoomHandler {
    pub(crate) fn new(
        tile_width: i32,
        tile_height: i32,
        tile_size: usize,
        format: PixelFormat,
        cache: Arc<CacheHandler>,
    ) -> Self {
        Self {
            inner: InnerSource::new(),
            cache,
            storage: OnceLock::new(),
            tile_width,
            tile_height,
            tile_size,
            format,
        }
    }

    pub(crate) fn set_inner(&self, source: SharedSource) {
        self.inner.set(source);
    }

    pub(crate) fn set_storage(&self, storage: Weak<TileStorage>) {
        let _ = self.storage.set(storage);
    }

    /// Child fetch for synthesis: cached tiles first, then the full
    /// recursive path through this handler.
    fn fetch_child(&self, x: i32, y: i32, z: i32) -> Option<Tile> {
        if let Some(tile) = self.cache.cached_tile(x, y, z) {
            return Some(tile);
        }
        self.command(TileCommand::Get, x, y, z).into_tile()
    }

    fn get(&self, x: i32, y: i32, z: i32) -> Option<Tile> {
        if z == 0 {
            return self.inner.forward(TileCommand::Get, x, y, z).into_tile();
        }

        if let Some(tile) = self.inner.forward(TileCommand::Get, x, y, z).into_tile() {
            return Some(tile);
        }

        if let Some(storage) = self.storage.get().and_then(Weak::upgrade) {
            storage.note_zoom(z);
        }

        let mut children: [[Option<Tile>; 2]; 2] = [[None, None], [None, None]];
        let mut any = false;
        for (i, column) in children.iter_mut().enumerate() {
            for (j, slot) in column.iter_mut().enumerate() {
                *slot = self.fetch_child(x * 2 + i as i32, y * 2 + j as i32, z - 1);
                any |= slot.is_some();
            }
        }
        if !any {
            return None;
        }

        let tile = Tile::new(self.tile_size);
        self.cache.insert(&tile, x, y, z);

        tile.lock();
        tile.with_data_mut(|dst| {
            for (i, column) in children.iter().enumerate() {
                for (j, slot) in column.iter().enumerate() {
                    match slot {
                        Some(child) => child.with_data(|src| {
                            downsample_quadrant(
                                dst,
                                src,
                                self.tile_width,
                                self.tile_height,
                                self.format,
                                i as i32,
                                j as i32,
                            );
                        }),
                        None => blank_quadrant(
                            dst,
                            self.tile_width,
                            self.tile_height,
                            self.format.bytes_per_pixel(),
                            i as i32,
                            j as i32,
                        ),
                    }
                }
            }
        });
        tile.unlock();

        Some(tile)
    }
}

impl TileSource for ZoomHandler {
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

/// Zeroes quadrant (i, j) of `dst`.
fn blank_quadrant(dst: &mut [u8], width: i32, height: i32, bpp: usize, i: i32, j: i32) {
    let w = width as usize;
    let h = height as usize;
    let rowstride = w * bpp;
    let bytes = w * bpp / 2;
    let mut start = j as usize * (h / 2) * rowstride + i as usize * rowstride / 2;
    for _ in 0..h / 2 {
        dst[start..start + bytes].fill(0);
        start += rowstride;
    }
}

/// Downsamples a full child tile into quadrant (i, j) of `dst`.
fn downsample_quadrant(
    dst: &mut [u8],
    src: &[u8],
    width: i32,
    height: i32,
    format: PixelFormat,
    i: i32,
    j: i32,
) {
    match format.base {
        BaseType::F32 => downsample_f32(dst, src, width, height, format, i, j),
        BaseType::F16 => downsample_f16(dst, src, width, height, format, i, j),
        BaseType::U8 => downsample_u8(dst, src, width, height, format, i, j),
        BaseType::U16 => downsample_nearest(dst, src, width, height, format, i, j),
    }
}

#[inline]
fn quadrant_origin(width: usize, height: usize, bpp: usize, i: i32, j: i32) -> usize {
    j as usize * (height / 2) * width * bpp + i as usize * (width / 2) * bpp
}

fn downsample_f32(
    dst: &mut [u8],
    src: &[u8],
    width: i32,
    height: i32,
    format: PixelFormat,
    i: i32,
    j: i32,
) {
    let w = width as usize;
    let h = height as usize;
    let comp = format.n_channels();
    let base = quadrant_origin(w, h, format.bytes_per_pixel(), i, j);

    let get = |buf: &[u8], idx: usize| -> f32 {
        f32::from_ne_bytes(buf[idx * 4..idx * 4 + 4].try_into().unwrap())
    };

    for y in 0..h / 2 {
        for x in 0..w / 2 {
            let s = (y * 2 * w + x * 2) * comp;
            for c in 0..comp {
                let sum = get(src, s + c)
                    + get(src, s + comp + c)
                    + get(src, s + w * comp + c)
                    + get(src, s + (w + 1) * comp + c);
                let d = base + (y * w + x) * comp * 4 + c * 4;
                dst[d..d + 4].copy_from_slice(&(sum / 4.0).to_ne_bytes());
            }
        }
    }
}

fn downsample_f16(
    dst: &mut [u8],
    src: &[u8],
    width: i32,
    height: i32,
    format: PixelFormat,
    i: i32,
    j: i32,
) {
    let w = width as usize;
    let h = height as usize;
    let comp = format.n_channels();
    let base = quadrant_origin(w, h, format.bytes_per_pixel(), i, j);

    let get = |buf: &[u8], idx: usize| -> f32 {
        f16::from_bits(u16::from_ne_bytes(
            buf[idx * 2..idx * 2 + 2].try_into().unwrap(),
        ))
        .to_f32()
    };

    for y in 0..h / 2 {
        for x in 0..w / 2 {
            let s = (y * 2 * w + x * 2) * comp;
            for c in 0..comp {
                let sum = get(src, s + c)
                    + get(src, s + comp + c)
                    + get(src, s + w * comp + c)
                    + get(src, s + (w + 1) * comp + c);
                let d = base + (y * w + x) * comp * 2 + c * 2;
                dst[d..d + 2].copy_from_slice(&f16::from_f32(sum / 4.0).to_bits().to_ne_bytes());
            }
        }
    }
}

fn downsample_u8(
    dst: &mut [u8],
    src: &[u8],
    width: i32,
    height: i32,
    format: PixelFormat,
    i: i32,
    j: i32,
) {
    let w = width as usize;
    let h = height as usize;
    let comp = format.n_channels();
    let base = quadrant_origin(w, h, format.bytes_per_pixel(), i, j);

    for y in 0..h / 2 {
        for x in 0..w / 2 {
            let s = (y * 2 * w + x * 2) * comp;
            for c in 0..comp {
                let sum = src[s + c] as u32
                    + src[s + comp + c] as u32
                    + src[s + w * comp + c] as u32
                    + src[s + (w + 1) * comp + c] as u32;
                dst[base + (y * w + x) * comp + c] = (sum / 4) as u8;
            }
        }
    }
}

fn downsample_nearest(
    dst: &mut [u8],
    src: &[u8],
    width: i32,
    height: i32,
    format: PixelFormat,
    i: i32,
    j: i32,
) {
    let w = width as usize;
    let h = height as usize;
    let bpp = format.bytes_per_pixel();
    let base = quadrant_origin(w, h, bpp, i, j);

    for y in 0..h / 2 {
        for x in 0..w / 2 {
            let s = (y * 2 * w + x * 2) * bpp;
            let d = base + (y * w + x) * bpp;
            dst[d..d + bpp].copy_from_slice(&src[s..s + bpp]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downsample_f32_box_average() {
        // 4x4 single-channel float child into quadrant (0, 0) of a 4x4 dst
        let mut src = Vec::new();
        for v in 0..16 {
            src.extend_from_slice(&(v as f32).to_ne_bytes());
        }
        let mut dst = vec![0u8; 16 * 4];
        downsample_f32(&mut dst, &src, 4, 4, PixelFormat::Y_F32, 0, 0);
        let read = |i: usize| f32::from_ne_bytes(dst[i * 4..i * 4 + 4].try_into().unwrap());
        // (0+1+4+5)/4 and (2+3+6+7)/4
        assert_eq!(read(0), 2.5);
        assert_eq!(read(1), 4.5);
        // second quadrant row untouched
        assert_eq!(read(2), 0.0);
    }

    #[test]
    fn test_downsample_u8_box_average() {
        let src = vec![
            0u8, 4, 8, 12, //
            2, 6, 10, 14, //
            0, 0, 0, 0, //
            0, 0, 0, 0,
        ];
        let mut dst = vec![0u8; 16];
        downsample_u8(&mut dst, &src, 4, 4, PixelFormat::Y_U8, 0, 0);
        assert_eq!(dst[0], 3); // (0+4+2+6)/4
        assert_eq!(dst[1], 11); // (8+12+10+14)/4
    }

    #[test]
    fn test_downsample_quadrant_offsets() {
        let mut src = Vec::new();
        for _ in 0..16 {
            src.extend_from_slice(&1.0f32.to_ne_bytes());
        }
        let mut dst = vec![0u8; 16 * 4];
        downsample_f32(&mut dst, &src, 4, 4, PixelFormat::Y_F32, 1, 1);
        let read = |px: usize| f32::from_ne_bytes(dst[px * 4..px * 4 + 4].try_into().unwrap());
        // quadrant (1, 1) covers pixels (2..4, 2..4) of the 4x4 dst
        assert_eq!(read(2 * 4 + 2), 1.0);
        assert_eq!(read(3 * 4 + 3), 1.0);
        assert_eq!(read(0), 0.0);
    }

    #[test]
    fn test_blank_quadrant() {
        let mut dst = vec![7u8; 16];
        blank_quadrant(&mut dst, 4, 4, 1, 0, 0);
        assert_eq!(&dst[0..2], &[0, 0]);
        assert_eq!(&dst[2..4], &[7, 7]);
        assert_eq!(&dst[4..6], &[0, 0]);
        assert_eq!(&dst[8..10], &[7, 7]);
    }
}
