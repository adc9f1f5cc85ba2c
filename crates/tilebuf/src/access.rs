//! Pixel access: scatter, gather, single-pixel paths and scaled reads.
//!
//! Rectangles are traversed in tile-major scanlines: for every tile row
//! overlapping the region, for every tile column, the overlapping span is
//! copied row by row between the tile slab and the linear user buffer,
//! converting between the user's format and the buffer's soft format as
//! needed.
//!
//! The gather path has five specializations so the hot loop never
//! branches on the abyss policy: `simple` (region fully inside the
//! abyss), `none`, `color` (black/white prebaked), `clamp` and `loop`.
//! Each splits a row into at most three segments: left abyss, inside,
//! right abyss.
//!
//! A missing tile is a recoverable condition: the affected output segment
//! is zeroed, a warning is logged, and iteration continues.

use tracing::warn;

use tilebuf_core::{convert, encode_pixel, PixelFormat, Rect};

use crate::buffer::{AbyssPolicy, Buffer};
use crate::tile::{tile_index, tile_offset};

/// Tie-break bias for scaled sampling.
pub(crate) const EPSILON: f64 = 1e-6;

/// Single-pixel write. Outside the abyss nothing happens.
pub(crate) fn set_pixel(buffer: &Buffer, x: i32, y: i32, format: PixelFormat, data: &[u8]) {
    if !buffer.abyss().contains(x, y) {
        return;
    }

    let storage = buffer.storage();
    let tile_width = storage.tile_width();
    let tile_height = storage.tile_height();
    let (shift_x, shift_y) = buffer.shift();
    let tiledx = x + shift_x;
    let tiledy = y + shift_y;
    let index_x = tile_index(tiledx, tile_width);
    let index_y = tile_index(tiledy, tile_height);

    let tile = match storage.hot_tile(index_x, index_y) {
        Some(tile) => Some(tile),
        None => {
            storage.drop_hot_tile();
            buffer.get_tile(index_x, index_y, 0)
        }
    };

    let Some(tile) = tile else {
        warn!("missing tile for pixel write at ({x}, {y})");
        return;
    };

    let soft = buffer.format();
    let px_size = soft.bytes_per_pixel();
    let offset_x = tile_offset(tiledx, tile_width);
    let offset_y = tile_offset(tiledy, tile_height);
    let tp = (offset_y * tile_width + offset_x) as usize * px_size;

    tile.lock();
    tile.with_data_mut(|td| {
        if format != soft {
            convert(format, soft, data, &mut td[tp..], 1);
        } else {
            td[tp..tp + px_size].copy_from_slice(&data[..px_size]);
        }
    });
    tile.unlock();
    storage.set_hot_tile(tile);
}

/// Single-pixel read with abyss resolution.
pub(crate) fn get_pixel(
    buffer: &Buffer,
    x: i32,
    y: i32,
    format: PixelFormat,
    data: &mut [u8],
    policy: AbyssPolicy,
) {
    let bpx_size = format.bytes_per_pixel();
    let mut x = x;
    let mut y = y;

    if !buffer.abyss().contains(x, y) {
        let abyss = buffer.abyss();
        match policy {
            AbyssPolicy::Clamp if !abyss.is_empty() => {
                x = x.clamp(abyss.x, abyss.x + abyss.width - 1);
                y = y.clamp(abyss.y, abyss.y + abyss.height - 1);
            }
            AbyssPolicy::Loop if !abyss.is_empty() => {
                x = abyss.x + (x - abyss.x).rem_euclid(abyss.width);
                y = abyss.y + (y - abyss.y).rem_euclid(abyss.height);
            }
            AbyssPolicy::Black => {
                encode_pixel(format, [0.0, 0.0, 0.0, 1.0], data);
                return;
            }
            AbyssPolicy::White => {
                encode_pixel(format, [1.0, 1.0, 1.0, 1.0], data);
                return;
            }
            _ => {
                data[..bpx_size].fill(0);
                return;
            }
        }
    }

    let storage = buffer.storage();
    let tile_width = storage.tile_width();
    let tile_height = storage.tile_height();
    let soft = buffer.format();
    let px_size = soft.bytes_per_pixel();
    let (shift_x, shift_y) = buffer.shift();
    let tiledx = x + shift_x;
    let tiledy = y + shift_y;
    let index_x = tile_index(tiledx, tile_width);
    let index_y = tile_index(tiledy, tile_height);

    let tile = match storage.hot_tile(index_x, index_y) {
        Some(tile) => Some(tile),
        None => {
            storage.drop_hot_tile();
            buffer.get_tile(index_x, index_y, 0)
        }
    };

    let Some(tile) = tile else {
        data[..bpx_size].fill(0);
        return;
    };

    let offset_x = tile_offset(tiledx, tile_width);
    let offset_y = tile_offset(tiledy, tile_height);
    let tp = (offset_y * tile_width + offset_x) as usize * px_size;
    tile.with_data(|td| {
        if format != soft {
            convert(soft, format, &td[tp..], data, 1);
        } else {
            data[..px_size].copy_from_slice(&td[tp..tp + px_size]);
        }
    });
    storage.set_hot_tile(tile);
}

/// Scatter: writes a linear user buffer into the tiled store.
///
/// `roi` defaults to the buffer extent; `rowstride` 0 means computed from
/// the (level-scaled) width; `level` addresses a mipmap level with the
/// region given in level-0 coordinates.
pub(crate) fn iterate_write(
    buffer: &Buffer,
    roi: Option<&Rect>,
    src: &[u8],
    rowstride: usize,
    format: PixelFormat,
    level: i32,
) {
    let storage = buffer.storage();
    let tile_width = storage.tile_width();
    let tile_height = storage.tile_height();
    let soft = buffer.format();
    let px_size = soft.bytes_per_pixel();
    let bpx_size = format.bytes_per_pixel();
    let tile_stride = px_size * tile_width as usize;
    let (shift_x, shift_y) = buffer.shift();
    let extent = buffer.extent();
    let abyss = buffer.abyss();

    let (mut width, mut height, mut buffer_x, mut buffer_y) = match roi {
        Some(roi) => (roi.width, roi.height, roi.x + shift_x, roi.y + shift_y),
        None => (
            extent.width,
            extent.height,
            extent.x + shift_x,
            extent.y + shift_y,
        ),
    };

    let factor = 1 << level;
    let buffer_abyss_x = (abyss.x + shift_x) / factor;
    let buffer_abyss_y = (abyss.y + shift_y) / factor;
    let abyss_x_total = (abyss.x + shift_x + abyss.width) / factor;
    let abyss_y_total = (abyss.y + shift_y + abyss.height) / factor;
    buffer_x /= factor;
    buffer_y /= factor;
    width /= factor;
    height /= factor;

    let buf_stride = if rowstride != 0 {
        rowstride
    } else {
        width as usize * bpx_size
    };
    let converting = format != soft;

    let mut bufy: i32 = 0;
    while bufy < height {
        let tiledy = buffer_y + bufy;
        let offsety = tile_offset(tiledy, tile_height);
        let mut bufx: i32 = 0;
        while bufx < width {
            let tiledx = buffer_x + bufx;
            let offsetx = tile_offset(tiledx, tile_width);

            let pixels = if width + offsetx - bufx < tile_width {
                width - bufx
            } else {
                tile_width - offsetx
            };

            let lskip = (buffer_abyss_x - (buffer_x + bufx)).clamp(0, pixels);
            let rskip = ((buffer_x + bufx + pixels) - abyss_x_total).clamp(0, pixels);

            let tile = buffer.get_tile(
                tile_index(tiledx, tile_width),
                tile_index(tiledy, tile_height),
                level,
            );
            let Some(tile) = tile else {
                warn!("missing tile while writing, trying to continue");
                bufx += tile_width - offsetx;
                continue;
            };

            tile.lock();
            tile.with_data_mut(|td| {
                let span = (pixels - lskip - rskip).max(0) as usize;
                let mut tp = (offsety * tile_width + offsetx) as usize * px_size;
                let mut bp = bufy as usize * buf_stride + bufx as usize * bpx_size;
                let mut y = bufy;
                let mut row = offsety;
                while row < tile_height && y < height {
                    if span > 0 && buffer_y + y >= buffer_abyss_y && buffer_y + y < abyss_y_total {
                        let s = bp + lskip as usize * bpx_size;
                        let d = tp + lskip as usize * px_size;
                        if converting {
                            convert(format, soft, &src[s..], &mut td[d..], span);
                        } else {
                            td[d..d + span * px_size].copy_from_slice(&src[s..s + span * px_size]);
                        }
                    }
                    tp += tile_stride;
                    bp += buf_stride;
                    row += 1;
                    y += 1;
                }
            });
            tile.unlock();
            bufx += tile_width - offsetx;
        }
        bufy += tile_height - offsety;
    }
}

/// Per-row copy out of one tile, shared by the gather specializations.
#[allow(clippy::too_many_arguments)]
fn gather_rows(
    tile_data: &[u8],
    dst: &mut [u8],
    tp_start: usize,
    bp_start: usize,
    tile_stride: usize,
    buf_stride: usize,
    rows: usize,
    pixels: usize,
    soft: PixelFormat,
    format: PixelFormat,
) {
    let px_size = soft.bytes_per_pixel();
    let converting = format != soft;
    let mut tp = tp_start;
    let mut bp = bp_start;
    for _ in 0..rows {
        if converting {
            convert(soft, format, &tile_data[tp..], &mut dst[bp..], pixels);
        } else {
            dst[bp..bp + pixels * px_size].copy_from_slice(&tile_data[tp..tp + pixels * px_size]);
        }
        tp += tile_stride;
        bp += buf_stride;
    }
}

/// Gather over a region fully inside the abyss.
fn iterate_read_simple(
    buffer: &Buffer,
    roi: &Rect,
    dst: &mut [u8],
    buf_stride: usize,
    format: PixelFormat,
    level: i32,
) {
    let storage = buffer.storage();
    let tile_width = storage.tile_width();
    let tile_height = storage.tile_height();
    let soft = buffer.format();
    let px_size = soft.bytes_per_pixel();
    let bpx_size = format.bytes_per_pixel();
    let tile_stride = px_size * tile_width as usize;

    let width = roi.width;
    let height = roi.height;
    let buffer_x = roi.x;
    let buffer_y = roi.y;

    let mut bufy: i32 = 0;
    while bufy < height {
        let tiledy = buffer_y + bufy;
        let offsety = tile_offset(tiledy, tile_height);
        let mut bufx: i32 = 0;
        while bufx < width {
            let tiledx = buffer_x + bufx;
            let offsetx = tile_offset(tiledx, tile_width);

            let pixels = if width + offsetx - bufx < tile_width {
                width - bufx
            } else {
                tile_width - offsetx
            };
            let rows = ((tile_height - offsety) as usize).min((height - bufy) as usize);
            let bp = bufy as usize * buf_stride + bufx as usize * bpx_size;

            match buffer.get_tile(
                tile_index(tiledx, tile_width),
                tile_index(tiledy, tile_height),
                level,
            ) {
                Some(tile) => tile.with_data(|td| {
                    let tp = (offsety * tile_width + offsetx) as usize * px_size;
                    gather_rows(
                        td, dst, tp, bp, tile_stride, buf_stride, rows, pixels as usize, soft,
                        format,
                    );
                }),
                None => {
                    warn!("missing tile while reading, zeroing the run");
                    let mut p = bp;
                    for _ in 0..rows {
                        dst[p..p + pixels as usize * bpx_size].fill(0);
                        p += buf_stride;
                    }
                }
            }
            bufx += tile_width - offsetx;
        }
        bufy += tile_height - offsety;
    }
}

/// Fills `pixels` pixels at `start` with `color` (or zeros when empty).
fn fill_pixels(dst: &mut [u8], start: usize, pixels: usize, color: &[u8]) {
    let bpx = color.len();
    for i in 0..pixels {
        let at = start + i * bpx;
        dst[at..at + bpx].copy_from_slice(color);
    }
}

/// Gather with out-of-abyss pixels zeroed.
fn iterate_read_abyss_none(
    buffer: &Buffer,
    roi: &Rect,
    abyss: &Rect,
    dst: &mut [u8],
    buf_stride: usize,
    format: PixelFormat,
    level: i32,
) {
    let storage = buffer.storage();
    let tile_width = storage.tile_width();
    let tile_height = storage.tile_height();
    let soft = buffer.format();
    let px_size = soft.bytes_per_pixel();
    let bpx_size = format.bytes_per_pixel();
    let tile_stride = px_size * tile_width as usize;

    let width = roi.width;
    let height = roi.height;
    let buffer_x = roi.x;
    let buffer_y = roi.y;
    let buffer_abyss_x = abyss.x;
    let buffer_abyss_y = abyss.y;
    let abyss_x_total = abyss.x + abyss.width;
    let abyss_y_total = abyss.y + abyss.height;

    let mut bufy: i32 = 0;
    while bufy < height {
        let tiledy = buffer_y + bufy;
        let offsety = tile_offset(tiledy, tile_height);
        let rows = ((tile_height - offsety) as usize).min((height - bufy) as usize);

        let row_of_tiles_in_abyss = !(buffer_y + bufy + tile_height >= buffer_abyss_y
            && buffer_y + bufy < abyss_y_total);

        if row_of_tiles_in_abyss {
            let mut bp = bufy as usize * buf_stride;
            for _ in 0..rows {
                dst[bp..bp + width as usize * bpx_size].fill(0);
                bp += buf_stride;
            }
        } else {
            let mut bufx: i32 = 0;
            while bufx < width {
                let tiledx = buffer_x + bufx;
                let offsetx = tile_offset(tiledx, tile_width);

                let pixels = if width + offsetx - bufx < tile_width {
                    width - bufx
                } else {
                    tile_width - offsetx
                };
                let bp = bufy as usize * buf_stride + bufx as usize * bpx_size;

                let tile_in_abyss = !(buffer_x + bufx + tile_width >= buffer_abyss_x
                    && buffer_x + bufx < abyss_x_total);

                if tile_in_abyss {
                    let mut p = bp;
                    for _ in 0..rows {
                        dst[p..p + pixels as usize * bpx_size].fill(0);
                        p += buf_stride;
                    }
                } else {
                    let lskip = (buffer_abyss_x - (buffer_x + bufx)).clamp(0, pixels);
                    let rskip = ((buffer_x + bufx + pixels) - abyss_x_total).clamp(0, pixels);

                    match buffer.get_tile(
                        tile_index(tiledx, tile_width),
                        tile_index(tiledy, tile_height),
                        level,
                    ) {
                        Some(tile) => tile.with_data(|td| {
                            let mut tp = (offsety * tile_width + offsetx) as usize * px_size;
                            let mut p = bp;
                            let mut y = bufy;
                            for _ in 0..rows {
                                if buffer_y + y >= buffer_abyss_y && buffer_y + y < abyss_y_total {
                                    if format != soft {
                                        convert(soft, format, &td[tp..], &mut dst[p..], pixels as usize);
                                    } else {
                                        dst[p..p + pixels as usize * px_size]
                                            .copy_from_slice(&td[tp..tp + pixels as usize * px_size]);
                                    }
                                } else {
                                    dst[p..p + pixels as usize * bpx_size].fill(0);
                                }
                                if lskip > 0 {
                                    dst[p..p + lskip as usize * bpx_size].fill(0);
                                }
                                if rskip > 0 {
                                    let at = p + (pixels - rskip) as usize * bpx_size;
                                    dst[at..at + rskip as usize * bpx_size].fill(0);
                                }
                                tp += tile_stride;
                                p += buf_stride;
                                y += 1;
                            }
                        }),
                        None => {
                            warn!("missing tile while reading, zeroing the run");
                            let mut p = bp;
                            for _ in 0..rows {
                                dst[p..p + pixels as usize * bpx_size].fill(0);
                                p += buf_stride;
                            }
                        }
                    }
                }
                bufx += tile_width - offsetx;
            }
        }
        bufy += tile_height - offsety;
    }
}

/// Gather with out-of-abyss pixels resolved to a prebaked constant color
/// (opaque black or white, converted into the destination format).
#[allow(clippy::too_many_arguments)]
fn iterate_read_abyss_color(
    buffer: &Buffer,
    roi: &Rect,
    abyss: &Rect,
    dst: &mut [u8],
    buf_stride: usize,
    format: PixelFormat,
    level: i32,
    color: &[u8],
) {
    let storage = buffer.storage();
    let tile_width = storage.tile_width();
    let tile_height = storage.tile_height();
    let soft = buffer.format();
    let px_size = soft.bytes_per_pixel();
    let bpx_size = format.bytes_per_pixel();
    let tile_stride = px_size * tile_width as usize;

    let width = roi.width;
    let height = roi.height;
    let buffer_x = roi.x;
    let buffer_y = roi.y;
    let buffer_abyss_x = abyss.x;
    let buffer_abyss_y = abyss.y;
    let abyss_x_total = abyss.x + abyss.width;
    let abyss_y_total = abyss.y + abyss.height;

    let mut bufy: i32 = 0;
    while bufy < height {
        let tiledy = buffer_y + bufy;
        let offsety = tile_offset(tiledy, tile_height);

        let row_of_tiles_in_abyss = !(buffer_y + bufy + tile_height >= buffer_abyss_y
            && buffer_y + bufy < abyss_y_total);

        if row_of_tiles_in_abyss {
            let rows = ((tile_height - offsety) as usize).min((height - bufy) as usize);
            let mut bp = bufy as usize * buf_stride;
            for _ in 0..rows {
                fill_pixels(dst, bp, width as usize, color);
                bp += buf_stride;
            }
        } else {
            let mut bufx: i32 = 0;
            while bufx < width {
                let tiledx = buffer_x + bufx;
                let offsetx = tile_offset(tiledx, tile_width);

                let pixels = if width + offsetx - bufx < tile_width {
                    width - bufx
                } else {
                    tile_width - offsetx
                };
                let rows = ((tile_height - offsety) as usize).min((height - bufy) as usize);
                let bp = bufy as usize * buf_stride + bufx as usize * bpx_size;

                let tile_in_abyss = !(buffer_x + bufx + tile_width >= buffer_abyss_x
                    && buffer_x + bufx < abyss_x_total);

                if tile_in_abyss {
                    let mut p = bp;
                    for _ in 0..rows {
                        fill_pixels(dst, p, pixels as usize, color);
                        p += buf_stride;
                    }
                } else {
                    let lskip = (buffer_abyss_x - (buffer_x + bufx)).clamp(0, pixels);
                    let rskip = ((buffer_x + bufx + pixels) - abyss_x_total).clamp(0, pixels);

                    match buffer.get_tile(
                        tile_index(tiledx, tile_width),
                        tile_index(tiledy, tile_height),
                        level,
                    ) {
                        Some(tile) => tile.with_data(|td| {
                            let mut tp = (offsety * tile_width + offsetx) as usize * px_size;
                            let mut p = bp;
                            let mut y = bufy;
                            for _ in 0..rows {
                                if buffer_y + y >= buffer_abyss_y && buffer_y + y < abyss_y_total {
                                    if format != soft {
                                        convert(soft, format, &td[tp..], &mut dst[p..], pixels as usize);
                                    } else {
                                        dst[p..p + pixels as usize * px_size]
                                            .copy_from_slice(&td[tp..tp + pixels as usize * px_size]);
                                    }
                                } else {
                                    fill_pixels(dst, p, pixels as usize, color);
                                }
                                if lskip > 0 {
                                    fill_pixels(dst, p, lskip as usize, color);
                                }
                                if rskip > 0 {
                                    fill_pixels(
                                        dst,
                                        p + (pixels - rskip) as usize * bpx_size,
                                        rskip as usize,
                                        color,
                                    );
                                }
                                tp += tile_stride;
                                p += buf_stride;
                                y += 1;
                            }
                        }),
                        None => {
                            warn!("missing tile while reading, zeroing the run");
                            let mut p = bp;
                            for _ in 0..rows {
                                dst[p..p + pixels as usize * bpx_size].fill(0);
                                p += buf_stride;
                            }
                        }
                    }
                }
                bufx += tile_width - offsetx;
            }
        }
        bufy += tile_height - offsety;
    }
}

/// Gather with out-of-abyss pixels clamped to the nearest edge pixel.
fn iterate_read_abyss_clamp(
    buffer: &Buffer,
    roi: &Rect,
    abyss: &Rect,
    dst: &mut [u8],
    buf_stride: usize,
    format: PixelFormat,
    level: i32,
) {
    let storage = buffer.storage();
    let tile_width = storage.tile_width();
    let tile_height = storage.tile_height();
    let soft = buffer.format();
    let px_size = soft.bytes_per_pixel();
    let bpx_size = format.bytes_per_pixel();
    let tile_stride = px_size * tile_width as usize;

    let width = roi.width;
    let height = roi.height;
    let buffer_x = roi.x;
    let buffer_y = roi.y;
    let buffer_abyss_x = abyss.x;
    let buffer_abyss_y = abyss.y;
    let abyss_x_total = abyss.x + abyss.width;
    let abyss_y_total = abyss.y + abyss.height;

    if abyss.is_empty() {
        for row in 0..height.max(0) as usize {
            let p = row * buf_stride;
            dst[p..p + width as usize * bpx_size].fill(0);
        }
        return;
    }

    let mut bufy: i32 = 0;
    while bufy < height {
        let tiledy = (buffer_y + bufy).clamp(buffer_abyss_y, abyss_y_total - 1);
        let offsety = tile_offset(tiledy, tile_height);
        let row_in_abyss =
            !(buffer_y + bufy + tile_height >= buffer_abyss_y && buffer_y + bufy < abyss_y_total);

        let mut bufx: i32 = 0;
        while bufx < width {
            let tiledx = (buffer_x + bufx).clamp(buffer_abyss_x, abyss_x_total - 1);
            let offsetx = tile_offset(tiledx, tile_width);

            let tile = buffer.get_tile(
                tile_index(tiledx, tile_width),
                tile_index(tiledy, tile_height),
                level,
            );
            let Some(tile) = tile else {
                warn!("missing tile while reading, zeroing the run");
                let pixels = (tile_width - offsetx).min(width - bufx);
                let mut p = bufy as usize * buf_stride + bufx as usize * bpx_size;
                let rows = ((tile_height - offsety) as usize).min((height - bufy) as usize);
                for _ in 0..rows {
                    dst[p..p + pixels as usize * bpx_size].fill(0);
                    p += buf_stride;
                }
                bufx += tile_width - offsetx;
                continue;
            };

            let pixels = tile.with_data(|td| {
                let tp0 = (offsety * tile_width + offsetx) as usize * px_size;
                let bp0 = bufy as usize * buf_stride + bufx as usize * bpx_size;

                if tiledx != buffer_x + bufx {
                    // x clamped: replicate a single edge column
                    let lskip = buffer_abyss_x - (buffer_x + bufx);
                    let rskip = width - bufx;
                    let n = if lskip > 0 && lskip < width { lskip } else { rskip };

                    let mut color = vec![0u8; bpx_size];
                    let mut tp = tp0;
                    let mut bp = bp0;
                    let mut y = bufy;
                    let row0 = if row_in_abyss { 0 } else { offsety };
                    let mut row = row0;
                    if row_in_abyss {
                        // y stays clamped for this whole stretch
                        if format != soft {
                            convert(soft, format, &td[tp..], &mut color, 1);
                        } else {
                            color.copy_from_slice(&td[tp..tp + px_size]);
                        }
                        while row < tile_height && y < height {
                            fill_pixels(dst, bp, n as usize, &color);
                            bp += buf_stride;
                            row += 1;
                            y += 1;
                        }
                    } else {
                        while row < tile_height && y < height {
                            if format != soft {
                                convert(soft, format, &td[tp..], &mut color, 1);
                            } else {
                                color.copy_from_slice(&td[tp..tp + px_size]);
                            }
                            fill_pixels(dst, bp, n as usize, &color);
                            if buffer_y + y >= buffer_abyss_y && buffer_y + y < abyss_y_total - 1 {
                                tp += tile_stride;
                            }
                            bp += buf_stride;
                            row += 1;
                            y += 1;
                        }
                    }
                    n
                } else {
                    let mut n = if width + offsetx - bufx < tile_width {
                        width - bufx
                    } else {
                        tile_width - offsetx
                    };
                    // stop at the right side of the abyss
                    let rskip = abyss_x_total - (buffer_x + bufx);
                    if rskip > 0 && rskip < n {
                        n = rskip;
                    }

                    let mut tp = tp0;
                    let mut bp = bp0;
                    let mut y = bufy;
                    let mut row = if row_in_abyss { 0 } else { offsety };
                    while row < tile_height && y < height {
                        if format != soft {
                            convert(soft, format, &td[tp..], &mut dst[bp..], n as usize);
                        } else {
                            dst[bp..bp + n as usize * px_size]
                                .copy_from_slice(&td[tp..tp + n as usize * px_size]);
                        }
                        if buffer_y + y >= buffer_abyss_y && buffer_y + y < abyss_y_total - 1 {
                            tp += tile_stride;
                        }
                        bp += buf_stride;
                        row += 1;
                        y += 1;
                    }
                    n
                }
            });
            bufx += pixels;
        }
        if row_in_abyss {
            bufy += tile_height;
        } else {
            bufy += tile_height - offsety;
        }
    }
}

/// Gather with the abyss tiling the plane.
fn iterate_read_abyss_loop(
    buffer: &Buffer,
    roi: &Rect,
    abyss: &Rect,
    dst: &mut [u8],
    buf_stride: usize,
    format: PixelFormat,
    level: i32,
) {
    let storage = buffer.storage();
    let tile_width = storage.tile_width();
    let tile_height = storage.tile_height();
    let soft = buffer.format();
    let px_size = soft.bytes_per_pixel();
    let bpx_size = format.bytes_per_pixel();
    let tile_stride = px_size * tile_width as usize;

    let width = roi.width;
    let height = roi.height;
    let buffer_x = roi.x;
    let buffer_y = roi.y;
    let buffer_abyss_x = abyss.x;
    let buffer_abyss_y = abyss.y;
    let abyss_x_total = abyss.x + abyss.width;
    let abyss_y_total = abyss.y + abyss.height;

    if abyss.is_empty() {
        for row in 0..height.max(0) as usize {
            let p = row * buf_stride;
            dst[p..p + width as usize * bpx_size].fill(0);
        }
        return;
    }

    let mut bufy: i32 = 0;
    while bufy < height {
        let tiledy = buffer_abyss_y + (buffer_y + bufy - buffer_abyss_y).rem_euclid(abyss.height);
        let offsety = tile_offset(tiledy, tile_height);

        let mut rows = if height + offsety - bufy < tile_height {
            height - bufy
        } else {
            tile_height - offsety
        };
        let topskip = buffer_abyss_y - tiledy;
        let bottomskip = abyss_y_total - tiledy;
        if topskip > 0 && topskip < rows {
            rows = topskip;
        } else if bottomskip > 0 && bottomskip < rows {
            rows = bottomskip;
        }

        let mut bufx: i32 = 0;
        while bufx < width {
            let tiledx =
                buffer_abyss_x + (buffer_x + bufx - buffer_abyss_x).rem_euclid(abyss.width);
            let offsetx = tile_offset(tiledx, tile_width);

            let mut pixels = if width + offsetx - bufx < tile_width {
                width - bufx
            } else {
                tile_width - offsetx
            };
            let lskip = buffer_abyss_x - tiledx;
            let rskip = abyss_x_total - tiledx;
            if lskip > 0 && lskip < pixels {
                pixels = lskip;
            } else if rskip > 0 && rskip < pixels {
                pixels = rskip;
            }

            match buffer.get_tile(
                tile_index(tiledx, tile_width),
                tile_index(tiledy, tile_height),
                level,
            ) {
                Some(tile) => tile.with_data(|td| {
                    let tp = (offsety * tile_width + offsetx) as usize * px_size;
                    let bp = bufy as usize * buf_stride + bufx as usize * bpx_size;
                    let run_rows = (rows.min(height - bufy)).max(0) as usize;
                    gather_rows(
                        td, dst, tp, bp, tile_stride, buf_stride, run_rows, pixels as usize, soft,
                        format,
                    );
                }),
                None => {
                    warn!("missing tile while reading, zeroing the run");
                    let mut p = bufy as usize * buf_stride + bufx as usize * bpx_size;
                    for _ in 0..rows.max(0) as usize {
                        dst[p..p + pixels as usize * bpx_size].fill(0);
                        p += buf_stride;
                    }
                }
            }
            bufx += pixels;
        }
        bufy += rows;
    }
}

/// Chooses the gather specialization and factors the region, abyss and
/// shift down to the requested mipmap level.
pub(crate) fn iterate_read_dispatch(
    buffer: &Buffer,
    roi: &Rect,
    dst: &mut [u8],
    rowstride: usize,
    format: PixelFormat,
    level: i32,
    policy: AbyssPolicy,
) {
    let abyss = buffer.abyss();
    let (shift_x, shift_y) = buffer.shift();
    let factor = 1 << level;

    let x1 = shift_x + abyss.x;
    let y1 = shift_y + abyss.y;
    let x2 = shift_x + abyss.x + abyss.width;
    let y2 = shift_y + abyss.y + abyss.height;

    let af_x = (x1 + if x1 < 0 { 1 - factor } else { 0 }) / factor;
    let af_y = (y1 + if y1 < 0 { 1 - factor } else { 0 }) / factor;
    let abyss_factored = Rect::new(
        af_x,
        af_y,
        (x2 + if x2 < 0 { 0 } else { factor - 1 }) / factor - af_x,
        (y2 + if y2 < 0 { 0 } else { factor - 1 }) / factor - af_y,
    );

    let roi_factored = Rect::new(
        (shift_x + roi.x) / factor,
        (shift_y + roi.y) / factor,
        roi.width / factor,
        roi.height / factor,
    );

    let buf_stride = if rowstride != 0 {
        rowstride
    } else {
        roi_factored.width as usize * format.bytes_per_pixel()
    };

    if abyss.contains_rect(roi) {
        iterate_read_simple(buffer, &roi_factored, dst, buf_stride, format, level);
        return;
    }

    match policy {
        AbyssPolicy::None => iterate_read_abyss_none(
            buffer,
            &roi_factored,
            &abyss_factored,
            dst,
            buf_stride,
            format,
            level,
        ),
        AbyssPolicy::Black | AbyssPolicy::White => {
            let v = if policy == AbyssPolicy::White { 1.0 } else { 0.0 };
            let mut color = vec![0u8; format.bytes_per_pixel()];
            encode_pixel(format, [v, v, v, 1.0], &mut color);
            iterate_read_abyss_color(
                buffer,
                &roi_factored,
                &abyss_factored,
                dst,
                buf_stride,
                format,
                level,
                &color,
            );
        }
        AbyssPolicy::Clamp => iterate_read_abyss_clamp(
            buffer,
            &roi_factored,
            &abyss_factored,
            dst,
            buf_stride,
            format,
            level,
        ),
        AbyssPolicy::Loop => iterate_read_abyss_loop(
            buffer,
            &roi_factored,
            &abyss_factored,
            dst,
            buf_stride,
            format,
            level,
        ),
    }
}

/// Gather with optional scaling.
///
/// `scale` 1 is the plain dispatch. Otherwise the mipmap level is
/// `floor(log2(1/scale))` (clamped at 0), the source rectangle at that
/// level is gathered, and the remaining factor in (0.5, 2) is resolved by
/// a 2×2 box filter with bilinear weights for u8 and f32 component types,
/// or nearest-neighbor resampling for everything else.
pub(crate) fn buffer_get(
    buffer: &Buffer,
    rect: &Rect,
    scale: f64,
    format: PixelFormat,
    dst: &mut [u8],
    rowstride: usize,
    policy: AbyssPolicy,
) {
    if scale <= 0.0 {
        warn!("non-positive scale {scale} ignored");
        return;
    }
    if rect.is_empty() {
        return;
    }
    if (scale - 1.0).abs() < 1e-9 {
        iterate_read_dispatch(buffer, rect, dst, rowstride, format, 0, policy);
        return;
    }

    let bpp = format.bytes_per_pixel();
    let mut scale = scale;
    let mut x1 = ((rect.x as f64) / scale + EPSILON).floor() as i32;
    let mut x2 = (((rect.x + rect.width) as f64) / scale - EPSILON).ceil() as i32;
    let mut y1 = ((rect.y as f64) / scale + EPSILON).floor() as i32;
    let mut y2 = (((rect.y + rect.height) as f64) / scale - EPSILON).ceil() as i32;
    let mut level = 0;
    let mut factor = 1;

    while scale <= 0.5 {
        x1 = if x1 > 0 { x1 / 2 } else { (x1 - 1) / 2 };
        y1 = if y1 > 0 { y1 / 2 } else { (y1 - 1) / 2 };
        x2 = if x2 > 0 { (x2 + 1) / 2 } else { x2 / 2 };
        y2 = if y2 > 0 { (y2 + 1) / 2 } else { y2 / 2 };
        scale *= 2.0;
        factor *= 2;
        level += 1;
    }

    let sample_rect = Rect::new(
        factor * x1,
        factor * y1,
        factor * (x2 - x1),
        factor * (y2 - y1),
    );

    if scale == 1.0 {
        // power-of-two downscale: the mipmap level is the answer
        iterate_read_dispatch(buffer, &sample_rect, dst, rowstride, format, level, policy);
        return;
    }

    let box_filtered = scale < 1.99 && matches!(format.base, tilebuf_core::BaseType::U8 | tilebuf_core::BaseType::F32);

    let mut buf_width = x2 - x1;
    let mut buf_height = y2 - y1;
    let mut offset = 0usize;
    if box_filtered {
        // one pixel of padding on each side so the filter always has data
        buf_width += 2;
        buf_height += 2;
        offset = (buf_width as usize + 1) * bpp;
    }

    let mut sample_buf = vec![0u8; buf_width as usize * buf_height as usize * bpp];
    let stride = buf_width as usize * bpp;
    iterate_read_dispatch(
        buffer,
        &sample_rect,
        &mut sample_buf[offset..],
        stride,
        format,
        level,
        policy,
    );

    let rowstride = if rowstride != 0 {
        rowstride
    } else {
        rect.width as usize * bpp
    };

    if box_filtered {
        let padded = Rect::new(x1 - 1, y1 - 1, x2 - x1 + 2, y2 - y1 + 2);
        match format.base {
            tilebuf_core::BaseType::U8 => resample_boxfilter_u8(
                dst, &sample_buf, rect, &padded, stride, scale, bpp, rowstride,
            ),
            _ => resample_boxfilter_f32(
                dst,
                &sample_buf,
                rect,
                &padded,
                stride,
                scale,
                bpp / 4,
                rowstride,
            ),
        }
    } else {
        let unpadded = Rect::new(x1, y1, x2 - x1, y2 - y1);
        resample_nearest(dst, &sample_buf, rect, &unpadded, stride, scale, bpp, rowstride);
    }
}

/// Nearest-neighbor resampling with half-pixel centers.
#[allow(clippy::too_many_arguments)]
fn resample_nearest(
    dst: &mut [u8],
    src: &[u8],
    dst_rect: &Rect,
    src_rect: &Rect,
    s_stride: usize,
    scale: f64,
    bpp: usize,
    d_stride: usize,
) {
    let src_rows = (src.len() / s_stride).max(1);
    let src_cols = (s_stride / bpp).max(1);

    for i in 0..dst_rect.height {
        let sy = (dst_rect.y as f64 + 0.5 + i as f64) / scale - src_rect.y as f64;
        let ii = ((sy + EPSILON).floor() as i64).clamp(0, src_rows as i64 - 1) as usize;

        for j in 0..dst_rect.width {
            let sx = (dst_rect.x as f64 + 0.5 + j as f64) / scale - src_rect.x as f64;
            let jj = ((sx + EPSILON).floor() as i64).clamp(0, src_cols as i64 - 1) as usize;

            let d = i as usize * d_stride + j as usize * bpp;
            let s = ii * s_stride + jj * bpp;
            dst[d..d + bpp].copy_from_slice(&src[s..s + bpp]);
        }
    }
}

/// 2×2 box filter with bilinear weights over u8 lanes.
#[allow(clippy::too_many_arguments)]
fn resample_boxfilter_u8(
    dst: &mut [u8],
    src: &[u8],
    dst_rect: &Rect,
    src_rect: &Rect,
    s_stride: usize,
    scale: f64,
    components: usize,
    d_stride: usize,
) {
    let src_rows = src.len() / s_stride;
    let src_cols = s_stride / components;

    for y in 0..dst_rect.height {
        let sy = (dst_rect.y as f64 + y as f64 + 0.5) / scale - src_rect.y as f64;
        let ii = (sy.floor() as i64).clamp(1, (src_rows as i64 - 2).max(1)) as usize;

        let top = (0.5 - scale * (sy - ii as f64)).max(0.0);
        let bottom = (0.5 - scale * ((ii as f64 + 1.0) - sy)).max(0.0);
        let middle = 1.0 - top - bottom;

        for x in 0..dst_rect.width {
            let sx = (dst_rect.x as f64 + x as f64 + 0.5) / scale - src_rect.x as f64;
            let jj = (sx.floor() as i64).clamp(1, (src_cols as i64 - 2).max(1)) as usize;

            let left = (0.5 - scale * (sx - jj as f64)).max(0.0);
            let right = (0.5 - scale * ((jj as f64 + 1.0) - sx)).max(0.0);
            let center = 1.0 - left - right;

            let weights = [
                left * top,
                center * top,
                right * top,
                left * middle,
                center * middle,
                right * middle,
                left * bottom,
                center * bottom,
                right * bottom,
            ];

            let d = y as usize * d_stride + x as usize * components;
            for c in 0..components {
                let mut sum = 0.0f64;
                let mut w = 0;
                for dy in 0..3usize {
                    for dx in 0..3usize {
                        let s = (ii + dy - 1) * s_stride + (jj + dx - 1) * components + c;
                        sum += src[s] as f64 * weights[w];
                        w += 1;
                    }
                }
                dst[d + c] = sum.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
}

/// 2×2 box filter with bilinear weights over f32 lanes.
#[allow(clippy::too_many_arguments)]
fn resample_boxfilter_f32(
    dst: &mut [u8],
    src: &[u8],
    dst_rect: &Rect,
    src_rect: &Rect,
    s_stride: usize,
    scale: f64,
    components: usize,
    d_stride: usize,
) {
    let bpp = components * 4;
    let src_rows = src.len() / s_stride;
    let src_cols = s_stride / bpp;

    let read = |at: usize| -> f64 {
        f32::from_ne_bytes(src[at..at + 4].try_into().unwrap()) as f64
    };

    for y in 0..dst_rect.height {
        let sy = (dst_rect.y as f64 + y as f64 + 0.5) / scale - src_rect.y as f64;
        let ii = (sy.floor() as i64).clamp(1, (src_rows as i64 - 2).max(1)) as usize;

        let top = (0.5 - scale * (sy - ii as f64)).max(0.0);
        let bottom = (0.5 - scale * ((ii as f64 + 1.0) - sy)).max(0.0);
        let middle = 1.0 - top - bottom;

        for x in 0..dst_rect.width {
            let sx = (dst_rect.x as f64 + x as f64 + 0.5) / scale - src_rect.x as f64;
            let jj = (sx.floor() as i64).clamp(1, (src_cols as i64 - 2).max(1)) as usize;

            let left = (0.5 - scale * (sx - jj as f64)).max(0.0);
            let right = (0.5 - scale * ((jj as f64 + 1.0) - sx)).max(0.0);
            let center = 1.0 - left - right;

            let weights = [
                left * top,
                center * top,
                right * top,
                left * middle,
                center * middle,
                right * middle,
                left * bottom,
                center * bottom,
                right * bottom,
            ];

            let d = y as usize * d_stride + x as usize * bpp;
            for c in 0..components {
                let mut sum = 0.0f64;
                let mut w = 0;
                for dy in 0..3usize {
                    for dx in 0..3usize {
                        let s = (ii + dy - 1) * s_stride + (jj + dx - 1) * bpp + c * 4;
                        sum += read(s) * weights[w];
                        w += 1;
                    }
                }
                let out = (sum as f32).to_ne_bytes();
                dst[d + c * 4..d + c * 4 + 4].copy_from_slice(&out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilebuf_core::PixelFormat;

    fn float_buffer(w: i32, h: i32) -> Buffer {
        Buffer::new(Rect::new(0, 0, w, h), PixelFormat::Y_F32)
    }

    fn write_f32(buffer: &Buffer, x: i32, y: i32, v: f32) {
        buffer.set_pixel(x, y, None, &v.to_ne_bytes());
    }

    fn read_f32(buffer: &Buffer, x: i32, y: i32, policy: AbyssPolicy) -> f32 {
        let mut out = [0u8; 4];
        buffer.get_pixel(x, y, None, &mut out, policy);
        f32::from_ne_bytes(out)
    }

    #[test]
    fn test_pixel_round_trip() {
        let b = float_buffer(10, 10);
        write_f32(&b, 3, 7, 0.5);
        assert_eq!(read_f32(&b, 3, 7, AbyssPolicy::None), 0.5);
        assert_eq!(read_f32(&b, 4, 7, AbyssPolicy::None), 0.0);
    }

    #[test]
    fn test_write_outside_abyss_is_dropped() {
        let b = float_buffer(10, 10);
        write_f32(&b, -1, 0, 1.0);
        write_f32(&b, 10, 0, 1.0);
        assert_eq!(read_f32(&b, 0, 0, AbyssPolicy::None), 0.0);
        assert_eq!(read_f32(&b, 9, 0, AbyssPolicy::None), 0.0);
    }

    #[test]
    fn test_abyss_policies_single_pixel() {
        let b = float_buffer(4, 4);
        write_f32(&b, 0, 0, 0.25);
        write_f32(&b, 3, 3, 0.75);

        assert_eq!(read_f32(&b, -1, -1, AbyssPolicy::None), 0.0);
        assert_eq!(read_f32(&b, -1, -1, AbyssPolicy::Clamp), 0.25);
        assert_eq!(read_f32(&b, 4, 4, AbyssPolicy::Clamp), 0.75);
        // loop: (-1, -1) wraps to (3, 3)
        assert_eq!(read_f32(&b, -1, -1, AbyssPolicy::Loop), 0.75);
        // black and white convert from RGBA float
        assert_eq!(read_f32(&b, -5, 0, AbyssPolicy::Black), 0.0);
        let w = read_f32(&b, -5, 0, AbyssPolicy::White);
        assert!((w - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_gather_matches_writes() {
        let b = float_buffer(20, 20);
        for y in 0..20 {
            for x in 0..20 {
                write_f32(&b, x, y, (x + y * 20) as f32);
            }
        }
        let mut out = vec![0u8; 20 * 20 * 4];
        b.get(&Rect::new(0, 0, 20, 20), 1.0, None, &mut out, 0, AbyssPolicy::None);
        for i in 0..400usize {
            let v = f32::from_ne_bytes(out[i * 4..i * 4 + 4].try_into().unwrap());
            assert_eq!(v, i as f32);
        }
    }

    #[test]
    fn test_scatter_respects_rowstride() {
        let b = float_buffer(8, 2);
        // rows padded to 10 floats
        let mut src = vec![0u8; 10 * 2 * 4];
        for y in 0..2 {
            for x in 0..8 {
                let v = (y * 8 + x) as f32;
                let at = (y * 10 + x) * 4;
                src[at..at + 4].copy_from_slice(&v.to_ne_bytes());
            }
        }
        b.set(Some(&Rect::new(0, 0, 8, 2)), 0, None, &src, 10 * 4);
        assert_eq!(read_f32(&b, 7, 1, AbyssPolicy::None), 15.0);
        assert_eq!(read_f32(&b, 0, 1, AbyssPolicy::None), 8.0);
    }

    #[test]
    fn test_gather_with_format_conversion() {
        let b = float_buffer(4, 1);
        for x in 0..4 {
            write_f32(&b, x, 0, x as f32 / 3.0);
        }
        let mut out = vec![0u8; 4];
        b.get(
            &Rect::new(0, 0, 4, 1),
            1.0,
            Some(PixelFormat::Y_U8),
            &mut out,
            0,
            AbyssPolicy::None,
        );
        assert_eq!(out[0], 0);
        assert_eq!(out[3], 255);
        assert_eq!(out[1], 85);
    }

    #[test]
    fn test_abyss_none_gather_zeroes_outside() {
        let b = float_buffer(4, 4);
        for y in 0..4 {
            for x in 0..4 {
                write_f32(&b, x, y, 1.0);
            }
        }
        let mut out = vec![0xffu8; 6 * 6 * 4];
        b.get(&Rect::new(-1, -1, 6, 6), 1.0, None, &mut out, 0, AbyssPolicy::None);
        let at = |x: usize, y: usize| -> f32 {
            f32::from_ne_bytes(out[(y * 6 + x) * 4..(y * 6 + x) * 4 + 4].try_into().unwrap())
        };
        assert_eq!(at(0, 0), 0.0);
        assert_eq!(at(5, 5), 0.0);
        assert_eq!(at(1, 1), 1.0);
        assert_eq!(at(4, 4), 1.0);
        assert_eq!(at(5, 2), 0.0);
    }

    #[test]
    fn test_abyss_loop_gather_wraps() {
        let b = float_buffer(4, 4);
        for y in 0..4 {
            for x in 0..4 {
                write_f32(&b, x, y, (y * 4 + x) as f32);
            }
        }
        let mut out = vec![0u8; 8 * 8 * 4];
        b.get(&Rect::new(-4, -4, 8, 8), 1.0, None, &mut out, 0, AbyssPolicy::Loop);
        let at = |x: usize, y: usize| -> f32 {
            f32::from_ne_bytes(out[(y * 8 + x) * 4..(y * 8 + x) * 4 + 4].try_into().unwrap())
        };
        // the wrapped quadrant equals the direct one
        for y in 0..4 {
            for x in 0..4 {
                assert_eq!(at(x, y), at(x + 4, y + 4));
                assert_eq!(at(x, y), (y * 4 + x) as f32);
            }
        }
    }

    #[test]
    fn test_abyss_clamp_gather_replicates_edges() {
        let b = float_buffer(4, 4);
        for y in 0..4 {
            for x in 0..4 {
                write_f32(&b, x, y, (y * 4 + x) as f32);
            }
        }
        let mut out = vec![0u8; 6 * 6 * 4];
        b.get(&Rect::new(-1, -1, 6, 6), 1.0, None, &mut out, 0, AbyssPolicy::Clamp);
        let at = |x: usize, y: usize| -> f32 {
            f32::from_ne_bytes(out[(y * 6 + x) * 4..(y * 6 + x) * 4 + 4].try_into().unwrap())
        };
        assert_eq!(at(0, 0), 0.0); // clamped to (0,0)
        assert_eq!(at(5, 0), 3.0); // clamped to (3,0)
        assert_eq!(at(0, 5), 12.0); // clamped to (0,3)
        assert_eq!(at(5, 5), 15.0); // clamped to (3,3)
        assert_eq!(at(2, 2), 5.0); // interior untouched
    }

    #[test]
    fn test_power_of_two_downscale_uses_mipmap() {
        let b = float_buffer(8, 8);
        for y in 0..8 {
            for x in 0..8 {
                write_f32(&b, x, y, 1.0);
            }
        }
        let mut out = vec![0u8; 4 * 4 * 4];
        b.get(&Rect::new(0, 0, 4, 4), 0.5, None, &mut out, 0, AbyssPolicy::None);
        for i in 0..16usize {
            let v = f32::from_ne_bytes(out[i * 4..i * 4 + 4].try_into().unwrap());
            assert_eq!(v, 1.0);
        }
    }

    #[test]
    fn test_fractional_downscale_box_filters_u8() {
        let b = Buffer::new(Rect::new(0, 0, 8, 8), PixelFormat::Y_U8);
        for y in 0..8 {
            for x in 0..8 {
                b.set_pixel(x, y, None, &[200u8]);
            }
        }
        let mut out = vec![0u8; 6 * 6];
        b.get(&Rect::new(0, 0, 6, 6), 0.75, None, &mut out, 0, AbyssPolicy::None);
        // constant input stays constant through the filter
        for &v in out.iter() {
            assert!(v >= 199, "got {v}");
        }
    }
}
