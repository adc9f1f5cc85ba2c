//! Native buffer file format: save and load.
//!
//! The format is a fixed 256-byte little-endian header, `tile_count`
//! 24-byte index entries sorted by Z-order (Morton) of `(x, y, z)` over
//! the 10 least-significant bits of each axis, then the tile payloads at
//! the offsets the index names.
//!
//! | Offset | Size | Field |
//! |---|---|---|
//! | 0 | 16 | magic `"_G_E_G_L"`, NUL padded |
//! | 16 | 4 | width (i32) |
//! | 20 | 4 | height (i32) |
//! | 24 | 4 | x (i32) |
//! | 28 | 4 | y (i32) |
//! | 32 | 32 | format name, NUL-padded ASCII |
//! | 64 | 4 | tile width (u32) |
//! | 68 | 4 | tile height (u32) |
//! | 72 | 4 | bytes per pixel (u32) |
//! | 76 | 4 | tile count (i32) |
//! | 80 | 176 | reserved, zero |
//!
//! Index entries are `(x: i32, y: i32, z: i32, offset: u32, flags: u32,
//! reserved: u32)`.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use tilebuf_core::{Error, PixelFormat, Rect, Result};

use crate::buffer::Buffer;
use crate::tile::{tile_index, Tile};

/// Size of the fixed header.
pub(crate) const HEADER_SIZE: u64 = 256;

/// Size of one index entry.
pub(crate) const ENTRY_SIZE: u64 = 24;

const MAGIC: [u8; 8] = *b"_G_E_G_L";

/// Morton order of (x, y, z) over the 10 least-significant bits per axis.
pub(crate) fn z_order(x: i32, y: i32, z: i32) -> u64 {
    let mut value: u64 = 0;
    for i in (0..10).rev() {
        for axis in [x, y, z] {
            value <<= 1;
            if axis & (1 << i) != 0 {
                value |= 1;
            }
        }
    }
    value
}

/// The fixed file header.
pub(crate) struct FileHeader {
    pub(crate) extent: Rect,
    pub(crate) format: PixelFormat,
    pub(crate) tile_width: i32,
    pub(crate) tile_height: i32,
    pub(crate) tile_count: i32,
}

impl FileHeader {
    pub(crate) fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        let mut magic = [0u8; 16];
        magic[..8].copy_from_slice(&MAGIC);
        w.write_all(&magic)?;
        w.write_i32::<LittleEndian>(self.extent.width)?;
        w.write_i32::<LittleEndian>(self.extent.height)?;
        w.write_i32::<LittleEndian>(self.extent.x)?;
        w.write_i32::<LittleEndian>(self.extent.y)?;

        let mut name = [0u8; 32];
        let printed = self.format.name();
        name[..printed.len()].copy_from_slice(printed.as_bytes());
        w.write_all(&name)?;

        w.write_u32::<LittleEndian>(self.tile_width as u32)?;
        w.write_u32::<LittleEndian>(self.tile_height as u32)?;
        w.write_u32::<LittleEndian>(self.format.bytes_per_pixel() as u32)?;
        w.write_i32::<LittleEndian>(self.tile_count)?;
        w.write_all(&[0u8; 176])?;
        Ok(())
    }

    pub(crate) fn read_from<R: Read>(r: &mut R) -> Result<FileHeader> {
        let mut magic = [0u8; 16];
        r.read_exact(&mut magic)?;
        if magic[..8] != MAGIC {
            return Err(Error::corrupt_file("bad magic"));
        }

        let width = r.read_i32::<LittleEndian>()?;
        let height = r.read_i32::<LittleEndian>()?;
        let x = r.read_i32::<LittleEndian>()?;
        let y = r.read_i32::<LittleEndian>()?;

        let mut name = [0u8; 32];
        r.read_exact(&mut name)?;
        let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
        let name = std::str::from_utf8(&name[..end])
            .map_err(|_| Error::corrupt_file("format name is not ASCII"))?;
        let format = PixelFormat::from_name(name)
            .ok_or_else(|| Error::unsupported_format(name.to_string()))?;

        let tile_width = r.read_u32::<LittleEndian>()? as i32;
        let tile_height = r.read_u32::<LittleEndian>()? as i32;
        let bpp = r.read_u32::<LittleEndian>()? as usize;
        if bpp != format.bytes_per_pixel() {
            return Err(Error::corrupt_file(format!(
                "header says {bpp} bytes/px but format {format} has {}",
                format.bytes_per_pixel()
            )));
        }
        if tile_width <= 0 || tile_height <= 0 {
            return Err(Error::corrupt_file("non-positive tile geometry"));
        }
        let tile_count = r.read_i32::<LittleEndian>()?;
        if tile_count < 0 {
            return Err(Error::corrupt_file("negative tile count"));
        }
        let mut reserved = [0u8; 176];
        r.read_exact(&mut reserved)?;

        Ok(FileHeader {
            extent: Rect::new(x, y, width, height),
            format,
            tile_width,
            tile_height,
            tile_count,
        })
    }
}

/// One index entry.
pub(crate) struct TileEntry {
    pub(crate) x: i32,
    pub(crate) y: i32,
    pub(crate) z: i32,
    pub(crate) offset: u32,
}

impl TileEntry {
    pub(crate) fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_i32::<LittleEndian>(self.x)?;
        w.write_i32::<LittleEndian>(self.y)?;
        w.write_i32::<LittleEndian>(self.z)?;
        w.write_u32::<LittleEndian>(self.offset)?;
        w.write_u32::<LittleEndian>(0)?; // flags
        w.write_u32::<LittleEndian>(0)?; // reserved
        Ok(())
    }

    pub(crate) fn read_from<R: Read>(r: &mut R) -> Result<TileEntry> {
        let x = r.read_i32::<LittleEndian>()?;
        let y = r.read_i32::<LittleEndian>()?;
        let z = r.read_i32::<LittleEndian>()?;
        let offset = r.read_u32::<LittleEndian>()?;
        let _flags = r.read_u32::<LittleEndian>()?;
        let _reserved = r.read_u32::<LittleEndian>()?;
        Ok(TileEntry { x, y, z, offset })
    }
}

/// Saves a region of `buffer` (default: the whole extent) to `path`.
///
/// Every tile overlapping the region is materialized and written; entry
/// coordinates are relative to the buffer (the tile-aligned part of the
/// shift is folded out).
pub fn save(buffer: &Buffer, path: impl AsRef<Path>, roi: Option<&Rect>) -> Result<()> {
    let rect = roi.copied().unwrap_or_else(|| buffer.extent());
    if rect.is_empty() {
        return Err(Error::invalid_dimensions(
            rect.width,
            rect.height,
            "cannot save an empty region",
        ));
    }

    let storage = buffer.storage();
    let tile_width = storage.tile_width();
    let tile_height = storage.tile_height();
    let tile_size = storage.tile_size();
    let (shift_x, shift_y) = buffer.shift();
    let x_tile_shift = shift_x / tile_width;
    let y_tile_shift = shift_y / tile_height;

    let tx0 = tile_index(rect.x + shift_x, tile_width);
    let tx1 = tile_index(rect.x + shift_x + rect.width - 1, tile_width);
    let ty0 = tile_index(rect.y + shift_y, tile_height);
    let ty1 = tile_index(rect.y + shift_y + rect.height - 1, tile_height);

    let mut tiles: Vec<(i32, i32)> = Vec::new();
    for ty in ty0..=ty1 {
        for tx in tx0..=tx1 {
            tiles.push((tx, ty));
        }
    }
    tiles.sort_by_key(|&(tx, ty)| z_order(tx - x_tile_shift, ty - y_tile_shift, 0));

    let data_start = HEADER_SIZE + tiles.len() as u64 * ENTRY_SIZE;
    let mut w = BufWriter::new(File::create(path)?);

    FileHeader {
        extent: rect,
        format: storage.format(),
        tile_width,
        tile_height,
        tile_count: tiles.len() as i32,
    }
    .write_to(&mut w)?;

    for (i, &(tx, ty)) in tiles.iter().enumerate() {
        TileEntry {
            x: tx - x_tile_shift,
            y: ty - y_tile_shift,
            z: 0,
            offset: (data_start + i as u64 * tile_size as u64) as u32,
        }
        .write_to(&mut w)?;
    }

    for &(tx, ty) in &tiles {
        match buffer.get_tile(tx, ty, 0) {
            Some(tile) => tile.with_data(|bytes| w.write_all(bytes))?,
            None => w.write_all(&vec![0u8; tile_size])?,
        }
    }
    w.flush()?;
    Ok(())
}

/// Loads a buffer file saved by [`save`] (or flushed by the file backend).
pub fn load(path: impl AsRef<Path>) -> Result<Buffer> {
    let mut r = BufReader::new(File::open(path)?);
    let header = FileHeader::read_from(&mut r)?;

    let mut entries = Vec::with_capacity(header.tile_count as usize);
    for _ in 0..header.tile_count {
        entries.push(TileEntry::read_from(&mut r)?);
    }

    let backend = std::sync::Arc::new(crate::backend::RamBackend::new(
        header.tile_width,
        header.tile_height,
        header.format,
        header.extent,
    ));
    let buffer = Buffer::new_for_backend(Some(header.extent), backend);

    let tile_size = header.tile_width as usize
        * header.tile_height as usize
        * header.format.bytes_per_pixel();
    for entry in &entries {
        r.seek(SeekFrom::Start(entry.offset as u64))?;
        let mut bytes = vec![0u8; tile_size];
        r.read_exact(&mut bytes)?;
        let tile = Tile::from_vec(bytes);
        use crate::source::TileSource;
        buffer.storage().set_tile(entry.x, entry.y, entry.z, tile);
    }
    Ok(buffer)
}
