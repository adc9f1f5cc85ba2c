//! Swap-file tile backend.
//!
//! One file holds everything: a fixed 256-byte little-endian header, an
//! index region of 24-byte entries sorted by Z-order (Morton) of
//! (x, y, z), and tile payloads at the offsets the index names. The index
//! is mirrored in memory; the on-disk copy is rewritten when the header is
//! synced (`FLUSH`).
//!
//! Payload slots freed by `VOID` are reused before the file grows. When
//! the index region fills up, the file is rebuilt with doubled capacity;
//! tile counts that outgrow the default region are rare enough that the
//! rebuild never shows up in practice.
//!
//! All reads and writes are blocking positioned I/O under one mutex. An
//! I/O failure is logged; the tile involved is marked stored so the write
//! is not retried, and subsequent `GET`s treat the slot as missing.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::warn;

use tilebuf_core::{Error, PixelFormat, Rect, Result};

use crate::backend::TileBackend;
use crate::io::{z_order, FileHeader, TileEntry, ENTRY_SIZE, HEADER_SIZE};
use crate::source::{TileCommand, TileReply, TileSource};
use crate::tile::Tile;

/// Initial number of index slots in a fresh swap file.
const DEFAULT_INDEX_CAPACITY: u64 = 1024;

struct FileState {
    file: File,
    index: HashMap<(i32, i32, i32), u64>,
    free: Vec<u64>,
    data_end: u64,
    index_capacity: u64,
}

impl FileState {
    fn data_start(&self) -> u64 {
        HEADER_SIZE + self.index_capacity * ENTRY_SIZE
    }
}

pub struct FileBackend {
    tile_width: i32,
    tile_height: i32,
    format: PixelFormat,
    path: PathBuf,
    extent: Mutex<Rect>,
    state: Mutex<FileState>,
}

impl FileBackend {
    /// Creates a fresh swap file at `path`.
    pub fn create(
        path: impl AsRef<Path>,
        tile_width: i32,
        tile_height: i32,
        format: PixelFormat,
    ) -> Result<Self> {
        if tile_width <= 0 || tile_height <= 0 {
            return Err(Error::invalid_dimensions(
                tile_width,
                tile_height,
                "tile dimensions must be positive",
            ));
        }
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        let state = FileState {
            file,
            index: HashMap::new(),
            free: Vec::new(),
            data_end: HEADER_SIZE + DEFAULT_INDEX_CAPACITY * ENTRY_SIZE,
            index_capacity: DEFAULT_INDEX_CAPACITY,
        };
        let backend = Self {
            tile_width,
            tile_height,
            format,
            path,
            extent: Mutex::new(Rect::zero()),
            state: Mutex::new(state),
        };
        backend.sync_header_now()?;
        Ok(backend)
    }

    /// Opens an existing buffer file, reading its header and index.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let header = FileHeader::read_from(&mut file)?;

        let tile_size = header.tile_width as u64
            * header.tile_height as u64
            * header.format.bytes_per_pixel() as u64;
        let mut index = HashMap::new();
        let mut max_end = HEADER_SIZE + DEFAULT_INDEX_CAPACITY * ENTRY_SIZE;
        for _ in 0..header.tile_count {
            let entry = TileEntry::read_from(&mut file)?;
            let end = entry.offset as u64 + tile_size;
            if end > max_end {
                max_end = end;
            }
            index.insert((entry.x, entry.y, entry.z), entry.offset as u64);
        }

        let capacity = DEFAULT_INDEX_CAPACITY.max(header.tile_count as u64);
        let state = FileState {
            file,
            index,
            free: Vec::new(),
            data_end: max_end.max(HEADER_SIZE + capacity * ENTRY_SIZE),
            index_capacity: capacity,
        };
        Ok(Self {
            tile_width: header.tile_width,
            tile_height: header.tile_height,
            format: header.format,
            path,
            extent: Mutex::new(header.extent),
            state: Mutex::new(state),
        })
    }

    fn read_tile(&self, x: i32, y: i32, z: i32) -> Option<Tile> {
        let size = self.tile_size();
        let mut state = self.state.lock().unwrap();
        let offset = *state.index.get(&(x, y, z))?;
        let mut bytes = vec![0u8; size];
        let result = match state.file.seek(SeekFrom::Start(offset)) {
            Ok(_) => state.file.read_exact(&mut bytes),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => Some(Tile::from_vec(bytes)),
            Err(e) => {
                warn!("swap read failed at ({x}, {y}, {z}) in {:?}: {e}", self.path);
                None
            }
        }
    }

    fn write_tile(&self, x: i32, y: i32, z: i32, tile: &Tile) -> bool {
        let size = self.tile_size() as u64;
        let mut state = self.state.lock().unwrap();

        let offset = match state.index.get(&(x, y, z)) {
            Some(&o) => o,
            None => {
                if state.index.len() as u64 >= state.index_capacity && state.free.is_empty() {
                    if let Err(e) = self.grow(&mut state) {
                        warn!("swap index grow failed for {:?}: {e}", self.path);
                        tile.mark_stored();
                        return false;
                    }
                }
                match state.free.pop() {
                    Some(o) => o,
                    None => {
                        let o = state.data_end;
                        state.data_end += size;
                        o
                    }
                }
            }
        };

        let result = match state.file.seek(SeekFrom::Start(offset)) {
            Ok(_) => tile.with_data(|bytes| state.file.write_all(bytes)),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                state.index.insert((x, y, z), offset);
                tile.mark_stored();
                true
            }
            Err(e) => {
                warn!("swap write failed at ({x}, {y}, {z}) in {:?}: {e}", self.path);
                tile.mark_stored();
                false
            }
        }
    }

    /// Rebuilds the file with a doubled index region.
    fn grow(&self, state: &mut FileState) -> std::io::Result<()> {
        let size = self.tile_size() as usize;
        let mut payloads: Vec<((i32, i32, i32), Vec<u8>)> = Vec::with_capacity(state.index.len());
        let keys: Vec<((i32, i32, i32), u64)> =
            state.index.iter().map(|(k, &o)| (*k, o)).collect();
        for (key, offset) in keys {
            let mut bytes = vec![0u8; size];
            state.file.seek(SeekFrom::Start(offset))?;
            state.file.read_exact(&mut bytes)?;
            payloads.push((key, bytes));
        }

        state.index_capacity *= 2;
        state.free.clear();
        state.index.clear();
        let mut offset = state.data_start();
        state.file.set_len(offset)?;
        for (key, bytes) in payloads {
            state.file.seek(SeekFrom::Start(offset))?;
            state.file.write_all(&bytes)?;
            state.index.insert(key, offset);
            offset += size as u64;
        }
        state.data_end = offset;
        Ok(())
    }

    fn sync_header_now(&self) -> Result<()> {
        let extent = *self.extent.lock().unwrap();
        let mut state = self.state.lock().unwrap();

        if state.index.len() as u64 > state.index_capacity {
            self.grow(&mut state)?;
        }

        let mut entries: Vec<TileEntry> = state
            .index
            .iter()
            .map(|(&(x, y, z), &offset)| TileEntry {
                x,
                y,
                z,
                offset: offset as u32,
            })
            .collect();
        entries.sort_by_key(|e| z_order(e.x, e.y, e.z));

        let header = FileHeader {
            extent,
            format: self.format,
            tile_width: self.tile_width,
            tile_height: self.tile_height,
            tile_count: entries.len() as i32,
        };
        state.file.seek(SeekFrom::Start(0))?;
        header.write_to(&mut state.file)?;
        for entry in &entries {
            entry.write_to(&mut state.file)?;
        }
        state.file.flush()?;
        Ok(())
    }
}

impl TileSource for FileBackend {
    fn command(&self, cmd: TileCommand, x: i32, y: i32, z: i32) -> TileReply {
        match cmd {
            TileCommand::Get => match self.read_tile(x, y, z) {
                Some(tile) => TileReply::Tile(tile),
                None => TileReply::None,
            },
            TileCommand::Set(tile) => TileReply::Flag(self.write_tile(x, y, z, &tile)),
            TileCommand::Exist => {
                TileReply::Flag(self.state.lock().unwrap().index.contains_key(&(x, y, z)))
            }
            TileCommand::Void => {
                let mut state = self.state.lock().unwrap();
                if let Some(offset) = state.index.remove(&(x, y, z)) {
                    state.free.push(offset);
                }
                TileReply::None
            }
            TileCommand::Flush => {
                if let Err(e) = self.sync_header_now() {
                    warn!("swap header sync failed for {:?}: {e}", self.path);
                }
                TileReply::None
            }
            _ => TileReply::None,
        }
    }
}

impl TileBackend for FileBackend {
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

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn sync_header(&self) {
        if let Err(e) = self.sync_header_now() {
            warn!("swap header sync failed for {:?}: {e}", self.path);
        }
    }
}
