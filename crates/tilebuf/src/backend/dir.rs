//! Tile-per-file backend.
//!
//! Every materialized tile lives in its own file named `{x}_{y}_{z}.tile`
//! under the backend's directory. Useful for inspecting buffers with
//! ordinary filesystem tools and for storages whose tiles come and go
//! independently.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::warn;

use tilebuf_core::{PixelFormat, Rect, Result};

use crate::backend::TileBackend;
use crate::source::{TileCommand, TileReply, TileSource};
use crate::tile::Tile;

pub struct DirBackend {
    tile_width: i32,
    tile_height: i32,
    format: PixelFormat,
    dir: PathBuf,
    extent: Mutex<Rect>,
}

impl DirBackend {
    /// Creates (or reuses) the directory and the backend over it.
    pub fn new(
        dir: impl AsRef<Path>,
        tile_width: i32,
        tile_height: i32,
        format: PixelFormat,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            tile_width,
            tile_height,
            format,
            dir,
            extent: Mutex::new(Rect::zero()),
        })
    }

    fn tile_path(&self, x: i32, y: i32, z: i32) -> PathBuf {
        self.dir.join(format!("{x}_{y}_{z}.tile"))
    }
}

impl TileSource for DirBackend {
    fn command(&self, cmd: TileCommand, x: i32, y: i32, z: i32) -> TileReply {
        match cmd {
            TileCommand::Get => {
                let path = self.tile_path(x, y, z);
                if !path.exists() {
                    return TileReply::None;
                }
                match std::fs::read(&path) {
                    Ok(bytes) if bytes.len() == self.tile_size() => {
                        TileReply::Tile(Tile::from_vec(bytes))
                    }
                    Ok(bytes) => {
                        warn!(
                            "tile file {:?} has {} bytes, expected {}",
                            path,
                            bytes.len(),
                            self.tile_size()
                        );
                        TileReply::None
                    }
                    Err(e) => {
                        warn!("tile read failed for {:?}: {e}", path);
                        TileReply::None
                    }
                }
            }
            TileCommand::Set(tile) => {
                let path = self.tile_path(x, y, z);
                let result = tile.with_data(|bytes| std::fs::write(&path, bytes));
                tile.mark_stored();
                match result {
                    Ok(()) => TileReply::Flag(true),
                    Err(e) => {
                        warn!("tile write failed for {:?}: {e}", path);
                        TileReply::Flag(false)
                    }
                }
            }
            TileCommand::Exist => TileReply::Flag(self.tile_path(x, y, z).exists()),
            TileCommand::Void => {
                let _ = std::fs::remove_file(self.tile_path(x, y, z));
                TileReply::None
            }
            _ => TileReply::None,
        }
    }
}

impl TileBackend for DirBackend {
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
        Some(&self.dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_and_void() {
        let tmp = tempfile::tempdir().unwrap();
        let b = DirBackend::new(tmp.path().join("tiles"), 4, 4, PixelFormat::Y_U8).unwrap();

        let t = Tile::new(b.tile_size());
        t.lock();
        t.with_data_mut(|d| d.fill(9));
        t.unlock();

        assert!(b.set_tile(-1, 2, 0, t));
        assert!(b.exist(-1, 2, 0));
        let got = b.get_tile(-1, 2, 0).unwrap();
        got.with_data(|d| assert!(d.iter().all(|&v| v == 9)));

        b.void(-1, 2, 0);
        assert!(!b.exist(-1, 2, 0));
    }

    #[test]
    fn test_truncated_tile_file_degrades_to_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let b = DirBackend::new(tmp.path().join("tiles"), 4, 4, PixelFormat::Y_U8).unwrap();
        std::fs::write(b.tile_path(0, 0, 0), [1, 2, 3]).unwrap();
        assert!(b.get_tile(0, 0, 0).is_none());
    }
}
