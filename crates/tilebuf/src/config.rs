//! Process-wide buffer configuration.
//!
//! A single [`BufferConfig`] record controls the swap directory, the cache
//! byte budget, the default tile geometry and the debug flags. Install it
//! once at startup with [`init`]; every later [`get`] returns a snapshot.
//! Buffers created before `init` see the defaults.
//!
//! The literal swap path `"RAM"` disables swap entirely: shared storages
//! stay heap-backed. Any other value names a directory in which each new
//! file-backed storage materializes a swap file with a name derived from
//! the process id and a monotonic counter.
//!
//! # Usage
//!
//! ```rust
//! use tilebuf::config::{self, BufferConfig};
//!
//! let _ = config::init(BufferConfig {
//!     tile_cache_size: 64 * 1024 * 1024,
//!     ..BufferConfig::default()
//! });
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{OnceLock, RwLock};

use tilebuf_core::{Error, Result};

/// Default cache byte budget (256 MiB).
pub const DEFAULT_TILE_CACHE_SIZE: u64 = 256 * 1024 * 1024;

/// Default tile width in pixels.
pub const DEFAULT_TILE_WIDTH: i32 = 128;

/// Default tile height in pixels.
pub const DEFAULT_TILE_HEIGHT: i32 = 64;

/// Process-wide configuration record.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BufferConfig {
    /// Swap directory, or the literal `"RAM"` to disable swap.
    pub swap_path: String,
    /// Byte budget enforced by the tile cache.
    pub tile_cache_size: u64,
    /// Tile width used by buffers created from a bare format.
    pub tile_width: i32,
    /// Tile height used by buffers created from a bare format.
    pub tile_height: i32,
    /// Splice a logging handler into every new storage chain.
    pub trace_tile_ops: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            swap_path: "RAM".to_string(),
            tile_cache_size: DEFAULT_TILE_CACHE_SIZE,
            tile_width: DEFAULT_TILE_WIDTH,
            tile_height: DEFAULT_TILE_HEIGHT,
            trace_tile_ops: false,
        }
    }
}

fn config_cell() -> &'static RwLock<BufferConfig> {
    static CONFIG: OnceLock<RwLock<BufferConfig>> = OnceLock::new();
    CONFIG.get_or_init(|| RwLock::new(BufferConfig::default()))
}

/// Validates and installs the configuration record.
///
/// # Errors
///
/// Refuses non-positive tile dimensions, a zero cache budget, and an empty
/// swap path.
pub fn init(config: BufferConfig) -> Result<()> {
    if config.tile_width <= 0 || config.tile_height <= 0 {
        return Err(Error::invalid_dimensions(
            config.tile_width,
            config.tile_height,
            "tile dimensions must be positive",
        ));
    }
    if config.tile_cache_size == 0 {
        return Err(Error::other("tile cache budget must be non-zero"));
    }
    if config.swap_path.is_empty() {
        return Err(Error::other("swap path must name a directory or \"RAM\""));
    }
    *config_cell().write().unwrap() = config;
    Ok(())
}

/// Returns a snapshot of the current configuration.
pub fn get() -> BufferConfig {
    config_cell().read().unwrap().clone()
}

/// Whether swap is disabled (`swap_path == "RAM"`).
pub(crate) fn swap_disabled() -> bool {
    config_cell().read().unwrap().swap_path == "RAM"
}

/// Produces the next swap file path, or `None` when swap is disabled.
///
/// Names follow `tilebuf-{pid}-{counter}.swap` inside the configured
/// directory.
pub(crate) fn next_swap_path() -> Option<PathBuf> {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let config = config_cell().read().unwrap();
    if config.swap_path == "RAM" {
        return None;
    }
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    Some(
        PathBuf::from(&config.swap_path)
            .join(format!("tilebuf-{}-{}.swap", std::process::id(), n)),
    )
}

/// Tears down the process-wide caches.
///
/// Cached storages are destroyed in FIFO order, then the tile cache pool is
/// drained (pending writes of dirty tiles are dropped; they are marked
/// stored first, per the shutdown contract).
pub fn shutdown() {
    crate::storage::shutdown_storage_cache();
    crate::handler::cache::shutdown_pool();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = BufferConfig::default();
        assert_eq!(c.swap_path, "RAM");
        assert_eq!(c.tile_cache_size, DEFAULT_TILE_CACHE_SIZE);
        assert_eq!(c.tile_width, DEFAULT_TILE_WIDTH);
        assert_eq!(c.tile_height, DEFAULT_TILE_HEIGHT);
        assert!(!c.trace_tile_ops);
    }

    #[test]
    fn test_init_rejects_bad_records() {
        assert!(init(BufferConfig {
            tile_width: 0,
            ..BufferConfig::default()
        })
        .is_err());
        assert!(init(BufferConfig {
            tile_cache_size: 0,
            ..BufferConfig::default()
        })
        .is_err());
        assert!(init(BufferConfig {
            swap_path: String::new(),
            ..BufferConfig::default()
        })
        .is_err());
    }
}
