//! The tile source protocol.
//!
//! Every node in a storage chain, handler or terminal backend, answers
//! the same command set at tile granularity. Commands enter at the
//! chain head and bubble down: a handler that does not recognize a command
//! forwards it to its inner source.
//!
//! | Command | Payload | Result | Semantics |
//! |---------|---------|--------|-----------|
//! | `Get` | — | tile or none | Tile at (x, y, z); none means "not present and cannot be produced" |
//! | `Set` | tile | flag | Persist the tile at (x, y, z) |
//! | `IsCached` | — | flag | A `Get` would complete without touching the backend |
//! | `Exist` | — | flag | (x, y, z) has ever been materialized |
//! | `Void` | — | — | Drop any materialization |
//! | `Refetch` | — | — | Invalidate cached content, keep the tile identity |
//! | `Reinit` | — | — | Full wipe of cached state |
//! | `Flush` | — | — | Write all dirty tiles through to the backend |
//! | `Idle` | — | flag | Opportunistic background work; `true` if work was done |
//!
//! The dispatch is a plain sum type: cold commands cost nothing at steady
//! state and the hot ones inline through the convenience wrappers.

use std::sync::Arc;

use crate::tile::Tile;

/// A command addressed to a tile source.
#[derive(Debug, Clone)]
pub enum TileCommand {
    /// Fetch the tile at (x, y, z).
    Get,
    /// Persist the given tile at (x, y, z).
    Set(Tile),
    /// Would a `Get` avoid the backend?
    IsCached,
    /// Has (x, y, z) ever been materialized?
    Exist,
    /// Drop any materialization of (x, y, z).
    Void,
    /// Invalidate cached content but keep the tile identity.
    Refetch,
    /// Full wipe of cached state.
    Reinit,
    /// Write all dirty tiles through to the backend.
    Flush,
    /// Opportunistic background work.
    Idle,
}

impl TileCommand {
    /// Command name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            TileCommand::Get => "get",
            TileCommand::Set(_) => "set",
            TileCommand::IsCached => "is-cached",
            TileCommand::Exist => "exist",
            TileCommand::Void => "void",
            TileCommand::Refetch => "refetch",
            TileCommand::Reinit => "reinit",
            TileCommand::Flush => "flush",
            TileCommand::Idle => "idle",
        }
    }
}

/// Result of a tile command.
#[derive(Debug)]
pub enum TileReply {
    /// Nothing to report (also: "not handled anywhere").
    None,
    /// A tile, from `Get`.
    Tile(Tile),
    /// A boolean, from the flag-valued commands.
    Flag(bool),
}

impl TileReply {
    /// Extracts the tile from a `Get` reply.
    #[inline]
    pub fn into_tile(self) -> Option<Tile> {
        match self {
            TileReply::Tile(tile) => Some(tile),
            _ => None,
        }
    }

    /// Reads the reply as a flag; `None` counts as `false`.
    #[inline]
    pub fn flag(&self) -> bool {
        matches!(self, TileReply::Flag(true))
    }
}

/// Anything that responds to the tile command protocol.
pub trait TileSource: Send + Sync {
    /// The single polymorphic entry point.
    fn command(&self, cmd: TileCommand, x: i32, y: i32, z: i32) -> TileReply;

    /// Fetches the tile at (x, y, z), creating mipmap tiles on the fly.
    ///
    /// Returned tiles are reference-counted and may be copy-on-write; lock
    /// before writing.
    #[inline]
    fn get_tile(&self, x: i32, y: i32, z: i32) -> Option<Tile> {
        self.command(TileCommand::Get, x, y, z).into_tile()
    }

    /// Persists `tile` at (x, y, z).
    #[inline]
    fn set_tile(&self, x: i32, y: i32, z: i32, tile: Tile) -> bool {
        self.command(TileCommand::Set(tile), x, y, z).flag()
    }

    /// Whether a `Get` at (x, y, z) would avoid the backend.
    #[inline]
    fn is_cached(&self, x: i32, y: i32, z: i32) -> bool {
        self.command(TileCommand::IsCached, x, y, z).flag()
    }

    /// Whether (x, y, z) has ever been materialized.
    #[inline]
    fn exist(&self, x: i32, y: i32, z: i32) -> bool {
        self.command(TileCommand::Exist, x, y, z).flag()
    }

    /// Drops any materialization of (x, y, z).
    #[inline]
    fn void(&self, x: i32, y: i32, z: i32) {
        self.command(TileCommand::Void, x, y, z);
    }

    /// Invalidates cached content at (x, y, z), keeping the tile identity.
    #[inline]
    fn refetch(&self, x: i32, y: i32, z: i32) {
        self.command(TileCommand::Refetch, x, y, z);
    }

    /// Wipes all cached state.
    #[inline]
    fn reinit(&self) {
        self.command(TileCommand::Reinit, 0, 0, 0);
    }

    /// Writes all dirty tiles through to the backend.
    #[inline]
    fn flush(&self) {
        self.command(TileCommand::Flush, 0, 0, 0);
    }

    /// Performs opportunistic background work.
    #[inline]
    fn idle(&self) -> bool {
        self.command(TileCommand::Idle, 0, 0, 0).flag()
    }
}

/// Shared handle to a chain node.
pub type SharedSource = Arc<dyn TileSource>;
