//! Tile handlers: non-terminal sources that forward unhandled commands.
//!
//! A handler sits between the chain head and the backend. Each handler owns
//! a link to its inner source; commands the handler does not recognize are
//! passed through unchanged. The link is set once during chain assembly
//! (the chain is built leaf-first, but the cache, which every other
//! handler needs a reference to, is created before its own inner source
//! exists).

pub mod cache;
pub mod empty;
pub mod log;
pub mod zoom;

use std::sync::OnceLock;

use crate::source::{SharedSource, TileCommand, TileReply};

/// The inner-source link of a handler, set once during chain assembly.
pub(crate) struct InnerSource(OnceLock<SharedSource>);

impl InnerSource {
    pub(crate) fn new() -> Self {
        Self(OnceLock::new())
    }

    /// Installs the inner source. Panics if set twice (assembly bug).
    pub(crate) fn set(&self, source: SharedSource) {
        if self.0.set(source).is_err() {
            panic!("handler inner source set twice");
        }
    }

    pub(crate) fn get(&self) -> Option<&SharedSource> {
        self.0.get()
    }

    /// Forwards a command to the inner source, or reports nothing.
    pub(crate) fn forward(&self, cmd: TileCommand, x: i32, y: i32, z: i32) -> TileReply {
        match self.0.get() {
            Some(inner) => inner.command(cmd, x, y, z),
            None => TileReply::None,
        }
    }
}
