//! Command tracing for storage chains.
//!
//! Logs every command that passes through, then forwards it unchanged.
//! Spliced into a chain when [`BufferConfig::trace_tile_ops`] is set.
//!
//! [`BufferConfig::trace_tile_ops`]: crate::config::BufferConfig::trace_tile_ops

use tracing::debug;

use crate::handler::InnerSource;
use crate::source::{SharedSource, TileCommand, TileReply, TileSource};

pub struct LogHandler {
    inner: InnerSource,
}

impl LogHandler {
    pub(crate) fn new(inner: SharedSource) -> Self {
        let link = InnerSource::new();
        link.set(inner);
        Self { inner: link }
    }
}

impl TileSource for LogHandler {
    fn command(&self, cmd: TileCommand, x: i32, y: i32, z: i32) -> TileReply {
        let name = cmd.name();
        let reply = self.inner.forward(cmd, x, y, z);
        match &reply {
            TileReply::None => debug!(command = name, x, y, z, result = "none"),
            TileReply::Tile(_) => debug!(command = name, x, y, z, result = "tile"),
            TileReply::Flag(v) => debug!(command = name, x, y, z, result = v),
        }
        reply
    }
}
