//! Error types shared by the tilebuf crates.
//!
//! The buffer core itself never fails across its public pixel-access
//! surface (out-of-abyss reads are resolved by policy, missing tiles
//! degrade to zeros with a log entry). [`Error`] covers the places where
//! failure is a real outcome: opening and parsing swap files, save/load of
//! the native format, and argument validation on construction paths.
//!
//! # Usage
//!
//! ```rust
//! use tilebuf_core::{Error, Result};
//!
//! fn check_dims(width: i32, height: i32) -> Result<()> {
//!     if width <= 0 || height <= 0 {
//!         return Err(Error::invalid_dimensions(width, height, "non-positive"));
//!     }
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// Result type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the tilebuf crates.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid buffer or tile dimensions.
    #[error("invalid dimensions: {width}x{height} ({reason})")]
    InvalidDimensions {
        /// Requested width
        width: i32,
        /// Requested height
        height: i32,
        /// Why the dimensions are invalid
        reason: String,
    },

    /// A format name could not be parsed, or a format is unusable here.
    #[error("unsupported pixel format: {format}")]
    UnsupportedFormat {
        /// Format name or description
        format: String,
    },

    /// Byte widths of two formats differ where they must agree.
    ///
    /// Returned when a soft format is requested whose bytes-per-pixel does
    /// not match the storage's native format.
    #[error("format byte width mismatch: expected {expected} bytes/px, got {got}")]
    FormatWidthMismatch {
        /// Required bytes per pixel
        expected: usize,
        /// Offered bytes per pixel
        got: usize,
    },

    /// A file is not a tile buffer, or its header is inconsistent.
    #[error("corrupt buffer file: {reason}")]
    CorruptFile {
        /// What failed to validate
        reason: String,
    },

    /// I/O error from a swap file or tile directory.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with custom message.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Creates an [`Error::InvalidDimensions`].
    #[inline]
    pub fn invalid_dimensions(width: i32, height: i32, reason: impl Into<String>) -> Self {
        Self::InvalidDimensions {
            width,
            height,
            reason: reason.into(),
        }
    }

    /// Creates an [`Error::UnsupportedFormat`].
    #[inline]
    pub fn unsupported_format(format: impl Into<String>) -> Self {
        Self::UnsupportedFormat {
            format: format.into(),
        }
    }

    /// Creates an [`Error::CorruptFile`].
    #[inline]
    pub fn corrupt_file(reason: impl Into<String>) -> Self {
        Self::CorruptFile {
            reason: reason.into(),
        }
    }

    /// Creates an [`Error::Other`].
    #[inline]
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Returns `true` if this is an I/O error.
    #[inline]
    pub fn is_io_error(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
