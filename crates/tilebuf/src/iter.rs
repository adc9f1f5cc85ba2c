//! Multi-buffer, tile-aware scanline iteration.
//!
//! A [`BufferIterator`] walks a region of interest in tile-aligned
//! sub-rectangles and exposes the pixels of up to several buffers at once.
//! Slot 0 (given to [`BufferIterator::new`]) defines the walk: its
//! buffer's tile grid cuts the region into runs, yielded in tile-major
//! order (tile row by tile row, left to right). Every added slot follows
//! the same shape at its own offset, with its own pixel format and abyss
//! policy.
//!
//! On each [`next`](BufferIterator::next) the iterator fills the staging
//! buffer of every readable slot, and commits the staging buffer of every
//! writable slot from the *previous* step. Dropping the iterator commits
//! the final pending writes, so an early exit never loses committed runs.
//!
//! ```no_run
//! use tilebuf::{AbyssPolicy, Access, Buffer, BufferIterator};
//! use tilebuf_core::{PixelFormat, Rect};
//!
//! let a = Buffer::new(Rect::new(0, 0, 64, 64), PixelFormat::Y_F32);
//! let b = Buffer::new(Rect::new(0, 0, 64, 64), PixelFormat::Y_F32);
//! let rect = Rect::new(0, 0, 64, 64);
//! let mut iter = BufferIterator::new(a, rect, PixelFormat::Y_F32, Access::Write, AbyssPolicy::None);
//! let src = iter.add(b, rect, PixelFormat::Y_F32, Access::Read, AbyssPolicy::None);
//! while iter.next() {
//!     let (dst, src) = iter.data_pair(0, src);
//!     dst.copy_from_slice(src);
//! }
//! ```

use tracing::warn;

use tilebuf_core::{PixelFormat, Rect};

use crate::access::{iterate_read_dispatch, iterate_write};
use crate::buffer::{AbyssPolicy, Buffer};
use crate::tile::tile_offset;

/// How a slot participates in the iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// The slot's staging buffer is filled before each step.
    Read,
    /// The slot's staging buffer is committed after each step.
    Write,
    /// Both: filled before, committed after.
    ReadWrite,
}

impl Access {
    #[inline]
    fn reads(&self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    #[inline]
    fn writes(&self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

struct Slot {
    buffer: Buffer,
    rect: Rect,
    format: PixelFormat,
    access: Access,
    policy: AbyssPolicy,
    data: Vec<u8>,
    roi: Rect,
}

/// Tile-aware scanline iterator over one or more buffers.
pub struct BufferIterator {
    slots: Vec<Slot>,
    length: usize,
    col: i32,
    row: i32,
    active: bool,
}

impl BufferIterator {
    /// Creates the iterator with slot 0, which defines the walk order.
    pub fn new(
        buffer: Buffer,
        rect: Rect,
        format: PixelFormat,
        access: Access,
        policy: AbyssPolicy,
    ) -> BufferIterator {
        BufferIterator {
            slots: vec![Slot {
                buffer,
                rect,
                format,
                access,
                policy,
                data: Vec::new(),
                roi: Rect::zero(),
            }],
            length: 0,
            col: 0,
            row: 0,
            active: false,
        }
    }

    /// Adds a slot following slot 0's shape. Returns the slot index.
    ///
    /// The rectangle must have slot 0's size; a mismatch is logged and the
    /// size is forced.
    pub fn add(
        &mut self,
        buffer: Buffer,
        rect: Rect,
        format: PixelFormat,
        access: Access,
        policy: AbyssPolicy,
    ) -> usize {
        let shape = self.slots[0].rect;
        let mut rect = rect;
        if rect.width != shape.width || rect.height != shape.height {
            warn!(
                "iterator slot rect {}x{} does not match slot 0 ({}x{}); forcing",
                rect.width, rect.height, shape.width, shape.height
            );
            rect.width = shape.width;
            rect.height = shape.height;
        }
        self.slots.push(Slot {
            buffer,
            rect,
            format,
            access,
            policy,
            data: Vec::new(),
            roi: Rect::zero(),
        });
        self.slots.len() - 1
    }

    /// Next tile-aligned sub-rectangle of slot 0's rect, in slot 0's
    /// buffer coordinates.
    fn advance(&mut self) -> Option<Rect> {
        let slot0 = &self.slots[0];
        let rect = slot0.rect;
        if rect.is_empty() || self.row >= rect.height {
            return None;
        }
        let storage = slot0.buffer.storage();
        let tile_width = storage.tile_width();
        let tile_height = storage.tile_height();
        let (shift_x, shift_y) = slot0.buffer.shift();

        let offset_y = tile_offset(rect.y + shift_y + self.row, tile_height);
        let offset_x = tile_offset(rect.x + shift_x + self.col, tile_width);
        let width = (tile_width - offset_x).min(rect.width - self.col);
        let height = (tile_height - offset_y).min(rect.height - self.row);
        let run = Rect::new(rect.x + self.col, rect.y + self.row, width, height);

        self.col += width;
        if self.col >= rect.width {
            self.col = 0;
            self.row += height;
        }
        Some(run)
    }

    /// Commits pending writes, then steps to the next run.
    ///
    /// Returns `false` when the region is exhausted (pending writes are
    /// committed first).
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> bool {
        if self.active {
            self.write_back();
        }
        let run = match self.advance() {
            Some(run) => run,
            None => {
                self.active = false;
                self.length = 0;
                return false;
            }
        };

        let origin = (self.slots[0].rect.x, self.slots[0].rect.y);
        let length = (run.width * run.height) as usize;
        self.length = length;

        for slot in self.slots.iter_mut() {
            slot.roi = Rect::new(
                slot.rect.x + (run.x - origin.0),
                slot.rect.y + (run.y - origin.1),
                run.width,
                run.height,
            );
            let bytes = length * slot.format.bytes_per_pixel();
            slot.data.clear();
            slot.data.resize(bytes, 0);
            if slot.access.reads() {
                iterate_read_dispatch(
                    &slot.buffer,
                    &slot.roi,
                    &mut slot.data,
                    0,
                    slot.format,
                    0,
                    slot.policy,
                );
            }
        }
        self.active = true;
        true
    }

    fn write_back(&mut self) {
        for slot in self.slots.iter() {
            if slot.access.writes() {
                iterate_write(&slot.buffer, Some(&slot.roi), &slot.data, 0, slot.format, 0);
            }
        }
    }

    /// Pixels in the current run.
    #[inline]
    pub fn length(&self) -> usize {
        self.length
    }

    /// The current run in slot `index`'s buffer coordinates.
    pub fn roi(&self, index: usize) -> Rect {
        self.slots[index].roi
    }

    /// The current run's pixels for slot `index`.
    pub fn data(&self, index: usize) -> &[u8] {
        &self.slots[index].data
    }

    /// The current run's pixels for slot `index`, mutable.
    pub fn data_mut(&mut self, index: usize) -> &mut [u8] {
        &mut self.slots[index].data
    }

    /// Mutable access to one slot's pixels alongside shared access to
    /// another's, for converting copies.
    pub fn data_pair(&mut self, write_index: usize, read_index: usize) -> (&mut [u8], &[u8]) {
        assert_ne!(write_index, read_index);
        if write_index < read_index {
            let (lo, hi) = self.slots.split_at_mut(read_index);
            (&mut lo[write_index].data, &hi[0].data)
        } else {
            let (lo, hi) = self.slots.split_at_mut(write_index);
            (&mut hi[0].data, &lo[read_index].data)
        }
    }

    /// Commits pending writes and ends the iteration.
    pub fn close(self) {}
}

impl Drop for BufferIterator {
    fn drop(&mut self) {
        if self.active {
            self.write_back();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilebuf_core::PixelFormat;

    fn value_at(buffer: &Buffer, x: i32, y: i32) -> f32 {
        let mut out = [0u8; 4];
        buffer.get_pixel(x, y, None, &mut out, AbyssPolicy::None);
        f32::from_ne_bytes(out)
    }

    #[test]
    fn test_runs_cover_region_once() {
        let b = Buffer::new(Rect::new(0, 0, 20, 20), PixelFormat::Y_F32);
        let rect = Rect::new(0, 0, 20, 20);
        let mut iter = BufferIterator::new(
            b.clone(),
            rect,
            PixelFormat::Y_F32,
            Access::Read,
            AbyssPolicy::None,
        );
        let mut covered = 0usize;
        let mut last_band_y = i32::MIN;
        while iter.next() {
            covered += iter.length();
            let roi = iter.roi(0);
            assert!(rect.contains_rect(&roi));
            assert!(roi.y >= last_band_y);
            last_band_y = roi.y;
        }
        assert_eq!(covered, 400);
    }

    #[test]
    fn test_write_slot_commits() {
        let b = Buffer::new(Rect::new(0, 0, 10, 10), PixelFormat::Y_F32);
        let rect = Rect::new(0, 0, 10, 10);
        let mut iter = BufferIterator::new(
            b.clone(),
            rect,
            PixelFormat::Y_F32,
            Access::Write,
            AbyssPolicy::None,
        );
        while iter.next() {
            for chunk in iter.data_mut(0).chunks_exact_mut(4) {
                chunk.copy_from_slice(&0.5f32.to_ne_bytes());
            }
        }
        drop(iter);
        assert_eq!(value_at(&b, 0, 0), 0.5);
        assert_eq!(value_at(&b, 9, 9), 0.5);
    }

    #[test]
    fn test_drop_commits_pending_run() {
        let b = Buffer::new(Rect::new(0, 0, 4, 4), PixelFormat::Y_F32);
        let mut iter = BufferIterator::new(
            b.clone(),
            Rect::new(0, 0, 4, 4),
            PixelFormat::Y_F32,
            Access::Write,
            AbyssPolicy::None,
        );
        assert!(iter.next());
        for chunk in iter.data_mut(0).chunks_exact_mut(4) {
            chunk.copy_from_slice(&1.0f32.to_ne_bytes());
        }
        drop(iter); // commits without a second next()
        assert_eq!(value_at(&b, 3, 3), 1.0);
    }

    #[test]
    fn test_two_slot_copy_with_offset_rects() {
        let src = Buffer::new(Rect::new(0, 0, 8, 8), PixelFormat::Y_F32);
        for y in 0..8 {
            for x in 0..8 {
                src.set_pixel(x, y, None, &((y * 8 + x) as f32).to_ne_bytes());
            }
        }
        let dst = Buffer::new(Rect::new(0, 0, 8, 8), PixelFormat::Y_F32);

        let mut iter = BufferIterator::new(
            dst.clone(),
            Rect::new(2, 2, 4, 4),
            PixelFormat::Y_F32,
            Access::Write,
            AbyssPolicy::None,
        );
        let read = iter.add(
            src.clone(),
            Rect::new(0, 0, 4, 4),
            PixelFormat::Y_F32,
            Access::Read,
            AbyssPolicy::None,
        );
        while iter.next() {
            let (out, input) = iter.data_pair(0, read);
            out.copy_from_slice(input);
        }

        assert_eq!(value_at(&dst, 2, 2), 0.0);
        assert_eq!(value_at(&dst, 5, 5), (3 * 8 + 3) as f32);
        assert_eq!(value_at(&dst, 0, 0), 0.0);
    }

    #[test]
    fn test_readwrite_slot_sees_previous_contents() {
        let b = Buffer::new(Rect::new(0, 0, 4, 4), PixelFormat::Y_F32);
        b.set_pixel(1, 1, None, &2.0f32.to_ne_bytes());

        let mut iter = BufferIterator::new(
            b.clone(),
            Rect::new(0, 0, 4, 4),
            PixelFormat::Y_F32,
            Access::ReadWrite,
            AbyssPolicy::None,
        );
        while iter.next() {
            let roi = iter.roi(0);
            let data = iter.data_mut(0);
            for py in 0..roi.height {
                for px in 0..roi.width {
                    let at = ((py * roi.width + px) * 4) as usize;
                    let v = f32::from_ne_bytes(data[at..at + 4].try_into().unwrap());
                    let doubled = (v * 2.0).to_ne_bytes();
                    data[at..at + 4].copy_from_slice(&doubled);
                }
            }
        }
        assert_eq!(value_at(&b, 1, 1), 4.0);
        assert_eq!(value_at(&b, 0, 0), 0.0);
    }
}
