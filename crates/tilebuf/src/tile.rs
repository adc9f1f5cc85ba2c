//! Tiles: fixed-size pixel slabs with copy-on-write sharing.
//!
//! A [`Tile`] is a cheaply clonable handle (reference count) over a tile
//! header. The pixel bytes live in a slab that may be **shared** between
//! several tiles: duplicating a tile ([`Tile::dup`]) produces a sibling
//! that points at the same slab. The set of tiles sharing one slab is the
//! COW ring; its length is the slab's reference count.
//!
//! Writing requires the tile lock ([`Tile::lock`]). Taking the lock on a
//! tile whose slab is shared first **unclones** it: the tile gets a private
//! copy of the bytes, leaving the siblings untouched. Readers that were
//! holding the old slab keep a consistent snapshot.
//!
//! Dirtiness is tracked with two revision counters: `rev` advances on every
//! unlock, `stored_rev` catches up when the tile is written to its backend.
//! A dirty tile that drops its last reference writes itself back first.
//!
//! Level-0 writes invalidate the mipmap pyramid above the tile, up to the
//! deepest zoom level the owning storage has synthesized.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use tracing::warn;

use crate::storage::TileStorage;

/// Number of spin iterations before the lock watchdog logs.
const LOCK_WATCHDOG_SPINS: u32 = 1000;

/// Computes the tile index containing pixel coordinate `coord`.
///
/// Floor division: negative coordinates map to negative indices.
#[inline]
pub fn tile_index(coord: i32, tile: i32) -> i32 {
    if coord >= 0 {
        coord / tile
    } else {
        (coord + 1) / tile - 1
    }
}

/// Computes the offset of pixel coordinate `coord` within its tile.
///
/// Always in `[0, tile)`.
#[inline]
pub fn tile_offset(coord: i32, tile: i32) -> i32 {
    coord.rem_euclid(tile)
}

/// Callback releasing externally provided pixel memory.
pub type ReleaseFn = Box<dyn FnMut(&mut Vec<u8>) + Send + Sync>;

/// The pixel slab shared by a COW ring.
///
/// Exactly one drop of the slab runs the release callback; a cloned slab
/// (unclone) owns plain heap memory and carries no callback.
pub(crate) struct Slab {
    bytes: Vec<u8>,
    release: Option<ReleaseFn>,
}

impl Slab {
    fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            release: None,
        }
    }
}

impl Clone for Slab {
    fn clone(&self) -> Self {
        Self {
            bytes: self.bytes.clone(),
            release: None,
        }
    }
}

impl Drop for Slab {
    fn drop(&mut self) {
        if let Some(mut release) = self.release.take() {
            release(&mut self.bytes);
        }
    }
}

pub(crate) struct TileState {
    size: usize,
    slab: RwLock<Arc<Slab>>,
    rev: AtomicU64,
    stored_rev: AtomicU64,
    lock: AtomicBool,
    is_zero: AtomicBool,
    x: AtomicI32,
    y: AtomicI32,
    z: AtomicI32,
    storage: Mutex<Weak<TileStorage>>,
    unlock_notify: Mutex<Option<Box<dyn Fn(&Tile) + Send + Sync>>>,
}

impl Drop for TileState {
    fn drop(&mut self) {
        // Last reference to a dirty tile: write through before the bytes go
        // away. Tolerates a drained storage (shutdown order).
        if self.rev.load(Ordering::Relaxed) == self.stored_rev.load(Ordering::Relaxed) {
            return;
        }
        let storage = self.storage.get_mut().unwrap().upgrade();
        if let Some(storage) = storage {
            let slab = self.slab.get_mut().unwrap().clone();
            storage.write_back(
                self.x.load(Ordering::Relaxed),
                self.y.load(Ordering::Relaxed),
                self.z.load(Ordering::Relaxed),
                slab,
                self.size,
            );
        }
    }
}

/// Handle to a tile. Cloning bumps the reference count.
pub struct Tile {
    state: Arc<TileState>,
}

impl Clone for Tile {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl Tile {
    fn from_slab(slab: Arc<Slab>, size: usize, is_zero: bool) -> Self {
        Self {
            state: Arc::new(TileState {
                size,
                slab: RwLock::new(slab),
                rev: AtomicU64::new(1),
                stored_rev: AtomicU64::new(1),
                lock: AtomicBool::new(false),
                is_zero: AtomicBool::new(is_zero),
                x: AtomicI32::new(0),
                y: AtomicI32::new(0),
                z: AtomicI32::new(0),
                storage: Mutex::new(Weak::new()),
                unlock_notify: Mutex::new(None),
            }),
        }
    }

    /// Creates a tile with a zeroed private slab of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self::from_slab(Arc::new(Slab::new(vec![0u8; size])), size, false)
    }

    /// Creates the shared zero tile used by the empty handler.
    pub fn new_zero(size: usize) -> Self {
        Self::from_slab(Arc::new(Slab::new(vec![0u8; size])), size, true)
    }

    /// Creates a tile owning the given bytes.
    pub(crate) fn from_vec(bytes: Vec<u8>) -> Self {
        let size = bytes.len();
        Self::from_slab(Arc::new(Slab::new(bytes)), size, false)
    }

    /// Creates a tile over caller-provided bytes with a release callback.
    ///
    /// The callback runs exactly once, when the last tile sharing the slab
    /// drops. An uncloned copy does not inherit the callback.
    pub(crate) fn from_vec_with_release(bytes: Vec<u8>, release: ReleaseFn) -> Self {
        let size = bytes.len();
        Self::from_slab(
            Arc::new(Slab {
                bytes,
                release: Some(release),
            }),
            size,
            false,
        )
    }

    /// Rebuilds a tile header around an existing slab for terminal
    /// write-back. Carries no storage link and is born clean.
    pub(crate) fn for_write_back(slab: Arc<Slab>, size: usize, x: i32, y: i32, z: i32) -> Self {
        let tile = Self::from_slab(slab, size, false);
        tile.set_coords(x, y, z);
        tile
    }

    /// Slab size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.state.size
    }

    /// Duplicates this tile as a COW sibling sharing the same slab.
    pub fn dup(&self) -> Tile {
        let slab = Arc::clone(&self.state.slab.read().unwrap());
        let tile = Self::from_slab(slab, self.state.size, self.is_zero_tile());
        let (x, y, z) = self.coords();
        tile.set_coords(x, y, z);
        *tile.state.storage.lock().unwrap() = self.state.storage.lock().unwrap().clone();
        tile
    }

    /// Number of tiles currently sharing this tile's slab.
    pub fn sibling_count(&self) -> usize {
        Arc::strong_count(&self.state.slab.read().unwrap())
    }

    /// Whether this tile shares its slab with `other`.
    pub fn shares_data(&self, other: &Tile) -> bool {
        Arc::ptr_eq(
            &self.state.slab.read().unwrap(),
            &other.state.slab.read().unwrap(),
        )
    }

    /// Whether `self` and `other` are handles to the same tile.
    #[inline]
    pub fn same(&self, other: &Tile) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Whether this tile still wears the shared-zero marker.
    #[inline]
    pub fn is_zero_tile(&self) -> bool {
        self.state.is_zero.load(Ordering::Relaxed)
    }

    /// Acquires the write lock, uncloning a shared slab first.
    ///
    /// Spins with a short sleep; logs through the watchdog if the lock
    /// stays contended. Exactly one writer may hold the lock.
    pub fn lock(&self) {
        let mut slept: u32 = 0;
        while self
            .state
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            slept += 1;
            if slept == LOCK_WATCHDOG_SPINS {
                warn!(
                    "tile lock contended for {} spins at ({}, {}, {})",
                    LOCK_WATCHDOG_SPINS,
                    self.state.x.load(Ordering::Relaxed),
                    self.state.y.load(Ordering::Relaxed),
                    self.state.z.load(Ordering::Relaxed)
                );
            }
            std::thread::sleep(Duration::from_micros(5));
        }
        self.unclone();
    }

    /// Gives this tile a private slab if it is currently shared.
    fn unclone(&self) {
        let mut guard = self.state.slab.write().unwrap();
        if Arc::strong_count(&guard) > 1 {
            *guard = Arc::new(Slab::clone(&guard));
            self.state.is_zero.store(false, Ordering::Relaxed);
        }
    }

    /// Releases the write lock, advancing the revision.
    ///
    /// Runs the unlock notify first, then (for level-0 tiles) invalidates
    /// the mipmap pyramid above this tile.
    pub fn unlock(&self) {
        let notify = self.state.unlock_notify.lock().unwrap();
        if let Some(f) = notify.as_ref() {
            f(self);
        }
        drop(notify);

        if !self.state.lock.load(Ordering::Relaxed) {
            warn!("unlocked a tile that was not locked");
            return;
        }
        if self.state.z.load(Ordering::Relaxed) == 0 {
            self.void_pyramid();
        }
        self.state.rev.fetch_add(1, Ordering::Relaxed);
        self.state.lock.store(false, Ordering::Release);
    }

    fn void_pyramid(&self) {
        if let Some(storage) = self.storage() {
            storage.void_pyramid(
                self.state.x.load(Ordering::Relaxed),
                self.state.y.load(Ordering::Relaxed),
            );
        }
    }

    /// Runs `f` over the tile's bytes.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.state.slab.read().unwrap();
        f(&guard.bytes)
    }

    /// Runs `f` over the tile's bytes mutably.
    ///
    /// Call between [`lock`](Self::lock) and [`unlock`](Self::unlock); a
    /// shared slab is uncloned on the way in as a safety net.
    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut guard = self.state.slab.write().unwrap();
        let slab = Arc::make_mut(&mut guard);
        f(&mut slab.bytes)
    }

    /// Current revision.
    #[inline]
    pub fn rev(&self) -> u64 {
        self.state.rev.load(Ordering::Relaxed)
    }

    /// Revision last written to the backend.
    #[inline]
    pub fn stored_rev(&self) -> u64 {
        self.state.stored_rev.load(Ordering::Relaxed)
    }

    /// Whether the tile has no pending writes.
    #[inline]
    pub fn is_stored(&self) -> bool {
        self.stored_rev() == self.rev()
    }

    /// Marks all pending writes as persisted.
    #[inline]
    pub fn mark_stored(&self) {
        self.state
            .stored_rev
            .store(self.rev(), Ordering::Relaxed);
    }

    /// Writes the tile through to its storage's backend if dirty.
    ///
    /// Returns `true` when the tile ends up stored (including the
    /// already-clean case), `false` when it has no storage to store into.
    pub fn store(&self) -> bool {
        if self.is_stored() {
            return true;
        }
        let Some(storage) = self.storage() else {
            return false;
        };
        storage.store_tile(self)
    }

    /// Drops any pending writes and invalidates the pyramid above.
    pub fn void(&self) {
        self.mark_stored();
        if self.state.z.load(Ordering::Relaxed) == 0 {
            self.void_pyramid();
        }
    }

    /// Tile coordinates within the owning storage.
    #[inline]
    pub fn coords(&self) -> (i32, i32, i32) {
        (
            self.state.x.load(Ordering::Relaxed),
            self.state.y.load(Ordering::Relaxed),
            self.state.z.load(Ordering::Relaxed),
        )
    }

    pub(crate) fn set_coords(&self, x: i32, y: i32, z: i32) {
        self.state.x.store(x, Ordering::Relaxed);
        self.state.y.store(y, Ordering::Relaxed);
        self.state.z.store(z, Ordering::Relaxed);
    }

    /// Upgrades the storage back-pointer, if the storage is still alive.
    pub(crate) fn storage(&self) -> Option<Arc<TileStorage>> {
        self.state.storage.lock().unwrap().upgrade()
    }

    pub(crate) fn has_storage(&self) -> bool {
        self.state.storage.lock().unwrap().strong_count() > 0
    }

    pub(crate) fn set_storage(&self, storage: Weak<TileStorage>) {
        *self.state.storage.lock().unwrap() = storage;
    }

    pub(crate) fn clear_storage(&self) {
        *self.state.storage.lock().unwrap() = Weak::new();
    }

    /// Installs a callback invoked inside [`unlock`](Self::unlock) before
    /// the dirty mark is applied.
    pub fn set_unlock_notify(&self, notify: Option<Box<dyn Fn(&Tile) + Send + Sync>>) {
        *self.state.unlock_notify.lock().unwrap() = notify;
    }
}

impl std::fmt::Debug for Tile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (x, y, z) = self.coords();
        f.debug_struct("Tile")
            .field("size", &self.state.size)
            .field("coords", &(x, y, z))
            .field("rev", &self.rev())
            .field("stored_rev", &self.stored_rev())
            .field("siblings", &self.sibling_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_index_and_offset() {
        assert_eq!(tile_index(0, 4), 0);
        assert_eq!(tile_index(3, 4), 0);
        assert_eq!(tile_index(4, 4), 1);
        assert_eq!(tile_index(-1, 4), -1);
        assert_eq!(tile_index(-4, 4), -1);
        assert_eq!(tile_index(-5, 4), -2);

        assert_eq!(tile_offset(0, 4), 0);
        assert_eq!(tile_offset(5, 4), 1);
        assert_eq!(tile_offset(-1, 4), 3);
        assert_eq!(tile_offset(-4, 4), 0);
    }

    #[test]
    fn test_new_tile_is_clean_and_unique() {
        let t = Tile::new(64);
        assert_eq!(t.size(), 64);
        assert!(t.is_stored());
        assert_eq!(t.sibling_count(), 1);
        t.with_data(|d| assert!(d.iter().all(|&b| b == 0)));
    }

    #[test]
    fn test_lock_unlock_advances_rev() {
        let t = Tile::new(16);
        let rev_before = t.rev();
        t.lock();
        t.with_data_mut(|d| d[0] = 7);
        t.unlock();
        assert!(t.rev() > rev_before);
        assert_eq!(t.stored_rev(), rev_before);
        assert!(!t.is_stored());
    }

    #[test]
    fn test_dup_shares_then_lock_unclones() {
        let a = Tile::new(16);
        a.lock();
        a.with_data_mut(|d| d.fill(9));
        a.unlock();

        let b = a.dup();
        assert_eq!(a.sibling_count(), 2);
        assert_eq!(b.sibling_count(), 2);
        assert!(a.shares_data(&b));

        b.lock();
        assert_eq!(b.sibling_count(), 1);
        assert_eq!(a.sibling_count(), 1);
        assert!(!a.shares_data(&b));
        // the private copy starts with identical contents
        b.with_data(|d| assert!(d.iter().all(|&v| v == 9)));
        b.with_data_mut(|d| d.fill(3));
        b.unlock();

        a.with_data(|d| assert!(d.iter().all(|&v| v == 9)));
        b.with_data(|d| assert!(d.iter().all(|&v| v == 3)));
    }

    #[test]
    fn test_zero_tile_dup_loses_marker_on_write() {
        let zero = Tile::new_zero(8);
        let t = zero.dup();
        assert!(t.is_zero_tile());
        t.lock();
        t.unlock();
        assert!(!t.is_zero_tile());
        assert!(zero.is_zero_tile());
    }

    #[test]
    fn test_release_callback_runs_once_for_ring() {
        use std::sync::atomic::AtomicU32;
        static CALLS: AtomicU32 = AtomicU32::new(0);

        let t = Tile::from_vec_with_release(
            vec![1, 2, 3, 4],
            Box::new(|_| {
                CALLS.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let sib = t.dup();
        drop(t);
        assert_eq!(CALLS.load(Ordering::SeqCst), 0);
        drop(sib);
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_uncloned_copy_does_not_inherit_release() {
        use std::sync::atomic::AtomicU32;
        static CALLS: AtomicU32 = AtomicU32::new(0);

        let t = Tile::from_vec_with_release(
            vec![0; 4],
            Box::new(|_| {
                CALLS.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let sib = t.dup();
        sib.lock(); // uncloned: private slab, no callback
        sib.unlock();
        drop(sib);
        assert_eq!(CALLS.load(Ordering::SeqCst), 0);
        drop(t);
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_mark_stored() {
        let t = Tile::new(4);
        t.lock();
        t.unlock();
        assert!(!t.is_stored());
        t.mark_stored();
        assert!(t.is_stored());
    }

    #[test]
    fn test_unlock_notify_runs_before_dirty_mark() {
        use std::sync::atomic::AtomicU64;
        let seen_rev = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&seen_rev);

        let t = Tile::new(4);
        t.set_unlock_notify(Some(Box::new(move |tile: &Tile| {
            seen.store(tile.rev(), Ordering::SeqCst);
        })));
        let before = t.rev();
        t.lock();
        t.unlock();
        // the notify observed the pre-bump revision
        assert_eq!(seen_rev.load(Ordering::SeqCst), before);
        assert_eq!(t.rev(), before + 1);
    }
}
