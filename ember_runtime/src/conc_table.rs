//! Concurrent, GC-aware hash table keyed by machine words.
//!
//! Open addressing with linear probing and lazy (tombstone) deletion.
//! Readers are lock-free: `lookup` probes the currently installed
//! generation under an epoch pin and never blocks. Writers are serialized
//! by an internal mutex and proceed concurrently with readers; a resize
//! builds a fresh generation off to the side and installs it with a single
//! atomic pointer swap, retiring the old generation through the
//! reclamation domain.
//!
//! # Publication protocol
//!
//! An insert writes the value slot, fences, then writes the key slot. A
//! reader that has matched a key therefore always observes a fully written
//! value; a null value read after a key match means a concurrent delete is
//! in progress and the probe restarts. Deletion clears the value, fences,
//! then tombstones the key, so probe chains keep walking past deleted
//! slots.
//!
//! Keys and values are opaque non-zero words: `0` is the empty-slot
//! sentinel and `usize::MAX` the tombstone.

use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering, fence};

use parking_lot::Mutex;

use crate::gc::{GcPolicy, NullRegistrar, RootRegistrar};
use crate::reclaim::ReclaimDomain;

// =============================================================================
// Constants
// =============================================================================

/// Default slot count of a fresh table. Always a power of two.
pub const INITIAL_SIZE: usize = 32;

/// Fraction of slots that may be occupied before a resize triggers.
pub const LOAD_FACTOR: f32 = 0.75;

/// Growth factor on overflow. Must keep capacity a power of two.
const EXPAND_RATIO: usize = 2;

/// Key sentinel marking a deleted slot. Distinct from the empty sentinel so
/// probing continues past deleted entries.
pub const TOMBSTONE: usize = usize::MAX;

/// Hash function over opaque word keys.
pub type HashFn = fn(usize) -> u64;

/// Equality function over opaque word keys.
pub type EqualFn = fn(usize, usize) -> bool;

/// Destructor hook invoked for keys/values dropped from the table.
pub type DestroyFn = fn(usize);

/// Identity hash, the default when no hash function is supplied. Matches
/// direct pointer-keyed use where the word itself is the identity.
pub fn direct_hash(key: usize) -> u64 {
    key as u64
}

/// Mix the bits of a hash with two primes.
///
/// Power-of-two tables cluster badly on aligned keys; mixing the hash with
/// two primes spreads aligned pointers across the slot space.
#[inline(always)]
fn mix_hash(hash: u64) -> u64 {
    (hash.wrapping_mul(215_497) >> 16) ^ hash.wrapping_mul(1_823_231).wrapping_add(hash)
}

// =============================================================================
// Generation
// =============================================================================

/// One immutable-capacity generation of the table. Slots are tombstoned or
/// filled in place; capacity changes only by installing a new generation.
struct Generation {
    /// `capacity - 1`; capacity is a power of two so probing masks.
    mask: usize,
    keys: Box<[AtomicUsize]>,
    values: Box<[AtomicUsize]>,
}

impl Generation {
    fn new(capacity: usize, policy: GcPolicy, roots: &dyn RootRegistrar) -> Box<Generation> {
        debug_assert!(capacity.is_power_of_two());
        let alloc = |n: usize| -> Box<[AtomicUsize]> {
            (0..n).map(|_| AtomicUsize::new(0)).collect()
        };
        let generation = Box::new(Generation {
            mask: capacity - 1,
            keys: alloc(capacity),
            values: alloc(capacity),
        });
        let bytes = capacity * std::mem::size_of::<usize>();
        if policy.tracks_keys() {
            roots.register_root(generation.keys.as_ptr() as *const u8, bytes);
        }
        if policy.tracks_values() {
            roots.register_root(generation.values.as_ptr() as *const u8, bytes);
        }
        generation
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.mask + 1
    }

    fn deregister(&self, policy: GcPolicy, roots: &dyn RootRegistrar) {
        if policy.tracks_keys() {
            roots.deregister_root(self.keys.as_ptr() as *const u8);
        }
        if policy.tracks_values() {
            roots.deregister_root(self.values.as_ptr() as *const u8);
        }
    }
}

/// Free a generation previously leaked via `Box::into_raw`.
///
/// # Safety
/// `ptr` must originate from `Box::into_raw` on a `Generation` and must not
/// be freed twice.
unsafe fn free_generation(ptr: *mut Generation, policy: GcPolicy, roots: &dyn RootRegistrar) {
    let generation = Box::from_raw(ptr);
    generation.deregister(policy, roots);
    drop(generation);
}

// =============================================================================
// ConcurrentWordTable
// =============================================================================

struct WriterState {
    element_count: usize,
    overflow_count: usize,
}

/// Concurrent open-addressing hash table over opaque machine words.
///
/// `lookup` may be called from any number of threads at once and never
/// blocks. `insert` and `remove` are serialized internally and may run
/// concurrently with readers.
pub struct ConcurrentWordTable {
    /// Currently installed generation. Swapped atomically on resize.
    current: AtomicPtr<Generation>,
    domain: Arc<ReclaimDomain>,
    writer: Mutex<WriterState>,
    hash_fn: HashFn,
    equal_fn: Option<EqualFn>,
    key_destroy: Option<DestroyFn>,
    value_destroy: Option<DestroyFn>,
    policy: GcPolicy,
    roots: Arc<dyn RootRegistrar>,
}

// SAFETY: the generation pointer is only mutated under the writer mutex and
// only read through acquire loads; retired generations outlive all readers
// via the reclamation domain.
unsafe impl Send for ConcurrentWordTable {}
unsafe impl Sync for ConcurrentWordTable {}

impl ConcurrentWordTable {
    /// Create an empty table with the default capacity.
    ///
    /// With no hash function, keys hash to themselves; with no equality
    /// function, keys compare by identity.
    pub fn new(hash_fn: Option<HashFn>, equal_fn: Option<EqualFn>) -> Self {
        Self::with_gc_policy(hash_fn, equal_fn, GcPolicy::None, Arc::new(NullRegistrar))
    }

    /// Create an empty table whose key/value arrays are registered as GC
    /// roots according to `policy`.
    pub fn with_gc_policy(
        hash_fn: Option<HashFn>,
        equal_fn: Option<EqualFn>,
        policy: GcPolicy,
        roots: Arc<dyn RootRegistrar>,
    ) -> Self {
        let generation = Generation::new(INITIAL_SIZE, policy, roots.as_ref());
        ConcurrentWordTable {
            current: AtomicPtr::new(Box::into_raw(generation)),
            domain: Arc::new(ReclaimDomain::new()),
            writer: Mutex::new(WriterState {
                element_count: 0,
                overflow_count: (INITIAL_SIZE as f32 * LOAD_FACTOR) as usize,
            }),
            hash_fn: hash_fn.unwrap_or(direct_hash),
            equal_fn,
            key_destroy: None,
            value_destroy: None,
            policy,
            roots,
        }
    }

    /// Attach destructor hooks run for keys/values removed from the table
    /// (on `remove` and on drop).
    pub fn with_destructors(
        mut self,
        key_destroy: Option<DestroyFn>,
        value_destroy: Option<DestroyFn>,
    ) -> Self {
        self.key_destroy = key_destroy;
        self.value_destroy = value_destroy;
        self
    }

    #[inline]
    fn keys_equal(&self, a: usize, b: usize) -> bool {
        match self.equal_fn {
            Some(eq) => eq(a, b),
            None => a == b,
        }
    }

    #[inline]
    fn hash_of(&self, key: usize) -> u64 {
        mix_hash((self.hash_fn)(key))
    }

    /// Look up `key`, returning its value if present.
    pub fn lookup(&self, key: usize) -> Option<usize> {
        self.lookup_extended(key).map(|(_, value)| value)
    }

    /// Look up `key`, returning the stored (original) key and the value.
    ///
    /// Lock-free; safe to call concurrently with a writer.
    pub fn lookup_extended(&self, key: usize) -> Option<(usize, usize)> {
        let hash = self.hash_of(key);
        let _guard = self.domain.pin();

        'retry: loop {
            let table_ptr = self.current.load(Ordering::Acquire);
            // SAFETY: the epoch pin taken above keeps any generation loaded
            // from `current` alive until the guard drops.
            let table = unsafe { &*table_ptr };
            let mask = table.mask;
            let mut i = (hash as usize) & mask;

            loop {
                let cur_key = table.keys[i].load(Ordering::Acquire);
                if cur_key == 0 {
                    break;
                }
                if cur_key != TOMBSTONE && self.keys_equal(key, cur_key) {
                    // The read of the key must happen before the read of the
                    // value.
                    fence(Ordering::Acquire);
                    let value = table.values[i].load(Ordering::Acquire);
                    if value == 0 {
                        // A writer is deleting this entry concurrently.
                        continue 'retry;
                    }
                    return Some((cur_key, value));
                }
                i = (i + 1) & mask;
            }

            // The table may have been expanded while we probed; the entry
            // could live in the newer generation.
            fence(Ordering::Acquire);
            if self.current.load(Ordering::Acquire) != table_ptr {
                continue 'retry;
            }
            return None;
        }
    }

    /// Insert `key -> value` if `key` is absent.
    ///
    /// Returns `None` on success, or the existing value without mutating
    /// the table. Concurrent `insert`/`remove` calls are serialized
    /// internally; readers are never blocked.
    ///
    /// # Panics
    /// Panics if `key` or `value` is a reserved sentinel (0 or
    /// `usize::MAX`): null is the empty-slot marker and `usize::MAX` the
    /// tombstone.
    pub fn insert(&self, key: usize, value: usize) -> Option<usize> {
        assert!(key != 0 && key != TOMBSTONE, "reserved key word");
        assert!(value != 0, "reserved value word");

        let hash = self.hash_of(key);
        let mut w = self.writer.lock();

        if w.element_count >= w.overflow_count {
            self.expand(&mut w);
        }

        // SAFETY: we hold the writer lock, so the installed generation
        // cannot be swapped or retired underneath us.
        let table = unsafe { &*self.current.load(Ordering::Relaxed) };
        let mask = table.mask;
        let mut i = (hash as usize) & mask;

        loop {
            let cur_key = table.keys[i].load(Ordering::Relaxed);
            if cur_key == 0 || cur_key == TOMBSTONE {
                self.set_value(table, i, value);
                // The write to the value must be visible before the write to
                // the key.
                fence(Ordering::Release);
                self.set_key(table, i, key);
                w.element_count += 1;
                return None;
            }
            if self.keys_equal(key, cur_key) {
                return Some(table.values[i].load(Ordering::Relaxed));
            }
            i = (i + 1) & mask;
        }
    }

    /// Remove `key`, returning its value if it was present.
    ///
    /// The value slot is cleared first, then the key slot tombstoned, so a
    /// concurrent reader either sees the live entry or restarts; it never
    /// returns a half-deleted pair. Destructor hooks run for the removed
    /// key and value.
    pub fn remove(&self, key: usize) -> Option<usize> {
        assert!(key != 0 && key != TOMBSTONE, "reserved key word");

        let hash = self.hash_of(key);
        let mut w = self.writer.lock();

        // SAFETY: writer lock held, as in `insert`.
        let table = unsafe { &*self.current.load(Ordering::Relaxed) };
        let mask = table.mask;
        let mut i = (hash as usize) & mask;

        loop {
            let cur_key = table.keys[i].load(Ordering::Relaxed);
            if cur_key == 0 {
                return None;
            }
            if cur_key != TOMBSTONE && self.keys_equal(key, cur_key) {
                let value = table.values[i].load(Ordering::Relaxed);
                table.values[i].store(0, Ordering::Release);
                fence(Ordering::Release);
                self.set_key_slot(table, i, TOMBSTONE);
                w.element_count -= 1;

                if let Some(destroy) = self.key_destroy {
                    destroy(cur_key);
                }
                if let Some(destroy) = self.value_destroy {
                    destroy(value);
                }
                return Some(value);
            }
            i = (i + 1) & mask;
        }
    }

    /// Iterate over live entries.
    ///
    /// Single-threaded use only: the caller must ensure no writer runs
    /// concurrently, or the iteration may observe a mix of generations.
    pub fn for_each(&self, mut f: impl FnMut(usize, usize)) {
        let _guard = self.domain.pin();
        // SAFETY: epoch pin keeps the generation alive for the walk.
        let table = unsafe { &*self.current.load(Ordering::Acquire) };
        for i in 0..table.capacity() {
            let key = table.keys[i].load(Ordering::Acquire);
            if key != 0 && key != TOMBSTONE {
                let value = table.values[i].load(Ordering::Acquire);
                if value != 0 {
                    f(key, value);
                }
            }
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.writer.lock().element_count
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slot count of the installed generation. Always a power of two.
    pub fn capacity(&self) -> usize {
        let _guard = self.domain.pin();
        // SAFETY: epoch pin, as in `for_each`.
        unsafe { &*self.current.load(Ordering::Acquire) }.capacity()
    }

    /// Resize threshold of the installed generation.
    pub fn overflow_count(&self) -> usize {
        self.writer.lock().overflow_count
    }

    // -------------------------------------------------------------------------
    // Writer internals
    // -------------------------------------------------------------------------

    /// Build a generation of double capacity, rehash every live entry into
    /// it, and install it with one atomic swap. The old generation is
    /// retired and freed once no reader is pinned against it.
    fn expand(&self, w: &mut WriterState) {
        let old_ptr = self.current.load(Ordering::Relaxed);
        // SAFETY: writer lock held by the caller.
        let old = unsafe { &*old_ptr };
        let new_capacity = old.capacity() * EXPAND_RATIO;
        let new = Generation::new(new_capacity, self.policy, self.roots.as_ref());

        for i in 0..old.capacity() {
            let key = old.keys[i].load(Ordering::Relaxed);
            if key != 0 && key != TOMBSTONE {
                let value = old.values[i].load(Ordering::Relaxed);
                self.insert_one_local(&new, key, value);
            }
        }

        let new_ptr = Box::into_raw(new);
        self.current.store(new_ptr, Ordering::Release);
        w.overflow_count = (new_capacity as f32 * LOAD_FACTOR) as usize;

        let policy = self.policy;
        let roots = Arc::clone(&self.roots);
        let old_addr = old_ptr as usize;
        self.domain.retire(Box::new(move || {
            // SAFETY: the domain guarantees no reader still references the
            // retired generation when this closure runs.
            unsafe { free_generation(old_addr as *mut Generation, policy, roots.as_ref()) };
        }));
    }

    /// Insert into a not-yet-installed generation; no reader can observe
    /// it, so no publication fences are needed.
    fn insert_one_local(&self, table: &Generation, key: usize, value: usize) {
        let mask = table.mask;
        let mut i = (self.hash_of(key) as usize) & mask;
        while table.keys[i].load(Ordering::Relaxed) != 0 {
            i = (i + 1) & mask;
        }
        self.set_value(table, i, value);
        self.set_key(table, i, key);
    }

    #[inline]
    fn set_key(&self, table: &Generation, slot: usize, key: usize) {
        self.set_key_slot(table, slot, key);
    }

    #[inline]
    fn set_key_slot(&self, table: &Generation, slot: usize, key: usize) {
        table.keys[slot].store(key, Ordering::Release);
        if self.policy.tracks_keys() {
            self.roots
                .write_barrier(table.keys[slot].as_ptr(), key);
        }
    }

    #[inline]
    fn set_value(&self, table: &Generation, slot: usize, value: usize) {
        table.values[slot].store(value, Ordering::Release);
        if self.policy.tracks_values() {
            self.roots
                .write_barrier(table.values[slot].as_ptr(), value);
        }
    }
}

impl Drop for ConcurrentWordTable {
    fn drop(&mut self) {
        let table_ptr = *self.current.get_mut();
        if self.key_destroy.is_some() || self.value_destroy.is_some() {
            // SAFETY: exclusive access during drop.
            let table = unsafe { &*table_ptr };
            for i in 0..table.capacity() {
                let key = table.keys[i].load(Ordering::Relaxed);
                if key != 0 && key != TOMBSTONE {
                    if let Some(destroy) = self.key_destroy {
                        destroy(key);
                    }
                    if let Some(destroy) = self.value_destroy {
                        destroy(table.values[i].load(Ordering::Relaxed));
                    }
                }
            }
        }
        // SAFETY: no readers can exist once the table is being dropped, and
        // the pointer came from `Box::into_raw`.
        unsafe { free_generation(table_ptr, self.policy, self.roots.as_ref()) };
    }
}

impl std::fmt::Debug for ConcurrentWordTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentWordTable")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("policy", &self.policy)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
