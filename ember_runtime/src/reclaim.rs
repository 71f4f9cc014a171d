//! Epoch-based deferred reclamation.
//!
//! Readers of a swappable structure pin the current epoch for the duration
//! of their access. A writer that replaces the structure retires the old
//! version; retired memory is freed only once every pinned reader has
//! observed an epoch at or past the retirement point, so no reader can be
//! left probing freed memory.
//!
//! # Protocol
//!
//! ```text
//! reader:                        writer:
//!   slot.active = epoch            swap in new version
//!   load shared pointer            e = ++epoch
//!   ... probe ...                  retire(old, e)
//!   slot.active = 0                free retired items with
//!                                    epoch <= min(active slots)
//! ```
//!
//! A reader that publishes its epoch before loading the pointer can only
//! ever hold versions retired at a later epoch, which stay alive until the
//! reader unpins.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Number of reader slots. Readers beyond this spin until a slot frees;
/// pins are short (one probe sequence), so contention resolves quickly.
const READER_SLOTS: usize = 128;

/// Slot value meaning "no reader pinned here".
const QUIESCENT: u64 = 0;

// =============================================================================
// ReclaimDomain
// =============================================================================

struct Retired {
    epoch: u64,
    free: Box<dyn FnOnce() + Send>,
}

/// A reclamation domain: one epoch counter, a fixed array of reader slots,
/// and the list of retired objects awaiting a safe point to free.
///
/// Shared (via `Arc`) between the structure's readers and its writer.
pub struct ReclaimDomain {
    /// Global epoch. Starts at 1 so `QUIESCENT` never collides with a
    /// pinned epoch.
    epoch: AtomicU64,
    /// Published reader epochs; `QUIESCENT` marks a free slot.
    slots: Box<[AtomicU64]>,
    /// Objects retired but not yet provably unreachable.
    retired: Mutex<Vec<Retired>>,
}

impl ReclaimDomain {
    /// Create an empty domain.
    pub fn new() -> Self {
        let slots = (0..READER_SLOTS)
            .map(|_| AtomicU64::new(QUIESCENT))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        ReclaimDomain {
            epoch: AtomicU64::new(1),
            slots,
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Pin the calling reader against the current epoch.
    ///
    /// The returned guard must outlive every access to memory obtained from
    /// the protected pointer; dropping it unpins.
    pub fn pin(&self) -> EpochGuard<'_> {
        loop {
            for (i, slot) in self.slots.iter().enumerate() {
                // Claim a free slot. The epoch is published with SeqCst so a
                // writer computing the minimum active epoch after its swap is
                // guaranteed to see it.
                let e = self.epoch.load(Ordering::SeqCst);
                if slot
                    .compare_exchange(QUIESCENT, e, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    // Full fence: the protected-pointer load that follows
                    // the pin must not be satisfied before the slot store
                    // is visible to a writer scanning for active readers.
                    std::sync::atomic::fence(Ordering::SeqCst);
                    return EpochGuard {
                        domain: self,
                        slot: i,
                    };
                }
            }
            std::hint::spin_loop();
        }
    }

    /// Retire an object replaced by a writer.
    ///
    /// The object's `free` closure runs once no pinned reader can still
    /// reference it. Must be called after the swap that made the object
    /// unreachable to new readers.
    pub fn retire(&self, free: Box<dyn FnOnce() + Send>) {
        let e = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.retired.lock().push(Retired { epoch: e, free });
        self.try_collect();
    }

    /// Free every retired object that no pinned reader can observe.
    pub fn try_collect(&self) {
        let min_active = self
            .slots
            .iter()
            .map(|s| s.load(Ordering::SeqCst))
            .filter(|&e| e != QUIESCENT)
            .min()
            .unwrap_or(u64::MAX);

        let ready: Vec<Retired> = {
            let mut retired = self.retired.lock();
            let mut ready = Vec::new();
            let mut i = 0;
            while i < retired.len() {
                if retired[i].epoch <= min_active {
                    ready.push(retired.swap_remove(i));
                } else {
                    i += 1;
                }
            }
            ready
        };

        // Run the frees outside the lock.
        for r in ready {
            (r.free)();
        }
    }

    /// Number of retired objects still awaiting reclamation.
    pub fn pending(&self) -> usize {
        self.retired.lock().len()
    }

    /// Current epoch, for diagnostics.
    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }
}

impl Default for ReclaimDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ReclaimDomain {
    fn drop(&mut self) {
        // No readers can exist once the domain is being dropped.
        for r in self.retired.get_mut().drain(..) {
            (r.free)();
        }
    }
}

// =============================================================================
// EpochGuard
// =============================================================================

/// RAII pin on a reclamation domain.
pub struct EpochGuard<'a> {
    domain: &'a ReclaimDomain,
    slot: usize,
}

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        self.domain.slots[self.slot].store(QUIESCENT, Ordering::SeqCst);
    }
}

// =============================================================================
// Tests
// =============================================================================
