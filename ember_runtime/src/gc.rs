//! Root-registration facade for GC-aware containers.
//!
//! The concurrent table can hold keys and/or values that are managed heap
//! references. When it does, the collector must be able to find (and, for a
//! moving collector, update) those slots. This module defines the minimal
//! surface the table needs from the collector; the collector itself lives
//! elsewhere in the runtime and is treated as an external collaborator here.

// =============================================================================
// GcPolicy
// =============================================================================

/// Which of a table's slot arrays hold managed references.
///
/// Selected per table instance at construction time and fixed thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPolicy {
    /// Neither keys nor values are managed references.
    None,
    /// Keys are managed references; values are plain words.
    Keys,
    /// Values are managed references; keys are plain words.
    Values,
    /// Both keys and values are managed references.
    KeysAndValues,
}

impl GcPolicy {
    /// Whether key slots must be registered as roots.
    #[inline]
    pub fn tracks_keys(self) -> bool {
        matches!(self, GcPolicy::Keys | GcPolicy::KeysAndValues)
    }

    /// Whether value slots must be registered as roots.
    #[inline]
    pub fn tracks_values(self) -> bool {
        matches!(self, GcPolicy::Values | GcPolicy::KeysAndValues)
    }
}

// =============================================================================
// RootRegistrar
// =============================================================================

/// Collector operations a GC-aware container depends on.
///
/// Implementations are provided by the GC crate; this crate only consumes
/// them. All methods must be callable from any thread.
pub trait RootRegistrar: Send + Sync {
    /// Register `len` bytes starting at `start` as a root range that may
    /// contain managed references.
    fn register_root(&self, start: *const u8, len: usize);

    /// Deregister a root range previously registered with `register_root`.
    fn deregister_root(&self, start: *const u8);

    /// Record a reference store into a registered root slot.
    ///
    /// Called after the store is visible; pairs with the collector's
    /// generational/concurrent marking barriers.
    fn write_barrier(&self, slot: *mut usize, value: usize);
}

/// No-op registrar for tables whose keys and values are plain words, and
/// for tests that exercise table mechanics without a collector.
#[derive(Debug, Default)]
pub struct NullRegistrar;

impl RootRegistrar for NullRegistrar {
    fn register_root(&self, _start: *const u8, _len: usize) {}

    fn deregister_root(&self, _start: *const u8) {}

    fn write_barrier(&self, _slot: *mut usize, _value: usize) {}
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_tracking() {
        assert!(!GcPolicy::None.tracks_keys());
        assert!(!GcPolicy::None.tracks_values());
        assert!(GcPolicy::Keys.tracks_keys());
        assert!(!GcPolicy::Keys.tracks_values());
        assert!(GcPolicy::KeysAndValues.tracks_keys());
        assert!(GcPolicy::KeysAndValues.tracks_values());
    }

    #[test]
    fn test_null_registrar_is_inert() {
        let reg = NullRegistrar;
        reg.register_root(std::ptr::null(), 64);
        reg.write_barrier(std::ptr::null_mut(), 1);
        reg.deregister_root(std::ptr::null());
    }
}
