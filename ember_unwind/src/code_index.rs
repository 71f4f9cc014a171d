//! Index of compiled code regions, looked up by instruction pointer.
//!
//! Every piece of runtime-emitted code — JIT-compiled managed methods and
//! the fixed trampolines — registers a [`CodeRegion`] here. The unwinder
//! and the dispatch driver classify an instruction pointer by resolving it
//! through this index: a hit yields the region's unwind program and
//! exception-handler table; a miss means the ip belongs to a native frame.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::exception::TypeToken;
use crate::unwind_info::UnwindProgram;

// =============================================================================
// Exception-handler table
// =============================================================================

/// Handler kind of one exception-handler clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EhKind {
    /// Catches exceptions assignable to the token.
    Catch(TypeToken),
    /// Runs a filter function at `filter_offset`; catches when it returns
    /// non-zero.
    Filter {
        /// Offset of the filter body within the region.
        filter_offset: u32,
    },
    /// Runs on every exit from the protected range, exceptional or not.
    Finally,
    /// Runs only when the stack unwinds past the protected range.
    Fault,
}

/// One clause of a region's exception-handler table.
///
/// The compiler emits clauses innermost-first; scan order is match order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EhClause {
    /// Protected range `[try_start, try_end)`, in region-relative offsets.
    pub try_start: u32,
    pub try_end: u32,
    /// Handler entry, region-relative.
    pub handler_offset: u32,
    pub kind: EhKind,
}

impl EhClause {
    /// Whether the protected range covers a region-relative offset.
    #[inline]
    pub fn protects(&self, offset: u32) -> bool {
        self.try_start <= offset && offset < self.try_end
    }
}

// =============================================================================
// CodeRegion
// =============================================================================

/// Classification of a registered region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// JIT-compiled managed method.
    Managed,
    /// Runtime-emitted trampoline stub.
    Trampoline,
}

/// Metadata record for one span of emitted code.
#[derive(Debug)]
pub struct CodeRegion {
    /// First byte of the code.
    pub start: u64,
    /// Code size in bytes.
    pub size: usize,
    pub kind: RegionKind,
    /// Method name (or stub name), for stack traces.
    pub method_name: String,
    /// Unwind metadata for the region.
    pub unwind: UnwindProgram,
    /// Exception-handler table, innermost-first.
    pub eh_clauses: Vec<EhClause>,
}

impl CodeRegion {
    /// Whether `ip` points into this region.
    #[inline]
    pub fn contains(&self, ip: u64) -> bool {
        ip >= self.start && ip < self.start + self.size as u64
    }

    /// Region-relative offset of `ip`.
    ///
    /// # Panics
    /// Panics in debug builds if `ip` is outside the region.
    #[inline]
    pub fn offset_of(&self, ip: u64) -> u32 {
        debug_assert!(self.contains(ip));
        (ip - self.start) as u32
    }

    /// Absolute address of a region-relative offset.
    #[inline]
    pub fn address_of(&self, offset: u32) -> u64 {
        self.start + offset as u64
    }

    /// Clauses whose protected range covers `offset`, innermost-first.
    pub fn clauses_covering(&self, offset: u32) -> impl Iterator<Item = &EhClause> {
        self.eh_clauses.iter().filter(move |c| c.protects(offset))
    }
}

// =============================================================================
// CodeRegionIndex
// =============================================================================

/// Registration failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionError {
    /// The region overlaps one already registered.
    Overlap { existing_start: u64 },
    /// Zero-sized regions cannot be resolved and are rejected.
    EmptyRegion,
}

impl std::fmt::Display for RegionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegionError::Overlap { existing_start } => {
                write!(f, "code region overlaps region at {existing_start:#x}")
            }
            RegionError::EmptyRegion => write!(f, "code region has zero size"),
        }
    }
}

impl std::error::Error for RegionError {}

/// Process-wide registry of emitted code, sorted by start address.
///
/// Registration happens on compile paths; resolution happens on every
/// unwind step, so lookups take the read side of the lock and binary
/// search.
#[derive(Default)]
pub struct CodeRegionIndex {
    regions: RwLock<Vec<Arc<CodeRegion>>>,
}

impl CodeRegionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly emitted region.
    pub fn register(&self, region: CodeRegion) -> Result<Arc<CodeRegion>, RegionError> {
        if region.size == 0 {
            return Err(RegionError::EmptyRegion);
        }
        let mut regions = self.regions.write();
        let idx = regions.partition_point(|r| r.start < region.start);

        // Neighbors on either side must not overlap the new span.
        if let Some(prev) = idx.checked_sub(1).and_then(|i| regions.get(i)) {
            if prev.start + prev.size as u64 > region.start {
                return Err(RegionError::Overlap {
                    existing_start: prev.start,
                });
            }
        }
        if let Some(next) = regions.get(idx) {
            if region.start + region.size as u64 > next.start {
                return Err(RegionError::Overlap {
                    existing_start: next.start,
                });
            }
        }

        let region = Arc::new(region);
        regions.insert(idx, Arc::clone(&region));
        Ok(region)
    }

    /// Remove the region starting at `start`, e.g. when code is evicted.
    pub fn unregister(&self, start: u64) -> Option<Arc<CodeRegion>> {
        let mut regions = self.regions.write();
        let idx = regions.partition_point(|r| r.start < start);
        if regions.get(idx).is_some_and(|r| r.start == start) {
            Some(regions.remove(idx))
        } else {
            None
        }
    }

    /// Resolve an instruction pointer to the region containing it.
    pub fn find_by_ip(&self, ip: u64) -> Option<Arc<CodeRegion>> {
        let regions = self.regions.read();
        let idx = regions.partition_point(|r| r.start <= ip);
        let candidate = regions.get(idx.checked_sub(1)?)?;
        candidate.contains(ip).then(|| Arc::clone(candidate))
    }

    /// Number of registered regions.
    pub fn len(&self) -> usize {
        self.regions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.read().is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
