//! Managed exception objects and the runtime type hierarchy.
//!
//! Compiled code throws values of managed types; catch clauses name a type
//! token and match any exception whose runtime type is assignable to it.
//! The token → parent-token hierarchy lives in a [`TypeRegistry`] backed by
//! the runtime's concurrent word table, so type checks during dispatch are
//! lock-free reads even while a loader thread is still registering types.

use std::sync::Arc;

use ember_runtime::ConcurrentWordTable;

// =============================================================================
// Type tokens
// =============================================================================

/// Opaque handle for a managed runtime type. Zero is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeToken(pub u32);

impl TypeToken {
    /// Root of the exception hierarchy; every throwable type derives from it.
    pub const EXCEPTION: TypeToken = TypeToken(1);
    /// Bad pointer dereference (maps from SIGSEGV/SIGBUS, access violation).
    pub const ACCESS_VIOLATION: TypeToken = TypeToken(2);
    /// Integer or float division error (maps from SIGFPE).
    pub const DIVIDE_BY_ZERO: TypeToken = TypeToken(3);
    /// Arithmetic overflow trap.
    pub const OVERFLOW: TypeToken = TypeToken(4);
    /// Undefined or privileged instruction (maps from SIGILL).
    pub const ILLEGAL_INSTRUCTION: TypeToken = TypeToken(5);
    /// Guard-page hit past the end of the stack.
    pub const STACK_OVERFLOW: TypeToken = TypeToken(6);

    /// First token available to user-defined types.
    pub const FIRST_USER: TypeToken = TypeToken(16);

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for TypeToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "type#{}", self.0)
    }
}

// =============================================================================
// TypeRegistry
// =============================================================================

/// Token → parent-token map for assignability checks.
///
/// Reads are lock-free; registration follows the table's single-writer
/// discipline (the table serializes writers internally).
pub struct TypeRegistry {
    parents: ConcurrentWordTable,
}

impl TypeRegistry {
    /// Empty registry containing only unrelated root types.
    pub fn new() -> Self {
        TypeRegistry {
            parents: ConcurrentWordTable::new(None, None),
        }
    }

    /// Registry pre-populated with the hardware-fault exception types, all
    /// deriving from [`TypeToken::EXCEPTION`].
    pub fn with_well_known() -> Arc<Self> {
        let registry = TypeRegistry::new();
        for token in [
            TypeToken::ACCESS_VIOLATION,
            TypeToken::DIVIDE_BY_ZERO,
            TypeToken::OVERFLOW,
            TypeToken::ILLEGAL_INSTRUCTION,
            TypeToken::STACK_OVERFLOW,
        ] {
            registry.register(token, Some(TypeToken::EXCEPTION));
        }
        Arc::new(registry)
    }

    /// Register `token` with an optional parent. A token with no parent is
    /// a hierarchy root.
    pub fn register(&self, token: TypeToken, parent: Option<TypeToken>) {
        debug_assert_ne!(token.0, 0, "zero token is reserved");
        if let Some(parent) = parent {
            self.parents.insert(token.0 as usize, parent.0 as usize);
        }
    }

    /// Direct parent of `token`, if it has one.
    pub fn parent_of(&self, token: TypeToken) -> Option<TypeToken> {
        self.parents
            .lookup(token.0 as usize)
            .map(|p| TypeToken(p as u32))
    }

    /// Whether a value of type `sub` may be caught by a clause naming
    /// `target`: true when `sub` is `target` or derives from it.
    pub fn is_assignable(&self, sub: TypeToken, target: TypeToken) -> bool {
        let mut cursor = sub;
        loop {
            if cursor == target {
                return true;
            }
            match self.parent_of(cursor) {
                Some(parent) => cursor = parent,
                None => return false,
            }
        }
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// ManagedException
// =============================================================================

/// One rendered frame of a stack trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    /// Instruction pointer the frame was walked at.
    pub ip: u64,
    /// Method name if the ip resolved to a compiled region.
    pub method: Option<String>,
}

impl std::fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.method {
            Some(method) => write!(f, "at {method} [{:#x}]", self.ip),
            None => write!(f, "at <native> [{:#x}]", self.ip),
        }
    }
}

/// A managed exception in flight.
///
/// The trace fields are assembled one frame per step during the dispatch
/// search pass. A fresh throw clears them; a rethrow keeps them, so the
/// user-visible trace still ends at the original throw site.
#[derive(Debug, Clone)]
pub struct ManagedException {
    token: TypeToken,
    message: String,
    trace_ips: Vec<u64>,
    trace_frames: Vec<TraceFrame>,
}

impl ManagedException {
    pub fn new(token: TypeToken, message: impl Into<String>) -> Self {
        ManagedException {
            token,
            message: message.into(),
            trace_ips: Vec::new(),
            trace_frames: Vec::new(),
        }
    }

    #[inline]
    pub fn token(&self) -> TypeToken {
        self.token
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[inline]
    pub fn trace_ips(&self) -> &[u64] {
        &self.trace_ips
    }

    #[inline]
    pub fn trace_frames(&self) -> &[TraceFrame] {
        &self.trace_frames
    }

    /// Reset the captured trace. Called on a fresh throw, never on rethrow.
    pub fn clear_trace(&mut self) {
        self.trace_ips.clear();
        self.trace_frames.clear();
    }

    /// Append one walked frame to the trace.
    pub fn push_trace_frame(&mut self, ip: u64, method: Option<String>) {
        self.trace_ips.push(ip);
        self.trace_frames.push(TraceFrame { ip, method });
    }

    /// Render the trace for the unhandled-exception diagnostic.
    pub fn render_trace(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let _ = writeln!(out, "unhandled {}: {}", self.token, self.message);
        for frame in &self.trace_frames {
            let _ = writeln!(out, "  {frame}");
        }
        out
    }
}

// =============================================================================
// Tests
// =============================================================================
