//! Transition records marking native ↔ managed stack crossings.
//!
//! Managed code calling into the native runtime cannot be unwound through
//! by unwind programs: the native frames in between carry no metadata this
//! crate controls. Instead, the call glue pushes a [`TransitionRecord`]
//! capturing where managed execution left off; the unwinder skips the
//! native frames by resuming from the record.
//!
//! Records form a per-thread stack, innermost crossing first. The frame
//! kind is an explicit enum variant; special frames that need more than
//! the three saved words embed a full context.

use crate::context::CpuContext;

// =============================================================================
// TransitionKind
// =============================================================================

/// Kind of native↔managed crossing a record describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionKind {
    /// Ordinary runtime call-in. The saved ip is advisory; the return
    /// address is reloaded from the stack at unwind time. A `Plain` record
    /// with `sp == 0` marks the top of the native stack.
    Plain,
    /// The record's ip field is authoritative and must be resumed from
    /// as-is (the crossing saved an exact resume point).
    RipValid,
    /// A trampoline frame; the full register state at entry is embedded.
    Trampoline(Box<CpuContext>),
    /// A debugger-initiated call-in; the debugger supplied the exact
    /// context to resume the interrupted thread with.
    DebuggerInvoke(Box<CpuContext>),
}

// =============================================================================
// TransitionRecord
// =============================================================================

/// One native↔managed crossing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRecord {
    pub kind: TransitionKind,
    /// Stack pointer of the managed caller at the crossing.
    pub sp: u64,
    /// Frame pointer of the managed caller.
    pub fp: u64,
    /// Instruction pointer at the crossing; authority depends on `kind`.
    pub ip: u64,
}

impl TransitionRecord {
    /// Record planted at thread start, marking the top of the native stack.
    pub fn stack_top() -> Self {
        TransitionRecord {
            kind: TransitionKind::Plain,
            sp: 0,
            fp: 0,
            ip: 0,
        }
    }

    /// Ordinary call-in record.
    pub fn plain(sp: u64, fp: u64, ip: u64) -> Self {
        TransitionRecord {
            kind: TransitionKind::Plain,
            sp,
            fp,
            ip,
        }
    }

    /// Record whose ip is an exact resume point.
    pub fn rip_valid(sp: u64, fp: u64, ip: u64) -> Self {
        TransitionRecord {
            kind: TransitionKind::RipValid,
            sp,
            fp,
            ip,
        }
    }

    /// Trampoline record embedding the entry register state.
    pub fn trampoline(ctx: CpuContext) -> Self {
        TransitionRecord {
            sp: ctx.sp(),
            fp: ctx.fp(),
            ip: ctx.ip(),
            kind: TransitionKind::Trampoline(Box::new(ctx)),
        }
    }

    /// Debugger call-in record embedding the resume context.
    pub fn debugger_invoke(ctx: CpuContext) -> Self {
        TransitionRecord {
            sp: ctx.sp(),
            fp: ctx.fp(),
            ip: ctx.ip(),
            kind: TransitionKind::DebuggerInvoke(Box::new(ctx)),
        }
    }

    /// Whether this record marks the top of the native stack.
    #[inline]
    pub fn is_stack_top(&self) -> bool {
        matches!(self.kind, TransitionKind::Plain) && self.sp == 0
    }
}

// =============================================================================
// TransitionChain
// =============================================================================

/// Per-thread stack of transition records, innermost crossing last.
///
/// Owned by a single thread; pushed on every managed → native call, popped
/// on return. Never shared. Cloned to a snapshot at dispatch entry so a
/// handler that throws again can re-enter without aliasing the live chain.
#[derive(Debug, Default, Clone)]
pub struct TransitionChain {
    records: Vec<TransitionRecord>,
}

impl TransitionChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chain seeded with the thread-start stack-top record.
    pub fn for_thread() -> Self {
        let mut chain = Self::new();
        chain.push(TransitionRecord::stack_top());
        chain
    }

    /// Push a crossing on managed → native entry.
    pub fn push(&mut self, record: TransitionRecord) {
        self.records.push(record);
    }

    /// Pop the innermost crossing on native → managed return.
    pub fn pop(&mut self) -> Option<TransitionRecord> {
        self.records.pop()
    }

    /// Innermost record without consuming it.
    pub fn innermost(&self) -> Option<&TransitionRecord> {
        self.records.last()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Cursor walking records innermost-first, for an unwind sequence. The
    /// chain itself is not mutated; a dispatch in progress must be able to
    /// rewalk the same stack in pass 2.
    pub fn cursor(&self) -> TransitionCursor<'_> {
        TransitionCursor {
            records: &self.records,
            remaining: self.records.len(),
        }
    }
}

/// Read-only walk over a chain, innermost record first.
#[derive(Debug, Clone)]
pub struct TransitionCursor<'a> {
    records: &'a [TransitionRecord],
    remaining: usize,
}

impl<'a> TransitionCursor<'a> {
    /// Next record without consuming it.
    pub fn peek(&self) -> Option<&'a TransitionRecord> {
        self.remaining
            .checked_sub(1)
            .and_then(|i| self.records.get(i))
    }

    /// Whether every record has been consumed.
    pub fn exhausted(&self) -> bool {
        self.remaining == 0
    }
}

impl<'a> Iterator for TransitionCursor<'a> {
    type Item = &'a TransitionRecord;

    fn next(&mut self) -> Option<&'a TransitionRecord> {
        let record = self.peek()?;
        self.remaining -= 1;
        Some(record)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Gpr;

    #[test]
    fn test_stack_top_marker() {
        assert!(TransitionRecord::stack_top().is_stack_top());
        assert!(!TransitionRecord::plain(0x7fff_0000, 0, 0x1000).is_stack_top());
        // A zero sp only marks the top on plain records.
        let mut ctx = CpuContext::new();
        ctx.set_sp(0);
        assert!(!TransitionRecord::trampoline(ctx).is_stack_top());
    }

    #[test]
    fn test_embedded_context_mirrors_fields() {
        let mut ctx = CpuContext::new();
        ctx.set_sp(0x7fff_1000);
        ctx.set_fp(0x7fff_2000);
        ctx.set_ip(0x4000_0000);
        ctx.set(Gpr::R12, 99);
        let record = TransitionRecord::trampoline(ctx);
        assert_eq!(record.sp, 0x7fff_1000);
        assert_eq!(record.fp, 0x7fff_2000);
        assert_eq!(record.ip, 0x4000_0000);
        match &record.kind {
            TransitionKind::Trampoline(embedded) => assert_eq!(embedded.get(Gpr::R12), 99),
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn test_cursor_walks_innermost_first() {
        let mut chain = TransitionChain::for_thread();
        chain.push(TransitionRecord::plain(0x3000, 0, 0x111));
        chain.push(TransitionRecord::plain(0x2000, 0, 0x222));

        let mut cursor = chain.cursor();
        assert_eq!(cursor.peek().unwrap().sp, 0x2000);
        assert_eq!(cursor.next().unwrap().sp, 0x2000);
        assert_eq!(cursor.next().unwrap().sp, 0x3000);
        assert!(cursor.next().unwrap().is_stack_top());
        assert!(cursor.exhausted());
        assert!(cursor.next().is_none());

        // The walk leaves the chain intact.
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.innermost().unwrap().sp, 0x2000);
    }

    #[test]
    fn test_push_pop_balance() {
        let mut chain = TransitionChain::new();
        chain.push(TransitionRecord::plain(0x1000, 0, 1));
        chain.push(TransitionRecord::rip_valid(0x900, 0, 2));
        assert_eq!(chain.pop().unwrap().ip, 2);
        assert_eq!(chain.pop().unwrap().ip, 1);
        assert!(chain.pop().is_none());
    }
}
