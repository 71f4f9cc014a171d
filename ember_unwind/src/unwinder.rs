//! The frame unwinder: computes the calling frame's context one level up.
//!
//! Each [`Unwinder::step`] classifies the current instruction pointer:
//!
//! - It resolves through the code-region index → a compiled frame. The
//!   region's unwind program is replayed to recover the CFA, the spilled
//!   callee-saved registers, and the return address.
//! - It does not resolve → execution left compiled code through a runtime
//!   call, and the next transition record describes where managed execution
//!   left off.
//! - It does not resolve and the transition chain is exhausted → the walk
//!   has fallen off the known stack, which is a fatal runtime bug.
//!
//! The recovered instruction pointer is biased back by one byte so that a
//! subsequent region lookup lands on the *call* instruction rather than on
//! whatever follows it; a return address points past the call, possibly
//! into the next protected range or the next method.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::code_index::{CodeRegion, CodeRegionIndex, RegionKind};
use crate::context::{CpuContext, Gpr};
use crate::transition::{TransitionCursor, TransitionKind};
use crate::unwind_info::{FrameRules, ProgramError};

// =============================================================================
// Errors
// =============================================================================

/// Fatal unwind failure. There is no recovery path from any of these; they
/// indicate corrupted metadata or a runtime bug, and dispatch escalates
/// them to the process-fatal handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnwindError {
    /// The instruction pointer resolves to no known region and no
    /// transition record remains.
    UnresolvedIp { ip: u64 },
    /// A region's unwind program could not be replayed.
    BadUnwindInfo { ip: u64, source: ProgramError },
    /// A transition record carried a combination of fields no unwind rule
    /// covers.
    UnsupportedFrame { ip: u64 },
}

impl std::fmt::Display for UnwindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnwindError::UnresolvedIp { ip } => {
                write!(f, "instruction pointer {ip:#x} resolves to no frame")
            }
            UnwindError::BadUnwindInfo { ip, source } => {
                write!(f, "bad unwind info at {ip:#x}: {source}")
            }
            UnwindError::UnsupportedFrame { ip } => {
                write!(f, "unsupported transition frame at {ip:#x}")
            }
        }
    }
}

impl std::error::Error for UnwindError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            UnwindError::BadUnwindInfo { source, .. } => Some(source),
            _ => None,
        }
    }
}

// =============================================================================
// Frame descriptors
// =============================================================================

/// Kind of frame one step walked over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Managed,
    Trampoline,
    NativeTransition,
    DebuggerInvoke,
}

/// Transient description of the frame a step walked over. Produced fresh
/// each step; never persisted.
#[derive(Debug, Clone)]
pub struct FrameInfo {
    pub kind: FrameKind,
    /// The frame's instruction pointer (the one the step classified).
    pub ip: u64,
    /// Code-info record when the frame is compiled code.
    pub region: Option<Arc<CodeRegion>>,
}

impl FrameInfo {
    /// Method name for trace rendering, when known.
    pub fn method_name(&self) -> Option<String> {
        self.region.as_ref().map(|r| r.method_name.clone())
    }
}

/// Result of one unwind step.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// Walked over one frame; `next` is the caller's context.
    Frame { info: FrameInfo, next: CpuContext },
    /// Bottom of the stack.
    Terminal,
}

// =============================================================================
// Unwinder
// =============================================================================

/// Stateless stepping primitive over `(context, code index, transitions)`.
pub struct Unwinder<'a> {
    index: &'a CodeRegionIndex,
}

impl<'a> Unwinder<'a> {
    pub fn new(index: &'a CodeRegionIndex) -> Self {
        Unwinder { index }
    }

    /// Compute the calling frame's context one level up from `ctx`.
    ///
    /// # Safety
    /// `ctx` must describe a live frame of the calling thread's stack (or a
    /// faithful synthetic equivalent): the step dereferences the CFA-relative
    /// save slots and the return-address slot it derives from `ctx`, and the
    /// slots any consumed transition record points at.
    pub unsafe fn step(
        &self,
        ctx: &CpuContext,
        cursor: &mut TransitionCursor<'_>,
    ) -> Result<StepOutcome, UnwindError> {
        let ip = ctx.ip();

        if let Some(region) = self.index.find_by_ip(ip) {
            return self.step_compiled(ctx, ip, region);
        }

        let Some(record) = cursor.next() else {
            return Err(UnwindError::UnresolvedIp { ip });
        };

        match &record.kind {
            TransitionKind::Plain if record.is_stack_top() => {
                // A stack-top marker is only legitimate as the outermost
                // record; one with records still beneath it means the chain
                // was corrupted.
                if !cursor.exhausted() {
                    return Err(UnwindError::UnsupportedFrame { ip });
                }
                trace!(ip, "reached stack-top transition record");
                Ok(StepOutcome::Terminal)
            }
            TransitionKind::Plain => {
                // The crossing pushed a return address just below the saved
                // stack pointer; callee-saved state is unknown past a native
                // span, so the registers start out cleared.
                let ra = read_word(record.sp.wrapping_sub(8));
                let mut next = CpuContext::new();
                next.set_sp(record.sp);
                next.set_fp(record.fp);
                next.set_ip(ra.wrapping_sub(1));
                debug!(ip, resume_ip = next.ip(), "stepped native transition");
                Ok(StepOutcome::Frame {
                    info: FrameInfo {
                        kind: FrameKind::NativeTransition,
                        ip,
                        region: None,
                    },
                    next,
                })
            }
            TransitionKind::RipValid => {
                let mut next = CpuContext::new();
                next.set_sp(record.sp);
                next.set_fp(record.fp);
                next.set_ip(record.ip);
                debug!(ip, resume_ip = record.ip, "stepped rip-valid transition");
                Ok(StepOutcome::Frame {
                    info: FrameInfo {
                        kind: FrameKind::NativeTransition,
                        ip,
                        region: None,
                    },
                    next,
                })
            }
            TransitionKind::Trampoline(embedded) => {
                let mut next = **embedded;
                next.set_ip(next.ip().wrapping_sub(1));
                debug!(ip, resume_ip = next.ip(), "stepped trampoline frame");
                Ok(StepOutcome::Frame {
                    info: FrameInfo {
                        kind: FrameKind::Trampoline,
                        ip,
                        region: None,
                    },
                    next,
                })
            }
            TransitionKind::DebuggerInvoke(embedded) => {
                debug!(ip, resume_ip = embedded.ip(), "stepped debugger-invoke frame");
                Ok(StepOutcome::Frame {
                    info: FrameInfo {
                        kind: FrameKind::DebuggerInvoke,
                        ip,
                        region: None,
                    },
                    next: **embedded,
                })
            }
        }
    }

    /// Unwind one compiled frame via its unwind program.
    unsafe fn step_compiled(
        &self,
        ctx: &CpuContext,
        ip: u64,
        region: Arc<CodeRegion>,
    ) -> Result<StepOutcome, UnwindError> {
        let offset = region.offset_of(ip);
        let rules = region
            .unwind
            .replay(offset)
            .map_err(|source| UnwindError::BadUnwindInfo { ip, source })?;

        let cfa = rules.cfa(ctx.get(rules.cfa_register));
        let ra = read_word(FrameRules::return_address_slot(cfa));
        if ra == 0 {
            // A zeroed return-address slot marks a root frame planted by the
            // thread-start glue.
            return Ok(StepOutcome::Terminal);
        }

        let mut next = *ctx;
        for &(reg, off) in rules.saved.iter() {
            next.set(reg, read_word(cfa.wrapping_add(off as u64)));
        }
        next.set_sp(cfa);
        next.set_ip(ra.wrapping_sub(1));

        debug!(
            ip,
            method = %region.method_name,
            cfa,
            resume_ip = next.ip(),
            "stepped compiled frame"
        );

        let kind = match region.kind {
            RegionKind::Managed => FrameKind::Managed,
            RegionKind::Trampoline => FrameKind::Trampoline,
        };
        Ok(StepOutcome::Frame {
            info: FrameInfo {
                kind,
                ip,
                region: Some(region),
            },
            next,
        })
    }
}

#[inline]
unsafe fn read_word(addr: u64) -> u64 {
    (addr as *const u64).read()
}

/// Round-trip check used by dispatch before restoring: the recovered
/// stack pointer must be strictly above the faulting one (stacks grow
/// down), or the walk went sideways.
pub fn sanity_check_progress(before: &CpuContext, after: &CpuContext) -> bool {
    after.sp() > before.sp() || after.sp() == 0
}

// =============================================================================
// Tests
// =============================================================================
