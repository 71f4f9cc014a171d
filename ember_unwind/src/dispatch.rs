//! Two-pass exception dispatch.
//!
//! Pass 1 (*search*) walks the stack from the throw point looking for a
//! clause that accepts the exception: a catch clause whose type the
//! exception is assignable to, or a filter clause whose body returns
//! non-zero. Nothing is torn down; filters observe the machine state at
//! the throw point, and the stack trace is collected one frame per step.
//!
//! Pass 2 (*unwind*) re-walks the same stack leaf-to-root, running every
//! finally and fault clause strictly below the accepting clause, then
//! resumes execution at the accepted handler with the exception object in
//! rax. The walk is repeated rather than resumed because filters in pass 1
//! may themselves have faulted and dispatched; each pass owns its cursor.
//!
//! An exception no clause accepts is process-fatal: the rendered trace
//! goes to stderr and the process aborts. There is no managed state left
//! to continue with.

use std::cell::RefCell;
use std::sync::Arc;

use tracing::{debug, info};

use crate::code_index::{CodeRegionIndex, EhKind, RegionKind};
use crate::context::{CpuContext, Gpr};
use crate::exception::{ManagedException, TypeRegistry, TypeToken};
use crate::signal::FaultKind;
use crate::transition::{TransitionChain, TransitionRecord};
use crate::trampolines::Trampolines;
use crate::unwinder::{sanity_check_progress, StepOutcome, Unwinder, UnwindError};

/// Walk-length cap; a stack deeper than this means cyclic unwind metadata.
const MAX_WALK_FRAMES: usize = 10_000;

// =============================================================================
// Per-thread dispatch state
// =============================================================================

thread_local! {
    /// This thread's native↔managed transition chain.
    static TRANSITIONS: RefCell<TransitionChain> = RefCell::new(TransitionChain::for_thread());

    /// Exception parked between a finally block's completion and the
    /// resume-unwind stub continuing the interrupted dispatch.
    static IN_FLIGHT: RefCell<Option<Box<ManagedException>>> = const { RefCell::new(None) };
}

/// Record a managed → native crossing for the calling thread.
pub fn push_transition(record: TransitionRecord) {
    TRANSITIONS.with(|chain| chain.borrow_mut().push(record));
}

/// Drop the innermost crossing on native → managed return.
pub fn pop_transition() -> Option<TransitionRecord> {
    TRANSITIONS.with(|chain| chain.borrow_mut().pop())
}

/// Snapshot of the calling thread's transition chain.
pub fn snapshot_transitions() -> TransitionChain {
    TRANSITIONS.with(|chain| chain.borrow().clone())
}

/// Park an exception for a later resume-unwind continuation.
pub fn set_in_flight(exception: Box<ManagedException>) {
    IN_FLIGHT.with(|slot| {
        *slot.borrow_mut() = Some(exception);
    });
}

/// Take the parked in-flight exception, if any.
pub fn take_in_flight() -> Option<Box<ManagedException>> {
    IN_FLIGHT.with(|slot| slot.borrow_mut().take())
}

// =============================================================================
// Handler invocation seam
// =============================================================================

/// Runs one handler body (filter, finally or fault) against a captured
/// machine state and reports its return value.
///
/// The production implementation routes through the call-filter stub so
/// the body observes the register state at the throw point; tests
/// substitute a recorder.
pub trait HandlerInvoker: Send + Sync {
    /// Run the body at `target`. The return value is the filter verdict
    /// (non-zero accepts); finally and fault bodies' values are ignored.
    ///
    /// # Safety
    /// `target` must be the entry of a callable handler body and `ctx`
    /// a machine state it can legally observe.
    unsafe fn call(&self, ctx: &CpuContext, target: u64) -> usize;
}

/// Invoker backed by the emitted call-filter stub.
pub struct TrampolineInvoker {
    trampolines: &'static Trampolines,
}

impl TrampolineInvoker {
    pub fn new(trampolines: &'static Trampolines) -> Self {
        TrampolineInvoker { trampolines }
    }
}

impl HandlerInvoker for TrampolineInvoker {
    unsafe fn call(&self, ctx: &CpuContext, target: u64) -> usize {
        (self.trampolines.call_filter())(ctx, target as usize)
    }
}

// =============================================================================
// ExceptionDispatcher
// =============================================================================

/// Result of a dispatch.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// A clause accepted; `resume` is the machine state to restore, ip at
    /// the handler entry and rax carrying the exception object.
    Handled { resume: CpuContext },
    /// No clause on the stack accepted the exception.
    Unhandled,
}

/// Where pass 1 stopped: the accepting frame and clause.
struct Acceptance {
    frame: CpuContext,
    region: Arc<crate::code_index::CodeRegion>,
    clause_index: usize,
}

/// The two-pass dispatch driver.
pub struct ExceptionDispatcher {
    index: Arc<CodeRegionIndex>,
    types: Arc<TypeRegistry>,
    invoker: Arc<dyn HandlerInvoker>,
    max_trace_frames: usize,
}

impl ExceptionDispatcher {
    pub fn new(
        index: Arc<CodeRegionIndex>,
        types: Arc<TypeRegistry>,
        invoker: Arc<dyn HandlerInvoker>,
        max_trace_frames: usize,
    ) -> Self {
        ExceptionDispatcher {
            index,
            types,
            invoker,
            max_trace_frames,
        }
    }

    /// Dispatch `exception` thrown at `start`.
    ///
    /// A rethrow keeps the already-captured trace so the user-visible
    /// trace still ends at the original throw site.
    ///
    /// # Safety
    /// `start` must describe a live frame of the calling thread's stack
    /// (or a faithful synthetic equivalent) and `chain` its transition
    /// records; both passes dereference frame save slots.
    pub unsafe fn dispatch(
        &self,
        start: &CpuContext,
        chain: &TransitionChain,
        exception: &mut ManagedException,
        rethrow: bool,
    ) -> Result<DispatchOutcome, UnwindError> {
        info!(
            token = %exception.token(),
            ip = start.ip(),
            rethrow,
            "dispatching exception"
        );

        let accepted = self.search(start, chain, exception, rethrow)?;
        let Some(accepted) = accepted else {
            return Ok(DispatchOutcome::Unhandled);
        };

        self.unwind_to(start, chain, &accepted)?;

        let clause = &accepted.region.eh_clauses[accepted.clause_index];
        let mut resume = accepted.frame;
        resume.set_ip(accepted.region.address_of(clause.handler_offset));
        resume.set(Gpr::Rax, exception as *mut ManagedException as u64);
        info!(
            method = %accepted.region.method_name,
            handler_ip = resume.ip(),
            "exception handled"
        );
        Ok(DispatchOutcome::Handled { resume })
    }

    /// Pass 1: find the accepting frame and clause without unwinding.
    unsafe fn search(
        &self,
        start: &CpuContext,
        chain: &TransitionChain,
        exception: &mut ManagedException,
        rethrow: bool,
    ) -> Result<Option<Acceptance>, UnwindError> {
        let unwinder = Unwinder::new(&self.index);
        let mut cursor = chain.cursor();
        let mut current = *start;

        for _ in 0..MAX_WALK_FRAMES {
            if let Some(region) = self.index.find_by_ip(current.ip()) {
                if region.kind == RegionKind::Managed {
                    if !rethrow && exception.trace_frames().len() < self.max_trace_frames {
                        exception.push_trace_frame(
                            current.ip(),
                            Some(region.method_name.clone()),
                        );
                    }

                    let offset = region.offset_of(current.ip());
                    for (i, clause) in region.eh_clauses.iter().enumerate() {
                        if !clause.protects(offset) {
                            continue;
                        }
                        match clause.kind {
                            EhKind::Catch(target) => {
                                if self.types.is_assignable(exception.token(), target) {
                                    debug!(
                                        method = %region.method_name,
                                        clause = i,
                                        "catch clause accepted"
                                    );
                                    return Ok(Some(Acceptance {
                                        frame: current,
                                        region,
                                        clause_index: i,
                                    }));
                                }
                            }
                            EhKind::Filter { filter_offset } => {
                                // The filter observes the throw-point state
                                // with the exception in rax.
                                let mut fctx = current;
                                fctx.set(Gpr::Rax, exception as *mut ManagedException as u64);
                                let verdict = self
                                    .invoker
                                    .call(&fctx, region.address_of(filter_offset));
                                debug!(
                                    method = %region.method_name,
                                    clause = i,
                                    verdict,
                                    "filter clause evaluated"
                                );
                                if verdict != 0 {
                                    return Ok(Some(Acceptance {
                                        frame: current,
                                        region,
                                        clause_index: i,
                                    }));
                                }
                            }
                            EhKind::Finally | EhKind::Fault => {}
                        }
                    }
                }
            } else if !rethrow && exception.trace_frames().len() < self.max_trace_frames {
                exception.push_trace_frame(current.ip(), None);
            }

            match unwinder.step(&current, &mut cursor)? {
                StepOutcome::Terminal => return Ok(None),
                StepOutcome::Frame { next, .. } => {
                    if !sanity_check_progress(&current, &next) {
                        return Err(UnwindError::UnsupportedFrame { ip: current.ip() });
                    }
                    current = next;
                }
            }
        }
        Err(UnwindError::UnsupportedFrame { ip: current.ip() })
    }

    /// Pass 2: run finally/fault clauses leaf-to-root up to (and inside,
    /// but strictly below, the accepting clause of) the accepting frame.
    unsafe fn unwind_to(
        &self,
        start: &CpuContext,
        chain: &TransitionChain,
        accepted: &Acceptance,
    ) -> Result<(), UnwindError> {
        let unwinder = Unwinder::new(&self.index);
        let mut cursor = chain.cursor();
        let mut current = *start;

        for _ in 0..MAX_WALK_FRAMES {
            let at_target =
                current.sp() == accepted.frame.sp() && current.ip() == accepted.frame.ip();

            if let Some(region) = self.index.find_by_ip(current.ip()) {
                if region.kind == RegionKind::Managed {
                    let offset = region.offset_of(current.ip());
                    for (i, clause) in region.eh_clauses.iter().enumerate() {
                        if at_target && i == accepted.clause_index {
                            break;
                        }
                        if !clause.protects(offset) {
                            continue;
                        }
                        if matches!(clause.kind, EhKind::Finally | EhKind::Fault) {
                            debug!(
                                method = %region.method_name,
                                clause = i,
                                "running cleanup clause"
                            );
                            // Cleanup bodies get a null exception in rax.
                            let mut hctx = current;
                            hctx.set(Gpr::Rax, 0);
                            self.invoker
                                .call(&hctx, region.address_of(clause.handler_offset));
                        }
                    }
                }
            }

            if at_target {
                return Ok(());
            }
            match unwinder.step(&current, &mut cursor)? {
                // Pass 2 falling off the stack before reaching the frame
                // pass 1 accepted means a filter corrupted the walk.
                StepOutcome::Terminal => {
                    return Err(UnwindError::UnsupportedFrame { ip: current.ip() })
                }
                StepOutcome::Frame { next, .. } => {
                    if !sanity_check_progress(&current, &next) {
                        return Err(UnwindError::UnsupportedFrame { ip: current.ip() });
                    }
                    current = next;
                }
            }
        }
        Err(UnwindError::UnsupportedFrame { ip: current.ip() })
    }
}

// =============================================================================
// Throw entry points
// =============================================================================

/// Deliver a dispatched exception: restore into the handler, or abort
/// with the rendered trace.
fn deliver(start: CpuContext, exception: &mut ManagedException, rethrow: bool) -> ! {
    let Some(runtime) = crate::runtime() else {
        eprintln!(
            "[ember-dispatch] exception {} thrown before runtime initialization",
            exception.token()
        );
        std::process::abort();
    };

    let chain = snapshot_transitions();
    let outcome = unsafe {
        runtime
            .dispatcher()
            .dispatch(&start, &chain, exception, rethrow)
    };
    match outcome {
        Ok(DispatchOutcome::Handled { resume }) => unsafe {
            (runtime.trampolines().restore_context())(&resume)
        },
        Ok(DispatchOutcome::Unhandled) => {
            eprint!("[ember-dispatch] {}", exception.render_trace());
            std::process::abort();
        }
        Err(err) => {
            eprintln!("[ember-dispatch] unwind failed: {err}");
            std::process::abort();
        }
    }
}

/// Dispatch entry behind the throw and rethrow stubs.
///
/// The stub records the raw return address as the context ip; it is
/// rewound one byte here so clause lookups land on the call instruction.
///
/// # Safety
/// Called from the throw stubs only; `ctx` points at the stub's captured
/// context and `exception` at a live exception object.
pub unsafe extern "C" fn ember_throw_exception(
    ctx: *const CpuContext,
    exception: *mut ManagedException,
    rethrow_flag: u64,
) -> ! {
    let mut start = *ctx;
    start.set_ip(start.ip().wrapping_sub(1));
    let exception = &mut *exception;
    let rethrow = rethrow_flag != 0;
    if !rethrow {
        exception.clear_trace();
    }
    deliver(start, exception, rethrow)
}

/// Dispatch entry behind the throw-by-token stub: compiled code raising a
/// well-known type without constructing the object itself. `pc_offset`
/// backs the ip up further when the raise site precedes the stub call.
///
/// # Safety
/// Called from the throw stubs only; `ctx` points at the stub's captured
/// context.
pub unsafe extern "C" fn ember_throw_by_token(
    ctx: *const CpuContext,
    token: u64,
    pc_offset: u64,
) -> ! {
    let mut start = *ctx;
    start.set_ip(start.ip().wrapping_sub(1).wrapping_sub(pc_offset));
    let exception = Box::into_raw(Box::new(ManagedException::new(
        TypeToken(token as u32),
        String::new(),
    )));
    deliver(start, &mut *exception, false)
}

/// Dispatch entry behind the resume-unwind stub: a finally block has run
/// to completion and the interrupted dispatch continues with the parked
/// exception.
///
/// # Safety
/// Called from the throw stubs only; `ctx` points at the stub's captured
/// context.
pub unsafe extern "C" fn ember_resume_unwind(ctx: *const CpuContext) -> ! {
    let mut start = *ctx;
    start.set_ip(start.ip().wrapping_sub(1));
    let Some(exception) = take_in_flight() else {
        eprintln!("[ember-dispatch] resume-unwind with no in-flight exception");
        std::process::abort();
    };
    let exception = Box::into_raw(exception);
    deliver(start, &mut *exception, true)
}

// =============================================================================
// Hardware-fault delivery
// =============================================================================

/// Whether an instruction pointer belongs to compiled managed code.
pub fn ip_is_managed(ip: u64) -> bool {
    crate::runtime().is_some_and(|rt| {
        rt.index()
            .find_by_ip(ip)
            .is_some_and(|r| r.kind == RegionKind::Managed)
    })
}

/// Synchronous fault delivery: dispatch and hand the resume context back
/// to the signal handler, which writes it into the hardware record.
///
/// The faulting ip is exact (it is the faulting instruction, not a return
/// address), so no call-site bias applies.
pub fn dispatch_hardware_fault(kind: FaultKind, fault_addr: u64, ctx: CpuContext) -> CpuContext {
    let mut exception = Box::new(ManagedException::new(
        kind.token(),
        format!("{} at {fault_addr:#x}", kind.describe()),
    ));

    let Some(runtime) = crate::runtime() else {
        eprintln!(
            "[ember-dispatch] {} at ip={:#x} before runtime initialization",
            kind.describe(),
            ctx.ip()
        );
        std::process::abort();
    };

    let chain = snapshot_transitions();
    let outcome = unsafe {
        runtime
            .dispatcher()
            .dispatch(&ctx, &chain, &mut exception, false)
    };
    match outcome {
        Ok(DispatchOutcome::Handled { resume }) => {
            // The handler takes ownership through rax.
            let _ = Box::into_raw(exception);
            resume
        }
        Ok(DispatchOutcome::Unhandled) => {
            eprint!("[ember-dispatch] {}", exception.render_trace());
            std::process::abort();
        }
        Err(err) => {
            eprintln!("[ember-dispatch] unwind failed during fault delivery: {err}");
            std::process::abort();
        }
    }
}

/// Deferred fault delivery: dispatch on the faulting thread's own stack
/// and restore straight into the handler.
pub fn handle_hardware_fault(kind: FaultKind, fault_addr: u64, ctx: CpuContext) -> ! {
    let resume = dispatch_hardware_fault(kind, fault_addr, ctx);
    // dispatch_hardware_fault aborts unless the runtime exists.
    let runtime = crate::runtime().unwrap_or_else(|| std::process::abort());
    unsafe { (runtime.trampolines().restore_context())(&resume) }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_index::{CodeRegion, EhClause};
    use crate::unwind_info::UnwindProgramBuilder;
    use parking_lot::Mutex;
    use rustc_hash::FxHashMap;

    const INNER_BASE: u64 = 0x7000_0000;
    const OUTER_BASE: u64 = 0x7100_0000;

    /// Records every handler call and answers filters from a script.
    struct RecordingInvoker {
        calls: Mutex<Vec<(u64, u64)>>, // (target, rax)
        verdicts: Mutex<FxHashMap<u64, usize>>,
    }

    impl RecordingInvoker {
        fn new() -> Arc<Self> {
            Arc::new(RecordingInvoker {
                calls: Mutex::new(Vec::new()),
                verdicts: Mutex::new(FxHashMap::default()),
            })
        }

        fn script(&self, target: u64, verdict: usize) {
            self.verdicts.lock().insert(target, verdict);
        }

        fn calls(&self) -> Vec<(u64, u64)> {
            self.calls.lock().clone()
        }
    }

    impl HandlerInvoker for RecordingInvoker {
        unsafe fn call(&self, ctx: &CpuContext, target: u64) -> usize {
            self.calls.lock().push((target, ctx.get(Gpr::Rax)));
            self.verdicts.lock().get(&target).copied().unwrap_or(0)
        }
    }

    fn leaf_program() -> crate::unwind_info::UnwindProgram {
        let mut b = UnwindProgramBuilder::new();
        b.cfa_register(Gpr::Rsp);
        b.cfa_offset(8);
        b.finish()
    }

    fn region(start: u64, name: &str, clauses: Vec<EhClause>) -> CodeRegion {
        CodeRegion {
            start,
            size: 0x100,
            kind: RegionKind::Managed,
            method_name: name.to_string(),
            unwind: leaf_program(),
            eh_clauses: clauses,
        }
    }

    /// Two leaf frames: the inner one throwing at +0x20, returning into
    /// the outer one at +0x30. `stack[0]` holds the return address,
    /// `stack[1]` is the outer frame's zeroed root slot.
    fn two_frame_stack(stack: &mut [u64; 2]) -> CpuContext {
        stack[0] = OUTER_BASE + 0x31; // biased back to +0x30 on unwind
        stack[1] = 0;
        let mut ctx = CpuContext::new();
        ctx.set_ip(INNER_BASE + 0x20);
        ctx.set_sp(&stack[0] as *const u64 as u64);
        ctx
    }

    fn dispatcher(
        index: Arc<CodeRegionIndex>,
        invoker: Arc<dyn HandlerInvoker>,
    ) -> ExceptionDispatcher {
        ExceptionDispatcher::new(index, TypeRegistry::with_well_known(), invoker, 64)
    }

    #[test]
    fn test_catch_runs_inner_finally_first() {
        let index = Arc::new(CodeRegionIndex::new());
        index
            .register(region(
                INNER_BASE,
                "Demo::inner",
                vec![EhClause {
                    try_start: 0x10,
                    try_end: 0x40,
                    handler_offset: 0x80,
                    kind: EhKind::Finally,
                }],
            ))
            .unwrap();
        index
            .register(region(
                OUTER_BASE,
                "Demo::outer",
                vec![EhClause {
                    try_start: 0x20,
                    try_end: 0x40,
                    handler_offset: 0x90,
                    kind: EhKind::Catch(TypeToken::EXCEPTION),
                }],
            ))
            .unwrap();

        let invoker = RecordingInvoker::new();
        let d = dispatcher(Arc::clone(&index), invoker.clone());
        let chain = TransitionChain::new();
        let mut stack = [0u64; 2];
        let ctx = two_frame_stack(&mut stack);
        let mut exc = ManagedException::new(TypeToken::EXCEPTION, "boom");

        let outcome = unsafe { d.dispatch(&ctx, &chain, &mut exc, false) }.unwrap();
        let DispatchOutcome::Handled { resume } = outcome else {
            panic!("expected handled");
        };

        // The inner finally ran exactly once, with a null exception.
        assert_eq!(invoker.calls(), vec![(INNER_BASE + 0x80, 0)]);
        // Resume lands at the outer catch handler with the exception in rax.
        assert_eq!(resume.ip(), OUTER_BASE + 0x90);
        assert_eq!(resume.get(Gpr::Rax), &mut exc as *mut ManagedException as u64);
        assert_eq!(resume.sp(), &stack[1] as *const u64 as u64);

        // Both frames appear in the trace, throw site first.
        assert_eq!(
            exc.trace_frames()[0].method.as_deref(),
            Some("Demo::inner")
        );
        assert_eq!(
            exc.trace_frames()[1].method.as_deref(),
            Some("Demo::outer")
        );
    }

    #[test]
    fn test_rejected_filter_falls_through_to_catch() {
        let index = Arc::new(CodeRegionIndex::new());
        index
            .register(region(
                INNER_BASE,
                "Demo::inner",
                vec![EhClause {
                    try_start: 0x10,
                    try_end: 0x40,
                    handler_offset: 0x78,
                    kind: EhKind::Filter { filter_offset: 0x70 },
                }],
            ))
            .unwrap();
        index
            .register(region(
                OUTER_BASE,
                "Demo::outer",
                vec![EhClause {
                    try_start: 0x20,
                    try_end: 0x40,
                    handler_offset: 0x90,
                    kind: EhKind::Catch(TypeToken::EXCEPTION),
                }],
            ))
            .unwrap();

        let invoker = RecordingInvoker::new();
        invoker.script(INNER_BASE + 0x70, 0); // filter rejects
        let d = dispatcher(Arc::clone(&index), invoker.clone());
        let chain = TransitionChain::new();
        let mut stack = [0u64; 2];
        let ctx = two_frame_stack(&mut stack);
        let mut exc = ManagedException::new(TypeToken::DIVIDE_BY_ZERO, "div");

        let outcome = unsafe { d.dispatch(&ctx, &chain, &mut exc, false) }.unwrap();
        let DispatchOutcome::Handled { resume } = outcome else {
            panic!("expected handled");
        };
        assert_eq!(resume.ip(), OUTER_BASE + 0x90);

        // The filter ran during the search pass with the exception in rax.
        let calls = invoker.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, INNER_BASE + 0x70);
        assert_eq!(calls[0].1, &mut exc as *mut ManagedException as u64);
    }

    #[test]
    fn test_accepting_filter_resumes_at_its_handler() {
        let index = Arc::new(CodeRegionIndex::new());
        index
            .register(region(
                INNER_BASE,
                "Demo::inner",
                vec![EhClause {
                    try_start: 0x10,
                    try_end: 0x40,
                    handler_offset: 0x78,
                    kind: EhKind::Filter { filter_offset: 0x70 },
                }],
            ))
            .unwrap();

        let invoker = RecordingInvoker::new();
        invoker.script(INNER_BASE + 0x70, 1); // filter accepts
        let d = dispatcher(Arc::clone(&index), invoker.clone());
        let chain = TransitionChain::new();
        let mut stack = [0u64; 2];
        let ctx = two_frame_stack(&mut stack);
        let mut exc = ManagedException::new(TypeToken::OVERFLOW, "ovf");

        let outcome = unsafe { d.dispatch(&ctx, &chain, &mut exc, false) }.unwrap();
        let DispatchOutcome::Handled { resume } = outcome else {
            panic!("expected handled");
        };
        // The handler body, not the filter body.
        assert_eq!(resume.ip(), INNER_BASE + 0x78);
        // The accepting frame is the throw frame; nothing unwound.
        assert_eq!(resume.sp(), ctx.sp());
    }

    #[test]
    fn test_unmatched_catch_type_is_unhandled() {
        let index = Arc::new(CodeRegionIndex::new());
        index
            .register(region(
                INNER_BASE,
                "Demo::inner",
                vec![EhClause {
                    try_start: 0x10,
                    try_end: 0x40,
                    handler_offset: 0x80,
                    kind: EhKind::Catch(TypeToken::OVERFLOW),
                }],
            ))
            .unwrap();
        index.register(region(OUTER_BASE, "Demo::outer", Vec::new())).unwrap();

        let invoker = RecordingInvoker::new();
        let d = dispatcher(Arc::clone(&index), invoker.clone());
        let chain = TransitionChain::new();
        let mut stack = [0u64; 2];
        let ctx = two_frame_stack(&mut stack);
        let mut exc = ManagedException::new(TypeToken::ACCESS_VIOLATION, "av");

        let outcome = unsafe { d.dispatch(&ctx, &chain, &mut exc, false) }.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Unhandled));
        // No cleanup ran: pass 2 never starts for an unhandled exception.
        assert!(invoker.calls().is_empty());
        // The trace still covers the whole walk.
        assert_eq!(exc.trace_ips().len(), 2);
    }

    #[test]
    fn test_rethrow_preserves_trace() {
        let index = Arc::new(CodeRegionIndex::new());
        index
            .register(region(
                OUTER_BASE,
                "Demo::outer",
                vec![EhClause {
                    try_start: 0x20,
                    try_end: 0x40,
                    handler_offset: 0x90,
                    kind: EhKind::Catch(TypeToken::EXCEPTION),
                }],
            ))
            .unwrap();
        index.register(region(INNER_BASE, "Demo::inner", Vec::new())).unwrap();

        let invoker = RecordingInvoker::new();
        let d = dispatcher(Arc::clone(&index), invoker.clone());
        let chain = TransitionChain::new();
        let mut stack = [0u64; 2];
        let ctx = two_frame_stack(&mut stack);

        // Trace captured at the original throw site.
        let mut exc = ManagedException::new(TypeToken::EXCEPTION, "boom");
        exc.push_trace_frame(0x1234_5678, Some("Original::site".into()));

        let outcome = unsafe { d.dispatch(&ctx, &chain, &mut exc, true) }.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Handled { .. }));
        // The rethrow walk added nothing.
        assert_eq!(exc.trace_ips(), &[0x1234_5678]);
    }

    #[test]
    fn test_in_flight_roundtrip() {
        assert!(take_in_flight().is_none());
        set_in_flight(Box::new(ManagedException::new(TypeToken::EXCEPTION, "x")));
        let exc = take_in_flight().expect("nothing parked");
        assert_eq!(exc.token(), TypeToken::EXCEPTION);
        assert!(take_in_flight().is_none());
    }

    #[test]
    fn test_transition_tls_push_pop() {
        // The thread chain starts with the stack-top seed.
        let seeded = snapshot_transitions();
        let base_len = seeded.len();
        assert!(base_len >= 1);

        push_transition(TransitionRecord::plain(0x9000, 0, 0x42));
        assert_eq!(snapshot_transitions().len(), base_len + 1);
        assert_eq!(pop_transition().unwrap().sp, 0x9000);
        assert_eq!(snapshot_transitions().len(), base_len);
    }
}
