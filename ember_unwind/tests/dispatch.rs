//! End-to-end dispatch over synthetic stacks: three nested compiled
//! frames, handler tables, transition records and the two-pass ordering
//! guarantees, driven through the public crate surface.

use std::sync::Arc;

use parking_lot::Mutex;

use ember_unwind::code_index::{CodeRegion, CodeRegionIndex, EhClause, EhKind, RegionKind};
use ember_unwind::context::{CpuContext, Gpr};
use ember_unwind::dispatch::{DispatchOutcome, ExceptionDispatcher, HandlerInvoker};
use ember_unwind::exception::{ManagedException, TypeRegistry, TypeToken};
use ember_unwind::transition::{TransitionChain, TransitionRecord};
use ember_unwind::unwind_info::UnwindProgramBuilder;

const LEAF_BASE: u64 = 0x7000_0000;
const MID_BASE: u64 = 0x7100_0000;
const ROOT_BASE: u64 = 0x7200_0000;

/// Records handler invocations instead of executing machine code.
struct RecordingInvoker {
    calls: Mutex<Vec<(u64, u64)>>, // (target, rax at entry)
}

impl RecordingInvoker {
    fn new() -> Arc<Self> {
        Arc::new(RecordingInvoker {
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<(u64, u64)> {
        self.calls.lock().clone()
    }
}

impl HandlerInvoker for RecordingInvoker {
    unsafe fn call(&self, ctx: &CpuContext, target: u64) -> usize {
        self.calls.lock().push((target, ctx.get(Gpr::Rax)));
        0
    }
}

fn leaf_program() -> ember_unwind::unwind_info::UnwindProgram {
    let mut b = UnwindProgramBuilder::new();
    b.cfa_register(Gpr::Rsp);
    b.cfa_offset(8);
    b.finish()
}

fn region(start: u64, name: &str, clauses: Vec<EhClause>) -> CodeRegion {
    CodeRegion {
        start,
        size: 0x200,
        kind: RegionKind::Managed,
        method_name: name.to_string(),
        unwind: leaf_program(),
        eh_clauses: clauses,
    }
}

fn finally(try_start: u32, try_end: u32, handler_offset: u32) -> EhClause {
    EhClause {
        try_start,
        try_end,
        handler_offset,
        kind: EhKind::Finally,
    }
}

fn catch(try_start: u32, try_end: u32, handler_offset: u32, token: TypeToken) -> EhClause {
    EhClause {
        try_start,
        try_end,
        handler_offset,
        kind: EhKind::Catch(token),
    }
}

/// Root::main → Mid::run → Leaf::compute, all leaf frames (CFA = rsp + 8,
/// return address at [rsp]). `stack[2]` is the zeroed root slot.
fn three_frame_stack(stack: &mut [u64; 3]) -> CpuContext {
    stack[0] = MID_BASE + 0x31; // biased back to Mid+0x30
    stack[1] = ROOT_BASE + 0x41; // biased back to Root+0x40
    stack[2] = 0;
    let mut ctx = CpuContext::new();
    ctx.set_ip(LEAF_BASE + 0x20);
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
fn two_pass_runs_leaf_cleanup_then_resumes_in_catcher() {
    let index = Arc::new(CodeRegionIndex::new());
    index
        .register(region(
            LEAF_BASE,
            "Leaf::compute",
            vec![finally(0x10, 0x30, 0xa0)],
        ))
        .unwrap();
    index
        .register(region(
            MID_BASE,
            "Mid::run",
            vec![catch(0x20, 0x40, 0xb0, TypeToken::EXCEPTION)],
        ))
        .unwrap();
    // Root's finally protects the call site but sits above the catcher; it
    // must not run.
    index
        .register(region(
            ROOT_BASE,
            "Root::main",
            vec![finally(0x30, 0x50, 0xc0)],
        ))
        .unwrap();

    let invoker = RecordingInvoker::new();
    let d = dispatcher(Arc::clone(&index), invoker.clone());
    let chain = TransitionChain::new();
    let mut stack = [0u64; 3];
    let ctx = three_frame_stack(&mut stack);
    let mut exc = ManagedException::new(TypeToken::ACCESS_VIOLATION, "bad pointer");

    let outcome = unsafe { d.dispatch(&ctx, &chain, &mut exc, false) }.unwrap();
    let DispatchOutcome::Handled { resume } = outcome else {
        panic!("expected handled");
    };

    // Exactly one cleanup ran: the leaf finally, with a null exception.
    assert_eq!(invoker.calls(), vec![(LEAF_BASE + 0xa0, 0)]);

    // Resume in Mid's catch handler, caller frame restored, exception in rax.
    assert_eq!(resume.ip(), MID_BASE + 0xb0);
    assert_eq!(resume.sp(), &stack[1] as *const u64 as u64);
    assert_eq!(resume.get(Gpr::Rax), &mut exc as *mut ManagedException as u64);

    // The search stopped at the catcher; Root never entered the trace.
    let methods: Vec<_> = exc
        .trace_frames()
        .iter()
        .map(|f| f.method.as_deref().unwrap_or("<native>").to_string())
        .collect();
    assert_eq!(methods, vec!["Leaf::compute", "Mid::run"]);
}

#[test]
fn rethrow_keeps_the_original_trace() {
    let index = Arc::new(CodeRegionIndex::new());
    index.register(region(MID_BASE, "Mid::run", Vec::new())).unwrap();
    index
        .register(region(
            ROOT_BASE,
            "Root::main",
            vec![catch(0x30, 0x50, 0xc0, TypeToken::EXCEPTION)],
        ))
        .unwrap();

    let invoker = RecordingInvoker::new();
    let d = dispatcher(Arc::clone(&index), invoker.clone());
    let chain = TransitionChain::new();

    // Mid rethrows from +0x30; Root catches one frame up.
    let mut stack = [0u64; 2];
    stack[0] = ROOT_BASE + 0x41;
    stack[1] = 0;
    let mut ctx = CpuContext::new();
    ctx.set_ip(MID_BASE + 0x30);
    ctx.set_sp(&stack[0] as *const u64 as u64);

    let mut exc = ManagedException::new(TypeToken::DIVIDE_BY_ZERO, "div");
    exc.push_trace_frame(LEAF_BASE + 0x20, Some("Leaf::compute".into()));
    exc.push_trace_frame(MID_BASE + 0x30, Some("Mid::run".into()));

    let outcome = unsafe { d.dispatch(&ctx, &chain, &mut exc, true) }.unwrap();
    let DispatchOutcome::Handled { resume } = outcome else {
        panic!("expected handled");
    };
    assert_eq!(resume.ip(), ROOT_BASE + 0xc0);

    // The rethrow walk added no frames; the trace still ends at the
    // original throw site.
    assert_eq!(exc.trace_ips(), &[LEAF_BASE + 0x20, MID_BASE + 0x30]);
}

#[test]
fn unhandled_walks_to_the_root_without_cleanup() {
    let index = Arc::new(CodeRegionIndex::new());
    index
        .register(region(
            LEAF_BASE,
            "Leaf::compute",
            vec![finally(0x10, 0x30, 0xa0)],
        ))
        .unwrap();
    index.register(region(MID_BASE, "Mid::run", Vec::new())).unwrap();
    index
        .register(region(
            ROOT_BASE,
            "Root::main",
            // Wrong type: overflow clause cannot take an access violation.
            vec![catch(0x30, 0x50, 0xc0, TypeToken::OVERFLOW)],
        ))
        .unwrap();

    let invoker = RecordingInvoker::new();
    let d = dispatcher(Arc::clone(&index), invoker.clone());
    let chain = TransitionChain::new();
    let mut stack = [0u64; 3];
    let ctx = three_frame_stack(&mut stack);
    let mut exc = ManagedException::new(TypeToken::ACCESS_VIOLATION, "bad pointer");

    let outcome = unsafe { d.dispatch(&ctx, &chain, &mut exc, false) }.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Unhandled));

    // Pass 2 never started, so no finally ran.
    assert!(invoker.calls().is_empty());

    // The trace covers the whole walk and renders every method.
    assert_eq!(exc.trace_ips().len(), 3);
    let rendered = exc.render_trace();
    assert!(rendered.contains("Leaf::compute"));
    assert!(rendered.contains("Root::main"));
    assert!(rendered.contains("bad pointer"));
}

#[test]
fn dispatch_crosses_a_native_transition() {
    let index = Arc::new(CodeRegionIndex::new());
    index
        .register(region(
            MID_BASE,
            "Mid::run",
            vec![catch(0x20, 0x40, 0xb0, TypeToken::EXCEPTION)],
        ))
        .unwrap();

    let invoker = RecordingInvoker::new();
    let d = dispatcher(Arc::clone(&index), invoker.clone());

    // A runtime helper (native, unresolvable ip) throws; the transition
    // record left at the crossing points back into Mid's frame.
    let mut stack = [0u64; 2];
    stack[0] = MID_BASE + 0x31;
    stack[1] = 0;

    let mut chain = TransitionChain::for_thread();
    chain.push(TransitionRecord::plain(
        &stack[1] as *const u64 as u64,
        0,
        0,
    ));

    let mut ctx = CpuContext::new();
    ctx.set_ip(0xdead_0000); // native helper
    ctx.set_sp(0x100); // below every synthetic frame

    let mut exc = ManagedException::new(TypeToken::EXCEPTION, "from native");
    let outcome = unsafe { d.dispatch(&ctx, &chain, &mut exc, false) }.unwrap();
    let DispatchOutcome::Handled { resume } = outcome else {
        panic!("expected handled");
    };
    assert_eq!(resume.ip(), MID_BASE + 0xb0);

    // The native frame shows up in the trace without a method name.
    assert_eq!(exc.trace_frames()[0].method, None);
    assert_eq!(exc.trace_frames()[1].method.as_deref(), Some("Mid::run"));
}
