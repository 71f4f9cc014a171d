//! Managed exception dispatch and stack unwinding for compiled code.
//!
//! This crate owns everything between a throw (explicit or hardware
//! fault) and the resumption of execution inside a handler:
//!
//! - [`context`]: the portable register snapshot frames are described in.
//! - [`unwind_info`]: compact byte programs encoding per-method frame
//!   layout, replayed to any instruction offset.
//! - [`code_index`]: the ip → compiled-region index carrying unwind
//!   programs and exception-handler tables.
//! - [`transition`]: records marking native↔managed stack crossings.
//! - [`unwinder`]: the single-step frame walker built on the three above.
//! - [`stubs`] / [`trampolines`]: runtime-emitted machine-code bridges
//!   (context restore, filter invocation, the throw family).
//! - [`signal`]: hardware-fault capture and translation.
//! - [`dispatch`]: the two-pass search/unwind driver.
//!
//! The process-wide pieces are wired together by [`init`] and reached
//! through [`runtime`]; per-method state enters through
//! [`UnwindRuntime::index`].

pub mod code_index;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod exception;
pub mod signal;
pub mod stubs;
pub mod trampolines;
pub mod transition;
pub mod unwind_info;
pub mod unwinder;

use std::sync::Arc;
use std::sync::OnceLock;

pub use code_index::{CodeRegion, CodeRegionIndex, EhClause, EhKind, RegionKind};
pub use config::UnwindConfig;
#[cfg(target_arch = "x86_64")]
pub use context::capture_context;
pub use context::{CpuContext, Gpr};
pub use dispatch::{DispatchOutcome, ExceptionDispatcher, HandlerInvoker};
pub use exception::{ManagedException, TypeRegistry, TypeToken};
pub use signal::FaultKind;
pub use transition::{TransitionChain, TransitionRecord};
pub use unwind_info::{UnwindProgram, UnwindProgramBuilder};
pub use unwinder::{StepOutcome, Unwinder, UnwindError};

use dispatch::TrampolineInvoker;
use signal::HandlerError;
use trampolines::{DispatchEntries, TrampolineError, Trampolines};

// =============================================================================
// Initialization errors
// =============================================================================

/// Failure during runtime initialization.
#[derive(Debug)]
pub enum InitError {
    /// The trampoline page could not be built.
    Trampoline(TrampolineError),
    /// A trampoline region collided in the code index.
    Region(code_index::RegionError),
    /// The fault handlers could not be installed.
    Handler(HandlerError),
}

impl std::fmt::Display for InitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InitError::Trampoline(e) => write!(f, "trampoline setup failed: {e}"),
            InitError::Region(e) => write!(f, "trampoline region registration failed: {e}"),
            InitError::Handler(e) => write!(f, "fault handler setup failed: {e}"),
        }
    }
}

impl std::error::Error for InitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InitError::Trampoline(e) => Some(e),
            InitError::Region(e) => Some(e),
            InitError::Handler(e) => Some(e),
        }
    }
}

impl From<TrampolineError> for InitError {
    fn from(e: TrampolineError) -> Self {
        InitError::Trampoline(e)
    }
}

impl From<code_index::RegionError> for InitError {
    fn from(e: code_index::RegionError) -> Self {
        InitError::Region(e)
    }
}

impl From<HandlerError> for InitError {
    fn from(e: HandlerError) -> Self {
        InitError::Handler(e)
    }
}

// =============================================================================
// UnwindRuntime
// =============================================================================

/// The wired-together process-wide unwind machinery.
pub struct UnwindRuntime {
    index: Arc<CodeRegionIndex>,
    types: Arc<TypeRegistry>,
    config: UnwindConfig,
    trampolines: &'static Trampolines,
    dispatcher: ExceptionDispatcher,
}

impl UnwindRuntime {
    /// The compiled-code index; JIT paths register emitted methods here.
    pub fn index(&self) -> &CodeRegionIndex {
        &self.index
    }

    /// The managed type hierarchy used for catch-clause matching.
    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.types
    }

    pub fn config(&self) -> &UnwindConfig {
        &self.config
    }

    pub fn trampolines(&self) -> &'static Trampolines {
        self.trampolines
    }

    pub fn dispatcher(&self) -> &ExceptionDispatcher {
        &self.dispatcher
    }
}

static RUNTIME: OnceLock<UnwindRuntime> = OnceLock::new();

/// Initialize the process-wide runtime: build the trampoline page, wire
/// the dispatch entries, and install the fault handlers if configured.
///
/// Idempotent: a second call returns the existing runtime and ignores the
/// new configuration.
pub fn init(config: UnwindConfig) -> Result<&'static UnwindRuntime, InitError> {
    if let Some(existing) = RUNTIME.get() {
        return Ok(existing);
    }

    let entries = DispatchEntries {
        throw: dispatch::ember_throw_exception as usize,
        throw_by_token: dispatch::ember_throw_by_token as usize,
        resume_unwind: dispatch::ember_resume_unwind as usize,
    };
    let trampolines = trampolines::install(entries)?;

    let index = Arc::new(CodeRegionIndex::new());
    trampolines.register_regions(&index)?;

    let types = TypeRegistry::with_well_known();
    let invoker = Arc::new(TrampolineInvoker::new(trampolines));
    let dispatcher = ExceptionDispatcher::new(
        Arc::clone(&index),
        Arc::clone(&types),
        invoker,
        config.max_trace_frames,
    );

    if config.install_signal_handlers {
        match signal::install_handlers(config.deferred_delivery) {
            // Lost the init race to another thread; its handlers serve.
            Ok(()) | Err(HandlerError::AlreadyInstalled) => {}
            Err(e) => return Err(InitError::Handler(e)),
        }
        // The handlers run with SA_ONSTACK; the initializing thread needs
        // its alternate stack armed before the first guard-page hit.
        signal::setup_alt_stack()?;
    }

    let runtime = UnwindRuntime {
        index,
        types,
        config,
        trampolines,
        dispatcher,
    };
    Ok(RUNTIME.get_or_init(|| runtime))
}

/// The initialized runtime, if [`init`] has run.
pub fn runtime() -> Option<&'static UnwindRuntime> {
    RUNTIME.get()
}

/// Uninstall the fault handlers. The trampoline page and code index stay
/// live; emitted code may still hold stub addresses.
pub fn shutdown() -> Result<(), HandlerError> {
    let Some(rt) = RUNTIME.get() else {
        return Err(HandlerError::NotInstalled);
    };
    if rt.config.install_signal_handlers {
        signal::uninstall_handlers()
    } else {
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> UnwindConfig {
        // Installing real fault handlers inside the test harness would
        // shadow its own crash reporting.
        UnwindConfig {
            install_signal_handlers: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_init_is_idempotent() {
        let a = init(test_config()).expect("init failed");
        let b = init(test_config()).expect("init failed");
        assert!(std::ptr::eq(a, b));
        assert!(runtime().is_some());
    }

    #[test]
    fn test_init_registers_trampoline_regions() {
        let rt = init(test_config()).expect("init failed");
        assert!(rt.index().len() >= 6);
        let region = rt
            .index()
            .find_by_ip(rt.trampolines().throw_addr())
            .expect("throw stub not indexed");
        assert_eq!(region.kind, RegionKind::Trampoline);
    }

    #[test]
    fn test_init_seeds_well_known_types() {
        let rt = init(test_config()).expect("init failed");
        assert!(rt
            .types()
            .is_assignable(TypeToken::STACK_OVERFLOW, TypeToken::EXCEPTION));
    }
}
