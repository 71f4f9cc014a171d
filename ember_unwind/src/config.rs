//! Unwind runtime configuration parameters.

/// Configuration for the unwind runtime.
///
/// # Example
///
/// ```ignore
/// use ember_unwind::UnwindConfig;
///
/// // Embedding host that installs its own crash handlers
/// let config = UnwindConfig {
///     install_signal_handlers: false,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct UnwindConfig {
    /// Install the process-wide hardware-fault handlers during init.
    ///
    /// Turn off when the embedding host owns SIGSEGV and friends and
    /// forwards managed faults itself.
    ///
    /// Default: true
    pub install_signal_handlers: bool,

    /// Deliver hardware faults through the deferred redirect rather than
    /// dispatching inside the signal handler.
    ///
    /// Deferred delivery reruns dispatch on the faulting thread's normal
    /// stack with signals unblocked, which is required for filter clauses
    /// that can fault. Synchronous delivery avoids the context rewrite
    /// and is sufficient when filters are trusted not to trap.
    ///
    /// Default: true
    pub deferred_delivery: bool,

    /// Upper bound on trace frames captured per throw.
    ///
    /// Deeply recursive throw sites stop accumulating past this count;
    /// dispatch itself continues to the root regardless.
    ///
    /// Default: 128
    pub max_trace_frames: usize,
}

impl Default for UnwindConfig {
    fn default() -> Self {
        UnwindConfig {
            install_signal_handlers: true,
            deferred_delivery: true,
            max_trace_frames: 128,
        }
    }
}
