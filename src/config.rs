//! Process-wide diagnostic toggles.
//!
//! These are read on hot paths but written once, near program start, so they
//! are plain relaxed atomics.

use std::sync::atomic::{AtomicBool, Ordering};

static KEEP_NODE_CREATION_BACKTRACE: AtomicBool = AtomicBool::new(false);
static DEBUG: AtomicBool = AtomicBool::new(false);
static VERBOSE: AtomicBool = AtomicBool::new(false);

/// When enabled, every node captures a backtrace at creation, shown in
/// diagnostics for that node. Off by default; capturing is expensive.
pub fn set_keep_node_creation_backtrace(enabled: bool) {
    KEEP_NODE_CREATION_BACKTRACE.store(enabled, Ordering::Relaxed);
}

pub(crate) fn keep_node_creation_backtrace() -> bool {
    KEEP_NODE_CREATION_BACKTRACE.load(Ordering::Relaxed)
}

/// When enabled, the full structural invariant is re-checked after every
/// stabilisation. Slow; intended for tests and debugging sessions.
pub fn set_debug(enabled: bool) {
    DEBUG.store(enabled, Ordering::Relaxed);
}

pub(crate) fn debug() -> bool {
    DEBUG.load(Ordering::Relaxed)
}

/// When enabled, per-node recomputation is logged at `tracing` debug level
/// rather than trace level.
pub fn set_verbose(enabled: bool) {
    VERBOSE.store(enabled, Ordering::Relaxed);
}

pub(crate) fn verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}
