//! Process-wide dump toggles. These are meant to be flipped once, before any
//! compilation starts; compilations read them at the dump points only.

use std::sync::atomic::{AtomicBool, Ordering};

static LOG_HIR: AtomicBool = AtomicBool::new(false);
static LOG_LIR: AtomicBool = AtomicBool::new(false);
static LOG_FULLGEN: AtomicBool = AtomicBool::new(false);

pub fn enable_hir_logging() {
    LOG_HIR.store(true, Ordering::Relaxed);
}

pub fn disable_hir_logging() {
    LOG_HIR.store(false, Ordering::Relaxed);
}

pub fn hir_logging() -> bool {
    LOG_HIR.load(Ordering::Relaxed)
}

pub fn enable_lir_logging() {
    LOG_LIR.store(true, Ordering::Relaxed);
}

pub fn disable_lir_logging() {
    LOG_LIR.store(false, Ordering::Relaxed);
}

pub fn lir_logging() -> bool {
    LOG_LIR.load(Ordering::Relaxed)
}

/// The non-optimizing baseline generator lives with the target backend; the
/// toggle is recognized here so one configuration surface covers all three.
pub fn enable_fullgen_logging() {
    LOG_FULLGEN.store(true, Ordering::Relaxed);
}

pub fn disable_fullgen_logging() {
    LOG_FULLGEN.store(false, Ordering::Relaxed);
}

pub fn fullgen_logging() -> bool {
    LOG_FULLGEN.load(Ordering::Relaxed)
}
