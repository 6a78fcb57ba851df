use std::sync::atomic::{AtomicBool, Ordering};

/// Shared shutdown signal: `ctrlc`'s handler raises it, every worker and
/// the applier thread poll it between ticks.
pub struct BarrierFlag(AtomicBool);

impl Default for BarrierFlag {
    fn default() -> Self {
        Self(AtomicBool::new(false))
    }
}

impl BarrierFlag {
    #[inline]
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
    #[inline]
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
