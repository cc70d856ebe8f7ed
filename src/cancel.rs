use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{PrecisError, Result};

/// Shared cancellation signal for one batch.
///
/// Checked before every step and filter stage, and polled while external
/// processes run. Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once the flag is set
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(PrecisError::Cancelled)
        } else {
            Ok(())
        }
    }
}
