use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation signal passed explicitly through every
/// suspension point (§9: "do not rely on thread-local ambient state").
///
/// Cloning shares the same underlying flag — cancelling any clone cancels
/// every clone, so a caller's token and whatever clone of it an attempt
/// holds always observe the same signal. Per-attempt timeout cancellation
/// is handled separately by the resilience pipeline's timeout layer
/// dropping the attempt's future outright, not by deriving a narrower
/// token from this one.
#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_shares_cancellation_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
