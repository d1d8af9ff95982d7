//! Caller-initiated cancellation.

use crate::error::{CoreError, CoreResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cloneable cancellation flag.
///
/// Adapters check it before issuing a backend call and periodically while
/// scanning. Writes never observe it: an audit append runs to completion.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Visible to every clone.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fails with [`CoreError::Cancelled`] if cancelled.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` naming `operation`.
    pub fn check(&self, operation: &str) -> CoreResult<()> {
        if self.is_cancelled() {
            return Err(CoreError::cancelled(operation));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(clone.check("read").is_ok());
        token.cancel();
        assert!(clone.is_cancelled());
        assert!(matches!(
            clone.check("read"),
            Err(CoreError::Cancelled { operation }) if operation == "read"
        ));
    }
}
