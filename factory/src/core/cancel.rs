//! Cooperative cancellation shared between the signal handler and blocking waits.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Error returned by any operation interrupted by a cancel request.
///
/// Callers detect it with `err.downcast_ref::<Cancelled>()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("run cancelled")]
pub struct Cancelled;

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Return `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> anyhow::Result<()> {
        if self.is_cancelled() {
            return Err(Cancelled.into());
        }
        Ok(())
    }
}

/// True when `err` (or anything in its context chain) is a cancellation.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<Cancelled>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(token.check().is_ok());
        other.cancel();
        assert!(token.is_cancelled());
        let err = token.check().unwrap_err();
        assert!(is_cancelled(&err));
    }

    #[test]
    fn detects_cancel_through_context() {
        let err = Err::<(), _>(anyhow::Error::from(Cancelled))
            .context("run agent")
            .unwrap_err();
        assert!(is_cancelled(&err));
        assert!(!is_cancelled(&anyhow::anyhow!("other")));
    }

    #[test]
    fn cancelled_error_message() {
        assert_eq!(Cancelled.to_string(), "run cancelled");
        let token = CancelToken::default();
        token.cancel();
        assert_eq!(token.check().unwrap_err().to_string(), "run cancelled");
    }
}
