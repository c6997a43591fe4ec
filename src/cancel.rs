use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// A one-shot, reason-carrying cancellation broadcast.
///
/// Clones share state. Only the first `cancel` records a reason; later calls
/// are no-ops.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
    reason: Arc<OnceLock<String>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if this call performed the cancellation.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let first = self.reason.set(reason.into()).is_ok();
        if first {
            self.token.cancel();
        }
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.get().map(String::as_str)
    }

    /// The error handed to operations aborted by this handle.
    pub fn error(&self) -> Error {
        Error::Cancelled {
            reason: self.reason().unwrap_or("cancelled").to_string(),
        }
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_reason_wins() {
        let handle = CancelHandle::new();
        let clone = handle.clone();
        assert!(!handle.is_cancelled());

        assert!(clone.cancel("time budget exhausted"));
        assert!(!handle.cancel("second"));

        handle.cancelled().await;
        assert!(handle.is_cancelled());
        assert_eq!(handle.reason(), Some("time budget exhausted"));
        assert!(matches!(
            handle.error(),
            Error::Cancelled { reason } if reason == "time budget exhausted"
        ));
    }
}
