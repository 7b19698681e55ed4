//! Per-call deadline carried through every limiter operation.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{AdmissionError, Result};

/// Optional deadline for a single Reserve/Complete call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallContext {
    deadline: Option<Instant>,
}

impl CallContext {
    /// A context with no deadline.
    pub fn background() -> Self {
        Self { deadline: None }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// The tighter of two contexts.
    pub fn earliest(self, other: CallContext) -> CallContext {
        match (self.deadline, other.deadline) {
            (Some(a), Some(b)) => CallContext::with_deadline(a.min(b)),
            (Some(a), None) => CallContext::with_deadline(a),
            (None, b) => CallContext { deadline: b },
        }
    }

    /// Await `fut`, failing with `DeadlineExceeded` once the deadline passes.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, fut)
                .await
                .map_err(|_| AdmissionError::DeadlineExceeded)?,
            None => fut.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_earliest_prefers_tighter_deadline() {
        let now = Instant::now();
        let near = CallContext::with_deadline(now + Duration::from_millis(10));
        let far = CallContext::with_deadline(now + Duration::from_secs(10));

        assert_eq!(far.earliest(near).deadline(), near.deadline());
        assert_eq!(CallContext::background().earliest(far).deadline(), far.deadline());
        assert_eq!(CallContext::background().earliest(CallContext::background()).deadline(), None);
    }

    #[tokio::test]
    async fn test_run_times_out() {
        let ctx = CallContext::with_timeout(Duration::from_millis(10));
        let result: Result<()> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(AdmissionError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn test_run_without_deadline() {
        let value = CallContext::background().run(async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }
}
