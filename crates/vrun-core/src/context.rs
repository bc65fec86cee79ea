//! Cancellation and deadline propagation for a run

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::RunnerError;

/// Caller-supplied cancellation signal and optional deadline for one run.
///
/// Cloning shares the same token; [`RunContext::child`] derives a context that
/// can be cancelled on its own without affecting the parent.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, or `None` if there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Clamp `budget` to the remaining run time.
    pub fn clamp(&self, budget: Duration) -> Duration {
        match self.remaining() {
            Some(remaining) => budget.min(remaining),
            None => budget,
        }
    }

    /// The deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.deadline
            .map_or(false, |deadline| Instant::now() >= deadline)
    }

    /// Await `operation`, giving up early on cancellation or deadline expiry.
    pub async fn guard<T, F>(&self, stage: &str, operation: F) -> Result<T, RunnerError>
    where
        F: Future<Output = Result<T, RunnerError>>,
    {
        if self.cancel.is_cancelled() {
            return Err(RunnerError::Cancelled(stage.to_string()));
        }
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RunnerError::Cancelled(stage.to_string())),
            _ = deadline => Err(RunnerError::Timeout(stage.to_string())),
            result = operation => result,
        }
    }

    /// Await `operation`, giving up early on cancellation only.
    ///
    /// For stages that bound themselves by [`RunContext::clamp`] and must still
    /// report what happened once the deadline has passed.
    pub async fn cancellable<T, F>(&self, stage: &str, operation: F) -> Result<T, RunnerError>
    where
        F: Future<Output = Result<T, RunnerError>>,
    {
        if self.cancel.is_cancelled() {
            return Err(RunnerError::Cancelled(stage.to_string()));
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RunnerError::Cancelled(stage.to_string())),
            result = operation => result,
        }
    }
}
