//! Run-wide bound on in-flight external calls, with cooperative cancellation.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use reportloom_shared::{ReportLoomError, Result};

/// Shared ceiling on concurrent summarization, classification and collection calls.
///
/// Waiters are served in FIFO order. Saturation queues, it never fails. Once
/// the token is cancelled, queued and in-flight calls return
/// [`ReportLoomError::Cancelled`].
#[derive(Debug, Clone)]
pub struct CallGate {
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl CallGate {
    pub fn new(max_concurrency: usize, cancel: CancellationToken) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run `call` while holding one permit.
    pub async fn run<F, T>(&self, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ReportLoomError::Cancelled),
            permit = self.permits.acquire() => permit.map_err(|_| ReportLoomError::Cancelled)?,
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ReportLoomError::Cancelled),
            result = call => result,
        }
    }

    /// Sleep for `delay` unless cancelled first.
    pub async fn sleep(&self, delay: std::time::Duration) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ReportLoomError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

/// Results of one component pass over many independent items.
#[derive(Debug)]
pub struct PassOutcome<T> {
    /// Items that finished, in completion order.
    pub completed: Vec<T>,
    /// At least one item stopped because the run was cancelled.
    pub cancelled: bool,
}

impl<T> Default for PassOutcome<T> {
    fn default() -> Self {
        Self {
            completed: Vec::new(),
            cancelled: false,
        }
    }
}

/// Join every task of a pass.
///
/// Cancelled tasks are counted, not fatal. Any other error aborts the
/// remaining tasks and is returned.
pub async fn drain<T: 'static>(mut tasks: JoinSet<Result<T>>) -> Result<PassOutcome<T>> {
    let mut outcome = PassOutcome::default();

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(value)) => outcome.completed.push(value),
            Ok(Err(ReportLoomError::Cancelled)) => outcome.cancelled = true,
            Ok(Err(e)) => {
                tasks.abort_all();
                return Err(e);
            }
            Err(e) if e.is_cancelled() => outcome.cancelled = true,
            Err(e) => {
                warn!(error = %e, "pass task failed");
                tasks.abort_all();
                return Err(ReportLoomError::Task(e.to_string()));
            }
        }
    }

    Ok(outcome)
}
