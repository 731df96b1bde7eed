//! Lifecycle supervisor: teardown registries and shutdown orchestration.
//!
//! Handlers register during operation setup (starting agents registers an
//! aborter, completing the operation registers a stopper) and run LIFO at
//! teardown. The stop path is cooperative and bounded by the shutdown
//! timeout; the abort path is forced. Both are idempotent and aggregate
//! handler errors without short-circuiting.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use capstan_core::error::aggregate;
use capstan_core::{CoreError, Result};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Boxed future returned by teardown handlers.
pub type TeardownFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

type TeardownFn = Box<dyn Fn() -> TeardownFuture + Send + Sync>;

struct Handler {
    name: String,
    run: TeardownFn,
}

/// Owns the stopper/aborter registries and the operation-wide
/// cancellation token.
pub struct Supervisor {
    cancel: CancellationToken,
    stoppers: Mutex<Vec<Handler>>,
    aborters: Mutex<Vec<Handler>>,
    stopped: AtomicBool,
    aborted: AtomicBool,
    shutdown_timeout: Duration,
}

impl Supervisor {
    /// Create a supervisor with the given shutdown budget.
    pub fn new(shutdown_timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            stoppers: Mutex::new(Vec::new()),
            aborters: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            shutdown_timeout,
        }
    }

    /// The operation-wide cancellation token. Cancelled first on either
    /// teardown path.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Register a cooperative-shutdown handler.
    pub fn add_stopper<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.stoppers.lock().push(Handler {
            name: name.into(),
            run: Box::new(move || Box::pin(f())),
        });
    }

    /// Register a forced-teardown handler.
    pub fn add_aborter<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.aborters.lock().push(Handler {
            name: name.into(),
            run: Box::new(move || Box::pin(f())),
        });
    }

    /// Run the stop path: cancel the internal context, then run stoppers
    /// LIFO within the shutdown budget. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();
        let handlers = std::mem::take(&mut *self.stoppers.lock());
        match tokio::time::timeout(self.shutdown_timeout, run_lifo(handlers, "stopper")).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::fatal(format!(
                "stoppers did not finish within {:?}",
                self.shutdown_timeout
            ))),
        }
    }

    /// Run the abort path: cancel the internal context, then run aborters
    /// LIFO. Aborters run regardless of individual failures. Idempotent;
    /// may run in addition to an in-flight stop.
    pub async fn abort(&self) -> Result<()> {
        if self.aborted.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();
        let handlers = std::mem::take(&mut *self.aborters.lock());
        run_lifo(handlers, "aborter").await
    }

    /// True once either teardown path has started.
    pub fn is_shutting_down(&self) -> bool {
        self.stopped.load(Ordering::SeqCst) || self.aborted.load(Ordering::SeqCst)
    }
}

async fn run_lifo(mut handlers: Vec<Handler>, kind: &str) -> Result<()> {
    let mut errors = Vec::new();
    while let Some(handler) = handlers.pop() {
        tracing::debug!(name = %handler.name, kind, "running teardown handler");
        if let Err(err) = (handler.run)().await {
            tracing::warn!(name = %handler.name, kind, error = %err, "teardown handler failed");
            errors.push(err);
        }
    }
    aggregate(errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn stoppers_run_lifo() {
        let supervisor = Supervisor::new(Duration::from_secs(5));
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let order = order.clone();
            supervisor.add_stopper(name, move || {
                let order = order.clone();
                async move {
                    order.lock().push(name);
                    Ok(())
                }
            });
        }
        supervisor.stop().await.unwrap();
        assert_eq!(*order.lock(), vec!["third", "second", "first"]);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let supervisor = Supervisor::new(Duration::from_secs(5));
        let count = Arc::new(Mutex::new(0));
        let counted = count.clone();
        supervisor.add_stopper("counter", move || {
            let counted = counted.clone();
            async move {
                *counted.lock() += 1;
                Ok(())
            }
        });
        supervisor.stop().await.unwrap();
        supervisor.stop().await.unwrap();
        assert_eq!(*count.lock(), 1);
    }

    #[tokio::test]
    async fn aborter_errors_aggregate_without_short_circuit() {
        let supervisor = Supervisor::new(Duration::from_secs(5));
        let ran = Arc::new(Mutex::new(Vec::new()));
        let first = ran.clone();
        supervisor.add_aborter("survives", move || {
            let first = first.clone();
            async move {
                first.lock().push("survives");
                Ok(())
            }
        });
        supervisor.add_aborter("fails", || async {
            Err(CoreError::transport("agent unreachable"))
        });
        let err = supervisor.abort().await.unwrap_err();
        assert!(err.to_string().contains("agent unreachable"));
        // The failing handler ran last-registered-first and did not stop
        // the earlier registration from running.
        assert_eq!(*ran.lock(), vec!["survives"]);
    }

    #[tokio::test]
    async fn abort_after_stop_still_runs_aborters() {
        let supervisor = Supervisor::new(Duration::from_secs(5));
        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        supervisor.add_aborter("flag", move || {
            let flag = flag.clone();
            async move {
                *flag.lock() = true;
                Ok(())
            }
        });
        supervisor.stop().await.unwrap();
        supervisor.abort().await.unwrap();
        assert!(*ran.lock());
        assert!(supervisor.is_shutting_down());
    }
}
