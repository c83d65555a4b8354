//! Structured cancellation for flow tasks.
//!
//! Every flow owns one [`TaskScope`]. Work spawned into the scope receives a
//! [`CancelToken`]; network calls are raced against it with
//! [`CancelToken::run`], and state is only published while the token is live.

use crate::error::{AcquiringError, Result};
use parking_lot::Mutex;
use std::future::Future;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinSet};
use tracing::debug;

/// Owning side of a cancellation signal.
#[derive(Debug)]
pub struct CancelSource {
    tx: watch::Sender<bool>,
    parent: Option<CancelToken>,
}

impl CancelSource {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx, parent: None }
    }

    /// A source that is also cancelled whenever `parent` is.
    pub fn child_of(parent: &CancelToken) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx,
            parent: Some(parent.clone()),
        }
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
            parent: self.parent.clone().map(Box::new),
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Observing side of a cancellation signal, handed to every task of a scope.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
    parent: Option<Box<CancelToken>>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    /// Resolves once this token or any ancestor is cancelled.
    ///
    /// A dropped source counts as cancelled: its scope is gone.
    pub async fn cancelled(&self) {
        let waits = std::iter::successors(Some(self), |token| token.parent.as_deref())
            .map(|token| {
                let mut rx = token.rx.clone();
                Box::pin(async move {
                    let _ = rx.wait_for(|cancelled| *cancelled).await;
                })
            })
            .collect::<Vec<_>>();
        futures::future::select_all(waits).await;
    }

    /// Awaits `fut` unless the token is cancelled first.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.is_cancelled() {
            return Err(AcquiringError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(AcquiringError::Cancelled),
            result = fut => result,
        }
    }
}

struct ScopeInner {
    source: CancelSource,
    tasks: JoinSet<()>,
    replaceable: Option<(CancelSource, AbortHandle)>,
}

/// The set of tasks a flow owns.
///
/// `cancel` stops everything spawned so far and re-arms the scope, so a flow
/// that was stopped can still be resumed by an explicit caller action.
pub struct TaskScope {
    name: &'static str,
    inner: Mutex<ScopeInner>,
}

impl TaskScope {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(ScopeInner {
                source: CancelSource::new(),
                tasks: JoinSet::new(),
                replaceable: None,
            }),
        }
    }

    /// Spawns a task bound to the scope's current cancellation token.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F, Fut>(&self, task: F)
    where
        F: FnOnce(CancelToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut inner = self.inner.lock();
        while inner.tasks.try_join_next().is_some() {}
        let token = inner.source.token();
        inner.tasks.spawn(task(token));
    }

    /// Spawns a task that replaces the previous replaceable one.
    ///
    /// The previous task is cancelled and aborted before the new one is
    /// spawned, so at most one of them is ever live.
    pub fn spawn_replacing<F, Fut>(&self, task: F)
    where
        F: FnOnce(CancelToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut inner = self.inner.lock();
        while inner.tasks.try_join_next().is_some() {}
        if let Some((source, handle)) = inner.replaceable.take() {
            debug!(scope = self.name, "Replacing running task");
            source.cancel();
            handle.abort();
        }
        let source = CancelSource::child_of(&inner.source.token());
        let handle = inner.tasks.spawn(task(source.token()));
        inner.replaceable = Some((source, handle));
    }

    /// Whether a replaceable task is still running.
    pub fn has_replaceable(&self) -> bool {
        let inner = self.inner.lock();
        inner
            .replaceable
            .as_ref()
            .is_some_and(|(source, handle)| !handle.is_finished() && !source.token().is_cancelled())
    }

    /// Number of spawned tasks that have not finished yet.
    pub fn active_tasks(&self) -> usize {
        let mut inner = self.inner.lock();
        while inner.tasks.try_join_next().is_some() {}
        inner.tasks.len()
    }

    /// Cancels and aborts every task, then re-arms with a fresh token.
    pub fn cancel(&self) {
        let mut inner = self.inner.lock();
        inner.source.cancel();
        inner.tasks.abort_all();
        inner.replaceable = None;
        inner.source = CancelSource::new();
        debug!(scope = self.name, "Scope cancelled");
    }
}

impl Drop for TaskScope {
    fn drop(&mut self) {
        self.inner.get_mut().source.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_returns_cancelled_when_token_fires() {
        let source = CancelSource::new();
        let token = source.token();
        let handle = tokio::spawn(async move {
            token
                .run(async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(1)
                })
                .await
        });
        tokio::task::yield_now().await;
        source.cancel();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(AcquiringError::Cancelled)));
    }

    #[tokio::test]
    async fn test_child_follows_parent() {
        let parent = CancelSource::new();
        let child = CancelSource::child_of(&parent.token());
        let token = child.token();
        assert!(!token.is_cancelled());
        parent.cancel();
        assert!(token.is_cancelled());
        token.cancelled().await;
    }

    #[tokio::test]
    async fn test_cancelling_child_leaves_parent_alive() {
        let parent = CancelSource::new();
        let child = CancelSource::child_of(&parent.token());
        child.cancel();
        assert!(child.token().is_cancelled());
        assert!(!parent.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_spawn_replacing_keeps_one_task() {
        let scope = TaskScope::new("test");
        let started = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let started = started.clone();
            scope.spawn_replacing(|token| async move {
                started.fetch_add(1, Ordering::SeqCst);
                token.cancelled().await;
            });
        }
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        assert!(scope.has_replaceable());
        assert_eq!(scope.active_tasks(), 1);
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_rearms_scope() {
        let scope = TaskScope::new("test");
        scope.spawn(|token| async move { token.cancelled().await });
        scope.cancel();
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(scope.active_tasks(), 0);

        let (tx, rx) = tokio::sync::oneshot::channel();
        scope.spawn(|token| async move {
            let _ = tx.send(token.is_cancelled());
        });
        assert!(!rx.await.unwrap());
    }
}
