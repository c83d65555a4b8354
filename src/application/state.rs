use super::scope::CancelToken;
use crate::domain::payment::PaymentId;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tracing::debug;

/// Common surface of every flow's state enum.
pub trait FlowState: Clone + Debug + Send + Sync + 'static {
    /// Payment id, once the server assigned one.
    fn payment_id(&self) -> Option<PaymentId>;

    /// A final state seals the cell: nothing is published after it.
    fn is_final(&self) -> bool;

    /// Short name used in logs and state traces.
    fn name(&self) -> &'static str;
}

/// Single-slot latest-state container.
///
/// Readers always see the newest value and can subscribe to later
/// transitions. Intermediate values are not queued for slow readers.
///
/// A state can be claimed by one pending task: the claim holds until that
/// task publishes, so a second caller sees the slot as taken even though no
/// new state is visible yet.
pub struct StateCell<S: FlowState> {
    flow: &'static str,
    tx: watch::Sender<S>,
    claimed: AtomicBool,
}

impl<S: FlowState> StateCell<S> {
    pub fn new(flow: &'static str, initial: S) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            flow,
            tx,
            claimed: AtomicBool::new(false),
        }
    }

    pub fn current(&self) -> S {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<S> {
        self.tx.subscribe()
    }

    /// Publishes `next` unless the current state is final.
    pub fn publish(&self, next: S) -> bool {
        self.apply(None, |_| Some(next))
    }

    /// Publishes `next` on behalf of a task, unless its token was cancelled.
    ///
    /// The token is checked while holding the cell, so a `stop` that cancels
    /// the token before publishing can never be overtaken by this call.
    /// A successful publish releases any pending claim.
    pub fn publish_from(&self, token: &CancelToken, next: S) -> bool {
        self.apply(Some(token), |_| Some(next))
    }

    /// Applies `f` to the current state atomically; `None` keeps it unchanged.
    pub fn transition<F>(&self, f: F) -> bool
    where
        F: FnOnce(&S) -> Option<S>,
    {
        self.apply(None, f)
    }

    /// Task-side [`transition`](Self::transition), guarded by `token`.
    pub fn transition_from<F>(&self, token: &CancelToken, f: F) -> bool
    where
        F: FnOnce(&S) -> Option<S>,
    {
        self.apply(Some(token), f)
    }

    /// Reserves the current state for one task about to be spawned.
    ///
    /// Fails when `accepts` rejects the state, when the state is final, or
    /// while an earlier claim is still pending. Nothing is published.
    pub fn claim<F>(&self, accepts: F) -> bool
    where
        F: FnOnce(&S) -> bool,
    {
        let mut claimed = false;
        self.tx.send_if_modified(|current| {
            claimed = !current.is_final()
                && accepts(current)
                && !self.claimed.swap(true, Ordering::AcqRel);
            false
        });
        if claimed {
            debug!(flow = self.flow, "State claimed");
        }
        claimed
    }

    /// Whether a claimed task has not published yet.
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    fn apply<F>(&self, token: Option<&CancelToken>, f: F) -> bool
    where
        F: FnOnce(&S) -> Option<S>,
    {
        let flow = self.flow;
        self.tx.send_if_modified(|current| {
            if current.is_final() || token.is_some_and(|token| token.is_cancelled()) {
                return false;
            }
            match f(current) {
                Some(next) => {
                    debug!(
                        flow,
                        from = current.name(),
                        to = next.name(),
                        payment_id = ?next.payment_id(),
                        "State transition"
                    );
                    *current = next;
                    if token.is_some() {
                        self.claimed.store(false, Ordering::Release);
                    }
                    true
                }
                None => false,
            }
        })
    }
}
