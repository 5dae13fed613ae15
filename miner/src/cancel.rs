use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
    },
    time::Instant,
};

use serde::Deserialize;
use shared::{interaction::LifecycleEvent, types::PreliminaryHash};
use tokio::sync::broadcast;

/// How many settled preliminary hashes are remembered.
const SETTLED_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelReason {
    #[default]
    None,
    ResolvedByPeer,
    Dropped,
}

impl From<&LifecycleEvent> for CancelReason {
    fn from(event: &LifecycleEvent) -> Self {
        match event {
            LifecycleEvent::Resolved { .. } => CancelReason::ResolvedByPeer,
            LifecycleEvent::Dropped { .. } => CancelReason::Dropped,
        }
    }
}

/// Which broadcast events may cancel the running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CorrelationPolicy {
    /// Only events whose preliminary hash matches the running task.
    #[default]
    Correlated,
    /// Any resolved/dropped event while a task is running.
    Any,
}

#[derive(Debug, Default)]
struct Inner {
    active: bool,
    reason: CancelReason,
    correlation_id: Option<PreliminaryHash>,
    settled: VecDeque<PreliminaryHash>,
}

impl Inner {
    fn remember(&mut self, hash: &PreliminaryHash) {
        if self.settled.contains(hash) {
            return;
        }
        if self.settled.len() == SETTLED_CAPACITY {
            self.settled.pop_front();
        }
        self.settled.push_back(hash.clone());
    }
}

/// Cancellation signal shared by the broadcast listener (writer) and the
/// task worker (owner of the task scope). All transitions go through one
/// mutex, so `begin`, `signal`, `poll` and `end` are linearizable.
#[derive(Debug)]
pub struct CancellationState {
    policy: CorrelationPolicy,
    inner: Mutex<Inner>,
}

impl CancellationState {
    pub fn new(policy: CorrelationPolicy) -> Self {
        Self {
            policy,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the scope of a new task. Clears any signal left from before.
    pub fn begin(&self, correlation_id: PreliminaryHash) {
        let mut guard = self.lock();
        guard.correlation_id = Some(correlation_id);
        guard.active = false;
        guard.reason = CancelReason::None;
    }

    /// Apply a lifecycle event. Returns `true` only when this call cancelled
    /// the running task; repeats and unrelated events return `false`.
    pub fn signal(&self, event: &LifecycleEvent) -> bool {
        let mut guard = self.lock();
        guard.remember(event.preliminary_hash());

        if guard.active {
            return false;
        }
        let applies = match (&guard.correlation_id, self.policy) {
            (None, _) => false,
            (Some(current), CorrelationPolicy::Correlated) => current == event.preliminary_hash(),
            (Some(_), CorrelationPolicy::Any) => true,
        };
        if applies {
            guard.active = true;
            guard.reason = CancelReason::from(event);
        }
        applies
    }

    pub fn poll(&self) -> (bool, CancelReason) {
        let guard = self.lock();
        (guard.active, guard.reason)
    }

    /// Close the task scope; later events for it are ignored.
    pub fn end(&self) {
        let mut guard = self.lock();
        guard.correlation_id = None;
        guard.active = false;
        guard.reason = CancelReason::None;
    }

    pub fn correlation_id(&self) -> Option<PreliminaryHash> {
        self.lock().correlation_id.clone()
    }

    /// Whether a resolved/dropped event was seen for this instance recently.
    pub fn was_settled(&self, hash: &PreliminaryHash) -> bool {
        self.lock().settled.contains(hash)
    }
}

/// Process-wide stop request. The flag serves blocking prover threads, the
/// broadcast serves async loops.
#[derive(Clone)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    notify: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(1);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify,
        }
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let _ = self.notify.send(());
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once shutdown is requested, including a request made before
    /// this call.
    pub async fn wait(&self) {
        let mut rx = self.notify.subscribe();
        if self.is_triggered() {
            return;
        }
        let _ = rx.recv().await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Handed to a prover for one search. Fires on a correlated cancellation,
/// on process shutdown, or when the task deadline passes.
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<CancellationState>,
    shutdown: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new(state: Arc<CancellationState>, shutdown: &Shutdown, deadline: Option<Instant>) -> Self {
        Self {
            state,
            shutdown: shutdown.flag.clone(),
            deadline,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst) || self.expired() || self.state.poll().0
    }

    pub fn expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// A token that only fires when its own state is signalled.
    #[cfg(test)]
    pub fn detached() -> Self {
        Self::new(
            Arc::new(CancellationState::new(CorrelationPolicy::Correlated)),
            &Shutdown::new(),
            None,
        )
    }
}
