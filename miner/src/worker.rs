use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use shared::{
    interaction::{MiningResult, Task},
    types::{MinerId, PreliminaryHash},
};
use tracing::*;

use crate::{
    cancel::{CancelReason, CancelToken, CancellationState, Shutdown},
    channel::{ChannelError, TaskChannel, TaskDelivery},
    prover::{Outcome, Prover},
    resilience::{connect_with_retry, Backoff, Connector},
    restful::Coordinator,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Searching,
    Reporting,
    Abandoning,
}

/// How a delivered task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// `accepted` is false when the coordinator refused or never answered,
    /// or when the instance was settled before submission.
    Solved { nonce: u64, accepted: bool },
    NotFound,
    Cancelled(CancelReason),
    TimedOut,
    /// A resolved/dropped event for this instance arrived before the task.
    AlreadySettled,
    Unavailable,
    Malformed,
    /// Shutdown during the search; the delivery is left for redelivery.
    Interrupted,
}

/// Consumes the task queue one delivery at a time and drives the prover.
pub struct TaskWorker {
    miner_id: MinerId,
    prover: Arc<dyn Prover>,
    coordinator: Arc<dyn Coordinator>,
    state: Arc<CancellationState>,
    shutdown: Shutdown,
    max_task: Option<Duration>,
    status: WorkerState,
}

impl TaskWorker {
    pub fn new(
        miner_id: MinerId,
        prover: Arc<dyn Prover>,
        coordinator: Arc<dyn Coordinator>,
        state: Arc<CancellationState>,
        shutdown: Shutdown,
        max_task: Option<Duration>,
    ) -> Self {
        Self {
            miner_id,
            prover,
            coordinator,
            state,
            shutdown,
            max_task,
            status: WorkerState::Idle,
        }
    }

    pub fn status(&self) -> WorkerState {
        self.status
    }

    fn transition(&mut self, next: WorkerState) {
        trace!("{:?} -> {next:?}", self.status);
        self.status = next;
    }

    pub async fn run<C>(mut self, mut connector: C, mut backoff: Backoff)
    where
        C: Connector,
        C::Channel: TaskChannel, {
        'main: loop {
            let Some(mut channel) = connect_with_retry(&mut connector, &mut backoff, &self.shutdown).await
            else {
                break;
            };
            info!("waiting for tasks, prover: {}", self.prover.name());

            loop {
                let res = tokio::select! {
                    _ = self.shutdown.wait() => break 'main,
                    res = channel.next() => res,
                };
                let delivery = match res {
                    Ok(delivery) => delivery,
                    Err(err) => {
                        warn!("task channel lost: {err}");
                        break;
                    }
                };

                match self.process(delivery).await {
                    Ok(completion) => debug!("task done: {completion:?}, worker {:?}", self.status()),
                    Err(err) => {
                        // the broker requeues unacked deliveries once the channel is gone
                        error!("fail to ack task: {err}");
                        break;
                    }
                }
                if self.shutdown.is_triggered() {
                    break 'main;
                }
            }
        }

        connector.close().await;
        debug!("[worker] shutdown");
    }

    /// Handle one delivery and acknowledge it, unless the process is
    /// shutting down mid-task.
    pub async fn process(&mut self, delivery: Box<dyn TaskDelivery>) -> Result<Completion, ChannelError> {
        let completion = self.handle(delivery.body()).await;
        if completion == Completion::Interrupted {
            info!("shutdown during task, leaving it unacknowledged");
            return Ok(completion);
        }
        delivery.ack().await?;
        Ok(completion)
    }

    pub async fn handle(&mut self, body: &[u8]) -> Completion {
        let task = match Task::decode(body) {
            Ok(task) => task,
            Err(err) => {
                warn!("drop malformed task: {err}");
                return Completion::Malformed;
            }
        };

        let correlation = task.preliminary_hash();
        let span = info_span!("task", block = task.block.index(), correlation = %correlation);

        self.state.begin(correlation.clone());
        let completion = self.execute(task, &correlation).instrument(span).await;
        self.state.end();
        self.transition(WorkerState::Idle);
        completion
    }

    async fn execute(&mut self, task: Task, correlation: &PreliminaryHash) -> Completion {
        // checked after `begin` so an event racing this check still lands in the state
        if self.state.was_settled(correlation) {
            info!("instance already resolved or dropped, skip");
            self.transition(WorkerState::Abandoning);
            return Completion::AlreadySettled;
        }

        self.transition(WorkerState::Searching);
        let token = CancelToken::new(
            self.state.clone(),
            &self.shutdown,
            self.max_task.map(|max| Instant::now() + max),
        );
        let prover = self.prover.clone();
        let challenge = task.challenge.clone();
        let content_hash = task.block.content_hash();
        let range = task.range.clone();
        info!("search {range:?}, challenge: {challenge}");

        let timer = Instant::now();
        let search_token = token.clone();
        let span = Span::current();
        let outcome = tokio::task::spawn_blocking(move || {
            span.in_scope(|| prover.search(&challenge, &content_hash, range, &search_token))
        })
        .await
        .unwrap_or_else(|err| {
            error!("prover panicked: {err}");
            Outcome::NotFound
        });
        debug!("search finished in {:.2}s: {outcome:?}", timer.elapsed().as_secs_f64());

        match outcome {
            Outcome::Found { nonce, hash } => self.report(task, nonce, hash, correlation).await,
            Outcome::NotFound => {
                self.transition(WorkerState::Abandoning);
                info!("range exhausted without a solution");
                Completion::NotFound
            }
            Outcome::Unavailable => {
                self.transition(WorkerState::Abandoning);
                error!("prover unavailable, task abandoned");
                Completion::Unavailable
            }
            Outcome::Cancelled => {
                self.transition(WorkerState::Abandoning);
                self.cancelled(&token)
            }
        }
    }

    fn cancelled(&self, token: &CancelToken) -> Completion {
        if self.shutdown.is_triggered() {
            return Completion::Interrupted;
        }
        match self.state.poll() {
            (true, reason) => {
                info!("search cancelled: {reason:?}");
                Completion::Cancelled(reason)
            }
            (false, _) if token.expired() => {
                warn!("task timed out after {:?}", self.max_task.unwrap_or_default());
                Completion::TimedOut
            }
            (false, reason) => Completion::Cancelled(reason),
        }
    }

    async fn report(&mut self, task: Task, nonce: u64, hash: String, correlation: &PreliminaryHash) -> Completion {
        self.transition(WorkerState::Reporting);

        let (active, reason) = self.state.poll();
        if active {
            info!("solved with nonce {nonce} but instance already settled ({reason:?}), skip submission");
            return Completion::Solved {
                nonce,
                accepted: false,
            };
        }

        let mut block = task.block;
        block.solve(nonce, hash.clone());
        let result = MiningResult {
            block,
            block_id: correlation.clone(),
            miner_id: self.miner_id.clone(),
        };

        match self.coordinator.submit_result(&result).await {
            Ok(()) => {
                info!("result accepted, nonce: {nonce}, hash: {hash}");
                Completion::Solved {
                    nonce,
                    accepted: true,
                }
            }
            Err(err) => {
                error!("fail to submit result: {err}");
                Completion::Solved {
                    nonce,
                    accepted: false,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        ops::RangeInclusive,
        sync::{
            atomic::{AtomicU32, Ordering},
            Mutex,
        },
        thread,
    };

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use shared::{block::final_hash, interaction::LifecycleEvent};
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        cancel::CorrelationPolicy,
        channel::mock::{AckLog, MockConnector, MockDelivery},
        prover::CpuProver,
        restful::ApiError,
    };

    /// Scripted prover: from call number `block_from` on it waits for
    /// cancellation, earlier calls return `outcome` straight away.
    struct FakeProver {
        outcome: Outcome,
        block_from: Option<u32>,
        calls: AtomicU32,
    }

    impl FakeProver {
        fn returning(outcome: Outcome) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                block_from: None,
                calls: AtomicU32::new(0),
            })
        }

        fn blocking() -> Arc<Self> {
            Self::blocking_after(0)
        }

        fn blocking_after(calls: u32) -> Arc<Self> {
            Arc::new(Self {
                outcome: Outcome::NotFound,
                block_from: Some(calls),
                calls: AtomicU32::new(0),
            })
        }
    }

    impl Prover for FakeProver {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn search(&self, _: &str, _: &str, _: RangeInclusive<u64>, cancel: &CancelToken) -> Outcome {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.block_from.is_some_and(|from| call >= from) {
                let start = Instant::now();
                while start.elapsed() < Duration::from_secs(5) {
                    if cancel.is_cancelled() {
                        return Outcome::Cancelled;
                    }
                    thread::sleep(Duration::from_millis(10));
                }
            }
            self.outcome.clone()
        }
    }

    #[derive(Default)]
    struct FakeCoordinator {
        results: Mutex<Vec<Value>>,
        reject: bool,
    }

    #[async_trait]
    impl Coordinator for FakeCoordinator {
        async fn submit_result(&self, result: &MiningResult) -> Result<(), ApiError> {
            self.results.lock().unwrap().push(serde_json::to_value(result).unwrap());
            if self.reject {
                return Err(ApiError::Status {
                    status: reqwest::StatusCode::CONFLICT,
                    body: "late".into(),
                });
            }
            Ok(())
        }
    }

    struct Harness {
        worker: TaskWorker,
        state: Arc<CancellationState>,
        coordinator: Arc<FakeCoordinator>,
        shutdown: Shutdown,
    }

    fn harness(prover: Arc<dyn Prover>, coordinator: FakeCoordinator, max_task: Option<Duration>) -> Harness {
        let state = Arc::new(CancellationState::new(CorrelationPolicy::Correlated));
        let coordinator = Arc::new(coordinator);
        let shutdown = Shutdown::new();
        let worker = TaskWorker::new(
            MinerId("m1".into()),
            prover,
            coordinator.clone(),
            state.clone(),
            shutdown.clone(),
            max_task,
        );
        Harness {
            worker,
            state,
            coordinator,
            shutdown,
        }
    }

    fn task(hash: &str, challenge: &str, from: u64, to: u64) -> Vec<u8> {
        json!({
            "event": "NEW_CANDIDATE_BLOCK",
            "challenge": challenge,
            "block": {
                "index": 7,
                "timestamp": 1700000000,
                "hash": hash,
                "previous_hash": "prev",
                "data": [{"sender": "a", "receiver": "b", "amount": 3}]
            },
            "from": from,
            "to": to
        })
        .to_string()
        .into_bytes()
    }

    fn delivery(body: Vec<u8>, acks: &AckLog) -> Box<dyn TaskDelivery> {
        Box::new(MockDelivery {
            body,
            acks: acks.clone(),
        })
    }

    #[tokio::test]
    async fn solved_task_is_reported_and_acked() {
        let prover = FakeProver::returning(Outcome::Found {
            nonce: 42,
            hash: "00ff".into(),
        });
        let mut h = harness(prover, FakeCoordinator::default(), None);
        let acks = AckLog::default();

        let completion = h.worker.process(delivery(task("h1", "00", 0, 100), &acks)).await.unwrap();

        assert_eq!(
            completion,
            Completion::Solved {
                nonce: 42,
                accepted: true
            }
        );
        assert_eq!(acks.count(), 1);
        let results = h.coordinator.results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["blockId"], "h1");
        assert_eq!(results[0]["minerId"], "m1");
        assert_eq!(results[0]["nonce"], 42);
        assert_eq!(results[0]["hash"], "00ff");
        assert_eq!(results[0]["previous_hash"], "prev");
        assert_eq!(h.state.correlation_id(), None);
        assert_eq!(h.worker.status(), WorkerState::Idle);
    }

    #[tokio::test]
    async fn rejected_submission_is_not_repeated() {
        let prover = FakeProver::returning(Outcome::Found {
            nonce: 1,
            hash: "0a".into(),
        });
        let coordinator = FakeCoordinator {
            reject: true,
            ..Default::default()
        };
        let mut h = harness(prover, coordinator, None);
        let acks = AckLog::default();

        let completion = h.worker.process(delivery(task("h1", "0", 0, 10), &acks)).await.unwrap();
        assert_eq!(
            completion,
            Completion::Solved {
                nonce: 1,
                accepted: false
            }
        );
        assert_eq!(h.coordinator.results.lock().unwrap().len(), 1);
        assert_eq!(acks.count(), 1);
    }

    #[tokio::test]
    async fn malformed_task_is_acked_without_search() {
        let prover = FakeProver::returning(Outcome::NotFound);
        let mut h = harness(prover.clone(), FakeCoordinator::default(), None);
        let acks = AckLog::default();

        for body in [b"garbage".to_vec(), task("h1", "", 0, 1), task("h1", "0", 9, 1)] {
            let completion = h.worker.process(delivery(body, &acks)).await.unwrap();
            assert_eq!(completion, Completion::Malformed);
        }
        assert_eq!(acks.count(), 3);
        assert_eq!(prover.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn not_found_and_unavailable_are_acked_without_submission() {
        for (outcome, expected) in [
            (Outcome::NotFound, Completion::NotFound),
            (Outcome::Unavailable, Completion::Unavailable),
        ] {
            let mut h = harness(FakeProver::returning(outcome), FakeCoordinator::default(), None);
            let acks = AckLog::default();
            let completion = h.worker.process(delivery(task("h1", "0", 0, 10), &acks)).await.unwrap();
            assert_eq!(completion, expected);
            assert_eq!(acks.count(), 1);
            assert!(h.coordinator.results.lock().unwrap().is_empty());
        }
    }

    async fn wait_started(prover: &FakeProver) {
        wait_calls(prover, 1).await
    }

    async fn wait_calls(prover: &FakeProver, calls: u32) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while prover.calls.load(Ordering::SeqCst) < calls {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn peer_resolution_cancels_search() {
        let prover = FakeProver::blocking();
        let Harness {
            mut worker,
            state,
            coordinator,
            ..
        } = harness(prover.clone(), FakeCoordinator::default(), None);
        let acks = AckLog::default();

        let run = tokio::spawn({
            let acks = acks.clone();
            async move { worker.process(delivery(task("h1", "0", 0, 10), &acks)).await.unwrap() }
        });
        wait_started(&prover).await;
        assert!(state.signal(&LifecycleEvent::Resolved {
            miner_id: MinerId("other".into()),
            preliminary_hash: "h1".into(),
        }));

        let completion = tokio::time::timeout(Duration::from_secs(2), run).await.unwrap().unwrap();
        assert_eq!(completion, Completion::Cancelled(CancelReason::ResolvedByPeer));
        assert_eq!(acks.count(), 1);
        assert!(coordinator.results.lock().unwrap().is_empty());
        assert_eq!(state.poll(), (false, CancelReason::None));
    }

    #[tokio::test]
    async fn stale_event_does_not_cancel_next_task() {
        let prover = FakeProver::blocking_after(1);
        let Harness {
            mut worker,
            state,
            ..
        } = harness(prover.clone(), FakeCoordinator::default(), Some(Duration::from_millis(300)));
        let acks = AckLog::default();

        let first = worker.process(delivery(task("h1", "0", 0, 10), &acks)).await.unwrap();
        assert_eq!(first, Completion::NotFound);
        assert_eq!(worker.status(), WorkerState::Idle);

        let run = tokio::spawn({
            let acks = acks.clone();
            async move {
                let completion = worker.process(delivery(task("h2", "0", 0, 10), &acks)).await.unwrap();
                (completion, worker.status())
            }
        });
        wait_calls(&prover, 2).await;
        assert_eq!(state.correlation_id(), Some("h2".into()));

        // late resolution of the finished h1
        assert!(!state.signal(&LifecycleEvent::Resolved {
            miner_id: MinerId("other".into()),
            preliminary_hash: "h1".into(),
        }));
        assert_eq!(state.poll(), (false, CancelReason::None));

        // only the deadline ends this search
        let (completion, status) = tokio::time::timeout(Duration::from_secs(3), run).await.unwrap().unwrap();
        assert_eq!(completion, Completion::TimedOut);
        assert_eq!(status, WorkerState::Idle);
        assert_eq!(acks.count(), 2);
    }

    #[tokio::test]
    async fn settled_instance_is_skipped() {
        let prover = FakeProver::returning(Outcome::NotFound);
        let mut h = harness(prover.clone(), FakeCoordinator::default(), None);
        h.state.signal(&LifecycleEvent::Dropped {
            preliminary_hash: "h1".into(),
        });
        let acks = AckLog::default();

        let completion = h.worker.process(delivery(task("h1", "0", 0, 10), &acks)).await.unwrap();
        assert_eq!(completion, Completion::AlreadySettled);
        assert_eq!(acks.count(), 1);
        assert_eq!(prover.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn shutdown_leaves_delivery_unacked() {
        let prover = FakeProver::blocking();
        let Harness {
            mut worker,
            shutdown,
            ..
        } = harness(prover.clone(), FakeCoordinator::default(), None);
        let acks = AckLog::default();

        let run = tokio::spawn({
            let acks = acks.clone();
            async move { worker.process(delivery(task("h1", "0", 0, 10), &acks)).await.unwrap() }
        });
        wait_started(&prover).await;
        shutdown.trigger();

        let completion = tokio::time::timeout(Duration::from_secs(2), run).await.unwrap().unwrap();
        assert_eq!(completion, Completion::Interrupted);
        assert_eq!(acks.count(), 0);
    }

    #[tokio::test]
    async fn cpu_prover_solution_verifies() {
        let mut h = harness(Arc::new(CpuProver::new(2)), FakeCoordinator::default(), None);
        let acks = AckLog::default();
        let body = task("h1", "00", 0, 1_000_000);

        let completion = h.worker.process(delivery(body.clone(), &acks)).await.unwrap();
        let Completion::Solved { nonce, accepted: true } = completion else {
            panic!("unexpected completion: {completion:?}");
        };

        let content_hash = Task::decode(&body).unwrap().block.content_hash();
        let expected = (0..).find(|n| final_hash(*n, &content_hash).starts_with("00")).unwrap();
        assert_eq!(nonce, expected);

        let results = h.coordinator.results.lock().unwrap();
        assert_eq!(results[0]["hash"], final_hash(nonce, &content_hash));
    }

    #[tokio::test]
    async fn run_loop_consumes_across_reconnects() {
        let (first_tx, first_rx) = mpsc::unbounded_channel();
        let (second_tx, second_rx) = mpsc::unbounded_channel();
        let connector = MockConnector::new(vec![first_rx, second_rx]);
        let acks = connector.acks.clone();

        let prover = FakeProver::returning(Outcome::NotFound);
        let h = harness(prover.clone(), FakeCoordinator::default(), None);
        let shutdown = h.shutdown.clone();
        let backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(1));
        let handle = tokio::spawn(h.worker.run(connector, backoff));

        first_tx.send(task("h1", "0", 0, 10)).unwrap();
        first_tx.send(b"junk".to_vec()).unwrap();
        drop(first_tx);
        second_tx.send(task("h2", "0", 0, 10)).unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while acks.count() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(prover.calls.load(Ordering::SeqCst), 2);

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
