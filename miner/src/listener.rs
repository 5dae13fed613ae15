use std::sync::Arc;

use shared::{
    interaction::{BroadcastMessage, LifecycleEvent},
    types::MinerId,
};
use tracing::*;

use crate::{
    cancel::{CancellationState, Shutdown},
    channel::BroadcastChannel,
    resilience::{connect_with_retry, Backoff, Connector},
};

/// Feeds lifecycle events from the fanout into the cancellation state.
/// It never touches the task queue; while it is down tasks still run, just
/// without early cancellation.
pub struct BroadcastListener {
    miner_id: MinerId,
    state: Arc<CancellationState>,
}

impl BroadcastListener {
    pub fn new(miner_id: MinerId, state: Arc<CancellationState>) -> Self {
        Self { miner_id, state }
    }

    pub async fn run<C>(self, mut connector: C, mut backoff: Backoff, shutdown: Shutdown)
    where
        C: Connector,
        C::Channel: BroadcastChannel, {
        'main: loop {
            let Some(mut channel) = connect_with_retry(&mut connector, &mut backoff, &shutdown).await else {
                break;
            };

            loop {
                let res = tokio::select! {
                    _ = shutdown.wait() => break 'main,
                    res = channel.next() => res,
                };
                match res {
                    Ok(body) => self.on_message(&body),
                    Err(err) => {
                        warn!("broadcast subscription lost: {err}");
                        break;
                    }
                }
            }
        }

        connector.close().await;
        debug!("[listener] shutdown");
    }

    /// Decode one broadcast body and apply it. Undecodable bodies are logged
    /// and skipped.
    pub fn on_message(&self, body: &[u8]) {
        let event = match BroadcastMessage::decode(body) {
            Ok(BroadcastMessage::Lifecycle(event)) => event,
            Ok(BroadcastMessage::NewCandidate) => {
                trace!("skip new candidate announcement");
                return;
            }
            Err(err) => {
                warn!("ignore broadcast message: {err}, body: {}", String::from_utf8_lossy(body));
                return;
            }
        };

        if let LifecycleEvent::Resolved { miner_id, .. } = &event {
            if *miner_id == self.miner_id {
                debug!("own resolution echoed for {}", event.preliminary_hash());
            }
        }

        if self.state.signal(&event) {
            info!("cancel current task: {event:?}");
        } else {
            debug!("event not applied, current task: {:?}, event: {event:?}", self.state.correlation_id());
        }
    }
}
