use std::{sync::Arc, time::Duration};

use tokio::time::{self, MissedTickBehavior};
use tracing::*;

use crate::{cancel::Shutdown, restful::CoordinatorApi};

/// Keeps this miner on the coordinator's roster: register once, then a
/// keep-alive every `interval`. A failed keep-alive makes the next tick
/// register again before pinging.
pub struct Presence {
    api: Arc<CoordinatorApi>,
    public_key: String,
    gpu_miner: bool,
    interval: Duration,
}

impl Presence {
    pub fn new(api: Arc<CoordinatorApi>, public_key: String, gpu_miner: bool, interval: Duration) -> Self {
        Self {
            api,
            public_key,
            gpu_miner,
            interval,
        }
    }

    async fn register(&self) -> bool {
        match self.api.register(&self.public_key, self.gpu_miner).await {
            Ok(()) => {
                info!("registered with coordinator, gpu: {}", self.gpu_miner);
                true
            }
            Err(err) => {
                error!("fail to register: {err}");
                false
            }
        }
    }

    pub async fn run(self, shutdown: Shutdown) {
        let mut registered = self.register().await;

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {}
            }

            if !registered {
                registered = self.register().await;
            }
            match self.api.keep_alive(&self.public_key).await {
                Ok(()) => trace!("keep-alive sent"),
                Err(err) => {
                    warn!("keep-alive failed: {err}");
                    registered = false;
                }
            }
        }
        debug!("[keep-alive] shutdown");
    }
}
