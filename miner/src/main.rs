use std::sync::Arc;

use cfg_if::cfg_if;
use tokio::signal;
use tracing::*;

use crate::{
    cancel::{CancellationState, Shutdown},
    channel::{AmqpBroadcastConnector, AmqpTaskConnector},
    config::Config,
    keepalive::Presence,
    listener::BroadcastListener,
    prover::detect_gpu,
    resilience::Backoff,
    restful::CoordinatorApi,
    worker::TaskWorker,
};

mod cancel;
mod channel;
mod config;
mod keepalive;
mod listener;
mod prover;
mod resilience;
mod restful;
mod worker;

cfg_if! {
    if #[cfg(feature = "build-version")] {
        include!(concat!(env!("OUT_DIR"), "/version.rs"));
    } else {
        pub const VERSION: &str = "unknown";
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    shared::log::init_log();

    let config = Arc::new(Config::load()?);
    let amqp_uri = config.amqp_uri()?;

    info!(
        "VERSION: {VERSION}, miner: {}, broker: {}:{}, pool: {}",
        config.miner_id, config.rabbitmq_host, config.rabbitmq_port, config.pool_url
    );

    let gpu_detected = detect_gpu();
    let prover = prover::select(config.prover, gpu_detected, &config.cuda_bin, config.cores);

    let api = Arc::new(CoordinatorApi::new(&config.pool_url, &config.result_path, config.submit_retries)?);
    let state = Arc::new(CancellationState::new(config.policy));
    let shutdown = Shutdown::new();
    let span = info_span!("miner", id = %config.miner_id);

    let presence = Presence::new(api.clone(), config.public_key.clone(), gpu_detected, config.keep_alive);
    let presence = tokio::spawn(presence.run(shutdown.clone()).instrument(span.clone()));

    let listener = BroadcastListener::new(config.miner_id.clone(), state.clone());
    let listener = tokio::spawn(
        listener
            .run(
                AmqpBroadcastConnector::new(amqp_uri.clone(), config.broadcast_exchange.clone()),
                Backoff::new(config.reconnect, config.reconnect_max),
                shutdown.clone(),
            )
            .instrument(span.clone()),
    );

    let worker = TaskWorker::new(
        config.miner_id.clone(),
        prover,
        api,
        state,
        shutdown.clone(),
        config.max_task,
    );
    let worker = tokio::spawn(
        worker
            .run(
                AmqpTaskConnector::new(amqp_uri, config.task_queue.clone()),
                Backoff::new(config.reconnect, config.reconnect_max),
            )
            .instrument(span),
    );

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            signal::ctrl_c().await.expect("failed to listen for Ctrl+C");
            info!("ctrl+c received. start shutdown and wait for the current task to stop");
            shutdown.trigger();
        }
    });

    for (name, handle) in [("worker", worker), ("listener", listener), ("keep-alive", presence)] {
        if let Err(err) = handle.await {
            error!("{name} task failed: {err}");
        }
    }

    info!("miner stopped");
    Ok(())
}
