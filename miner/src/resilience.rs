use std::time::Duration;

use async_trait::async_trait;
use lapin::{Channel, Connection, ConnectionProperties};
use tracing::*;

use crate::{cancel::Shutdown, channel::ChannelError};

/// Capped exponential delay between reconnect attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Produces a fresh channel handle for one of the loops.
#[async_trait]
pub trait Connector: Send {
    type Channel: Send;

    fn name(&self) -> &'static str;

    async fn connect(&mut self) -> Result<Self::Channel, ChannelError>;

    async fn close(&mut self) {}
}

/// Retry `connector` until it yields a channel. Returns `None` once
/// shutdown is requested.
pub async fn connect_with_retry<C: Connector>(
    connector: &mut C,
    backoff: &mut Backoff,
    shutdown: &Shutdown,
) -> Option<C::Channel> {
    let mut attempts = 0u32;
    loop {
        if shutdown.is_triggered() {
            return None;
        }
        attempts += 1;

        let res = tokio::select! {
            _ = shutdown.wait() => return None,
            res = connector.connect() => res,
        };
        match res {
            Ok(channel) => {
                if attempts > 1 {
                    info!("{} reconnected after {attempts} attempts", connector.name());
                }
                backoff.reset();
                return Some(channel);
            }
            Err(err) => {
                let delay = backoff.next_delay();
                error!("fail to connect {}: {err}, retry in {delay:?} ({attempts})", connector.name());
                tokio::select! {
                    _ = shutdown.wait() => {
                        debug!("[{}] shutdown while reconnecting", connector.name());
                        return None;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// One broker connection owned by one loop. Channel-level failures reopen a
/// channel on the same connection; a dead connection is replaced.
pub struct AmqpSession {
    uri: String,
    connection: Option<Connection>,
}

impl AmqpSession {
    pub fn new(uri: String) -> Self {
        Self {
            uri,
            connection: None,
        }
    }

    pub async fn open_channel(&mut self) -> Result<Channel, ChannelError> {
        if let Some(connection) = &self.connection {
            if connection.status().connected() {
                match connection.create_channel().await {
                    Ok(channel) => return Ok(channel),
                    Err(err) => warn!("fail to open channel on existing connection: {err}"),
                }
            }
            debug!("dropping stale broker connection");
            self.connection = None;
        }

        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(ChannelError::Connection)?;
        info!("broker connection established");
        let channel = connection.create_channel().await.map_err(ChannelError::Connection)?;
        self.connection = Some(connection);
        Ok(channel)
    }

    pub async fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            if connection.status().connected() {
                if let Err(err) = connection.close(200, "shutdown").await {
                    warn!("fail to close broker connection: {err}");
                }
            }
        }
    }
}
