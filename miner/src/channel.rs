use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions,
        BasicConsumeOptions,
        BasicQosOptions,
        ExchangeDeclareOptions,
        QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    Consumer,
    ExchangeKind,
};
use thiserror::Error;
use tracing::*;

use crate::resilience::{AmqpSession, Connector};

#[derive(Debug, Error)]
pub enum ChannelError {
    /// Broker unreachable or the connection went away.
    #[error("connection error: {0}")]
    Connection(#[source] lapin::Error),
    /// The connection is fine but the channel was closed or refused.
    #[error("channel error: {0}")]
    Channel(#[source] lapin::Error),
    #[error("consumer stream ended")]
    Closed,
}

/// One message from the task queue, acknowledged at most once.
#[async_trait]
pub trait TaskDelivery: Send + Sync {
    fn body(&self) -> &[u8];

    async fn ack(&self) -> Result<(), ChannelError>;
}

/// Point-to-point work queue, owned by the task worker.
#[async_trait]
pub trait TaskChannel: Send {
    async fn next(&mut self) -> Result<Box<dyn TaskDelivery>, ChannelError>;
}

/// Fanout subscription, owned by the broadcast listener.
#[async_trait]
pub trait BroadcastChannel: Send {
    async fn next(&mut self) -> Result<Vec<u8>, ChannelError>;
}

// amqp

struct AmqpDelivery {
    data: Vec<u8>,
    acker: Acker,
}

#[async_trait]
impl TaskDelivery for AmqpDelivery {
    fn body(&self) -> &[u8] {
        &self.data
    }

    async fn ack(&self) -> Result<(), ChannelError> {
        self.acker.ack(BasicAckOptions::default()).await.map_err(ChannelError::Channel)
    }
}

async fn next_delivery(consumer: &mut Consumer) -> Result<lapin::message::Delivery, ChannelError> {
    match consumer.next().await {
        Some(Ok(delivery)) => Ok(delivery),
        Some(Err(err)) => Err(classify(err)),
        None => Err(ChannelError::Closed),
    }
}

fn classify(err: lapin::Error) -> ChannelError {
    match err {
        lapin::Error::IOError(_) | lapin::Error::InvalidConnectionState(_) => ChannelError::Connection(err),
        err => ChannelError::Channel(err),
    }
}

pub struct AmqpTaskChannel {
    consumer: Consumer,
}

#[async_trait]
impl TaskChannel for AmqpTaskChannel {
    async fn next(&mut self) -> Result<Box<dyn TaskDelivery>, ChannelError> {
        let delivery = next_delivery(&mut self.consumer).await?;
        if delivery.redelivered {
            debug!("task redelivered, tag: {}", delivery.delivery_tag);
        }
        Ok(Box::new(AmqpDelivery {
            data: delivery.data,
            acker: delivery.acker,
        }))
    }
}

pub struct AmqpBroadcastChannel {
    consumer: Consumer,
}

#[async_trait]
impl BroadcastChannel for AmqpBroadcastChannel {
    async fn next(&mut self) -> Result<Vec<u8>, ChannelError> {
        Ok(next_delivery(&mut self.consumer).await?.data)
    }
}

/// Durable task queue, prefetch 1, manual ack.
pub struct AmqpTaskConnector {
    session: AmqpSession,
    queue: String,
}

impl AmqpTaskConnector {
    pub fn new(uri: String, queue: String) -> Self {
        Self {
            session: AmqpSession::new(uri),
            queue,
        }
    }
}

#[async_trait]
impl Connector for AmqpTaskConnector {
    type Channel = AmqpTaskChannel;

    fn name(&self) -> &'static str {
        "task queue"
    }

    async fn connect(&mut self) -> Result<AmqpTaskChannel, ChannelError> {
        let channel = self.session.open_channel().await?;
        channel
            .queue_declare(
                &self.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(ChannelError::Channel)?;
        channel.basic_qos(1, BasicQosOptions::default()).await.map_err(ChannelError::Channel)?;
        let consumer = channel
            .basic_consume(&self.queue, "", BasicConsumeOptions::default(), FieldTable::default())
            .await
            .map_err(ChannelError::Channel)?;
        info!("consuming tasks from `{}`", self.queue);
        Ok(AmqpTaskChannel { consumer })
    }

    async fn close(&mut self) {
        self.session.close().await;
    }
}

/// Exclusive server-named queue bound to the fanout exchange, auto-ack.
pub struct AmqpBroadcastConnector {
    session: AmqpSession,
    exchange: String,
}

impl AmqpBroadcastConnector {
    pub fn new(uri: String, exchange: String) -> Self {
        Self {
            session: AmqpSession::new(uri),
            exchange,
        }
    }
}

#[async_trait]
impl Connector for AmqpBroadcastConnector {
    type Channel = AmqpBroadcastChannel;

    fn name(&self) -> &'static str {
        "broadcast"
    }

    async fn connect(&mut self) -> Result<AmqpBroadcastChannel, ChannelError> {
        let channel = self.session.open_channel().await?;
        channel
            .exchange_declare(
                &self.exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(ChannelError::Channel)?;
        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(ChannelError::Channel)?;
        channel
            .queue_bind(queue.name().as_str(), &self.exchange, "", QueueBindOptions::default(), FieldTable::default())
            .await
            .map_err(ChannelError::Channel)?;
        let consumer = channel
            .basic_consume(
                queue.name().as_str(),
                "",
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(ChannelError::Channel)?;
        info!("listening on exchange `{}` via `{}`", self.exchange, queue.name().as_str());
        Ok(AmqpBroadcastChannel { consumer })
    }

    async fn close(&mut self) {
        self.session.close().await;
    }
}

#[cfg(test)]
pub mod mock {
    //! In-memory channels for exercising the loops without a broker.

    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::*;
    use crate::resilience::Connector;

    /// Records acks by body so tests can count them.
    #[derive(Clone, Default)]
    pub struct AckLog(pub Arc<Mutex<Vec<Vec<u8>>>>);

    impl AckLog {
        pub fn count(&self) -> usize {
            self.0.lock().unwrap().len()
        }
    }

    pub struct MockDelivery {
        pub body: Vec<u8>,
        pub acks: AckLog,
    }

    #[async_trait]
    impl TaskDelivery for MockDelivery {
        fn body(&self) -> &[u8] {
            &self.body
        }

        async fn ack(&self) -> Result<(), ChannelError> {
            self.acks.0.lock().unwrap().push(self.body.clone());
            Ok(())
        }
    }

    /// Channel fed from an mpsc sender; a closed sender reads as a dropped
    /// consumer.
    pub struct MockChannel {
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
        acks: AckLog,
    }

    #[async_trait]
    impl TaskChannel for MockChannel {
        async fn next(&mut self) -> Result<Box<dyn TaskDelivery>, ChannelError> {
            let body = self.rx.recv().await.ok_or(ChannelError::Closed)?;
            Ok(Box::new(MockDelivery {
                body,
                acks: self.acks.clone(),
            }))
        }
    }

    #[async_trait]
    impl BroadcastChannel for MockChannel {
        async fn next(&mut self) -> Result<Vec<u8>, ChannelError> {
            self.rx.recv().await.ok_or(ChannelError::Closed)
        }
    }

    /// Hands out prepared channels; fails once they are used up.
    pub struct MockConnector {
        pub channels: VecDeque<mpsc::UnboundedReceiver<Vec<u8>>>,
        pub acks: AckLog,
        pub attempts: Arc<Mutex<u32>>,
        pub failures: u32,
    }

    impl MockConnector {
        pub fn new(channels: Vec<mpsc::UnboundedReceiver<Vec<u8>>>) -> Self {
            Self {
                channels: channels.into(),
                acks: AckLog::default(),
                attempts: Arc::new(Mutex::new(0)),
                failures: 0,
            }
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        type Channel = MockChannel;

        fn name(&self) -> &'static str {
            "mock"
        }

        async fn connect(&mut self) -> Result<MockChannel, ChannelError> {
            *self.attempts.lock().unwrap() += 1;
            if self.failures > 0 {
                self.failures -= 1;
                return Err(ChannelError::Closed);
            }
            match self.channels.pop_front() {
                Some(rx) => Ok(MockChannel {
                    rx,
                    acks: self.acks.clone(),
                }),
                None => Err(ChannelError::Closed),
            }
        }
    }
}
