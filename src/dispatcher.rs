// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Consumer
//!
//! A [`RabbitMQConsumer`] owns the subscription of one message type: it
//! declares the topology, sets the channel prefetch, starts consuming and
//! spawns a fixed pool of workers that pull deliveries off the shared stream.
//!
//! The consumer heals itself. A background watcher listens for the reconnect
//! broadcast of the connection and for channel-level closures; on either, the
//! whole subscription (topology included) is rebuilt. Declarations are
//! "create if missing", so rebuilding is idempotent.
//!
//! [`Consumer::stop`] cancels the broker subscription, waits for every
//! in-flight handler to finish and only then closes the channel.

use crate::{
    configuration::RabbitMQConsumerConfiguration,
    connection::RabbitMQConnection,
    consumer::DeliveryProcessor,
    delivery::InboundDelivery,
    errors::AmqpError,
    handler::{ConsumedNotification, ConsumerHandler},
    topology::{AmqpTopology, TopologyNames},
};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use lapin::{
    options::{BasicCancelOptions, BasicConsumeOptions, BasicQosOptions},
    types::FieldTable,
    Channel,
};
use std::sync::{
    atomic::{AtomicU8, AtomicUsize, Ordering},
    Arc,
};
use tokio::sync::{
    broadcast::{
        self,
        error::{RecvError, TryRecvError},
    },
    Mutex,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const CHANNEL_CLOSED_CAPACITY: usize = 16;

/// Lifecycle of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConsumerStatus {
    Idle = 0,
    Starting = 1,
    Running = 2,
    Resubscribing = 3,
    Stopping = 4,
    Stopped = 5,
}

impl From<u8> for ConsumerStatus {
    fn from(value: u8) -> Self {
        match value {
            1 => ConsumerStatus::Starting,
            2 => ConsumerStatus::Running,
            3 => ConsumerStatus::Resubscribing,
            4 => ConsumerStatus::Stopping,
            5 => ConsumerStatus::Stopped,
            _ => ConsumerStatus::Idle,
        }
    }
}

#[async_trait]
pub trait Consumer: Send + Sync {
    /// Declares the topology and starts the workers. Cancelling `token`
    /// stops the workers without draining them; call [`Consumer::stop`] for
    /// an orderly shutdown.
    async fn start(&self, token: CancellationToken) -> Result<(), AmqpError>;

    async fn stop(&self) -> Result<(), AmqpError>;

    /// Registers a callback fired for every message handled and acked.
    async fn is_consumed(&self, notification: ConsumedNotification);

    fn name(&self) -> &str;
}

/// Workers sharing one delivery stream.
pub(crate) struct WorkerPool {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl WorkerPool {
    pub(crate) fn spawn<S, D>(
        parent: &CancellationToken,
        workers: usize,
        stream: S,
        processor: Arc<DeliveryProcessor>,
        names: Arc<TopologyNames>,
        channel_closed: &broadcast::Sender<String>,
    ) -> Self
    where
        S: Stream<Item = Result<D, lapin::Error>> + Unpin + Send + 'static,
        D: Into<InboundDelivery> + Send + 'static,
    {
        let token = parent.child_token();
        let tracker = TaskTracker::new();
        let stream = Arc::new(Mutex::new(stream));

        for worker in 0..workers {
            tracker.spawn(run_worker(
                worker,
                stream.clone(),
                processor.clone(),
                names.clone(),
                token.clone(),
                channel_closed.subscribe(),
            ));
        }
        tracker.close();

        WorkerPool { token, tracker }
    }

    /// Stops the workers and waits until every in-flight delivery is done.
    pub(crate) async fn shutdown(&self) {
        self.token.cancel();
        self.tracker.wait().await;
    }
}

async fn run_worker<S, D>(
    worker: usize,
    stream: Arc<Mutex<S>>,
    processor: Arc<DeliveryProcessor>,
    names: Arc<TopologyNames>,
    token: CancellationToken,
    mut channel_closed: broadcast::Receiver<String>,
) where
    S: Stream<Item = Result<D, lapin::Error>> + Unpin + Send,
    D: Into<InboundDelivery>,
{
    let mut watch_closed = true;

    loop {
        let next = async { stream.lock().await.next().await };

        tokio::select! {
            _ = token.cancelled() => break,

            reason = channel_closed.recv(), if watch_closed => match reason {
                Ok(reason) => warn!(worker, queue = %names.queue, reason = %reason, "channel closed"),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => watch_closed = false,
            },

            delivery = next => match delivery {
                Some(Ok(delivery)) => {
                    if let Err(err) = processor
                        .handle_received(&token, &names, delivery.into())
                        .await
                    {
                        error!(error = err.to_string(), worker, "error consume msg");
                    }
                }
                Some(Err(err)) => error!(error = err.to_string(), worker, "errors consume msg"),
                None => {
                    debug!(worker, queue = %names.queue, "delivery stream ended");
                    break;
                }
            },
        }
    }

    debug!(worker, queue = %names.queue, "worker stopped");
}

struct Subscription {
    channel: Channel,
    consumer_tag: String,
    pool: WorkerPool,
}

impl Subscription {
    /// Cancels the broker subscription, drains the workers and closes the
    /// channel. Broker calls are skipped when the connection is down.
    async fn shutdown(self, connected: bool) -> Result<(), AmqpError> {
        if connected {
            if let Err(err) = self
                .channel
                .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
                .await
            {
                warn!(error = err.to_string(), tag = %self.consumer_tag, "failure to cancel the consumer");
            }
        }

        self.pool.shutdown().await;

        if connected && self.channel.status().connected() {
            if let Err(err) = self.channel.close(200, "consumer stopped").await {
                error!(error = err.to_string(), "failure to close the channel");
                return Err(AmqpError::ChannelError(err.to_string()));
            }
        }

        Ok(())
    }
}

struct ConsumerInner {
    name: String,
    connection: Arc<RabbitMQConnection>,
    processor: Arc<DeliveryProcessor>,
    status: AtomicU8,
    resubscriptions: AtomicUsize,
    subscription: Mutex<Option<Subscription>>,
    watcher: Mutex<Option<CancellationToken>>,
    channel_closed: broadcast::Sender<String>,
}

impl ConsumerInner {
    fn status(&self) -> ConsumerStatus {
        ConsumerStatus::from(self.status.load(Ordering::SeqCst))
    }

    fn set_status(&self, status: ConsumerStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    fn transition(&self, from: ConsumerStatus, to: ConsumerStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Moves into `Resubscribing` unless the consumer is starting or
    /// stopping.
    fn begin_resubscribe(&self) -> bool {
        self.status
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                match ConsumerStatus::from(current) {
                    ConsumerStatus::Idle | ConsumerStatus::Running | ConsumerStatus::Resubscribing => {
                        Some(ConsumerStatus::Resubscribing as u8)
                    }
                    _ => None,
                }
            })
            .is_ok()
    }

    fn is_stopping(&self) -> bool {
        matches!(
            self.status(),
            ConsumerStatus::Stopping | ConsumerStatus::Stopped
        )
    }

    /// Starts the resubscribe watcher once and returns the token every
    /// worker pool of this consumer derives from.
    async fn watch(self: &Arc<Self>, parent: &CancellationToken) -> CancellationToken {
        let mut watcher = self.watcher.lock().await;
        if let Some(token) = watcher.as_ref().filter(|t| !t.is_cancelled()) {
            return token.clone();
        }

        let token = parent.child_token();
        *watcher = Some(token.clone());

        let mut reconnected = self.connection.subscribe_reconnected();
        let mut channel_closed = self.channel_closed.subscribe();
        let inner = self.clone();
        let watch_token = token.clone();

        tokio::spawn(async move {
            loop {
                let reconnect = tokio::select! {
                    biased;

                    _ = watch_token.cancelled() => break,

                    signal = reconnected.recv() => match signal {
                        Ok(()) => {
                            info!(consumer = %inner.name, "connection reestablished, resubscribing");
                            true
                        }
                        Err(RecvError::Lagged(missed)) => {
                            info!(consumer = %inner.name, missed, "connection reestablished, resubscribing");
                            true
                        }
                        Err(RecvError::Closed) => break,
                    },

                    reason = channel_closed.recv() => match reason {
                        // the reconnect signal will follow
                        Ok(_) | Err(RecvError::Lagged(_)) if !inner.connection.is_connected() => continue,
                        Ok(reason) => {
                            warn!(consumer = %inner.name, reason = %reason, "channel closed, resubscribing");
                            false
                        }
                        Err(RecvError::Lagged(_)) => {
                            warn!(consumer = %inner.name, "channel closed, resubscribing");
                            false
                        }
                        Err(RecvError::Closed) => break,
                    },
                };

                if reconnect {
                    // closures queued so far belong to channels of the lost transport
                    let stale = discard_pending(&mut channel_closed);
                    if stale > 0 {
                        debug!(consumer = %inner.name, stale, "discarded channel closures");
                    }
                }

                inner.resubscribe(&watch_token).await;
            }

            debug!(consumer = %inner.name, "resubscribe watcher stopped");
        });

        token
    }

    async fn resubscribe(&self, token: &CancellationToken) {
        if token.is_cancelled() || !self.begin_resubscribe() {
            return;
        }

        let attempt = self.resubscriptions.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(consumer = %self.name, attempt, "resubscribing");

        match self.subscribe(token).await {
            Ok(()) => {
                if self.transition(ConsumerStatus::Resubscribing, ConsumerStatus::Running) {
                    info!(consumer = %self.name, "consumer resubscribed");
                }
            }
            Err(err) => error!(
                error = err.to_string(),
                consumer = %self.name,
                "failure to resubscribe, waiting for the next signal"
            ),
        }
    }

    /// Replaces the current subscription with a fresh one: channel, prefetch,
    /// topology, broker consumer and workers.
    async fn subscribe(&self, token: &CancellationToken) -> Result<(), AmqpError> {
        let mut current = self.subscription.lock().await;
        if self.is_stopping() {
            return Ok(());
        }

        if let Some(previous) = current.take() {
            if let Err(err) = previous.shutdown(self.connection.is_connected()).await {
                warn!(error = err.to_string(), "failure to release the previous subscription");
            }
        }

        let cfg = self.processor.configuration();
        let names = Arc::new(TopologyNames::resolve(
            &cfg.message_type,
            &cfg.exchange,
            &cfg.queue,
            &cfg.binding,
        ));

        let channel = self.connection.channel().await?;

        if let Err(err) = channel
            .basic_qos(cfg.prefetch(), BasicQosOptions { global: false })
            .await
        {
            error!(error = err.to_string(), "failure to set the prefetch");
            return Err(AmqpError::QoSDeclarationError(names.queue.clone()));
        }

        AmqpTopology::new(&channel, false)
            .install(&names, &cfg.exchange, &cfg.queue, &cfg.binding)
            .await?;

        let consumer_tag = format!("{}-{}", self.name, Uuid::new_v4());
        let stream = match channel
            .basic_consume(
                &names.queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: cfg.auto_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(names.queue.clone()))
            }
            Ok(c) => Ok(c),
        }?;

        let closed = self.channel_closed.clone();
        channel.on_error(move |err| {
            let _ = closed.send(err.to_string());
        });

        let pool = WorkerPool::spawn(
            token,
            cfg.concurrency_limit,
            stream,
            self.processor.clone(),
            names.clone(),
            &self.channel_closed,
        );

        debug!(
            queue = %names.queue,
            exchange = %names.exchange,
            routing_key = %names.routing_key,
            workers = cfg.concurrency_limit,
            "consuming"
        );

        *current = Some(Subscription {
            channel,
            consumer_tag,
            pool,
        });

        Ok(())
    }
}

fn discard_pending(closed: &mut broadcast::Receiver<String>) -> usize {
    let mut discarded = 0;
    loop {
        match closed.try_recv() {
            Ok(_) | Err(TryRecvError::Lagged(_)) => discarded += 1,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return discarded,
        }
    }
}

/// The consumer of one message type.
pub struct RabbitMQConsumer {
    inner: Arc<ConsumerInner>,
}

impl RabbitMQConsumer {
    pub(crate) fn new(connection: Arc<RabbitMQConnection>, processor: DeliveryProcessor) -> Self {
        let (channel_closed, _) = broadcast::channel(CHANNEL_CLOSED_CAPACITY);

        RabbitMQConsumer {
            inner: Arc::new(ConsumerInner {
                name: processor.configuration().name.clone(),
                connection,
                processor: Arc::new(processor),
                status: AtomicU8::new(ConsumerStatus::Idle as u8),
                resubscriptions: AtomicUsize::new(0),
                subscription: Mutex::new(None),
                watcher: Mutex::new(None),
                channel_closed,
            }),
        }
    }

    pub fn status(&self) -> ConsumerStatus {
        self.inner.status()
    }

    pub fn configuration(&self) -> &RabbitMQConsumerConfiguration {
        self.inner.processor.configuration()
    }

    /// Appends a business handler. It runs after the handlers already registered.
    pub async fn connect_handler(&self, handler: Arc<dyn ConsumerHandler>) {
        self.inner.processor.connect_handler(handler).await;
    }
}

#[async_trait]
impl Consumer for RabbitMQConsumer {
    async fn start(&self, token: CancellationToken) -> Result<(), AmqpError> {
        let inner = &self.inner;
        inner.set_status(ConsumerStatus::Starting);

        let token = inner.watch(&token).await;

        match inner.subscribe(&token).await {
            Ok(()) => {
                inner.transition(ConsumerStatus::Starting, ConsumerStatus::Running);
                info!(consumer = %inner.name, "consumer started");
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), consumer = %inner.name, "failure to start the consumer");
                inner.transition(ConsumerStatus::Starting, ConsumerStatus::Idle);
                Err(err)
            }
        }
    }

    async fn stop(&self) -> Result<(), AmqpError> {
        let inner = &self.inner;
        inner.set_status(ConsumerStatus::Stopping);

        // held until `Stopped` so no resubscription slips in behind the shutdown
        let mut current = inner.subscription.lock().await;
        let result = match current.take() {
            Some(subscription) => subscription.shutdown(inner.connection.is_connected()).await,
            None => Ok(()),
        };

        if let Some(watcher) = inner.watcher.lock().await.take() {
            watcher.cancel();
        }

        inner.set_status(ConsumerStatus::Stopped);
        drop(current);
        info!(consumer = %inner.name, "consumer stopped");

        result
    }

    async fn is_consumed(&self, notification: ConsumedNotification) {
        self.inner.processor.is_consumed(notification).await;
    }

    fn name(&self) -> &str {
        &self.inner.name
    }
}
