// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Delivery Processing
//!
//! This module implements what happens to one delivery once a worker pulled it
//! off the wire:
//! 1. A slot of the in-flight semaphore is acquired
//! 2. A consumer span is started from the trace context found in the headers
//! 3. The payload is deserialized through the registry
//! 4. Every business handler runs in order, each one wrapped in the pipeline
//!    behaviors, the retry policy and the handler deadline
//! 5. The delivery is acked on success (and the consumed notifications fire)
//!    or nacked with requeue on failure
//!
//! In auto-ack mode the broker already considers the delivery consumed, so
//! neither ack nor nack is ever sent.

use crate::{
    configuration::{DeserializationFailurePolicy, RabbitMQConsumerConfiguration},
    delivery::{Acknowledger, InboundDelivery},
    errors::AmqpError,
    handler::{ConsumedNotification, ConsumerHandler},
    message::{ConsumeContext, Metadata},
    otel::{self, ConsumerTracingOptions},
    pipeline,
    serializer::{MessageSerializer, JSON_CONTENT_TYPE},
    topology::TopologyNames,
};
use opentelemetry::{
    global::{self, BoxedTracer},
    Context,
};
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub(crate) struct DeliveryProcessor {
    configuration: RabbitMQConsumerConfiguration,
    serializer: Arc<dyn MessageSerializer>,
    handlers: RwLock<Vec<Arc<dyn ConsumerHandler>>>,
    notifications: RwLock<Vec<ConsumedNotification>>,
    in_flight: Semaphore,
    tracer: BoxedTracer,
}

impl DeliveryProcessor {
    pub(crate) fn new(
        configuration: RabbitMQConsumerConfiguration,
        serializer: Arc<dyn MessageSerializer>,
        notifications: Vec<ConsumedNotification>,
    ) -> Self {
        let handlers = configuration.handlers.clone();
        let in_flight = Semaphore::new(configuration.concurrency_limit.max(1));

        DeliveryProcessor {
            configuration,
            serializer,
            handlers: RwLock::new(handlers),
            notifications: RwLock::new(notifications),
            in_flight,
            tracer: global::tracer("amqp consumer"),
        }
    }

    pub(crate) fn configuration(&self) -> &RabbitMQConsumerConfiguration {
        &self.configuration
    }

    pub(crate) async fn connect_handler(&self, handler: Arc<dyn ConsumerHandler>) {
        self.handlers.write().await.push(handler);
    }

    pub(crate) async fn is_consumed(&self, notification: ConsumedNotification) {
        self.notifications.write().await.push(notification);
    }

    /// Processes one delivery end to end.
    pub(crate) async fn handle_received(
        &self,
        token: &CancellationToken,
        names: &TopologyNames,
        delivery: InboundDelivery,
    ) -> Result<(), AmqpError> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| AmqpError::InternalError)?;

        let routing_key = if delivery.routing_key.is_empty() {
            &names.routing_key
        } else {
            &delivery.routing_key
        };
        let cx = otel::new_consumer_span(
            delivery.headers.as_ref(),
            &self.tracer,
            &names.queue,
            &ConsumerTracingOptions {
                destination: &names.queue,
                routing_key,
                message_id: &delivery.message_id,
            },
        );

        debug!(
            "received: {} - queue: {} - tag: {}",
            delivery.kind, names.queue, delivery.delivery_tag
        );

        let message = match self.serializer.deserialize(
            &delivery.data,
            &delivery.kind,
            &delivery.content_type,
        ) {
            Ok(message) => message,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    kind = %delivery.kind,
                    queue = %names.queue,
                    "failure to deserialize the delivery"
                );
                let result = self.reject_undecodable(&delivery).await;
                otel::finish_span(&cx, Some(&err));
                return result;
            }
        };

        let metadata = delivery
            .headers
            .as_ref()
            .map(Metadata::from_field_table)
            .unwrap_or_default();
        let content_type = if delivery.content_type.is_empty() {
            JSON_CONTENT_TYPE
        } else {
            delivery.content_type.as_str()
        };

        let consume_context = ConsumeContext::new(
            message,
            metadata,
            content_type,
            &delivery.kind,
            delivery.timestamp,
            delivery.delivery_tag,
            &delivery.message_id,
            &delivery.correlation_id,
        );

        let acker = if self.configuration.auto_ack {
            None
        } else {
            Some(delivery.acker.as_ref())
        };

        let handled = self.run_handlers(&cx, token, &consume_context).await;
        let result = self.settle(acker, handled.is_ok(), &consume_context).await;
        otel::finish_span(&cx, span_error(acker.is_some(), &handled, &result));

        result
    }

    async fn reject_undecodable(&self, delivery: &InboundDelivery) -> Result<(), AmqpError> {
        if self.configuration.auto_ack {
            return Ok(());
        }

        match self.configuration.deserialization_failure {
            DeserializationFailurePolicy::Reject => delivery.acker.nack(false).await,
            DeserializationFailurePolicy::Ack => delivery.acker.ack().await,
            DeserializationFailurePolicy::Ignore => {
                warn!(
                    tag = delivery.delivery_tag,
                    "undecodable delivery left unacknowledged"
                );
                Ok(())
            }
        }
    }

    /// Runs every handler in registration order, stopping at the first
    /// failure, then acks or nacks with requeue.
    pub(crate) async fn handle(
        &self,
        ctx: &Context,
        token: &CancellationToken,
        acker: Option<&dyn Acknowledger>,
        consume_context: &ConsumeContext,
    ) -> Result<(), AmqpError> {
        let handled = self.run_handlers(ctx, token, consume_context).await;
        self.settle(acker, handled.is_ok(), consume_context).await
    }

    async fn run_handlers(
        &self,
        ctx: &Context,
        token: &CancellationToken,
        consume_context: &ConsumeContext,
    ) -> Result<(), AmqpError> {
        let handlers = self.handlers.read().await.clone();

        for handler in &handlers {
            if let Err(err) = self
                .run_handlers_with_retry(ctx, token, handler, consume_context)
                .await
            {
                error!(
                    error = err.to_string(),
                    kind = consume_context.message_type(),
                    message_id = consume_context.message_id(),
                    "error whiling handling msg"
                );
                return Err(err);
            }
        }

        Ok(())
    }

    async fn settle(
        &self,
        acker: Option<&dyn Acknowledger>,
        handled: bool,
        consume_context: &ConsumeContext,
    ) -> Result<(), AmqpError> {
        match (acker, handled) {
            (None, true) => {
                self.notify(consume_context).await;
                Ok(())
            }
            (None, false) => Ok(()),
            (Some(acker), true) => {
                acker.ack().await?;
                debug!("message successfully processed");
                self.notify(consume_context).await;
                Ok(())
            }
            (Some(acker), false) => {
                warn!("requeuing message for latter");
                acker.nack(true).await
            }
        }
    }

    /// Runs one handler under the pipeline behaviors, the retry policy and
    /// the handler deadline. The pipeline is composed anew for every attempt.
    pub(crate) async fn run_handlers_with_retry(
        &self,
        ctx: &Context,
        token: &CancellationToken,
        handler: &Arc<dyn ConsumerHandler>,
        consume_context: &ConsumeContext,
    ) -> Result<(), AmqpError> {
        let pipelines = &self.configuration.pipelines;
        let attempts = self.configuration.retry.run(token, |_| {
            pipeline::compose(pipelines, handler, consume_context)(ctx.clone())
        });

        match self.configuration.handler_timeout {
            Some(limit) => tokio::time::timeout(limit, attempts)
                .await
                .map_err(|_| AmqpError::HandlerTimeout(limit.as_millis()))?,
            None => attempts.await,
        }
    }

    async fn notify(&self, consume_context: &ConsumeContext) {
        for notification in self.notifications.read().await.iter() {
            notification(consume_context.message().as_ref());
        }
    }
}

/// The error a consumer span ends with. A handler failure settled by a nack
/// leaves the span `Ok`; without an acknowledger nothing settles it.
fn span_error<'a>(
    settles: bool,
    handled: &'a Result<(), AmqpError>,
    settled: &'a Result<(), AmqpError>,
) -> Option<&'a AmqpError> {
    match settled {
        Err(err) => Some(err),
        Ok(()) if !settles => handled.as_ref().err(),
        Ok(()) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        delivery::MockAcknowledger,
        handler::MockConsumerHandler,
        message::{tests::OrderCreated, Message, MessageType},
        pipeline::{ConsumerHandlerFn, ConsumerPipeline},
        retry::RetryPolicy,
        serializer::{JsonMessageSerializer, MessageRegistry},
    };
    use async_trait::async_trait;
    use mockall::predicate::eq;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };

    fn serializer() -> Arc<dyn MessageSerializer> {
        Arc::new(JsonMessageSerializer::new(
            MessageRegistry::new().register::<OrderCreated>(),
        ))
    }

    fn names() -> TopologyNames {
        TopologyNames::for_message_type(OrderCreated::NAME)
    }

    fn order_delivery(tag: u64, acker: MockAcknowledger) -> InboundDelivery {
        let data = serde_json::to_vec(&OrderCreated {
            id: format!("o-{tag}"),
            amount: 42,
        })
        .unwrap();

        InboundDelivery::new(tag, OrderCreated::NAME, data, Arc::new(acker))
            .with_content_type(JSON_CONTENT_TYPE)
            .with_message_id(&format!("o-{tag}"))
    }

    fn acks_once() -> MockAcknowledger {
        let mut acker = MockAcknowledger::new();
        acker.expect_ack().times(1).returning(|| Ok(()));
        acker.expect_nack().never();
        acker
    }

    fn nacks_once(requeue: bool) -> MockAcknowledger {
        let mut acker = MockAcknowledger::new();
        acker.expect_ack().never();
        acker
            .expect_nack()
            .with(eq(requeue))
            .times(1)
            .returning(|_| Ok(()));
        acker
    }

    fn handler_returning(times: usize, result: Result<(), AmqpError>) -> Arc<dyn ConsumerHandler> {
        let mut handler = MockConsumerHandler::new();
        handler
            .expect_handle()
            .times(times)
            .returning(move |_, _| result.clone());
        Arc::new(handler)
    }

    fn processor(cfg: RabbitMQConsumerConfiguration) -> DeliveryProcessor {
        DeliveryProcessor::new(cfg, serializer(), vec![])
    }

    #[tokio::test]
    async fn successful_delivery_is_acked_once_and_notified() {
        let cfg = RabbitMQConsumerConfiguration::for_message::<OrderCreated>()
            .with_handler(handler_returning(1, Ok(())));
        let processor = processor(cfg);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let notified = seen.clone();
        processor
            .is_consumed(Arc::new(move |msg: &dyn Message| {
                notified.lock().unwrap().push(msg.id().to_owned());
            }))
            .await;

        processor
            .handle_received(&CancellationToken::new(), &names(), order_delivery(1, acks_once()))
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["o-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_handler_is_retried_then_nacked_with_requeue() {
        let cfg = RabbitMQConsumerConfiguration::for_message::<OrderCreated>()
            .with_handler(handler_returning(3, Err(AmqpError::HandlerError("db down".into()))));
        let processor = processor(cfg);

        let notified = Arc::new(AtomicUsize::new(0));
        let counter = notified.clone();
        processor
            .is_consumed(Arc::new(move |_: &dyn Message| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .await;

        processor
            .handle_received(&CancellationToken::new(), &names(), order_delivery(2, nacks_once(true)))
            .await
            .unwrap();

        assert_eq!(notified.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn first_failing_handler_stops_the_chain() {
        let cfg = RabbitMQConsumerConfiguration::for_message::<OrderCreated>()
            .with_retry_policy(RetryPolicy::no_retry())
            .with_handler(handler_returning(1, Err(AmqpError::HandlerError("invalid".into()))))
            .with_handler(handler_returning(0, Ok(())));

        processor(cfg)
            .handle_received(&CancellationToken::new(), &names(), order_delivery(3, nacks_once(true)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn handlers_connected_at_runtime_run_after_configured_ones() {
        let order = Arc::new(Mutex::new(Vec::new()));

        struct Named(&'static str, Arc<Mutex<Vec<&'static str>>>);

        #[async_trait]
        impl ConsumerHandler for Named {
            async fn handle(&self, _: &Context, _: &ConsumeContext) -> Result<(), AmqpError> {
                self.1.lock().unwrap().push(self.0);
                Ok(())
            }
        }

        let cfg = RabbitMQConsumerConfiguration::for_message::<OrderCreated>()
            .with_handler(Arc::new(Named("configured", order.clone())));
        let processor = processor(cfg);
        processor
            .connect_handler(Arc::new(Named("connected", order.clone())))
            .await;

        processor
            .handle_received(&CancellationToken::new(), &names(), order_delivery(4, acks_once()))
            .await
            .unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["configured", "connected"]);
    }

    #[tokio::test]
    async fn undecodable_delivery_follows_the_failure_policy() {
        let cases = [
            (DeserializationFailurePolicy::Reject, nacks_once(false)),
            (DeserializationFailurePolicy::Ack, acks_once()),
            (DeserializationFailurePolicy::Ignore, {
                let mut acker = MockAcknowledger::new();
                acker.expect_ack().never();
                acker.expect_nack().never();
                acker
            }),
        ];

        for (policy, acker) in cases {
            let cfg = RabbitMQConsumerConfiguration::for_message::<OrderCreated>()
                .with_deserialization_failure_policy(policy)
                .with_handler(handler_returning(0, Ok(())));
            let delivery = InboundDelivery::new(5, OrderCreated::NAME, b"{".to_vec(), Arc::new(acker));

            processor(cfg)
                .handle_received(&CancellationToken::new(), &names(), delivery)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn auto_ack_never_acks_explicitly() {
        let mut acker = MockAcknowledger::new();
        acker.expect_ack().never();
        acker.expect_nack().never();

        let cfg = RabbitMQConsumerConfiguration::for_message::<OrderCreated>()
            .with_auto_ack(true)
            .with_retry_policy(RetryPolicy::no_retry())
            .with_handler(handler_returning(1, Err(AmqpError::HandlerError("boom".into()))));

        processor(cfg)
            .handle_received(&CancellationToken::new(), &names(), order_delivery(6, acker))
            .await
            .unwrap();
    }

    #[test]
    fn failed_handlers_mark_the_span_only_when_nothing_settles_them() {
        let failed = Err(AmqpError::HandlerError("boom".into()));
        let nack_failed = Err(AmqpError::NackMessageError);

        assert_eq!(span_error(false, &failed, &Ok(())), failed.as_ref().err());
        assert_eq!(span_error(true, &failed, &Ok(())), None);
        assert_eq!(span_error(true, &failed, &nack_failed), nack_failed.as_ref().err());
        assert_eq!(span_error(false, &Ok(()), &Ok(())), None);
    }

    struct Sleepy(Duration);

    #[async_trait]
    impl ConsumerHandler for Sleepy {
        async fn handle(&self, _: &Context, _: &ConsumeContext) -> Result<(), AmqpError> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_handler_times_out_and_is_requeued() {
        let cfg = RabbitMQConsumerConfiguration::for_message::<OrderCreated>()
            .with_handler_timeout(Duration::from_secs(1))
            .with_handler(Arc::new(Sleepy(Duration::from_secs(3600))));
        let processor = processor(cfg);
        let cx = Context::new();
        let cc = crate::message::tests::order_context("o-7");

        let acker = nacks_once(true);
        processor
            .handle(&cx, &CancellationToken::new(), Some(&acker as &dyn Acknowledger), &cc)
            .await
            .unwrap();

        let handler: Arc<dyn ConsumerHandler> = Arc::new(Sleepy(Duration::from_secs(3600)));
        assert_eq!(
            processor
                .run_handlers_with_retry(&cx, &CancellationToken::new(), &handler, &cc)
                .await,
            Err(AmqpError::HandlerTimeout(1000))
        );
    }

    struct HighWaterMark {
        current: AtomicUsize,
        max: AtomicUsize,
    }

    #[async_trait]
    impl ConsumerPipeline for HighWaterMark {
        async fn handle(
            &self,
            ctx: Context,
            _: &ConsumeContext,
            next: ConsumerHandlerFn<'_>,
        ) -> Result<(), AmqpError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max.fetch_max(now, Ordering::SeqCst);
            let result = next(ctx).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_handlers_never_exceed_the_concurrency_limit() {
        let gauge = Arc::new(HighWaterMark {
            current: AtomicUsize::new(0),
            max: AtomicUsize::new(0),
        });
        let cfg = RabbitMQConsumerConfiguration::for_message::<OrderCreated>()
            .with_concurrency_limit(2)
            .with_pipeline(gauge.clone())
            .with_handler(Arc::new(Sleepy(Duration::from_millis(100))));
        let processor = Arc::new(processor(cfg));

        let tasks: Vec<_> = (0..10)
            .map(|tag| {
                let processor = processor.clone();
                tokio::spawn(async move {
                    processor
                        .handle_received(&CancellationToken::new(), &names(), order_delivery(tag, acks_once()))
                        .await
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(gauge.max.load(Ordering::SeqCst), 2);
    }
}
