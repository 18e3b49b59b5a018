// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer and Producer Configurations
//!
//! Declarative, per message type records from which the factories build
//! consumers and producers. A configuration is immutable once handed to a
//! factory.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    handler::ConsumerHandler,
    message::MessageType,
    pipeline::ConsumerPipeline,
    queue::{QueueBinding, QueueDefinition},
    retry::RetryPolicy,
    serializer::MessageSerializer,
    topology::{self, to_snake_case},
};
use std::{fmt, sync::Arc, time::Duration};

pub const DEFAULT_CONCURRENCY_LIMIT: usize = 1;
pub const DEFAULT_PREFETCH_COUNT: u16 = 4;
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

/// What happens to a delivery whose payload cannot be decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeserializationFailurePolicy {
    /// Nack without requeue, dead-lettering the delivery when the queue has a DLX.
    #[default]
    Reject,
    /// Ack and drop the delivery.
    Ack,
    /// Neither ack nor nack. The delivery stays unacknowledged until the
    /// channel closes.
    Ignore,
}

/// Configuration of one consumer.
#[derive(Clone)]
pub struct RabbitMQConsumerConfiguration {
    pub(crate) name: String,
    pub(crate) message_type: String,
    pub(crate) exchange: ExchangeDefinition,
    pub(crate) queue: QueueDefinition,
    pub(crate) binding: QueueBinding,
    pub(crate) concurrency_limit: usize,
    pub(crate) prefetch_count: u16,
    pub(crate) auto_ack: bool,
    pub(crate) retry: RetryPolicy,
    pub(crate) handler_timeout: Option<Duration>,
    pub(crate) deserialization_failure: DeserializationFailurePolicy,
    pub(crate) pipelines: Vec<Arc<dyn ConsumerPipeline>>,
    pub(crate) handlers: Vec<Arc<dyn ConsumerHandler>>,
}

impl fmt::Debug for RabbitMQConsumerConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RabbitMQConsumerConfiguration")
            .field("name", &self.name)
            .field("message_type", &self.message_type)
            .field("exchange", &self.exchange)
            .field("queue", &self.queue)
            .field("binding", &self.binding)
            .field("concurrency_limit", &self.concurrency_limit)
            .field("prefetch_count", &self.prefetch_count)
            .field("auto_ack", &self.auto_ack)
            .field("pipelines", &self.pipelines.len())
            .field("handlers", &self.handlers.len())
            .finish_non_exhaustive()
    }
}

impl RabbitMQConsumerConfiguration {
    /// A configuration whose topology names are resolved from the message
    /// type when the consumer starts.
    pub fn new(name: &str, message_type: &str) -> Self {
        RabbitMQConsumerConfiguration {
            name: name.to_owned(),
            message_type: message_type.to_owned(),
            exchange: ExchangeDefinition::new("").topic().durable(),
            queue: QueueDefinition::new("").durable(),
            binding: QueueBinding::new(""),
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            auto_ack: false,
            retry: RetryPolicy::default(),
            handler_timeout: Some(DEFAULT_HANDLER_TIMEOUT),
            deserialization_failure: DeserializationFailurePolicy::default(),
            pipelines: vec![],
            handlers: vec![],
        }
    }

    /// The default configuration of `T`: consumer `{type}_consumer` on a
    /// durable topic exchange and a durable queue named after the type.
    pub fn for_message<T: MessageType>() -> Self {
        let mut cfg = Self::new(&format!("{}_consumer", to_snake_case(T::NAME)), T::NAME);
        cfg.exchange = cfg.exchange.with_name(&topology::exchange_name(T::NAME));
        cfg.queue = cfg.queue.with_name(&topology::queue_name(T::NAME));
        cfg.binding = cfg.binding.with_routing_key(&topology::routing_key(T::NAME));
        cfg
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_owned();
        self
    }

    pub fn with_exchange(mut self, exchange: ExchangeDefinition) -> Self {
        self.exchange = exchange;
        self
    }

    pub fn with_queue(mut self, queue: QueueDefinition) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_binding(mut self, binding: QueueBinding) -> Self {
        self.binding = binding;
        self
    }

    /// Number of workers, which is also the bound on in-flight handler executions.
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }

    /// Prefetch multiplier. The channel QoS is `concurrency_limit * prefetch_count`.
    pub fn with_prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = count;
        self
    }

    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }

    pub fn without_handler_timeout(mut self) -> Self {
        self.handler_timeout = None;
        self
    }

    pub fn with_deserialization_failure_policy(
        mut self,
        policy: DeserializationFailurePolicy,
    ) -> Self {
        self.deserialization_failure = policy;
        self
    }

    /// Appends a pipeline behavior. The first one added runs outermost.
    pub fn with_pipeline(mut self, pipeline: Arc<dyn ConsumerPipeline>) -> Self {
        self.pipelines.push(pipeline);
        self
    }

    /// Appends a business handler. Handlers run in the order they were added.
    pub fn with_handler(mut self, handler: Arc<dyn ConsumerHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    pub fn auto_ack(&self) -> bool {
        self.auto_ack
    }

    /// The prefetch advertised to the broker.
    pub fn prefetch(&self) -> u16 {
        let limit = u16::try_from(self.concurrency_limit).unwrap_or(u16::MAX);
        limit.saturating_mul(self.prefetch_count)
    }

    pub(crate) fn validate(&self, serializer: &dyn MessageSerializer) -> Result<(), AmqpError> {
        validate_message_type(&self.message_type, serializer)?;

        if self.concurrency_limit == 0 {
            return Err(AmqpError::ConfigurationError(format!(
                "consumer {} has a zero concurrency limit",
                self.name
            )));
        }

        if self.prefetch_count == 0 {
            return Err(AmqpError::ConfigurationError(format!(
                "consumer {} has a zero prefetch count",
                self.name
            )));
        }

        Ok(())
    }
}

/// Configuration of the publishing side of one message type.
#[derive(Debug, Clone, PartialEq)]
pub struct RabbitMQProducerConfiguration {
    pub(crate) message_type: String,
    pub(crate) exchange: ExchangeDefinition,
    pub(crate) routing_key: String,
    pub(crate) persisted: bool,
}

impl RabbitMQProducerConfiguration {
    /// A producer configuration with every name resolved from `message_type`.
    pub fn new(message_type: &str) -> Self {
        RabbitMQProducerConfiguration {
            message_type: message_type.to_owned(),
            exchange: ExchangeDefinition::new(&topology::exchange_name(message_type))
                .topic()
                .durable(),
            routing_key: topology::routing_key(message_type),
            persisted: true,
        }
    }

    pub fn for_message<T: MessageType>() -> Self {
        Self::new(T::NAME)
    }

    pub fn with_exchange(mut self, exchange: ExchangeDefinition) -> Self {
        self.exchange = exchange;
        self
    }

    pub fn with_routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn with_persisted(mut self, persisted: bool) -> Self {
        self.persisted = persisted;
        self
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn exchange(&self) -> &ExchangeDefinition {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub(crate) fn validate(&self, serializer: &dyn MessageSerializer) -> Result<(), AmqpError> {
        validate_message_type(&self.message_type, serializer)
    }
}

fn validate_message_type(
    message_type: &str,
    serializer: &dyn MessageSerializer,
) -> Result<(), AmqpError> {
    if message_type.is_empty() {
        return Err(AmqpError::ConfigurationError(
            "message type is required".to_owned(),
        ));
    }

    if !serializer.is_registered(message_type) {
        return Err(AmqpError::ConfigurationError(format!(
            "message type {} is not registered",
            message_type
        )));
    }

    Ok(())
}

/// Every consumer and producer of an application.
#[derive(Debug, Clone, Default)]
pub struct RabbitMQConfiguration {
    consumers: Vec<RabbitMQConsumerConfiguration>,
    producers: Vec<RabbitMQProducerConfiguration>,
}

impl RabbitMQConfiguration {
    pub fn new() -> Self {
        RabbitMQConfiguration::default()
    }

    pub fn add_consumer(mut self, consumer: RabbitMQConsumerConfiguration) -> Self {
        self.consumers.push(consumer);
        self
    }

    pub fn add_producer(mut self, producer: RabbitMQProducerConfiguration) -> Self {
        self.producers.push(producer);
        self
    }

    pub fn consumers(&self) -> &[RabbitMQConsumerConfiguration] {
        &self.consumers
    }

    pub fn producers(&self) -> &[RabbitMQProducerConfiguration] {
        &self.producers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        message::tests::OrderCreated,
        serializer::{JsonMessageSerializer, MessageRegistry},
    };

    fn serializer() -> JsonMessageSerializer {
        JsonMessageSerializer::new(MessageRegistry::new().register::<OrderCreated>())
    }

    #[test]
    fn consumer_defaults_follow_the_message_type() {
        let cfg = RabbitMQConsumerConfiguration::for_message::<OrderCreated>();

        assert_eq!(cfg.name(), "order_created_consumer");
        assert_eq!(cfg.message_type(), "orderCreated");
        assert_eq!(cfg.exchange.name(), "order_created");
        assert_eq!(cfg.queue.name(), "order_created_queue");
        assert_eq!(cfg.binding.routing_key(), "order_created");
        assert_eq!(cfg.concurrency_limit(), 1);
        assert_eq!(cfg.prefetch(), 4);
        assert_eq!(cfg.handler_timeout, Some(DEFAULT_HANDLER_TIMEOUT));
        assert_eq!(cfg.deserialization_failure, DeserializationFailurePolicy::Reject);
        assert!(cfg.validate(&serializer()).is_ok());
    }

    #[test]
    fn prefetch_scales_with_concurrency() {
        let cfg = RabbitMQConsumerConfiguration::for_message::<OrderCreated>()
            .with_concurrency_limit(8)
            .with_prefetch_count(10);

        assert_eq!(cfg.prefetch(), 80);
    }

    #[test]
    fn invalid_consumer_configurations_are_rejected() {
        let serializer = serializer();

        let missing_type = RabbitMQConsumerConfiguration::new("orders", "");
        let unregistered = RabbitMQConsumerConfiguration::new("orders", "orderDeleted");
        let no_workers =
            RabbitMQConsumerConfiguration::for_message::<OrderCreated>().with_concurrency_limit(0);
        let no_prefetch =
            RabbitMQConsumerConfiguration::for_message::<OrderCreated>().with_prefetch_count(0);

        for cfg in [missing_type, unregistered, no_workers, no_prefetch] {
            assert!(matches!(
                cfg.validate(&serializer),
                Err(AmqpError::ConfigurationError(_))
            ));
        }
    }

    #[test]
    fn producer_defaults_are_durable_and_persistent() {
        let cfg = RabbitMQProducerConfiguration::for_message::<OrderCreated>();

        assert_eq!(cfg.exchange().name(), "order_created");
        assert_eq!(cfg.routing_key(), "order_created");
        assert!(cfg.persisted);
        assert!(RabbitMQProducerConfiguration::new("").validate(&serializer()).is_err());
    }
}
