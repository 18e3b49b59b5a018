// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Producer
//!
//! This module publishes serialized messages to the exchange configured for
//! their message type, carrying metadata and the OpenTelemetry context as AMQP
//! headers.
//!
//! The producer opens one channel lazily and keeps it until it is no longer
//! connected, re-opening it on the next publish. The target exchange is
//! declared once per opened channel.

use crate::{
    configuration::RabbitMQProducerConfiguration,
    connection::RabbitMQConnection,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    handler::ProducedNotification,
    message::{Message, Metadata, CORRELATION_ID_HEADER},
    otel,
    serializer::MessageSerializer,
    topology::AmqpTopology,
};
use async_trait::async_trait;
use lapin::{
    options::BasicPublishOptions,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel,
};
use opentelemetry::{
    global::{self, BoxedTracer},
    Context,
};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error};
use uuid::Uuid;

/// AMQP delivery mode of messages that survive a broker restart.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

#[async_trait]
pub trait Producer: Send + Sync {
    /// Publishes `message` to the exchange configured for its type.
    async fn publish_message(
        &self,
        ctx: &Context,
        message: &dyn Message,
        metadata: &Metadata,
    ) -> Result<(), AmqpError>;

    /// Publishes `message` to `exchange` instead of the configured exchange.
    async fn publish_message_with_topic_name(
        &self,
        ctx: &Context,
        message: &dyn Message,
        metadata: &Metadata,
        exchange: &str,
    ) -> Result<(), AmqpError>;

    /// Registers a callback fired after every successful publish.
    async fn is_produced(&self, notification: ProducedNotification);
}

/// Where and how a message is published.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PublishTarget {
    pub(crate) exchange: ExchangeDefinition,
    pub(crate) routing_key: String,
    pub(crate) persisted: bool,
}

struct ProducerChannel {
    channel: Channel,
    declared: HashSet<String>,
}

pub struct RabbitMQProducer {
    connection: Arc<RabbitMQConnection>,
    serializer: Arc<dyn MessageSerializer>,
    configurations: HashMap<String, RabbitMQProducerConfiguration>,
    channel: Mutex<Option<ProducerChannel>>,
    notifications: RwLock<Vec<ProducedNotification>>,
    tracer: BoxedTracer,
}

impl RabbitMQProducer {
    pub(crate) fn new(
        connection: Arc<RabbitMQConnection>,
        serializer: Arc<dyn MessageSerializer>,
        configurations: Vec<RabbitMQProducerConfiguration>,
        notifications: Vec<ProducedNotification>,
    ) -> Self {
        let configurations = configurations
            .into_iter()
            .map(|cfg| (cfg.message_type.clone(), cfg))
            .collect();

        RabbitMQProducer {
            connection,
            serializer,
            configurations,
            channel: Mutex::new(None),
            notifications: RwLock::new(notifications),
            tracer: global::tracer("amqp producer"),
        }
    }

    /// Resolves the target of a message type. Types without a configuration
    /// use the resolver defaults.
    pub(crate) fn target(&self, message_type: &str, exchange: Option<&str>) -> PublishTarget {
        let cfg = match self.configurations.get(message_type) {
            Some(cfg) => cfg.clone(),
            None => RabbitMQProducerConfiguration::new(message_type)
                .with_persisted(self.connection.configs().persisted),
        };

        let exchange = match exchange {
            Some(name) => cfg.exchange.with_name(name),
            None => cfg.exchange,
        };

        PublishTarget {
            exchange,
            routing_key: cfg.routing_key,
            persisted: cfg.persisted,
        }
    }

    async fn publish(
        &self,
        ctx: &Context,
        message: &dyn Message,
        metadata: &Metadata,
        exchange: Option<&str>,
    ) -> Result<(), AmqpError> {
        let target = self.target(message.name(), exchange);
        let serialized = self.serializer.serialize(message)?;

        let cx = otel::new_producer_span(
            ctx,
            &self.tracer,
            target.exchange.name(),
            &target.routing_key,
        );

        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
        metadata.write_headers(&mut headers);
        otel::inject_context(&cx, &mut headers);

        let properties = message_properties(
            message,
            metadata,
            &serialized.content_type,
            &self.connection.configs().app_name,
            target.persisted,
        )
        .with_headers(FieldTable::from(headers));

        let result = self.send(&target, &serialized.data, properties).await;
        otel::finish_span(&cx, result.as_ref().err());

        if result.is_ok() {
            debug!(
                exchange = target.exchange.name(),
                routing_key = %target.routing_key,
                kind = message.name(),
                "message published"
            );
            for notification in self.notifications.read().await.iter() {
                notification(message);
            }
        }

        result
    }

    async fn send(
        &self,
        target: &PublishTarget,
        data: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let mut slot = self.channel.lock().await;

        let reusable = slot
            .as_ref()
            .is_some_and(|current| current.channel.status().connected());
        if !reusable {
            *slot = Some(ProducerChannel {
                channel: self.connection.channel().await?,
                declared: HashSet::new(),
            });
        }

        let Some(current) = slot.as_mut() else {
            return Err(AmqpError::InternalError);
        };

        let exchange = target.exchange.name();
        if !exchange.is_empty() && !current.declared.contains(exchange) {
            AmqpTopology::new(&current.channel, false)
                .declare_exchange(exchange, &target.exchange)
                .await?;
            current.declared.insert(exchange.to_owned());
        }

        match current
            .channel
            .basic_publish(
                exchange,
                &target.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                data,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            _ => Ok(()),
        }
    }
}

/// AMQP properties of an outgoing message, headers excluded.
pub(crate) fn message_properties(
    message: &dyn Message,
    metadata: &Metadata,
    content_type: &str,
    app_id: &str,
    persisted: bool,
) -> BasicProperties {
    let message_id = match message.id() {
        "" => Uuid::new_v4().to_string(),
        id => id.to_owned(),
    };
    let correlation_id = metadata
        .get_str(CORRELATION_ID_HEADER)
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();

    let properties = BasicProperties::default()
        .with_content_type(ShortString::from(content_type))
        .with_kind(ShortString::from(message.name()))
        .with_message_id(ShortString::from(message_id))
        .with_correlation_id(ShortString::from(correlation_id))
        .with_timestamp(timestamp)
        .with_app_id(ShortString::from(app_id));

    if persisted {
        properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE)
    } else {
        properties
    }
}

#[async_trait]
impl Producer for RabbitMQProducer {
    async fn publish_message(
        &self,
        ctx: &Context,
        message: &dyn Message,
        metadata: &Metadata,
    ) -> Result<(), AmqpError> {
        self.publish(ctx, message, metadata, None).await
    }

    async fn publish_message_with_topic_name(
        &self,
        ctx: &Context,
        message: &dyn Message,
        metadata: &Metadata,
        exchange: &str,
    ) -> Result<(), AmqpError> {
        self.publish(ctx, message, metadata, Some(exchange)).await
    }

    async fn is_produced(&self, notification: ProducedNotification) {
        self.notifications.write().await.push(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        configs::RabbitMQConfigs,
        message::tests::OrderCreated,
        serializer::{JsonMessageSerializer, MessageRegistry, JSON_CONTENT_TYPE},
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn order(id: &str) -> OrderCreated {
        OrderCreated {
            id: id.to_owned(),
            amount: 7,
        }
    }

    fn producer(configurations: Vec<RabbitMQProducerConfiguration>) -> RabbitMQProducer {
        let cfg = RabbitMQConfigs {
            port: 1,
            persisted: false,
            ..Default::default()
        };
        let serializer = JsonMessageSerializer::new(MessageRegistry::new().register::<OrderCreated>());

        RabbitMQProducer::new(
            Arc::new(RabbitMQConnection::new(cfg)),
            Arc::new(serializer),
            configurations,
            vec![],
        )
    }

    #[test]
    fn properties_carry_type_ids_and_persistence() {
        let metadata = Metadata::new().with(CORRELATION_ID_HEADER, "corr-9");
        let props = message_properties(&order("o-1"), &metadata, JSON_CONTENT_TYPE, "billing", true);

        assert_eq!(props.kind().as_ref().map(|k| k.as_str()), Some("orderCreated"));
        assert_eq!(props.message_id().as_ref().map(|k| k.as_str()), Some("o-1"));
        assert_eq!(props.correlation_id().as_ref().map(|k| k.as_str()), Some("corr-9"));
        assert_eq!(props.app_id().as_ref().map(|k| k.as_str()), Some("billing"));
        assert_eq!(*props.delivery_mode(), Some(PERSISTENT_DELIVERY_MODE));
        assert!(props.timestamp().is_some());
    }

    #[test]
    fn missing_ids_are_generated() {
        let props = message_properties(&order(""), &Metadata::new(), JSON_CONTENT_TYPE, "", false);

        let message_id = props.message_id().clone().unwrap();
        let correlation_id = props.correlation_id().clone().unwrap();
        assert!(Uuid::parse_str(message_id.as_str()).is_ok());
        assert!(Uuid::parse_str(correlation_id.as_str()).is_ok());
        assert_eq!(*props.delivery_mode(), None);
    }

    #[test]
    fn target_prefers_configuration_then_defaults() {
        let configured = RabbitMQProducerConfiguration::for_message::<OrderCreated>()
            .with_exchange(ExchangeDefinition::new("orders").topic().durable())
            .with_routing_key("orders.created");
        let producer = producer(vec![configured]);

        let target = producer.target("orderCreated", None);
        assert_eq!(target.exchange.name(), "orders");
        assert_eq!(target.routing_key, "orders.created");
        assert!(target.persisted);

        let overridden = producer.target("orderCreated", Some("audit"));
        assert_eq!(overridden.exchange.name(), "audit");
        assert_eq!(overridden.routing_key, "orders.created");

        let fallback = producer.target("paymentSettled", None);
        assert_eq!(fallback.exchange.name(), "payment_settled");
        assert_eq!(fallback.routing_key, "payment_settled");
        assert!(!fallback.persisted);
    }

    #[tokio::test]
    async fn publish_without_connection_fails_and_does_not_notify() {
        let producer = producer(vec![]);
        let produced = Arc::new(AtomicUsize::new(0));
        let counter = produced.clone();
        producer
            .is_produced(Arc::new(move |_: &dyn Message| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .await;

        let err = producer
            .publish_message(&Context::new(), &order("o-2"), &Metadata::new())
            .await
            .unwrap_err();

        assert!(matches!(err, AmqpError::ChannelError(_)));
        assert_eq!(produced.load(Ordering::SeqCst), 0);
    }
}
