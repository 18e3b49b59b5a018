// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Bus
//!
//! Every consumer of an application plus its producer, behind one start/stop
//! surface.

use crate::{
    configs::RabbitMQConfigs,
    configuration::RabbitMQConfiguration,
    connection::RabbitMQConnection,
    dispatcher::{Consumer, RabbitMQConsumer},
    errors::AmqpError,
    factory::{ConsumerFactory, ProducerFactory},
    handler::ConsumedNotification,
    message::{Message, Metadata},
    publisher::{Producer, RabbitMQProducer},
    serializer::MessageSerializer,
};
use opentelemetry::Context;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct RabbitMQBus {
    connection: Arc<RabbitMQConnection>,
    consumers: Vec<Arc<RabbitMQConsumer>>,
    producer: Arc<RabbitMQProducer>,
}

impl RabbitMQBus {
    /// Builds every configured consumer and the producer. Nothing is started.
    pub fn new(
        connection: Arc<RabbitMQConnection>,
        serializer: Arc<dyn MessageSerializer>,
        configuration: RabbitMQConfiguration,
    ) -> Result<Self, AmqpError> {
        let consumer_factory = ConsumerFactory::new(connection.clone(), serializer.clone());
        let producer_factory = ProducerFactory::new(connection.clone(), serializer);

        let consumers = configuration
            .consumers()
            .iter()
            .map(|cfg| {
                consumer_factory
                    .create_consumer(cfg.clone(), vec![])
                    .map(Arc::new)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let producer = producer_factory.create_producer(configuration.producers().to_vec(), vec![])?;

        Ok(RabbitMQBus {
            connection,
            consumers,
            producer: Arc::new(producer),
        })
    }

    /// Opens the connection, builds the bus and starts it when
    /// [`RabbitMQConfigs::auto_start`] is set.
    pub async fn connect(
        cfg: RabbitMQConfigs,
        serializer: Arc<dyn MessageSerializer>,
        configuration: RabbitMQConfiguration,
        token: CancellationToken,
    ) -> Result<Arc<Self>, AmqpError> {
        let auto_start = cfg.auto_start;
        let connection = RabbitMQConnection::open(cfg).await?;
        let bus = Arc::new(RabbitMQBus::new(connection, serializer, configuration)?);

        if auto_start {
            bus.start(token).await?;
        }

        Ok(bus)
    }

    /// Starts every consumer. The first failure aborts.
    pub async fn start(&self, token: CancellationToken) -> Result<(), AmqpError> {
        for consumer in &self.consumers {
            consumer.start(token.clone()).await?;
        }

        info!(consumers = self.consumers.len(), "rabbitmq bus started");
        Ok(())
    }

    /// Stops every consumer, even after a failure, and reports the first one.
    pub async fn stop(&self) -> Result<(), AmqpError> {
        let mut first_err = None;

        for consumer in &self.consumers {
            if let Err(err) = consumer.stop().await {
                error!(error = err.to_string(), consumer = consumer.name(), "failure to stop consumer");
                first_err.get_or_insert(err);
            }
        }

        info!("rabbitmq bus stopped");
        first_err.map_or(Ok(()), Err)
    }

    /// Registers `notification` on every consumer.
    pub async fn is_consumed(&self, notification: ConsumedNotification) {
        for consumer in &self.consumers {
            consumer.is_consumed(notification.clone()).await;
        }
    }

    pub async fn publish_message(
        &self,
        ctx: &Context,
        message: &dyn Message,
        metadata: &Metadata,
    ) -> Result<(), AmqpError> {
        self.producer.publish_message(ctx, message, metadata).await
    }

    pub fn consumer(&self, name: &str) -> Option<&Arc<RabbitMQConsumer>> {
        self.consumers.iter().find(|c| c.name() == name)
    }

    pub fn consumers(&self) -> &[Arc<RabbitMQConsumer>] {
        &self.consumers
    }

    pub fn producer(&self) -> &Arc<RabbitMQProducer> {
        &self.producer
    }

    pub fn connection(&self) -> &Arc<RabbitMQConnection> {
        &self.connection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        configuration::{RabbitMQConsumerConfiguration, RabbitMQProducerConfiguration},
        dispatcher::ConsumerStatus,
        message::tests::OrderCreated,
        serializer::{JsonMessageSerializer, MessageRegistry},
    };

    fn serializer() -> Arc<dyn MessageSerializer> {
        Arc::new(JsonMessageSerializer::new(
            MessageRegistry::new().register::<OrderCreated>(),
        ))
    }

    fn configuration() -> RabbitMQConfiguration {
        RabbitMQConfiguration::new()
            .add_consumer(RabbitMQConsumerConfiguration::for_message::<OrderCreated>())
            .add_consumer(
                RabbitMQConsumerConfiguration::for_message::<OrderCreated>()
                    .with_name("order_audit_consumer"),
            )
            .add_producer(RabbitMQProducerConfiguration::for_message::<OrderCreated>())
    }

    #[test]
    fn consumers_are_looked_up_by_name() {
        let connection = Arc::new(RabbitMQConnection::new(RabbitMQConfigs::default()));
        let bus = RabbitMQBus::new(connection, serializer(), configuration()).unwrap();

        assert_eq!(bus.consumers().len(), 2);
        assert!(bus.consumer("order_audit_consumer").is_some());
        assert!(bus.consumer("unknown").is_none());
    }

    #[test]
    fn invalid_configuration_fails_the_bus() {
        let connection = Arc::new(RabbitMQConnection::new(RabbitMQConfigs::default()));
        let configuration =
            configuration().add_consumer(RabbitMQConsumerConfiguration::new("broken", ""));

        assert!(matches!(
            RabbitMQBus::new(connection, serializer(), configuration),
            Err(AmqpError::ConfigurationError(_))
        ));
    }

    #[tokio::test]
    async fn start_fails_without_connection_and_stop_reaches_every_consumer() {
        let connection = Arc::new(RabbitMQConnection::new(RabbitMQConfigs::default()));
        let bus = RabbitMQBus::new(connection, serializer(), configuration()).unwrap();

        assert!(matches!(
            bus.start(CancellationToken::new()).await,
            Err(AmqpError::ChannelError(_))
        ));

        bus.stop().await.unwrap();
        assert!(bus
            .consumers()
            .iter()
            .all(|c| c.status() == ConsumerStatus::Stopped));
    }
}
