// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer and Producer Factories
//!
//! Pure constructors wiring a configuration to the shared connection and
//! serializer. Invalid configurations are rejected here, never at runtime.

use crate::{
    configuration::{RabbitMQConsumerConfiguration, RabbitMQProducerConfiguration},
    connection::RabbitMQConnection,
    consumer::DeliveryProcessor,
    dispatcher::RabbitMQConsumer,
    errors::AmqpError,
    handler::{ConsumedNotification, ProducedNotification},
    publisher::RabbitMQProducer,
    serializer::MessageSerializer,
};
use std::sync::Arc;
use tracing::error;

pub struct ConsumerFactory {
    connection: Arc<RabbitMQConnection>,
    serializer: Arc<dyn MessageSerializer>,
}

impl ConsumerFactory {
    pub fn new(connection: Arc<RabbitMQConnection>, serializer: Arc<dyn MessageSerializer>) -> Self {
        ConsumerFactory {
            connection,
            serializer,
        }
    }

    pub fn create_consumer(
        &self,
        configuration: RabbitMQConsumerConfiguration,
        notifications: Vec<ConsumedNotification>,
    ) -> Result<RabbitMQConsumer, AmqpError> {
        if let Err(err) = configuration.validate(self.serializer.as_ref()) {
            error!(error = err.to_string(), consumer = configuration.name(), "invalid consumer configuration");
            return Err(err);
        }

        let processor = DeliveryProcessor::new(configuration, self.serializer.clone(), notifications);
        Ok(RabbitMQConsumer::new(self.connection.clone(), processor))
    }
}

pub struct ProducerFactory {
    connection: Arc<RabbitMQConnection>,
    serializer: Arc<dyn MessageSerializer>,
}

impl ProducerFactory {
    pub fn new(connection: Arc<RabbitMQConnection>, serializer: Arc<dyn MessageSerializer>) -> Self {
        ProducerFactory {
            connection,
            serializer,
        }
    }

    pub fn create_producer(
        &self,
        configurations: Vec<RabbitMQProducerConfiguration>,
        notifications: Vec<ProducedNotification>,
    ) -> Result<RabbitMQProducer, AmqpError> {
        for cfg in &configurations {
            if let Err(err) = cfg.validate(self.serializer.as_ref()) {
                error!(error = err.to_string(), "invalid producer configuration");
                return Err(err);
            }
        }

        Ok(RabbitMQProducer::new(
            self.connection.clone(),
            self.serializer.clone(),
            configurations,
            notifications,
        ))
    }
}
