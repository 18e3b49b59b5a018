// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Inbound Deliveries
//!
//! One wire message received from the broker together with the handle used to
//! acknowledge it. Deliveries only live for one handling cycle.

use crate::errors::AmqpError;
use async_trait::async_trait;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions},
    types::FieldTable,
};
use std::{fmt, sync::Arc};
use tracing::error;

#[cfg(test)]
use mockall::automock;

/// Acknowledges a single delivery.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

#[async_trait]
impl Acknowledger for Acker {
    async fn ack(&self) -> Result<(), AmqpError> {
        match Acker::ack(self, BasicAckOptions { multiple: false }).await {
            Err(err) => {
                error!(error = err.to_string(), "error whiling ack msg");
                Err(AmqpError::AckMessageError)
            }
            _ => Ok(()),
        }
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        match Acker::nack(
            self,
            BasicNackOptions {
                multiple: false,
                requeue,
            },
        )
        .await
        {
            Err(err) => {
                error!(error = err.to_string(), requeue, "error whiling nack msg");
                Err(AmqpError::NackMessageError)
            }
            _ => Ok(()),
        }
    }
}

/// A delivery as seen by the consumer.
#[derive(Clone)]
pub struct InboundDelivery {
    pub exchange: String,
    pub routing_key: String,
    pub content_type: String,
    /// The AMQP `type` property, used as the message type discriminator.
    pub kind: String,
    pub headers: Option<FieldTable>,
    pub message_id: String,
    pub correlation_id: String,
    pub timestamp: Option<u64>,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub data: Vec<u8>,
    pub(crate) acker: Arc<dyn Acknowledger>,
}

impl fmt::Debug for InboundDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundDelivery")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("kind", &self.kind)
            .field("message_id", &self.message_id)
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("len", &self.data.len())
            .finish_non_exhaustive()
    }
}

impl InboundDelivery {
    pub fn new(delivery_tag: u64, kind: &str, data: Vec<u8>, acker: Arc<dyn Acknowledger>) -> Self {
        InboundDelivery {
            exchange: String::new(),
            routing_key: String::new(),
            content_type: String::new(),
            kind: kind.to_owned(),
            headers: None,
            message_id: String::new(),
            correlation_id: String::new(),
            timestamp: None,
            delivery_tag,
            redelivered: false,
            data,
            acker,
        }
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_owned();
        self
    }

    pub fn with_headers(mut self, headers: FieldTable) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn with_message_id(mut self, message_id: &str) -> Self {
        self.message_id = message_id.to_owned();
        self
    }

    pub fn with_routing_key(mut self, routing_key: &str) -> Self {
        self.routing_key = routing_key.to_owned();
        self
    }

    pub fn acker(&self) -> &Arc<dyn Acknowledger> {
        &self.acker
    }
}

fn short_string(value: &Option<lapin::types::ShortString>) -> String {
    value
        .as_ref()
        .map(|v| v.as_str().to_owned())
        .unwrap_or_default()
}

impl From<Delivery> for InboundDelivery {
    fn from(delivery: Delivery) -> Self {
        let props = &delivery.properties;

        InboundDelivery {
            exchange: delivery.exchange.as_str().to_owned(),
            routing_key: delivery.routing_key.as_str().to_owned(),
            content_type: short_string(props.content_type()),
            kind: short_string(props.kind()),
            headers: props.headers().clone(),
            message_id: short_string(props.message_id()),
            correlation_id: short_string(props.correlation_id()),
            timestamp: *props.timestamp(),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            data: delivery.data,
            acker: Arc::new(delivery.acker),
        }
    }
}
