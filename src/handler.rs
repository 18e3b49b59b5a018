// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! Business handlers registered on a consumer, plus the callbacks notified once
//! a message has been consumed and acknowledged.

use crate::{errors::AmqpError, message::ConsumeContext, message::Message};
use async_trait::async_trait;
use opentelemetry::Context;
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

/// A business handler for one message type.
///
/// Returning an error makes the consumer retry the invocation and, once the
/// retries are exhausted, negatively acknowledge the delivery.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn handle(&self, ctx: &Context, consume_context: &ConsumeContext)
        -> Result<(), AmqpError>;
}

/// Callback invoked with every message that was handled and acknowledged.
pub type ConsumedNotification = Arc<dyn Fn(&dyn Message) + Send + Sync>;

/// Callback invoked with every message that was published.
pub type ProducedNotification = Arc<dyn Fn(&dyn Message) + Send + Sync>;
