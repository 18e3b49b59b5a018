// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module resolves and declares the topology a consumer depends on: one
//! exchange, one queue and the binding between them.
//!
//! Names that are not configured explicitly are derived from the message type
//! discriminator converted to snake_case:
//! - exchange: `{type}`
//! - queue: `{type}_queue`
//! - routing key: `{type}`
//!
//! Declarations are "create if missing", so installing the same topology again
//! after a reconnect is harmless. A failed step does not roll back the steps
//! that already succeeded.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel,
};
use tracing::{debug, error};

/// Suffix appended to the message type to build the default queue name.
pub const QUEUE_SUFFIX: &str = "_queue";

/// Converts a type discriminator (`orderCreated`, `OrderCreatedV1`) to snake_case.
pub fn to_snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);

    for (i, c) in chars.iter().enumerate() {
        if matches!(c, '-' | '.' | ' ' | '_') {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
            continue;
        }

        if c.is_uppercase() {
            let prev = i.checked_sub(1).map(|p| chars[p]);
            let next = chars.get(i + 1);
            let boundary = match prev {
                Some(p) if p.is_lowercase() || p.is_ascii_digit() => true,
                Some(p) if p.is_uppercase() => next.is_some_and(|n| n.is_lowercase()),
                _ => false,
            };

            if boundary && !out.ends_with('_') {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(*c);
        }
    }

    out
}

/// Default exchange name for a message type.
pub fn exchange_name(message_type: &str) -> String {
    to_snake_case(message_type)
}

/// Default queue name for a message type.
pub fn queue_name(message_type: &str) -> String {
    format!("{}{}", to_snake_case(message_type), QUEUE_SUFFIX)
}

/// Default routing key for a message type.
pub fn routing_key(message_type: &str) -> String {
    to_snake_case(message_type)
}

/// The resolved names of a consumer topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyNames {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl TopologyNames {
    /// Resolves every name from the message type.
    pub fn for_message_type(message_type: &str) -> Self {
        TopologyNames {
            exchange: exchange_name(message_type),
            queue: queue_name(message_type),
            routing_key: routing_key(message_type),
        }
    }

    /// Resolves the names of a configured topology. Non-empty configured names
    /// win over the defaults of the message type.
    pub fn resolve(
        message_type: &str,
        exchange: &ExchangeDefinition,
        queue: &QueueDefinition,
        binding: &QueueBinding,
    ) -> Self {
        let defaults = TopologyNames::for_message_type(message_type);

        TopologyNames {
            exchange: pick(&exchange.name, defaults.exchange),
            queue: pick(&queue.name, defaults.queue),
            routing_key: pick(&binding.routing_key, defaults.routing_key),
        }
    }
}

fn pick(configured: &str, default: String) -> String {
    if configured.is_empty() {
        default
    } else {
        configured.to_owned()
    }
}

/// Declares exchanges, queues and bindings on one channel.
pub(crate) struct AmqpTopology<'tp> {
    channel: &'tp Channel,
    no_wait: bool,
}

impl<'tp> AmqpTopology<'tp> {
    pub(crate) fn new(channel: &'tp Channel, no_wait: bool) -> AmqpTopology<'tp> {
        AmqpTopology { channel, no_wait }
    }

    /// Declares the exchange, the queue and binds them, in that order.
    pub(crate) async fn install(
        &self,
        names: &TopologyNames,
        exchange: &ExchangeDefinition,
        queue: &QueueDefinition,
        binding: &QueueBinding,
    ) -> Result<(), AmqpError> {
        self.declare_exchange(&names.exchange, exchange).await?;
        self.declare_queue(&names.queue, queue).await?;
        self.bind_queue(names, binding).await
    }

    pub(crate) async fn declare_exchange(
        &self,
        name: &str,
        def: &ExchangeDefinition,
    ) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", name);

        match self
            .channel
            .exchange_declare(
                name,
                def.kind.clone().try_into()?,
                ExchangeDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: self.no_wait,
                },
                FieldTable::from(def.params.clone()),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(name.to_owned()))
            }
            _ => {
                debug!("exchange: {} was created", name);
                Ok(())
            }
        }
    }

    pub(crate) async fn declare_queue(
        &self,
        name: &str,
        def: &QueueDefinition,
    ) -> Result<(), AmqpError> {
        debug!("creating queue: {}", name);

        match self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: self.no_wait,
                },
                FieldTable::from(def.arguments()),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(name.to_owned()))
            }
            _ => {
                debug!("queue: {} was created", name);
                Ok(())
            }
        }
    }

    pub(crate) async fn bind_queue(
        &self,
        names: &TopologyNames,
        binding: &QueueBinding,
    ) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            names.queue, names.exchange, names.routing_key
        );

        match self
            .channel
            .queue_bind(
                &names.queue,
                &names.exchange,
                &names.routing_key,
                QueueBindOptions {
                    nowait: self.no_wait,
                },
                FieldTable::from(binding.params.clone()),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    names.exchange.clone(),
                    names.queue.clone(),
                ))
            }
            _ => {
                debug!("queue was bounded");
                Ok(())
            }
        }
    }
}
