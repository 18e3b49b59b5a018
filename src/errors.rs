// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Bus
//!
//! This module provides the error type shared by every part of the bus: the
//! connection manager, topology declaration, consumers, producers and the
//! factories that assemble them. Connection-level errors are normally owned by
//! the reconnect loop and never reach callers; handler errors end in a nack.

use thiserror::Error;

/// Represents errors that can occur while talking to RabbitMQ or while
/// driving a delivery through the handler pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// The broker endpoint is unreachable, refused the credentials or the
    /// transport was closed
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// A channel could not be opened or is no longer usable
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error registering the consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// The payload could not be turned into a typed message
    #[error("failure to deserialize payload: {0}")]
    DeserializationError(String),

    /// The message could not be turned into wire bytes
    #[error("failure to serialize message: {0}")]
    SerializationError(String),

    /// No deserializer was registered for the given type tag
    #[error("message type `{0}` is not registered")]
    UnregisteredMessageType(String),

    /// A business handler or pipeline behavior failed
    #[error("handler failure: {0}")]
    HandlerError(String),

    /// A handler did not finish within its deadline (milliseconds)
    #[error("handler did not complete within {0}ms")]
    HandlerTimeout(u128),

    /// A consumer or producer configuration is missing required fields
    #[error("invalid configuration: {0}")]
    ConfigurationError(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,
}

impl AmqpError {
    /// Builds a [`AmqpError::HandlerError`] from anything printable.
    pub fn handler<E: std::fmt::Display>(err: E) -> Self {
        AmqpError::HandlerError(err.to_string())
    }

    /// Whether the error belongs to the topology family (declare/bind/qos).
    pub fn is_topology(&self) -> bool {
        matches!(
            self,
            AmqpError::DeclareExchangeError(_)
                | AmqpError::DeclareQueueError(_)
                | AmqpError::BindingExchangeToQueueError(_, _)
                | AmqpError::QoSDeclarationError(_)
                | AmqpError::ConsumerDeclarationError(_)
        )
    }
}
