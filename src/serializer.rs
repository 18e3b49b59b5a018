// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Serialization
//!
//! Turns messages into wire bytes and back. Deserialization goes through an
//! explicit [`MessageRegistry`] filled at startup, mapping each type
//! discriminator to the typed deserializer of that message.

use crate::{
    errors::AmqpError,
    message::{Message, MessageType},
};
use std::{collections::HashMap, fmt, sync::Arc};
use tracing::error;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

type DeserializeFn = fn(&[u8]) -> Result<Arc<dyn Message>, serde_json::Error>;

fn deserialize_json<T: MessageType>(data: &[u8]) -> Result<Arc<dyn Message>, serde_json::Error> {
    let msg: T = serde_json::from_slice(data)?;
    Ok(Arc::new(msg))
}

/// Maps type discriminators to typed deserializers.
#[derive(Clone, Default)]
pub struct MessageRegistry {
    deserializers: HashMap<&'static str, DeserializeFn>,
}

impl fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.deserializers.keys()).finish()
    }
}

impl MessageRegistry {
    pub fn new() -> Self {
        MessageRegistry::default()
    }

    /// Registers `T` under [`MessageType::NAME`].
    pub fn register<T: MessageType>(mut self) -> Self {
        self.deserializers.insert(T::NAME, deserialize_json::<T>);
        self
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.deserializers.contains_key(type_name)
    }

    fn get(&self, type_name: &str) -> Option<&DeserializeFn> {
        self.deserializers.get(type_name)
    }
}

/// The bytes of a serialized message and the content type they are encoded with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializationResult {
    pub data: Vec<u8>,
    pub content_type: String,
}

/// Capability used by consumers and producers to (de)serialize payloads.
pub trait MessageSerializer: Send + Sync {
    fn serialize(&self, message: &dyn Message) -> Result<SerializationResult, AmqpError>;

    fn deserialize(
        &self,
        data: &[u8],
        type_name: &str,
        content_type: &str,
    ) -> Result<Arc<dyn Message>, AmqpError>;

    /// Whether a deserializer exists for the type discriminator.
    fn is_registered(&self, type_name: &str) -> bool;

    fn content_type(&self) -> &str;
}

/// JSON serializer backed by a [`MessageRegistry`].
#[derive(Debug, Clone, Default)]
pub struct JsonMessageSerializer {
    registry: MessageRegistry,
}

impl JsonMessageSerializer {
    pub fn new(registry: MessageRegistry) -> Self {
        JsonMessageSerializer { registry }
    }
}

impl MessageSerializer for JsonMessageSerializer {
    fn serialize(&self, message: &dyn Message) -> Result<SerializationResult, AmqpError> {
        let data = message.to_json().map_err(|err| {
            error!(error = err.to_string(), kind = message.name(), "failure to serialize");
            AmqpError::SerializationError(err.to_string())
        })?;

        Ok(SerializationResult {
            data,
            content_type: JSON_CONTENT_TYPE.to_owned(),
        })
    }

    fn deserialize(
        &self,
        data: &[u8],
        type_name: &str,
        content_type: &str,
    ) -> Result<Arc<dyn Message>, AmqpError> {
        let content_type = if content_type.is_empty() {
            JSON_CONTENT_TYPE
        } else {
            content_type
        };

        if content_type != JSON_CONTENT_TYPE {
            return Err(AmqpError::DeserializationError(format!(
                "unsupported content type `{content_type}`"
            )));
        }

        if data.is_empty() {
            return Err(AmqpError::DeserializationError(
                "message body is empty".to_owned(),
            ));
        }

        let Some(deserialize) = self.registry.get(type_name) else {
            return Err(AmqpError::UnregisteredMessageType(type_name.to_owned()));
        };

        deserialize(data).map_err(|err| {
            AmqpError::DeserializationError(format!("type `{type_name}`: {err}"))
        })
    }

    fn is_registered(&self, type_name: &str) -> bool {
        self.registry.contains(type_name)
    }

    fn content_type(&self) -> &str {
        JSON_CONTENT_TYPE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::tests::OrderCreated;

    fn serializer() -> JsonMessageSerializer {
        JsonMessageSerializer::new(MessageRegistry::new().register::<OrderCreated>())
    }

    #[test]
    fn registered_type_is_deserialized_to_its_concrete_type() {
        let msg = serializer()
            .deserialize(br#"{"id":"o-1","amount":42}"#, "orderCreated", "")
            .unwrap();

        let order = msg.downcast_ref::<OrderCreated>().unwrap();
        assert_eq!(order.amount, 42);
    }

    #[test]
    fn unknown_type_tag_is_rejected() {
        let err = serializer()
            .deserialize(b"{}", "orderShipped", JSON_CONTENT_TYPE)
            .unwrap_err();
        assert_eq!(err, AmqpError::UnregisteredMessageType("orderShipped".into()));
    }

    #[test]
    fn malformed_payloads_fail_deserialization() {
        let s = serializer();

        assert!(matches!(
            s.deserialize(b"", "orderCreated", JSON_CONTENT_TYPE),
            Err(AmqpError::DeserializationError(_))
        ));
        assert!(matches!(
            s.deserialize(b"not json", "orderCreated", JSON_CONTENT_TYPE),
            Err(AmqpError::DeserializationError(_))
        ));
        assert!(matches!(
            s.deserialize(b"{}", "orderCreated", "application/xml"),
            Err(AmqpError::DeserializationError(_))
        ));
    }

    #[test]
    fn serialize_reports_json_content_type() {
        let order = OrderCreated {
            id: "o-2".into(),
            amount: 7,
        };
        let out = serializer().serialize(&order).unwrap();

        assert_eq!(out.content_type, JSON_CONTENT_TYPE);
        assert_eq!(out.data, br#"{"id":"o-2","amount":7}"#.to_vec());
        assert!(serializer().is_registered("orderCreated"));
    }
}
