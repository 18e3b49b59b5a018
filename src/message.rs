// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Model
//!
//! Typed messages, the metadata that travels with them as AMQP headers and the
//! [`ConsumeContext`] handed to every handler.
//!
//! Message types are identified by a stable string discriminator
//! ([`MessageType::NAME`]) instead of runtime type names. The discriminator is
//! written to the AMQP `type` property on publish and used to pick the
//! deserializer on consume.

use lapin::types::{
    AMQPValue, FieldTable, LongInt, LongLongInt, LongString, LongUInt, ShortInt, ShortString,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    any::Any,
    collections::{BTreeMap, HashMap},
    fmt::Debug,
    sync::Arc,
};

/// Header key used to carry the correlation id in metadata.
pub const CORRELATION_ID_HEADER: &str = "correlation_id";

/// A concrete message type that can travel over the bus.
pub trait MessageType: Serialize + DeserializeOwned + Debug + Send + Sync + 'static {
    /// Stable discriminator of the type. Topology names are derived from it.
    const NAME: &'static str;

    fn message_id(&self) -> &str;
}

/// Object-safe view over any [`MessageType`].
pub trait Message: Debug + Send + Sync + 'static {
    fn id(&self) -> &str;

    fn name(&self) -> &'static str;

    fn to_json(&self) -> Result<Vec<u8>, serde_json::Error>;

    fn as_any(&self) -> &dyn Any;
}

impl<T: MessageType> Message for T {
    fn id(&self) -> &str {
        MessageType::message_id(self)
    }

    fn name(&self) -> &'static str {
        T::NAME
    }

    fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl dyn Message {
    pub fn downcast_ref<T: MessageType>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// Values that can be stored in message metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValues {
    ShortString(String),
    LongString(String),
    Bool(bool),
    Int(i16),
    LongInt(i32),
    LongLongInt(i64),
    Uint(u16),
    LongUint(u32),
    LongLongUint(u64),
}

impl HeaderValues {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValues::ShortString(v) | HeaderValues::LongString(v) => Some(v),
            _ => None,
        }
    }

    fn to_amqp(&self) -> AMQPValue {
        match self.clone() {
            HeaderValues::ShortString(v) => AMQPValue::ShortString(ShortString::from(v)),
            HeaderValues::LongString(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValues::Bool(v) => AMQPValue::Boolean(v),
            HeaderValues::Int(v) => AMQPValue::ShortInt(ShortInt::from(v)),
            HeaderValues::LongInt(v) => AMQPValue::LongInt(LongInt::from(v)),
            HeaderValues::LongLongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(v)),
            HeaderValues::Uint(v) => AMQPValue::ShortUInt(v),
            HeaderValues::LongUint(v) => AMQPValue::LongUInt(LongUInt::from(v)),
            // AMQP 0-9-1 has no unsigned 64 bit field, timestamps are u64
            HeaderValues::LongLongUint(v) => AMQPValue::Timestamp(v),
        }
    }

    fn from_amqp(value: &AMQPValue) -> Option<HeaderValues> {
        match value {
            AMQPValue::ShortString(v) => Some(HeaderValues::ShortString(v.as_str().to_owned())),
            AMQPValue::LongString(v) => Some(HeaderValues::LongString(
                String::from_utf8_lossy(v.as_bytes()).into_owned(),
            )),
            AMQPValue::Boolean(v) => Some(HeaderValues::Bool(*v)),
            AMQPValue::ShortShortInt(v) => Some(HeaderValues::Int(i16::from(*v))),
            AMQPValue::ShortInt(v) => Some(HeaderValues::Int(*v)),
            AMQPValue::LongInt(v) => Some(HeaderValues::LongInt(*v)),
            AMQPValue::LongLongInt(v) => Some(HeaderValues::LongLongInt(*v)),
            AMQPValue::ShortShortUInt(v) => Some(HeaderValues::Uint(u16::from(*v))),
            AMQPValue::ShortUInt(v) => Some(HeaderValues::Uint(*v)),
            AMQPValue::LongUInt(v) => Some(HeaderValues::LongUint(*v)),
            AMQPValue::Timestamp(v) => Some(HeaderValues::LongLongUint(*v)),
            _ => None,
        }
    }
}

impl From<&str> for HeaderValues {
    fn from(value: &str) -> Self {
        HeaderValues::LongString(value.to_owned())
    }
}

impl From<String> for HeaderValues {
    fn from(value: String) -> Self {
        HeaderValues::LongString(value)
    }
}

/// Key/value metadata carried as AMQP headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata(HashMap<String, HeaderValues>);

impl Metadata {
    pub fn new() -> Self {
        Metadata::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<HeaderValues>) -> Self {
        self.0.insert(key.to_owned(), value.into());
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<HeaderValues>) {
        self.0.insert(key.to_owned(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&HeaderValues> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(HeaderValues::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Reads headers of a delivery. Header kinds without a [`HeaderValues`]
    /// counterpart (tables, arrays, floats) are skipped.
    pub fn from_field_table(table: &FieldTable) -> Self {
        let values = table
            .inner()
            .iter()
            .filter_map(|(key, value)| {
                HeaderValues::from_amqp(value).map(|v| (key.as_str().to_owned(), v))
            })
            .collect();

        Metadata(values)
    }

    /// Writes the metadata into an AMQP header map.
    pub fn write_headers(&self, headers: &mut BTreeMap<ShortString, AMQPValue>) {
        for (key, value) in &self.0 {
            headers.insert(ShortString::from(key.clone()), value.to_amqp());
        }
    }
}

/// A deserialized delivery together with its envelope data.
#[derive(Debug, Clone)]
pub struct ConsumeContext {
    message: Arc<dyn Message>,
    metadata: Metadata,
    content_type: String,
    message_type: String,
    timestamp: Option<u64>,
    delivery_tag: u64,
    message_id: String,
    correlation_id: String,
}

impl ConsumeContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        message: Arc<dyn Message>,
        metadata: Metadata,
        content_type: &str,
        message_type: &str,
        timestamp: Option<u64>,
        delivery_tag: u64,
        message_id: &str,
        correlation_id: &str,
    ) -> Self {
        ConsumeContext {
            message,
            metadata,
            content_type: content_type.to_owned(),
            message_type: message_type.to_owned(),
            timestamp,
            delivery_tag,
            message_id: message_id.to_owned(),
            correlation_id: correlation_id.to_owned(),
        }
    }

    pub fn message(&self) -> &Arc<dyn Message> {
        &self.message
    }

    /// The message as its concrete type, if it is a `T`.
    pub fn message_as<T: MessageType>(&self) -> Option<&T> {
        self.message.downcast_ref::<T>()
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn timestamp(&self) -> Option<u64> {
        self.timestamp
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub(crate) struct OrderCreated {
        pub id: String,
        pub amount: u64,
    }

    impl MessageType for OrderCreated {
        const NAME: &'static str = "orderCreated";

        fn message_id(&self) -> &str {
            &self.id
        }
    }

    pub(crate) fn order_context(id: &str) -> ConsumeContext {
        ConsumeContext::new(
            Arc::new(OrderCreated {
                id: id.to_owned(),
                amount: 1,
            }),
            Metadata::new(),
            "application/json",
            OrderCreated::NAME,
            None,
            1,
            id,
            "corr-1",
        )
    }

    #[test]
    fn dyn_message_downcasts_to_its_type() {
        let msg: Arc<dyn Message> = Arc::new(OrderCreated {
            id: "1".into(),
            amount: 10,
        });

        assert_eq!(msg.name(), "orderCreated");
        assert_eq!(msg.id(), "1");
        assert_eq!(msg.downcast_ref::<OrderCreated>().map(|m| m.amount), Some(10));
    }

    #[test]
    fn metadata_survives_header_tables() {
        let meta = Metadata::new()
            .with(CORRELATION_ID_HEADER, "abc")
            .with("retries", HeaderValues::LongInt(2))
            .with("replayed", HeaderValues::Bool(true));

        let mut headers = BTreeMap::new();
        meta.write_headers(&mut headers);
        headers.insert(
            ShortString::from("x-death"),
            AMQPValue::FieldTable(FieldTable::default()),
        );

        let read = Metadata::from_field_table(&FieldTable::from(headers));
        assert_eq!(read, meta);
        assert_eq!(read.get_str(CORRELATION_ID_HEADER), Some("abc"));
    }
}
