// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! This module provides integration with OpenTelemetry for distributed tracing.
//! It includes utilities for propagating trace context through RabbitMQ message headers,
//! extracting context from incoming messages, and creating trace spans for message
//! processing and publishing.

use crate::errors::AmqpError;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use opentelemetry::{
    global::{self, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{Span, SpanKind, Status, TraceContextExt, Tracer},
    Context, KeyValue,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

pub const MESSAGING_SYSTEM: &str = "rabbitmq";

const ATTR_SYSTEM: &str = "messaging.system";
const ATTR_DESTINATION_KIND: &str = "messaging.destination.kind";
const ATTR_DESTINATION_NAME: &str = "messaging.destination.name";
const ATTR_ROUTING_KEY: &str = "messaging.rabbitmq.destination.routing_key";
const ATTR_MESSAGE_ID: &str = "messaging.message.id";

/// Writes trace context into outgoing RabbitMQ headers.
pub(crate) struct HeaderInjector<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> HeaderInjector<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

/// Reads trace context from the headers of a delivery.
pub(crate) struct HeaderExtractor<'a> {
    headers: &'a BTreeMap<ShortString, AMQPValue>,
}

impl<'a> HeaderExtractor<'a> {
    pub(crate) fn new(headers: &'a BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| match header_value {
            AMQPValue::LongString(header_value) => std::str::from_utf8(header_value.as_bytes())
                .map_err(|e| error!("Error decoding header value {:?}", e))
                .ok(),
            AMQPValue::ShortString(header_value) => Some(header_value.as_str()),
            _ => None,
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Span attributes of a consumed delivery.
#[derive(Debug, Clone, Default)]
pub(crate) struct ConsumerTracingOptions<'a> {
    pub(crate) destination: &'a str,
    pub(crate) routing_key: &'a str,
    pub(crate) message_id: &'a str,
}

/// Starts a consumer span whose parent is the context found in the delivery
/// headers. The returned context carries the span.
pub(crate) fn new_consumer_span(
    headers: Option<&FieldTable>,
    tracer: &BoxedTracer,
    name: &str,
    options: &ConsumerTracingOptions<'_>,
) -> Context {
    let empty = BTreeMap::new();
    let headers = headers.map(|h| h.inner()).unwrap_or(&empty);

    let parent = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor::new(headers))
    });

    let span = tracer
        .span_builder(Cow::from(format!("{} receive", name)))
        .with_kind(SpanKind::Consumer)
        .with_attributes(vec![
            KeyValue::new(ATTR_SYSTEM, MESSAGING_SYSTEM),
            KeyValue::new(ATTR_DESTINATION_KIND, "queue"),
            KeyValue::new(ATTR_DESTINATION_NAME, options.destination.to_owned()),
            KeyValue::new(ATTR_ROUTING_KEY, options.routing_key.to_owned()),
            KeyValue::new(ATTR_MESSAGE_ID, options.message_id.to_owned()),
        ])
        .start_with_context(tracer, &parent);

    parent.with_span(span)
}

/// Starts a producer span as a child of `ctx`.
pub(crate) fn new_producer_span(
    ctx: &Context,
    tracer: &BoxedTracer,
    exchange: &str,
    routing_key: &str,
) -> Context {
    let span = tracer
        .span_builder(Cow::from(format!("{} publish", exchange)))
        .with_kind(SpanKind::Producer)
        .with_attributes(vec![
            KeyValue::new(ATTR_SYSTEM, MESSAGING_SYSTEM),
            KeyValue::new(ATTR_DESTINATION_KIND, "exchange"),
            KeyValue::new(ATTR_DESTINATION_NAME, exchange.to_owned()),
            KeyValue::new(ATTR_ROUTING_KEY, routing_key.to_owned()),
        ])
        .start_with_context(tracer, ctx);

    ctx.with_span(span)
}

/// Injects the trace context of `ctx` into outgoing headers.
pub(crate) fn inject_context(ctx: &Context, headers: &mut BTreeMap<ShortString, AMQPValue>) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderInjector::new(headers))
    });
}

/// Records the outcome on the span carried by `cx` and ends it.
pub(crate) fn finish_span(cx: &Context, err: Option<&AmqpError>) {
    let span = cx.span();

    match err {
        Some(err) => {
            span.record_error(err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });
        }
        None => span.set_status(Status::Ok),
    }

    span.end();
}

/// Starts a span for one handler invocation under the span carried by `cx`.
pub(crate) fn new_handler_span(cx: &Context, tracer: &BoxedTracer, name: &str) -> Context {
    let mut span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Internal)
        .start_with_context(tracer, cx);
    span.set_attribute(KeyValue::new(ATTR_SYSTEM, MESSAGING_SYSTEM));

    cx.with_span(span)
}
