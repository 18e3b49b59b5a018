// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Pipelines
//!
//! Pipeline behaviors are cross-cutting steps wrapped around every business
//! handler invocation. Each behavior receives a continuation standing for
//! "everything after me" and may call it or short-circuit.
//!
//! Behaviors are composed right to left, so the first registered behavior is
//! the outermost wrapper: with behaviors `[A, B]` and handler `H` the call
//! order is `A -> B -> H`. The chain is rebuilt for every invocation so no
//! state leaks between deliveries.

use crate::{
    errors::AmqpError,
    handler::ConsumerHandler,
    message::ConsumeContext,
    otel,
};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use opentelemetry::{
    global::{self, BoxedTracer},
    Context,
};
use std::{sync::Arc, time::Instant};
use tracing::{info, warn};

/// The continuation handed to a pipeline behavior.
pub type ConsumerHandlerFn<'a> =
    Box<dyn FnOnce(Context) -> BoxFuture<'a, Result<(), AmqpError>> + Send + 'a>;

/// A cross-cutting behavior around message handling.
#[async_trait]
pub trait ConsumerPipeline: Send + Sync {
    async fn handle(
        &self,
        ctx: Context,
        consume_context: &ConsumeContext,
        next: ConsumerHandlerFn<'_>,
    ) -> Result<(), AmqpError>;
}

/// Wraps `handler` in `pipelines`, the first pipeline being the outermost.
pub(crate) fn compose<'a>(
    pipelines: &'a [Arc<dyn ConsumerPipeline>],
    handler: &'a Arc<dyn ConsumerHandler>,
    consume_context: &'a ConsumeContext,
) -> ConsumerHandlerFn<'a> {
    let last: ConsumerHandlerFn<'a> = Box::new(
        move |ctx: Context| -> BoxFuture<'a, Result<(), AmqpError>> {
            Box::pin(async move { handler.handle(&ctx, consume_context).await })
        },
    );

    pipelines
        .iter()
        .rev()
        .fold(last, |next, pipe| -> ConsumerHandlerFn<'a> {
            Box::new(
                move |ctx: Context| -> BoxFuture<'a, Result<(), AmqpError>> {
                    pipe.handle(ctx, consume_context, next)
                },
            )
        })
}

/// Opens a child span around everything that runs after it.
pub struct OtelTracingPipeline {
    tracer: BoxedTracer,
}

impl OtelTracingPipeline {
    pub fn new() -> Arc<Self> {
        Arc::new(OtelTracingPipeline {
            tracer: global::tracer("amqp consumer pipeline"),
        })
    }
}

#[async_trait]
impl ConsumerPipeline for OtelTracingPipeline {
    async fn handle(
        &self,
        ctx: Context,
        consume_context: &ConsumeContext,
        next: ConsumerHandlerFn<'_>,
    ) -> Result<(), AmqpError> {
        let name = format!("{} handle", consume_context.message_type());
        let cx = otel::new_handler_span(&ctx, &self.tracer, &name);

        let result = next(cx.clone()).await;
        otel::finish_span(&cx, result.as_ref().err());

        result
    }
}

/// Logs every handled message with the time it took.
#[derive(Debug, Default)]
pub struct LoggingPipeline;

impl LoggingPipeline {
    pub fn new() -> Arc<Self> {
        Arc::new(LoggingPipeline)
    }
}

#[async_trait]
impl ConsumerPipeline for LoggingPipeline {
    async fn handle(
        &self,
        ctx: Context,
        consume_context: &ConsumeContext,
        next: ConsumerHandlerFn<'_>,
    ) -> Result<(), AmqpError> {
        let started = Instant::now();
        info!(
            message_type = consume_context.message_type(),
            message_id = consume_context.message_id(),
            "handling message"
        );

        let result = next(ctx).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(()) => info!(elapsed_ms, "message handled successfully"),
            Err(err) => warn!(error = err.to_string(), elapsed_ms, "message handling failed"),
        }

        result
    }
}
