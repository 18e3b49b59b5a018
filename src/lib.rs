// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;
mod otel;

pub mod bus;
pub mod configs;
pub mod configuration;
pub mod connection;
pub mod delivery;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod factory;
pub mod handler;
pub mod health;
pub mod message;
pub mod pipeline;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod serializer;
pub mod topology;
