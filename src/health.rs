// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Health
//!
//! A [`HealthChecker`] reporting whether the shared broker connection is up,
//! for the readiness probes of the hosting application.

use crate::{connection::RabbitMQConnection, errors::AmqpError};
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn check_health(&self) -> Result<(), AmqpError>;

    fn name(&self) -> &str;
}

/// Reports the broker connection as healthy while it is connected.
pub struct RabbitMQHealthChecker {
    connection: Arc<RabbitMQConnection>,
}

impl RabbitMQHealthChecker {
    pub fn new(connection: Arc<RabbitMQConnection>) -> Self {
        RabbitMQHealthChecker { connection }
    }
}

#[async_trait]
impl HealthChecker for RabbitMQHealthChecker {
    async fn check_health(&self) -> Result<(), AmqpError> {
        if self.connection.is_connected() {
            Ok(())
        } else {
            Err(AmqpError::ConnectionError(
                "rabbitmq is not connected".to_owned(),
            ))
        }
    }

    fn name(&self) -> &str {
        "rabbitmq"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::RabbitMQConfigs;

    #[tokio::test]
    async fn disconnected_broker_is_unhealthy() {
        let checker =
            RabbitMQHealthChecker::new(Arc::new(RabbitMQConnection::new(RabbitMQConfigs::default())));

        assert_eq!(checker.name(), "rabbitmq");
        assert!(matches!(
            checker.check_health().await,
            Err(AmqpError::ConnectionError(_))
        ));
    }
}
