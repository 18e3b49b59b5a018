// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! This module owns the physical connection to the RabbitMQ server. A
//! [`RabbitMQConnection`] dials the broker, watches the transport for an
//! unexpected close and, when reconnection is enabled, redials in the
//! background. Every successful reconnect is broadcast to all subscribers so
//! consumers can re-declare their topology and resubscribe.
//!
//! Channels are handed out fresh on every call to [`RabbitMQConnection::channel`];
//! they die with the transport and must not be cached across reconnects.

use crate::{configs::RabbitMQConfigs, errors::AmqpError};
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument, Span};

const RECONNECTED_CAPACITY: usize = 16;

/// A self-healing connection to a RabbitMQ broker.
pub struct RabbitMQConnection {
    cfg: RabbitMQConfigs,
    span: Span,
    transport: RwLock<Option<Arc<Connection>>>,
    is_connected: AtomicBool,
    closed: AtomicBool,
    errors_tx: mpsc::UnboundedSender<String>,
    errors_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    reconnected: broadcast::Sender<()>,
    shutdown: CancellationToken,
}

impl RabbitMQConnection {
    /// Creates a connection manager without dialing the broker.
    pub fn new(cfg: RabbitMQConfigs) -> Self {
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let (reconnected, _) = broadcast::channel(RECONNECTED_CAPACITY);
        let span = info_span!("rabbitmq_connection", name = %cfg.app_name);

        RabbitMQConnection {
            cfg,
            span,
            transport: RwLock::new(None),
            is_connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            errors_tx,
            errors_rx: Mutex::new(Some(errors_rx)),
            reconnected,
            shutdown: CancellationToken::new(),
        }
    }

    /// Replaces the span the reconnect loop logs under.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Dials the broker and starts the reconnect loop when the configuration
    /// asks for it.
    pub async fn establish(self) -> Result<Arc<Self>, AmqpError> {
        let conn = Arc::new(self);
        conn.connect().await?;

        if conn.cfg.reconnecting {
            conn.start_reconnect_loop().await;
        }

        Ok(conn)
    }

    /// Shorthand for `RabbitMQConnection::new(cfg).establish()`.
    pub async fn open(cfg: RabbitMQConfigs) -> Result<Arc<Self>, AmqpError> {
        RabbitMQConnection::new(cfg).establish().await
    }

    /// Dials the broker and installs a one-shot close listener on the new
    /// transport.
    pub async fn connect(&self) -> Result<(), AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::ConnectionError("connection was closed".to_owned()));
        }

        debug!(
            host = %self.cfg.host,
            port = self.cfg.port,
            "creating amqp connection..."
        );
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.cfg.app_name.clone()));

        let conn = match Connection::connect(&self.cfg.uri(), options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;

        let errors = self.errors_tx.clone();
        let fired = AtomicBool::new(false);
        conn.on_error(move |err| {
            if !fired.swap(true, Ordering::SeqCst) {
                let _ = errors.send(err.to_string());
            }
        });

        *self.transport.write().await = Some(Arc::new(conn));
        self.is_connected.store(true, Ordering::SeqCst);
        debug!("amqp connected");

        Ok(())
    }

    /// Spawns the background reconnect loop. Calling it again is a no-op.
    pub async fn start_reconnect_loop(self: &Arc<Self>) {
        let Some(errors) = self.errors_rx.lock().await.take() else {
            return;
        };

        let span = self.span.clone();
        tokio::spawn(self.clone().reconnect_loop(errors).instrument(span));
    }

    async fn reconnect_loop(self: Arc<Self>, mut errors: mpsc::UnboundedReceiver<String>) {
        loop {
            let reason = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                reason = errors.recv() => match reason {
                    Some(reason) => reason,
                    None => return,
                },
            };

            self.is_connected.store(false, Ordering::SeqCst);
            info!(reason = %reason, "rabbitmq connection reconnecting...");

            loop {
                if self.shutdown.is_cancelled() {
                    return;
                }

                match self.connect().await {
                    Ok(()) => break,
                    Err(err) => {
                        error!(error = err.to_string(), "error in reconnecting");
                        tokio::select! {
                            _ = self.shutdown.cancelled() => return,
                            _ = tokio::time::sleep(self.cfg.reconnect_delay()) => {}
                        }
                    }
                }
            }

            info!("rabbitmq connection reconnected");
            self.signal_reconnected();
        }
    }

    /// Wakes every reconnect subscriber. No subscribers is not an error.
    pub(crate) fn signal_reconnected(&self) {
        let _ = self.reconnected.send(());
    }

    #[cfg(test)]
    pub(crate) fn set_connected(&self, connected: bool) {
        self.is_connected.store(connected, Ordering::SeqCst);
    }

    /// Reports a transport failure as if the close listener had fired.
    pub(crate) fn report_transport_error(&self, reason: &str) {
        let _ = self.errors_tx.send(reason.to_owned());
    }

    /// Opens a new channel on the current transport.
    pub async fn channel(&self) -> Result<Channel, AmqpError> {
        let transport = self.transport.read().await.clone();

        let Some(conn) = transport else {
            return Err(AmqpError::ChannelError("no active connection".to_owned()));
        };

        if !conn.status().connected() {
            return Err(AmqpError::ChannelError("connection is closed".to_owned()));
        }

        debug!("creating amqp channel...");
        match conn.create_channel().await {
            Ok(c) => {
                debug!("channel created");
                Ok(c)
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    /// Subscribes to reconnect events. Every subscriber observes every
    /// reconnect that happens after it subscribed.
    pub fn subscribe_reconnected(&self) -> broadcast::Receiver<()> {
        self.reconnected.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn configs(&self) -> &RabbitMQConfigs {
        &self.cfg
    }

    /// Stops the reconnect loop and closes the transport. Only the first call
    /// does anything.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.shutdown.cancel();
        self.is_connected.store(false, Ordering::SeqCst);

        let transport = self.transport.write().await.take();
        if let Some(conn) = transport {
            if conn.status().connected() {
                if let Err(err) = conn.close(200, "closing connection").await {
                    error!(error = err.to_string(), "failure to close the connection");
                    return Err(AmqpError::ConnectionError(err.to_string()));
                }
            }
        }

        debug!("amqp connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn unreachable_configs() -> RabbitMQConfigs {
        RabbitMQConfigs {
            host: "127.0.0.1".to_owned(),
            port: 1,
            reconnect_delay_ms: 10,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn channel_without_transport_fails() {
        let conn = RabbitMQConnection::new(unreachable_configs());

        let err = conn.channel().await.unwrap_err();
        assert!(matches!(err, AmqpError::ChannelError(_)));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn connect_to_unreachable_endpoint_fails() {
        let conn = RabbitMQConnection::new(unreachable_configs());

        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, AmqpError::ConnectionError(_)));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_reconnect() {
        let conn = RabbitMQConnection::new(unreachable_configs());
        let mut first = conn.subscribe_reconnected();
        let mut second = conn.subscribe_reconnected();

        conn.signal_reconnected();
        conn.signal_reconnected();

        for rx in [&mut first, &mut second] {
            assert!(rx.recv().await.is_ok());
            assert!(rx.recv().await.is_ok());
        }
    }

    #[tokio::test]
    async fn transport_error_marks_disconnected_until_close() {
        let conn = Arc::new(RabbitMQConnection::new(unreachable_configs()));
        conn.is_connected.store(true, Ordering::SeqCst);
        conn.start_reconnect_loop().await;

        conn.report_transport_error("connection reset by peer");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!conn.is_connected());

        conn.close().await.unwrap();
        assert!(conn.is_closed());
        // closing twice is harmless
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn connect_after_close_is_rejected() {
        let conn = RabbitMQConnection::new(unreachable_configs());
        conn.close().await.unwrap();

        assert_eq!(
            conn.connect().await.unwrap_err(),
            AmqpError::ConnectionError("connection was closed".to_owned())
        );
    }
}
