//! NATS-backed [`MessageBus`] implementation.
//!
//! The original SDK speaks MQTT directly; this crate treats the bus as an
//! abstract topic-addressed pub/sub transport (spec §4.2) and grounds the
//! concrete client on `async-nats`, the way
//! `examples/TheCowboyAI-cim-network/src/adapters/nats/mod.rs` grounds its
//! event store adapter on the same crate. Route-table replay on reconnect
//! plays the role of the original's `onConnect` resubscribe loop.
//!
//! NATS subjects are `.`-tokenized with `*`/`>` wildcards, not `/`+`#`; every
//! publish/subscribe crosses [`to_nats_subject`]/[`from_nats_subject`] at
//! this adapter's boundary so the rest of the crate can stay on its own
//! topic grammar.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_nats::Client;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use super::{Handler, MessageBus, RouteTable};
use crate::config::MessageBusConfig;
use crate::envelope::Envelope;
use crate::error::DriverError;
use crate::topic::{TOPIC_SEP, WILDCARD};

/// Translate this SDK's `/`-separated topic grammar (spec §4.1) into a real
/// NATS subject: NATS tokenizes on `.` and reserves `*`/`>` as wildcards,
/// treating `/` and `#` as ordinary literal characters, so a pattern like
/// `v1/DATA/#/#/soft_read_req/#` would otherwise never match anything this
/// crate actually publishes. Every interior `#` segment (this crate's only
/// wildcard shape, always a single token) maps onto NATS's single-token `*`.
fn to_nats_subject(topic: &str) -> String {
    topic
        .split(TOPIC_SEP)
        .map(|segment| if segment == WILDCARD { "*" } else { segment })
        .collect::<Vec<_>>()
        .join(".")
}

/// The inverse of [`to_nats_subject`] for inbound message subjects. Those
/// are always fully concrete (a bus transport only ever delivers a
/// published, wildcard-free subject), so no `*` -> `#` reconstruction is
/// needed.
fn from_nats_subject(subject: &str) -> String {
    subject.split('.').collect::<Vec<_>>().join(&TOPIC_SEP.to_string())
}

/// A `NATS`-backed message bus client.
///
/// `qos` and `clean_session` in [`MessageBusConfig`] are carried for parity
/// with the original's MQTT-shaped configuration surface but have no effect
/// here: NATS core delivery is at-most-once regardless, and there is no
/// persistent-session concept to clean.
pub struct NatsMessageBus {
    client: RwLock<Option<Client>>,
    url: String,
    connect_timeout: Duration,
    call_timeout: Duration,
    routes: RouteTable,
    subscriptions: RwLock<HashMap<String, JoinHandle<()>>>,
}

impl NatsMessageBus {
    pub fn new(config: &MessageBusConfig) -> Self {
        Self {
            client: RwLock::new(None),
            url: format!("{}://{}:{}", config.protocol, config.host, config.port),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            call_timeout: Duration::from_millis(config.timeout_ms),
            routes: RouteTable::new(),
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    /// The timeout [`MessageBus::call`] should be invoked with by default,
    /// per this bus's configuration.
    pub fn default_call_timeout(&self) -> Duration {
        self.call_timeout
    }

    async fn client(&self) -> Result<Client, DriverError> {
        self.client
            .read()
            .await
            .clone()
            .ok_or_else(|| DriverError::Unreachable("message bus is not connected".to_string()))
    }

    /// Spawn a task that streams inbound messages for `pattern` into
    /// `handler`, parsing each into an [`Envelope`] and dropping any
    /// message that fails to parse (a malformed or foreign-subject
    /// message should never take the driver down).
    async fn spawn_subscription(
        &self,
        client: &Client,
        pattern: String,
        handler: Handler,
    ) -> Result<(), DriverError> {
        let mut subscriber = client
            .subscribe(to_nats_subject(&pattern))
            .await
            .map_err(|e| DriverError::Bus(e.to_string()))?;

        let task = tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                let topic = from_nats_subject(&message.subject);
                match Envelope::parse(&topic, &message.payload) {
                    Ok(envelope) => handler(envelope),
                    Err(err) => {
                        tracing::warn!(subject = %message.subject, error = %err, "dropping unparseable message");
                    }
                }
            }
        });

        self.subscriptions.write().await.insert(pattern, task);
        Ok(())
    }
}

#[async_trait]
impl MessageBus for NatsMessageBus {
    async fn is_connected(&self) -> bool {
        self.client.read().await.is_some()
    }

    async fn connect(&self) -> Result<(), DriverError> {
        if self.is_connected().await {
            return Ok(());
        }

        let client = tokio::time::timeout(
            self.connect_timeout,
            async_nats::connect(&self.url),
        )
        .await
        .map_err(|_| DriverError::Timeout(self.connect_timeout))?
        .map_err(|e| DriverError::Bus(e.to_string()))?;

        tracing::info!(url = %self.url, "connected to the message bus");
        *self.client.write().await = Some(client.clone());

        for (pattern, handler) in self.routes.snapshot().await {
            if let Err(err) = self.spawn_subscription(&client, pattern.clone(), handler).await {
                tracing::error!(pattern = %pattern, error = %err, "failed to resubscribe after reconnect");
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DriverError> {
        let mut subscriptions = self.subscriptions.write().await;
        for (_, task) in subscriptions.drain() {
            task.abort();
        }
        drop(subscriptions);

        if let Some(client) = self.client.write().await.take() {
            client.drain().await.map_err(|e| DriverError::Bus(e.to_string()))?;
        }
        Ok(())
    }

    async fn publish(&self, envelope: &Envelope) -> Result<(), DriverError> {
        let message = envelope.to_message()?;
        let client = self.client().await?;
        client
            .publish(to_nats_subject(&message.subject), message.payload)
            .await
            .map_err(|e| DriverError::Bus(e.to_string()))
    }

    async fn subscribe(&self, patterns: &[String], handler: Handler) -> Result<(), DriverError> {
        let client = self.client().await?;
        for pattern in patterns {
            self.routes.insert(pattern.clone(), handler.clone()).await;
            self.spawn_subscription(&client, pattern.clone(), handler.clone())
                .await?;
        }
        Ok(())
    }

    async fn unsubscribe(&self, patterns: &[String]) -> Result<(), DriverError> {
        let mut subscriptions = self.subscriptions.write().await;
        for pattern in patterns {
            self.routes.remove(pattern).await;
            if let Some(task) = subscriptions.remove(pattern) {
                task.abort();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_is_built_from_config() {
        let config = MessageBusConfig::default();
        let bus = NatsMessageBus::new(&config);
        assert_eq!(bus.url, format!("{}://{}:{}", config.protocol, config.host, config.port));
    }

    #[test]
    fn to_nats_subject_maps_separator_and_wildcard() {
        assert_eq!(to_nats_subject("v1/DATA/p1/d1/soft_read_req/temp"), "v1.DATA.p1.d1.soft_read_req.temp");
        assert_eq!(to_nats_subject("v1/DATA/#/#/soft_read_req/#"), "v1.DATA.*.*.soft_read_req.*");
    }

    #[test]
    fn from_nats_subject_is_the_inverse_for_concrete_subjects() {
        let internal = "v1/DATA/p1/d1/write_rsp/temp";
        assert_eq!(from_nats_subject(&to_nats_subject(internal)), internal);
    }
}
