//! MQTT transport listener
//!
//! Subscribes to `<root>/#`, feeds every publish through the [`Ingestor`] in delivery
//! order, and starts over with a fresh session after a fixed delay whenever the
//! connection fails. Messages published while disconnected are not replayed.

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::ingest::Ingestor;
use crate::publish::PacketPublisher;

/// Default delay before reconnecting after a transport failure
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Largest envelope accepted from the broker
const MAX_PACKET_SIZE: usize = 256 * 1024;

/// Broker connection settings
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: String,
    /// Topic prefix, e.g. `msh/EU_868/2/e/LongFast/`
    pub root_topic: String,
    pub client_id: String,
    pub keep_alive: Duration,
    pub reconnect_delay: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            username: None,
            password: String::new(),
            root_topic: "msh/".into(),
            client_id: format!("meshscope-{}", std::process::id()),
            keep_alive: Duration::from_secs(30),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

impl ListenerConfig {
    /// Wildcard subscription under the root topic
    pub fn subscription(&self) -> String {
        subscription_topic(&self.root_topic)
    }

    fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options
            .set_keep_alive(self.keep_alive)
            .set_clean_session(true)
            .set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        if let Some(username) = &self.username {
            options.set_credentials(username, &self.password);
        }
        options
    }
}

/// `<root>/#`, tolerating a trailing `/` on the root
pub fn subscription_topic(root: &str) -> String {
    let root = root.trim_end_matches('/');
    if root.is_empty() {
        "#".to_string()
    } else {
        format!("{}/#", root)
    }
}

/// Why a session ended
enum SessionEnd {
    Cancelled,
    Disconnected,
}

/// Long-running MQTT consumer
pub struct MqttListener {
    config: ListenerConfig,
}

impl MqttListener {
    pub fn new(config: ListenerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    /// Consume messages until `cancel` fires or storage fails fatally
    ///
    /// Cancellation is observed between messages, so the message being processed
    /// always finishes its transaction.
    pub async fn run<P: PacketPublisher>(
        &self,
        ingestor: &mut Ingestor<P>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let topic = self.config.subscription();
        info!(
            host = %self.config.host,
            port = self.config.port,
            topic = %topic,
            "starting MQTT listener"
        );

        loop {
            let (client, eventloop) = AsyncClient::new(self.config.mqtt_options(), 64);
            client.subscribe(topic.as_str(), QoS::AtMostOnce).await?;

            match self.session(eventloop, ingestor, &cancel).await? {
                SessionEnd::Cancelled => break,
                SessionEnd::Disconnected => {}
            }

            if let Err(e) = client.disconnect().await {
                debug!("client already gone: {}", e);
            }
            drop(client);

            warn!(
                delay_secs = self.config.reconnect_delay.as_secs_f32(),
                "connection lost, reconnecting"
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }

        let stats = ingestor.stats();
        info!(
            processed = stats.processed,
            dropped = stats.dropped,
            duplicates = stats.duplicates,
            failed = stats.failed,
            "MQTT listener stopped"
        );
        Ok(())
    }

    async fn session<P: PacketPublisher>(
        &self,
        mut eventloop: EventLoop,
        ingestor: &mut Ingestor<P>,
        cancel: &CancellationToken,
    ) -> Result<SessionEnd> {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
                event = eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    debug!(topic = %publish.topic, len = publish.payload.len(), "message");
                    ingestor.handle(&publish.payload).await?;
                }
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!(code = ?ack.code, "connected to broker");
                }
                Ok(Event::Incoming(Packet::SubAck(_))) => {
                    debug!("subscription acknowledged");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("MQTT connection error: {}", e);
                    return Ok(SessionEnd::Disconnected);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::IngestStats;
    use crate::publish::NullPublisher;
    use crate::store::Store;

    #[test]
    fn test_subscription_topic() {
        assert_eq!(subscription_topic("msh/EU_868/2/e/LongFast/"), "msh/EU_868/2/e/LongFast/#");
        assert_eq!(subscription_topic("msh/EU_868"), "msh/EU_868/#");
        assert_eq!(subscription_topic(""), "#");
        assert_eq!(subscription_topic("/"), "#");
    }

    #[test]
    fn test_default_config() {
        let config = ListenerConfig::default();
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.subscription(), "msh/#");
        assert!(config.client_id.starts_with("meshscope-"));
    }

    #[tokio::test]
    async fn test_cancelled_listener_returns() {
        let store = Store::open_in_memory().await.unwrap();
        let mut ingestor = Ingestor::new(store, NullPublisher);
        let listener = MqttListener::new(ListenerConfig {
            host: "127.0.0.1".into(),
            port: 1,
            reconnect_delay: Duration::from_secs(60),
            ..Default::default()
        });

        let cancel = CancellationToken::new();
        cancel.cancel();
        listener.run(&mut ingestor, cancel).await.unwrap();
        assert_eq!(ingestor.stats().processed, 0);
    }

    #[tokio::test]
    async fn test_refused_connection_keeps_reconnecting() {
        let store = Store::open_in_memory().await.unwrap();
        let mut ingestor = Ingestor::new(store, NullPublisher);
        let listener = MqttListener::new(ListenerConfig {
            host: "127.0.0.1".into(),
            port: 1,
            reconnect_delay: Duration::from_millis(10),
            ..Default::default()
        });

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            stopper.cancel();
        });

        let started = std::time::Instant::now();
        listener.run(&mut ingestor, cancel).await.unwrap();

        // only cancellation ends the loop, not the failed sessions before it
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert_eq!(ingestor.stats(), IngestStats::default());
    }
}
