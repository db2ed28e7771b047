//! MQTT transport over rumqttc

use crate::broker::{BrokerConnector, BrokerSession};
use crate::config::{BrokerConfig, Qos};
use crate::error::{BridgeError, Result};
use crate::identity::ObserverIdentity;
use crate::mapper::PublishAttempt;
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet,
    Transport,
};
use std::time::Duration;
use tracing::{debug, info, trace};

/// Request channel capacity between client and event loop
const CLIENT_CHANNEL_CAPACITY: usize = 10;

/// Time allowed for the DISCONNECT packet to leave
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Opens rumqttc sessions against one broker
#[derive(Debug, Clone)]
pub struct MqttConnector {
    config: BrokerConfig,
    client_id: Option<String>,
    name: String,
}

impl MqttConnector {
    /// Create a connector; the client id is derived from the observer identity
    pub fn new(config: BrokerConfig) -> Self {
        let name = format!("{}:{}", config.host, config.port);
        Self {
            config,
            client_id: None,
            name,
        }
    }

    /// Use a fixed client id instead
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Client identifier presented to the broker
    pub fn client_id(&self) -> &str {
        self.client_id
            .as_deref()
            .unwrap_or(&self.config.client_id_prefix)
    }

    fn options(&self, will: &PublishAttempt) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id(), &self.config.host, self.config.port);
        options.set_keep_alive(self.config.keep_alive);
        options.set_clean_session(true);
        options.set_last_will(LastWill::new(
            &will.topic,
            will.payload.to_vec(),
            will.qos.into(),
            will.retain,
        ));

        if let Some(username) = &self.config.username {
            let password = self.config.password.as_deref().unwrap_or_default();
            options.set_credentials(username, password);
        }
        if self.config.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    }
}

#[async_trait]
impl BrokerConnector for MqttConnector {
    type Session = MqttSession;

    async fn connect(&self, will: &PublishAttempt) -> Result<MqttSession> {
        info!(
            host = %self.config.host,
            port = self.config.port,
            client_id = self.client_id(),
            tls = self.config.use_tls,
            "Connecting to MQTT broker"
        );
        let (client, mut eventloop) =
            AsyncClient::new(self.options(will), CLIENT_CHANNEL_CAPACITY);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        return Ok(MqttSession { client, eventloop });
                    }
                    return Err(BridgeError::BrokerConnect(format!(
                        "broker refused connection: {:?}",
                        ack.code
                    )));
                }
                Ok(event) => trace!(?event, "MQTT event before CONNACK"),
                Err(e) => return Err(BridgeError::BrokerConnect(e.to_string())),
            }
        }
    }

    fn bind_identity(&mut self, identity: &ObserverIdentity) {
        if self.client_id.is_none() {
            self.client_id = Some(identity.client_id(&self.config.client_id_prefix));
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Live rumqttc client and its event loop
pub struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
}

impl MqttSession {
    fn completes(qos: Qos, event: &Event) -> bool {
        match qos {
            Qos::AtMostOnce => matches!(event, Event::Outgoing(Outgoing::Publish(_))),
            Qos::AtLeastOnce => matches!(event, Event::Incoming(Packet::PubAck(_))),
            Qos::ExactlyOnce => matches!(event, Event::Incoming(Packet::PubComp(_))),
        }
    }
}

#[async_trait]
impl BrokerSession for MqttSession {
    async fn publish(&mut self, attempt: &PublishAttempt) -> Result<()> {
        self.client
            .publish(
                attempt.topic.as_str(),
                attempt.qos.into(),
                attempt.retain,
                attempt.payload.to_vec(),
            )
            .await
            .map_err(|e| BridgeError::PublishFailed {
                topic: attempt.topic.clone(),
                reason: e.to_string(),
            })?;

        loop {
            let event = self.eventloop.poll().await?;
            if Self::completes(attempt.qos, &event) {
                trace!(topic = %attempt.topic, "Publish complete");
                return Ok(());
            }
            if let Event::Incoming(Packet::Disconnect) = event {
                return Err(BridgeError::BrokerDisconnected(
                    "broker sent DISCONNECT".into(),
                ));
            }
        }
    }

    async fn poll(&mut self) -> Result<()> {
        match self.eventloop.poll().await? {
            Event::Incoming(Packet::Disconnect) => Err(BridgeError::BrokerDisconnected(
                "broker sent DISCONNECT".into(),
            )),
            event => {
                trace!(?event, "MQTT event");
                Ok(())
            }
        }
    }

    async fn disconnect(&mut self) {
        if self.client.try_disconnect().is_err() {
            return;
        }
        let flushed = tokio::time::timeout(DISCONNECT_GRACE, async {
            while let Ok(event) = self.eventloop.poll().await {
                if let Event::Outgoing(Outgoing::Disconnect) = event {
                    break;
                }
            }
        })
        .await;
        if flushed.is_err() {
            debug!("MQTT disconnect not flushed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::MessageClass;
    use bytes::Bytes;
    use rumqttc::{PubAck, PubComp, Publish};

    fn will() -> PublishAttempt {
        PublishAttempt {
            topic: "meshcore/ITA/ABCD/status".into(),
            payload: Bytes::from_static(br#"{"status":"offline"}"#),
            qos: Qos::AtLeastOnce,
            retain: true,
            class: MessageClass::Status,
        }
    }

    #[test]
    fn test_options_carry_will_and_credentials() {
        let config = BrokerConfig {
            host: "mqtt.example.org".into(),
            port: 1884,
            username: Some("observer".into()),
            password: Some("secret".into()),
            keep_alive: Duration::from_secs(30),
            ..BrokerConfig::default()
        };
        let connector = MqttConnector::new(config).with_client_id("meshcore_ABCD");
        let options = connector.options(&will());

        assert_eq!(options.broker_address(), ("mqtt.example.org".to_string(), 1884));
        assert_eq!(options.client_id(), "meshcore_ABCD");
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
        assert_eq!(
            options.credentials(),
            Some(("observer".to_string(), "secret".to_string()))
        );
        let last_will = options.last_will().unwrap();
        assert_eq!(last_will.message.as_ref(), will().payload.as_ref());
        assert!(last_will.retain);
        assert_eq!(connector.name(), "mqtt.example.org:1884");
    }

    #[test]
    fn test_client_id_from_identity() {
        let mut connector = MqttConnector::new(BrokerConfig::default());
        assert_eq!(connector.client_id(), "meshcore_");

        let identity = ObserverIdentity::new("abcd1234", "ITA").unwrap();
        connector.bind_identity(&identity);
        assert_eq!(connector.client_id(), identity.client_id("meshcore_"));
        assert!(connector.client_id().starts_with("meshcore_ABCD1234"));
    }

    #[test]
    fn test_completion_event_per_qos() {
        let publish = Event::Outgoing(Outgoing::Publish(1));
        let puback = Event::Incoming(Packet::PubAck(PubAck::new(1)));
        let pubcomp = Event::Incoming(Packet::PubComp(PubComp::new(1)));

        assert!(MqttSession::completes(Qos::AtMostOnce, &publish));
        assert!(!MqttSession::completes(Qos::AtLeastOnce, &publish));
        assert!(MqttSession::completes(Qos::AtLeastOnce, &puback));
        assert!(!MqttSession::completes(Qos::ExactlyOnce, &puback));
        assert!(MqttSession::completes(Qos::ExactlyOnce, &pubcomp));

        let incoming = Event::Incoming(Packet::Publish(Publish::new(
            "t",
            rumqttc::QoS::AtMostOnce,
            "x",
        )));
        assert!(!MqttSession::completes(Qos::AtMostOnce, &incoming));
    }

    #[tokio::test]
    async fn test_connect_refused_port() {
        let config = BrokerConfig {
            host: "127.0.0.1".into(),
            port: 1,
            ..BrokerConfig::default()
        };
        let connector = MqttConnector::new(config);
        let err = match connector.connect(&will()).await {
            Ok(_) => panic!("connected to a closed port"),
            Err(e) => e,
        };
        assert!(matches!(err, BridgeError::BrokerConnect(_)));
    }
}
