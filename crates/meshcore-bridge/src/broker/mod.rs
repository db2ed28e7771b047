//! Broker connection manager
//!
//! Drives the MQTT session through the same four states as the serial
//! side and delivers queued [`PublishAttempt`]s one at a time:
//!
//! - a publish completes at the configured QoS or times out after
//!   `ack_timeout`
//! - a failed or timed out attempt goes back to the head of the queue and
//!   the session is torn down, so delivery is at-least-once across a
//!   reconnect and packet order is preserved
//! - after every (re)connect the last delivered status is sent again so the
//!   retained status replaces the offline last will
//!
//! The transport sits behind [`BrokerConnector`] / [`BrokerSession`];
//! [`mqtt::MqttConnector`] is the rumqttc implementation.

pub mod mqtt;

pub use mqtt::MqttConnector;

use crate::backoff::Backoff;
use crate::config::{BrokerConfig, ReconnectConfig};
use crate::error::{BridgeError, Result};
use crate::identity::ObserverIdentity;
use crate::interface::{ConnectionState, StatePublisher};
use crate::mapper::{MessageClass, PublishAttempt};
use crate::queue::PublishQueue;
use crate::status::{bump, BridgeCounters};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Opens broker sessions
#[async_trait]
pub trait BrokerConnector: Send + Sync + 'static {
    /// Session type produced by this connector
    type Session: BrokerSession;

    /// Connect and wait for the broker to accept the session
    ///
    /// `will` is registered as the session's last will.
    async fn connect(&self, will: &PublishAttempt) -> Result<Self::Session>;

    /// Called once the observer identity is known, before the first connect
    fn bind_identity(&mut self, _identity: &ObserverIdentity) {}

    /// Broker name (for logging)
    fn name(&self) -> &str;
}

/// An established broker session
#[async_trait]
pub trait BrokerSession: Send + 'static {
    /// Publish and wait until the attempt completes at its QoS
    async fn publish(&mut self, attempt: &PublishAttempt) -> Result<()>;

    /// Drive the session while idle; an error means the session is lost
    ///
    /// Must be cancel-safe.
    async fn poll(&mut self) -> Result<()>;

    /// Close the session
    async fn disconnect(&mut self);
}

/// Broker side of the bridge
pub struct BrokerManager<C: BrokerConnector> {
    connector: C,
    will: PublishAttempt,
    connect_timeout: Duration,
    ack_timeout: Duration,
    queue: Arc<PublishQueue>,
    counters: Arc<BridgeCounters>,
    state: StatePublisher,
    backoff: Backoff,
    last_status: Option<PublishAttempt>,
    ever_connected: bool,
    recovering: bool,
}

impl<C: BrokerConnector> BrokerManager<C> {
    /// Create a manager
    pub fn new(
        connector: C,
        will: PublishAttempt,
        broker: &BrokerConfig,
        reconnect: &ReconnectConfig,
        queue: Arc<PublishQueue>,
        counters: Arc<BridgeCounters>,
        state: StatePublisher,
    ) -> Self {
        Self {
            connector,
            will,
            connect_timeout: broker.connect_timeout,
            ack_timeout: broker.ack_timeout,
            queue,
            counters,
            state,
            backoff: Backoff::new(reconnect),
            last_status: None,
            ever_connected: false,
            recovering: false,
        }
    }

    /// Run until `cancel` fires or the queue is closed and drained
    pub async fn run(&mut self, cancel: CancellationToken) {
        loop {
            if self.recovering {
                self.recovering = false;
                if !self.wait_backoff(&cancel).await {
                    break;
                }
            }

            let Some(mut session) = self.open(&cancel).await else {
                if cancel.is_cancelled() || !self.wait_backoff(&cancel).await {
                    break;
                }
                continue;
            };

            match self.serve(&mut session, &cancel).await {
                Ok(()) => {
                    session.disconnect().await;
                    break;
                }
                Err(e) => {
                    warn!(
                        broker = self.connector.name(),
                        error = %e,
                        code = e.error_code(),
                        "Broker session lost"
                    );
                    session.disconnect().await;
                    self.backoff.disconnected(Instant::now());
                    if !self.wait_backoff(&cancel).await {
                        break;
                    }
                }
            }
        }

        self.state.set(ConnectionState::Disconnected);
        info!(broker = self.connector.name(), "Broker manager stopped");
    }

    /// Prepare for a restart after a panic inside [`BrokerManager::run`]
    pub fn recover(&mut self) {
        self.recovering = true;
        self.state.set(ConnectionState::Backoff);
    }

    async fn open(&mut self, cancel: &CancellationToken) -> Option<C::Session> {
        self.state.set(ConnectionState::Connecting);
        let result = tokio::select! {
            _ = cancel.cancelled() => return None,
            result = timeout(self.connect_timeout, self.connector.connect(&self.will)) => {
                result.unwrap_or_else(|_| Err(BridgeError::ConnectionTimeout {
                    duration_ms: self.connect_timeout.as_millis() as u64,
                }))
            }
        };

        match result {
            Ok(session) => {
                if self.ever_connected {
                    bump(&self.counters.broker_reconnects);
                }
                self.ever_connected = true;
                self.state.set(ConnectionState::Connected);
                self.backoff.connected(Instant::now());
                info!(broker = self.connector.name(), "Connected to broker");

                if let Some(status) = self.last_status.clone() {
                    debug!("Re-sending last status after connect");
                    self.queue.requeue_front(status);
                }
                Some(session)
            }
            Err(e) => {
                warn!(
                    broker = self.connector.name(),
                    error = %e,
                    code = e.error_code(),
                    "Broker connect failed"
                );
                None
            }
        }
    }

    /// Deliver queued attempts; `Ok` means stop (cancelled or queue finished)
    async fn serve(&mut self, session: &mut C::Session, cancel: &CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                polled = session.poll() => polled?,
                next = self.queue.recv() => match next {
                    Some(attempt) => self.deliver(session, attempt).await?,
                    None => {
                        info!("Publish queue drained");
                        return Ok(());
                    }
                },
            }
        }
    }

    async fn deliver(&mut self, session: &mut C::Session, attempt: PublishAttempt) -> Result<()> {
        let outcome = match timeout(self.ack_timeout, session.publish(&attempt)).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::AckTimeout {
                duration_ms: self.ack_timeout.as_millis() as u64,
            }),
        };

        match outcome {
            Ok(()) => {
                match attempt.class {
                    MessageClass::Packet => bump(&self.counters.packets_published),
                    MessageClass::Status => {
                        bump(&self.counters.statuses_published);
                        self.last_status = Some(attempt);
                    }
                }
                Ok(())
            }
            Err(e) => {
                bump(&self.counters.publish_failures);
                debug!(topic = %attempt.topic, "Returning attempt to queue head");
                self.queue.requeue_front(attempt);
                Err(e)
            }
        }
    }

    async fn wait_backoff(&mut self, cancel: &CancellationToken) -> bool {
        self.state.set(ConnectionState::Backoff);
        let delay = self.backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "Broker reconnect backoff");
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = sleep(delay) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Qos;
    use crate::queue::PushOutcome;
    use crate::test_utils::MockBroker;
    use bytes::Bytes;

    fn attempt(class: MessageClass, id: u8) -> PublishAttempt {
        PublishAttempt {
            topic: match class {
                MessageClass::Packet => "p".into(),
                MessageClass::Status => "s".into(),
            },
            payload: Bytes::from(vec![id]),
            qos: Qos::AtLeastOnce,
            retain: class == MessageClass::Status,
            class,
        }
    }

    fn setup(broker: &MockBroker) -> (BrokerManager<MockBroker>, Arc<PublishQueue>, Arc<BridgeCounters>) {
        let counters = Arc::new(BridgeCounters::new());
        let queue = Arc::new(PublishQueue::new(8, counters.clone()));
        let config = BrokerConfig {
            ack_timeout: Duration::from_secs(3),
            ..BrokerConfig::default()
        };
        let manager = BrokerManager::new(
            broker.clone(),
            attempt(MessageClass::Status, 0xFF),
            &config,
            &ReconnectConfig::default(),
            queue.clone(),
            counters.clone(),
            StatePublisher::new("broker"),
        );
        (manager, queue, counters)
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_in_order_and_stops_when_drained() {
        let broker = MockBroker::new();
        let (mut manager, queue, counters) = setup(&broker);

        for id in 0..3 {
            assert_eq!(queue.push(attempt(MessageClass::Packet, id)), PushOutcome::Queued);
        }
        queue.close();
        manager.run(CancellationToken::new()).await;

        let ids: Vec<u8> = broker.published().iter().map(|a| a.payload[0]).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(counters.snapshot().packets_published, 3);
        assert_eq!(broker.wills()[0].payload[0], 0xFF);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_timeout_requeues_and_reconnects() {
        let broker = MockBroker::new();
        broker.set_acking(false);
        let (mut manager, queue, counters) = setup(&broker);
        queue.push(attempt(MessageClass::Packet, 1));
        queue.push(attempt(MessageClass::Packet, 2));

        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let control = broker.clone();
        let closer = queue.clone();
        tokio::spawn(async move {
            // first publish hangs until the 3s ack timeout
            sleep(Duration::from_secs(4)).await;
            control.set_acking(true);
            closer.close();
            sleep(Duration::from_secs(30)).await;
            stop.cancel();
        });
        manager.run(cancel).await;

        let ids: Vec<u8> = broker.published().iter().map(|a| a.payload[0]).collect();
        assert_eq!(ids, vec![1, 2]);
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.publish_failures, 1);
        assert_eq!(snapshot.broker_reconnects, 1);
        assert!(broker.connect_count() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_status_resent_after_reconnect() {
        let broker = MockBroker::new();
        let (mut manager, queue, _counters) = setup(&broker);
        queue.push(attempt(MessageClass::Status, 7));

        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let control = broker.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            control.set_available(false);
            sleep(Duration::from_millis(100)).await;
            control.set_available(true);
            sleep(Duration::from_secs(10)).await;
            stop.cancel();
        });
        manager.run(cancel).await;

        let statuses: Vec<u8> = broker
            .published()
            .iter()
            .filter(|a| a.class == MessageClass::Status)
            .map(|a| a.payload[0])
            .collect();
        assert_eq!(statuses, vec![7, 7]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_broker_keeps_backing_off() {
        let broker = MockBroker::new();
        broker.set_available(false);
        let (mut manager, queue, counters) = setup(&broker);
        queue.push(attempt(MessageClass::Packet, 1));

        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(20)).await;
            stop.cancel();
        });
        manager.run(cancel).await;

        assert!(broker.published().is_empty());
        assert_eq!(queue.len(), 1);
        assert_eq!(counters.snapshot().broker_reconnects, 0);
    }
}
