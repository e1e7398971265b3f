//! MQTT transport on top of rumqttc.
//!
//! rumqttc does all network I/O in its `EventLoop`, which has to be polled.
//! `connect` spawns a driver task that polls it, prints the CONNACK result and
//! publishes the connection state on a watch channel. Publishing only enqueues
//! into the client's request channel, and fails while the session is down or
//! the channel is full.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::{Delivery, Protocol, Transport, TransportError};
use crate::config::{Credentials, MqttConfig};
use crate::publisher::payload::Payload;

const REQUEST_CHANNEL_CAPACITY: usize = 100;
const POLL_ERROR_PAUSE: Duration = Duration::from_secs(1);
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed(String),
}

/// Everything needed to open an MQTT session
#[derive(Clone, Debug)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub credentials: Option<Credentials>,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub qos: QoS,
}

impl MqttSettings {
    pub fn from_config(config: &MqttConfig) -> Result<Self, TransportError> {
        let credentials = config
            .credentials()
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        Ok(Self {
            host: config.host.clone(),
            port: config.port,
            client_id: config.client_id(),
            credentials,
            keep_alive: Duration::from_secs(config.keep_alive_secs),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            qos: qos_from_level(config.qos)?,
        })
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(self.keep_alive);
        if let Some(credentials) = &self.credentials {
            options.set_credentials(
                credentials.username.clone(),
                credentials.password.clone(),
            );
        }
        options
    }
}

pub fn qos_from_level(level: u8) -> Result<QoS, TransportError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(TransportError::Protocol(format!("invalid QoS level {}", other))),
    }
}

pub struct MqttTransport {
    settings: MqttSettings,
    client: Option<AsyncClient>,
    driver: Option<JoinHandle<()>>,
    state_tx: watch::Sender<ConnectionState>,
    messages_sent: u64,
}

impl MqttTransport {
    pub fn new(settings: MqttSettings) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            settings,
            client: None,
            driver: None,
            state_tx,
            messages_sent: 0,
        }
    }

    /// Live view of the connection state as seen by the event loop driver
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    async fn wait_for_connack(&self) -> Result<(), TransportError> {
        let mut state = self.state_tx.subscribe();
        let settled = tokio::time::timeout(
            self.settings.connect_timeout,
            state.wait_for(|s| !matches!(s, ConnectionState::Connecting)),
        )
        .await
        .map_err(|_| TransportError::Timeout("CONNACK".to_string()))?
        .map_err(|_| TransportError::NotConnected)?
        .clone();

        match settled {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Failed(reason) => Err(TransportError::Connect {
                endpoint: self.endpoint(),
                reason,
            }),
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                Err(TransportError::NotConnected)
            }
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Mqtt
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.settings.host, self.settings.port)
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        debug!(
            "Opening MQTT session as {} (credentials: {})",
            self.settings.client_id,
            self.settings.credentials.is_some()
        );

        let (client, eventloop) =
            AsyncClient::new(self.settings.options(), REQUEST_CHANNEL_CAPACITY);
        self.state_tx.send_replace(ConnectionState::Connecting);
        self.driver = Some(tokio::spawn(drive_event_loop(
            eventloop,
            self.state_tx.clone(),
        )));
        self.client = Some(client);

        if let Err(e) = self.wait_for_connack().await {
            self.disconnect().await.ok();
            return Err(e);
        }
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &Payload,
    ) -> Result<Delivery, TransportError> {
        let client = self.client.as_ref().ok_or(TransportError::NotConnected)?;
        if *self.state_tx.borrow() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        let bytes = payload.to_bytes()?;

        client
            .try_publish(topic, self.settings.qos, false, bytes)
            .map_err(|e| TransportError::Publish(e.to_string()))?;

        self.messages_sent += 1;
        Ok(Delivery::accepted())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let result = match self.client.take() {
            Some(client) => client
                .disconnect()
                .await
                .map_err(|e| TransportError::Publish(e.to_string())),
            None => Ok(()),
        };

        if let Some(mut driver) = self.driver.take() {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut driver)
                .await
                .is_err()
            {
                debug!("Event loop did not stop in time, aborting it");
                driver.abort();
            }
        }

        self.state_tx.send_replace(ConnectionState::Disconnected);
        info!(
            "MQTT session to {} closed after {} message(s)",
            self.endpoint(),
            self.messages_sent
        );
        result
    }
}

/// Polls the rumqttc event loop until a DISCONNECT goes out or the broker
/// refuses the connection.
async fn drive_event_loop(mut eventloop: EventLoop, state: watch::Sender<ConnectionState>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    println!("Connected to MQTT Broker!");
                    state.send_replace(ConnectionState::Connected);
                } else {
                    println!("Failed to connect, return code {:?}", ack.code);
                    state.send_replace(ConnectionState::Failed(format!("{:?}", ack.code)));
                    break;
                }
            }
            Ok(Event::Incoming(packet)) => trace!("Incoming {:?}", packet),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("DISCONNECT sent, stopping event loop");
                break;
            }
            Ok(Event::Outgoing(outgoing)) => trace!("Outgoing {:?}", outgoing),
            Err(ConnectionError::ConnectionRefused(code)) => {
                println!("Failed to connect, return code {:?}", code);
                state.send_replace(ConnectionState::Failed(format!("{:?}", code)));
                break;
            }
            Err(e) => {
                error!("MQTT event loop error: {}", e);
                let connected = *state.borrow() == ConnectionState::Connected;
                if !connected {
                    state.send_replace(ConnectionState::Failed(e.to_string()));
                } else {
                    warn!("Connection lost, the client will reconnect on the next poll");
                    state.send_replace(ConnectionState::Connecting);
                }
                tokio::time::sleep(POLL_ERROR_PAUSE).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> MqttSettings {
        MqttSettings::from_config(&MqttConfig {
            host: "broker.local".to_string(),
            port: 31136,
            client_id: Some("iotpub-test".to_string()),
            username: Some("device".to_string()),
            password: Some("token".to_string()),
            qos: 1,
            ..MqttConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn qos_levels_map_to_rumqttc() {
        assert_eq!(qos_from_level(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(qos_from_level(1).unwrap(), QoS::AtLeastOnce);
        assert_eq!(qos_from_level(2).unwrap(), QoS::ExactlyOnce);
        assert!(qos_from_level(3).is_err());
    }

    #[test]
    fn settings_carry_config_values() {
        let settings = settings();
        assert_eq!(settings.client_id, "iotpub-test");
        assert_eq!(settings.qos, QoS::AtLeastOnce);
        assert_eq!(settings.keep_alive, Duration::from_secs(60));
        assert_eq!(settings.credentials.unwrap().username, "device");
    }

    #[test]
    fn options_use_host_port_and_credentials() {
        let options = settings().options();
        assert_eq!(
            options.broker_address(),
            ("broker.local".to_string(), 31136)
        );
        assert_eq!(options.client_id(), "iotpub-test");
        assert_eq!(
            options.credentials(),
            Some(("device".to_string(), "token".to_string()))
        );
    }

    #[tokio::test]
    async fn publish_before_connect_fails() {
        let mut transport = MqttTransport::new(settings());
        let payload = Payload::Raw(b"x".to_vec());
        let err = transport.publish("t", &payload).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
        assert_eq!(*transport.state().borrow(), ConnectionState::Disconnected);
    }

    /// Transport holding a client whose event loop is never polled, so
    /// nothing drains its single-slot request queue.
    fn stalled_transport(state: ConnectionState) -> (MqttTransport, EventLoop) {
        let mut transport = MqttTransport::new(settings());
        let (client, eventloop) = AsyncClient::new(transport.settings.options(), 1);
        transport.client = Some(client);
        transport.state_tx.send_replace(state);
        (transport, eventloop)
    }

    #[tokio::test]
    async fn publish_while_session_down_fails() {
        let (mut transport, _eventloop) = stalled_transport(ConnectionState::Connecting);
        let payload = Payload::Raw(b"x".to_vec());

        let err = transport.publish("t", &payload).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test]
    async fn publish_with_full_queue_fails_without_blocking() {
        let (mut transport, _eventloop) = stalled_transport(ConnectionState::Connected);
        let payload = Payload::Raw(b"x".to_vec());

        transport.publish("t", &payload).await.unwrap();
        let second = tokio::time::timeout(
            Duration::from_secs(1),
            transport.publish("t", &payload),
        )
        .await
        .expect("publish must not wait for queue space");
        assert!(matches!(second, Err(TransportError::Publish(_))));
    }

    #[tokio::test]
    async fn unreachable_broker_fails_to_connect() {
        let mut transport = MqttTransport::new(MqttSettings {
            host: "127.0.0.1".to_string(),
            // Nothing listens on the discard port in test environments.
            port: 9,
            connect_timeout: Duration::from_secs(3),
            ..settings()
        });

        let err = transport.connect().await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Connect { .. } | TransportError::Timeout(_)
        ));
        assert_eq!(*transport.state().borrow(), ConnectionState::Disconnected);
    }
}
