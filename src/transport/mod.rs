//! # Broker Transports
//!
//! The publisher loop talks to a broker only through the [`Transport`] trait.
//! Each protocol lives in its own submodule:
//!
//! ```text
//! transport/
//! ├── mqtt.rs         - rumqttc client plus its event loop driver
//! ├── stomp.rs        - STOMP session on async-stomp
//! └── coap.rs         - CoAP requests over UDP (coap-lite packets)
//! ```
//!
//! A successful `publish` means the local client accepted the message. It is
//! not a broker-side receipt.

pub mod coap;
pub mod mqtt;
pub mod stomp;

use crate::publisher::payload::Payload;
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Mqtt,
    Stomp,
    Coap,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Mqtt => write!(f, "MQTT"),
            Protocol::Stomp => write!(f, "STOMP"),
            Protocol::Coap => write!(f, "CoAP"),
        }
    }
}

/// Local acknowledgement of a publish call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Rendered response, for request/response protocols
    pub response: Option<String>,
}

impl Delivery {
    pub fn accepted() -> Self {
        Self::default()
    }

    pub fn with_response(response: impl Into<String>) -> Self {
        Self {
            response: Some(response.into()),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("Broker rejected the connection: {0}")]
    Rejected(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport is not connected")]
    NotConnected,
}

/// Connection to a broker, owned exclusively by one publisher.
#[async_trait]
pub trait Transport: Send {
    fn protocol(&self) -> Protocol;

    /// Human readable endpoint, e.g. `broker:1883`
    fn endpoint(&self) -> String;

    async fn connect(&mut self) -> Result<(), TransportError>;

    async fn publish(&mut self, topic: &str, payload: &Payload)
        -> Result<Delivery, TransportError>;

    async fn disconnect(&mut self) -> Result<(), TransportError>;
}
