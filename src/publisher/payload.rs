//! Payload shapes published by the telemetry loop.
//!
//! Every builder is a pure function of the iteration counter and a timestamp,
//! so the same `(counter, ts)` pair always yields the same payload.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Device attribute update: `{"attribute1": "value1", "attribute2": <counter>}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    pub attribute1: String,
    pub attribute2: u64,
}

/// Values block of a telemetry record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryValues {
    pub telemetry1: String,
    pub telemetry2: u64,
}

/// Timestamped telemetry record, `ts` in unix nanoseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Telemetry {
    pub ts: i64,
    pub values: TelemetryValues,
}

/// A fully built payload, ready to be serialized onto the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Attributes(Attributes),
    Telemetry(Telemetry),
    /// Per-device attributes keyed by device name
    GatewayAttributes(BTreeMap<String, Attributes>),
    /// Per-device telemetry batches keyed by device name
    GatewayTelemetry(BTreeMap<String, Vec<Telemetry>>),
    /// Opaque bytes, published unchanged
    Raw(Vec<u8>),
}

impl Payload {
    /// Serializes the payload into the bytes handed to the transport.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Payload::Attributes(attributes) => serde_json::to_vec(attributes),
            Payload::Telemetry(telemetry) => serde_json::to_vec(telemetry),
            Payload::GatewayAttributes(devices) => serde_json::to_vec(devices),
            Payload::GatewayTelemetry(devices) => serde_json::to_vec(devices),
            Payload::Raw(bytes) => Ok(bytes.clone()),
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Payload::Raw(_) => "application/octet-stream",
            _ => "application/json",
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.to_bytes() {
            Ok(bytes) => write!(f, "{}", String::from_utf8_lossy(&bytes)),
            Err(e) => write!(f, "<unserializable payload: {}>", e),
        }
    }
}

/// Recipe for the payload of one topic route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadKind {
    Attributes,
    Telemetry,
    GatewayAttributes { devices: Vec<String> },
    GatewayTelemetry { devices: Vec<String> },
    Literal(Vec<u8>),
}

impl PayloadKind {
    /// Builds the payload for `counter`. `ts_nanos` is only embedded in
    /// telemetry shapes.
    pub fn build(&self, counter: u64, ts_nanos: i64) -> Payload {
        match self {
            PayloadKind::Attributes => Payload::Attributes(attributes(counter)),
            PayloadKind::Telemetry => Payload::Telemetry(telemetry(counter, ts_nanos)),
            PayloadKind::GatewayAttributes { devices } => Payload::GatewayAttributes(
                devices
                    .iter()
                    .map(|device| (device.clone(), attributes(counter)))
                    .collect(),
            ),
            PayloadKind::GatewayTelemetry { devices } => Payload::GatewayTelemetry(
                devices
                    .iter()
                    .map(|device| (device.clone(), vec![telemetry(counter, ts_nanos)]))
                    .collect(),
            ),
            PayloadKind::Literal(bytes) => Payload::Raw(bytes.clone()),
        }
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PayloadKind::Attributes => write!(f, "attributes"),
            PayloadKind::Telemetry => write!(f, "telemetry"),
            PayloadKind::GatewayAttributes { .. } => write!(f, "gateway-attributes"),
            PayloadKind::GatewayTelemetry { .. } => write!(f, "gateway-telemetry"),
            PayloadKind::Literal(_) => write!(f, "literal"),
        }
    }
}

fn attributes(counter: u64) -> Attributes {
    Attributes {
        attribute1: "value1".to_string(),
        attribute2: counter,
    }
}

fn telemetry(counter: u64, ts_nanos: i64) -> Telemetry {
    Telemetry {
        ts: ts_nanos,
        values: TelemetryValues {
            telemetry1: "value1".to_string(),
            telemetry2: counter,
        },
    }
}

/// Current wall clock in unix nanoseconds.
pub fn now_nanos() -> i64 {
    // Out of range only after the year 2262.
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}
