//! Fixed topic tables mapping `counter mod N` to a route.

use super::payload::{Payload, PayloadKind};

pub const ATTRIBUTES_TOPIC: &str = "v1/devices/me/attributes";
pub const TELEMETRY_TOPIC: &str = "v1/devices/me/telemetry";
pub const GATEWAY_ATTRIBUTES_TOPIC: &str = "v1/gateway/attributes";
pub const GATEWAY_TELEMETRY_TOPIC: &str = "v1/gateway/telemetry";
pub const RAW_DATA_TOPIC: &str = "v1/devices/me/raw";

/// One entry of a topic table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRoute {
    pub topic: String,
    pub kind: PayloadKind,
}

impl TopicRoute {
    pub fn new(topic: impl Into<String>, kind: PayloadKind) -> Self {
        Self {
            topic: topic.into(),
            kind,
        }
    }
}

/// Ordered list of routes selected round-robin by counter. Only the
/// constructors below build tables, so a table is never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicTable {
    routes: Vec<TopicRoute>,
}

impl TopicTable {
    /// Two-entry device table: odd counters publish attributes, even
    /// counters publish telemetry.
    pub fn device() -> Self {
        Self {
            routes: vec![
                TopicRoute::new(TELEMETRY_TOPIC, PayloadKind::Telemetry),
                TopicRoute::new(ATTRIBUTES_TOPIC, PayloadKind::Attributes),
            ],
        }
    }

    /// Five-entry gateway table covering device, gateway and raw topics.
    pub fn gateway(devices: Vec<String>, raw_payload: Vec<u8>) -> Self {
        Self {
            routes: vec![
                TopicRoute::new(ATTRIBUTES_TOPIC, PayloadKind::Attributes),
                TopicRoute::new(TELEMETRY_TOPIC, PayloadKind::Telemetry),
                TopicRoute::new(
                    GATEWAY_ATTRIBUTES_TOPIC,
                    PayloadKind::GatewayAttributes {
                        devices: devices.clone(),
                    },
                ),
                TopicRoute::new(
                    GATEWAY_TELEMETRY_TOPIC,
                    PayloadKind::GatewayTelemetry { devices },
                ),
                TopicRoute::new(RAW_DATA_TOPIC, PayloadKind::Literal(raw_payload)),
            ],
        }
    }

    pub fn single(topic: impl Into<String>, kind: PayloadKind) -> Self {
        Self {
            routes: vec![TopicRoute::new(topic, kind)],
        }
    }

    /// Number of iterations before the table repeats
    pub fn cycle_length(&self) -> usize {
        self.routes.len()
    }

    pub fn select(&self, counter: u64) -> &TopicRoute {
        let index = (counter % self.routes.len() as u64) as usize;
        &self.routes[index]
    }

    /// Resolves topic and payload for `counter` in one step.
    pub fn resolve(&self, counter: u64, ts_nanos: i64) -> (&str, Payload) {
        let route = self.select(counter);
        (&route.topic, route.kind.build(counter, ts_nanos))
    }
}
