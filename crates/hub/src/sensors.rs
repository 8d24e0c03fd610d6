//! Latest-snapshot model of the reservoir sensors.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Hardware-fault sentinel reported by probes (e.g. a disconnected DS18B20).
pub const SENSOR_FAULT: f64 = -127.0;

/// Raw EC above this is taken to be µS/cm rather than mS/cm.
const EC_MICRO_THRESHOLD: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Channel {
    Ph,
    Ec,
    WaterTemp,
    AirTemp,
    Humidity,
    WaterLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelReading {
    pub value: f64,
    #[serde(default = "default_status")]
    pub status: String,
}

fn default_status() -> String {
    "ok".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub node_id: String,
    pub readings: BTreeMap<Channel, ChannelReading>,
}

impl Snapshot {
    pub fn new(ts: OffsetDateTime, node_id: &str) -> Self {
        Self {
            ts,
            node_id: node_id.to_string(),
            readings: BTreeMap::new(),
        }
    }

    pub fn with(mut self, channel: Channel, value: f64) -> Self {
        self.readings.insert(
            channel,
            ChannelReading {
                value,
                status: default_status(),
            },
        );
        self
    }

    /// Raw channel value, fault sentinel included.
    pub fn value(&self, channel: Channel) -> Option<f64> {
        self.readings.get(&channel).map(|r| r.value)
    }

    /// Channel value with the fault sentinel filtered out.
    pub fn healthy(&self, channel: Channel) -> Option<f64> {
        self.value(channel).filter(|v| !is_fault(*v))
    }

    /// EC in mS/cm, if present and healthy.
    pub fn ec(&self) -> Option<f64> {
        self.healthy(Channel::Ec).map(normalize_ec)
    }
}

pub fn is_fault(value: f64) -> bool {
    value == SENSOR_FAULT
}

/// Normalise an EC reading to mS/cm.
pub fn normalize_ec(raw: f64) -> f64 {
    if raw > EC_MICRO_THRESHOLD {
        raw / 1000.0
    } else {
        raw
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn ec_normalisation() {
        assert_eq!(normalize_ec(1500.0), 1.5);
        assert_eq!(normalize_ec(1.5), 1.5);
        assert_eq!(normalize_ec(100.0), 100.0);
    }

    #[test]
    fn fault_sentinel_is_filtered() {
        let s = Snapshot::new(datetime!(2024-06-03 12:00 UTC), "node-a")
            .with(Channel::WaterTemp, SENSOR_FAULT)
            .with(Channel::Ph, 6.1);
        assert_eq!(s.value(Channel::WaterTemp), Some(SENSOR_FAULT));
        assert_eq!(s.healthy(Channel::WaterTemp), None);
        assert_eq!(s.healthy(Channel::Ph), Some(6.1));
        assert_eq!(s.healthy(Channel::Humidity), None);
    }

    #[test]
    fn snapshot_json_uses_channel_names() {
        let s = Snapshot::new(datetime!(2024-06-03 12:00 UTC), "node-a")
            .with(Channel::Ec, 1400.0)
            .with(Channel::WaterLevel, 80.0);
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["readings"]["ec"]["value"], 1400.0);
        assert_eq!(json["readings"]["waterLevel"]["status"], "ok");
        assert_eq!(s.ec(), Some(1.4));
    }
}
