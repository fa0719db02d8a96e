//! Netdrill Common - Shared types between the simulation engine and its clients
//!
//! Everything that crosses the push channel or the HTTP surface lives here so
//! dashboards and load generators can depend on the wire format without
//! pulling in the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable city identifier (e.g. "PAR")
pub type CityId = String;

/// Geographic region of a city
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Region {
    Europe,
    #[serde(rename = "North America", alias = "NorthAmerica")]
    NorthAmerica,
    Asia,
    #[serde(rename = "South America", alias = "SouthAmerica")]
    SouthAmerica,
    Africa,
    Oceania,
}

impl Region {
    pub const ALL: [Region; 6] = [
        Region::Europe,
        Region::NorthAmerica,
        Region::Asia,
        Region::SouthAmerica,
        Region::Africa,
        Region::Oceania,
    ];

    /// Infrastructure latency floor in milliseconds
    pub fn latency_factor(self) -> f64 {
        match self {
            Region::Europe => 10.0,
            Region::NorthAmerica => 12.0,
            Region::Asia => 15.0,
            Region::SouthAmerica => 18.0,
            Region::Africa => 20.0,
            Region::Oceania => 22.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Region::Europe => "Europe",
            Region::NorthAmerica => "North America",
            Region::Asia => "Asia",
            Region::SouthAmerica => "South America",
            Region::Africa => "Africa",
            Region::Oceania => "Oceania",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operational status of a city
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CityStatus {
    Online,
    Offline,
    Maintenance,
}

/// Operational status of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Active,
    Degraded,
    Down,
}

/// Live metrics of a city as shown on dashboards
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CityMetrics {
    /// Latency in milliseconds
    pub latency: f64,
    /// Load percentage (0-100)
    pub load: f64,
    /// Packet loss ratio (0.0-1.0)
    pub packet_loss: f64,
    /// Throughput in abstract bandwidth units
    pub throughput: f64,
}

/// Live metrics of a link
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkMetrics {
    pub latency: f64,
    pub bandwidth: f64,
    pub packet_loss: f64,
}

/// Canonical identifier of an undirected link: both endpoints sorted and
/// joined with `-`, so `LinkId::between("PAR", "LON") == LinkId::between("LON", "PAR")`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LinkId(String);

impl LinkId {
    pub fn between(a: &str, b: &str) -> Self {
        if a <= b {
            LinkId(format!("{a}-{b}"))
        } else {
            LinkId(format!("{b}-{a}"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metric classified by the anomaly detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MetricKind {
    Latency,
    PacketLoss,
    Load,
}

impl MetricKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::Latency => "latency",
            MetricKind::PacketLoss => "packetLoss",
            MetricKind::Load => "load",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

/// Single-metric threshold breach
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Anomaly {
    pub metric_type: MetricKind,
    pub severity: Severity,
    pub value: f64,
    pub threshold_crossed: f64,
}

/// User-facing record derived from an anomaly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: Uuid,
    pub city_id: CityId,
    #[serde(rename = "type")]
    pub alert_type: MetricKind,
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Role of a connected session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Teacher,
    Student,
}

/// Raw metric sample as submitted by a student or synthesized by a scenario.
///
/// Both naming conventions seen in the field are accepted: a `latencies` list
/// or a scalar `latency`, and `processed` or `packetsProcessed`. Presence is
/// checked by the engine, not by deserialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSample {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latencies: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<f64>,
    #[serde(default)]
    pub load: Option<f64>,
    #[serde(default)]
    pub sent: Option<f64>,
    #[serde(default)]
    pub received: Option<f64>,
    #[serde(default, alias = "packetsProcessed")]
    pub processed: Option<f64>,
    #[serde(default)]
    pub bandwidth_usage: Option<f64>,
}

/// Metrics derived from a raw sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedMetrics {
    pub average_latency: f64,
    pub load: f64,
    pub packet_loss: f64,
    pub packets_processed: f64,
    pub packets_dropped: f64,
    pub bandwidth_usage: f64,
    pub performance_score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_id_is_order_independent() {
        assert_eq!(LinkId::between("PAR", "LON"), LinkId::between("LON", "PAR"));
        assert_eq!(LinkId::between("PAR", "LON").as_str(), "LON-PAR");
    }

    #[test]
    fn test_region_serialization() {
        let json = serde_json::to_string(&Region::NorthAmerica).unwrap();
        assert_eq!(json, "\"North America\"");

        let parsed: Region = serde_json::from_str("\"NorthAmerica\"").unwrap();
        assert_eq!(parsed, Region::NorthAmerica);
    }

    #[test]
    fn test_raw_sample_accepts_both_spellings() {
        let sample: RawSample = serde_json::from_str(
            r#"{"latency": 42.0, "load": 30, "sent": 10, "received": 10, "packetsProcessed": 10}"#,
        )
        .unwrap();
        assert_eq!(sample.latency, Some(42.0));
        assert_eq!(sample.processed, Some(10.0));
        assert!(sample.latencies.is_none());
    }

    #[test]
    fn test_alert_wire_format() {
        let alert = Alert {
            id: Uuid::new_v4(),
            city_id: "PAR".to_string(),
            alert_type: MetricKind::PacketLoss,
            severity: Severity::Critical,
            message: "critical packet loss".to_string(),
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&alert).unwrap();
        assert_eq!(value["type"], "packetLoss");
        assert_eq!(value["severity"], "critical");
        assert_eq!(value["cityId"], "PAR");
    }
}
