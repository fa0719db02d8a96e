//! Time-series collaborator
//!
//! The pipeline writes derived metrics and anomalies as points and reads
//! them back for history views. Writes are fire and forget: they never block
//! the caller and a failure is reported to it as an error to be logged.

use crate::config::TimeSeriesConfig;
use crate::error::{Result, SimError};
use crate::ring::RingBuffer;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use netdrill_common::{CityId, Region};
use reqwest::Client;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Points drained from the queue per HTTP request
const MAX_BATCH: usize = 100;

/// One measurement for one city
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPoint {
    pub measurement: String,
    pub city_id: CityId,
    pub region: Region,
    /// Additional tags such as `type` and `severity`
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, f64>,
    pub timestamp: DateTime<Utc>,
}

impl DataPoint {
    pub fn new(measurement: &str, city_id: &str, region: Region) -> Self {
        Self {
            measurement: measurement.to_string(),
            city_id: city_id.to_string(),
            region,
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }

    pub fn field(mut self, key: &str, value: f64) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// InfluxDB line protocol with nanosecond precision
    pub fn to_line_protocol(&self) -> String {
        let mut line = escape(&self.measurement, false);
        let _ = write!(line, ",cityId={}", escape(&self.city_id, true));
        let _ = write!(line, ",region={}", escape(self.region.as_str(), true));
        for (key, value) in &self.tags {
            let _ = write!(line, ",{}={}", escape(key, true), escape(value, true));
        }

        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|(key, value)| format!("{}={}", escape(key, true), value))
            .collect();
        let _ = write!(line, " {}", fields.join(","));

        if let Some(nanos) = self.timestamp.timestamp_nanos_opt() {
            let _ = write!(line, " {nanos}");
        }
        line
    }
}

/// Escape commas and spaces, plus `=` in tag keys and values
fn escape(raw: &str, is_tag: bool) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c == ',' || c == ' ' || (is_tag && c == '=') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Storage for metric points
pub trait TimeSeriesStore: Send + Sync {
    /// Record a point without waiting for durable storage
    fn write(&self, point: DataPoint) -> Result<()>;

    /// Points of one city younger than `window`, oldest first
    fn query_range(&self, city_id: &str, window: Duration) -> Result<Vec<DataPoint>>;
}

/// Bounded per-city history kept in process memory
pub struct InMemoryTimeSeries {
    series: DashMap<CityId, RingBuffer<DataPoint>>,
    points_per_city: usize,
}

impl InMemoryTimeSeries {
    pub fn new(points_per_city: usize) -> Self {
        Self {
            series: DashMap::new(),
            points_per_city,
        }
    }

    pub fn len(&self, city_id: &str) -> usize {
        self.series.get(city_id).map(|s| s.len()).unwrap_or(0)
    }
}

impl TimeSeriesStore for InMemoryTimeSeries {
    fn write(&self, point: DataPoint) -> Result<()> {
        self.series
            .entry(point.city_id.clone())
            .or_insert_with(|| RingBuffer::new(self.points_per_city))
            .push(point);
        Ok(())
    }

    fn query_range(&self, city_id: &str, window: Duration) -> Result<Vec<DataPoint>> {
        let window = chrono::Duration::from_std(window)
            .map_err(|e| SimError::TimeSeries(format!("invalid window: {e}")))?;
        let cutoff = Utc::now() - window;

        let Some(series) = self.series.get(city_id) else {
            return Ok(Vec::new());
        };
        let mut points: Vec<DataPoint> = series
            .iter()
            .filter(|p| p.timestamp >= cutoff)
            .cloned()
            .collect();
        points.sort_by_key(|p| p.timestamp);
        Ok(points)
    }
}

/// Forwards points to an InfluxDB v2 compatible endpoint.
///
/// Writes go through a bounded queue drained by a background task; a full
/// queue rejects the write instead of waiting. Every point is mirrored into
/// an in-memory store which answers `query_range`.
pub struct LineProtocolForwarder {
    queue: mpsc::Sender<DataPoint>,
    mirror: InMemoryTimeSeries,
}

impl LineProtocolForwarder {
    /// Must be called from inside a tokio runtime
    pub fn new(config: &TimeSeriesConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| SimError::TimeSeries(format!("failed to build HTTP client: {e}")))?;

        let endpoint = format!(
            "{}/api/v2/write?org={}&bucket={}&precision=ns",
            config.url.trim_end_matches('/'),
            config.org,
            config.bucket
        );
        let (queue, rx) = mpsc::channel(config.queue_capacity);

        info!(endpoint = %endpoint, queue_capacity = config.queue_capacity, "Starting line protocol forwarder");
        tokio::spawn(forward_loop(client, endpoint, config.token.clone(), rx));

        Ok(Self {
            queue,
            mirror: InMemoryTimeSeries::new(config.points_per_city),
        })
    }
}

impl TimeSeriesStore for LineProtocolForwarder {
    fn write(&self, point: DataPoint) -> Result<()> {
        self.mirror.write(point.clone())?;
        match self.queue.try_send(point) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(SimError::TimeSeries("forward queue full, point dropped".to_string()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(SimError::TimeSeries("forwarder stopped".to_string()))
            }
        }
    }

    fn query_range(&self, city_id: &str, window: Duration) -> Result<Vec<DataPoint>> {
        self.mirror.query_range(city_id, window)
    }
}

async fn forward_loop(
    client: Client,
    endpoint: String,
    token: Option<String>,
    mut rx: mpsc::Receiver<DataPoint>,
) {
    debug!("Line protocol forwarder started");

    while let Some(first) = rx.recv().await {
        let mut batch = vec![first.to_line_protocol()];
        while batch.len() < MAX_BATCH {
            match rx.try_recv() {
                Ok(point) => batch.push(point.to_line_protocol()),
                Err(_) => break,
            }
        }

        let mut request = client.post(&endpoint).body(batch.join("\n"));
        if let Some(token) = &token {
            request = request.header("Authorization", format!("Token {token}"));
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                counter!("netdrill_timeseries_points_forwarded_total", batch.len() as u64);
            }
            Ok(response) => {
                warn!(status = %response.status(), points = batch.len(), "Time-series server rejected write");
                counter!("netdrill_timeseries_write_failures_total", 1);
            }
            Err(e) => {
                warn!(error = %e, points = batch.len(), "Time-series write failed");
                counter!("netdrill_timeseries_write_failures_total", 1);
            }
        }
    }

    debug!("Line protocol forwarder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_protocol_format() {
        let timestamp = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let point = DataPoint::new("anomalies", "NYC", Region::NorthAmerica)
            .tag("type", "load")
            .tag("severity", "warning")
            .field("value", 85.0)
            .at(timestamp);

        assert_eq!(
            point.to_line_protocol(),
            "anomalies,cityId=NYC,region=North\\ America,severity=warning,type=load value=85 1700000000000000000"
        );
    }

    #[test]
    fn test_in_memory_query_window() {
        let store = InMemoryTimeSeries::new(10);
        let old = Utc::now() - chrono::Duration::hours(2);
        store
            .write(DataPoint::new("city_metrics", "PAR", Region::Europe).field("load", 1.0).at(old))
            .unwrap();
        store
            .write(DataPoint::new("city_metrics", "PAR", Region::Europe).field("load", 2.0))
            .unwrap();

        let recent = store.query_range("PAR", Duration::from_secs(3600)).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].fields["load"], 2.0);

        assert!(store.query_range("LON", Duration::from_secs(3600)).unwrap().is_empty());
    }

    #[test]
    fn test_in_memory_is_bounded_per_city() {
        let store = InMemoryTimeSeries::new(3);
        for i in 0..5 {
            store
                .write(DataPoint::new("city_metrics", "PAR", Region::Europe).field("load", i as f64))
                .unwrap();
        }
        assert_eq!(store.len("PAR"), 3);
        let points = store.query_range("PAR", Duration::from_secs(60)).unwrap();
        assert_eq!(points.first().unwrap().fields["load"], 2.0);
    }

    #[tokio::test]
    async fn test_forwarder_mirrors_writes() {
        let config = TimeSeriesConfig {
            // Nothing listens here; the background task only logs failures
            url: "http://127.0.0.1:9".to_string(),
            request_timeout_ms: 50,
            ..TimeSeriesConfig::default()
        };
        let forwarder = LineProtocolForwarder::new(&config).unwrap();
        forwarder
            .write(DataPoint::new("city_metrics", "PAR", Region::Europe).field("load", 42.0))
            .unwrap();

        let points = forwarder.query_range("PAR", Duration::from_secs(60)).unwrap();
        assert_eq!(points.len(), 1);
    }

    #[tokio::test]
    async fn test_forwarder_rejects_when_queue_full() {
        let config = TimeSeriesConfig {
            url: "http://127.0.0.1:9".to_string(),
            queue_capacity: 1,
            request_timeout_ms: 50,
            ..TimeSeriesConfig::default()
        };
        let forwarder = LineProtocolForwarder::new(&config).unwrap();

        // The current-thread test runtime has not polled the drain task yet
        let first = forwarder.write(DataPoint::new("city_metrics", "PAR", Region::Europe));
        let second = forwarder.write(DataPoint::new("city_metrics", "PAR", Region::Europe));
        assert!(first.is_ok());
        assert!(matches!(second, Err(SimError::TimeSeries(_))));
        assert_eq!(forwarder.query_range("PAR", Duration::from_secs(60)).unwrap().len(), 2);
    }
}
