//! Metrics & anomaly pipeline
//!
//! Raw samples are validated, reduced to derived metrics and classified
//! against the configured thresholds. The result is written to the state
//! store, the rolling cache and the time-series collaborator, and anomalies
//! are forwarded to the hub.

use crate::config::{ThresholdConfig, ThresholdPair};
use crate::error::{Result, SimError};
use crate::hub::{BroadcastHub, CityMetricsUpdate, PushEvent};
use crate::state::NetworkStore;
use crate::timeseries::{DataPoint, TimeSeriesStore};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use netdrill_common::{Anomaly, CityId, DerivedMetrics, MetricKind, RawSample, Region, Severity};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Outcome of one processed sample
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedMetrics {
    pub metrics: DerivedMetrics,
    pub anomalies: Vec<Anomaly>,
}

/// Latest sample of a city; superseded on each submission
#[derive(Debug, Clone)]
struct CacheEntry {
    received_at: Instant,
    derived: DerivedMetrics,
    anomalies: Vec<Anomaly>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AnomalyCounts {
    pub critical: usize,
    pub warning: usize,
}

/// Aggregate over recently reporting cities
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSummary {
    pub total_packets_processed: f64,
    pub average_latency: f64,
    pub average_load: f64,
    pub active_nodes: usize,
    pub anomalies: AnomalyCounts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    #[serde(rename = "type")]
    pub recommendation_type: String,
    pub priority: Priority,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistorySummary {
    pub samples: usize,
    pub average_latency: f64,
    pub max_load: f64,
    pub total_packets: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CityHistory {
    pub city_id: CityId,
    pub region: Region,
    pub points: Vec<DataPoint>,
    pub summary: HistorySummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkReport {
    pub timestamp: DateTime<Utc>,
    pub summary: NetworkSummary,
    pub cities_metrics: Vec<CityHistory>,
    pub recommendations: Vec<Recommendation>,
}

pub struct MetricsPipeline {
    store: Arc<NetworkStore>,
    hub: Arc<BroadcastHub>,
    timeseries: Arc<dyn TimeSeriesStore>,
    thresholds: ThresholdConfig,
    summary_window: Duration,
    cache: DashMap<CityId, CacheEntry>,
}

impl MetricsPipeline {
    pub fn new(
        store: Arc<NetworkStore>,
        hub: Arc<BroadcastHub>,
        timeseries: Arc<dyn TimeSeriesStore>,
        thresholds: ThresholdConfig,
        summary_window: Duration,
    ) -> Self {
        Self {
            store,
            hub,
            timeseries,
            thresholds,
            summary_window,
            cache: DashMap::new(),
        }
    }

    /// Validate, derive, classify and fan out one sample
    #[instrument(skip(self, raw))]
    pub async fn process_metrics(&self, city_id: &str, raw: &RawSample) -> Result<ProcessedMetrics> {
        let region = match self.store.topology().city(city_id) {
            Some(city) => city.region,
            None => return Err(SimError::CityNotFound(city_id.to_string())),
        };

        let derived = match derive(raw) {
            Ok(derived) => derived,
            Err(e) => {
                counter!("netdrill_samples_rejected_total", 1);
                debug!(error = %e, "Sample rejected");
                return Err(e);
            }
        };
        let anomalies = classify(&derived, &self.thresholds);

        self.store.apply_city_metrics(city_id, &derived).await?;
        self.cache.insert(
            city_id.to_string(),
            CacheEntry {
                received_at: Instant::now(),
                derived,
                anomalies: anomalies.clone(),
            },
        );

        self.record(city_id, region, &derived, &anomalies);
        counter!("netdrill_samples_processed_total", 1);

        if !anomalies.is_empty() {
            counter!("netdrill_anomalies_total", anomalies.len() as u64);
            self.hub.handle_anomalies(city_id, &anomalies).await;
        }

        self.hub.broadcast(PushEvent::CityMetrics(CityMetricsUpdate {
            city_id: city_id.to_string(),
            metrics: derived,
            anomalies: anomalies.clone(),
            timestamp: Utc::now(),
        }));

        Ok(ProcessedMetrics {
            metrics: derived,
            anomalies,
        })
    }

    /// Time-series writes; failures are logged and counted only
    fn record(&self, city_id: &str, region: Region, derived: &DerivedMetrics, anomalies: &[Anomaly]) {
        let mut points = vec![DataPoint::new("city_metrics", city_id, region)
            .field("latency", derived.average_latency)
            .field("load", derived.load)
            .field("packet_loss", derived.packet_loss)
            .field("packets_processed", derived.packets_processed)
            .field("bandwidth_usage", derived.bandwidth_usage)
            .field("performance_score", derived.performance_score)];
        points.extend(anomalies.iter().map(|a| {
            DataPoint::new("anomalies", city_id, region)
                .tag("type", a.metric_type.as_str())
                .tag("severity", a.severity.as_str())
                .field("value", a.value)
                .field("threshold", a.threshold_crossed)
        }));

        for point in points {
            if let Err(e) = self.timeseries.write(point) {
                warn!(city_id = %city_id, error = %e, "Time-series write failed");
                counter!("netdrill_timeseries_write_failures_total", 1);
            }
        }
    }

    /// Aggregate over cache entries younger than the summary window
    pub fn network_summary(&self) -> NetworkSummary {
        let now = Instant::now();
        let mut summary = NetworkSummary::default();

        for entry in self.cache.iter() {
            if now.duration_since(entry.received_at) >= self.summary_window {
                continue;
            }
            summary.total_packets_processed += entry.derived.packets_processed;
            summary.average_latency += entry.derived.average_latency;
            summary.average_load += entry.derived.load;
            summary.active_nodes += 1;
            for anomaly in &entry.anomalies {
                match anomaly.severity {
                    Severity::Critical => summary.anomalies.critical += 1,
                    Severity::Warning => summary.anomalies.warning += 1,
                }
            }
        }

        if summary.active_nodes > 0 {
            summary.average_latency /= summary.active_nodes as f64;
            summary.average_load /= summary.active_nodes as f64;
        }
        summary
    }

    /// Stored points for one city plus a reduction of its `city_metrics`
    pub fn historical_metrics(&self, city_id: &str, window: Duration) -> Result<CityHistory> {
        let region = self
            .store
            .topology()
            .city(city_id)
            .map(|c| c.region)
            .ok_or_else(|| SimError::CityNotFound(city_id.to_string()))?;

        let points = self.timeseries.query_range(city_id, window)?;
        let summary = summarize_history(&points);
        Ok(CityHistory {
            city_id: city_id.to_string(),
            region,
            points,
            summary,
        })
    }

    /// Summary, per-city history and recommendations in one document
    pub fn network_report(&self, window: Duration) -> NetworkReport {
        let summary = self.network_summary();
        let cities_metrics = self
            .store
            .topology()
            .cities()
            .iter()
            .filter_map(|city| match self.historical_metrics(&city.id, window) {
                Ok(history) => Some(history),
                Err(e) => {
                    warn!(city_id = %city.id, error = %e, "History query failed");
                    None
                }
            })
            .collect();

        NetworkReport {
            timestamp: Utc::now(),
            summary,
            cities_metrics,
            recommendations: recommendations(&summary),
        }
    }

    pub fn thresholds(&self) -> &ThresholdConfig {
        &self.thresholds
    }
}

/// Reduce a raw sample; rejects missing, negative or non-finite numbers
pub fn derive(raw: &RawSample) -> Result<DerivedMetrics> {
    let latencies: Vec<f64> = match (&raw.latencies, raw.latency) {
        (Some(list), _) => list.clone(),
        (None, Some(latency)) => vec![latency],
        (None, None) => return Err(SimError::InvalidMetrics("missing latency".to_string())),
    };
    let load = required("load", raw.load)?;
    let sent = required("sent", raw.sent)?;
    let received = required("received", raw.received)?;
    let processed = required("processed", raw.processed)?;
    let bandwidth_usage = match raw.bandwidth_usage {
        Some(value) => checked("bandwidthUsage", value)?,
        None => 0.0,
    };
    for latency in &latencies {
        checked("latency", *latency)?;
    }
    if received > sent {
        return Err(SimError::InvalidMetrics(format!(
            "received ({received}) exceeds sent ({sent})"
        )));
    }

    let average_latency = if latencies.is_empty() {
        0.0
    } else {
        latencies.iter().sum::<f64>() / latencies.len() as f64
    };
    let packet_loss = if sent == 0.0 { 0.0 } else { (sent - received) / sent };

    Ok(DerivedMetrics {
        average_latency,
        load,
        packet_loss,
        packets_processed: processed,
        packets_dropped: sent - received,
        bandwidth_usage,
        performance_score: performance_score(average_latency, packet_loss, load),
    })
}

fn required(name: &str, value: Option<f64>) -> Result<f64> {
    match value {
        Some(value) => checked(name, value),
        None => Err(SimError::InvalidMetrics(format!("missing {name}"))),
    }
}

fn checked(name: &str, value: f64) -> Result<f64> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(SimError::InvalidMetrics(format!("{name} must be a finite non-negative number, got {value}")))
    }
}

/// Weighted 0-100 score: latency 40%, reliability 40%, spare capacity 20%
pub fn performance_score(average_latency: f64, packet_loss: f64, load: f64) -> f64 {
    let latency_score = (100.0 - average_latency / 2.0).max(0.0);
    let reliability_score = (1.0 - packet_loss) * 100.0;
    let load_score = (100.0 - load).max(0.0);
    latency_score * 0.4 + reliability_score * 0.4 + load_score * 0.2
}

/// At most one anomaly per metric, critical checked first, strict `>`
pub fn classify(derived: &DerivedMetrics, thresholds: &ThresholdConfig) -> Vec<Anomaly> {
    [
        (MetricKind::Latency, derived.average_latency, thresholds.latency),
        (MetricKind::PacketLoss, derived.packet_loss, thresholds.packet_loss),
        (MetricKind::Load, derived.load, thresholds.load),
    ]
    .into_iter()
    .filter_map(|(kind, value, pair)| check(kind, value, pair))
    .collect()
}

fn check(metric_type: MetricKind, value: f64, pair: ThresholdPair) -> Option<Anomaly> {
    let (severity, threshold_crossed) = if value > pair.critical {
        (Severity::Critical, pair.critical)
    } else if value > pair.warning {
        (Severity::Warning, pair.warning)
    } else {
        return None;
    };
    Some(Anomaly {
        metric_type,
        severity,
        value,
        threshold_crossed,
    })
}

pub fn recommendations(summary: &NetworkSummary) -> Vec<Recommendation> {
    let mut out = Vec::new();
    if summary.average_load > 70.0 {
        out.push(Recommendation {
            recommendation_type: "load_balancing".to_string(),
            priority: Priority::High,
            message: "Consider implementing load balancing across regions".to_string(),
        });
    }
    if summary.average_latency > 100.0 {
        out.push(Recommendation {
            recommendation_type: "latency_optimization".to_string(),
            priority: Priority::Medium,
            message: "Review and optimize routing paths for high-latency connections".to_string(),
        });
    }
    out
}

fn summarize_history(points: &[DataPoint]) -> HistorySummary {
    let samples: Vec<&DataPoint> = points.iter().filter(|p| p.measurement == "city_metrics").collect();
    if samples.is_empty() {
        return HistorySummary::default();
    }

    let field = |p: &DataPoint, key: &str| p.fields.get(key).copied().unwrap_or(0.0);
    HistorySummary {
        samples: samples.len(),
        average_latency: samples.iter().map(|p| field(p, "latency")).sum::<f64>() / samples.len() as f64,
        max_load: samples.iter().map(|p| field(p, "load")).fold(0.0, f64::max),
        total_packets: samples.iter().map(|p| field(p, "packets_processed")).sum(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AlertConfig, SessionConfig};
    use crate::timeseries::InMemoryTimeSeries;
    use crate::topology::Topology;

    fn sample(latencies: Vec<f64>, load: f64, sent: f64, received: f64) -> RawSample {
        RawSample {
            latencies: Some(latencies),
            load: Some(load),
            sent: Some(sent),
            received: Some(received),
            processed: Some(received),
            bandwidth_usage: Some(50.0),
            ..RawSample::default()
        }
    }

    fn pipeline() -> (MetricsPipeline, Arc<NetworkStore>, Arc<BroadcastHub>, Arc<InMemoryTimeSeries>) {
        let topology = Arc::new(Topology::default_network());
        let store = Arc::new(NetworkStore::new(topology.clone(), Some(3)));
        let hub = Arc::new(BroadcastHub::new(topology, &AlertConfig::default(), &SessionConfig::default()));
        let timeseries = Arc::new(InMemoryTimeSeries::new(100));
        let pipeline = MetricsPipeline::new(
            store.clone(),
            hub.clone(),
            timeseries.clone(),
            ThresholdConfig::default(),
            Duration::from_secs(60),
        );
        (pipeline, store, hub, timeseries)
    }

    #[test]
    fn test_derive_reference_sample() {
        let derived = derive(&sample(vec![80.0, 100.0, 120.0], 85.0, 1000.0, 950.0)).unwrap();
        assert_eq!(derived.average_latency, 100.0);
        assert!((derived.packet_loss - 0.05).abs() < 1e-12);
        assert_eq!(derived.packets_dropped, 50.0);
        // 0.4 * 50 + 0.4 * 95 + 0.2 * 15
        assert!((derived.performance_score - 61.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_sent_has_no_loss() {
        let derived = derive(&sample(vec![10.0], 10.0, 0.0, 0.0)).unwrap();
        assert_eq!(derived.packet_loss, 0.0);
    }

    #[test]
    fn test_empty_latency_list_averages_to_zero() {
        let derived = derive(&sample(Vec::new(), 10.0, 10.0, 10.0)).unwrap();
        assert_eq!(derived.average_latency, 0.0);
    }

    #[test]
    fn test_scalar_latency_and_alias_accepted() {
        let raw: RawSample = serde_json::from_str(
            r#"{"latency": 42, "load": 10, "sent": 5, "received": 5, "packetsProcessed": 5}"#,
        )
        .unwrap();
        let derived = derive(&raw).unwrap();
        assert_eq!(derived.average_latency, 42.0);
        assert_eq!(derived.packets_processed, 5.0);
    }

    #[test]
    fn test_invalid_samples_rejected() {
        let mut raw = sample(vec![10.0], 10.0, 10.0, 10.0);
        raw.load = None;
        assert!(matches!(derive(&raw), Err(SimError::InvalidMetrics(_))));

        let raw = sample(vec![10.0], 10.0, 10.0, 20.0);
        assert!(matches!(derive(&raw), Err(SimError::InvalidMetrics(_))));

        let raw = sample(vec![f64::NAN], 10.0, 10.0, 10.0);
        assert!(matches!(derive(&raw), Err(SimError::InvalidMetrics(_))));

        let raw = sample(vec![10.0], -1.0, 10.0, 10.0);
        assert!(matches!(derive(&raw), Err(SimError::InvalidMetrics(_))));
    }

    #[test]
    fn test_threshold_equality_not_flagged() {
        let thresholds = ThresholdConfig::default();
        let at_warning = DerivedMetrics {
            average_latency: 100.0,
            load: 80.0,
            packet_loss: 0.05,
            ..DerivedMetrics::default()
        };
        assert!(classify(&at_warning, &thresholds).is_empty());

        let at_critical = DerivedMetrics {
            average_latency: 200.0,
            load: 90.0,
            packet_loss: 0.10,
            ..DerivedMetrics::default()
        };
        let anomalies = classify(&at_critical, &thresholds);
        assert_eq!(anomalies.len(), 3);
        assert!(anomalies.iter().all(|a| a.severity == Severity::Warning));
    }

    #[test]
    fn test_critical_wins_over_warning() {
        let derived = DerivedMetrics {
            average_latency: 250.0,
            ..DerivedMetrics::default()
        };
        let anomalies = classify(&derived, &ThresholdConfig::default());
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].severity, Severity::Critical);
        assert_eq!(anomalies[0].threshold_crossed, 200.0);
    }

    #[test]
    fn test_recommendations() {
        let quiet = NetworkSummary::default();
        assert!(recommendations(&quiet).is_empty());

        let busy = NetworkSummary {
            average_load: 75.0,
            average_latency: 150.0,
            ..NetworkSummary::default()
        };
        let recs = recommendations(&busy);
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].recommendation_type, "load_balancing");
        assert_eq!(recs[0].priority, Priority::High);
        assert_eq!(recs[1].priority, Priority::Medium);
    }

    #[tokio::test]
    async fn test_process_metrics_fans_out() {
        let (pipeline, store, hub, timeseries) = pipeline();
        let result = pipeline
            .process_metrics("PAR", &sample(vec![80.0, 100.0, 120.0], 85.0, 1000.0, 950.0))
            .await
            .unwrap();

        assert_eq!(result.anomalies.len(), 1);
        assert_eq!(result.anomalies[0].metric_type, MetricKind::Load);
        assert_eq!(result.anomalies[0].severity, Severity::Warning);

        let city = store.city("PAR").await.unwrap();
        assert_eq!(city.metrics.latency, 100.0);
        assert_eq!(city.metrics.throughput, 50.0);

        assert_eq!(hub.alerts().await.len(), 1);
        // One city_metrics point and one anomaly point
        assert_eq!(timeseries.len("PAR"), 2);

        let summary = pipeline.network_summary();
        assert_eq!(summary.active_nodes, 1);
        assert_eq!(summary.anomalies.warning, 1);
        assert_eq!(summary.total_packets_processed, 950.0);
    }

    /// Time-series backend that rejects every write
    struct UnreachableTimeSeries;

    impl TimeSeriesStore for UnreachableTimeSeries {
        fn write(&self, _point: DataPoint) -> Result<()> {
            Err(SimError::TimeSeries("backend unreachable".to_string()))
        }

        fn query_range(&self, _city_id: &str, _window: Duration) -> Result<Vec<DataPoint>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_time_series_failure_does_not_fail_submission() {
        let topology = Arc::new(Topology::default_network());
        let store = Arc::new(NetworkStore::new(topology.clone(), Some(3)));
        let hub = Arc::new(BroadcastHub::new(topology, &AlertConfig::default(), &SessionConfig::default()));
        let pipeline = MetricsPipeline::new(
            store.clone(),
            hub.clone(),
            Arc::new(UnreachableTimeSeries),
            ThresholdConfig::default(),
            Duration::from_secs(60),
        );

        let result = pipeline
            .process_metrics("PAR", &sample(vec![80.0, 100.0, 120.0], 85.0, 1000.0, 950.0))
            .await
            .unwrap();
        assert_eq!(result.anomalies.len(), 1);

        assert_eq!(store.city("PAR").await.unwrap().metrics.latency, 100.0);
        assert_eq!(hub.alerts().await.len(), 1);
        assert_eq!(pipeline.network_summary().active_nodes, 1);
    }

    #[tokio::test]
    async fn test_unknown_city_rejected_before_validation() {
        let (pipeline, ..) = pipeline();
        let result = pipeline.process_metrics("XXX", &RawSample::default()).await;
        assert!(matches!(result, Err(SimError::CityNotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_summary_window_excludes_stale_entries() {
        let (pipeline, ..) = pipeline();
        pipeline
            .process_metrics("PAR", &sample(vec![10.0], 10.0, 10.0, 10.0))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        pipeline
            .process_metrics("LON", &sample(vec![30.0], 50.0, 10.0, 10.0))
            .await
            .unwrap();

        let summary = pipeline.network_summary();
        assert_eq!(summary.active_nodes, 1);
        assert_eq!(summary.average_latency, 30.0);
        assert_eq!(summary.average_load, 50.0);
    }

    #[tokio::test]
    async fn test_historical_metrics_summary() {
        let (pipeline, ..) = pipeline();
        for load in [20.0, 60.0] {
            pipeline
                .process_metrics("PAR", &sample(vec![40.0], load, 100.0, 100.0))
                .await
                .unwrap();
        }
        let history = pipeline.historical_metrics("PAR", Duration::from_secs(3600)).unwrap();
        assert_eq!(history.summary.samples, 2);
        assert_eq!(history.summary.max_load, 60.0);
        assert_eq!(history.summary.total_packets, 200.0);

        let report = pipeline.network_report(Duration::from_secs(3600));
        assert_eq!(report.cities_metrics.len(), 18);
    }
}
