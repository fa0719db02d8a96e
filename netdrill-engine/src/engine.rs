//! Simulation engine
//!
//! Wires topology, state store, pipeline, hub, scheduler and the time-series
//! collaborator once, and exposes the read/control surface used by the HTTP
//! layer.

use crate::config::{EngineConfig, TimeSeriesBackend};
use crate::error::{Result, SimError};
use crate::hub::{BroadcastHub, ConnectionMetricsUpdate, PushEvent, SessionData};
use crate::pipeline::{CityHistory, MetricsPipeline, NetworkReport, ProcessedMetrics};
use crate::scenario::ScenarioCatalog;
use crate::scheduler::{ActiveStatus, ScenarioReport, ScenarioScheduler};
use crate::state::{CityState, LinkState, NetworkStore};
use crate::timeseries::{InMemoryTimeSeries, LineProtocolForwarder, TimeSeriesStore};
use crate::topology::Topology;
use chrono::{DateTime, Utc};
use metrics::counter;
use netdrill_common::{
    Alert, CityId, CityStatus, DerivedMetrics, LinkId, LinkMetrics, LinkStatus, RawSample, Region,
    Role,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Initial frame for every session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkView {
    pub timestamp: DateTime<Utc>,
    pub cities: Vec<CityState>,
    pub links: Vec<LinkState>,
    /// Links that are not down
    pub active_connections: Vec<LinkId>,
    pub alerts: Vec<Alert>,
}

/// Dashboard aggregate for teacher sessions
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeacherMetrics {
    pub active_students: usize,
    /// Mean over cities reporting a latency above zero
    pub average_latency: f64,
    pub total_traffic: f64,
    pub active_connections: usize,
    pub alerts: Vec<Alert>,
    pub scenario: Option<ActiveStatus>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CityDetail {
    #[serde(flatten)]
    pub city: CityState,
    pub links: Vec<LinkState>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NeighborView {
    pub city_id: CityId,
    pub name: String,
    pub region: Region,
    pub status: CityStatus,
    pub latency: f64,
    pub load: f64,
    pub link: LinkState,
}

/// Response to a student's first connection
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentAssignment {
    pub student_id: String,
    pub city_id: CityId,
    pub city_name: String,
    pub region: Region,
    pub neighbors: Vec<CityId>,
    pub initial_state: CityState,
}

#[derive(Debug, Clone, Serialize)]
pub struct Feedback {
    #[serde(rename = "type")]
    pub feedback_type: String,
    pub message: String,
    pub suggestion: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub processed: ProcessedMetrics,
    pub feedback: Vec<Feedback>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Hint {
    #[serde(rename = "type")]
    pub hint_type: String,
    pub message: String,
    pub action: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DifficultyLevel {
    Easy,
    Medium,
    Hard,
}

#[derive(Debug, Clone, Serialize)]
pub struct CityHints {
    pub hints: Vec<Hint>,
    pub difficulty: DifficultyLevel,
    /// Number of metrics above their warning threshold
    pub factors: usize,
}

/// Outcome of a message sent between adjacent cities
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReceipt {
    pub message_id: Uuid,
    pub from: CityId,
    pub to: CityId,
    pub delivered: bool,
    /// Link latency in milliseconds at send time
    pub latency: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

pub struct SimulationEngine {
    config: EngineConfig,
    topology: Arc<Topology>,
    store: Arc<NetworkStore>,
    pipeline: Arc<MetricsPipeline>,
    hub: Arc<BroadcastHub>,
    scheduler: Arc<ScenarioScheduler>,
    rng: Mutex<StdRng>,
}

impl SimulationEngine {
    /// Build every component from configuration.
    ///
    /// The line protocol backend spawns its forwarder, so this must run
    /// inside a tokio runtime when that backend is selected.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let timeseries: Arc<dyn TimeSeriesStore> = match config.timeseries.backend {
            TimeSeriesBackend::Memory => {
                Arc::new(InMemoryTimeSeries::new(config.timeseries.points_per_city))
            }
            TimeSeriesBackend::LineProtocol => Arc::new(LineProtocolForwarder::new(&config.timeseries)?),
        };
        Self::with_timeseries(config, timeseries)
    }

    pub fn with_timeseries(config: EngineConfig, timeseries: Arc<dyn TimeSeriesStore>) -> Result<Self> {
        config.validate().map_err(SimError::Config)?;

        let topology = Arc::new(match &config.topology.path {
            Some(path) => Topology::from_file(path)?,
            None => Topology::default_network(),
        });

        let mut rng = match config.simulation.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut catalog = ScenarioCatalog::builtin(&topology, &mut rng);
        for definition in &config.scenarios {
            catalog.insert(definition.clone())?;
        }

        let store = Arc::new(NetworkStore::new(topology.clone(), config.simulation.seed));
        let hub = Arc::new(BroadcastHub::new(topology.clone(), &config.alerts, &config.sessions));
        let pipeline = Arc::new(MetricsPipeline::new(
            store.clone(),
            hub.clone(),
            timeseries,
            config.thresholds.clone(),
            config.summary_window(),
        ));
        let scheduler = Arc::new(ScenarioScheduler::new(
            store.clone(),
            pipeline.clone(),
            hub.clone(),
            catalog,
            config.simulation.clone(),
        ));

        info!(
            cities = topology.cities().len(),
            links = topology.links().len(),
            scenarios = scheduler.catalog().len(),
            backend = ?config.timeseries.backend,
            "Simulation engine initialized"
        );

        Ok(Self {
            config,
            topology,
            store,
            pipeline,
            hub,
            scheduler,
            rng: Mutex::new(rng),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn store(&self) -> &Arc<NetworkStore> {
        &self.store
    }

    pub fn pipeline(&self) -> &Arc<MetricsPipeline> {
        &self.pipeline
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn scheduler(&self) -> &Arc<ScenarioScheduler> {
        &self.scheduler
    }

    pub async fn network_state(&self) -> NetworkView {
        let snapshot = self.store.snapshot().await;
        let active_connections = snapshot
            .links
            .iter()
            .filter(|l| l.status != LinkStatus::Down)
            .map(|l| l.id.clone())
            .collect();

        NetworkView {
            timestamp: snapshot.timestamp,
            cities: snapshot.cities,
            links: snapshot.links,
            active_connections,
            alerts: self.hub.recent_alerts(self.config.alerts.snapshot_tail).await,
        }
    }

    pub async fn city_state(&self, city_id: &str) -> Result<CityDetail> {
        let city = self.store.city(city_id).await?;
        let links = self.store.links_of(city_id).await?;
        Ok(CityDetail { city, links })
    }

    pub async fn teacher_metrics(&self) -> TeacherMetrics {
        let snapshot = self.store.snapshot().await;

        let reporting: Vec<f64> = snapshot
            .cities
            .iter()
            .map(|c| c.metrics.latency)
            .filter(|latency| *latency > 0.0)
            .collect();
        let average_latency = if reporting.is_empty() {
            0.0
        } else {
            reporting.iter().sum::<f64>() / reporting.len() as f64
        };

        TeacherMetrics {
            active_students: self.hub.session_count(Role::Student),
            average_latency,
            total_traffic: snapshot.cities.iter().map(|c| c.metrics.throughput).sum(),
            active_connections: snapshot
                .links
                .iter()
                .filter(|l| l.status != LinkStatus::Down)
                .count(),
            alerts: self.hub.alerts().await,
            scenario: self.scheduler.active_status().await,
        }
    }

    pub async fn neighbors(&self, city_id: &str) -> Result<Vec<NeighborView>> {
        let specs = self.topology.neighbors(city_id)?;
        let mut views = Vec::with_capacity(specs.len());
        for spec in specs {
            let state = self.store.city(&spec.id).await?;
            let link = self.store.link(&LinkId::between(city_id, &spec.id)).await?;
            views.push(NeighborView {
                city_id: spec.id.clone(),
                name: spec.name.clone(),
                region: spec.region,
                status: state.status,
                latency: state.metrics.latency,
                load: state.metrics.load,
                link,
            });
        }
        Ok(views)
    }

    pub fn are_neighbors(&self, a: &str, b: &str) -> bool {
        self.topology.are_neighbors(a, b)
    }

    /// Report of the running scenario, if any
    pub async fn scenario_report(&self) -> Option<ScenarioReport> {
        self.scheduler.report().await
    }

    pub fn city_history(&self, city_id: &str, window: Duration) -> Result<CityHistory> {
        self.pipeline.historical_metrics(city_id, window)
    }

    pub fn network_report(&self, window: Duration) -> NetworkReport {
        self.pipeline.network_report(window)
    }

    /// Process a submitted sample and attach operator feedback
    pub async fn submit_metrics(&self, city_id: &str, raw: &RawSample) -> Result<Submission> {
        let processed = self.pipeline.process_metrics(city_id, raw).await?;
        let feedback = feedback(&processed.metrics);
        Ok(Submission { processed, feedback })
    }

    /// Overwrite the metrics of the link between two cities and push them
    #[instrument(skip(self, metrics))]
    pub async fn update_link_metrics(&self, a: &str, b: &str, metrics: LinkMetrics) -> Result<LinkState> {
        for city in [a, b] {
            if !self.topology.contains_city(city) {
                return Err(SimError::CityNotFound(city.to_string()));
            }
        }
        for (name, value) in [
            ("latency", metrics.latency),
            ("bandwidth", metrics.bandwidth),
            ("packetLoss", metrics.packet_loss),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(SimError::InvalidMetrics(format!("{name} must be a finite non-negative number")));
            }
        }

        let link = self.store.apply_link_metrics(&LinkId::between(a, b), metrics).await?;
        self.hub.broadcast(PushEvent::ConnectionMetrics(ConnectionMetricsUpdate {
            connection_id: link.id.clone(),
            status: link.status,
            metrics: link.metrics,
            timestamp: Utc::now(),
        }));
        Ok(link)
    }

    /// Send a message over a direct link; offline endpoints, a down link or
    /// the link's packet loss draw prevent delivery.
    #[instrument(skip(self, payload))]
    pub async fn transmit_message(
        &self,
        from: &str,
        to: &str,
        payload: &serde_json::Value,
    ) -> Result<MessageReceipt> {
        for city in [from, to] {
            if !self.topology.contains_city(city) {
                return Err(SimError::CityNotFound(city.to_string()));
            }
        }
        if !self.topology.are_neighbors(from, to) {
            return Err(SimError::TargetNotNeighbor {
                city: from.to_string(),
                target: to.to_string(),
            });
        }

        let source = self.store.city(from).await?;
        let target = self.store.city(to).await?;
        let link = self.store.link(&LinkId::between(from, to)).await?;

        let reason = if source.status == CityStatus::Offline || target.status == CityStatus::Offline {
            Some("city offline")
        } else if link.status == LinkStatus::Down {
            Some("link down")
        } else if self.rng.lock().await.gen::<f64>() < link.metrics.packet_loss {
            Some("packet lost")
        } else {
            None
        };

        let receipt = MessageReceipt {
            message_id: Uuid::new_v4(),
            from: from.to_string(),
            to: to.to_string(),
            delivered: reason.is_none(),
            latency: link.metrics.latency,
            reason: reason.map(str::to_string),
            timestamp: Utc::now(),
        };

        let outcome = if receipt.delivered { "delivered" } else { "dropped" };
        counter!("netdrill_messages_total", 1, "outcome" => outcome);
        debug!(
            message_id = %receipt.message_id,
            outcome,
            payload_bytes = payload.to_string().len(),
            "Message transmitted"
        );
        Ok(receipt)
    }

    /// Assign a city to a student (idempotent) and return its starting state
    pub async fn init_student(&self, student_id: &str) -> Result<StudentAssignment> {
        let city_id = self.hub.assign_city_to_student(student_id).await?;
        let spec = self
            .topology
            .city(&city_id)
            .ok_or_else(|| SimError::CityNotFound(city_id.clone()))?;
        let initial_state = self.store.city(&city_id).await?;

        Ok(StudentAssignment {
            student_id: student_id.to_string(),
            city_id: city_id.clone(),
            city_name: spec.name.clone(),
            region: spec.region,
            neighbors: initial_state.neighbors.clone(),
            initial_state,
        })
    }

    /// Guidance for the student operating a city
    pub async fn city_hints(&self, city_id: &str) -> Result<CityHints> {
        let city = self.store.city(city_id).await?;
        let metrics = city.metrics;
        let thresholds = self.pipeline.thresholds();

        let mut hints = Vec::new();
        if metrics.latency > 150.0 {
            hints.push(Hint {
                hint_type: "performance".to_string(),
                message: "Response times are very high".to_string(),
                action: "Examine the alternative routes available".to_string(),
            });
        }
        if metrics.load > thresholds.load.critical {
            hints.push(Hint {
                hint_type: "load".to_string(),
                message: "Network load is critical".to_string(),
                action: "Spread traffic over several routes".to_string(),
            });
        }

        let factors = [
            metrics.latency > thresholds.latency.warning,
            metrics.load > thresholds.load.warning,
            metrics.packet_loss > thresholds.packet_loss.warning,
        ]
        .into_iter()
        .filter(|over| *over)
        .count();
        let difficulty = match factors {
            0 => DifficultyLevel::Easy,
            1 => DifficultyLevel::Medium,
            _ => DifficultyLevel::Hard,
        };

        Ok(CityHints {
            hints,
            difficulty,
            factors,
        })
    }

    /// Open a push session and queue its initial frames
    pub async fn connect(&self, role: Role, data: SessionData) -> Result<(Uuid, mpsc::Receiver<PushEvent>)> {
        let (connection_id, rx) = self.hub.register_session(role, data).await?;

        let view = self.network_state().await;
        self.hub.send_to(connection_id, PushEvent::NetworkState(Box::new(view)));
        if role == Role::Teacher {
            let metrics = self.teacher_metrics().await;
            self.hub.send_to(connection_id, PushEvent::TeacherMetrics(Box::new(metrics)));
        }
        Ok((connection_id, rx))
    }

    pub async fn disconnect(&self, connection_id: Uuid) {
        self.hub.remove_session(connection_id).await;
    }
}

fn feedback(metrics: &DerivedMetrics) -> Vec<Feedback> {
    let mut out = Vec::new();
    if metrics.average_latency > 100.0 {
        out.push(Feedback {
            feedback_type: "warning".to_string(),
            message: "High latency detected".to_string(),
            suggestion: "Check the alternative routes available".to_string(),
        });
    }
    if metrics.load > 80.0 {
        out.push(Feedback {
            feedback_type: "warning".to_string(),
            message: "Heavy load".to_string(),
            suggestion: "Consider redistributing traffic".to_string(),
        });
    }
    out
}
