//! Scenario scheduler
//!
//! Drives the active scenario: dispatches due events on the scenario tick,
//! applies background drift on the drift tick, and performs the end
//! transition (report, broadcast, baseline reset). At most one scenario is
//! active at a time.

use crate::config::SimulationConfig;
use crate::error::{Result, SimError};
use crate::hub::{
    BroadcastHub, ConnectionMetricsUpdate, EventOccurred, NetworkStateUpdate, PushEvent,
    ScenarioEnded, ScenarioStarted,
};
use crate::pipeline::{recommendations, MetricsPipeline, NetworkSummary, ProcessedMetrics, Recommendation};
use crate::scenario::{EventKind, ScenarioCatalog, ScenarioDefinition, ScenarioSummary, ScheduledEvent};
use crate::state::{CityCounters, DriftOutcome, LinkState, NetworkStore};
use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use netdrill_common::{CityId, CityMetrics, CityStatus, LinkId, LinkStatus, RawSample};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Packets in one synthetic attack sample
const DDOS_SAMPLE_PACKETS: f64 = 10_000.0;

/// Final state of one city in a scenario report
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CityPerformance {
    pub city_id: CityId,
    pub status: CityStatus,
    pub metrics: CityMetrics,
    pub counters: CityCounters,
    pub links: Vec<LinkState>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioReport {
    pub scenario_id: String,
    pub name: String,
    pub started_at: DateTime<Utc>,
    /// Seconds elapsed when the report was taken
    pub duration: f64,
    pub events_dispatched: usize,
    pub events_failed: usize,
    pub events_pending: usize,
    pub metrics: NetworkSummary,
    pub city_performance: Vec<CityPerformance>,
    pub recommendations: Vec<Recommendation>,
}

/// Progress of the running scenario
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveStatus {
    pub scenario_id: String,
    pub name: String,
    pub elapsed_seconds: f64,
    pub duration: u64,
    pub pending_events: Vec<ScheduledEvent>,
    pub events_dispatched: usize,
    pub events_failed: usize,
}

#[derive(Debug)]
pub enum TickOutcome {
    Idle,
    Running { dispatched: usize, failed: usize },
    Ended(Box<ScenarioReport>),
}

struct ActiveScenario {
    definition: ScenarioDefinition,
    started_at: Instant,
    started_at_utc: DateTime<Utc>,
    queue: VecDeque<ScheduledEvent>,
    dispatched: usize,
    failed: usize,
}

pub struct ScenarioScheduler {
    store: Arc<NetworkStore>,
    pipeline: Arc<MetricsPipeline>,
    hub: Arc<BroadcastHub>,
    catalog: ScenarioCatalog,
    active: Mutex<Option<ActiveScenario>>,
    /// City -> attack intensity while a DDoS is in progress
    ddos: Mutex<HashMap<CityId, f64>>,
    settings: SimulationConfig,
}

impl ScenarioScheduler {
    pub fn new(
        store: Arc<NetworkStore>,
        pipeline: Arc<MetricsPipeline>,
        hub: Arc<BroadcastHub>,
        catalog: ScenarioCatalog,
        settings: SimulationConfig,
    ) -> Self {
        Self {
            store,
            pipeline,
            hub,
            catalog,
            active: Mutex::new(None),
            ddos: Mutex::new(HashMap::new()),
            settings,
        }
    }

    pub fn list_scenarios(&self) -> Vec<ScenarioSummary> {
        self.catalog.summaries()
    }

    pub fn catalog(&self) -> &ScenarioCatalog {
        &self.catalog
    }

    /// Activate a scenario; its events are copied and stable-sorted by offset
    #[instrument(skip(self))]
    pub async fn start(&self, scenario_id: &str) -> Result<ScenarioStarted> {
        let definition = self
            .catalog
            .get(scenario_id)
            .cloned()
            .ok_or_else(|| SimError::UnknownScenario(scenario_id.to_string()))?;

        let mut active = self.active.lock().await;
        if let Some(running) = active.as_ref() {
            return Err(SimError::ScenarioAlreadyRunning(running.definition.id.clone()));
        }

        let mut events = definition.events.clone();
        events.sort_by(|a, b| a.fire_offset_seconds.total_cmp(&b.fire_offset_seconds));

        let started = ScenarioStarted {
            scenario_id: definition.id.clone(),
            name: definition.name.clone(),
            description: definition.description.clone(),
            duration: definition.duration,
            timestamp: Utc::now(),
        };
        info!(
            scenario_id = %definition.id,
            events = events.len(),
            duration = definition.duration,
            "Scenario started"
        );

        *active = Some(ActiveScenario {
            definition,
            started_at: Instant::now(),
            started_at_utc: started.timestamp,
            queue: events.into(),
            dispatched: 0,
            failed: 0,
        });
        drop(active);

        counter!("netdrill_scenarios_started_total", 1);
        gauge!("netdrill_scenario_active", 1.0);
        self.hub.broadcast(PushEvent::ScenarioStarted(started.clone()));
        Ok(started)
    }

    /// Dispatch every due event, then end the scenario once its duration is reached
    pub async fn tick(&self) -> TickOutcome {
        let mut guard = self.active.lock().await;
        let Some(active) = guard.as_mut() else {
            return TickOutcome::Idle;
        };

        let elapsed = active.started_at.elapsed().as_secs_f64();
        let mut dispatched = 0;
        let mut failed = 0;
        while active
            .queue
            .front()
            .is_some_and(|event| event.fire_offset_seconds <= elapsed)
        {
            let Some(event) = active.queue.pop_front() else {
                break;
            };
            if !self.dispatch(&active.definition.id, event).await {
                failed += 1;
            }
            dispatched += 1;
        }
        active.dispatched += dispatched;
        active.failed += failed;

        if elapsed >= active.definition.duration as f64 {
            let report = self.finish(active).await;
            *guard = None;
            return TickOutcome::Ended(Box::new(report));
        }
        TickOutcome::Running { dispatched, failed }
    }

    /// Apply one event; a failing handler is logged and counted, never propagated
    async fn dispatch(&self, scenario_id: &str, event: ScheduledEvent) -> bool {
        let event_type = event.kind.type_name();
        let ok = match self.apply(&event.kind).await {
            Ok(()) => {
                debug!(scenario_id = %scenario_id, event_type, offset = event.fire_offset_seconds, "Event dispatched");
                counter!("netdrill_scenario_events_total", 1, "type" => event_type);
                true
            }
            Err(e) => {
                warn!(scenario_id = %scenario_id, event_type, error = %e, "Event handler failed, skipping");
                counter!("netdrill_scenario_event_failures_total", 1, "type" => event_type);
                false
            }
        };

        self.hub.broadcast(PushEvent::EventOccurred(EventOccurred {
            scenario_id: scenario_id.to_string(),
            event,
            timestamp: Utc::now(),
        }));
        ok
    }

    async fn apply(&self, kind: &EventKind) -> Result<()> {
        match kind {
            EventKind::CityFailure { city_id, reason } => {
                self.store.set_city_status(city_id, CityStatus::Offline).await?;
                info!(city_id = %city_id, reason = reason.as_deref().unwrap_or("unspecified"), "City failed");
            }
            EventKind::CityRecovery { city_id } => {
                self.store.set_city_status(city_id, CityStatus::Online).await?;
                info!(city_id = %city_id, "City recovered");
            }
            EventKind::CityMaintenance { city_id } => {
                self.store.set_city_status(city_id, CityStatus::Maintenance).await?;
                info!(city_id = %city_id, "City entered maintenance");
            }
            EventKind::DdosStart { city_id, intensity } => {
                if !self.store.topology().contains_city(city_id) {
                    return Err(SimError::CityNotFound(city_id.clone()));
                }
                self.ddos.lock().await.insert(city_id.clone(), *intensity);
                warn!(city_id = %city_id, intensity, "DDoS attack started");
                self.feed_ddos_sample(city_id, *intensity).await?;
            }
            EventKind::DdosMitigation { city_id } => {
                if !self.store.topology().contains_city(city_id) {
                    return Err(SimError::CityNotFound(city_id.clone()));
                }
                self.ddos.lock().await.remove(city_id);
                info!(city_id = %city_id, "DDoS attack mitigated");
            }
            EventKind::LinkCongestion {
                source,
                target,
                factor,
                packet_loss,
            } => {
                let link = self
                    .store
                    .congest_link(&LinkId::between(source, target), *factor, *packet_loss)
                    .await?;
                self.push_link(&link);
            }
            EventKind::LinkFailure { source, target } => {
                let link = self
                    .store
                    .set_link_status(&LinkId::between(source, target), LinkStatus::Down)
                    .await?;
                self.push_link(&link);
            }
            EventKind::LinkRecovery { source, target } => {
                let link = self.store.restore_link(&LinkId::between(source, target)).await?;
                self.push_link(&link);
            }
        }
        Ok(())
    }

    fn push_link(&self, link: &LinkState) {
        info!(link_id = %link.id, status = ?link.status, latency = link.metrics.latency, "Link changed");
        self.hub.broadcast(PushEvent::ConnectionMetrics(ConnectionMetricsUpdate {
            connection_id: link.id.clone(),
            status: link.status,
            metrics: link.metrics,
            timestamp: Utc::now(),
        }));
    }

    /// Attack traffic scaled by intensity, fed through the regular pipeline
    async fn feed_ddos_sample(&self, city_id: &str, intensity: f64) -> Result<ProcessedMetrics> {
        let city = self.store.city(city_id).await?;
        let loss = (0.15 * intensity).clamp(0.0, 1.0);
        let received = DDOS_SAMPLE_PACKETS * (1.0 - loss);

        let sample = RawSample {
            latencies: Some(vec![city.region.latency_factor() + 250.0 * intensity]),
            latency: None,
            load: Some((40.0 + 60.0 * intensity).min(100.0)),
            sent: Some(DDOS_SAMPLE_PACKETS),
            received: Some(received),
            processed: Some(received),
            bandwidth_usage: Some(1000.0 * intensity),
        };
        self.pipeline.process_metrics(city_id, &sample).await
    }

    /// One random-walk step plus attack samples; skipped when every city is down
    pub async fn drift_tick(&self) -> Option<DriftOutcome> {
        if !self.store.any_online().await {
            return None;
        }

        let outcome = self
            .store
            .drift(self.settings.load_drift_ratio, self.settings.latency_drift_ratio)
            .await;

        let attacks: Vec<(CityId, f64)> = self
            .ddos
            .lock()
            .await
            .iter()
            .map(|(city, intensity)| (city.clone(), *intensity))
            .collect();
        for (city_id, intensity) in attacks {
            if let Err(e) = self.feed_ddos_sample(&city_id, intensity).await {
                warn!(city_id = %city_id, error = %e, "Synthetic attack sample failed");
            }
        }

        let snapshot = self.store.snapshot().await;
        self.hub.broadcast(PushEvent::NetworkStateUpdate(NetworkStateUpdate {
            timestamp: snapshot.timestamp,
            cities: snapshot.cities,
        }));
        Some(outcome)
    }

    /// End the active scenario now; no-op when idle
    pub async fn stop(&self) -> Option<ScenarioReport> {
        let mut guard = self.active.lock().await;
        let finished = guard.as_ref()?;
        info!(scenario_id = %finished.definition.id, "Scenario stopped");
        let report = self.finish(finished).await;
        *guard = None;
        Some(report)
    }

    /// End transition; the caller holds the active slot until it returns so
    /// no other scenario can start before the reset completes.
    async fn finish(&self, finished: &ActiveScenario) -> ScenarioReport {
        let report = self.build_report(finished).await;

        self.hub.broadcast(PushEvent::ScenarioEnded(Box::new(ScenarioEnded {
            scenario_id: finished.definition.id.clone(),
            report: report.clone(),
            timestamp: Utc::now(),
        })));

        self.ddos.lock().await.clear();
        self.store.reset_to_baseline().await;
        gauge!("netdrill_scenario_active", 0.0);
        info!(
            scenario_id = %finished.definition.id,
            dispatched = finished.dispatched,
            failed = finished.failed,
            "Scenario ended"
        );
        report
    }

    /// Report of the running scenario
    pub async fn report(&self) -> Option<ScenarioReport> {
        let guard = self.active.lock().await;
        let active = guard.as_ref()?;
        Some(self.build_report(active).await)
    }

    pub async fn active_status(&self) -> Option<ActiveStatus> {
        let guard = self.active.lock().await;
        let active = guard.as_ref()?;
        Some(ActiveStatus {
            scenario_id: active.definition.id.clone(),
            name: active.definition.name.clone(),
            elapsed_seconds: active.started_at.elapsed().as_secs_f64(),
            duration: active.definition.duration,
            pending_events: active.queue.iter().cloned().collect(),
            events_dispatched: active.dispatched,
            events_failed: active.failed,
        })
    }

    pub async fn is_running(&self) -> bool {
        self.active.lock().await.is_some()
    }

    async fn build_report(&self, active: &ActiveScenario) -> ScenarioReport {
        let snapshot = self.store.snapshot().await;
        let summary = self.pipeline.network_summary();

        let city_performance = snapshot
            .cities
            .iter()
            .map(|city| CityPerformance {
                city_id: city.id.clone(),
                status: city.status,
                metrics: city.metrics,
                counters: city.counters,
                links: snapshot
                    .links
                    .iter()
                    .filter(|l| l.endpoints.contains(&city.id))
                    .cloned()
                    .collect(),
            })
            .collect();

        ScenarioReport {
            scenario_id: active.definition.id.clone(),
            name: active.definition.name.clone(),
            started_at: active.started_at_utc,
            duration: active.started_at.elapsed().as_secs_f64(),
            events_dispatched: active.dispatched,
            events_failed: active.failed,
            events_pending: active.queue.len(),
            metrics: summary,
            city_performance,
            recommendations: recommendations(&summary),
        }
    }

    /// Scheduling loop: scenario and drift ticks until cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut scenario_tick = interval(self.settings.scenario_tick());
        scenario_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut drift_tick = interval(self.settings.drift_interval());
        drift_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            scenario_tick_ms = self.settings.scenario_tick_ms,
            drift_interval_ms = self.settings.drift_interval_ms,
            "Scenario scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Scenario scheduler shutting down");
                    break;
                }
                _ = scenario_tick.tick() => {
                    if let TickOutcome::Ended(report) = self.tick().await {
                        debug!(scenario_id = %report.scenario_id, "Scenario reached its duration");
                    }
                }
                _ = drift_tick.tick() => {
                    self.drift_tick().await;
                }
            }
        }
    }
}
