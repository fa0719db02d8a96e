//! Alerting & broadcast hub
//!
//! Turns anomalies into alerts, keeps the bounded alert log, tracks live
//! sessions with their role, and pushes state changes to them. Also owns
//! the student to city assignment pool.

use crate::config::{AlertConfig, SessionConfig};
use crate::engine::{NetworkView, TeacherMetrics};
use crate::error::{Result, SimError};
use crate::ring::RingBuffer;
use crate::scenario::ScheduledEvent;
use crate::scheduler::ScenarioReport;
use crate::state::CityState;
use crate::topology::Topology;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::{counter, gauge};
use netdrill_common::{
    Alert, Anomaly, CityId, DerivedMetrics, LinkId, LinkMetrics, LinkStatus, MetricKind, Role,
    Severity,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioStarted {
    pub scenario_id: String,
    pub name: String,
    pub description: String,
    pub duration: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventOccurred {
    pub scenario_id: String,
    pub event: ScheduledEvent,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioEnded {
    pub scenario_id: String,
    pub report: ScenarioReport,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CityMetricsUpdate {
    pub city_id: CityId,
    pub metrics: DerivedMetrics,
    pub anomalies: Vec<Anomaly>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMetricsUpdate {
    pub connection_id: LinkId,
    pub status: LinkStatus,
    pub metrics: LinkMetrics,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStateUpdate {
    pub timestamp: DateTime<Utc>,
    pub cities: Vec<CityState>,
}

/// Message pushed to sessions; serializes as its payload only, the event
/// name travels separately (see [`PushEvent::name`]).
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum PushEvent {
    ScenarioStarted(ScenarioStarted),
    EventOccurred(EventOccurred),
    ScenarioEnded(Box<ScenarioEnded>),
    CityMetrics(CityMetricsUpdate),
    ConnectionMetrics(ConnectionMetricsUpdate),
    AlertNew(Alert),
    NetworkStateUpdate(NetworkStateUpdate),
    NetworkState(Box<NetworkView>),
    TeacherMetrics(Box<TeacherMetrics>),
}

impl PushEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PushEvent::ScenarioStarted(_) => "scenario_started",
            PushEvent::EventOccurred(_) => "event_occurred",
            PushEvent::ScenarioEnded(_) => "scenario_ended",
            PushEvent::CityMetrics(_) => "city:metrics",
            PushEvent::ConnectionMetrics(_) => "connection:metrics",
            PushEvent::AlertNew(_) => "alert:new",
            PushEvent::NetworkStateUpdate(_) => "network_state_update",
            PushEvent::NetworkState(_) => "network:state",
            PushEvent::TeacherMetrics(_) => "teacher:metrics",
        }
    }
}

/// Human-readable alert text for a metric breach
pub fn alert_message(kind: MetricKind, severity: Severity) -> &'static str {
    match (kind, severity) {
        (MetricKind::Latency, Severity::Warning) => "high latency detected",
        (MetricKind::Latency, Severity::Critical) => "critical latency detected",
        (MetricKind::PacketLoss, Severity::Warning) => "significant packet loss",
        (MetricKind::PacketLoss, Severity::Critical) => "critical packet loss",
        (MetricKind::Load, Severity::Warning) => "high load detected",
        (MetricKind::Load, Severity::Critical) => "critical overload detected",
    }
}

/// Connection parameters supplied by a client
#[derive(Debug, Clone, Default)]
pub struct SessionData {
    pub student_id: Option<String>,
    pub city_id: Option<CityId>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub connection_id: Uuid,
    pub role: Role,
    pub city_id: Option<CityId>,
    pub student_id: Option<String>,
    pub connected_at: DateTime<Utc>,
}

struct Session {
    info: SessionInfo,
    sender: mpsc::Sender<PushEvent>,
}

/// Student to city mapping, both directions
#[derive(Default)]
struct Assignments {
    by_student: HashMap<String, CityId>,
    by_city: HashMap<CityId, String>,
}

pub struct BroadcastHub {
    topology: Arc<Topology>,
    sessions: DashMap<Uuid, Session>,
    alerts: Mutex<RingBuffer<Alert>>,
    assignments: Mutex<Assignments>,
    config: SessionConfig,
}

impl BroadcastHub {
    pub fn new(topology: Arc<Topology>, alerts: &AlertConfig, sessions: &SessionConfig) -> Self {
        Self {
            topology,
            sessions: DashMap::new(),
            alerts: Mutex::new(RingBuffer::new(alerts.capacity)),
            assignments: Mutex::new(Assignments::default()),
            config: sessions.clone(),
        }
    }

    /// Record one alert per anomaly and push each as `alert:new`
    #[instrument(skip(self, anomalies), fields(count = anomalies.len()))]
    pub async fn handle_anomalies(&self, city_id: &str, anomalies: &[Anomaly]) -> Vec<Alert> {
        if anomalies.is_empty() {
            return Vec::new();
        }

        let created: Vec<Alert> = anomalies
            .iter()
            .map(|anomaly| Alert {
                id: Uuid::new_v4(),
                city_id: city_id.to_string(),
                alert_type: anomaly.metric_type,
                severity: anomaly.severity,
                message: alert_message(anomaly.metric_type, anomaly.severity).to_string(),
                timestamp: Utc::now(),
            })
            .collect();

        {
            let mut log = self.alerts.lock().await;
            for alert in &created {
                log.push(alert.clone());
            }
            gauge!("netdrill_alert_log_size", log.len() as f64);
        }

        for alert in &created {
            counter!("netdrill_alerts_total", 1, "severity" => alert.severity.as_str());
            info!(
                city_id = %alert.city_id,
                metric = alert.alert_type.as_str(),
                severity = alert.severity.as_str(),
                "{}", alert.message
            );
            self.broadcast(PushEvent::AlertNew(alert.clone()));
        }
        created
    }

    /// Open a session and return its id and the receiving end of its queue.
    ///
    /// A student session with a student id is bound to that student's city,
    /// assigning one first if needed. The assignment lock is held until the
    /// session is registered so a concurrent disconnect of the same student
    /// sees it.
    pub async fn register_session(
        &self,
        role: Role,
        data: SessionData,
    ) -> Result<(Uuid, mpsc::Receiver<PushEvent>)> {
        let mut assignments = self.assignments.lock().await;
        let mut city_id = data.city_id;
        if role == Role::Student {
            if let Some(student_id) = &data.student_id {
                city_id = Some(self.assign_locked(&mut assignments, student_id)?);
            }
        }
        if let Some(city) = &city_id {
            if !self.topology.contains_city(city) {
                return Err(SimError::CityNotFound(city.clone()));
            }
        }

        let connection_id = Uuid::new_v4();
        let (sender, receiver) = mpsc::channel(self.config.channel_capacity);
        let info = SessionInfo {
            connection_id,
            role,
            city_id,
            student_id: data.student_id,
            connected_at: Utc::now(),
        };

        info!(
            connection_id = %connection_id,
            role = ?role,
            city_id = ?info.city_id,
            "Session registered"
        );
        self.sessions.insert(connection_id, Session { info, sender });
        drop(assignments);
        gauge!("netdrill_sessions_active", self.sessions.len() as f64);

        Ok((connection_id, receiver))
    }

    /// Drop a session; frees the student's city when configured to and no
    /// other session of that student remains.
    pub async fn remove_session(&self, connection_id: Uuid) -> Option<SessionInfo> {
        let mut assignments = self.assignments.lock().await;
        let (_, session) = self.sessions.remove(&connection_id)?;
        gauge!("netdrill_sessions_active", self.sessions.len() as f64);
        info!(connection_id = %connection_id, role = ?session.info.role, "Session removed");

        if self.config.release_assignment_on_disconnect && session.info.role == Role::Student {
            if let Some(student_id) = &session.info.student_id {
                let still_connected = self
                    .sessions
                    .iter()
                    .any(|s| s.info.student_id.as_deref() == Some(student_id.as_str()));
                if !still_connected {
                    self.release_locked(&mut assignments, student_id);
                }
            }
        }
        Some(session.info)
    }

    /// Push to every session; returns the number of queued deliveries
    pub fn broadcast(&self, event: PushEvent) -> usize {
        self.deliver(event, |_| true)
    }

    pub fn broadcast_to_role(&self, role: Role, event: PushEvent) -> usize {
        self.deliver(event, |info| info.role == role)
    }

    /// Push to a single session
    pub fn send_to(&self, connection_id: Uuid, event: PushEvent) -> bool {
        self.deliver(event, |info| info.connection_id == connection_id) == 1
    }

    fn deliver(&self, event: PushEvent, filter: impl Fn(&SessionInfo) -> bool) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();

        for session in self.sessions.iter().filter(|s| filter(&s.info)) {
            match session.sender.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    counter!("netdrill_push_dropped_total", 1, "event" => event.name());
                    debug!(connection_id = %session.info.connection_id, event = event.name(), "Session queue full, push dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    closed.push(session.info.connection_id);
                }
            }
        }

        // Receivers that went away without a remove_session call
        for connection_id in closed {
            if self.sessions.remove(&connection_id).is_some() {
                warn!(connection_id = %connection_id, "Pruned closed session");
            }
        }

        counter!("netdrill_push_events_total", delivered as u64, "event" => event.name());
        delivered
    }

    /// First unassigned city in topology order; a student that already holds
    /// a city gets the same one back.
    pub async fn assign_city_to_student(&self, student_id: &str) -> Result<CityId> {
        let mut assignments = self.assignments.lock().await;
        self.assign_locked(&mut assignments, student_id)
    }

    fn assign_locked(&self, assignments: &mut Assignments, student_id: &str) -> Result<CityId> {
        if let Some(city) = assignments.by_student.get(student_id) {
            return Ok(city.clone());
        }

        let city = self
            .topology
            .cities()
            .iter()
            .find(|c| !assignments.by_city.contains_key(&c.id))
            .map(|c| c.id.clone())
            .ok_or(SimError::NoCitiesAvailable)?;

        assignments.by_student.insert(student_id.to_string(), city.clone());
        assignments.by_city.insert(city.clone(), student_id.to_string());
        gauge!("netdrill_assigned_cities", assignments.by_city.len() as f64);

        info!(student_id = %student_id, city_id = %city, "City assigned to student");
        Ok(city)
    }

    /// Return a student's city to the pool
    pub async fn release_city(&self, student_id: &str) -> Option<CityId> {
        let mut assignments = self.assignments.lock().await;
        self.release_locked(&mut assignments, student_id)
    }

    fn release_locked(&self, assignments: &mut Assignments, student_id: &str) -> Option<CityId> {
        let city = assignments.by_student.remove(student_id)?;
        assignments.by_city.remove(&city);
        gauge!("netdrill_assigned_cities", assignments.by_city.len() as f64);

        info!(student_id = %student_id, city_id = %city, "City released");
        Some(city)
    }

    pub async fn assignment_of(&self, student_id: &str) -> Option<CityId> {
        self.assignments.lock().await.by_student.get(student_id).cloned()
    }

    /// Newest `limit` alerts, oldest first
    pub async fn recent_alerts(&self, limit: usize) -> Vec<Alert> {
        self.alerts.lock().await.tail(limit)
    }

    pub async fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().await.to_vec()
    }

    pub fn session_count(&self, role: Role) -> usize {
        self.sessions.iter().filter(|s| s.info.role == role).count()
    }

    pub fn connection_count(&self) -> usize {
        self.sessions.len()
    }
}
