//! Scenario definitions and the scenario catalog

use crate::error::{Result, SimError};
use crate::topology::Topology;
use netdrill_common::CityId;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Pedagogical difficulty of a scenario
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    #[default]
    Beginner,
    Intermediate,
    Advanced,
}

fn default_congestion_factor() -> f64 {
    2.0
}

/// State transition applied when a scheduled event fires. Fields are
/// camelCase on the wire and in configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum EventKind {
    CityFailure {
        city_id: CityId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    CityRecovery {
        city_id: CityId,
    },
    CityMaintenance {
        city_id: CityId,
    },
    DdosStart {
        city_id: CityId,
        intensity: f64,
    },
    DdosMitigation {
        city_id: CityId,
    },
    LinkCongestion {
        source: CityId,
        target: CityId,
        /// Latency is multiplied by `1 + factor`
        #[serde(default = "default_congestion_factor")]
        factor: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        packet_loss: Option<f64>,
    },
    LinkFailure {
        source: CityId,
        target: CityId,
    },
    LinkRecovery {
        source: CityId,
        target: CityId,
    },
}

impl EventKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            EventKind::CityFailure { .. } => "city_failure",
            EventKind::CityRecovery { .. } => "city_recovery",
            EventKind::CityMaintenance { .. } => "city_maintenance",
            EventKind::DdosStart { .. } => "ddos_start",
            EventKind::DdosMitigation { .. } => "ddos_mitigation",
            EventKind::LinkCongestion { .. } => "link_congestion",
            EventKind::LinkFailure { .. } => "link_failure",
            EventKind::LinkRecovery { .. } => "link_recovery",
        }
    }
}

/// One timed transition of a scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledEvent {
    /// Seconds after scenario start
    #[serde(rename = "time", alias = "fireOffsetSeconds")]
    pub fire_offset_seconds: f64,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl ScheduledEvent {
    pub fn new(fire_offset_seconds: f64, kind: EventKind) -> Self {
        Self {
            fire_offset_seconds,
            kind,
        }
    }
}

/// Immutable script of a scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub difficulty: Difficulty,
    /// Total duration in seconds
    pub duration: u64,
    #[serde(default)]
    pub events: Vec<ScheduledEvent>,
}

impl ScenarioDefinition {
    /// Reject offsets and intensities that cannot be scheduled
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(SimError::Config("scenario id cannot be empty".to_string()));
        }
        for event in &self.events {
            if !event.fire_offset_seconds.is_finite() || event.fire_offset_seconds < 0.0 {
                return Err(SimError::Config(format!(
                    "scenario {}: invalid offset {} for {}",
                    self.id,
                    event.fire_offset_seconds,
                    event.kind.type_name()
                )));
            }
            match &event.kind {
                EventKind::DdosStart { intensity, .. }
                    if !(intensity.is_finite() && *intensity > 0.0 && *intensity <= 1.0) =>
                {
                    return Err(SimError::Config(format!(
                        "scenario {}: ddos intensity must be in (0, 1], got {intensity}",
                        self.id
                    )));
                }
                EventKind::LinkCongestion { factor, .. } if !(factor.is_finite() && *factor >= 0.0) => {
                    return Err(SimError::Config(format!(
                        "scenario {}: congestion factor must be >= 0, got {factor}",
                        self.id
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Catalog entry as listed to the teacher
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub difficulty: Difficulty,
    pub duration: u64,
    pub event_count: usize,
}

/// Ordered set of known scenarios
#[derive(Debug, Clone, Default)]
pub struct ScenarioCatalog {
    definitions: Vec<ScenarioDefinition>,
}

impl ScenarioCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in exercises; random choices (failing region, attack targets)
    /// are drawn once here, so a definition never changes after creation.
    pub fn builtin<R: Rng>(topology: &Topology, rng: &mut R) -> Self {
        let mut catalog = Self::new();
        catalog.definitions.push(ScenarioDefinition {
            id: "normal".to_string(),
            name: "Normal Operation".to_string(),
            description: "A healthy network with background load drift only".to_string(),
            difficulty: Difficulty::Beginner,
            duration: 300,
            events: Vec::new(),
        });
        catalog.definitions.push(ScenarioDefinition {
            id: "regional_failure".to_string(),
            name: "Regional Outage".to_string(),
            description: "Every data center of one region loses power, then recovers".to_string(),
            difficulty: Difficulty::Intermediate,
            duration: 600,
            events: regional_failure_events(topology, rng),
        });
        catalog.definitions.push(ScenarioDefinition {
            id: "ddos_attack".to_string(),
            name: "DDoS Attack".to_string(),
            description: "A distributed attack hits three cities in turn".to_string(),
            difficulty: Difficulty::Advanced,
            duration: 900,
            events: ddos_events(topology, rng),
        });
        catalog.definitions.push(ScenarioDefinition {
            id: "backbone_congestion".to_string(),
            name: "Backbone Congestion".to_string(),
            description: "A link saturates, fails, and is brought back".to_string(),
            difficulty: Difficulty::Intermediate,
            duration: 300,
            events: congestion_events(topology, rng),
        });
        catalog
    }

    /// Add or replace a definition
    pub fn insert(&mut self, definition: ScenarioDefinition) -> Result<()> {
        definition.validate()?;
        match self.definitions.iter_mut().find(|d| d.id == definition.id) {
            Some(existing) => *existing = definition,
            None => self.definitions.push(definition),
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&ScenarioDefinition> {
        self.definitions.iter().find(|d| d.id == id)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn summaries(&self) -> Vec<ScenarioSummary> {
        self.definitions
            .iter()
            .map(|d| ScenarioSummary {
                id: d.id.clone(),
                name: d.name.clone(),
                description: d.description.clone(),
                difficulty: d.difficulty,
                duration: d.duration,
                event_count: d.events.len(),
            })
            .collect()
    }
}

fn regional_failure_events<R: Rng>(topology: &Topology, rng: &mut R) -> Vec<ScheduledEvent> {
    let Some(region) = topology.regions().choose(rng).copied() else {
        return Vec::new();
    };

    let mut events = Vec::new();
    for city in topology.cities().iter().filter(|c| c.region == region) {
        events.push(ScheduledEvent::new(
            120.0 + rng.gen::<f64>() * 60.0,
            EventKind::CityFailure {
                city_id: city.id.clone(),
                reason: Some("power_outage".to_string()),
            },
        ));
        events.push(ScheduledEvent::new(
            480.0 + rng.gen::<f64>() * 120.0,
            EventKind::CityRecovery {
                city_id: city.id.clone(),
            },
        ));
    }
    events
}

fn ddos_events<R: Rng>(topology: &Topology, rng: &mut R) -> Vec<ScheduledEvent> {
    let mut events = Vec::new();
    let targets: Vec<_> = topology.cities().choose_multiple(rng, 3).collect();

    for (index, city) in targets.into_iter().enumerate() {
        let wave = index as f64 * 180.0;
        events.push(ScheduledEvent::new(
            120.0 + wave,
            EventKind::DdosStart {
                city_id: city.id.clone(),
                intensity: 0.7 + rng.gen::<f64>() * 0.3,
            },
        ));
        events.push(ScheduledEvent::new(
            420.0 + wave,
            EventKind::DdosMitigation {
                city_id: city.id.clone(),
            },
        ));
    }
    events
}

fn congestion_events<R: Rng>(topology: &Topology, rng: &mut R) -> Vec<ScheduledEvent> {
    let Some(link) = topology.links().choose(rng) else {
        return Vec::new();
    };

    vec![
        ScheduledEvent::new(
            60.0,
            EventKind::LinkCongestion {
                source: link.a.clone(),
                target: link.b.clone(),
                factor: default_congestion_factor(),
                packet_loss: Some(0.08),
            },
        ),
        ScheduledEvent::new(
            150.0,
            EventKind::LinkFailure {
                source: link.a.clone(),
                target: link.b.clone(),
            },
        ),
        ScheduledEvent::new(
            240.0,
            EventKind::LinkRecovery {
                source: link.a.clone(),
                target: link.b.clone(),
            },
        ),
    ]
}
