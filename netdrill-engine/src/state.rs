//! Live network state store
//!
//! Single mutable source of truth for per-city and per-link status and
//! metrics. All state sits behind one lock so every mutator is one critical
//! section and snapshots never observe a half-applied update.

use crate::error::{Result, SimError};
use crate::topology::Topology;
use chrono::{DateTime, Utc};
use netdrill_common::{
    CityId, CityMetrics, CityStatus, DerivedMetrics, LinkId, LinkMetrics, LinkStatus, Region,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Packet loss of a healthy link
pub const BASELINE_LINK_PACKET_LOSS: f64 = 0.01;

/// Cumulative traffic counters since the last baseline reset
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CityCounters {
    pub packets_processed: f64,
    pub packets_dropped: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CityState {
    pub id: CityId,
    pub name: String,
    pub region: Region,
    pub status: CityStatus,
    pub metrics: CityMetrics,
    pub counters: CityCounters,
    pub neighbors: Vec<CityId>,
    pub last_update: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkState {
    pub id: LinkId,
    pub endpoints: [CityId; 2],
    pub status: LinkStatus,
    pub metrics: LinkMetrics,
    #[serde(skip)]
    baseline: LinkMetrics,
}

/// Consistent copy of the whole network
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cities: Vec<CityState>,
    pub links: Vec<LinkState>,
}

/// Outcome of one random-walk step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriftOutcome {
    pub cities_drifted: usize,
    pub links_drifted: usize,
}

struct NetworkState {
    cities: Vec<CityState>,
    links: Vec<LinkState>,
    rng: StdRng,
}

pub struct NetworkStore {
    topology: Arc<Topology>,
    city_index: HashMap<CityId, usize>,
    link_index: HashMap<LinkId, usize>,
    inner: RwLock<NetworkState>,
}

impl NetworkStore {
    /// Seed the store from the topology; `seed` makes baselines reproducible
    pub fn new(topology: Arc<Topology>, seed: Option<u64>) -> Self {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let city_index = topology
            .cities()
            .iter()
            .enumerate()
            .map(|(idx, c)| (c.id.clone(), idx))
            .collect();
        let link_index = topology
            .links()
            .iter()
            .enumerate()
            .map(|(idx, l)| (l.id.clone(), idx))
            .collect();

        let (cities, links) = baseline(&topology, &mut rng);
        info!(
            cities = cities.len(),
            links = links.len(),
            seeded = seed.is_some(),
            "Network state store initialized"
        );

        Self {
            topology,
            city_index,
            link_index,
            inner: RwLock::new(NetworkState { cities, links, rng }),
        }
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub async fn snapshot(&self) -> NetworkSnapshot {
        let state = self.inner.read().await;
        NetworkSnapshot {
            timestamp: Utc::now(),
            cities: state.cities.clone(),
            links: state.links.clone(),
        }
    }

    pub async fn city(&self, city_id: &str) -> Result<CityState> {
        let idx = self.city_idx(city_id)?;
        Ok(self.inner.read().await.cities[idx].clone())
    }

    pub async fn link(&self, link_id: &LinkId) -> Result<LinkState> {
        let idx = self.link_idx(link_id)?;
        Ok(self.inner.read().await.links[idx].clone())
    }

    /// Links touching a city, in topology order
    pub async fn links_of(&self, city_id: &str) -> Result<Vec<LinkState>> {
        self.city_idx(city_id)?;
        let indices: Vec<usize> = self
            .topology
            .links_of(city_id)
            .iter()
            .filter_map(|l| self.link_index.get(&l.id).copied())
            .collect();
        let state = self.inner.read().await;
        Ok(indices.into_iter().map(|idx| state.links[idx].clone()).collect())
    }

    /// Set a city's status, returning the previous one
    pub async fn set_city_status(&self, city_id: &str, status: CityStatus) -> Result<CityStatus> {
        let idx = self.city_idx(city_id)?;
        let mut state = self.inner.write().await;
        let city = &mut state.cities[idx];
        let previous = city.status;
        city.status = status;
        city.last_update = Utc::now();

        debug!(city_id = %city_id, from = ?previous, to = ?status, "City status changed");
        Ok(previous)
    }

    /// Replace a city's live metrics with a derived sample and accumulate counters
    pub async fn apply_city_metrics(&self, city_id: &str, derived: &DerivedMetrics) -> Result<CityState> {
        let idx = self.city_idx(city_id)?;
        let mut state = self.inner.write().await;
        let city = &mut state.cities[idx];
        city.metrics = CityMetrics {
            latency: derived.average_latency,
            load: derived.load,
            packet_loss: derived.packet_loss,
            throughput: derived.bandwidth_usage,
        };
        city.counters.packets_processed += derived.packets_processed;
        city.counters.packets_dropped += derived.packets_dropped;
        city.last_update = Utc::now();
        Ok(city.clone())
    }

    pub async fn apply_link_metrics(&self, link_id: &LinkId, metrics: LinkMetrics) -> Result<LinkState> {
        let idx = self.link_idx(link_id)?;
        let mut state = self.inner.write().await;
        let link = &mut state.links[idx];
        link.metrics = metrics;
        Ok(link.clone())
    }

    pub async fn set_link_status(&self, link_id: &LinkId, status: LinkStatus) -> Result<LinkState> {
        let idx = self.link_idx(link_id)?;
        let mut state = self.inner.write().await;
        let link = &mut state.links[idx];
        link.status = status;

        debug!(link_id = %link_id, status = ?status, "Link status changed");
        Ok(link.clone())
    }

    /// Degrade a link: latency × (1 + factor), bandwidth halved, loss raised
    pub async fn congest_link(
        &self,
        link_id: &LinkId,
        factor: f64,
        packet_loss: Option<f64>,
    ) -> Result<LinkState> {
        let idx = self.link_idx(link_id)?;
        let mut state = self.inner.write().await;
        let link = &mut state.links[idx];
        link.status = LinkStatus::Degraded;
        link.metrics.latency *= 1.0 + factor;
        link.metrics.bandwidth /= 2.0;
        link.metrics.packet_loss = packet_loss
            .unwrap_or(link.metrics.packet_loss * (1.0 + factor))
            .clamp(0.0, 1.0);
        Ok(link.clone())
    }

    /// Bring a link back to active with its baseline metrics
    pub async fn restore_link(&self, link_id: &LinkId) -> Result<LinkState> {
        let idx = self.link_idx(link_id)?;
        let mut state = self.inner.write().await;
        let link = &mut state.links[idx];
        link.status = LinkStatus::Active;
        link.metrics = link.baseline;
        Ok(link.clone())
    }

    /// Reseed every city and link from the topology
    pub async fn reset_to_baseline(&self) {
        let mut state = self.inner.write().await;
        let NetworkState { cities, links, rng } = &mut *state;
        let (fresh_cities, fresh_links) = baseline(&self.topology, rng);
        *cities = fresh_cities;
        *links = fresh_links;

        info!("Network state reset to baseline");
    }

    pub async fn any_online(&self) -> bool {
        self.inner
            .read()
            .await
            .cities
            .iter()
            .any(|c| c.status == CityStatus::Online)
    }

    /// One bounded random-walk step: load of online cities and latency of
    /// active links move by at most the given ratio of their current value.
    pub async fn drift(&self, load_ratio: f64, latency_ratio: f64) -> DriftOutcome {
        let mut state = self.inner.write().await;
        let NetworkState { cities, links, rng } = &mut *state;

        let mut outcome = DriftOutcome {
            cities_drifted: 0,
            links_drifted: 0,
        };
        for city in cities.iter_mut().filter(|c| c.status == CityStatus::Online) {
            city.metrics.load = drift_load(city.metrics.load, load_ratio, rng);
            outcome.cities_drifted += 1;
        }
        for link in links.iter_mut().filter(|l| l.status == LinkStatus::Active) {
            link.metrics.latency = drift_latency(link.metrics.latency, latency_ratio, rng);
            outcome.links_drifted += 1;
        }
        outcome
    }

    fn city_idx(&self, city_id: &str) -> Result<usize> {
        self.city_index
            .get(city_id)
            .copied()
            .ok_or_else(|| SimError::CityNotFound(city_id.to_string()))
    }

    fn link_idx(&self, link_id: &LinkId) -> Result<usize> {
        self.link_index
            .get(link_id)
            .copied()
            .ok_or_else(|| SimError::LinkNotFound(link_id.to_string()))
    }
}

/// Load after one drift step, clamped to [0, 100]
pub fn drift_load<R: Rng>(current: f64, ratio: f64, rng: &mut R) -> f64 {
    let step = current * rng.gen_range(-ratio..=ratio);
    (current + step).clamp(0.0, 100.0)
}

/// Link latency after one drift step, never below 1 ms
pub fn drift_latency<R: Rng>(current: f64, ratio: f64, rng: &mut R) -> f64 {
    let step = current * rng.gen_range(-ratio..=ratio);
    (current + step).max(1.0)
}

fn baseline<R: Rng>(topology: &Topology, rng: &mut R) -> (Vec<CityState>, Vec<LinkState>) {
    let now = Utc::now();
    let cities = topology
        .cities()
        .iter()
        .map(|spec| CityState {
            id: spec.id.clone(),
            name: spec.name.clone(),
            region: spec.region,
            status: CityStatus::Online,
            metrics: CityMetrics {
                latency: spec.region.latency_factor() + rng.gen_range(0.0..5.0),
                load: rng.gen_range(20.0..40.0),
                packet_loss: 0.0,
                throughput: 0.0,
            },
            counters: CityCounters::default(),
            neighbors: topology
                .links_of(&spec.id)
                .iter()
                .map(|l| l.other(&spec.id).to_string())
                .collect(),
            last_update: now,
        })
        .collect();

    let links = topology
        .links()
        .iter()
        .map(|link| {
            let metrics = baseline_link_metrics(topology, &link.a, &link.b);
            LinkState {
                id: link.id.clone(),
                endpoints: [link.a.clone(), link.b.clone()],
                status: LinkStatus::Active,
                metrics,
                baseline: metrics,
            }
        })
        .collect();

    (cities, links)
}

/// Latency 0.5 ms per 100 km plus 5 ms; bandwidth 10000 inside a region, 5000 across
fn baseline_link_metrics(topology: &Topology, a: &str, b: &str) -> LinkMetrics {
    let distance = topology.distance_km(a, b).unwrap_or(0.0);
    let same_region = match (topology.city(a), topology.city(b)) {
        (Some(x), Some(y)) => x.region == y.region,
        _ => false,
    };
    LinkMetrics {
        latency: (distance / 100.0 * 0.5 + 5.0).round(),
        bandwidth: if same_region { 10000.0 } else { 5000.0 },
        packet_loss: BASELINE_LINK_PACKET_LOSS,
    }
}
