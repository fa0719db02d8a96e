//! Static network graph
//!
//! Loaded once at startup and shared read-only by every other component.
//! City order is significant: it is the order used for student assignment
//! and for every snapshot.

use crate::error::{Result, SimError};
use netdrill_common::{CityId, LinkId, Region};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::info;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Static description of a city
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CitySpec {
    pub id: CityId,
    pub name: String,
    pub region: Region,
    pub latitude: f64,
    pub longitude: f64,
}

/// Link endpoints as written in a topology file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkSpec {
    pub source: CityId,
    pub target: CityId,
}

/// On-disk topology format
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologyFile {
    pub cities: Vec<CitySpec>,
    pub links: Vec<LinkSpec>,
}

/// Undirected link between two cities
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Link {
    pub id: LinkId,
    pub a: CityId,
    pub b: CityId,
}

impl Link {
    /// The endpoint opposite to `city`
    pub fn other(&self, city: &str) -> &str {
        if self.a == city {
            &self.b
        } else {
            &self.a
        }
    }
}

#[derive(Debug, Clone)]
pub struct Topology {
    cities: Vec<CitySpec>,
    city_index: HashMap<CityId, usize>,
    links: Vec<Link>,
    link_index: HashMap<LinkId, usize>,
    /// Per city (topology order): indices into `links`
    adjacency: Vec<Vec<usize>>,
}

impl Topology {
    /// Build a topology, rejecting duplicate cities and dangling links
    pub fn new(cities: Vec<CitySpec>, links: Vec<LinkSpec>) -> Result<Self> {
        let mut city_index = HashMap::with_capacity(cities.len());
        for (idx, city) in cities.iter().enumerate() {
            if city_index.insert(city.id.clone(), idx).is_some() {
                return Err(SimError::Config(format!("duplicate city id {}", city.id)));
            }
        }

        let mut topology_links = Vec::with_capacity(links.len());
        let mut link_index = HashMap::with_capacity(links.len());
        let mut adjacency = vec![Vec::new(); cities.len()];

        for spec in links {
            let a_idx = *city_index
                .get(&spec.source)
                .ok_or_else(|| SimError::CityNotFound(spec.source.clone()))?;
            let b_idx = *city_index
                .get(&spec.target)
                .ok_or_else(|| SimError::CityNotFound(spec.target.clone()))?;
            if a_idx == b_idx {
                return Err(SimError::Config(format!("self link on {}", spec.source)));
            }

            let id = LinkId::between(&spec.source, &spec.target);
            if link_index.contains_key(&id) {
                return Err(SimError::Config(format!("duplicate link {id}")));
            }

            let link_idx = topology_links.len();
            link_index.insert(id.clone(), link_idx);
            adjacency[a_idx].push(link_idx);
            adjacency[b_idx].push(link_idx);
            topology_links.push(Link {
                id,
                a: spec.source,
                b: spec.target,
            });
        }

        Ok(Self {
            cities,
            city_index,
            links: topology_links,
            link_index,
            adjacency,
        })
    }

    /// Load a topology from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SimError::Config(format!("cannot read {}: {e}", path.display())))?;
        let file: TopologyFile = toml::from_str(&text)?;
        let topology = Self::new(file.cities, file.links)?;

        info!(
            path = %path.display(),
            cities = topology.cities.len(),
            links = topology.links.len(),
            "Loaded topology from file"
        );
        Ok(topology)
    }

    /// Built-in training network: three data centers per region, meshed
    /// inside each region and joined by intercontinental backbones.
    pub fn default_network() -> Self {
        let city = |id: &str, name: &str, region: Region, latitude: f64, longitude: f64| CitySpec {
            id: id.to_string(),
            name: name.to_string(),
            region,
            latitude,
            longitude,
        };

        let cities = vec![
            city("PAR", "Paris", Region::Europe, 48.8566, 2.3522),
            city("LON", "London", Region::Europe, 51.5074, -0.1278),
            city("FRA", "Frankfurt", Region::Europe, 50.1109, 8.6821),
            city("NYC", "New York", Region::NorthAmerica, 40.7128, -74.0060),
            city("CHI", "Chicago", Region::NorthAmerica, 41.8781, -87.6298),
            city("LAX", "Los Angeles", Region::NorthAmerica, 34.0522, -118.2437),
            city("TYO", "Tokyo", Region::Asia, 35.6762, 139.6503),
            city("SIN", "Singapore", Region::Asia, 1.3521, 103.8198),
            city("BOM", "Mumbai", Region::Asia, 19.0760, 72.8777),
            city("GRU", "Sao Paulo", Region::SouthAmerica, -23.5505, -46.6333),
            city("BOG", "Bogota", Region::SouthAmerica, 4.7110, -74.0721),
            city("SCL", "Santiago", Region::SouthAmerica, -33.4489, -70.6693),
            city("JNB", "Johannesburg", Region::Africa, -26.2041, 28.0473),
            city("LOS", "Lagos", Region::Africa, 6.5244, 3.3792),
            city("CAI", "Cairo", Region::Africa, 30.0444, 31.2357),
            city("SYD", "Sydney", Region::Oceania, -33.8688, 151.2093),
            city("MEL", "Melbourne", Region::Oceania, -37.8136, 144.9631),
            city("AKL", "Auckland", Region::Oceania, -36.8485, 174.7633),
        ];

        let links = [
            // Regional meshes
            ("PAR", "LON"),
            ("PAR", "FRA"),
            ("LON", "FRA"),
            ("NYC", "CHI"),
            ("CHI", "LAX"),
            ("NYC", "LAX"),
            ("TYO", "SIN"),
            ("SIN", "BOM"),
            ("TYO", "BOM"),
            ("GRU", "BOG"),
            ("GRU", "SCL"),
            ("BOG", "SCL"),
            ("JNB", "LOS"),
            ("LOS", "CAI"),
            ("JNB", "CAI"),
            ("SYD", "MEL"),
            ("SYD", "AKL"),
            ("MEL", "AKL"),
            // Backbones
            ("LON", "NYC"),
            ("PAR", "NYC"),
            ("PAR", "LOS"),
            ("FRA", "CAI"),
            ("FRA", "BOM"),
            ("CAI", "BOM"),
            ("NYC", "BOG"),
            ("NYC", "GRU"),
            ("LAX", "TYO"),
            ("LAX", "AKL"),
            ("SIN", "SYD"),
            ("GRU", "JNB"),
            ("JNB", "BOM"),
        ]
        .into_iter()
        .map(|(source, target)| LinkSpec {
            source: source.to_string(),
            target: target.to_string(),
        })
        .collect();

        // The built-in table is static and covered by tests.
        match Self::new(cities, links) {
            Ok(topology) => topology,
            Err(e) => unreachable!("built-in topology is inconsistent: {e}"),
        }
    }

    /// Cities in topology order
    pub fn cities(&self) -> &[CitySpec] {
        &self.cities
    }

    pub fn city(&self, id: &str) -> Option<&CitySpec> {
        self.city_index.get(id).map(|&idx| &self.cities[idx])
    }

    pub fn contains_city(&self, id: &str) -> bool {
        self.city_index.contains_key(id)
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn link(&self, id: &LinkId) -> Option<&Link> {
        self.link_index.get(id).map(|&idx| &self.links[idx])
    }

    pub fn link_between(&self, a: &str, b: &str) -> Option<&Link> {
        self.link(&LinkId::between(a, b))
    }

    /// Links touching a city, in declaration order
    pub fn links_of(&self, id: &str) -> Vec<&Link> {
        match self.city_index.get(id) {
            Some(&idx) => self.adjacency[idx].iter().map(|&l| &self.links[l]).collect(),
            None => Vec::new(),
        }
    }

    /// Direct neighbors of a city
    pub fn neighbors(&self, id: &str) -> Result<Vec<&CitySpec>> {
        if !self.contains_city(id) {
            return Err(SimError::CityNotFound(id.to_string()));
        }
        Ok(self
            .links_of(id)
            .into_iter()
            .filter_map(|link| self.city(link.other(id)))
            .collect())
    }

    pub fn are_neighbors(&self, a: &str, b: &str) -> bool {
        a != b && self.link_between(a, b).is_some()
    }

    /// Regions present in the topology, without duplicates, in city order
    pub fn regions(&self) -> Vec<Region> {
        let mut seen = HashSet::new();
        self.cities
            .iter()
            .map(|c| c.region)
            .filter(|r| seen.insert(*r))
            .collect()
    }

    /// Great-circle distance in kilometres (haversine)
    pub fn distance_km(&self, a: &str, b: &str) -> Result<f64> {
        let a = self.city(a).ok_or_else(|| SimError::CityNotFound(a.to_string()))?;
        let b = self.city(b).ok_or_else(|| SimError::CityNotFound(b.to_string()))?;
        Ok(haversine_km(a.latitude, a.longitude, b.latitude, b.longitude))
    }
}

fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().atan2((1.0 - h).sqrt())
}
