use crate::scenario::ScenarioDefinition;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Main configuration of the simulation engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// HTTP and metrics listeners
    pub server: ServerConfig,
    /// Tick intervals and randomness
    pub simulation: SimulationConfig,
    /// Anomaly thresholds
    pub thresholds: ThresholdConfig,
    /// Alert log settings
    pub alerts: AlertConfig,
    /// Rolling metrics cache
    pub metrics_cache: MetricsCacheConfig,
    /// Session registry and city assignment policy
    pub sessions: SessionConfig,
    /// Time-series collaborator
    pub timeseries: TimeSeriesConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Optional topology file
    pub topology: TopologyConfig,
    /// Extra scenario definitions added to the built-in catalog
    pub scenarios: Vec<ScenarioDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// API listen address
    pub listen_addr: String,
    /// Prometheus exporter address
    pub metrics_addr: String,
    /// Install the Prometheus exporter
    pub metrics_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3001".to_string(),
            metrics_addr: "127.0.0.1:9191".to_string(),
            metrics_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Scenario event tick in milliseconds
    pub scenario_tick_ms: u64,
    /// Background drift tick in milliseconds
    pub drift_interval_ms: u64,
    /// Max relative load step per drift tick (0.05 = ±5%)
    pub load_drift_ratio: f64,
    /// Max relative link latency step per drift tick (0.10 = ±10%)
    pub latency_drift_ratio: f64,
    /// Seed for reproducible baselines and drift
    pub seed: Option<u64>,
}

impl SimulationConfig {
    pub fn scenario_tick(&self) -> Duration {
        Duration::from_millis(self.scenario_tick_ms)
    }

    pub fn drift_interval(&self) -> Duration {
        Duration::from_millis(self.drift_interval_ms)
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            scenario_tick_ms: 100,
            drift_interval_ms: 1000,
            load_drift_ratio: 0.05,
            latency_drift_ratio: 0.10,
            seed: None,
        }
    }
}

/// Warning / critical pair; a value is flagged only when strictly above
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdPair {
    pub warning: f64,
    pub critical: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Average latency in milliseconds
    pub latency: ThresholdPair,
    /// Load percentage
    pub load: ThresholdPair,
    /// Packet loss ratio
    pub packet_loss: ThresholdPair,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            latency: ThresholdPair {
                warning: 100.0,
                critical: 200.0,
            },
            load: ThresholdPair {
                warning: 80.0,
                critical: 90.0,
            },
            packet_loss: ThresholdPair {
                warning: 0.05,
                critical: 0.10,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Maximum alerts retained, oldest evicted first
    pub capacity: usize,
    /// Alerts included in network snapshots
    pub snapshot_tail: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            snapshot_tail: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsCacheConfig {
    /// Age limit of samples counted in the network summary
    pub summary_window_seconds: u64,
}

impl Default for MetricsCacheConfig {
    fn default() -> Self {
        Self {
            summary_window_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Free a student's city when its session disconnects
    pub release_assignment_on_disconnect: bool,
    /// Per-session push queue; pushes beyond it are dropped
    pub channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            release_assignment_on_disconnect: true,
            channel_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeSeriesBackend {
    /// Keep points in process memory only
    Memory,
    /// Forward points as InfluxDB line protocol, keep a local mirror for queries
    LineProtocol,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeSeriesConfig {
    pub backend: TimeSeriesBackend,
    /// Base URL of the time-series server
    pub url: String,
    pub org: String,
    pub bucket: String,
    pub token: Option<String>,
    /// Points retained per city by the in-memory store
    pub points_per_city: usize,
    /// Pending writes buffered before new ones are dropped
    pub queue_capacity: usize,
    /// Request timeout for forwarded writes
    pub request_timeout_ms: u64,
}

impl Default for TimeSeriesConfig {
    fn default() -> Self {
        Self {
            backend: TimeSeriesBackend::Memory,
            url: "http://localhost:8086".to_string(),
            org: "netdrill".to_string(),
            bucket: "network_metrics".to_string(),
            token: None,
            points_per_city: 3600,
            queue_capacity: 1024,
            request_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is not set
    pub level: String,
    /// Emit JSON log lines
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "netdrill_engine=info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// TOML topology file; the built-in network is used when unset
    pub path: Option<String>,
}

impl EngineConfig {
    /// Load configuration from file, with `NETDRILL__SECTION__KEY` environment overrides
    pub fn from_file(path: &str) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("NETDRILL").separator("__"))
            .build()?;

        settings.try_deserialize()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        self.listen_addr()
            .map_err(|e| format!("Invalid listen address {}: {}", self.server.listen_addr, e))?;
        if self.server.metrics_enabled {
            self.metrics_addr().map_err(|e| {
                format!("Invalid metrics address {}: {}", self.server.metrics_addr, e)
            })?;
        }

        if self.simulation.scenario_tick_ms == 0 {
            return Err("Scenario tick interval cannot be 0".to_string());
        }
        if self.simulation.drift_interval_ms == 0 {
            return Err("Drift interval cannot be 0".to_string());
        }
        for (name, ratio) in [
            ("load_drift_ratio", self.simulation.load_drift_ratio),
            ("latency_drift_ratio", self.simulation.latency_drift_ratio),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(format!("{name} must be within [0, 1], got {ratio}"));
            }
        }

        for (name, pair) in [
            ("latency", self.thresholds.latency),
            ("load", self.thresholds.load),
            ("packet_loss", self.thresholds.packet_loss),
        ] {
            if pair.warning > pair.critical {
                return Err(format!(
                    "{name} warning threshold {} exceeds critical threshold {}",
                    pair.warning, pair.critical
                ));
            }
        }

        if self.alerts.capacity == 0 {
            return Err("Alert capacity cannot be 0".to_string());
        }
        if self.sessions.channel_capacity == 0 {
            return Err("Session channel capacity cannot be 0".to_string());
        }
        if self.timeseries.points_per_city == 0 || self.timeseries.queue_capacity == 0 {
            return Err("Time-series buffers cannot be empty".to_string());
        }
        if self.timeseries.backend == TimeSeriesBackend::LineProtocol && self.timeseries.url.is_empty() {
            return Err("Time-series URL is required for the line protocol backend".to_string());
        }

        for scenario in &self.scenarios {
            scenario.validate().map_err(|e| e.to_string())?;
        }

        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.server.listen_addr.parse()
    }

    pub fn metrics_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.server.metrics_addr.parse()
    }

    pub fn summary_window(&self) -> Duration {
        Duration::from_secs(self.metrics_cache.summary_window_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.alerts.capacity, 100);
        assert_eq!(config.simulation.scenario_tick(), Duration::from_millis(100));
        assert!(config.sessions.release_assignment_on_disconnect);
    }

    #[test]
    fn test_config_validation() {
        let mut config = EngineConfig::default();

        config.simulation.scenario_tick_ms = 0;
        assert!(config.validate().is_err());

        config.simulation.scenario_tick_ms = 100;
        config.thresholds.load.warning = 95.0;
        assert!(config.validate().is_err());

        config.thresholds.load.warning = 80.0;
        config.server.listen_addr = "not an address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_loading_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[simulation]
scenario_tick_ms = 50
seed = 42

[alerts]
capacity = 20

[[scenarios]]
id = "drill"
name = "Transatlantic cut"
duration = 10

[[scenarios.events]]
time = 5
type = "link_failure"
data = {{ source = "PAR", target = "NYC" }}

[[scenarios.events]]
time = 8
type = "city_failure"
data = {{ cityId = "PAR" }}
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap();
        let config = EngineConfig::from_file(path).unwrap();
        assert_eq!(config.simulation.scenario_tick_ms, 50);
        assert_eq!(config.simulation.seed, Some(42));
        assert_eq!(config.alerts.capacity, 20);
        assert_eq!(config.alerts.snapshot_tail, 10, "unset keys keep defaults");
        assert_eq!(config.scenarios.len(), 1);
        assert_eq!(config.scenarios[0].events.len(), 2);
        assert_eq!(
            config.scenarios[0].events[1].kind,
            crate::scenario::EventKind::CityFailure {
                city_id: "PAR".to_string(),
                reason: None,
            }
        );
        assert!(config.validate().is_ok());
    }
}
