use thiserror::Error;

/// Errors that can occur in the simulation engine
#[derive(Error, Debug)]
pub enum SimError {
    /// Scenario id not present in the catalog
    #[error("Unknown scenario: {0}")]
    UnknownScenario(String),

    /// A scenario is already running
    #[error("Scenario already running: {0}")]
    ScenarioAlreadyRunning(String),

    /// Metric sample rejected by validation
    #[error("Invalid metrics: {0}")]
    InvalidMetrics(String),

    /// City id not present in the topology
    #[error("City not found: {0}")]
    CityNotFound(String),

    /// Link id not present in the topology
    #[error("Link not found: {0}")]
    LinkNotFound(String),

    /// Every city is already assigned to a student
    #[error("No cities available for assignment")]
    NoCitiesAvailable,

    /// Message target is not adjacent to the sender
    #[error("{target} is not a direct neighbor of {city}")]
    TargetNotNeighbor { city: String, target: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Time-series collaborator error
    #[error("Time-series error: {0}")]
    TimeSeries(String),
}

/// Result type alias using SimError
pub type Result<T> = std::result::Result<T, SimError>;

impl From<serde_json::Error> for SimError {
    fn from(err: serde_json::Error) -> Self {
        SimError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for SimError {
    fn from(err: toml::de::Error) -> Self {
        SimError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for SimError {
    fn from(err: config::ConfigError) -> Self {
        SimError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SimError::CityNotFound("ATL".to_string());
        assert_eq!(err.to_string(), "City not found: ATL");

        let err = SimError::TargetNotNeighbor {
            city: "PAR".to_string(),
            target: "SYD".to_string(),
        };
        assert_eq!(err.to_string(), "SYD is not a direct neighbor of PAR");
    }

    #[test]
    fn test_serde_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: SimError = json_err.into();
        assert!(matches!(err, SimError::Serialization(_)));
    }
}
