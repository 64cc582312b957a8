use serde::{Deserialize, Serialize};

pub mod msg;

/// One observation for one host at one instant.
///
/// Every measurement is optional on the wire: a missing key and an explicit
/// `null` both decode to `None`, which is distinct from a reading of zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    /// ISO-8601 timestamp as sent by the server, kept verbatim.
    pub timestamp: String,
    /// Opaque, case-sensitive host identifier.
    pub host: String,
    #[serde(default)]
    pub cpu_percent: Option<f64>,
    #[serde(default)]
    pub cpu_min: Option<f64>,
    #[serde(default)]
    pub cpu_max: Option<f64>,
    #[serde(default)]
    pub memory_percent: Option<f64>,
    #[serde(default)]
    pub memory_min: Option<f64>,
    #[serde(default)]
    pub memory_max: Option<f64>,
    #[serde(default)]
    pub disk_percent: Option<f64>,
    #[serde(default)]
    pub disk_min: Option<f64>,
    #[serde(default)]
    pub disk_max: Option<f64>,
    #[serde(default)]
    pub network_in: Option<f64>,
    #[serde(default)]
    pub network_out: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidRecord {
    EmptyHost,
}

impl std::fmt::Display for InvalidRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidRecord::EmptyHost => write!(f, "record has an empty host"),
        }
    }
}

impl std::error::Error for InvalidRecord {}

impl MetricRecord {
    /// A record with only the required fields set.
    pub fn new(host: impl Into<String>, timestamp: impl Into<String>) -> Self {
        Self {
            timestamp: timestamp.into(),
            host: host.into(),
            cpu_percent: None,
            cpu_min: None,
            cpu_max: None,
            memory_percent: None,
            memory_min: None,
            memory_max: None,
            disk_percent: None,
            disk_min: None,
            disk_max: None,
            network_in: None,
            network_out: None,
        }
    }

    /// Structural checks only. Readings outside `[0, 100]` are accepted.
    pub fn validate(&self) -> Result<(), InvalidRecord> {
        if self.host.is_empty() {
            return Err(InvalidRecord::EmptyHost);
        }
        Ok(())
    }
}
