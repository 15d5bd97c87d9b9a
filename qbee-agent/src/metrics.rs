use anyhow::Result;
use serde::{Deserialize, Serialize};

/// One collected metric sample.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metric {
    /// Metric label, e.g. `cpu:user` or `filesystem:use`.
    pub label: String,
    /// Instance discriminator (mount point, interface). May be empty.
    #[serde(default)]
    pub id: String,
    pub value: f64,
    /// Unix seconds.
    pub timestamp: i64,
}

/// Supplier of the latest collected samples. Collection itself is the
/// metrics subsystem's job; the engine only compares samples against
/// configured thresholds.
pub trait MetricsSource: Send + Sync {
    fn latest(&self) -> Result<Vec<Metric>>;
}

/// A source with no samples, for devices without the metrics subsystem.
pub struct NoMetrics;

impl MetricsSource for NoMetrics {
    fn latest(&self) -> Result<Vec<Metric>> {
        Ok(Vec::new())
    }
}
