//! Runtime configuration

use hako_memory::DEFAULT_MEMORY_LIMIT;
use serde::{Deserialize, Serialize};

/// Engine limits and bridge defaults.
///
/// Every engine limit is optional; `None` keeps the engine's own default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Guest heap limit in bytes.
    pub memory_limit: Option<usize>,
    /// Guest stack limit in bytes.
    pub max_stack_size: Option<usize>,
    /// Allocation volume that triggers a collection.
    pub gc_threshold: Option<usize>,
    /// Upper bound on jobs run by one pending-job pump.
    pub max_jobs_per_pump: usize,
    /// Default for [`EvalOptions::strip_source_annotations`](crate::EvalOptions).
    pub strip_source_annotations: bool,
    /// Size of the linear memory used to move strings and buffers across
    /// the boundary.
    pub linear_memory_limit: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            memory_limit: None,
            max_stack_size: None,
            gc_threshold: None,
            max_jobs_per_pump: 64,
            strip_source_annotations: false,
            linear_memory_limit: DEFAULT_MEMORY_LIMIT,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config = RuntimeConfig::from_json_str(r#"{ "memory_limit": 1048576 }"#).unwrap();
        assert_eq!(config.memory_limit, Some(1 << 20));
        assert_eq!(config.max_jobs_per_pump, 64);
        assert!(!config.strip_source_annotations);
        assert_eq!(config.linear_memory_limit, DEFAULT_MEMORY_LIMIT);
    }

    #[test]
    fn json_round_trip() {
        let config = RuntimeConfig {
            gc_threshold: Some(4096),
            strip_source_annotations: true,
            ..RuntimeConfig::default()
        };
        let json = config.to_json_string().unwrap();
        assert_eq!(RuntimeConfig::from_json_str(&json).unwrap(), config);
    }
}
