//! Runner configuration.
//!
//! The configuration surface a [`DoFnRunner`](crate::runner::DoFnRunner) consumes
//! from its caller. Loading it from files or command lines is the caller's job;
//! [`RunnerConfig::from_json`] accepts an already-read JSON document.
//!
//! Pluggable collaborators (state store, side-input readiness strategy, key
//! encoder) are not part of this struct. They are handed to the runner
//! builder directly.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;

/// Default static capacity for side-output channels.
pub const DEFAULT_MAX_SIDE_OUTPUTS: usize = 5;

/// Default number of records one splittable invocation may claim.
pub const DEFAULT_MAX_RECORDS: u64 = 10_000;

/// Default wall-clock budget of one splittable invocation.
pub const DEFAULT_MAX_DURATION: Duration = Duration::from_secs(10);

/// Budget for one bounded invocation of a splittable function.
///
/// Whichever limit is reached first ends the invocation with a checkpoint.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplittableBudget {
    /// Maximum records claimed per invocation.
    pub max_records: u64,
    /// Maximum wall-clock time per invocation.
    #[serde(rename = "max_duration_ms", with = "duration_millis")]
    pub max_duration: Duration,
}

impl SplittableBudget {
    /// Creates a budget, validating both limits.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidBudget`] if either limit is zero.
    pub fn new(max_records: u64, max_duration: Duration) -> Result<Self, ConfigError> {
        let budget = Self {
            max_records,
            max_duration,
        };
        budget.validate()?;
        Ok(budget)
    }

    /// Checks that both limits are non-zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_records == 0 {
            return Err(ConfigError::InvalidBudget(
                "max_records must be greater than zero".to_string(),
            ));
        }
        if self.max_duration.is_zero() {
            return Err(ConfigError::InvalidBudget(
                "max_duration must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns true once either limit has been reached.
    pub fn is_exhausted(&self, records: u64, elapsed: Duration) -> bool {
        records >= self.max_records || elapsed >= self.max_duration
    }
}

impl Default for SplittableBudget {
    fn default() -> Self {
        Self {
            max_records: DEFAULT_MAX_RECORDS,
            max_duration: DEFAULT_MAX_DURATION,
        }
    }
}

/// Configuration of one runner instance.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Operator id; scopes keyed state in the state store.
    pub operator_id: String,
    /// Static capacity for side-output channels.
    pub max_side_outputs: usize,
    /// Budget for splittable invocations.
    pub splittable: SplittableBudget,
    /// Log every input, side input and emission at debug level.
    pub trace_elements: bool,
}

impl RunnerConfig {
    /// Creates a configuration with defaults for the given operator.
    pub fn new(operator_id: impl Into<String>) -> Self {
        Self {
            operator_id: operator_id.into(),
            ..Self::default()
        }
    }

    /// Sets the side-output capacity.
    pub fn with_max_side_outputs(mut self, n: usize) -> Self {
        self.max_side_outputs = n;
        self
    }

    /// Sets the splittable budget.
    pub fn with_splittable_budget(mut self, budget: SplittableBudget) -> Self {
        self.splittable = budget;
        self
    }

    /// Enables or disables per-element tracing.
    pub fn with_trace_elements(mut self, enabled: bool) -> Self {
        self.trace_elements = enabled;
        self
    }

    /// Parses and validates a JSON configuration. Missing fields take their
    /// defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the nested splittable budget.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.splittable.validate()
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            operator_id: "operator".to_string(),
            max_side_outputs: DEFAULT_MAX_SIDE_OUTPUTS,
            splittable: SplittableBudget::default(),
            trace_elements: false,
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.max_side_outputs, 5);
        assert_eq!(config.splittable.max_records, 10_000);
        assert_eq!(config.splittable.max_duration, Duration::from_secs(10));
        assert!(!config.trace_elements);
    }

    #[test]
    fn builder() {
        let config = RunnerConfig::new("pardo-1")
            .with_max_side_outputs(2)
            .with_trace_elements(true)
            .with_splittable_budget(SplittableBudget::new(5, Duration::from_millis(50)).unwrap());
        assert_eq!(config.operator_id, "pardo-1");
        assert_eq!(config.max_side_outputs, 2);
        assert!(config.trace_elements);
        assert_eq!(config.splittable.max_records, 5);
    }

    #[test]
    fn from_json_fills_defaults() {
        let config =
            RunnerConfig::from_json(r#"{"operator_id":"op","splittable":{"max_records":100}}"#)
                .unwrap();
        assert_eq!(config.operator_id, "op");
        assert_eq!(config.max_side_outputs, 5);
        assert_eq!(config.splittable.max_records, 100);
        assert_eq!(config.splittable.max_duration, Duration::from_secs(10));
    }

    #[test]
    fn json_round_trip_uses_millis() {
        let config = RunnerConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"max_duration_ms\":10000"));
        assert_eq!(RunnerConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn zero_budget_rejected() {
        assert!(matches!(
            SplittableBudget::new(0, Duration::from_secs(1)),
            Err(ConfigError::InvalidBudget(_))
        ));
        assert!(matches!(
            RunnerConfig::from_json(r#"{"splittable":{"max_duration_ms":0}}"#),
            Err(ConfigError::InvalidBudget(_))
        ));
        assert!(matches!(
            RunnerConfig::from_json("not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn exhaustion() {
        let budget = SplittableBudget::new(3, Duration::from_secs(1)).unwrap();
        assert!(!budget.is_exhausted(2, Duration::from_millis(10)));
        assert!(budget.is_exhausted(3, Duration::ZERO));
        assert!(budget.is_exhausted(0, Duration::from_secs(1)));
    }
}
