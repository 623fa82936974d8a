//! Scheduler configuration

use serde::{Deserialize, Serialize};

use crate::orchestrator::engine::SchedulerError;
use crate::queue::PriorityOrder;

/// Parameters needed to construct a [`Scheduler`](crate::Scheduler)
///
/// Every field has a default, so a JSON document only needs the fields it
/// changes:
///
/// ```rust
/// use sim_kernel_core::{PriorityOrder, SchedulerConfig};
///
/// let config = SchedulerConfig::from_json_str(r#"{ "priority_order": "higher_first" }"#).unwrap();
/// assert_eq!(config.priority_order, PriorityOrder::HigherFirst);
/// assert_eq!(config.ticks_per_time_unit, 1000.0);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Ticks per simulated time unit
    pub ticks_per_time_unit: f64,

    /// Simulated time units per wall-clock second (None = run flat out)
    pub real_time_factor: Option<f64>,

    /// Which priority values fire first among events at the same tick
    pub priority_order: PriorityOrder,

    /// Keep a record of every event
    ///
    /// The log gains at least two records per event until drained with
    /// `Scheduler::take_event_log`; disable for long unattended runs.
    pub record_events: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            ticks_per_time_unit: 1000.0,
            real_time_factor: None,
            priority_order: PriorityOrder::LowerFirst,
            record_events: true,
        }
    }
}

impl SchedulerConfig {
    /// Parse a JSON document and validate it
    pub fn from_json_str(json: &str) -> Result<Self, SchedulerError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| SchedulerError::InvalidConfig(format!("malformed config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_ticks_per_time_unit(mut self, ticks: f64) -> Self {
        self.ticks_per_time_unit = ticks;
        self
    }

    pub fn with_real_time_factor(mut self, factor: f64) -> Self {
        self.real_time_factor = Some(factor);
        self
    }

    pub fn with_priority_order(mut self, order: PriorityOrder) -> Self {
        self.priority_order = order;
        self
    }

    pub fn with_record_events(mut self, record: bool) -> Self {
        self.record_events = record;
        self
    }

    /// Check that every field is usable
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if !(self.ticks_per_time_unit.is_finite() && self.ticks_per_time_unit > 0.0) {
            return Err(SchedulerError::InvalidConfig(format!(
                "ticks_per_time_unit must be positive and finite, got {}",
                self.ticks_per_time_unit
            )));
        }
        if let Some(factor) = self.real_time_factor {
            if !(factor.is_finite() && factor > 0.0) {
                return Err(SchedulerError::InvalidConfig(format!(
                    "real_time_factor must be positive and finite, got {}",
                    factor
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(SchedulerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_builders() {
        let config = SchedulerConfig::default()
            .with_ticks_per_time_unit(60.0)
            .with_real_time_factor(2.0)
            .with_priority_order(PriorityOrder::HigherFirst)
            .with_record_events(false);
        assert_eq!(config.ticks_per_time_unit, 60.0);
        assert_eq!(config.real_time_factor, Some(2.0));
        assert_eq!(config.priority_order, PriorityOrder::HigherFirst);
        assert!(!config.record_events);
    }

    #[test]
    fn test_rejects_bad_values() {
        let zero = SchedulerConfig::default().with_ticks_per_time_unit(0.0);
        assert!(matches!(zero.validate(), Err(SchedulerError::InvalidConfig(_))));

        let infinite = SchedulerConfig::default().with_real_time_factor(f64::INFINITY);
        assert!(matches!(infinite.validate(), Err(SchedulerError::InvalidConfig(_))));
    }

    #[test]
    fn test_from_json() {
        let config = SchedulerConfig::from_json_str(
            r#"{ "ticks_per_time_unit": 10.0, "real_time_factor": 5.0, "record_events": false }"#,
        )
        .unwrap();
        assert_eq!(config.ticks_per_time_unit, 10.0);
        assert_eq!(config.real_time_factor, Some(5.0));
        assert_eq!(config.priority_order, PriorityOrder::LowerFirst);

        assert!(SchedulerConfig::from_json_str("not json").is_err());
        assert!(SchedulerConfig::from_json_str(r#"{ "ticks_per_time_unit": -3.0 }"#).is_err());
    }
}
