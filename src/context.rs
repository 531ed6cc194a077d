//! Pipeline configuration and the explicit context handed to every run

use crate::data::FunnelStep;
use crate::error::{PipelineError, Result};
use crate::features::FeatureSpec;
use crate::funnel::LabelMap;
use crate::model::ClusterParams;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Inclusive range of `first_event_date` values to analyse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

/// Everything a pipeline run needs to know
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Restrict event and session rows to this window; `None` keeps all rows
    #[serde(default)]
    pub date_window: Option<DateWindow>,
    /// Width of a time cohort in days
    pub cohort_bucket_days: u32,
    pub features: FeatureSpec,
    pub clustering: ClusterParams,
    /// Display labels for funnel steps; raw names when `None`
    #[serde(default)]
    pub label_map: Option<LabelMap>,
    /// Steps left out of the overall conversion rates
    #[serde(default)]
    pub exclude_from_rates: Vec<FunnelStep>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            date_window: None,
            cohort_bucket_days: 7,
            features: FeatureSpec::default(),
            clustering: ClusterParams::default(),
            label_map: None,
            exclude_from_rates: Vec::new(),
        }
    }
}

impl PipelineConfig {
    /// Reject out-of-range parameters before any stage runs
    pub fn validate(&self) -> Result<()> {
        if self.cohort_bucket_days == 0 {
            return Err(PipelineError::invalid_config("cohort_bucket_days must be at least 1"));
        }
        if self.clustering.n_clusters == 0 {
            return Err(PipelineError::invalid_config("n_clusters must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.features.min_frequency) {
            return Err(PipelineError::invalid_config(format!(
                "min_frequency must be within [0, 1], got {}",
                self.features.min_frequency
            )));
        }
        if self.features.encode.is_empty() {
            return Err(PipelineError::invalid_config("no categorical attributes to encode"));
        }
        if let Some(window) = self.date_window {
            if window.start > window.end {
                return Err(PipelineError::invalid_config("date window starts after it ends"));
            }
        }
        Ok(())
    }
}

/// Pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    FunnelReshape,
    SessionReshape,
    FunnelAggregate,
    ProfileJoin,
    TimeCohort,
    FeatureEngineering,
    Clustering,
    ClusterMerge,
    ClusterDescribe,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FunnelReshape => "funnel_reshape",
            Self::SessionReshape => "session_reshape",
            Self::FunnelAggregate => "funnel_aggregate",
            Self::ProfileJoin => "profile_join",
            Self::TimeCohort => "time_cohort",
            Self::FeatureEngineering => "feature_engineering",
            Self::Clustering => "clustering",
            Self::ClusterMerge => "cluster_merge",
            Self::ClusterDescribe => "cluster_describe",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives progress of a pipeline run
pub trait StageObserver {
    fn stage_started(&self, _stage: Stage) {}

    /// Called with the row count of the stage's output table
    fn stage_finished(&self, _stage: Stage, _rows: usize) {}
}

/// Forwards stage progress to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl StageObserver for TracingObserver {
    fn stage_started(&self, stage: Stage) {
        tracing::debug!(stage = %stage, "stage started");
    }

    fn stage_finished(&self, stage: Stage, rows: usize) {
        tracing::info!(stage = %stage, rows, "stage finished");
    }
}

/// Configuration plus observability sink for one run
pub struct PipelineContext {
    pub config: PipelineConfig,
    observer: Box<dyn StageObserver>,
}

impl PipelineContext {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            observer: Box::new(TracingObserver),
        }
    }

    pub fn with_observer(mut self, observer: impl StageObserver + 'static) -> Self {
        self.observer = Box::new(observer);
        self
    }

    pub fn observer(&self) -> &dyn StageObserver {
        self.observer.as_ref()
    }
}

impl fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cohort_bucket_days, 7);
        assert_eq!(config.clustering.seed, 42);
    }

    #[test]
    fn test_invalid_config() {
        let mut config = PipelineConfig::default();
        config.clustering.n_clusters = 0;
        assert_eq!(config.validate().unwrap_err().kind(), ErrorKind::InvalidConfig);

        let mut config = PipelineConfig::default();
        config.features.min_frequency = -0.1;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.date_window = Some(DateWindow {
            start: NaiveDate::from_ymd_opt(2021, 1, 2).unwrap(),
            end: NaiveDate::from_ymd_opt(2021, 1, 1).unwrap(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serde_defaults() {
        let config = PipelineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: PipelineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_date_window() {
        let window = DateWindow {
            start: NaiveDate::from_ymd_opt(2020, 11, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2020, 11, 30).unwrap(),
        };
        assert!(window.contains(NaiveDate::from_ymd_opt(2020, 11, 30).unwrap()));
        assert!(!window.contains(NaiveDate::from_ymd_opt(2020, 12, 1).unwrap()));
    }
}
