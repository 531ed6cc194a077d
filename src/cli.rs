//! Command-line interface definitions and argument parsing

use crate::context::{DateWindow, PipelineConfig};
use crate::data::{parse_event_date, FunnelStep};
use crate::features::FeatureSpec;
use crate::funnel::LabelMap;
use crate::model::ClusterParams;
use crate::profile::ProfileAttribute;
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;

/// Customer segmentation and funnel conversion using K-Means clustering
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Per-user event summary CSV
    #[arg(long, default_value = "events.csv")]
    pub events: PathBuf,

    /// Geo dimension CSV
    #[arg(long, default_value = "geo.csv")]
    pub geo: PathBuf,

    /// Device dimension CSV
    #[arg(long, default_value = "devices.csv")]
    pub devices: PathBuf,

    /// Per-session summary CSV, reshaped alongside the events when given
    #[arg(long)]
    pub sessions: Option<PathBuf>,

    /// Directory the output tables are written to
    #[arg(short, long, default_value = "output")]
    pub output_dir: PathBuf,

    /// Number of clusters for K-Means
    #[arg(short = 'k', long, default_value = "4")]
    pub clusters: usize,

    /// Seed for centroid initialization
    #[arg(long, default_value = "42")]
    pub seed: u64,

    /// Width of a time cohort in days
    #[arg(long, default_value = "7")]
    pub cohort_days: u32,

    /// Values with a row share below this are collapsed into "other"
    #[arg(long, default_value = "0.05")]
    pub min_frequency: f64,

    /// Maximum iterations for K-Means algorithm
    #[arg(long, default_value = "300")]
    pub max_iters: u64,

    /// Tolerance for K-Means convergence
    #[arg(long, default_value = "1e-4")]
    pub tolerance: f64,

    /// Attributes to one-hot encode
    #[arg(long, value_enum, value_delimiter = ',', default_value = "week,country,category")]
    pub features: Vec<ProfileAttribute>,

    /// Attributes whose rare values are collapsed before encoding
    #[arg(long, value_enum, value_delimiter = ',', default_value = "country")]
    pub collapse: Vec<ProfileAttribute>,

    /// Funnel steps left out of the overall conversion rates
    /// Example: --exclude-steps viewed_page
    #[arg(long, value_enum, value_delimiter = ',')]
    pub exclude_steps: Vec<FunnelStep>,

    /// Only analyse events on or after this date (YYYYMMDD or YYYY-MM-DD)
    #[arg(long, requires = "end_date")]
    pub start_date: Option<String>,

    /// Only analyse events on or before this date
    #[arg(long, requires = "start_date")]
    pub end_date: Option<String>,

    /// Use human readable funnel step labels
    #[arg(long, conflicts_with = "labels")]
    pub display_labels: bool,

    /// Custom funnel step labels as raw=Label pairs
    /// Example: --labels "viewed_page=View,added_to_cart=Cart,began_checkout=Checkout,purchased=Buy"
    #[arg(long)]
    pub labels: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,
}

impl Args {
    fn date_window(&self) -> anyhow::Result<Option<DateWindow>> {
        match (&self.start_date, &self.end_date) {
            (Some(start), Some(end)) => Ok(Some(DateWindow {
                start: parse_event_date(start).context("invalid --start-date")?,
                end: parse_event_date(end).context("invalid --end-date")?,
            })),
            _ => Ok(None),
        }
    }

    fn label_map(&self) -> anyhow::Result<Option<LabelMap>> {
        if self.display_labels {
            return Ok(Some(LabelMap::display_defaults()));
        }
        match &self.labels {
            Some(spec) => Ok(Some(LabelMap::parse(spec).context("invalid --labels")?)),
            None => Ok(None),
        }
    }

    /// Build the pipeline configuration from the parsed arguments
    pub fn to_config(&self) -> anyhow::Result<PipelineConfig> {
        let config = PipelineConfig {
            date_window: self.date_window()?,
            cohort_bucket_days: self.cohort_days,
            features: FeatureSpec {
                encode: self.features.clone(),
                collapse: self.collapse.clone(),
                min_frequency: self.min_frequency,
            },
            clustering: ClusterParams {
                n_clusters: self.clusters,
                max_iters: self.max_iters,
                tolerance: self.tolerance,
                seed: self.seed,
            },
            label_map: self.label_map()?,
            exclude_from_rates: self.exclude_steps.clone(),
        };
        config.validate()?;
        Ok(config)
    }
}
