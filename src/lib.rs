//! Funnelseg: customer segmentation and funnel conversion metrics
//!
//! Reshapes per-user funnel flags into long records, joins geo and device
//! dimensions into a customer profile, clusters the one-hot encoded profile
//! with K-Means and reports conversion per segment.

pub mod cli;
pub mod context;
pub mod data;
pub mod describe;
pub mod error;
pub mod export;
pub mod features;
pub mod funnel;
pub mod model;
pub mod pipeline;
pub mod profile;
pub mod report;

// Re-export public items for easier access
pub use cli::Args;
pub use context::{DateWindow, PipelineConfig, PipelineContext, Stage, StageObserver, TracingObserver};
pub use data::{FunnelFlags, FunnelStep, RawTables};
pub use describe::{describe, segment_conversion_table, ClusterProfile, SegmentConversion};
pub use error::{ErrorKind, PipelineError, Result};
pub use features::{build_feature_matrix, collapse_rare_categories, FeatureMatrix, FeatureSpec};
pub use funnel::{aggregate_by_date, conversion_rates, pivot_to_long, LabelMap, LongFunnelRecord};
pub use model::{fit_kmeans, merge_into_funnel, merge_into_profile, ClusterModel, ClusterParams};
pub use pipeline::{run, PipelineOutput};
pub use profile::{build_profile, derive_time_cohort, CustomerProfile, ProfileAttribute};
