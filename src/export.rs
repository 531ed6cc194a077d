//! Tabular output for rendering: typed tables to Polars frames and CSV
//!
//! Column names follow the shared table vocabulary (`user_id`, `funnel_step`,
//! `occurred`, `kmeans_cluster`, ...). The frame-level helpers here are the
//! only place that work on untyped tables, so they check their
//! preconditions at runtime.

use crate::describe::{ClusterProfile, SegmentConversion};
use crate::error::{PipelineError, Result};
use crate::funnel::{AggregatedFunnel, ConversionRate, LongFunnelRecord};
use crate::model::{ClusterAssignment, SegmentedCustomer, SegmentedFunnel, SegmentedProfile};
use crate::profile::CustomerProfile;
use polars::prelude::*;
use std::fs::File;
use std::path::Path;

/// Name of the cluster column added by segmentation
pub const CLUSTER_COLUMN: &str = "kmeans_cluster";

const DATE_FORMAT: &str = "%Y-%m-%d";

fn long_columns<'a>(records: impl Iterator<Item = &'a LongFunnelRecord> + Clone) -> Result<DataFrame> {
    let df = df!(
        "user_id" => records.clone().map(|r| r.user_id.clone()).collect::<Vec<_>>(),
        "session_id" => records.clone().map(|r| r.session_id.clone()).collect::<Vec<_>>(),
        "funnel_step" => records.clone().map(|r| r.funnel_step.clone()).collect::<Vec<_>>(),
        "occurred" => records.clone().map(|r| u32::from(r.occurred)).collect::<Vec<_>>(),
        "first_event_date" => records.clone().map(|r| r.first_event_date.format(DATE_FORMAT).to_string()).collect::<Vec<_>>(),
        "first_event_timestamp" => records.map(|r| r.first_event_timestamp).collect::<Vec<_>>(),
    )?;
    Ok(df)
}

/// Long funnel records without cluster ids
pub fn long_funnel_frame(records: &[LongFunnelRecord]) -> Result<DataFrame> {
    long_columns(records.iter())
}

/// Long funnel records with a nullable `kmeans_cluster` column
pub fn segmented_funnel_frame(funnel: &SegmentedFunnel) -> Result<DataFrame> {
    let mut df = long_columns(funnel.rows().iter().map(|row| &row.record))?;
    let clusters: Vec<Option<u32>> = funnel
        .rows()
        .iter()
        .map(|row| row.kmeans_cluster.map(|c| c as u32))
        .collect();
    df.with_column(Series::new(CLUSTER_COLUMN, clusters))?;
    Ok(df)
}

pub fn aggregated_funnel_frame(rows: &[AggregatedFunnel]) -> Result<DataFrame> {
    let df = df!(
        "first_event_date" => rows.iter().map(|r| r.first_event_date.format(DATE_FORMAT).to_string()).collect::<Vec<_>>(),
        "funnel_step" => rows.iter().map(|r| r.funnel_step.clone()).collect::<Vec<_>>(),
        "occurred" => rows.iter().map(|r| r.occurred).collect::<Vec<_>>(),
    )?;
    Ok(df)
}

pub fn conversion_rates_frame(rows: &[ConversionRate]) -> Result<DataFrame> {
    let df = df!(
        "funnel_step" => rows.iter().map(|r| r.funnel_step.clone()).collect::<Vec<_>>(),
        "conversion_rate" => rows.iter().map(|r| r.rate).collect::<Vec<_>>(),
        "rows" => rows.iter().map(|r| r.rows as u64).collect::<Vec<_>>(),
    )?;
    Ok(df)
}

fn profile_column(
    rows: &[SegmentedCustomer],
    value: impl Fn(&CustomerProfile) -> Option<String>,
) -> Vec<Option<String>> {
    rows.iter().map(|row| value(&row.profile)).collect()
}

/// Customer profile with its `kmeans_cluster` column
pub fn profile_frame(profile: &SegmentedProfile) -> Result<DataFrame> {
    let rows = profile.rows();

    let df = df!(
        "user_id" => rows.iter().map(|r| r.profile.user_id.clone()).collect::<Vec<_>>(),
        "first_event_date" => rows.iter().map(|r| r.profile.first_event_date.format(DATE_FORMAT).to_string()).collect::<Vec<_>>(),
        "continent" => profile_column(rows, |p| p.continent.clone()),
        "country" => profile_column(rows, |p| p.country.clone()),
        "region" => profile_column(rows, |p| p.region.clone()),
        "city" => profile_column(rows, |p| p.city.clone()),
        "category" => profile_column(rows, |p| p.category.clone()),
        "mobile_brand_name" => profile_column(rows, |p| p.mobile_brand_name.clone()),
        "operating_system" => profile_column(rows, |p| p.operating_system.clone()),
        "week" => rows.iter().map(|r| r.profile.week).collect::<Vec<_>>(),
        CLUSTER_COLUMN => rows.iter().map(|r| r.kmeans_cluster as u32).collect::<Vec<_>>(),
    )?;
    Ok(df)
}

/// Deviation matrix: one row per feature, one `cluster_<id>` column per cluster
pub fn cluster_profile_frame(profile: &ClusterProfile) -> Result<DataFrame> {
    let mut columns = vec![
        Series::new("feature", &profile.features),
        Series::new("population_mean", &profile.population_means),
    ];
    for (cluster, deviations) in profile.deviations.columns().into_iter().enumerate() {
        columns.push(Series::new(&format!("cluster_{cluster}"), deviations.to_vec()));
    }
    Ok(DataFrame::new(columns)?)
}

pub fn segment_conversion_rows_frame(rows: &[SegmentConversion]) -> Result<DataFrame> {
    let df = df!(
        CLUSTER_COLUMN => rows.iter().map(|r| r.kmeans_cluster as u32).collect::<Vec<_>>(),
        "funnel_step" => rows.iter().map(|r| r.funnel_step.clone()).collect::<Vec<_>>(),
        "conversion_rate" => rows.iter().map(|r| r.conversion_rate).collect::<Vec<_>>(),
        "rows" => rows.iter().map(|r| r.rows as u64).collect::<Vec<_>>(),
    )?;
    Ok(df)
}

/// Add cluster ids to any frame with a `user_id` column
///
/// An existing `kmeans_cluster` column from an earlier run is dropped first.
/// Users missing from the assignment get a null cluster.
pub fn attach_clusters(df: &DataFrame, assignment: &ClusterAssignment) -> Result<DataFrame> {
    let user_ids = df
        .column("user_id")
        .map_err(|_| PipelineError::missing_column("frame", "user_id"))?
        .cast(&DataType::String)?;

    let by_user = assignment.by_user();
    let clusters: Vec<Option<u32>> = user_ids
        .str()?
        .into_iter()
        .map(|id| id.and_then(|id| by_user.get(id)).map(|&c| c as u32))
        .collect();

    let mut out = if df.column(CLUSTER_COLUMN).is_ok() {
        df.drop(CLUSTER_COLUMN)?
    } else {
        df.clone()
    };
    out.with_column(Series::new(CLUSTER_COLUMN, clusters))?;
    Ok(out)
}

/// Mean `occurred` per (`kmeans_cluster`, `funnel_step`) of a long funnel frame
///
/// Fails with a precondition error if the frame has not been segmented.
pub fn segment_conversion_frame(df: &DataFrame) -> Result<DataFrame> {
    if df.column(CLUSTER_COLUMN).is_err() {
        return Err(PipelineError::precondition(
            "long funnel frame has no kmeans_cluster column; run segmentation first",
        ));
    }
    for name in ["funnel_step", "occurred"] {
        df.column(name)
            .map_err(|_| PipelineError::missing_column("long_funnel", name))?;
    }

    let table = df
        .clone()
        .lazy()
        .filter(col(CLUSTER_COLUMN).is_not_null())
        .group_by([col(CLUSTER_COLUMN), col("funnel_step")])
        .agg([
            col("occurred")
                .cast(DataType::Float64)
                .mean()
                .alias("conversion_rate"),
            col("occurred").count().alias("rows"),
        ])
        .collect()?;
    Ok(table)
}

/// Write a frame to CSV with a header row
pub fn write_csv(df: &mut DataFrame, path: impl AsRef<Path>) -> Result<()> {
    let mut file = File::create(path.as_ref())?;
    CsvWriter::new(&mut file).include_header(true).finish(df)?;
    tracing::debug!(path = %path.as_ref().display(), rows = df.height(), "wrote csv");
    Ok(())
}
