//! Input tables and their loading from CSV using Polars
//!
//! The extraction layer that produces these tables is external; this module
//! only knows the column sets and how to turn a `DataFrame` into typed rows.

use crate::error::{PipelineError, Result};
use chrono::NaiveDate;
use clap::ValueEnum;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// One of the four tracked funnel milestones, in funnel order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum FunnelStep {
    ViewedPage,
    AddedToCart,
    BeganCheckout,
    Purchased,
}

impl FunnelStep {
    /// All steps in their fixed funnel order.
    pub const ALL: [FunnelStep; 4] = [
        FunnelStep::ViewedPage,
        FunnelStep::AddedToCart,
        FunnelStep::BeganCheckout,
        FunnelStep::Purchased,
    ];

    /// Raw column name of the step.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ViewedPage => "viewed_page",
            Self::AddedToCart => "added_to_cart",
            Self::BeganCheckout => "began_checkout",
            Self::Purchased => "purchased",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|step| step.as_str() == name)
    }
}

impl fmt::Display for FunnelStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four independent funnel flags of a user or session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunnelFlags {
    pub viewed_page: bool,
    pub added_to_cart: bool,
    pub began_checkout: bool,
    pub purchased: bool,
}

impl FunnelFlags {
    pub fn get(&self, step: FunnelStep) -> bool {
        match step {
            FunnelStep::ViewedPage => self.viewed_page,
            FunnelStep::AddedToCart => self.added_to_cart,
            FunnelStep::BeganCheckout => self.began_checkout,
            FunnelStep::Purchased => self.purchased,
        }
    }

    pub fn set(&mut self, step: FunnelStep, value: bool) {
        match step {
            FunnelStep::ViewedPage => self.viewed_page = value,
            FunnelStep::AddedToCart => self.added_to_cart = value,
            FunnelStep::BeganCheckout => self.began_checkout = value,
            FunnelStep::Purchased => self.purchased = value,
        }
    }
}

/// Per-user funnel summary for the extraction window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSummary {
    pub user_id: String,
    pub first_event_date: NaiveDate,
    pub first_event_timestamp: i64,
    pub flags: FunnelFlags,
}

/// Per-session funnel summary; same columns as [`EventSummary`] plus the session key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub user_id: String,
    pub session_id: String,
    pub first_event_date: NaiveDate,
    pub first_event_timestamp: i64,
    pub flags: FunnelFlags,
}

/// Geography of a user, one row per session in the raw export
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GeoDimension {
    pub user_id: String,
    pub continent: Option<String>,
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
}

/// Device of a user, one row per session in the raw export
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceDimension {
    pub user_id: String,
    pub category: Option<String>,
    pub mobile_brand_name: Option<String>,
    pub operating_system: Option<String>,
}

/// The four tables handed over by the extraction layer
#[derive(Debug, Clone, Default)]
pub struct RawTables {
    pub events: Vec<EventSummary>,
    /// Session-level summary; optional because only the funnel reshaper uses it
    pub sessions: Option<Vec<SessionSummary>>,
    pub geo: Vec<GeoDimension>,
    pub devices: Vec<DeviceDimension>,
}

impl RawTables {
    /// Load all input tables from CSV files
    ///
    /// # Arguments
    /// * `events` - Path to the per-user event summary
    /// * `geo` - Path to the geo dimension
    /// * `devices` - Path to the device dimension
    /// * `sessions` - Optional path to the per-session summary
    pub fn load(
        events: impl AsRef<Path>,
        geo: impl AsRef<Path>,
        devices: impl AsRef<Path>,
        sessions: Option<&Path>,
    ) -> Result<Self> {
        let sessions = match sessions {
            Some(path) => Some(load_sessions(path)?),
            None => None,
        };

        Ok(Self {
            events: load_events(events)?,
            sessions,
            geo: load_geo(geo)?,
            devices: load_devices(devices)?,
        })
    }
}

/// Parse a `first_event_date` value into a calendar date
///
/// Accepts the compact `YYYYMMDD` form used by GA4 exports and ISO `YYYY-MM-DD`.
pub fn parse_event_date(value: &str) -> Result<NaiveDate> {
    let value = value.trim();
    NaiveDate::parse_from_str(value, "%Y%m%d")
        .or_else(|_| NaiveDate::parse_from_str(value, "%Y-%m-%d"))
        .map_err(|_| PipelineError::InvalidDate {
            value: value.to_string(),
        })
}

fn parse_flag(column: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(PipelineError::invalid_value(column, value)),
    }
}

/// Read a CSV file with every column kept as a string
///
/// Schema inference is disabled so identifiers and compact dates are never
/// coerced into numbers.
pub fn read_csv(path: impl AsRef<Path>) -> Result<DataFrame> {
    let df = LazyCsvReader::new(path.as_ref())
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .finish()?
        .collect()?;
    Ok(df)
}

/// Extract a column as trimmed optional strings; empty cells are null
fn string_column(df: &DataFrame, table: &'static str, name: &str) -> Result<Vec<Option<String>>> {
    let column = df
        .column(name)
        .map_err(|_| PipelineError::missing_column(table, name))?
        .cast(&DataType::String)?;

    let values = column
        .str()?
        .into_iter()
        .map(|value| {
            value
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        })
        .collect();
    Ok(values)
}

/// Extract a column whose every cell must be present
fn required_column(df: &DataFrame, table: &'static str, name: &str) -> Result<Vec<String>> {
    string_column(df, table, name)?
        .into_iter()
        .map(|value| value.ok_or_else(|| PipelineError::invalid_value(name, "<null>")))
        .collect()
}

/// Columns shared by the event and session summaries
struct SummaryColumns {
    user_ids: Vec<String>,
    dates: Vec<NaiveDate>,
    timestamps: Vec<i64>,
    flags: Vec<FunnelFlags>,
}

fn summary_columns(df: &DataFrame, table: &'static str) -> Result<SummaryColumns> {
    let user_ids = required_column(df, table, "user_id")?;

    let dates = required_column(df, table, "first_event_date")?
        .iter()
        .map(|value| parse_event_date(value))
        .collect::<Result<Vec<_>>>()?;

    let timestamps = required_column(df, table, "first_event_timestamp")?
        .iter()
        .map(|value| {
            value
                .parse::<i64>()
                .map_err(|_| PipelineError::invalid_value("first_event_timestamp", value.as_str()))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut flags = vec![FunnelFlags::default(); df.height()];
    for step in FunnelStep::ALL {
        let values = required_column(df, table, step.as_str())?;
        for (row, value) in flags.iter_mut().zip(values.iter()) {
            row.set(step, parse_flag(step.as_str(), value)?);
        }
    }

    Ok(SummaryColumns {
        user_ids,
        dates,
        timestamps,
        flags,
    })
}

/// Convert an event summary `DataFrame` into typed rows
pub fn events_from_frame(df: &DataFrame) -> Result<Vec<EventSummary>> {
    let columns = summary_columns(df, "events")?;

    let rows = columns
        .user_ids
        .into_iter()
        .zip(columns.dates)
        .zip(columns.timestamps)
        .zip(columns.flags)
        .map(|(((user_id, first_event_date), first_event_timestamp), flags)| EventSummary {
            user_id,
            first_event_date,
            first_event_timestamp,
            flags,
        })
        .collect();
    Ok(rows)
}

/// Convert a session summary `DataFrame` into typed rows
pub fn sessions_from_frame(df: &DataFrame) -> Result<Vec<SessionSummary>> {
    let session_ids = required_column(df, "sessions", "session_id")?;
    let columns = summary_columns(df, "sessions")?;

    let rows = columns
        .user_ids
        .into_iter()
        .zip(session_ids)
        .zip(columns.dates)
        .zip(columns.timestamps)
        .zip(columns.flags)
        .map(
            |((((user_id, session_id), first_event_date), first_event_timestamp), flags)| {
                SessionSummary {
                    user_id,
                    session_id,
                    first_event_date,
                    first_event_timestamp,
                    flags,
                }
            },
        )
        .collect();
    Ok(rows)
}

/// Convert a geo dimension `DataFrame` into typed rows
pub fn geo_from_frame(df: &DataFrame) -> Result<Vec<GeoDimension>> {
    let user_ids = required_column(df, "geo", "user_id")?;
    let continents = string_column(df, "geo", "continent")?;
    let countries = string_column(df, "geo", "country")?;
    let regions = string_column(df, "geo", "region")?;
    let cities = string_column(df, "geo", "city")?;

    let rows = user_ids
        .into_iter()
        .zip(continents)
        .zip(countries)
        .zip(regions)
        .zip(cities)
        .map(|((((user_id, continent), country), region), city)| GeoDimension {
            user_id,
            continent,
            country,
            region,
            city,
        })
        .collect();
    Ok(rows)
}

/// Convert a device dimension `DataFrame` into typed rows
pub fn devices_from_frame(df: &DataFrame) -> Result<Vec<DeviceDimension>> {
    let user_ids = required_column(df, "devices", "user_id")?;
    let categories = string_column(df, "devices", "category")?;
    let brands = string_column(df, "devices", "mobile_brand_name")?;
    let systems = string_column(df, "devices", "operating_system")?;

    let rows = user_ids
        .into_iter()
        .zip(categories)
        .zip(brands)
        .zip(systems)
        .map(
            |(((user_id, category), mobile_brand_name), operating_system)| DeviceDimension {
                user_id,
                category,
                mobile_brand_name,
                operating_system,
            },
        )
        .collect();
    Ok(rows)
}

pub fn load_events(path: impl AsRef<Path>) -> Result<Vec<EventSummary>> {
    events_from_frame(&read_csv(path)?)
}

pub fn load_sessions(path: impl AsRef<Path>) -> Result<Vec<SessionSummary>> {
    sessions_from_frame(&read_csv(path)?)
}

pub fn load_geo(path: impl AsRef<Path>) -> Result<Vec<GeoDimension>> {
    geo_from_frame(&read_csv(path)?)
}

pub fn load_devices(path: impl AsRef<Path>) -> Result<Vec<DeviceDimension>> {
    devices_from_frame(&read_csv(path)?)
}
