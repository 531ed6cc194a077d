//! Customer profile: event summary joined with geo and device dimensions

use crate::data::{DeviceDimension, EventSummary, GeoDimension};
use crate::error::{PipelineError, Result};
use chrono::NaiveDate;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;

/// Categorical attribute of a customer profile usable as a clustering feature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ProfileAttribute {
    /// Time cohort; only present after [`derive_time_cohort`]
    Week,
    Continent,
    Country,
    Region,
    City,
    Category,
    MobileBrandName,
    OperatingSystem,
}

impl ProfileAttribute {
    /// Column name as exposed to downstream tables
    pub fn name(&self) -> &'static str {
        match self {
            Self::Week => "week",
            Self::Continent => "continent",
            Self::Country => "country",
            Self::Region => "region",
            Self::City => "city",
            Self::Category => "category",
            Self::MobileBrandName => "mobile_brand_name",
            Self::OperatingSystem => "operating_system",
        }
    }
}

impl fmt::Display for ProfileAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One customer row after the dimension joins
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerProfile {
    pub user_id: String,
    pub first_event_date: NaiveDate,
    pub continent: Option<String>,
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub category: Option<String>,
    pub mobile_brand_name: Option<String>,
    pub operating_system: Option<String>,
    /// Cohort bucket, 1-based
    pub week: Option<u32>,
}

impl CustomerProfile {
    /// Read an attribute as a categorical value; `None` when null
    pub fn attribute(&self, attribute: ProfileAttribute) -> Option<Cow<'_, str>> {
        match attribute {
            ProfileAttribute::Week => self.week.map(|w| Cow::Owned(w.to_string())),
            _ => self
                .text_attribute(attribute)
                .and_then(|value| value.as_deref())
                .map(Cow::Borrowed),
        }
    }

    fn text_attribute(&self, attribute: ProfileAttribute) -> Option<&Option<String>> {
        match attribute {
            ProfileAttribute::Week => None,
            ProfileAttribute::Continent => Some(&self.continent),
            ProfileAttribute::Country => Some(&self.country),
            ProfileAttribute::Region => Some(&self.region),
            ProfileAttribute::City => Some(&self.city),
            ProfileAttribute::Category => Some(&self.category),
            ProfileAttribute::MobileBrandName => Some(&self.mobile_brand_name),
            ProfileAttribute::OperatingSystem => Some(&self.operating_system),
        }
    }

    /// Mutable access to a string attribute; `None` for the numeric week
    pub(crate) fn text_attribute_mut(&mut self, attribute: ProfileAttribute) -> Option<&mut Option<String>> {
        match attribute {
            ProfileAttribute::Week => None,
            ProfileAttribute::Continent => Some(&mut self.continent),
            ProfileAttribute::Country => Some(&mut self.country),
            ProfileAttribute::Region => Some(&mut self.region),
            ProfileAttribute::City => Some(&mut self.city),
            ProfileAttribute::Category => Some(&mut self.category),
            ProfileAttribute::MobileBrandName => Some(&mut self.mobile_brand_name),
            ProfileAttribute::OperatingSystem => Some(&mut self.operating_system),
        }
    }
}

/// Drop exact duplicate rows, keeping first-seen order, and index them by user
fn dedup_by_user<'a, T, F>(rows: &'a [T], user_id: F) -> HashMap<&'a str, Vec<&'a T>>
where
    T: Eq + Hash,
    F: Fn(&'a T) -> &'a str,
{
    let mut seen = HashSet::new();
    let mut by_user: HashMap<&str, Vec<&T>> = HashMap::new();
    for row in rows {
        if seen.insert(row) {
            by_user.entry(user_id(row)).or_default().push(row);
        }
    }
    by_user
}

/// Build the customer profile from the event summary and dimension tables
///
/// Dimension tables are deduplicated on their full row, then left joined on
/// `user_id`. A user with several distinct geo or device rows yields one
/// profile row per combination.
///
/// # Arguments
/// * `events` - Per-user event summary (left side of both joins)
/// * `geo` - Geo dimension, possibly with one row per session
/// * `devices` - Device dimension, possibly with one row per session
pub fn build_profile(
    events: &[EventSummary],
    geo: &[GeoDimension],
    devices: &[DeviceDimension],
) -> Vec<CustomerProfile> {
    let geo_by_user = dedup_by_user(geo, |row| row.user_id.as_str());
    let devices_by_user = dedup_by_user(devices, |row| row.user_id.as_str());

    let mut profile = Vec::with_capacity(events.len());
    for event in events {
        let geo_rows: Vec<Option<&GeoDimension>> = match geo_by_user.get(event.user_id.as_str()) {
            Some(rows) => rows.iter().copied().map(Some).collect(),
            None => vec![None],
        };
        let device_rows: Vec<Option<&DeviceDimension>> =
            match devices_by_user.get(event.user_id.as_str()) {
                Some(rows) => rows.iter().copied().map(Some).collect(),
                None => vec![None],
            };

        for geo_row in &geo_rows {
            for device_row in &device_rows {
                profile.push(CustomerProfile {
                    user_id: event.user_id.clone(),
                    first_event_date: event.first_event_date,
                    continent: geo_row.and_then(|g| g.continent.clone()),
                    country: geo_row.and_then(|g| g.country.clone()),
                    region: geo_row.and_then(|g| g.region.clone()),
                    city: geo_row.and_then(|g| g.city.clone()),
                    category: device_row.and_then(|d| d.category.clone()),
                    mobile_brand_name: device_row.and_then(|d| d.mobile_brand_name.clone()),
                    operating_system: device_row.and_then(|d| d.operating_system.clone()),
                    week: None,
                });
            }
        }
    }

    tracing::debug!(
        events = events.len(),
        profile_rows = profile.len(),
        "joined geo and device dimensions"
    );
    profile
}

/// Assign each profile row its time cohort
///
/// `week = floor((date - min(date)) / bucket_days) + 1`, where the minimum is
/// taken over the given profile. Cohort numbering therefore shifts if the
/// profile changes; cohort each profile snapshot exactly once.
pub fn derive_time_cohort(profile: &[CustomerProfile], bucket_days: u32) -> Result<Vec<CustomerProfile>> {
    if bucket_days == 0 {
        return Err(PipelineError::invalid_config("cohort bucket size must be at least one day"));
    }

    let Some(min_date) = profile.iter().map(|row| row.first_event_date).min() else {
        return Ok(Vec::new());
    };

    let cohorted = profile
        .iter()
        .map(|row| {
            let days = (row.first_event_date - min_date).num_days();
            let week = u32::try_from(days / i64::from(bucket_days))
                .map_err(|_| PipelineError::invalid_value("first_event_date", row.first_event_date.to_string()))?
                + 1;
            Ok(CustomerProfile {
                week: Some(week),
                ..row.clone()
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(cohorted)
}
