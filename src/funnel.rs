//! Funnel reshaping: wide flag tables to long records and per-date aggregates

use crate::data::{EventSummary, FunnelFlags, FunnelStep, SessionSummary};
use crate::error::{PipelineError, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A wide row carrying the four funnel flags plus its id columns
pub trait WideFunnelRow {
    fn user_id(&self) -> &str;

    /// Extra id column for session-level tables
    fn session_id(&self) -> Option<&str> {
        None
    }

    fn first_event_date(&self) -> NaiveDate;

    fn first_event_timestamp(&self) -> i64;

    fn flags(&self) -> FunnelFlags;
}

impl WideFunnelRow for EventSummary {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    fn first_event_date(&self) -> NaiveDate {
        self.first_event_date
    }

    fn first_event_timestamp(&self) -> i64 {
        self.first_event_timestamp
    }

    fn flags(&self) -> FunnelFlags {
        self.flags
    }
}

impl WideFunnelRow for SessionSummary {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    fn session_id(&self) -> Option<&str> {
        Some(&self.session_id)
    }

    fn first_event_date(&self) -> NaiveDate {
        self.first_event_date
    }

    fn first_event_timestamp(&self) -> i64 {
        self.first_event_timestamp
    }

    fn flags(&self) -> FunnelFlags {
        self.flags
    }
}

/// One (id, funnel step) observation of the melted funnel table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LongFunnelRecord {
    pub user_id: String,
    pub session_id: Option<String>,
    pub step: FunnelStep,
    /// Raw step name or its display label
    pub funnel_step: String,
    /// 1 if the step occurred, else 0
    pub occurred: u8,
    pub first_event_date: NaiveDate,
    pub first_event_timestamp: i64,
}

/// Sum of occurrences for one (date, step) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedFunnel {
    pub first_event_date: NaiveDate,
    pub step: FunnelStep,
    pub funnel_step: String,
    pub occurred: u64,
}

/// Share of rows in which a step occurred
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionRate {
    pub step: FunnelStep,
    pub funnel_step: String,
    pub rate: f64,
    pub rows: usize,
}

/// Mapping from raw step names to display labels
///
/// Must cover every step that is pivoted; a gap is an error rather than a
/// silent pass-through of the raw name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelMap {
    labels: HashMap<String, String>,
}

impl LabelMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_label(mut self, raw: impl Into<String>, label: impl Into<String>) -> Self {
        self.labels.insert(raw.into(), label.into());
        self
    }

    /// Human readable labels for the four standard steps
    pub fn display_defaults() -> Self {
        Self::new()
            .with_label("viewed_page", "Viewed Page")
            .with_label("added_to_cart", "Added to Cart")
            .with_label("began_checkout", "Began Checkout")
            .with_label("purchased", "Purchased")
    }

    /// Parse `raw=Label` pairs separated by commas
    pub fn parse(spec: &str) -> Result<Self> {
        let mut map = Self::new();
        for pair in spec.split(',').filter(|p| !p.trim().is_empty()) {
            let (raw, label) = pair
                .split_once('=')
                .ok_or_else(|| PipelineError::invalid_config(format!("label pair `{pair}` is not raw=Label")))?;
            map = map.with_label(raw.trim(), label.trim());
        }
        Ok(map)
    }

    pub fn label(&self, step: FunnelStep) -> Result<&str> {
        self.labels
            .get(step.as_str())
            .map(String::as_str)
            .ok_or_else(|| PipelineError::UnmappedCategory {
                value: step.as_str().to_string(),
            })
    }
}

/// Resolve the label of every step up front so a partial map fails before any row is built
fn resolve_labels(label_map: Option<&LabelMap>) -> Result<[String; 4]> {
    let mut labels: [String; 4] = Default::default();
    for (slot, step) in labels.iter_mut().zip(FunnelStep::ALL) {
        *slot = match label_map {
            Some(map) => map.label(step)?.to_string(),
            None => step.as_str().to_string(),
        };
    }
    Ok(labels)
}

/// Unpivot wide funnel rows into one record per (row, step)
///
/// # Arguments
/// * `rows` - Event or session summary rows
/// * `label_map` - Optional total mapping from raw step names to display labels
///
/// # Returns
/// * Exactly four records per input row, in funnel order
pub fn pivot_to_long<R: WideFunnelRow>(
    rows: &[R],
    label_map: Option<&LabelMap>,
) -> Result<Vec<LongFunnelRecord>> {
    let labels = resolve_labels(label_map)?;

    let mut records = Vec::with_capacity(rows.len() * FunnelStep::ALL.len());
    for row in rows {
        let flags = row.flags();
        for (step, label) in FunnelStep::ALL.into_iter().zip(labels.iter()) {
            records.push(LongFunnelRecord {
                user_id: row.user_id().to_string(),
                session_id: row.session_id().map(str::to_string),
                step,
                funnel_step: label.clone(),
                occurred: u8::from(flags.get(step)),
                first_event_date: row.first_event_date(),
                first_event_timestamp: row.first_event_timestamp(),
            });
        }
    }

    tracing::debug!(rows = rows.len(), records = records.len(), "pivoted funnel to long format");
    Ok(records)
}

/// Sum occurrences per (first_event_date, funnel step)
///
/// Output is sorted by date then funnel order; callers should not rely on it.
pub fn aggregate_by_date(records: &[LongFunnelRecord]) -> Vec<AggregatedFunnel> {
    let mut groups: BTreeMap<(NaiveDate, FunnelStep), (&str, u64)> = BTreeMap::new();
    for record in records {
        let entry = groups
            .entry((record.first_event_date, record.step))
            .or_insert((record.funnel_step.as_str(), 0));
        entry.1 += u64::from(record.occurred);
    }

    groups
        .into_iter()
        .map(|((first_event_date, step), (label, occurred))| AggregatedFunnel {
            first_event_date,
            step,
            funnel_step: label.to_string(),
            occurred,
        })
        .collect()
}

/// Mean occurrence per step across all records
///
/// # Arguments
/// * `records` - Long funnel records
/// * `exclude` - Steps to leave out, e.g. page views which dwarf the rest
pub fn conversion_rates(records: &[LongFunnelRecord], exclude: &[FunnelStep]) -> Vec<ConversionRate> {
    let mut totals: BTreeMap<FunnelStep, (&str, u64, usize)> = BTreeMap::new();
    for record in records.iter().filter(|r| !exclude.contains(&r.step)) {
        let entry = totals
            .entry(record.step)
            .or_insert((record.funnel_step.as_str(), 0, 0));
        entry.1 += u64::from(record.occurred);
        entry.2 += 1;
    }

    totals
        .into_iter()
        .map(|(step, (label, occurred, rows))| ConversionRate {
            step,
            funnel_step: label.to_string(),
            rate: occurred as f64 / rows as f64,
            rows,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use proptest::prelude::*;

    fn event(user_id: &str, day: u32, flags: FunnelFlags) -> EventSummary {
        EventSummary {
            user_id: user_id.to_string(),
            first_event_date: NaiveDate::from_ymd_opt(2020, 11, day).unwrap(),
            first_event_timestamp: i64::from(day) * 86_400_000_000,
            flags,
        }
    }

    fn two_users() -> Vec<EventSummary> {
        vec![
            event(
                "a",
                1,
                FunnelFlags {
                    viewed_page: true,
                    ..Default::default()
                },
            ),
            event(
                "b",
                1,
                FunnelFlags {
                    viewed_page: true,
                    purchased: true,
                    ..Default::default()
                },
            ),
        ]
    }

    #[test]
    fn test_two_user_scenario() {
        let long = pivot_to_long(&two_users(), None).unwrap();
        assert_eq!(long.len(), 8);

        let agg = aggregate_by_date(&long);
        assert_eq!(agg.len(), 4);
        let count = |step: FunnelStep| agg.iter().find(|a| a.step == step).unwrap().occurred;
        assert_eq!(count(FunnelStep::ViewedPage), 2);
        assert_eq!(count(FunnelStep::AddedToCart), 0);
        assert_eq!(count(FunnelStep::BeganCheckout), 0);
        assert_eq!(count(FunnelStep::Purchased), 1);
    }

    #[test]
    fn test_display_labels() {
        let long = pivot_to_long(&two_users(), Some(&LabelMap::display_defaults())).unwrap();
        assert_eq!(long[0].funnel_step, "Viewed Page");
        assert_eq!(long[3].funnel_step, "Purchased");
    }

    #[test]
    fn test_partial_label_map_fails() {
        let partial = LabelMap::new()
            .with_label("viewed_page", "Viewed")
            .with_label("purchased", "Bought");

        let err = pivot_to_long(&two_users(), Some(&partial)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnmappedCategory);
        assert!(err.to_string().contains("added_to_cart"));
    }

    #[test]
    fn test_parse_label_map() {
        let map = LabelMap::parse("viewed_page=View, added_to_cart=Cart,began_checkout=Checkout,purchased=Buy").unwrap();
        assert_eq!(map.label(FunnelStep::AddedToCart).unwrap(), "Cart");
        assert!(LabelMap::parse("viewed_page").is_err());
    }

    #[test]
    fn test_session_pivot_keeps_session_id() {
        let sessions = vec![SessionSummary {
            user_id: "a".to_string(),
            session_id: "s1".to_string(),
            first_event_date: NaiveDate::from_ymd_opt(2020, 11, 2).unwrap(),
            first_event_timestamp: 0,
            flags: FunnelFlags::default(),
        }];

        let long = pivot_to_long(&sessions, None).unwrap();
        assert_eq!(long.len(), 4);
        assert!(long.iter().all(|r| r.session_id.as_deref() == Some("s1")));
    }

    #[test]
    fn test_conversion_rates_exclude_page_views() {
        let long = pivot_to_long(&two_users(), None).unwrap();

        let rates = conversion_rates(&long, &[FunnelStep::ViewedPage]);
        assert_eq!(rates.len(), 3);
        let purchased = rates.iter().find(|r| r.step == FunnelStep::Purchased).unwrap();
        assert!((purchased.rate - 0.5).abs() < 1e-12);
        assert_eq!(purchased.rows, 2);
    }

    #[test]
    fn test_aggregate_splits_dates() {
        let events = vec![
            event("a", 1, FunnelFlags { viewed_page: true, ..Default::default() }),
            event("b", 2, FunnelFlags { viewed_page: true, ..Default::default() }),
        ];
        let agg = aggregate_by_date(&pivot_to_long(&events, None).unwrap());
        assert_eq!(agg.len(), 8);
        assert!(agg
            .iter()
            .filter(|a| a.step == FunnelStep::ViewedPage)
            .all(|a| a.occurred == 1));
    }

    proptest! {
        #[test]
        fn pivot_produces_four_rows_and_round_trips(
            flags in prop::collection::vec(any::<(bool, bool, bool, bool)>(), 0..40)
        ) {
            let events: Vec<EventSummary> = flags
                .iter()
                .enumerate()
                .map(|(i, &(v, a, b, p))| event(
                    &format!("u{i}"),
                    1 + (i % 28) as u32,
                    FunnelFlags { viewed_page: v, added_to_cart: a, began_checkout: b, purchased: p },
                ))
                .collect();

            let long = pivot_to_long(&events, None).unwrap();
            prop_assert_eq!(long.len(), 4 * events.len());

            for (source, chunk) in events.iter().zip(long.chunks(4)) {
                let mut rebuilt = FunnelFlags::default();
                for record in chunk {
                    prop_assert_eq!(&record.user_id, &source.user_id);
                    rebuilt.set(record.step, record.occurred == 1);
                }
                prop_assert_eq!(rebuilt, source.flags);
            }
        }
    }
}
