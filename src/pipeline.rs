//! Orchestration of one segmentation run over an input snapshot
//!
//! Each stage consumes complete tables and returns new ones; nothing is
//! mutated in place, so a failing stage leaves no partial output behind.

use crate::context::{DateWindow, PipelineContext, Stage};
use crate::data::RawTables;
use crate::describe::{describe, segment_conversion_table, ClusterProfile, SegmentConversion};
use crate::error::Result;
use crate::features::FeatureMatrix;
use crate::funnel::{
    aggregate_by_date, conversion_rates, pivot_to_long, AggregatedFunnel, ConversionRate,
    LongFunnelRecord,
};
use crate::model::{
    fit_kmeans, merge_into_funnel, merge_into_profile, ClusterModel, SegmentedFunnel,
    SegmentedProfile,
};
use crate::profile::{build_profile, derive_time_cohort};
use chrono::NaiveDate;
use std::borrow::Cow;

/// All tables produced by a run
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub long_funnel: Vec<LongFunnelRecord>,
    pub long_sessions: Option<Vec<LongFunnelRecord>>,
    pub aggregated_funnel: Vec<AggregatedFunnel>,
    pub conversion_rates: Vec<ConversionRate>,
    pub features: FeatureMatrix,
    pub model: ClusterModel,
    pub profile: SegmentedProfile,
    pub segmented_funnel: SegmentedFunnel,
    pub cluster_profile: ClusterProfile,
    pub segment_conversion: Vec<SegmentConversion>,
}

fn within_window<T: Clone>(
    rows: &[T],
    window: Option<DateWindow>,
    date: impl Fn(&T) -> NaiveDate,
) -> Cow<'_, [T]> {
    match window {
        Some(window) => Cow::Owned(rows.iter().filter(|row| window.contains(date(row))).cloned().collect()),
        None => Cow::Borrowed(rows),
    }
}

/// Run a stage, reporting its start and the size of its output
fn stage<T>(
    ctx: &PipelineContext,
    stage: Stage,
    rows: impl Fn(&T) -> usize,
    run: impl FnOnce() -> Result<T>,
) -> Result<T> {
    ctx.observer().stage_started(stage);
    let output = run()?;
    ctx.observer().stage_finished(stage, rows(&output));
    Ok(output)
}

/// Run the full pipeline
///
/// # Arguments
/// * `ctx` - Configuration and observer for this run
/// * `tables` - Input snapshot from the extraction layer
pub fn run(ctx: &PipelineContext, tables: &RawTables) -> Result<PipelineOutput> {
    let config = &ctx.config;
    config.validate()?;

    let events = within_window(&tables.events, config.date_window, |e| e.first_event_date);
    let label_map = config.label_map.as_ref();

    let long_funnel = stage(ctx, Stage::FunnelReshape, Vec::len, || {
        pivot_to_long(&events, label_map)
    })?;

    let long_sessions = match &tables.sessions {
        Some(sessions) => {
            let sessions = within_window(sessions, config.date_window, |s| s.first_event_date);
            Some(stage(ctx, Stage::SessionReshape, Vec::len, || {
                pivot_to_long(&sessions, label_map)
            })?)
        }
        None => None,
    };

    let aggregated_funnel = stage(ctx, Stage::FunnelAggregate, Vec::len, || {
        Ok(aggregate_by_date(&long_funnel))
    })?;
    let conversion_rates = conversion_rates(&long_funnel, &config.exclude_from_rates);

    let profile = stage(ctx, Stage::ProfileJoin, Vec::len, || {
        Ok(build_profile(&events, &tables.geo, &tables.devices))
    })?;
    let profile = stage(ctx, Stage::TimeCohort, Vec::len, || {
        derive_time_cohort(&profile, config.cohort_bucket_days)
    })?;

    let (profile, features) = stage(
        ctx,
        Stage::FeatureEngineering,
        |(_, matrix): &(_, FeatureMatrix)| matrix.n_rows(),
        || config.features.apply(&profile),
    )?;

    let model = stage(ctx, Stage::Clustering, |m: &ClusterModel| m.assignment.len(), || {
        fit_kmeans(&features, &config.clustering)
    })?;

    let (profile, segmented_funnel) = stage(
        ctx,
        Stage::ClusterMerge,
        |(p, _): &(SegmentedProfile, SegmentedFunnel)| p.len(),
        || {
            let segmented = merge_into_profile(&profile, &model.assignment)?;
            Ok((segmented, merge_into_funnel(&long_funnel, &model.assignment)))
        },
    )?;

    let cluster_profile = stage(
        ctx,
        Stage::ClusterDescribe,
        |p: &ClusterProfile| p.features.len(),
        || describe(&features, &model.centroids),
    )?;
    let segment_conversion = segment_conversion_table(&segmented_funnel);

    Ok(PipelineOutput {
        long_funnel,
        long_sessions,
        aggregated_funnel,
        conversion_rates,
        features,
        model,
        profile,
        segmented_funnel,
        cluster_profile,
        segment_conversion,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{PipelineConfig, StageObserver};
    use crate::data::{DeviceDimension, EventSummary, FunnelFlags, GeoDimension};
    use crate::error::ErrorKind;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default, Clone)]
    struct RecordingObserver {
        finished: Rc<RefCell<Vec<(Stage, usize)>>>,
    }

    impl StageObserver for RecordingObserver {
        fn stage_finished(&self, stage: Stage, rows: usize) {
            self.finished.borrow_mut().push((stage, rows));
        }
    }

    fn create_test_tables() -> RawTables {
        let countries = ["US", "US", "US", "CA", "CA", "GB"];
        let categories = ["desktop", "mobile", "desktop", "mobile", "tablet", "desktop"];

        let events = (0..6)
            .map(|i| EventSummary {
                user_id: format!("u{i}"),
                first_event_date: NaiveDate::from_ymd_opt(2020, 11, 1 + 4 * i as u32).unwrap(),
                first_event_timestamp: i as i64,
                flags: FunnelFlags {
                    viewed_page: true,
                    added_to_cart: i % 2 == 0,
                    began_checkout: i % 3 == 0,
                    purchased: i == 0,
                },
            })
            .collect();
        let geo = (0..6)
            .map(|i| GeoDimension {
                user_id: format!("u{i}"),
                continent: None,
                country: Some(countries[i].to_string()),
                region: None,
                city: None,
            })
            .collect();
        let devices = (0..6)
            .map(|i| DeviceDimension {
                user_id: format!("u{i}"),
                category: Some(categories[i].to_string()),
                mobile_brand_name: None,
                operating_system: None,
            })
            .collect();

        RawTables {
            events,
            sessions: None,
            geo,
            devices,
        }
    }

    fn config(n_clusters: usize) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.clustering.n_clusters = n_clusters;
        config
    }

    #[test]
    fn test_run_pipeline() {
        let observer = RecordingObserver::default();
        let ctx = PipelineContext::new(config(3)).with_observer(observer.clone());

        let output = run(&ctx, &create_test_tables()).unwrap();

        assert_eq!(output.long_funnel.len(), 24);
        assert_eq!(output.profile.len(), 6);
        assert_eq!(output.segmented_funnel.len(), 24);
        assert!(output.segmented_funnel.rows().iter().all(|r| r.kmeans_cluster.is_some()));
        assert_eq!(output.cluster_profile.n_clusters(), 3);
        assert_eq!(output.cluster_profile.features, output.features.columns);
        assert!(output.long_sessions.is_none());

        let stages: Vec<Stage> = observer.finished.borrow().iter().map(|(s, _)| *s).collect();
        assert_eq!(
            stages,
            vec![
                Stage::FunnelReshape,
                Stage::FunnelAggregate,
                Stage::ProfileJoin,
                Stage::TimeCohort,
                Stage::FeatureEngineering,
                Stage::Clustering,
                Stage::ClusterMerge,
                Stage::ClusterDescribe,
            ]
        );
    }

    #[test]
    fn test_date_window_filters_events() {
        let mut config = config(2);
        config.date_window = Some(DateWindow {
            start: NaiveDate::from_ymd_opt(2020, 11, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2020, 11, 10).unwrap(),
        });
        let ctx = PipelineContext::new(config);

        let output = run(&ctx, &create_test_tables()).unwrap();
        // Users on 11-01, 11-05 and 11-09
        assert_eq!(output.profile.len(), 3);
        assert_eq!(output.long_funnel.len(), 12);
    }

    #[test]
    fn test_too_many_clusters_fails_whole_run() {
        let observer = RecordingObserver::default();
        let ctx = PipelineContext::new(config(50)).with_observer(observer.clone());

        let err = run(&ctx, &create_test_tables()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientData);
        assert!(!observer
            .finished
            .borrow()
            .iter()
            .any(|(s, _)| *s == Stage::Clustering));
    }
}
