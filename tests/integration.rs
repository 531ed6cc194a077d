//! Integration tests for funnelseg

use funnelseg::data::read_csv;
use funnelseg::{
    aggregate_by_date, export, pipeline, ErrorKind, FunnelStep, PipelineConfig, PipelineContext,
    RawTables,
};
use polars::prelude::{col, DataType, IntoLazy};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::{tempdir, TempDir};

const COUNTRIES: [&str; 8] = ["US", "US", "US", "CA", "CA", "GB", "GB", "NZ"];
const CATEGORIES: [&str; 8] = [
    "desktop", "mobile", "desktop", "mobile", "tablet", "desktop", "mobile", "desktop",
];

fn write_file(dir: &Path, name: &str, lines: &[String]) -> PathBuf {
    let path = dir.join(name);
    let mut file = fs::File::create(&path).unwrap();
    for line in lines {
        writeln!(file, "{line}").unwrap();
    }
    path
}

/// Write an eight user snapshot spread over three weeks
fn create_test_tables() -> (TempDir, PathBuf, PathBuf, PathBuf, PathBuf) {
    let dir = tempdir().unwrap();

    let mut events = vec![
        "user_id,first_event_date,first_event_timestamp,viewed_page,added_to_cart,began_checkout,purchased"
            .to_string(),
    ];
    let mut sessions = vec![
        "user_id,session_id,first_event_date,first_event_timestamp,viewed_page,added_to_cart,began_checkout,purchased"
            .to_string(),
    ];
    let mut geo = vec!["user_id,continent,country,region,city".to_string()];
    let mut devices = vec!["user_id,category,mobile_brand_name,operating_system".to_string()];

    for i in 0..8u32 {
        let date = format!("202011{:02}", 1 + 3 * i);
        let cart = i % 2 == 0;
        let checkout = i % 3 == 0;
        let purchased = i % 4 == 0;
        events.push(format!(
            "{i}.77,{date},{},true,{cart},{checkout},{purchased}",
            1_604_188_800_000_000u64 + u64::from(i)
        ));
        sessions.push(format!("{i}.77,s{i},{date},{},1,0,0,0", 1_604_188_800_000_000u64 + u64::from(i)));
        geo.push(format!("{i}.77,Americas,{},,", COUNTRIES[i as usize]));
        devices.push(format!("{i}.77,{},Apple,iOS", CATEGORIES[i as usize]));
    }

    let events = write_file(dir.path(), "events.csv", &events);
    let sessions = write_file(dir.path(), "sessions.csv", &sessions);
    let geo = write_file(dir.path(), "geo.csv", &geo);
    let devices = write_file(dir.path(), "devices.csv", &devices);
    (dir, events, geo, devices, sessions)
}

fn config(n_clusters: usize) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.clustering.n_clusters = n_clusters;
    config.features.min_frequency = 0.2;
    config
}

#[test]
fn test_end_to_end_pipeline() {
    let (_dir, events, geo, devices, sessions) = create_test_tables();
    let tables = RawTables::load(&events, &geo, &devices, Some(sessions.as_path())).unwrap();

    assert_eq!(tables.events.len(), 8);
    assert_eq!(tables.sessions.as_ref().map(Vec::len), Some(8));

    let ctx = PipelineContext::new(config(3));
    let output = pipeline::run(&ctx, &tables).unwrap();

    // Four long records per event row and per session row
    assert_eq!(output.long_funnel.len(), 32);
    assert_eq!(output.long_sessions.as_ref().map(Vec::len), Some(32));

    // Every user has exactly one geo and device row
    assert_eq!(output.profile.len(), 8);
    assert!(output.model.assignment.clusters.iter().all(|&c| c < 3));

    // NZ is the only country below the 20% threshold
    let countries: Vec<_> = output
        .profile
        .rows()
        .iter()
        .filter_map(|r| r.profile.country.as_deref())
        .collect();
    assert!(countries.contains(&"other"));
    assert!(!countries.contains(&"NZ"));

    let viewed = output
        .conversion_rates
        .iter()
        .find(|r| r.step == FunnelStep::ViewedPage)
        .unwrap();
    assert!((viewed.rate - 1.0).abs() < 1e-12);
}

#[test]
fn test_outputs_written_as_csv() {
    let (dir, events, geo, devices, _sessions) = create_test_tables();
    let tables = RawTables::load(&events, &geo, &devices, None).unwrap();
    let output = pipeline::run(&PipelineContext::new(config(2)), &tables).unwrap();

    let out_dir = dir.path().join("output");
    fs::create_dir_all(&out_dir).unwrap();

    let mut profile = export::profile_frame(&output.profile).unwrap();
    export::write_csv(&mut profile, out_dir.join("customer_profile.csv")).unwrap();
    let mut funnel = export::segmented_funnel_frame(&output.segmented_funnel).unwrap();
    export::write_csv(&mut funnel, out_dir.join("long_funnel.csv")).unwrap();

    let profile = read_csv(out_dir.join("customer_profile.csv")).unwrap();
    assert_eq!(profile.height(), 8);
    assert!(profile.column("kmeans_cluster").is_ok());
    assert!(profile.column("week").is_ok());

    // Segment conversion from the reloaded frame matches the typed table
    let funnel = read_csv(out_dir.join("long_funnel.csv")).unwrap();
    let funnel = funnel
        .lazy()
        .with_columns([col("occurred").cast(DataType::UInt32)])
        .collect()
        .unwrap();
    let table = export::segment_conversion_frame(&funnel).unwrap();
    assert_eq!(table.height(), output.segment_conversion.len());
}

#[test]
fn test_segment_conversion_before_clustering() {
    let (_dir, events, geo, devices, _sessions) = create_test_tables();
    let tables = RawTables::load(&events, &geo, &devices, None).unwrap();
    let output = pipeline::run(&PipelineContext::new(config(2)), &tables).unwrap();

    let unsegmented = export::long_funnel_frame(&output.long_funnel).unwrap();
    let err = export::segment_conversion_frame(&unsegmented).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Precondition);

    let segmented = export::attach_clusters(&unsegmented, &output.model.assignment).unwrap();
    assert!(export::segment_conversion_frame(&segmented).is_ok());
}

#[test]
fn test_two_user_funnel() {
    let dir = tempdir().unwrap();
    let events = write_file(
        dir.path(),
        "events.csv",
        &[
            "user_id,first_event_date,first_event_timestamp,viewed_page,added_to_cart,began_checkout,purchased".to_string(),
            "a,20201101,1,true,false,false,false".to_string(),
            "b,20201101,2,true,false,false,true".to_string(),
        ],
    );
    let tables = RawTables {
        events: funnelseg::data::load_events(&events).unwrap(),
        ..Default::default()
    };

    let long = funnelseg::pivot_to_long(&tables.events, None).unwrap();
    assert_eq!(long.len(), 8);

    let aggregated = aggregate_by_date(&long);
    let count = |step: FunnelStep| {
        aggregated
            .iter()
            .find(|a| a.step == step)
            .map(|a| a.occurred)
            .unwrap()
    };
    assert_eq!(count(FunnelStep::ViewedPage), 2);
    assert_eq!(count(FunnelStep::AddedToCart), 0);
    assert_eq!(count(FunnelStep::BeganCheckout), 0);
    assert_eq!(count(FunnelStep::Purchased), 1);
}

#[test]
fn test_error_handling_missing_column() {
    let dir = tempdir().unwrap();
    let events = write_file(
        dir.path(),
        "events.csv",
        &[
            "user_id,first_event_date,viewed_page,added_to_cart,began_checkout,purchased".to_string(),
            "a,20201101,true,false,false,false".to_string(),
        ],
    );

    let err = funnelseg::data::load_events(&events).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InputFormat);
    assert!(err.to_string().contains("first_event_timestamp"));
}

#[test]
fn test_error_handling_invalid_clusters() {
    let (_dir, events, geo, devices, _sessions) = create_test_tables();
    let tables = RawTables::load(&events, &geo, &devices, None).unwrap();

    let err = pipeline::run(&PipelineContext::new(config(100)), &tables).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientData);

    let err = pipeline::run(&PipelineContext::new(config(0)), &tables).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);
}

#[test]
fn test_seeded_runs_are_reproducible() {
    let (_dir, events, geo, devices, _sessions) = create_test_tables();
    let tables = RawTables::load(&events, &geo, &devices, None).unwrap();

    let first = pipeline::run(&PipelineContext::new(config(3)), &tables).unwrap();
    let second = pipeline::run(&PipelineContext::new(config(3)), &tables).unwrap();
    assert_eq!(first.model.assignment, second.model.assignment);
}
