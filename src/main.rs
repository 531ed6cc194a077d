//! Funnelseg: customer segmentation and funnel conversion CLI
//!
//! Entrypoint that loads the input tables, runs the pipeline, writes the
//! output tables and prints a summary.

use anyhow::{Context, Result};
use clap::Parser;
use funnelseg::{export, pipeline, report, Args, PipelineContext, PipelineOutput, RawTables};
use std::fs;
use std::path::Path;
use std::time::Instant;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing(verbose: bool, json: bool) {
    let default_filter = if verbose { "funnelseg=debug" } else { "funnelseg=info" };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .init();
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose, args.log_json);

    if args.verbose {
        println!("Funnelseg - Customer Segmentation using K-Means");
        println!("===============================================\n");
    }

    let config = args.to_config()?;
    let start_time = Instant::now();

    // Step 1: Load input tables
    let data_start = Instant::now();
    let tables = RawTables::load(&args.events, &args.geo, &args.devices, args.sessions.as_deref())
        .with_context(|| format!("failed to load input tables from {}", args.events.display()))?;
    println!(
        "✓ Data loaded: {} event rows, {} geo rows, {} device rows",
        tables.events.len(),
        tables.geo.len(),
        tables.devices.len()
    );
    if args.verbose {
        println!("  Loading time: {:.2}s", data_start.elapsed().as_secs_f64());
    }

    // Step 2: Run the pipeline
    let run_start = Instant::now();
    let ctx = PipelineContext::new(config);
    let output = pipeline::run(&ctx, &tables).context("pipeline run failed")?;
    println!(
        "✓ Segmented {} customers into {} clusters",
        output.profile.len(),
        output.model.n_clusters
    );
    if args.verbose {
        println!("  Pipeline time: {:.2}s", run_start.elapsed().as_secs_f64());
        println!("  Features shape: {:?}", output.features.values.shape());
    }

    // Step 3: Write output tables
    write_outputs(&output, &args.output_dir)?;
    println!("✓ Tables written to {}", args.output_dir.display());

    report::print_report(&output);

    println!("\n=== Pipeline Complete ===");
    println!("Total processing time: {:.2}s", start_time.elapsed().as_secs_f64());

    Ok(())
}

/// Write every output table as CSV under `dir`
fn write_outputs(output: &PipelineOutput, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create output directory {}", dir.display()))?;

    let mut tables = vec![
        ("long_funnel.csv", export::segmented_funnel_frame(&output.segmented_funnel)?),
        ("aggregated_funnel.csv", export::aggregated_funnel_frame(&output.aggregated_funnel)?),
        ("conversion_rates.csv", export::conversion_rates_frame(&output.conversion_rates)?),
        ("customer_profile.csv", export::profile_frame(&output.profile)?),
        ("cluster_profile.csv", export::cluster_profile_frame(&output.cluster_profile)?),
        (
            "segment_conversion.csv",
            export::segment_conversion_rows_frame(&output.segment_conversion)?,
        ),
    ];
    if let Some(sessions) = &output.long_sessions {
        tables.push(("long_sessions.csv", export::long_funnel_frame(sessions)?));
    }

    for (name, df) in tables.iter_mut() {
        let path = dir.join(name);
        export::write_csv(df, &path).with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(())
}
