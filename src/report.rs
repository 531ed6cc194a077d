//! Console summary of a pipeline run

use crate::data::FunnelStep;
use crate::pipeline::PipelineOutput;

/// Number of distinguishing features listed per cluster
const TOP_FEATURES: usize = 3;

/// Format the cluster statistics section
pub fn cluster_statistics(output: &PipelineOutput) -> String {
    let model = &output.model;
    let total = model.assignment.len();
    let mut lines = vec![
        "=== Cluster Statistics ===".to_string(),
        format!("Number of clusters: {}", model.n_clusters),
        format!("Total customer rows: {}", total),
        format!("Within-cluster sum of squares (Inertia): {:.2}", model.inertia),
        format!(
            "Silhouette score (sample): {:.3}",
            model.silhouette_sample(&output.features, 100)
        ),
        String::new(),
    ];

    for (cluster, &size) in model.cluster_sizes().iter().enumerate() {
        let percentage = if total == 0 {
            0.0
        } else {
            (size as f64 / total as f64) * 100.0
        };
        lines.push(format!("Cluster {}: {} customers ({:.1}%)", cluster, size, percentage));

        let top = output.cluster_profile.top_features(cluster, TOP_FEATURES);
        let described: Vec<String> = top
            .iter()
            .map(|(feature, deviation)| format!("{feature} {deviation:+.2}"))
            .collect();
        lines.push(format!("  distinguishing: {}", described.join(", ")));
    }

    lines.join("\n")
}

/// Format overall and per-cluster conversion rates
pub fn conversion_summary(output: &PipelineOutput) -> String {
    let mut lines = vec!["=== Funnel Conversion ===".to_string()];
    for rate in &output.conversion_rates {
        lines.push(format!("{:<16} {:>6.1}%", rate.funnel_step, rate.rate * 100.0));
    }

    lines.push(String::new());
    let header: Vec<String> = FunnelStep::ALL.iter().map(|s| format!("{:>15}", s.as_str())).collect();
    lines.push(format!("Cluster {}", header.join("")));
    for cluster in 0..output.model.n_clusters {
        let cells: Vec<String> = FunnelStep::ALL
            .iter()
            .map(|step| {
                output
                    .segment_conversion
                    .iter()
                    .find(|c| c.kmeans_cluster == cluster && c.step == *step)
                    .map(|c| format!("{:>14.1}%", c.conversion_rate * 100.0))
                    .unwrap_or_else(|| format!("{:>15}", "-"))
            })
            .collect();
        lines.push(format!("{:<7} {}", cluster, cells.join("")));
    }

    lines.join("\n")
}

/// Print the full report to stdout
pub fn print_report(output: &PipelineOutput) {
    println!("\n{}", conversion_summary(output));
    println!("\n{}", cluster_statistics(output));
}
