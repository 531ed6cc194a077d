//! Cluster interpretation: centroid deviations and per-segment conversion

use crate::data::FunnelStep;
use crate::error::{PipelineError, Result};
use crate::features::FeatureMatrix;
use crate::model::SegmentedFunnel;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Centroid minus population mean for every (feature, cluster)
///
/// Values are not scaled by feature variance, so deviations of features with
/// very different base rates are not directly comparable.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterProfile {
    /// Feature names, one per matrix row
    pub features: Vec<String>,
    /// Population mean of each feature
    pub population_means: Vec<f64>,
    /// Signed deviations (n_features, n_clusters)
    pub deviations: Array2<f64>,
}

impl ClusterProfile {
    pub fn n_clusters(&self) -> usize {
        self.deviations.ncols()
    }

    /// Features of a cluster ranked by absolute deviation, largest first
    pub fn top_features(&self, cluster: usize, n: usize) -> Vec<(&str, f64)> {
        if cluster >= self.n_clusters() {
            return Vec::new();
        }

        let mut ranked: Vec<(&str, f64)> = self
            .features
            .iter()
            .map(String::as_str)
            .zip(self.deviations.column(cluster).iter().copied())
            .collect();
        ranked.sort_by(|a, b| b.1.abs().total_cmp(&a.1.abs()));
        ranked.truncate(n);
        ranked
    }
}

/// Describe each cluster by how its centroid departs from the population mean
///
/// # Arguments
/// * `features` - The matrix the clusters were fitted on
/// * `centroids` - Cluster centroids (n_clusters, n_features)
pub fn describe(features: &FeatureMatrix, centroids: &Array2<f64>) -> Result<ClusterProfile> {
    if features.n_rows() == 0 {
        return Err(PipelineError::precondition("cannot describe clusters of an empty feature matrix"));
    }
    if centroids.ncols() != features.n_features() {
        return Err(PipelineError::precondition(format!(
            "centroids have {} features but the matrix has {}",
            centroids.ncols(),
            features.n_features()
        )));
    }

    let means = features.column_means();
    let deviations = (centroids - &means).reversed_axes();

    Ok(ClusterProfile {
        features: features.columns.clone(),
        population_means: means.to_vec(),
        deviations,
    })
}

/// Mean occurrence of a funnel step within one cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentConversion {
    pub kmeans_cluster: usize,
    pub step: FunnelStep,
    pub funnel_step: String,
    pub conversion_rate: f64,
    pub rows: usize,
}

/// Pivot the clustered funnel into cluster × step mean occurrence
///
/// Records of users without a cluster are left out. Taking a
/// [`SegmentedFunnel`] means this can only run after clustering.
pub fn segment_conversion_table(funnel: &SegmentedFunnel) -> Vec<SegmentConversion> {
    let mut cells: BTreeMap<(usize, FunnelStep), (&str, u64, usize)> = BTreeMap::new();
    for row in funnel.rows() {
        let Some(cluster) = row.kmeans_cluster else {
            continue;
        };
        let cell = cells
            .entry((cluster, row.record.step))
            .or_insert((row.record.funnel_step.as_str(), 0, 0));
        cell.1 += u64::from(row.record.occurred);
        cell.2 += 1;
    }

    cells
        .into_iter()
        .map(|((kmeans_cluster, step), (label, occurred, rows))| SegmentConversion {
            kmeans_cluster,
            step,
            funnel_step: label.to_string(),
            conversion_rate: occurred as f64 / rows as f64,
            rows,
        })
        .collect()
}
