//! K-Means clustering of the feature matrix and merging assignments back

use crate::error::{PipelineError, Result};
use crate::features::FeatureMatrix;
use crate::funnel::LongFunnelRecord;
use crate::profile::CustomerProfile;
use linfa::prelude::*;
use linfa_clustering::KMeans;
use linfa_nn::distance::L2Dist;
use ndarray::{Array1, Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// K-Means parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusterParams {
    /// Number of clusters
    pub n_clusters: usize,
    /// Maximum Lloyd iterations
    pub max_iters: u64,
    /// Convergence tolerance on centroid movement
    pub tolerance: f64,
    /// Seed of the initialization RNG; fixed so runs are reproducible
    pub seed: u64,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            n_clusters: 4,
            max_iters: 300,
            tolerance: 1e-4,
            seed: 42,
        }
    }
}

/// Cluster id of every feature row, in feature-matrix row order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterAssignment {
    pub user_ids: Vec<String>,
    pub clusters: Vec<usize>,
}

impl ClusterAssignment {
    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.user_ids
            .iter()
            .map(String::as_str)
            .zip(self.clusters.iter().copied())
    }

    /// Cluster per user; when a user has several rows the first one wins
    pub fn by_user(&self) -> HashMap<&str, usize> {
        let mut map = HashMap::with_capacity(self.len());
        for (user_id, cluster) in self.iter() {
            map.entry(user_id).or_insert(cluster);
        }
        map
    }
}

/// Fitted K-Means model
#[derive(Debug, Clone)]
pub struct ClusterModel {
    /// Number of clusters
    pub n_clusters: usize,
    /// Cluster assignments for training data
    pub assignment: ClusterAssignment,
    /// Mean feature vector of each cluster's members (n_clusters, n_features)
    pub centroids: Array2<f64>,
    /// Within-cluster sum of squares (inertia)
    pub inertia: f64,
}

impl ClusterModel {
    /// Assign a feature vector to its nearest centroid
    pub fn predict(&self, features: ArrayView1<f64>) -> Result<usize> {
        if features.len() != self.centroids.ncols() {
            return Err(PipelineError::invalid_value(
                "features",
                format!(
                    "vector of length {}, expected {}",
                    features.len(),
                    self.centroids.ncols()
                ),
            ));
        }

        let mut min_distance = f64::INFINITY;
        let mut closest_cluster = 0;
        for (cluster_idx, centroid) in self.centroids.outer_iter().enumerate() {
            let distance = squared_distance(&features, &centroid);
            if distance < min_distance {
                min_distance = distance;
                closest_cluster = cluster_idx;
            }
        }

        Ok(closest_cluster)
    }

    /// Get cluster sizes
    pub fn cluster_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.n_clusters];
        for &label in &self.assignment.clusters {
            sizes[label] += 1;
        }
        sizes
    }

    /// Mean silhouette coefficient over the first `sample_size` rows
    pub fn silhouette_sample(&self, features: &FeatureMatrix, sample_size: usize) -> f64 {
        let n_samples = features.n_rows().min(sample_size);
        if n_samples < 2 {
            return 0.0;
        }

        let labels = &self.assignment.clusters;
        let mut silhouette_sum = 0.0;

        for i in 0..n_samples {
            let point = features.values.row(i);
            let cluster_label = labels[i];

            let mut same_cluster_distances = Vec::new();
            let mut other_cluster_distances: Vec<Vec<f64>> = vec![Vec::new(); self.n_clusters];

            for j in 0..n_samples {
                if i == j {
                    continue;
                }

                let distance = squared_distance(&point, &features.values.row(j)).sqrt();
                if labels[j] == cluster_label {
                    same_cluster_distances.push(distance);
                } else {
                    other_cluster_distances[labels[j]].push(distance);
                }
            }

            let a_i = if same_cluster_distances.is_empty() {
                0.0
            } else {
                same_cluster_distances.iter().sum::<f64>() / same_cluster_distances.len() as f64
            };

            let b_i = other_cluster_distances
                .iter()
                .filter(|distances| !distances.is_empty())
                .map(|distances| distances.iter().sum::<f64>() / distances.len() as f64)
                .fold(f64::INFINITY, f64::min);

            let silhouette_i = if b_i.is_infinite() || (a_i == 0.0 && b_i == 0.0) {
                0.0
            } else {
                (b_i - a_i) / a_i.max(b_i)
            };

            silhouette_sum += silhouette_i;
        }

        silhouette_sum / n_samples as f64
    }
}

/// Fit K-Means on the feature matrix
///
/// # Arguments
/// * `features` - One-hot feature matrix
/// * `params` - Cluster count, iteration cap, tolerance and seed
///
/// # Returns
/// * Fitted `ClusterModel` whose centroids are the means of their members
pub fn fit_kmeans(features: &FeatureMatrix, params: &ClusterParams) -> Result<ClusterModel> {
    if params.n_clusters == 0 {
        return Err(PipelineError::invalid_config("number of clusters must be at least 1"));
    }

    let available = features.distinct_rows();
    if params.n_clusters > available {
        return Err(PipelineError::InsufficientData {
            requested: params.n_clusters,
            available,
        });
    }

    // Dummy targets for unsupervised learning
    let targets: Array1<usize> = Array1::zeros(features.n_rows());
    let dataset = Dataset::new(features.values.clone(), targets);

    let rng = StdRng::seed_from_u64(params.seed);
    let model = KMeans::params_with(params.n_clusters, rng, L2Dist)
        .max_n_iterations(params.max_iters)
        .tolerance(params.tolerance)
        .fit(&dataset)
        .map_err(|e| PipelineError::Clustering(e.to_string()))?;

    let labels: Array1<usize> = model.predict(&features.values);
    let centroids = member_centroids(&features.values, &labels, model.centroids());
    let inertia = compute_inertia(&features.values, &labels, &centroids);

    tracing::info!(
        clusters = params.n_clusters,
        rows = features.n_rows(),
        inertia,
        "fitted k-means"
    );

    Ok(ClusterModel {
        n_clusters: params.n_clusters,
        assignment: ClusterAssignment {
            user_ids: features.user_ids.clone(),
            clusters: labels.to_vec(),
        },
        centroids,
        inertia,
    })
}

/// Mean of the rows assigned to each cluster; empty clusters keep the engine's centroid
fn member_centroids(features: &Array2<f64>, labels: &Array1<usize>, fallback: &Array2<f64>) -> Array2<f64> {
    let mut centroids = Array2::<f64>::zeros(fallback.raw_dim());
    let mut counts = vec![0usize; fallback.nrows()];

    for (row, &label) in features.outer_iter().zip(labels.iter()) {
        centroids
            .row_mut(label)
            .zip_mut_with(&row, |sum, &value| *sum += value);
        counts[label] += 1;
    }

    for (cluster, &count) in counts.iter().enumerate() {
        if count == 0 {
            centroids.row_mut(cluster).assign(&fallback.row(cluster));
        } else {
            centroids
                .row_mut(cluster)
                .mapv_inplace(|sum| sum / count as f64);
        }
    }
    centroids
}

/// Compute within-cluster sum of squares (inertia)
fn compute_inertia(features: &Array2<f64>, labels: &Array1<usize>, centroids: &Array2<f64>) -> f64 {
    features
        .outer_iter()
        .zip(labels.iter())
        .map(|(point, &cluster)| squared_distance(&point, &centroids.row(cluster)))
        .sum()
}

fn squared_distance(a: &ArrayView1<f64>, b: &ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
}

/// Profile row with its cluster id
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentedCustomer {
    #[serde(flatten)]
    pub profile: CustomerProfile,
    pub kmeans_cluster: usize,
}

/// Customer profile after clustering; only built by [`merge_into_profile`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentedProfile {
    rows: Vec<SegmentedCustomer>,
}

impl SegmentedProfile {
    pub fn rows(&self) -> &[SegmentedCustomer] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Drop the stale cluster column so the profile can be re-clustered
    pub fn into_profile(self) -> Vec<CustomerProfile> {
        self.rows.into_iter().map(|row| row.profile).collect()
    }
}

/// Long funnel record with the cluster of its user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentedRecord {
    #[serde(flatten)]
    pub record: LongFunnelRecord,
    /// `None` when the user was not part of the clustering input
    pub kmeans_cluster: Option<usize>,
}

/// Long funnel table after clustering; only built by [`merge_into_funnel`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentedFunnel {
    rows: Vec<SegmentedRecord>,
}

impl SegmentedFunnel {
    pub fn rows(&self) -> &[SegmentedRecord] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Attach cluster ids to the profile the feature matrix was built from
///
/// The assignment must line up row for row with `profile`.
pub fn merge_into_profile(
    profile: &[CustomerProfile],
    assignment: &ClusterAssignment,
) -> Result<SegmentedProfile> {
    if profile.len() != assignment.len() {
        return Err(PipelineError::precondition(format!(
            "assignment has {} rows but profile has {}",
            assignment.len(),
            profile.len()
        )));
    }

    let rows = profile
        .iter()
        .zip(assignment.iter())
        .map(|(row, (user_id, cluster))| {
            if row.user_id != user_id {
                return Err(PipelineError::precondition(format!(
                    "assignment row for `{user_id}` does not match profile row for `{}`",
                    row.user_id
                )));
            }
            Ok(SegmentedCustomer {
                profile: row.clone(),
                kmeans_cluster: cluster,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(SegmentedProfile { rows })
}

/// Left join cluster ids onto the long funnel table by `user_id`
pub fn merge_into_funnel(records: &[LongFunnelRecord], assignment: &ClusterAssignment) -> SegmentedFunnel {
    let clusters = assignment.by_user();
    let rows = records
        .iter()
        .map(|record| SegmentedRecord {
            record: record.clone(),
            kmeans_cluster: clusters.get(record.user_id.as_str()).copied(),
        })
        .collect();
    SegmentedFunnel { rows }
}
