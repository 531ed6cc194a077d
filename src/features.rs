//! Feature engineering: rare-category collapsing and one-hot encoding

use crate::error::{PipelineError, Result};
use crate::profile::{CustomerProfile, ProfileAttribute};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Shared bucket for values below the frequency threshold
pub const OTHER_CATEGORY: &str = "other";

/// Which attributes become features and which get rare values collapsed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSpec {
    /// Attributes to one-hot encode, in column order
    pub encode: Vec<ProfileAttribute>,
    /// Attributes to collapse before encoding
    pub collapse: Vec<ProfileAttribute>,
    /// Values with a row share strictly below this become `"other"`
    pub min_frequency: f64,
}

impl Default for FeatureSpec {
    fn default() -> Self {
        Self {
            encode: vec![
                ProfileAttribute::Week,
                ProfileAttribute::Country,
                ProfileAttribute::Category,
            ],
            collapse: vec![ProfileAttribute::Country],
            min_frequency: 0.05,
        }
    }
}

impl FeatureSpec {
    /// Collapse the configured attributes, then encode
    ///
    /// Returns the collapsed profile alongside the matrix so both share the
    /// same vocabulary.
    pub fn apply(&self, profile: &[CustomerProfile]) -> Result<(Vec<CustomerProfile>, FeatureMatrix)> {
        let mut collapsed = profile.to_vec();
        for &attribute in &self.collapse {
            collapsed = collapse_rare_categories(&collapsed, attribute, self.min_frequency)?;
        }
        let matrix = build_feature_matrix(&collapsed, &self.encode)?;
        Ok((collapsed, matrix))
    }
}

/// One-hot feature matrix, one row per profile row
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    /// Customer of each row
    pub user_ids: Vec<String>,
    /// Feature names, `<attribute>_<value>`
    pub columns: Vec<String>,
    /// Indicator values (n_rows, n_features)
    pub values: Array2<f64>,
}

impl FeatureMatrix {
    pub fn n_rows(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.values.ncols()
    }

    /// Number of distinct feature vectors
    pub fn distinct_rows(&self) -> usize {
        self.values
            .outer_iter()
            .map(|row| row.iter().map(|v| v.to_bits()).collect::<Vec<u64>>())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Population mean of every feature column
    pub fn column_means(&self) -> Array1<f64> {
        self.values
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(self.n_features()))
    }
}

fn check_frequency(min_frequency: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&min_frequency) {
        return Err(PipelineError::invalid_config(format!(
            "min_frequency must be within [0, 1], got {min_frequency}"
        )));
    }
    Ok(())
}

/// Replace infrequent values of a string attribute with `"other"`
///
/// Frequencies are shares of all rows (null rows count in the denominator
/// but are left null). The mapping is derived from this profile alone.
///
/// # Arguments
/// * `profile` - Full profile snapshot
/// * `attribute` - String attribute to collapse
/// * `min_frequency` - Threshold share; values strictly below it are collapsed
pub fn collapse_rare_categories(
    profile: &[CustomerProfile],
    attribute: ProfileAttribute,
    min_frequency: f64,
) -> Result<Vec<CustomerProfile>> {
    check_frequency(min_frequency)?;
    if attribute == ProfileAttribute::Week {
        return Err(PipelineError::invalid_config("cohort week is ordinal and cannot be collapsed"));
    }

    let total = profile.len() as f64;
    let mut counts: HashMap<String, usize> = HashMap::new();
    for row in profile {
        if let Some(value) = row.attribute(attribute) {
            *counts.entry(value.into_owned()).or_default() += 1;
        }
    }

    let rare: HashSet<String> = counts
        .into_iter()
        .filter(|(_, count)| (*count as f64) / total < min_frequency)
        .map(|(value, _)| value)
        .collect();

    let mut collapsed = profile.to_vec();
    for row in &mut collapsed {
        if let Some(slot) = row.text_attribute_mut(attribute) {
            if slot.as_ref().is_some_and(|value| rare.contains(value)) {
                *slot = Some(OTHER_CATEGORY.to_string());
            }
        }
    }

    tracing::debug!(
        attribute = %attribute,
        collapsed_values = rare.len(),
        "collapsed rare categories"
    );
    Ok(collapsed)
}

/// Sort observed values numerically when every one is an integer, lexically otherwise
fn sort_categories(values: BTreeSet<String>) -> Vec<String> {
    let numeric: Option<Vec<(u64, String)>> = values
        .iter()
        .map(|value| value.parse::<u64>().ok().map(|n| (n, value.clone())))
        .collect();

    match numeric {
        Some(mut numbered) => {
            numbered.sort_by_key(|(n, _)| *n);
            numbered.into_iter().map(|(_, value)| value).collect()
        }
        None => values.into_iter().collect(),
    }
}

/// One-hot encode the given attributes into a feature matrix
///
/// Columns follow the attribute order; within an attribute they follow the
/// sorted set of values observed in this profile. A null value encodes as all
/// zeros for that attribute.
pub fn build_feature_matrix(
    profile: &[CustomerProfile],
    attributes: &[ProfileAttribute],
) -> Result<FeatureMatrix> {
    if attributes.is_empty() {
        return Err(PipelineError::invalid_config("at least one categorical attribute is required"));
    }
    let unique: HashSet<_> = attributes.iter().collect();
    if unique.len() != attributes.len() {
        return Err(PipelineError::invalid_config("categorical attributes must not repeat"));
    }
    if attributes.contains(&ProfileAttribute::Week) && profile.iter().any(|row| row.week.is_none()) {
        return Err(PipelineError::precondition(
            "week feature requested before time cohorts were derived",
        ));
    }

    // Column index per (attribute position, value)
    let mut columns = Vec::new();
    let mut index: Vec<HashMap<String, usize>> = Vec::with_capacity(attributes.len());
    for attribute in attributes {
        let observed: BTreeSet<String> = profile
            .iter()
            .filter_map(|row| row.attribute(*attribute).map(|v| v.into_owned()))
            .collect();
        let values = sort_categories(observed);

        let mut lookup = HashMap::with_capacity(values.len());
        for value in values {
            lookup.insert(value.clone(), columns.len());
            columns.push(format!("{}_{}", attribute.name(), value));
        }
        index.push(lookup);
    }

    let mut values = Array2::<f64>::zeros((profile.len(), columns.len()));
    for (i, row) in profile.iter().enumerate() {
        for (attribute, lookup) in attributes.iter().zip(&index) {
            if let Some(value) = row.attribute(*attribute) {
                if let Some(&j) = lookup.get(&*value) {
                    values[[i, j]] = 1.0;
                }
            }
        }
    }

    tracing::debug!(rows = profile.len(), features = columns.len(), "built feature matrix");
    Ok(FeatureMatrix {
        user_ids: profile.iter().map(|row| row.user_id.clone()).collect(),
        columns,
        values,
    })
}
