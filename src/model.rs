//! Pre-trained regression model artifacts and the feature columns they expect.
//!
//! Two artifact kinds are understood, both serialized as JSON with a `kind`
//! tag:
//! - `linear`: intercept plus one coefficient per feature column
//! - `tree_ensemble`: gradient-boosted regression trees whose leaf outputs are
//!   summed on top of a base score, with `value <= threshold` taking the left
//!   branch

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::features::{FeatureRow, FeatureSchema};

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to read {path}: {message}")]
    Io { path: String, message: String },
    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },
    #[error("feature column list is empty")]
    EmptyFeatureColumns,
    #[error("feature column '{0}' appears more than once")]
    DuplicateFeatureColumn(String),
    #[error("feature column '{0}' cannot be derived from the AQI series")]
    UnknownFeature(String),
    #[error("missing input value for feature '{0}'")]
    MissingInput(String),
    #[error("input value for feature '{name}' is not finite: {value}")]
    NonFiniteInput { name: String, value: f64 },
    #[error("feature vector has {found} values, model expects {expected}")]
    FeatureCountMismatch { found: usize, expected: usize },
    #[error("model returned {found} predictions for {expected} rows")]
    PredictionCountMismatch { found: usize, expected: usize },
    #[error("model produced a non-finite prediction: {0}")]
    NonFinitePrediction(f64),
    #[error("malformed tree {tree}: {message}")]
    MalformedTree { tree: usize, message: String },
}

/// A fitted regressor mapping a feature matrix to one scalar per row.
pub trait RegressionModel: Send + Sync {
    fn predict(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>, ModelError>;
}

/// Runs the model on a single feature vector.
pub fn predict_one(model: &dyn RegressionModel, features: Vec<f64>) -> Result<f64, ModelError> {
    let predictions = model.predict(&[features])?;
    if predictions.len() != 1 {
        return Err(ModelError::PredictionCountMismatch {
            found: predictions.len(),
            expected: 1,
        });
    }
    let value = predictions[0];
    if !value.is_finite() {
        return Err(ModelError::NonFinitePrediction(value));
    }
    Ok(value)
}

/// Ordered feature names the model was fitted on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureColumns {
    names: Vec<String>,
}

impl FeatureColumns {
    pub fn new(names: Vec<String>) -> Result<Self, ModelError> {
        if names.is_empty() {
            return Err(ModelError::EmptyFeatureColumns);
        }
        let mut seen = std::collections::HashSet::new();
        for name in &names {
            if !seen.insert(name.as_str()) {
                return Err(ModelError::DuplicateFeatureColumn(name.clone()));
            }
        }
        Ok(Self { names })
    }

    pub fn from_schema(schema: &FeatureSchema) -> Result<Self, ModelError> {
        Self::new(schema.columns.clone())
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let raw = read_to_string(path)?;
        let names: Vec<String> = serde_json::from_str(&raw).map_err(|err| ModelError::Parse {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        Self::new(names)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Fails on the first column the feature builder does not produce.
    pub fn ensure_derivable(&self, schema: &FeatureSchema) -> Result<(), ModelError> {
        for name in &self.names {
            if !schema.columns.iter().any(|column| column == name) {
                return Err(ModelError::UnknownFeature(name.clone()));
            }
        }
        Ok(())
    }

    pub fn vector_for_row(&self, row: &FeatureRow) -> Result<Vec<f64>, ModelError> {
        self.names
            .iter()
            .map(|name| {
                row.value(name)
                    .ok_or_else(|| ModelError::UnknownFeature(name.clone()))
            })
            .collect()
    }

    pub fn vector_from_inputs(&self, inputs: &BTreeMap<String, f64>) -> Result<Vec<f64>, ModelError> {
        self.names
            .iter()
            .map(|name| {
                let value = *inputs
                    .get(name)
                    .ok_or_else(|| ModelError::MissingInput(name.clone()))?;
                if !value.is_finite() {
                    return Err(ModelError::NonFiniteInput {
                        name: name.clone(),
                        value,
                    });
                }
                Ok(value)
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub intercept: f64,
    pub coefficients: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TreeNode {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
        #[serde(default = "default_true")]
        default_left: bool,
    },
    Leaf {
        value: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    /// Node 0 is the root.
    pub nodes: Vec<TreeNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeEnsemble {
    #[serde(default)]
    pub base_score: f64,
    pub num_features: usize,
    pub trees: Vec<RegressionTree>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelArtifact {
    Linear(LinearModel),
    TreeEnsemble(TreeEnsemble),
}

impl ModelArtifact {
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let raw = read_to_string(path)?;
        let artifact: Self = serde_json::from_str(&raw).map_err(|err| ModelError::Parse {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        artifact.validate()?;

        info!(
            component = "model",
            event = "model.load.finish",
            path = %path.display(),
            kind = artifact.kind(),
            num_features = artifact.num_features()
        );

        Ok(artifact)
    }

    /// Blend of recent rolling means and the day-ago lag, used when no fitted
    /// artifact is available.
    pub fn persistence_blend(columns: &FeatureColumns) -> Self {
        let coefficients = columns
            .names()
            .iter()
            .map(|name| match name.as_str() {
                "roll_3" => 0.5,
                "roll_24" => 0.3,
                "lag_24" => 0.2,
                _ => 0.0,
            })
            .collect();
        Self::Linear(LinearModel {
            intercept: 0.0,
            coefficients,
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Linear(_) => "linear",
            Self::TreeEnsemble(_) => "tree_ensemble",
        }
    }

    pub fn num_features(&self) -> usize {
        match self {
            Self::Linear(model) => model.coefficients.len(),
            Self::TreeEnsemble(model) => model.num_features,
        }
    }

    /// Checks that the artifact agrees with the companion feature list.
    pub fn ensure_matches(&self, columns: &FeatureColumns) -> Result<(), ModelError> {
        if self.num_features() != columns.len() {
            return Err(ModelError::FeatureCountMismatch {
                found: columns.len(),
                expected: self.num_features(),
            });
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ModelError> {
        let Self::TreeEnsemble(ensemble) = self else {
            return Ok(());
        };
        for (tree_idx, tree) in ensemble.trees.iter().enumerate() {
            if tree.nodes.is_empty() {
                return Err(ModelError::MalformedTree {
                    tree: tree_idx,
                    message: "tree has no nodes".to_string(),
                });
            }
            for node in &tree.nodes {
                if let TreeNode::Split {
                    feature,
                    left,
                    right,
                    ..
                } = node
                {
                    if *feature >= ensemble.num_features {
                        return Err(ModelError::MalformedTree {
                            tree: tree_idx,
                            message: format!(
                                "split feature {feature} out of range ({} features)",
                                ensemble.num_features
                            ),
                        });
                    }
                    if *left >= tree.nodes.len() || *right >= tree.nodes.len() {
                        return Err(ModelError::MalformedTree {
                            tree: tree_idx,
                            message: format!("child index out of range ({left}, {right})"),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

impl RegressionModel for ModelArtifact {
    fn predict(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>, ModelError> {
        let expected = self.num_features();
        rows.iter()
            .map(|row| {
                if row.len() != expected {
                    return Err(ModelError::FeatureCountMismatch {
                        found: row.len(),
                        expected,
                    });
                }
                match self {
                    Self::Linear(model) => Ok(model.intercept
                        + model
                            .coefficients
                            .iter()
                            .zip(row)
                            .map(|(c, x)| c * x)
                            .sum::<f64>()),
                    Self::TreeEnsemble(model) => {
                        let mut total = model.base_score;
                        for (idx, tree) in model.trees.iter().enumerate() {
                            total += evaluate_tree(idx, tree, row)?;
                        }
                        Ok(total)
                    }
                }
            })
            .collect()
    }
}

fn evaluate_tree(tree_idx: usize, tree: &RegressionTree, row: &[f64]) -> Result<f64, ModelError> {
    let mut cursor = 0usize;
    // A well-formed tree reaches a leaf in fewer steps than it has nodes.
    for _ in 0..tree.nodes.len() {
        match tree.nodes.get(cursor) {
            Some(TreeNode::Leaf { value }) => return Ok(*value),
            Some(TreeNode::Split {
                feature,
                threshold,
                left,
                right,
                default_left,
            }) => {
                let x = row.get(*feature).copied().ok_or_else(|| ModelError::MalformedTree {
                    tree: tree_idx,
                    message: format!(
                        "split feature {feature} out of range ({} values)",
                        row.len()
                    ),
                })?;
                let go_left = if x.is_nan() {
                    *default_left
                } else {
                    x <= *threshold
                };
                cursor = if go_left { *left } else { *right };
            }
            None => break,
        }
    }
    Err(ModelError::MalformedTree {
        tree: tree_idx,
        message: "no leaf reached".to_string(),
    })
}

fn read_to_string(path: &Path) -> Result<String, ModelError> {
    fs::read_to_string(path).map_err(|err| ModelError::Io {
        path: path.display().to_string(),
        message: err.to_string(),
    })
}

fn default_true() -> bool {
    true
}
