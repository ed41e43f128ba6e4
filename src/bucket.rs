//! AQI severity buckets and the single-shot predictor.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::model::{predict_one, FeatureColumns, ModelError, RegressionModel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AqiBucket {
    Good,
    Satisfactory,
    Moderate,
    Poor,
    VeryPoor,
    Severe,
}

impl AqiBucket {
    pub const ALL: [AqiBucket; 6] = [
        Self::Good,
        Self::Satisfactory,
        Self::Moderate,
        Self::Poor,
        Self::VeryPoor,
        Self::Severe,
    ];

    /// Upper bounds are inclusive; anything above 400 (or NaN) is severe.
    pub fn from_aqi(value: f64) -> Self {
        if value <= 50.0 {
            Self::Good
        } else if value <= 100.0 {
            Self::Satisfactory
        } else if value <= 200.0 {
            Self::Moderate
        } else if value <= 300.0 {
            Self::Poor
        } else if value <= 400.0 {
            Self::VeryPoor
        } else {
            Self::Severe
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Good => "Good",
            Self::Satisfactory => "Satisfactory",
            Self::Moderate => "Moderate",
            Self::Poor => "Poor",
            Self::VeryPoor => "Very Poor",
            Self::Severe => "Severe",
        }
    }

    pub fn color(self) -> &'static str {
        match self {
            Self::Good => "green",
            Self::Satisfactory => "yellow",
            Self::Moderate => "orange",
            Self::Poor => "red",
            Self::VeryPoor => "purple",
            Self::Severe => "maroon",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SingleShotPrediction {
    pub value: f64,
    pub bucket: AqiBucket,
}

/// Runs the model once on named inputs and buckets the result.
pub fn predict_single(
    model: &dyn RegressionModel,
    columns: &FeatureColumns,
    inputs: &BTreeMap<String, f64>,
) -> Result<SingleShotPrediction, ModelError> {
    let features = columns.vector_from_inputs(inputs)?;
    let value = predict_one(model, features)?;
    let bucket = AqiBucket::from_aqi(value);

    info!(
        component = "predictor",
        event = "predict.single.finish",
        value,
        bucket = bucket.label()
    );

    Ok(SingleShotPrediction { value, bucket })
}
