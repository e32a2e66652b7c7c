//! Fraud scoring: a fitted standard scaler in front of an ONNX classifier.

pub mod classifier;
pub mod scaler;

use anyhow::Result;
use common::{config::FraudConfig, FraudRequest};
use std::time::Instant;
use tracing::info;

use classifier::OnnxClassifier;
use scaler::StandardScaler;

/// Outcome of scoring one transaction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FraudScore {
    /// Label reported by the classifier itself (0 or 1).
    pub label: u8,
    /// Positive-class probability in [0, 1].
    pub probability: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum ScoreError {
    #[error("Expected {expected} features, got {got}.")]
    Dimension { expected: usize, got: usize },
    #[error("{0}")]
    Model(String),
}

impl From<ort::Error> for ScoreError {
    fn from(err: ort::Error) -> Self {
        ScoreError::Model(format!("ORT error: {}", err))
    }
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum FeatureInputError {
    #[error("Server requires a feature ordering for dict input. Send feature_vector or configure fraud.feature_order.")]
    NoOrdering,
    #[error("Bad features dict or missing keys: {0}")]
    MissingKey(String),
    #[error("No input provided. Send feature_vector or features dict.")]
    NoInput,
}

/// Anything that can turn a raw feature vector into a fraud score.
pub trait FraudScorer: Send + Sync {
    fn n_features(&self) -> usize;

    fn scale_and_score(&self, features: &[f64]) -> Result<FraudScore, ScoreError>;
}

/// Turn a request into the raw vector the scaler expects.
///
/// `feature_vector` wins when both representations are present.
pub fn resolve_feature_vector(
    request: &FraudRequest,
    order: Option<&[String]>,
) -> Result<Vec<f64>, FeatureInputError> {
    if let Some(vector) = &request.feature_vector {
        return Ok(vector.clone());
    }

    let features = request.features.as_ref().ok_or(FeatureInputError::NoInput)?;
    let order = order.ok_or(FeatureInputError::NoOrdering)?;

    order
        .iter()
        .map(|name| {
            features
                .get(name)
                .copied()
                .ok_or_else(|| FeatureInputError::MissingKey(name.clone()))
        })
        .collect()
}

pub struct FraudModel {
    scaler: StandardScaler,
    classifier: OnnxClassifier,
}

impl FraudModel {
    pub fn load(config: &FraudConfig) -> Result<Self> {
        let start = Instant::now();

        let scaler = StandardScaler::load(&config.scaler_path)?;
        info!(
            path = %config.scaler_path,
            n_features = scaler.n_features(),
            "✓ Scaler loaded"
        );

        let classifier = OnnxClassifier::load(&config.classifier_path, config.onnx_threads)?;

        if let Some(order) = &config.feature_order {
            if order.len() != scaler.n_features() {
                anyhow::bail!(
                    "feature_order has {} names but the scaler expects {} features",
                    order.len(),
                    scaler.n_features()
                );
            }
        }

        info!(
            "✓ Fraud model ready in {:.2}ms",
            start.elapsed().as_secs_f64() * 1000.0
        );

        Ok(Self { scaler, classifier })
    }
}

impl FraudScorer for FraudModel {
    fn n_features(&self) -> usize {
        self.scaler.n_features()
    }

    fn scale_and_score(&self, features: &[f64]) -> Result<FraudScore, ScoreError> {
        let scaled = self.scaler.transform(features)?;
        self.classifier.predict(&scaled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn order() -> Vec<String> {
        vec!["amount".to_string(), "velocity".to_string()]
    }

    #[test]
    fn test_vector_wins_over_features() {
        let request = FraudRequest {
            features: Some(HashMap::from([("amount".to_string(), 9.0)])),
            feature_vector: Some(vec![1.0, 2.0]),
        };
        let vector = resolve_feature_vector(&request, None).unwrap();
        assert_eq!(vector, vec![1.0, 2.0]);
    }

    #[test]
    fn test_features_follow_configured_order() {
        let request = FraudRequest {
            features: Some(HashMap::from([
                ("velocity".to_string(), 3.0),
                ("amount".to_string(), 1250.0),
            ])),
            feature_vector: None,
        };
        let order = order();
        let vector = resolve_feature_vector(&request, Some(&order)).unwrap();
        assert_eq!(vector, vec![1250.0, 3.0]);
    }

    #[test]
    fn test_features_without_order() {
        let request = FraudRequest {
            features: Some(HashMap::from([("amount".to_string(), 1.0)])),
            feature_vector: None,
        };
        assert_eq!(
            resolve_feature_vector(&request, None),
            Err(FeatureInputError::NoOrdering)
        );
    }

    #[test]
    fn test_missing_key() {
        let request = FraudRequest {
            features: Some(HashMap::from([("amount".to_string(), 1.0)])),
            feature_vector: None,
        };
        let order = order();
        let err = resolve_feature_vector(&request, Some(&order)).unwrap_err();
        assert_eq!(err, FeatureInputError::MissingKey("velocity".to_string()));
        assert!(err.to_string().contains("velocity"));
    }

    #[test]
    fn test_no_input() {
        let err = resolve_feature_vector(&FraudRequest::default(), None).unwrap_err();
        assert!(err.to_string().starts_with("No input provided"));
    }
}
