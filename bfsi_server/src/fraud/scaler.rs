use anyhow::{Context, Result};
use ndarray::Array1;
use serde::Deserialize;
use std::path::Path;

use super::ScoreError;

/// On-disk form of a fitted standard scaler (`mean_` and `scale_` arrays).
#[derive(Debug, Deserialize)]
struct ScalerFile {
    mean: Vec<f64>,
    scale: Vec<f64>,
}

/// Standardizes features as `(x - mean) / scale`.
#[derive(Debug, Clone)]
pub struct StandardScaler {
    mean: Array1<f64>,
    scale: Array1<f64>,
}

impl StandardScaler {
    pub fn new(mean: Vec<f64>, scale: Vec<f64>) -> Result<Self> {
        if mean.is_empty() {
            anyhow::bail!("scaler has no features");
        }
        if mean.len() != scale.len() {
            anyhow::bail!(
                "scaler mean has {} entries but scale has {}",
                mean.len(),
                scale.len()
            );
        }

        // Constant features are fitted with a zero scale; leave them unscaled.
        let scale = scale
            .into_iter()
            .map(|s| if s == 0.0 || !s.is_finite() { 1.0 } else { s })
            .collect::<Vec<_>>();

        Ok(Self {
            mean: Array1::from(mean),
            scale: Array1::from(scale),
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scaler from {}", path.display()))?;
        let file: ScalerFile = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse scaler {}", path.display()))?;
        Self::new(file.mean, file.scale)
    }

    pub fn n_features(&self) -> usize {
        self.mean.len()
    }

    pub fn transform(&self, features: &[f64]) -> Result<Vec<f32>, ScoreError> {
        if features.len() != self.n_features() {
            return Err(ScoreError::Dimension {
                expected: self.n_features(),
                got: features.len(),
            });
        }

        let x = Array1::from(features.to_vec());
        let scaled = (&x - &self.mean) / &self.scale;

        Ok(scaled.iter().map(|&v| v as f32).collect())
    }
}
