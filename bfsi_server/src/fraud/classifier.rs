//! ONNX classifier exported from the trained fraud detector.

use anyhow::{Context, Result};
use ort::memory::Allocator;
use ort::session::{builder::GraphOptimizationLevel, Session, SessionOutputs};
use ort::value::{DowncastableTarget, DynMapValueType, DynSequenceValueType, DynValue, Tensor};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

use super::{FraudScore, ScoreError};

pub struct OnnxClassifier {
    session: Mutex<Session>,
    input_name: String,
    label_output: String,
    /// `None` when the classifier only emits labels.
    probability_output: Option<String>,
}

impl OnnxClassifier {
    pub fn load<P: AsRef<Path>>(path: P, onnx_threads: usize) -> Result<Self> {
        let path = path.as_ref();

        ort::init().commit()?;
        info!(path = %path.display(), threads = onnx_threads, "Loading ONNX classifier");

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(onnx_threads)?
            .commit_from_file(path)
            .with_context(|| format!("Failed to load classifier from {}", path.display()))?;

        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .unwrap_or_else(|| "float_input".to_string());

        let label_output = session
            .outputs
            .iter()
            .find(|o| o.name.contains("label"))
            .map(|o| o.name.clone())
            .ok_or_else(|| anyhow::anyhow!("Classifier exposes no label output"))?;

        let probability_output = session
            .outputs
            .iter()
            .find(|o| o.name.contains("prob"))
            .map(|o| o.name.clone());

        info!(
            input = %input_name,
            label = %label_output,
            probability = ?probability_output,
            "✓ Classifier loaded"
        );

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            label_output,
            probability_output,
        })
    }

    pub fn predict(&self, features: &[f32]) -> Result<FraudScore, ScoreError> {
        let shape = vec![1_i64, features.len() as i64];
        let input_tensor = Tensor::from_array((shape, features.to_vec()))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| ScoreError::Model("classifier session lock poisoned".to_string()))?;

        let outputs = session.run(ort::inputs![self.input_name.as_str() => input_tensor])?;

        let label = self.extract_label(&outputs)?;
        let probability = match &self.probability_output {
            Some(name) => self.extract_probability(&outputs, name)?,
            None => f64::from(label),
        };

        debug!(label, probability, "Scored transaction");

        Ok(FraudScore { label, probability })
    }

    fn extract_label(&self, outputs: &SessionOutputs) -> Result<u8, ScoreError> {
        let output = outputs
            .get(self.label_output.as_str())
            .ok_or_else(|| ScoreError::Model(format!("missing output {}", self.label_output)))?;

        let (_, data) = output.try_extract_tensor::<i64>()?;
        match data.first() {
            Some(0) => Ok(0),
            Some(1) => Ok(1),
            Some(other) => Err(ScoreError::Model(format!(
                "classifier returned non-binary label {}",
                other
            ))),
            None => Err(ScoreError::Model("classifier returned no label".to_string())),
        }
    }

    /// Handles both plain tensor outputs and the seq(map(int64, float)) form
    /// produced when the exporter keeps the class-probability zipmap.
    fn extract_probability(&self, outputs: &SessionOutputs, name: &str) -> Result<f64, ScoreError> {
        let output = outputs
            .get(name)
            .ok_or_else(|| ScoreError::Model(format!("missing output {}", name)))?;

        let dtype = output.dtype();

        let probability = if let Ok((shape, data)) = output.try_extract_tensor::<f32>() {
            let dims: Vec<i64> = shape.iter().copied().collect();
            positive_class_probability(&dims, data)
        } else if DynSequenceValueType::can_downcast(&dtype) {
            Some(extract_from_sequence_map(output)?)
        } else {
            None
        };

        let probability = probability
            .ok_or_else(|| ScoreError::Model(format!("unsupported probability output {}", name)))?;

        if probability.is_nan() {
            return Err(ScoreError::Model("classifier returned NaN probability".to_string()));
        }

        Ok(probability.clamp(0.0, 1.0))
    }
}

fn extract_from_sequence_map(output: &DynValue) -> Result<f64, ScoreError> {
    let allocator = Allocator::default();

    let sequence = output
        .downcast_ref::<DynSequenceValueType>()
        .map_err(|e| ScoreError::Model(format!("Failed to downcast to sequence: {}", e)))?;

    let maps = sequence.try_extract_sequence::<DynMapValueType>(&allocator)?;
    let map_value = maps
        .first()
        .ok_or_else(|| ScoreError::Model("Empty probability sequence".to_string()))?;

    let kv_pairs = map_value.try_extract_key_values::<i64, f32>()?;

    if let Some((_, prob)) = kv_pairs.iter().find(|(class_id, _)| *class_id == 1) {
        return Ok(f64::from(*prob));
    }
    if let Some((_, prob)) = kv_pairs.iter().find(|(class_id, _)| *class_id == 0) {
        return Ok(1.0 - f64::from(*prob));
    }

    Err(ScoreError::Model("No probability found in map".to_string()))
}

/// Pick the positive-class probability out of a `[batch, classes]`,
/// `[classes]` or `[batch, 1]` tensor for the first sample.
pub(crate) fn positive_class_probability(dims: &[i64], data: &[f32]) -> Option<f64> {
    let classes = match dims {
        [_, classes] | [classes] => *classes as usize,
        _ => return None,
    };

    match classes {
        0 => None,
        1 => data.first().map(|&p| f64::from(p)),
        _ => data.get(1).map(|&p| f64::from(p)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    /// Two-input softmax classifiers written by `testdata/make_classifiers.py`.
    fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata").join(name)
    }

    // sigmoid(3)
    const CONFIDENT: f64 = 0.952_574_126_822_433_4;

    #[test]
    fn test_zipmap_classifier() {
        let classifier = OnnxClassifier::load(fixture("zipmap_classifier.onnx"), 1).unwrap();
        assert_eq!(classifier.label_output, "output_label");
        assert_eq!(classifier.probability_output.as_deref(), Some("output_probability"));

        let fraud = classifier.predict(&[-1.0, 2.0]).unwrap();
        assert_eq!(fraud.label, 1);
        assert!((fraud.probability - CONFIDENT).abs() < 1e-5);

        let legit = classifier.predict(&[2.0, -1.0]).unwrap();
        assert_eq!(legit.label, 0);
        assert!((legit.probability - (1.0 - CONFIDENT)).abs() < 1e-5);
    }

    #[test]
    fn test_tensor_classifier() {
        let classifier = OnnxClassifier::load(fixture("tensor_classifier.onnx"), 1).unwrap();
        assert_eq!(classifier.probability_output.as_deref(), Some("probabilities"));

        let score = classifier.predict(&[-1.0, 2.0]).unwrap();
        assert_eq!(score.label, 1);
        assert!((score.probability - CONFIDENT).abs() < 1e-5);
    }

    #[test]
    fn test_label_only_classifier() {
        let classifier = OnnxClassifier::load(fixture("label_classifier.onnx"), 1).unwrap();
        assert!(classifier.probability_output.is_none());

        assert_eq!(classifier.predict(&[-1.0, 2.0]).unwrap().probability, 1.0);
        assert_eq!(classifier.predict(&[2.0, -1.0]).unwrap().probability, 0.0);
    }

    #[test]
    fn test_wrong_input_width_is_model_error() {
        let classifier = OnnxClassifier::load(fixture("tensor_classifier.onnx"), 1).unwrap();
        let err = classifier.predict(&[1.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(err, ScoreError::Model(_)));
    }

    #[test]
    fn test_missing_model_file() {
        assert!(OnnxClassifier::load(fixture("absent.onnx"), 1).is_err());
    }

    #[test]
    fn test_two_class_tensor() {
        let p = positive_class_probability(&[1, 2], &[0.2, 0.8]).unwrap();
        assert!((p - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_single_column_tensor() {
        let p = positive_class_probability(&[1, 1], &[0.35]).unwrap();
        assert!((p - 0.35).abs() < 1e-6);
    }

    #[test]
    fn test_flat_tensor() {
        let p = positive_class_probability(&[2], &[0.9, 0.1]).unwrap();
        assert!((p - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_unsupported_shapes() {
        assert!(positive_class_probability(&[1, 2, 2], &[0.1; 4]).is_none());
        assert!(positive_class_probability(&[1, 0], &[]).is_none());
        assert!(positive_class_probability(&[1, 2], &[0.5]).is_none());
    }
}
