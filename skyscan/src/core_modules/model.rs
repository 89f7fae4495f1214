// THEORY:
// A `Model` turns image chips into ranked label predictions. The engine never
// looks inside: it asks for the model's metadata (input size, labels, colour
// mode), feeds it batches of chips that are exactly `model_size`, and receives,
// per chip, the labels whose confidence clears the threshold in descending order.
//
// Models ship as a JSON package (`ModelPackage`): the metadata block plus the
// backend parameters. The bundled backend is `LinearModel`, a softmax over linear
// scores of six colour statistics per chip (mean and standard deviation of each
// channel). It is small enough to train offline with any tool and good enough to
// separate land cover classes such as water, vegetation and built-up areas.

use crate::core_modules::geometry::PixelRect;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::debug;

/// Number of colour statistics a `LinearModel` scores.
pub const LINEAR_FEATURES: usize = 6;
const DEFAULT_BATCH_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorMode {
    #[default]
    Rgb,
    Grayscale,
}

impl fmt::Display for ColorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColorMode::Rgb => f.write_str("rgb"),
            ColorMode::Grayscale => f.write_str("grayscale"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    pub labels: Vec<String>,
    /// (width, height) of the chips the model consumes.
    pub model_size: (u32, u32),
    #[serde(default)]
    pub color_mode: ColorMode,
    /// Area the model was trained for, as `[west, south, east, north]`.
    #[serde(default)]
    pub bounding_box: Option<[f64; 4]>,
    #[serde(default)]
    pub time_created: Option<DateTime<Utc>>,
}

/// Linear weights for one label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelWeights {
    #[serde(default)]
    pub bias: f32,
    pub coefficients: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPackage {
    pub metadata: ModelMetadata,
    #[serde(default)]
    pub batch_size: Option<usize>,
    /// (x, y) step used when no window step is requested.
    #[serde(default)]
    pub default_step: Option<(u32, u32)>,
    pub weights: BTreeMap<String, LabelWeights>,
}

impl ModelPackage {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Model(format!("cannot read model {}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let package: ModelPackage = serde_json::from_str(text)?;
        package.validate()?;
        Ok(package)
    }

    fn validate(&self) -> Result<()> {
        let (w, h) = self.metadata.model_size;
        if w == 0 || h == 0 {
            return Err(Error::Model("model size must be non-zero".to_string()));
        }
        if self.metadata.labels.is_empty() {
            return Err(Error::Model("model has no labels".to_string()));
        }
        for label in &self.metadata.labels {
            let weights = self
                .weights
                .get(label)
                .ok_or_else(|| Error::Model(format!("no weights for label {label}")))?;
            if weights.coefficients.len() != LINEAR_FEATURES {
                return Err(Error::Model(format!(
                    "label {label} has {} coefficients, expected {LINEAR_FEATURES}",
                    weights.coefficients.len()
                )));
            }
        }
        if self.batch_size == Some(0) {
            return Err(Error::Model("batch size must be non-zero".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub label: String,
    pub confidence: f32,
}

impl Prediction {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence,
        }
    }
}

/// A window and what the model saw in it, best prediction first.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionBox {
    pub window: PixelRect,
    pub predictions: Vec<Prediction>,
}

impl PredictionBox {
    pub fn new(window: PixelRect, predictions: Vec<Prediction>) -> Self {
        Self { window, predictions }
    }

    pub fn top(&self) -> Option<&Prediction> {
        self.predictions.first()
    }

    pub fn top_confidence(&self) -> f32 {
        self.top().map_or(0.0, |p| p.confidence)
    }
}

pub trait Model: Send + Sync {
    fn metadata(&self) -> &ModelMetadata;
    fn batch_size(&self) -> usize;

    /// Step used when none is requested: a fifth of the model size, at least one pixel.
    fn default_step(&self) -> (u32, u32) {
        let (w, h) = self.metadata().model_size;
        ((w / 5).max(1), (h / 5).max(1))
    }

    fn confidence(&self) -> f32;
    /// Predictions below `confidence` (0..=1) are dropped.
    fn set_confidence(&mut self, confidence: f32);

    /// Classifies `chips`, each exactly `model_size`. Returns one prediction list per chip.
    fn classify(&self, chips: &[RgbImage]) -> Result<Vec<Vec<Prediction>>>;
}

pub struct LinearModel {
    metadata: ModelMetadata,
    batch_size: usize,
    default_step: Option<(u32, u32)>,
    /// Weights in label order.
    weights: Vec<LabelWeights>,
    confidence: f32,
}

impl LinearModel {
    pub fn new(package: ModelPackage) -> Result<Self> {
        package.validate()?;
        let ModelPackage {
            metadata,
            batch_size,
            default_step,
            mut weights,
        } = package;
        let weights = metadata
            .labels
            .iter()
            .map(|label| {
                weights
                    .remove(label)
                    .ok_or_else(|| Error::Model(format!("no weights for label {label}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            metadata,
            batch_size: batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
            default_step,
            weights,
            confidence: 0.0,
        })
    }

    /// Mean and standard deviation per channel, scaled to 0..1.
    pub fn features(&self, chip: &RgbImage) -> [f32; LINEAR_FEATURES] {
        let n = (chip.width() as f64 * chip.height() as f64).max(1.0);
        let mut sum = [0f64; 3];
        let mut sum_sq = [0f64; 3];
        for pixel in chip.pixels() {
            let values = match self.metadata.color_mode {
                ColorMode::Rgb => [pixel[0] as f64, pixel[1] as f64, pixel[2] as f64],
                ColorMode::Grayscale => {
                    let luma = 0.299 * pixel[0] as f64 + 0.587 * pixel[1] as f64 + 0.114 * pixel[2] as f64;
                    [luma; 3]
                }
            };
            for c in 0..3 {
                let v = values[c] / 255.0;
                sum[c] += v;
                sum_sq[c] += v * v;
            }
        }
        let mut features = [0f32; LINEAR_FEATURES];
        for c in 0..3 {
            let mean = sum[c] / n;
            let variance = (sum_sq[c] / n - mean * mean).max(0.0);
            features[c] = mean as f32;
            features[c + 3] = variance.sqrt() as f32;
        }
        features
    }

    fn predict(&self, chip: &RgbImage) -> Vec<Prediction> {
        let features = self.features(chip);
        let scores: Vec<f32> = self
            .weights
            .iter()
            .map(|w| {
                w.bias
                    + w.coefficients
                        .iter()
                        .zip(features.iter())
                        .map(|(c, f)| c * f)
                        .sum::<f32>()
            })
            .collect();
        let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
        let total: f32 = exps.iter().sum();

        let mut predictions: Vec<Prediction> = self
            .metadata
            .labels
            .iter()
            .zip(exps)
            .map(|(label, e)| Prediction::new(label.clone(), e / total))
            .filter(|p| p.confidence >= self.confidence)
            .collect();
        predictions.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        predictions
    }
}

impl Model for LinearModel {
    fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn default_step(&self) -> (u32, u32) {
        let (w, h) = self.metadata.model_size;
        self.default_step
            .unwrap_or(((w / 5).max(1), (h / 5).max(1)))
    }

    fn confidence(&self) -> f32 {
        self.confidence
    }

    fn set_confidence(&mut self, confidence: f32) {
        self.confidence = confidence.clamp(0.0, 1.0);
    }

    fn classify(&self, chips: &[RgbImage]) -> Result<Vec<Vec<Prediction>>> {
        let expected = self.metadata.model_size;
        chips
            .iter()
            .map(|chip| {
                if chip.dimensions() != expected {
                    return Err(Error::Model(format!(
                        "chip is {:?}, model expects {:?}",
                        chip.dimensions(),
                        expected
                    )));
                }
                Ok(self.predict(chip))
            })
            .collect()
    }
}

/// Builds the backend for a package.
pub fn create_model(package: ModelPackage) -> Result<Box<dyn Model>> {
    debug!(model = %package.metadata.name, labels = package.metadata.labels.len(), "creating linear model");
    Ok(Box::new(LinearModel::new(package)?))
}

pub fn load_model(path: impl AsRef<Path>) -> Result<Box<dyn Model>> {
    create_model(ModelPackage::load(path)?)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::Rgb;

    /// Two labels: "water" for dark blue chips and "field" for bright ones.
    pub(crate) fn water_field_json(size: u32) -> String {
        format!(
            r#"{{
                "metadata": {{
                    "name": "water-field",
                    "version": "1.0",
                    "description": "test model",
                    "category": "landcover",
                    "labels": ["water", "field"],
                    "model_size": [{size}, {size}],
                    "color_mode": "rgb",
                    "time_created": "2017-02-01T10:00:00Z"
                }},
                "batch_size": 4,
                "weights": {{
                    "water": {{"bias": 0.0, "coefficients": [-8.0, -8.0, 12.0, 0.0, 0.0, 0.0]}},
                    "field": {{"bias": 0.0, "coefficients": [8.0, 8.0, -4.0, 0.0, 0.0, 0.0]}}
                }}
            }}"#
        )
    }

    fn model() -> LinearModel {
        LinearModel::new(ModelPackage::from_json(&water_field_json(8)).unwrap()).unwrap()
    }

    fn solid(size: u32, color: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(size, size, Rgb(color))
    }

    #[test]
    fn package_parses_metadata() {
        let package = ModelPackage::from_json(&water_field_json(16)).unwrap();
        assert_eq!(package.metadata.model_size, (16, 16));
        assert_eq!(package.metadata.color_mode, ColorMode::Rgb);
        assert!(package.metadata.time_created.is_some());
        assert_eq!(package.batch_size, Some(4));
    }

    #[test]
    fn invalid_packages_are_rejected() {
        let missing = water_field_json(8).replace(r#""field": {"bias""#, r#""other": {"bias""#);
        assert!(ModelPackage::from_json(&missing).is_err());
        let short = water_field_json(8).replace("[8.0, 8.0, -4.0, 0.0, 0.0, 0.0]", "[8.0]");
        assert!(ModelPackage::from_json(&short).is_err());
        assert!(ModelPackage::from_json(&water_field_json(0)).is_err());
    }

    #[test]
    fn features_are_channel_statistics() {
        let m = model();
        let mut chip = solid(2, [255, 0, 0]);
        chip.put_pixel(0, 0, Rgb([0, 0, 0]));
        chip.put_pixel(1, 0, Rgb([0, 0, 0]));
        let f = m.features(&chip);
        assert!((f[0] - 0.5).abs() < 1e-6);
        assert!((f[3] - 0.5).abs() < 1e-6);
        assert_eq!(f[1], 0.0);
    }

    #[test]
    fn classify_ranks_labels() {
        let mut m = model();
        let out = m.classify(&[solid(8, [10, 20, 200]), solid(8, [200, 220, 40])]).unwrap();
        assert_eq!(out[0][0].label, "water");
        assert_eq!(out[1][0].label, "field");
        let sum: f32 = out[0].iter().map(|p| p.confidence).sum();
        assert!((sum - 1.0).abs() < 1e-5);

        m.set_confidence(0.9);
        let out = m.classify(&[solid(8, [10, 20, 200])]).unwrap();
        assert_eq!(out[0].len(), 1);
    }

    #[test]
    fn wrong_chip_size_is_an_error() {
        assert!(model().classify(&[solid(4, [0, 0, 0])]).is_err());
    }

    #[test]
    fn default_step_is_a_fifth_of_the_model() {
        assert_eq!(model().default_step(), (1, 1));
        let big = LinearModel::new(ModelPackage::from_json(&water_field_json(100)).unwrap()).unwrap();
        assert_eq!(big.default_step(), (20, 20));
    }
}
