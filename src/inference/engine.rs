use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use image::DynamicImage;
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::inference::error::InferenceError;
use crate::inference::labels::{Category, ClassLabel, CLASS_COUNT};
use crate::inference::model::{BurnClassifier, Classifier, CpuBackend};
use crate::inference::preprocess;

/// Percentage per class, indexed in declared class order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbabilityDistribution {
    values: [f64; CLASS_COUNT],
}

impl ProbabilityDistribution {
    /// Numerically stable softmax scaled to sum to 100.
    pub fn from_logits(logits: &[f32]) -> Result<Self, InferenceError> {
        if logits.len() != CLASS_COUNT {
            return Err(InferenceError::OutputShape {
                expected: CLASS_COUNT,
                actual: logits.len(),
            });
        }
        if let Some(bad) = logits.iter().find(|v| !v.is_finite()) {
            return Err(InferenceError::Forward(format!("non-finite logit {bad}")));
        }

        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64;
        let mut values = [0.0f64; CLASS_COUNT];
        for (slot, logit) in values.iter_mut().zip(logits) {
            *slot = (*logit as f64 - max).exp();
        }
        let total: f64 = values.iter().sum();
        for v in values.iter_mut() {
            *v = *v / total * 100.0;
        }
        Ok(Self { values })
    }

    pub fn get(&self, label: ClassLabel) -> f64 {
        self.values[label.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClassLabel, f64)> + '_ {
        ClassLabel::ALL.iter().map(move |l| (*l, self.get(*l)))
    }

    pub fn total(&self) -> f64 {
        self.values.iter().sum()
    }

    /// Class with the highest probability; the earliest class wins ties.
    pub fn argmax(&self) -> ClassLabel {
        let mut best = 0;
        for (i, v) in self.values.iter().enumerate().skip(1) {
            if *v > self.values[best] {
                best = i;
            }
        }
        ClassLabel::ALL[best]
    }
}

impl Serialize for ProbabilityDistribution {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(CLASS_COUNT))?;
        for (label, value) in self.iter() {
            map.serialize_entry(label.as_str(), &value)?;
        }
        map.end()
    }
}

/// Outcome of one classification.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionResult {
    pub label: ClassLabel,
    pub category: Category,
    pub distribution: ProbabilityDistribution,
}

impl PredictionResult {
    pub fn from_distribution(distribution: ProbabilityDistribution) -> Self {
        let label = distribution.argmax();
        Self {
            label,
            category: label.category(),
            distribution,
        }
    }
}

/// Preprocessing, forward pass and decision mapping over a shared model.
#[derive(Clone)]
pub struct InferenceEngine {
    model: Arc<dyn Classifier>,
}

impl InferenceEngine {
    pub fn new(model: Arc<dyn Classifier>) -> Self {
        Self { model }
    }

    /// Load the production network from a weights file on the CPU backend.
    pub fn from_weights(path: &Path) -> Result<Self> {
        let classifier = BurnClassifier::<CpuBackend>::load(path, Default::default())?;
        Ok(Self::new(Arc::new(classifier)))
    }

    pub fn classify(&self, bytes: &[u8]) -> Result<PredictionResult, InferenceError> {
        let image = preprocess::decode(bytes)?;
        self.classify_image(image)
    }

    pub fn classify_image(&self, image: DynamicImage) -> Result<PredictionResult, InferenceError> {
        let input = preprocess::to_tensor(&preprocess::to_rgb(image))?;
        let logits = self.model.logits(input)?;
        let distribution = ProbabilityDistribution::from_logits(&logits)?;
        Ok(PredictionResult::from_distribution(distribution))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::network::ResNetConfig;
    use image::{ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
    use ndarray::Array4;
    use std::io::Cursor;

    struct FixedLogits(Vec<f32>);

    impl Classifier for FixedLogits {
        fn logits(&self, _input: Array4<f32>) -> Result<Vec<f32>, InferenceError> {
            Ok(self.0.clone())
        }
    }

    fn png(image: DynamicImage) -> Vec<u8> {
        let mut buf = Vec::new();
        image.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png).unwrap();
        buf
    }

    fn narrow_engine() -> InferenceEngine {
        let device = Default::default();
        let model = ResNetConfig::new().with_base_width(4).init(&device);
        InferenceEngine::new(Arc::new(BurnClassifier::<CpuBackend>::new(model, device)))
    }

    #[test]
    fn softmax_sums_to_one_hundred() {
        let dist = ProbabilityDistribution::from_logits(&[1.0, -2.0, 0.5, 3.0, 0.0, 0.0, -1.0, 2.5]).unwrap();
        assert!((dist.total() - 100.0).abs() < 1e-9);
        assert!(dist.iter().all(|(_, v)| v >= 0.0));
        assert_eq!(dist.argmax(), ClassLabel::ActinicKeratosis);
    }

    #[test]
    fn softmax_survives_large_logits() {
        let dist = ProbabilityDistribution::from_logits(&[1000.0, 999.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]).unwrap();
        assert!((dist.total() - 100.0).abs() < 1e-9);
        assert!(dist.get(ClassLabel::Nevus) > dist.get(ClassLabel::Melanoma));
    }

    #[test]
    fn ties_go_to_the_first_declared_class() {
        let dist = ProbabilityDistribution::from_logits(&[0.0, 5.0, 1.0, 5.0, 0.0, 0.0, 5.0, 0.0]).unwrap();
        assert_eq!(dist.argmax(), ClassLabel::Melanoma);

        let uniform = ProbabilityDistribution::from_logits(&[0.0; CLASS_COUNT]).unwrap();
        assert_eq!(uniform.argmax(), ClassLabel::Nevus);
        assert!((uniform.get(ClassLabel::VascularLesion) - 12.5).abs() < 1e-9);
    }

    #[test]
    fn wrong_logit_count_is_rejected() {
        let err = ProbabilityDistribution::from_logits(&[0.0; 3]).unwrap_err();
        assert!(matches!(err, InferenceError::OutputShape { expected: 8, actual: 3 }));
    }

    #[test]
    fn nan_logits_are_rejected() {
        let mut logits = [0.0f32; CLASS_COUNT];
        logits[2] = f32::NAN;
        assert!(ProbabilityDistribution::from_logits(&logits).is_err());
    }

    #[test]
    fn distribution_serializes_in_class_order() {
        let dist = ProbabilityDistribution::from_logits(&[0.0; CLASS_COUNT]).unwrap();
        let json = serde_json::to_string(&dist).unwrap();
        assert!(json.starts_with("{\"Nevus (Benigno)\":12.5,\"Melanoma (Maligno)\":12.5"));
        let parsed: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.len(), CLASS_COUNT);
    }

    #[test]
    fn prediction_category_follows_label() {
        let engine = InferenceEngine::new(Arc::new(FixedLogits(vec![0.0, 0.0, 0.0, 0.0, 0.0, 9.0, 0.0, 0.0])));
        let bytes = png(DynamicImage::ImageRgb8(RgbImage::from_pixel(32, 32, Rgb([200, 120, 90]))));
        let result = engine.classify(&bytes).unwrap();
        assert_eq!(result.label, ClassLabel::Dermatofibroma);
        assert_eq!(result.category, Category::Benign);
    }

    #[test]
    fn model_with_wrong_head_size_fails() {
        let engine = InferenceEngine::new(Arc::new(FixedLogits(vec![1.0; 5])));
        let bytes = png(DynamicImage::ImageRgb8(RgbImage::new(16, 16)));
        assert!(matches!(
            engine.classify(&bytes),
            Err(InferenceError::OutputShape { .. })
        ));
    }

    #[test]
    fn undecodable_bytes_fail_before_the_model_runs() {
        let engine = InferenceEngine::new(Arc::new(FixedLogits(vec![])));
        let err = engine.classify(b"\x89PNG broken").unwrap_err();
        assert!(matches!(err, InferenceError::Decode(_)));
    }

    #[test]
    fn solid_colour_image_through_resnet() {
        let engine = narrow_engine();
        let bytes = png(DynamicImage::ImageRgb8(RgbImage::from_pixel(224, 224, Rgb([180, 140, 120]))));

        let result = engine.classify(&bytes).unwrap();
        assert!(ClassLabel::ALL.contains(&result.label));
        assert_eq!(result.category, result.label.category());
        assert_eq!(result.distribution.iter().count(), CLASS_COUNT);
        assert!((result.distribution.total() - 100.0).abs() < 0.01);
    }

    #[test]
    fn repeated_classification_is_identical() {
        let engine = narrow_engine();
        let bytes = png(DynamicImage::ImageRgb8(RgbImage::from_fn(100, 80, |x, y| {
            Rgb([x as u8, y as u8, (x + y) as u8])
        })));

        let first = engine.classify(&bytes).unwrap();
        let second = engine.classify(&bytes).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn rgba_input_matches_rgb_input() {
        let engine = narrow_engine();
        let rgb = RgbImage::from_fn(64, 64, |x, y| Rgb([x as u8 * 4, y as u8 * 4, 128]));
        let rgba = RgbaImage::from_fn(64, 64, |x, y| Rgba([x as u8 * 4, y as u8 * 4, 128, 255]));

        let a = engine.classify(&png(DynamicImage::ImageRgb8(rgb))).unwrap();
        let b = engine.classify(&png(DynamicImage::ImageRgba8(rgba))).unwrap();
        assert_eq!(a, b);
    }
}
