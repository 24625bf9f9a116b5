use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use burn::{
    backend::NdArray,
    prelude::*,
    record::{CompactRecorder, FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
    tensor::TensorData,
};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use ndarray::Array4;

use crate::inference::error::InferenceError;
use crate::inference::network::{ResNet, ResNetConfig};

/// CPU backend used by the service.
pub type CpuBackend = NdArray;

/// Anything that turns a preprocessed image batch into raw class scores.
///
/// The engine only talks to this trait, so tests can plug in fixed-output
/// models without loading weights.
pub trait Classifier: Send + Sync {
    /// input: [1, 3, H, W] normalised image → one logit per class.
    fn logits(&self, input: Array4<f32>) -> Result<Vec<f32>, InferenceError>;
}

/// On-disk weight formats the loader understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightsFormat {
    /// PyTorch state dict with torchvision parameter names.
    PyTorch,
    /// burn compact record (half precision, gzip).
    Compact,
    /// burn named MessagePack record (full precision).
    NamedMpk,
}

impl WeightsFormat {
    pub fn detect(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if name.ends_with(".pth") || name.ends_with(".pt") {
            Ok(WeightsFormat::PyTorch)
        } else if name.ends_with(".mpk.gz") {
            Ok(WeightsFormat::Compact)
        } else if name.ends_with(".mpk") {
            Ok(WeightsFormat::NamedMpk)
        } else {
            bail!("unsupported weights file '{}' (expected .pth, .pt, .mpk or .mpk.gz)", path.display())
        }
    }
}

// burn's file recorders append their own extension.
fn strip_suffix(path: &Path, suffix: &str) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(raw.strip_suffix(suffix).unwrap_or(&raw))
}

/// ResNet-18 running on a burn backend.
pub struct BurnClassifier<B: Backend = CpuBackend> {
    // Held behind a lock only to hand out clones; forward passes run unlocked.
    model: Mutex<ResNet<B>>,
    device: B::Device,
}

impl<B: Backend> BurnClassifier<B> {
    pub fn new(model: ResNet<B>, device: B::Device) -> Self {
        Self {
            model: Mutex::new(model),
            device,
        }
    }

    /// Build the production architecture and fill it from a weights file.
    pub fn load(path: &Path, device: B::Device) -> Result<Self> {
        Self::load_with_config(path, &ResNetConfig::new(), device)
    }

    pub fn load_with_config(path: &Path, config: &ResNetConfig, device: B::Device) -> Result<Self> {
        let format = WeightsFormat::detect(path)?;
        if !path.is_file() {
            bail!("weights file '{}' not found", path.display());
        }

        let model: ResNet<B> = config.init(&device);
        let model = match format {
            WeightsFormat::PyTorch => {
                let args = LoadArgs::new(path.to_path_buf())
                    .with_key_remap(r"downsample\.0\.", "downsample.conv.")
                    .with_key_remap(r"downsample\.1\.", "downsample.bn.");
                let record = PyTorchFileRecorder::<FullPrecisionSettings>::default()
                    .load(args, &device)
                    .with_context(|| format!("loading PyTorch weights from '{}'", path.display()))?;
                model.load_record(record)
            }
            WeightsFormat::Compact => model
                .load_file(strip_suffix(path, ".mpk.gz"), &CompactRecorder::new(), &device)
                .with_context(|| format!("loading compact record from '{}'", path.display()))?,
            WeightsFormat::NamedMpk => model
                .load_file(
                    strip_suffix(path, ".mpk"),
                    &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
                    &device,
                )
                .with_context(|| format!("loading record from '{}'", path.display()))?,
        };

        tracing::info!(path = %path.display(), ?format, "Model weights loaded");
        Ok(Self::new(model, device))
    }

    fn snapshot(&self) -> Result<ResNet<B>, InferenceError> {
        self.model
            .lock()
            .map(|guard| guard.clone())
            .map_err(|_| InferenceError::ModelUnavailable)
    }
}

impl<B: Backend> Classifier for BurnClassifier<B> {
    fn logits(&self, input: Array4<f32>) -> Result<Vec<f32>, InferenceError> {
        let model = self.snapshot()?;
        let shape = input.shape().to_vec();
        let (values, _) = input.into_raw_vec_and_offset();
        let data = TensorData::new(values, shape);

        // burn reports shape mismatches by panicking.
        let output = panic::catch_unwind(AssertUnwindSafe(|| {
            let images = Tensor::<B, 4>::from_data(data, &self.device);
            model.forward(images).into_data()
        }))
        .map_err(|_| InferenceError::Forward("numeric backend aborted the forward pass".to_string()))?;

        output
            .to_vec::<f32>()
            .map_err(|e| InferenceError::Forward(format!("{e:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn narrow_classifier() -> BurnClassifier<CpuBackend> {
        let device = Default::default();
        let model = ResNetConfig::new().with_base_width(4).init(&device);
        BurnClassifier::new(model, device)
    }

    #[test]
    fn detects_formats_from_file_name() {
        assert_eq!(
            WeightsFormat::detect(Path::new("models/bcn20000_model_8classes.pth")).unwrap(),
            WeightsFormat::PyTorch
        );
        assert_eq!(
            WeightsFormat::detect(Path::new("model.mpk.gz")).unwrap(),
            WeightsFormat::Compact
        );
        assert_eq!(WeightsFormat::detect(Path::new("model.mpk")).unwrap(), WeightsFormat::NamedMpk);
        assert!(WeightsFormat::detect(Path::new("model.onnx")).is_err());
    }

    #[test]
    fn strip_suffix_keeps_directory() {
        assert_eq!(
            strip_suffix(Path::new("/tmp/w/model.mpk.gz"), ".mpk.gz"),
            PathBuf::from("/tmp/w/model")
        );
    }

    #[test]
    fn logits_have_one_entry_per_class() {
        let classifier = narrow_classifier();
        let logits = classifier.logits(Array4::zeros((1, 3, 224, 224))).unwrap();
        assert_eq!(logits.len(), 8);
        assert!(logits.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn wrong_channel_count_is_a_forward_error() {
        let classifier = narrow_classifier();
        let err = classifier.logits(Array4::zeros((1, 1, 224, 224))).unwrap_err();
        assert!(matches!(err, InferenceError::Forward(_)));
    }

    #[test]
    fn missing_weights_file_is_reported() {
        let err = BurnClassifier::<CpuBackend>::load(Path::new("/nonexistent/model.pth"), Default::default())
            .err()
            .unwrap();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn loads_named_record_written_by_burn() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let config = ResNetConfig::new().with_base_width(4);
        let model: ResNet<CpuBackend> = config.init(&device);
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        model.clone().save_file(dir.path().join("weights"), &recorder).unwrap();

        let loaded =
            BurnClassifier::<CpuBackend>::load_with_config(&dir.path().join("weights.mpk"), &config, device)
                .unwrap();
        let input = Array4::from_elem((1, 3, 224, 224), 0.25f32);
        let expected = BurnClassifier::new(model, Default::default())
            .logits(input.clone())
            .unwrap();
        let got = loaded.logits(input).unwrap();
        for (a, b) in expected.iter().zip(&got) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
    }

    #[test]
    fn loads_compact_record_written_by_burn() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let config = ResNetConfig::new().with_base_width(4);
        let model: ResNet<CpuBackend> = config.init(&device);
        model.clone().save_file(dir.path().join("weights"), &CompactRecorder::new()).unwrap();

        let loaded =
            BurnClassifier::<CpuBackend>::load_with_config(&dir.path().join("weights.mpk.gz"), &config, device)
                .unwrap();
        let input = Array4::from_elem((1, 3, 224, 224), 0.25f32);
        let expected = BurnClassifier::new(model, Default::default())
            .logits(input.clone())
            .unwrap();
        let got = loaded.logits(input).unwrap();
        // half precision on disk
        for (a, b) in expected.iter().zip(&got) {
            assert!((a - b).abs() < 5e-2 * (1.0 + a.abs()), "{a} vs {b}");
        }
    }

    // torchvision-layout state dict, width 4, every conv weight zero and every
    // batch norm shift zero, so the logits reduce to `fc.bias`.
    const TORCHVISION_FIXTURE: &str =
        concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/resnet18_w4_zero_conv.pth");
    const FIXTURE_FC_BIAS: [f32; 8] = [0.5, -1.0, 2.0, 0.0, 3.25, -2.0, 1.0, 0.0];

    #[test]
    fn loads_torchvision_state_dict() {
        let config = ResNetConfig::new().with_base_width(4);
        let classifier =
            BurnClassifier::<CpuBackend>::load_with_config(Path::new(TORCHVISION_FIXTURE), &config, Default::default())
                .unwrap();

        let logits = classifier.logits(Array4::from_elem((1, 3, 224, 224), 0.7f32)).unwrap();
        for (got, want) in logits.iter().zip(FIXTURE_FC_BIAS) {
            assert!((got - want).abs() < 1e-6, "{logits:?}");
        }
    }

    #[test]
    fn torchvision_names_map_onto_module_tree() {
        let config = ResNetConfig::new().with_base_width(4);
        let classifier =
            BurnClassifier::<CpuBackend>::load_with_config(Path::new(TORCHVISION_FIXTURE), &config, Default::default())
                .unwrap();
        let model = classifier.snapshot().unwrap();

        // PyTorch stores linear weights as [out, in].
        assert_eq!(model.fc.weight.val().dims(), [32, 8]);

        let shortcut = model.layer2[0].downsample.as_ref().expect("layer2 projects");
        let running_var = shortcut.bn.running_var.value().into_data().to_vec::<f32>().unwrap();
        assert_eq!(running_var, vec![1.0, 1.5, 2.0, 2.5, 3.0, 3.5, 4.0, 4.5]);
        let gamma = shortcut.bn.gamma.val().into_data().to_vec::<f32>().unwrap();
        assert!(gamma.iter().all(|g| *g == 1.0));
    }
}
