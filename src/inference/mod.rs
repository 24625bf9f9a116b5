pub mod engine;
pub mod error;
pub mod labels;
pub mod model;
pub mod network;
pub mod preprocess;

pub use engine::{InferenceEngine, PredictionResult, ProbabilityDistribution};
pub use error::InferenceError;
pub use labels::{Category, ClassLabel, CLASS_COUNT};
pub use model::{BurnClassifier, Classifier, CpuBackend};
