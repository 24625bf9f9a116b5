use thiserror::Error;

/// Failure inside the classification pipeline, tagged by stage.
///
/// The HTTP layer renders every variant the same way (500 with the message),
/// the variants exist for logs and for callers that embed the engine directly.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("cannot identify image file: {0}")]
    Decode(String),

    #[error("preprocessing failed: {0}")]
    Transform(String),

    #[error("forward pass failed: {0}")]
    Forward(String),

    #[error("model returned {actual} scores, expected {expected}")]
    OutputShape { expected: usize, actual: usize },

    #[error("model is unavailable")]
    ModelUnavailable,
}

impl InferenceError {
    /// Short stage name used as a structured log field.
    pub fn stage(&self) -> &'static str {
        match self {
            InferenceError::Decode(_) => "decode",
            InferenceError::Transform(_) => "transform",
            InferenceError::Forward(_) | InferenceError::OutputShape { .. } => "forward",
            InferenceError::ModelUnavailable => "model",
        }
    }
}

impl From<image::ImageError> for InferenceError {
    fn from(err: image::ImageError) -> Self {
        InferenceError::Decode(err.to_string())
    }
}
