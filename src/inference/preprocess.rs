use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};
use ndarray::Array4;

use crate::inference::error::InferenceError;

/// Side length of the square network input.
pub const INPUT_SIZE: u32 = 224;

/// ImageNet channel statistics the network was trained with.
pub const CHANNEL_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const CHANNEL_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Decode an uploaded payload, sniffing the container format from its bytes.
pub fn decode(bytes: &[u8]) -> Result<DynamicImage, InferenceError> {
    if bytes.is_empty() {
        return Err(InferenceError::Decode("empty payload".to_string()));
    }
    Ok(image::load_from_memory(bytes)?)
}

/// Bring any colour mode to 8-bit RGB. Alpha is dropped, not composited.
pub fn to_rgb(image: DynamicImage) -> RgbImage {
    match image {
        DynamicImage::ImageRgb8(rgb) => rgb,
        other => other.to_rgb8(),
    }
}

/// Resize, scale to [0, 1] and normalise into an NCHW tensor with batch 1.
pub fn to_tensor(rgb: &RgbImage) -> Result<Array4<f32>, InferenceError> {
    let (width, height) = rgb.dimensions();
    if width == 0 || height == 0 {
        return Err(InferenceError::Transform(format!(
            "image has no pixels ({width}x{height})"
        )));
    }

    let resized = imageops::resize(rgb, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle);
    let side = INPUT_SIZE as usize;
    let tensor = Array4::<f32>::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
        let p = resized.get_pixel(x as u32, y as u32);
        (p[c] as f32 / 255.0 - CHANNEL_MEAN[c]) / CHANNEL_STD[c]
    });
    Ok(tensor)
}

/// Full pipeline from raw bytes to the network input.
pub fn preprocess(bytes: &[u8]) -> Result<Array4<f32>, InferenceError> {
    let image = decode(bytes)?;
    to_tensor(&to_rgb(image))
}
