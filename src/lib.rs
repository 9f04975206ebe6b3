//file: lib.rs
// desc: guess the digit drawn in a 28x28 image with a lazily fetched MNIST model

use std::sync::OnceLock;

use burn::backend::ndarray::NdArray;

pub mod cache;
pub mod config;
pub mod error;
pub mod inference;
pub mod model;
pub mod source;

#[cfg(target_family = "wasm")]
mod web;

pub use cache::{CacheState, ModelCache, ModelLoader};
pub use config::AppConfig;
pub use error::{LoadError, PredictError, Result, ShapeError};
pub use inference::{Pixels, Predictor, RecordLoader, argmax};
pub use model::{DigitClassifier, MnistModel};
pub use source::{HttpModelSource, ModelSource};

// Consts
pub const IMAGE_SIZE: usize = 28;
pub const PIXEL_COUNT: usize = IMAGE_SIZE * IMAGE_SIZE;
pub const NUM_CLASSES: usize = 10;

pub type Backend = NdArray<f32>;

pub type RemotePredictor = Predictor<Backend, RecordLoader<Backend, HttpModelSource>>;

static PREDICTOR: OnceLock<RemotePredictor> = OnceLock::new();

/// The process-wide predictor, configured from the environment on first use.
pub fn default_predictor() -> &'static RemotePredictor {
    PREDICTOR.get_or_init(|| {
        let config = AppConfig::from_env();
        log::info!("Using model at {}", config.model_url);
        Predictor::remote(HttpModelSource::from_config(&config), Default::default())
    })
}

/// Predicts the digit in a 784-value buffer with the process-wide model,
/// downloading it on the first call.
pub async fn predict_digit(pixels: &[f32]) -> Result<u8> {
    default_predictor().predict(pixels).await
}
