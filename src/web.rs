// file: web.rs
// desc: JavaScript bindings for digit prediction

use wasm_bindgen::prelude::*;

#[wasm_bindgen(start)]
pub fn start() {
    console_error_panic_hook::set_once();
    console_log::init_with_level(log::Level::Debug).ok();
}

/// Resolves to the predicted digit, or rejects with the error message.
///
/// `pixels` must hold 784 values, one 28x28 image in row-major order.
#[wasm_bindgen(js_name = predictDigit)]
pub async fn predict_digit(pixels: Vec<f32>) -> Result<u8, String> {
    crate::predict_digit(&pixels).await.map_err(|err| {
        log::error!("Prediction failed: {}", err);
        err.to_string()
    })
}

/// Aborts a model download in progress so a later call starts over.
#[wasm_bindgen(js_name = cancelModelLoad)]
pub fn cancel_model_load() -> bool {
    crate::default_predictor().cache().cancel()
}
