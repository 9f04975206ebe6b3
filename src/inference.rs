// file: inference.rs
// desc: pixel buffer, arg-max reduction and the lazily loading predictor

use burn::tensor::{Tensor, backend::Backend};
use futures::future::{BoxFuture, FutureExt};

use crate::cache::{ModelCache, ModelLoader};
use crate::error::{LoadError, PredictError, ShapeError};
use crate::model::{DigitClassifier, MnistModel};
use crate::source::ModelSource;
use crate::{IMAGE_SIZE, NUM_CLASSES, PIXEL_COUNT};

/// One 28x28 single-channel image, row-major.
///
/// Values are passed to the model untouched; scaling them is up to the
/// caller.
#[derive(Debug, Clone, PartialEq)]
pub struct Pixels([f32; PIXEL_COUNT]);

impl Pixels {
    pub fn zeros() -> Self {
        Self([0.0; PIXEL_COUNT])
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }
}

impl From<[f32; PIXEL_COUNT]> for Pixels {
    fn from(values: [f32; PIXEL_COUNT]) -> Self {
        Self(values)
    }
}

impl TryFrom<&[f32]> for Pixels {
    type Error = ShapeError;

    fn try_from(values: &[f32]) -> Result<Self, Self::Error> {
        <[f32; PIXEL_COUNT]>::try_from(values)
            .map(Self)
            .map_err(|_| ShapeError {
                expected: PIXEL_COUNT,
                actual: values.len(),
            })
    }
}

impl TryFrom<Vec<f32>> for Pixels {
    type Error = ShapeError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Self::try_from(values.as_slice())
    }
}

/// Index of the largest score, the first one on ties. `None` for an empty
/// slice or when any score is NaN.
pub fn argmax(scores: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;

    for (index, &score) in scores.iter().enumerate() {
        if score.is_nan() {
            return None;
        }
        match best {
            Some((_, top)) if score <= top => {}
            _ => best = Some((index, score)),
        }
    }

    best.map(|(index, _)| index)
}

/// Fetches a served [`MnistModel`] record and decodes it on `device`.
pub struct RecordLoader<B: Backend, S: ModelSource> {
    source: S,
    device: B::Device,
}

impl<B: Backend, S: ModelSource> RecordLoader<B, S> {
    pub fn new(source: S, device: B::Device) -> Self {
        Self { source, device }
    }

    pub fn source(&self) -> &S {
        &self.source
    }
}

impl<B: Backend, S: ModelSource> ModelLoader for RecordLoader<B, S> {
    type Model = MnistModel<B>;

    fn load(&self) -> BoxFuture<'static, Result<MnistModel<B>, LoadError>> {
        log::info!("Loading model from {}", self.source.describe());
        let fetch = self.source.fetch();
        let device = self.device.clone();

        async move {
            let bytes = fetch.await?;
            MnistModel::from_bytes(bytes, &device)
        }
        .boxed()
    }
}

/// Turns pixel buffers into digits using a lazily loaded model.
pub struct Predictor<B: Backend, L: ModelLoader> {
    cache: ModelCache<L>,
    device: B::Device,
}

impl<B: Backend, S: ModelSource> Predictor<B, RecordLoader<B, S>> {
    /// Predictor whose model is downloaded from `source` on first use.
    pub fn remote(source: S, device: B::Device) -> Self {
        Self::new(RecordLoader::new(source, device.clone()), device)
    }
}

impl<B, L> Predictor<B, L>
where
    B: Backend,
    L: ModelLoader,
    L::Model: DigitClassifier<B>,
{
    pub fn new(loader: L, device: B::Device) -> Self {
        Self {
            cache: ModelCache::new(loader),
            device,
        }
    }

    pub fn cache(&self) -> &ModelCache<L> {
        &self.cache
    }

    /// Predicts the digit drawn in a 784-value buffer.
    ///
    /// A buffer of the wrong length is rejected before the model is loaded.
    pub async fn predict(&self, pixels: &[f32]) -> Result<u8, PredictError> {
        let pixels = Pixels::try_from(pixels)?;
        self.predict_pixels(&pixels).await
    }

    pub async fn predict_pixels(&self, pixels: &Pixels) -> Result<u8, PredictError> {
        let model = self.cache.ensure_loaded().await?;
        let digit = self.infer(&model, pixels)?;
        log::debug!("Predicted digit {}", digit);
        Ok(digit)
    }

    fn infer(&self, model: &L::Model, pixels: &Pixels) -> Result<u8, PredictError> {
        let input = Tensor::<B, 1>::from_floats(pixels.as_slice(), &self.device)
            .reshape([1, IMAGE_SIZE, IMAGE_SIZE, 1]);

        let output = model.classify(input);

        let dims = output.dims();
        if dims != [1, NUM_CLASSES] {
            return Err(PredictError::Inference(format!(
                "expected output shape [1, {}], got {:?}",
                NUM_CLASSES, dims
            )));
        }

        let scores = output
            .into_data()
            .to_vec::<f32>()
            .map_err(|err| PredictError::Inference(format!("{err:?}")))?;

        let digit = argmax(&scores)
            .ok_or_else(|| PredictError::Inference("model produced NaN scores".to_string()))?;

        Ok(digit as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type TestBackend = NdArray<f32>;

    #[derive(Clone)]
    struct FixedScores {
        scores: Vec<f32>,
        calls: Arc<AtomicUsize>,
    }

    impl<B: Backend> DigitClassifier<B> for FixedScores {
        fn classify(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
            assert_eq!(images.dims(), [1, IMAGE_SIZE, IMAGE_SIZE, 1]);
            self.calls.fetch_add(1, Ordering::SeqCst);
            let len = self.scores.len();
            Tensor::<B, 1>::from_floats(self.scores.as_slice(), &images.device()).reshape([1, len])
        }
    }

    struct FixedLoader(FixedScores);

    impl ModelLoader for FixedLoader {
        type Model = FixedScores;

        fn load(&self) -> BoxFuture<'static, Result<FixedScores, LoadError>> {
            futures::future::ready(Ok(self.0.clone())).boxed()
        }
    }

    fn predictor(scores: Vec<f32>) -> (Predictor<TestBackend, FixedLoader>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let model = FixedScores {
            scores,
            calls: Arc::clone(&calls),
        };
        (Predictor::new(FixedLoader(model), Default::default()), calls)
    }

    #[test]
    fn argmax_prefers_first_of_equal_scores() {
        assert_eq!(argmax(&[0.1, 0.4, 0.4, 0.2]), Some(1));
        assert_eq!(argmax(&[-3.0, -1.0, -2.0]), Some(1));
        assert_eq!(argmax(&[]), None);
        assert_eq!(argmax(&[0.2, f32::NAN]), None);
    }

    #[test]
    fn pixels_reject_wrong_length() {
        let err = Pixels::try_from(vec![0.0; 783]).unwrap_err();
        assert_eq!(
            err,
            ShapeError {
                expected: PIXEL_COUNT,
                actual: 783
            }
        );
        assert!(Pixels::try_from(vec![1.0; PIXEL_COUNT]).is_ok());
    }

    #[tokio::test]
    async fn zeros_with_peak_at_seven_predicts_seven() {
        let (predictor, calls) =
            predictor(vec![0.1, 0.05, 0.02, 0.03, 0.0, 0.1, 0.05, 0.9, 0.01, 0.02]);

        let digit = predictor.predict(&[0.0; PIXEL_COUNT]).await.unwrap();
        assert_eq!(digit, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wrong_length_never_reaches_the_model() {
        let (predictor, calls) = predictor(vec![1.0; NUM_CLASSES]);

        let err = predictor.predict(&[0.0; 100]).await.unwrap_err();
        assert_eq!(
            err,
            PredictError::Shape(ShapeError {
                expected: PIXEL_COUNT,
                actual: 100
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(predictor.cache().state(), crate::cache::CacheState::Unloaded);
    }

    #[tokio::test]
    async fn unexpected_output_shape_is_an_inference_error() {
        let (predictor, _) = predictor(vec![0.5; 3]);

        let err = predictor.predict(&[0.0; PIXEL_COUNT]).await.unwrap_err();
        assert!(matches!(err, PredictError::Inference(_)));
        assert_eq!(predictor.cache().state(), crate::cache::CacheState::Loaded);
    }

    #[tokio::test]
    async fn nan_scores_are_an_inference_error() {
        let mut scores = vec![0.0; NUM_CLASSES];
        scores[4] = f32::NAN;
        let (predictor, _) = predictor(scores);

        let err = predictor.predict(&[0.0; PIXEL_COUNT]).await.unwrap_err();
        assert!(matches!(err, PredictError::Inference(_)));
    }

    #[tokio::test]
    async fn repeated_predictions_agree() {
        let (predictor, _) = predictor(vec![0.3, 0.3, 0.1, 0.0, 0.0, 0.0, 0.0, 0.0, 0.3, 0.0]);
        let pixels = Pixels::zeros();

        for _ in 0..10 {
            assert_eq!(predictor.predict_pixels(&pixels).await, Ok(0));
        }
    }

    /// Serves scripted byte payloads from memory; the last one repeats.
    struct ScriptedSource {
        payloads: Vec<Vec<u8>>,
        fetches: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(payloads: Vec<Vec<u8>>) -> Self {
            Self {
                payloads,
                fetches: AtomicUsize::new(0),
            }
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    impl ModelSource for ScriptedSource {
        fn fetch(&self) -> BoxFuture<'static, Result<Vec<u8>, LoadError>> {
            let fetch = self.fetches.fetch_add(1, Ordering::SeqCst);
            let payload = self.payloads[fetch.min(self.payloads.len() - 1)].clone();
            futures::future::ready(Ok(payload)).boxed()
        }

        fn describe(&self) -> String {
            "memory".to_string()
        }
    }

    fn model_bytes() -> Vec<u8> {
        MnistModel::<TestBackend>::new(&Default::default())
            .to_bytes()
            .unwrap()
    }

    #[tokio::test]
    async fn randomly_initialized_model_predicts_a_digit() {
        let source = ScriptedSource::new(vec![model_bytes()]);
        let predictor = Predictor::<TestBackend, _>::remote(source, Default::default());
        let pixels: Vec<f32> = (0..PIXEL_COUNT).map(|i| (i % 255) as f32 / 255.0).collect();

        let digit = predictor.predict(&pixels).await.unwrap();
        assert!(digit <= 9);
        assert_eq!(predictor.cache().loader().source().fetches(), 1);
    }

    #[tokio::test]
    async fn undecodable_model_leaves_cache_empty_for_retry() {
        let source = ScriptedSource::new(vec![b"<html>not a model</html>".to_vec(), model_bytes()]);
        let predictor = Predictor::<TestBackend, _>::remote(source, Default::default());

        let err = predictor.predict(&[0.0; PIXEL_COUNT]).await.unwrap_err();
        assert!(matches!(err, PredictError::Load(LoadError::Decode(_))), "{err:?}");
        assert_eq!(predictor.cache().state(), crate::cache::CacheState::Unloaded);
        assert_eq!(predictor.cache().loader().source().fetches(), 1);

        let digit = predictor.predict(&[0.0; PIXEL_COUNT]).await.unwrap();
        assert!(digit <= 9);
        assert_eq!(predictor.cache().state(), crate::cache::CacheState::Loaded);
        assert_eq!(predictor.cache().loader().source().fetches(), 2);
    }
}
