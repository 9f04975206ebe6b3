// file: model.rs
// desc: MNIST convolutional classifier and its served record format

use std::panic::{self, AssertUnwindSafe};

use burn::{
    module::Module,
    nn::{
        Linear, LinearConfig, Relu,
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
    },
    record::{FullPrecisionSettings, NamedMpkBytesRecorder, Recorder},
    tensor::{Tensor, activation::softmax, backend::Backend},
};

use crate::error::LoadError;
use crate::{IMAGE_SIZE, NUM_CLASSES};

const CONV1_CHANNELS: usize = 8;
const CONV2_CHANNELS: usize = 16;
const KERNEL_SIZE: usize = 5;
// 28 -conv-> 24 -pool-> 12 -conv-> 8 -pool-> 4
const FEATURE_SIZE: usize = ((IMAGE_SIZE - KERNEL_SIZE + 1) / 2 - KERNEL_SIZE + 1) / 2;

/// Anything that maps a `[batch, 28, 28, 1]` image tensor to `[batch, 10]`
/// class scores.
pub trait DigitClassifier<B: Backend> {
    fn classify(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;
}

/// Two conv/pool stages followed by a dense softmax layer.
#[derive(Module, Debug)]
pub struct MnistModel<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    pool: MaxPool2d,
    output: Linear<B>,
    activation: Relu,
}

impl<B: Backend> MnistModel<B> {
    /// Fresh model with randomly initialized weights.
    pub fn new(device: &B::Device) -> Self {
        Self {
            conv1: Conv2dConfig::new([1, CONV1_CHANNELS], [KERNEL_SIZE, KERNEL_SIZE]).init(device),
            conv2: Conv2dConfig::new([CONV1_CHANNELS, CONV2_CHANNELS], [KERNEL_SIZE, KERNEL_SIZE])
                .init(device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            output: LinearConfig::new(CONV2_CHANNELS * FEATURE_SIZE * FEATURE_SIZE, NUM_CLASSES)
                .init(device),
            activation: Relu::new(),
        }
    }

    /// # Shapes
    /// - images: `[batch, height, width, 1]`
    /// - output: `[batch, 10]`, a probability distribution per row
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        // conv layers want channels first
        let x = images.permute([0, 3, 1, 2]);

        let x = self.pool.forward(self.activation.forward(self.conv1.forward(x)));
        let x = self.pool.forward(self.activation.forward(self.conv2.forward(x)));

        let x = x.flatten::<2>(1, 3);
        softmax(self.output.forward(x), 1)
    }

    /// Decodes a record produced by [`MnistModel::to_bytes`].
    ///
    /// Records that decode but carry parameters of the wrong shape are
    /// rejected here rather than failing later inside a forward pass.
    pub fn from_bytes(bytes: Vec<u8>, device: &B::Device) -> Result<Self, LoadError> {
        let recorder = NamedMpkBytesRecorder::<FullPrecisionSettings>::default();
        // burn recorders may panic on truncated input instead of erroring
        let record: MnistModelRecord<B> =
            panic::catch_unwind(AssertUnwindSafe(|| recorder.load(bytes, device)))
                .map_err(|_| LoadError::Decode("record decoder panicked".to_string()))?
                .map_err(|err| LoadError::Decode(format!("{err:?}")))?;

        let reference = Self::new(device);
        let model = reference.clone().load_record(record);
        model.check_shapes(&reference)?;

        Ok(model)
    }

    /// Serializes the weights in the format the model URL serves.
    pub fn to_bytes(&self) -> Result<Vec<u8>, LoadError> {
        NamedMpkBytesRecorder::<FullPrecisionSettings>::default()
            .record(self.clone().into_record(), ())
            .map_err(|err| LoadError::Decode(format!("{err:?}")))
    }

    fn param_shapes(&self) -> [(&'static str, Option<Vec<usize>>); 6] {
        [
            ("conv1.weight", Some(self.conv1.weight.dims().to_vec())),
            ("conv1.bias", self.conv1.bias.as_ref().map(|b| b.dims().to_vec())),
            ("conv2.weight", Some(self.conv2.weight.dims().to_vec())),
            ("conv2.bias", self.conv2.bias.as_ref().map(|b| b.dims().to_vec())),
            ("output.weight", Some(self.output.weight.dims().to_vec())),
            ("output.bias", self.output.bias.as_ref().map(|b| b.dims().to_vec())),
        ]
    }

    fn check_shapes(&self, reference: &Self) -> Result<(), LoadError> {
        for ((name, actual), (_, expected)) in self.param_shapes().into_iter().zip(reference.param_shapes()) {
            if actual != expected {
                return Err(LoadError::Decode(format!(
                    "parameter {name} has shape {actual:?}, expected {expected:?}"
                )));
            }
        }
        Ok(())
    }
}

impl<B: Backend> DigitClassifier<B> for MnistModel<B> {
    fn classify(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.forward(images)
    }
}
