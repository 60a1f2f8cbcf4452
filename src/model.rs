use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Initializer, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    prelude::*,
};

use crate::data::{IMAGE_CHANNELS, IMAGE_HEIGHT, IMAGE_WIDTH};

/// Convolutional digit classifier.
///
/// Two convolution blocks (5x5 kernels, same padding, ReLU, 2x2 max pooling)
/// followed by a 1024-unit dense layer, dropout and a 10-way logits layer.
#[derive(Module, Debug)]
pub struct Classifier<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    pool: MaxPool2d,
    dense: Linear<B>,
    dropout: Dropout,
    logits: Linear<B>,
    activation: Relu,
    num_classes: usize,
}

#[derive(Config, Debug)]
pub struct ClassifierConfig {
    #[config(default = 10)]
    pub num_classes: usize,
    #[config(default = 32)]
    pub conv1_filters: usize,
    #[config(default = 64)]
    pub conv2_filters: usize,
    #[config(default = 5)]
    pub kernel_size: usize,
    #[config(default = 1024)]
    pub hidden_size: usize,
    /// Probability of zeroing a dense activation while training.
    #[config(default = 0.4)]
    pub dropout: f64,
    /// Overrides the default initializer of every weight and bias.
    pub initializer: Option<Initializer>,
}

impl ClassifierConfig {
    /// Length of the vector fed to the dense layer: two 2x2 poolings shrink
    /// each side by four.
    pub fn flattened_size(&self) -> usize {
        (IMAGE_HEIGHT / 4) * (IMAGE_WIDTH / 4) * self.conv2_filters
    }

    /// Returns the initialized model.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Classifier<B> {
        let kernel = [self.kernel_size, self.kernel_size];

        let mut conv1 = Conv2dConfig::new([IMAGE_CHANNELS, self.conv1_filters], kernel)
            .with_padding(PaddingConfig2d::Same);
        let mut conv2 = Conv2dConfig::new([self.conv1_filters, self.conv2_filters], kernel)
            .with_padding(PaddingConfig2d::Same);
        let mut dense = LinearConfig::new(self.flattened_size(), self.hidden_size);
        let mut logits = LinearConfig::new(self.hidden_size, self.num_classes);

        if let Some(initializer) = &self.initializer {
            conv1 = conv1.with_initializer(initializer.clone());
            conv2 = conv2.with_initializer(initializer.clone());
            dense = dense.with_initializer(initializer.clone());
            logits = logits.with_initializer(initializer.clone());
        }

        Classifier {
            conv1: conv1.init(device),
            conv2: conv2.init(device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            dense: dense.init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            logits: logits.init(device),
            activation: Relu::new(),
            num_classes: self.num_classes,
        }
    }
}

impl<B: Backend> Classifier<B> {
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// # Shapes
    ///   - Images [batch_size, height, width, channels]
    ///   - Output [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.features(images);
        self.head(x)
    }

    /// Convolution blocks and the dense layer, up to the dropout.
    ///
    /// # Shapes
    ///   - Images [batch_size, height, width, channels]
    ///   - Output [batch_size, hidden_size]
    pub fn features(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        // [B, H, W, C] => [B, C, H, W]
        let x = images.swap_dims(1, 3).swap_dims(2, 3);

        let x = self.conv1.forward(x); // [B, 32, 28, 28]
        let x = self.activation.forward(x);
        let x = self.pool.forward(x); // [B, 32, 14, 14]

        let x = self.conv2.forward(x); // [B, 64, 14, 14]
        let x = self.activation.forward(x);
        let x = self.pool.forward(x); // [B, 64, 7, 7]

        let x: Tensor<B, 2> = x.flatten(1, 3); // [B, 3136]
        let x = self.dense.forward(x);
        self.activation.forward(x)
    }

    /// Dropout then the logits layer. Dropout only fires on autodiff backends.
    pub fn head(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.dropout.forward(x);
        self.logits.forward(x)
    }
}
