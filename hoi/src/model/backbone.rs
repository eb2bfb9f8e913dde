use burn::{config::Config, module::Module, nn::{conv::{Conv2d, Conv2dConfig}, pool::{MaxPool2d, MaxPool2dConfig}, BatchNorm, BatchNormConfig, PaddingConfig2d}, tensor::{activation::relu, backend::Backend, Tensor}};

use crate::error::{HoiError, Result};

const STAGE_WIDTHS: [usize; 4] = [64, 128, 256, 512];
const STAGE_STRIDES: [usize; 4] = [1, 2, 2, 2];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResNetDepth {
    R18,
    R34,
    R50,
    R101,
}

impl ResNetDepth {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "resnet18" => Ok(Self::R18),
            "resnet34" => Ok(Self::R34),
            "resnet50" => Ok(Self::R50),
            "resnet101" => Ok(Self::R101),
            other => Err(HoiError::Config(format!("unsupported backbone `{other}`"))),
        }
    }

    fn blocks(&self) -> [usize; 4] {
        match self {
            Self::R18 => [2, 2, 2, 2],
            Self::R34 | Self::R50 => [3, 4, 6, 3],
            Self::R101 => [3, 4, 23, 3],
        }
    }

    fn bottleneck(&self) -> bool {
        matches!(self, Self::R50 | Self::R101)
    }

    fn expansion(&self) -> usize {
        if self.bottleneck() { 4 } else { 1 }
    }

    pub fn num_channels(&self) -> usize {
        STAGE_WIDTHS[3] * self.expansion()
    }
}

#[derive(Module, Debug)]
pub struct ConvBn<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B>,
}

impl<B: Backend> ConvBn<B> {
    fn new(channels: [usize; 2], kernel: usize, stride: usize, dilation: usize, device: &B::Device) -> Self {
        let padding = dilation * (kernel - 1) / 2;
        Self {
            conv: Conv2dConfig::new(channels, [kernel, kernel])
                .with_stride([stride, stride])
                .with_dilation([dilation, dilation])
                .with_padding(PaddingConfig2d::Explicit(padding, padding))
                .with_bias(false)
                .init(device),
            bn: BatchNormConfig::new(channels[1]).init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(x))
    }
}

#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    conv1: ConvBn<B>,
    conv2: ConvBn<B>,
    downsample: Option<ConvBn<B>>,
}

impl<B: Backend> BasicBlock<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(downsample) => downsample.forward(x.clone()),
            None => x.clone(),
        };
        let out = relu(self.conv1.forward(x));
        relu(self.conv2.forward(out) + identity)
    }
}

#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    conv1: ConvBn<B>,
    conv2: ConvBn<B>,
    conv3: ConvBn<B>,
    downsample: Option<ConvBn<B>>,
}

impl<B: Backend> Bottleneck<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(downsample) => downsample.forward(x.clone()),
            None => x.clone(),
        };
        let out = relu(self.conv1.forward(x));
        let out = relu(self.conv2.forward(out));
        relu(self.conv3.forward(out) + identity)
    }
}

#[derive(Module, Debug)]
pub enum ResidualBlock<B: Backend> {
    Basic(BasicBlock<B>),
    Bottleneck(Bottleneck<B>),
}

impl<B: Backend> ResidualBlock<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Self::Basic(block) => block.forward(x),
            Self::Bottleneck(block) => block.forward(x),
        }
    }
}

/// ResNet feature extractor, stride 32 (16 with dilation).
#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    stem: ConvBn<B>,
    pool: MaxPool2d,
    blocks: Vec<ResidualBlock<B>>,
    num_channels: usize,
}

impl<B: Backend> Backbone<B> {
    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = relu(self.stem.forward(images));
        let x = self.pool.forward(x);
        self.blocks.iter().fold(x, |x, block| block.forward(x))
    }
}

#[derive(Config, Debug)]
pub struct BackboneConfig {
    pub name: String,
    /// Trade the stride of the last stage for dilation.
    #[config(default = false)]
    pub dilation: bool,
}

impl BackboneConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Backbone<B>> {
        let depth = ResNetDepth::parse(&self.name)?;
        let expansion = depth.expansion();

        let stem = ConvBn::new([3, 64], 7, 2, 1, device);
        let pool = MaxPool2dConfig::new([3, 3])
            .with_strides([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init();

        let mut blocks = Vec::new();
        let mut in_channels = 64;
        for (stage, &count) in depth.blocks().iter().enumerate() {
            let width = STAGE_WIDTHS[stage];
            let out_channels = width * expansion;
            let last_dilated = self.dilation && stage == 3;
            let (stride, dilation) = if last_dilated { (1, 2) } else { (STAGE_STRIDES[stage], 1) };

            for index in 0..count {
                let stride = if index == 0 { stride } else { 1 };
                let downsample = (index == 0 && (stride != 1 || in_channels != out_channels))
                    .then(|| ConvBn::new([in_channels, out_channels], 1, stride, 1, device));
                let block = if depth.bottleneck() {
                    ResidualBlock::Bottleneck(Bottleneck {
                        conv1: ConvBn::new([in_channels, width], 1, 1, 1, device),
                        conv2: ConvBn::new([width, width], 3, stride, dilation, device),
                        conv3: ConvBn::new([width, out_channels], 1, 1, 1, device),
                        downsample,
                    })
                } else {
                    ResidualBlock::Basic(BasicBlock {
                        conv1: ConvBn::new([in_channels, width], 3, stride, dilation, device),
                        conv2: ConvBn::new([width, width], 3, 1, dilation, device),
                        downsample,
                    })
                };
                blocks.push(block);
                in_channels = out_channels;
            }
        }

        Ok(Backbone {
            stem,
            pool,
            blocks,
            num_channels: depth.num_channels(),
        })
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    use super::*;

    type TestBackend = NdArray<f32>;

    #[test]
    fn resnet18_downsamples_by_32() {
        let device = Default::default();
        let backbone = BackboneConfig::new("resnet18".to_string()).init::<TestBackend>(&device).unwrap();
        let features = backbone.forward(Tensor::zeros([1, 3, 64, 64], &device));
        assert_eq!(features.dims(), [1, 512, 2, 2]);
        assert_eq!(backbone.num_channels(), 512);
    }

    #[test]
    fn dilation_keeps_stride_16() {
        let device = Default::default();
        let backbone = BackboneConfig::new("resnet18".to_string())
            .with_dilation(true)
            .init::<TestBackend>(&device)
            .unwrap();
        let features = backbone.forward(Tensor::zeros([1, 3, 64, 64], &device));
        assert_eq!(features.dims(), [1, 512, 4, 4]);
    }

    #[test]
    fn unknown_depth_is_rejected() {
        assert!(matches!(ResNetDepth::parse("vgg16"), Err(HoiError::Config(_))));
        assert_eq!(ResNetDepth::parse("resnet50").unwrap().num_channels(), 2048);
    }
}
