use ndarray::{Array4, ArrayView4};
use rand::Rng;
use tracing::debug;

use super::config::{Activation, BackboneConfig};
use super::layers::{BatchNorm2d, ConvLayer, MaxPool2d};
use crate::error::{CapsNetError, Result};

/// Deux convolutions 3x3 avec raccourci identité (ou projeté).
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub conv1: ConvLayer,
    pub bn1: BatchNorm2d,
    pub conv2: ConvLayer,
    pub bn2: BatchNorm2d,
    pub downsample: Option<(ConvLayer, BatchNorm2d)>,
}

impl BasicBlock {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        eps: f32,
        rng: &mut R,
    ) -> Result<Self> {
        let conv1 = ConvLayer::new(in_channels, out_channels, 3, stride, 1, Activation::None, false, rng)?;
        let conv2 = ConvLayer::new(out_channels, out_channels, 3, 1, 1, Activation::None, false, rng)?;
        let downsample = if stride != 1 || in_channels != out_channels {
            let projection = ConvLayer::new(in_channels, out_channels, 1, stride, 0, Activation::None, false, rng)?;
            Some((projection, BatchNorm2d::new(out_channels, eps)))
        } else {
            None
        };

        Ok(Self {
            conv1,
            bn1: BatchNorm2d::new(out_channels, eps),
            conv2,
            bn2: BatchNorm2d::new(out_channels, eps),
            downsample,
        })
    }

    pub fn forward(&self, input: &ArrayView4<f32>) -> Result<Array4<f32>> {
        let out = self.bn1.forward(self.conv1.forward(input)?, Activation::ReLU)?;
        let out = self.bn2.forward(self.conv2.forward(&out.view())?, Activation::None)?;

        let identity = match &self.downsample {
            Some((conv, bn)) => bn.forward(conv.forward(input)?, Activation::None)?,
            None => input.to_owned(),
        };
        if identity.dim() != out.dim() {
            return Err(CapsNetError::shape("raccourci résiduel", format!("{:?}", out.dim()), identity.dim()));
        }

        let mut out = out + identity;
        out.mapv_inplace(|v| v.max(0.0));
        Ok(out)
    }
}

/// Corps ResNet sans pooling global ni tête de classification.
#[derive(Debug, Clone)]
pub struct ResNetBackbone {
    pub stem: ConvLayer,
    pub stem_bn: BatchNorm2d,
    pub pool: MaxPool2d,
    pub stages: Vec<Vec<BasicBlock>>,
}

impl ResNetBackbone {
    pub fn new<R: Rng + ?Sized>(config: &BackboneConfig, rng: &mut R) -> Result<Self> {
        config.validate()?;

        let stem = ConvLayer::new(
            config.input_channels,
            config.stem_channels,
            config.stem_kernel,
            config.stem_stride,
            config.stem_padding,
            Activation::None,
            false,
            rng,
        )?;

        let mut stages = Vec::with_capacity(config.stage_channels.len());
        let mut in_channels = config.stem_channels;
        for (index, (&width, &depth)) in config
            .stage_channels
            .iter()
            .zip(&config.blocks_per_stage)
            .enumerate()
        {
            let first_stride = if index == 0 { 1 } else { 2 };
            let mut blocks = Vec::with_capacity(depth);
            for block in 0..depth {
                let stride = if block == 0 { first_stride } else { 1 };
                blocks.push(BasicBlock::new(in_channels, width, stride, config.batch_norm_eps, rng)?);
                in_channels = width;
            }
            stages.push(blocks);
        }

        Ok(Self {
            stem,
            stem_bn: BatchNorm2d::new(config.stem_channels, config.batch_norm_eps),
            pool: MaxPool2d::new(3, 2, 1),
            stages,
        })
    }

    pub fn input_channels(&self) -> usize {
        self.stem.in_channels()
    }

    pub fn output_channels(&self) -> usize {
        self.stages
            .last()
            .and_then(|blocks| blocks.last())
            .map_or(self.stem.out_channels(), |block| block.conv2.out_channels())
    }

    /// `(batch, C_in, H, W)` -> `(batch, C_out, H / 32, W / 32)` avec le stem par défaut.
    pub fn forward(&self, input: &ArrayView4<f32>) -> Result<Array4<f32>> {
        let stem = self.stem_bn.forward(self.stem.forward(input)?, Activation::ReLU)?;
        let mut features = self.pool.forward(&stem.view())?;

        for (index, blocks) in self.stages.iter().enumerate() {
            for block in blocks {
                features = block.forward(&features.view())?;
            }
            debug!(stage = index + 1, shape = ?features.dim(), "étage du backbone");
        }

        Ok(features)
    }
}
