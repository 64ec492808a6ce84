use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use super::{
    backbone::{BasicBlock, ResNetBackbone},
    capsule::{DigitCapsLayer, PrimaryCapsLayer},
    config::{Activation, NetworkConfig},
    core::{CapNet, SiameseCapNet},
    layers::{BatchNorm2d, ConvLayer, MaxPool2d},
    weights::{NamedTensor, StateDict, WeightLoader},
};
use crate::error::{CapsNetError, Result};

/// Préfixe de l'encodeur dans le checkpoint siamois.
const ENCODER_PREFIX: &str = "capsule_net";
/// Indice du premier étage résiduel dans le sequential `cnn`
/// (conv1, bn1, relu, maxpool d'abord).
const FIRST_STAGE_INDEX: usize = 4;

/// Constructeur de modèle : config plus paramètres aléatoires (graine)
/// ou [`StateDict`] chargé.
pub struct ModelBuilder {
    network_config: Option<NetworkConfig>,
    state_dict: Option<StateDict>,
    seed: Option<u64>,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self {
            network_config: None,
            state_dict: None,
            seed: None,
        }
    }

    pub fn with_network_config(mut self, config: NetworkConfig) -> Self {
        self.network_config = Some(config);
        self
    }

    pub fn with_state_dict(mut self, state_dict: StateDict) -> Self {
        self.state_dict = Some(state_dict);
        self
    }

    /// Graine de l'initialisation aléatoire ; ignorée si un state dict est fourni.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn build(self) -> Result<CapNet> {
        let network_config = self.network_config.unwrap_or_default();
        network_config.validate()?;

        match (self.state_dict, self.seed) {
            (Some(dict), _) => Self::from_state_dict(network_config, &dict),
            (None, Some(seed)) => Self::random(network_config, &mut StdRng::seed_from_u64(seed)),
            (None, None) => Self::random(network_config, &mut rand::rng()),
        }
    }

    pub fn build_siamese(self) -> Result<SiameseCapNet> {
        Ok(SiameseCapNet::new(self.build()?))
    }

    fn random<R: Rng + ?Sized>(config: NetworkConfig, rng: &mut R) -> Result<CapNet> {
        let backbone = ResNetBackbone::new(&config.backbone, rng)?;
        let primary = PrimaryCapsLayer::new(backbone.output_channels(), &config.primary, rng)?;
        let digit = DigitCapsLayer::new(
            config.num_primary_capsules(),
            config.primary.capsule_dim,
            config.digit.num_capsules,
            config.digit.capsule_dim,
            config.digit.routing_iterations,
            rng,
        )?;
        info!(
            primary_capsules = config.num_primary_capsules(),
            classes = config.digit.num_capsules,
            "encodeur initialisé aléatoirement"
        );
        CapNet::new(config, backbone, primary, digit)
    }

    fn from_state_dict(config: NetworkConfig, dict: &StateDict) -> Result<CapNet> {
        let mut loader = WeightLoader::new(dict);
        let backbone_config = &config.backbone;
        let eps = backbone_config.batch_norm_eps;
        let cnn = format!("{ENCODER_PREFIX}.cnn");

        let stem = loader.conv(
            &format!("{cnn}.0"),
            (
                backbone_config.stem_channels,
                backbone_config.input_channels,
                backbone_config.stem_kernel,
                backbone_config.stem_kernel,
            ),
            backbone_config.stem_stride,
            backbone_config.stem_padding,
            Activation::None,
            false,
        )?;
        let stem_bn = loader.batch_norm(&format!("{cnn}.1"), backbone_config.stem_channels, eps)?;

        let mut stages = Vec::with_capacity(backbone_config.stage_channels.len());
        let mut in_channels = backbone_config.stem_channels;
        for (index, (&width, &depth)) in backbone_config
            .stage_channels
            .iter()
            .zip(&backbone_config.blocks_per_stage)
            .enumerate()
        {
            let mut blocks = Vec::with_capacity(depth);
            for block in 0..depth {
                let stride = if index > 0 && block == 0 { 2 } else { 1 };
                let prefix = format!("{cnn}.{}.{block}", FIRST_STAGE_INDEX + index);
                let downsample = if stride != 1 || in_channels != width {
                    Some((
                        loader.conv(
                            &format!("{prefix}.downsample.0"),
                            (width, in_channels, 1, 1),
                            stride,
                            0,
                            Activation::None,
                            false,
                        )?,
                        loader.batch_norm(&format!("{prefix}.downsample.1"), width, eps)?,
                    ))
                } else {
                    None
                };
                blocks.push(BasicBlock {
                    conv1: loader.conv(
                        &format!("{prefix}.conv1"),
                        (width, in_channels, 3, 3),
                        stride,
                        1,
                        Activation::None,
                        false,
                    )?,
                    bn1: loader.batch_norm(&format!("{prefix}.bn1"), width, eps)?,
                    conv2: loader.conv(
                        &format!("{prefix}.conv2"),
                        (width, width, 3, 3),
                        1,
                        1,
                        Activation::None,
                        false,
                    )?,
                    bn2: loader.batch_norm(&format!("{prefix}.bn2"), width, eps)?,
                    downsample,
                });
                in_channels = width;
            }
            stages.push(blocks);
        }

        let backbone = ResNetBackbone {
            stem,
            stem_bn,
            pool: MaxPool2d::new(3, 2, 1),
            stages,
        };

        let primary_config = &config.primary;
        let primary_conv = loader.conv(
            &format!("{ENCODER_PREFIX}.primary_capsules.conv"),
            (
                primary_config.out_channels(),
                backbone.output_channels(),
                primary_config.kernel_size,
                primary_config.kernel_size,
            ),
            primary_config.stride,
            primary_config.padding,
            Activation::ReLU,
            true,
        )?;
        let primary = PrimaryCapsLayer::from_conv(
            primary_conv,
            primary_config.num_capsules,
            primary_config.capsule_dim,
        )?;

        let num_primary = config.num_primary_capsules();
        let (num_digit, digit_dim) = (config.digit.num_capsules, config.digit.capsule_dim);
        let routing_weights = loader.array4_as(
            &format!("{ENCODER_PREFIX}.digit_capsules.W"),
            &[1, num_primary, num_digit, digit_dim, primary_config.capsule_dim],
            (num_primary, num_digit, digit_dim, primary_config.capsule_dim),
        )?;
        let digit = DigitCapsLayer::from_weights(routing_weights, config.digit.routing_iterations);

        loader.finish()?;
        info!(tensors = dict.len(), "poids de l'encodeur chargés");
        CapNet::new(config, backbone, primary, digit)
    }
}

impl Default for ModelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Exporte les paramètres sous les noms que le constructeur relit.
pub fn state_dict_of(net: &CapNet) -> Result<StateDict> {
    let mut dict = StateDict::default();
    let cnn = format!("{ENCODER_PREFIX}.cnn");

    put_conv(&mut dict, &format!("{cnn}.0"), &net.backbone.stem);
    put_bn(&mut dict, &format!("{cnn}.1"), &net.backbone.stem_bn);
    for (index, blocks) in net.backbone.stages.iter().enumerate() {
        for (block_index, block) in blocks.iter().enumerate() {
            let prefix = format!("{cnn}.{}.{block_index}", FIRST_STAGE_INDEX + index);
            put_conv(&mut dict, &format!("{prefix}.conv1"), &block.conv1);
            put_bn(&mut dict, &format!("{prefix}.bn1"), &block.bn1);
            put_conv(&mut dict, &format!("{prefix}.conv2"), &block.conv2);
            put_bn(&mut dict, &format!("{prefix}.bn2"), &block.bn2);
            if let Some((conv, bn)) = &block.downsample {
                put_conv(&mut dict, &format!("{prefix}.downsample.0"), conv);
                put_bn(&mut dict, &format!("{prefix}.downsample.1"), bn);
            }
        }
    }
    put_conv(&mut dict, &format!("{ENCODER_PREFIX}.primary_capsules.conv"), &net.primary.conv);

    let (p, j, o, i) = net.digit.weights.dim();
    let routing = net
        .digit
        .weights
        .view()
        .into_shape_with_order((1, p, j, o, i))
        .map_err(|e| CapsNetError::Artifact(format!("poids des capsules de classe : {e}")))?;
    dict.insert(NamedTensor::from_array(format!("{ENCODER_PREFIX}.digit_capsules.W"), &routing));

    Ok(dict)
}

fn put_conv(dict: &mut StateDict, prefix: &str, conv: &ConvLayer) {
    dict.insert(NamedTensor::from_array(format!("{prefix}.weight"), &conv.weights.view()));
    if let Some(bias) = &conv.biases {
        dict.insert(NamedTensor::from_array(format!("{prefix}.bias"), &bias.view()));
    }
}

fn put_bn(dict: &mut StateDict, prefix: &str, bn: &BatchNorm2d) {
    dict.insert(NamedTensor::from_array(format!("{prefix}.weight"), &bn.gamma.view()));
    dict.insert(NamedTensor::from_array(format!("{prefix}.bias"), &bn.beta.view()));
    dict.insert(NamedTensor::from_array(format!("{prefix}.running_mean"), &bn.running_mean.view()));
    dict.insert(NamedTensor::from_array(format!("{prefix}.running_var"), &bn.running_var.view()));
}
