use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CapsNetError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    ReLU,
    None,
}

/// Corps ResNet qui alimente les capsules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackboneConfig {
    pub input_channels: usize,
    pub stem_channels: usize,
    pub stem_kernel: usize,
    pub stem_stride: usize,
    pub stem_padding: usize,
    pub stage_channels: Vec<usize>,
    pub blocks_per_stage: Vec<usize>,
    pub batch_norm_eps: f32,
}

/// Étage de capsules convolutif : `num_capsules * capsule_dim` canaux de sortie.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapsuleConfig {
    pub num_capsules: usize,
    pub capsule_dim: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigitCapsConfig {
    pub num_capsules: usize,
    pub capsule_dim: usize,
    pub routing_iterations: usize,
}

/// Géométrie complète de l'encodeur (entrées carrées uniquement).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub input_size: usize,
    pub backbone: BackboneConfig,
    pub primary: CapsuleConfig,
    pub digit: DigitCapsConfig,
}

/// Ce qu'il faut pour construire un [`InferenceContext`](crate::inference::InferenceContext).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    pub model_path: PathBuf,
    pub reference_path: PathBuf,
    #[serde(default)]
    pub network: NetworkConfig,
}

pub(crate) fn conv_output_size(size: usize, kernel: usize, stride: usize, padding: usize) -> Option<usize> {
    let padded = size + 2 * padding;
    if stride == 0 || padded < kernel {
        return None;
    }
    Some((padded - kernel) / stride + 1)
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            input_channels: 1,
            stem_channels: 64,
            stem_kernel: 7,
            stem_stride: 2,
            stem_padding: 3,
            stage_channels: vec![64, 128, 256, 512],
            blocks_per_stage: vec![2, 2, 2, 2],
            batch_norm_eps: 1e-5,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            input_size: 224,
            backbone: BackboneConfig::default(),
            primary: CapsuleConfig {
                num_capsules: 32,
                capsule_dim: 8,
                kernel_size: 3,
                stride: 1,
                padding: 1,
            },
            digit: DigitCapsConfig {
                num_capsules: 4,
                capsule_dim: 16,
                routing_iterations: 3,
            },
        }
    }
}

impl BackboneConfig {
    pub fn output_channels(&self) -> usize {
        self.stage_channels.last().copied().unwrap_or(self.stem_channels)
    }

    /// Côté de la carte de caractéristiques pour une entrée carrée de côté `input_size`.
    pub fn output_size(&self, input_size: usize) -> Option<usize> {
        let stem = conv_output_size(input_size, self.stem_kernel, self.stem_stride, self.stem_padding)?;
        // max-pool 3x3, stride 2, padding 1
        let mut size = conv_output_size(stem, 3, 2, 1)?;
        // chaque étage après le premier divise la grille par deux
        for _ in 1..self.stage_channels.len() {
            size = conv_output_size(size, 3, 2, 1)?;
        }
        Some(size)
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_channels == 0 || self.stem_channels == 0 {
            return Err(CapsNetError::Config("les canaux du backbone doivent être positifs".into()));
        }
        if self.stage_channels.is_empty() {
            return Err(CapsNetError::Config("le backbone doit avoir au moins un étage".into()));
        }
        if self.stage_channels.len() != self.blocks_per_stage.len() {
            return Err(CapsNetError::Config(format!(
                "{} stage widths but {} block counts",
                self.stage_channels.len(),
                self.blocks_per_stage.len()
            )));
        }
        if self.stage_channels.iter().any(|&c| c == 0) || self.blocks_per_stage.iter().any(|&b| b == 0) {
            return Err(CapsNetError::Config("largeurs d'étage et nombres de blocs doivent être positifs".into()));
        }
        if !(self.batch_norm_eps > 0.0) {
            return Err(CapsNetError::Config("batch_norm_eps doit être positif".into()));
        }
        Ok(())
    }
}

impl CapsuleConfig {
    pub fn out_channels(&self) -> usize {
        self.num_capsules * self.capsule_dim
    }
}

impl NetworkConfig {
    pub fn feature_size(&self) -> Option<usize> {
        self.backbone.output_size(self.input_size)
    }

    /// Côté de la grille des capsules primaires.
    pub fn primary_grid_size(&self) -> Option<usize> {
        conv_output_size(
            self.feature_size()?,
            self.primary.kernel_size,
            self.primary.stride,
            self.primary.padding,
        )
    }

    /// Nombre de capsules primaires routées vers chaque capsule de classe.
    pub fn num_primary_capsules(&self) -> usize {
        let grid = self.primary_grid_size().unwrap_or(0);
        self.primary.num_capsules * grid * grid
    }

    pub fn num_classes(&self) -> usize {
        self.digit.num_capsules
    }

    pub fn validate(&self) -> Result<()> {
        self.backbone.validate()?;

        if self.input_size == 0 {
            return Err(CapsNetError::Config("input_size doit être positif".into()));
        }
        if self.primary.num_capsules == 0 || self.primary.capsule_dim == 0 {
            return Err(CapsNetError::Config("capsules primaires : nombre et dimension doivent être positifs".into()));
        }
        if self.primary.stride == 0 || self.primary.kernel_size == 0 {
            return Err(CapsNetError::Config("capsules primaires : noyau et stride doivent être positifs".into()));
        }
        if self.digit.num_capsules == 0 || self.digit.capsule_dim == 0 {
            return Err(CapsNetError::Config("capsules de classe : nombre et dimension doivent être positifs".into()));
        }
        if self.digit.routing_iterations == 0 {
            return Err(CapsNetError::Config("le routage demande au moins une itération".into()));
        }
        match self.primary_grid_size() {
            Some(grid) if grid > 0 => Ok(()),
            _ => Err(CapsNetError::Config(format!(
                "input of side {} collapses before the primary capsule stage",
                self.input_size
            ))),
        }
    }
}

impl ClassifierConfig {
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let config: Self = serde_json::from_slice(data)?;
        config.network.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path)?;
        Self::from_json(&data)
    }
}

/// Petite géométrie pour les tests : entrée 64x64, grille primaire 2x2.
#[cfg(test)]
pub(crate) fn compact_config() -> NetworkConfig {
    NetworkConfig {
        input_size: 64,
        backbone: BackboneConfig {
            input_channels: 1,
            stem_channels: 8,
            stem_kernel: 7,
            stem_stride: 2,
            stem_padding: 3,
            stage_channels: vec![8, 8, 16, 16],
            blocks_per_stage: vec![1, 1, 1, 1],
            batch_norm_eps: 1e-5,
        },
        primary: CapsuleConfig {
            num_capsules: 4,
            capsule_dim: 8,
            kernel_size: 3,
            stride: 1,
            padding: 1,
        },
        digit: DigitCapsConfig {
            num_capsules: 4,
            capsule_dim: 16,
            routing_iterations: 3,
        },
    }
}
