use ndarray::{Array1, Array3, Array4, ArrayD, Axis, Ix4};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use super::labels::NUM_CLASSES;
use crate::error::{CapsNetError, Result};
use crate::model::core::CapNet;
use crate::model::weights::{read_tensors, write_tensors, NamedTensor};

/// Un exemplaire stocké, typé une fois à la lecture de l'artefact.
#[derive(Debug, Clone, PartialEq)]
pub enum ReferenceEntry {
    /// Batch d'images prétraitées `(B, C, size, size)`, passé dans l'encodeur.
    RawImage(Array4<f32>),
    /// Embedding précalculé, aplati tel quel.
    PrecomputedEmbedding(Array1<f32>),
}

impl ReferenceEntry {
    /// Un tenseur 4-D dont les deux derniers axes valent la taille d'entrée est
    /// une image ; tout le reste est un embedding.
    pub fn classify(tensor: ArrayD<f32>, input_size: usize) -> Result<Self> {
        let shape = tensor.shape().to_vec();
        if shape.len() == 4 && shape[2] == input_size && shape[3] == input_size {
            let image = tensor
                .into_dimensionality::<Ix4>()
                .map_err(|e| CapsNetError::shape("image de référence", "tenseur 4-D", e))?;
            Ok(Self::RawImage(image))
        } else {
            Ok(Self::PrecomputedEmbedding(tensor.iter().copied().collect()))
        }
    }

    /// Résout l'entrée en vecteur d'embedding plat.
    pub fn normalize(self, encoder: &CapNet) -> Result<Array1<f32>> {
        match self {
            Self::RawImage(image) => {
                let norms = encoder.forward(&image.view())?;
                Ok(norms.iter().copied().collect())
            }
            Self::PrecomputedEmbedding(embedding) => Ok(embedding),
        }
    }

    pub fn is_raw_image(&self) -> bool {
        matches!(self, Self::RawImage(_))
    }

    /// Ajoute l'axe batch à une image `(C, H, W)`.
    pub fn raw_from_chw(image: Array3<f32>) -> Self {
        Self::RawImage(image.insert_axis(Axis(0)))
    }
}

/// Exemplaires groupés par classe, avant passage dans l'encodeur.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferenceArtifact {
    pub entries: BTreeMap<usize, Vec<ReferenceEntry>>,
}

impl ReferenceArtifact {
    /// Lit les tenseurs `<classe>.<indice>`, triés par indice dans chaque classe.
    pub fn from_safetensors(bytes: &[u8], input_size: usize) -> Result<Self> {
        let tensors = read_tensors(bytes, |_| false)?;

        let mut keyed: Vec<((usize, usize), NamedTensor)> = tensors
            .into_iter()
            .map(|tensor| Ok((parse_reference_name(&tensor.name)?, tensor)))
            .collect::<Result<_>>()?;
        keyed.sort_by_key(|(key, _)| *key);

        let mut entries: BTreeMap<usize, Vec<ReferenceEntry>> = BTreeMap::new();
        for ((class, _), tensor) in keyed {
            let entry = ReferenceEntry::classify(tensor.into_array()?, input_size)?;
            entries.entry(class).or_default().push(entry);
        }

        Ok(Self { entries })
    }

    pub fn load(path: impl AsRef<Path>, input_size: usize) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let artifact = Self::from_safetensors(&bytes, input_size)?;
        debug!(
            path = %path.as_ref().display(),
            raw_images = artifact.entries.values().flatten().filter(|e| e.is_raw_image()).count(),
            "artefact de référence lu"
        );
        Ok(artifact)
    }

    /// Encode les images brutes avec `encoder` et aplatit les vecteurs précalculés.
    pub fn resolve(self, encoder: &CapNet) -> Result<ReferenceSet> {
        let classes = self
            .entries
            .into_iter()
            .map(|(class, entries)| {
                let vectors = entries
                    .into_iter()
                    .map(|entry| entry.normalize(encoder))
                    .collect::<Result<Vec<_>>>()?;
                Ok((class, vectors))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;

        ReferenceSet::new(classes)
    }
}

fn parse_reference_name(name: &str) -> Result<(usize, usize)> {
    let parsed = name
        .split_once('.')
        .and_then(|(class, index)| Some((class.parse().ok()?, index.parse().ok()?)));
    match parsed {
        Some((class, index)) if class < NUM_CLASSES => Ok((class, index)),
        _ => Err(CapsNetError::Artifact(format!(
            "le tenseur de référence {name:?} n'est pas nommé <classe 0-{}>.<indice>",
            NUM_CLASSES - 1
        ))),
    }
}

/// Embeddings de référence par classe : toutes les classes présentes et non
/// vides, une seule dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceSet {
    classes: Vec<Vec<Array1<f32>>>,
    dim: usize,
}

impl ReferenceSet {
    pub fn new(mut classes: BTreeMap<usize, Vec<Array1<f32>>>) -> Result<Self> {
        if let Some(&class) = classes.keys().find(|&&c| c >= NUM_CLASSES) {
            return Err(CapsNetError::Artifact(format!("classe de référence {class} hors limites")));
        }

        let mut ordered = Vec::with_capacity(NUM_CLASSES);
        for class in 0..NUM_CLASSES {
            let vectors = classes.remove(&class).unwrap_or_default();
            if vectors.is_empty() {
                return Err(CapsNetError::EmptyReferenceClass(class));
            }
            ordered.push(vectors);
        }

        let dim = ordered[0][0].len();
        for vector in ordered.iter().flatten() {
            if vector.len() != dim {
                return Err(CapsNetError::DimensionMismatch {
                    expected: dim,
                    actual: vector.len(),
                });
            }
        }

        Ok(Self { classes: ordered, dim })
    }

    pub fn load(path: impl AsRef<Path>, encoder: &CapNet) -> Result<Self> {
        let path = path.as_ref();
        let set = ReferenceArtifact::load(path, encoder.network_config.input_size)?.resolve(encoder)?;
        info!(
            path = %path.display(),
            exemplars = ?set.class_sizes(),
            dim = set.dim(),
            "embeddings de référence chargés"
        );
        Ok(set)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn class(&self, class: usize) -> &[Array1<f32>] {
        &self.classes[class]
    }

    pub fn class_sizes(&self) -> Vec<usize> {
        self.classes.iter().map(Vec::len).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &[Array1<f32>])> {
        self.classes.iter().enumerate().map(|(c, v)| (c, v.as_slice()))
    }

    /// Écrit chaque exemplaire comme vecteur précalculé `<classe>.<indice>`.
    pub fn to_safetensors(&self) -> Result<Vec<u8>> {
        let tensors: Vec<NamedTensor> = self
            .iter()
            .flat_map(|(class, vectors)| {
                vectors
                    .iter()
                    .enumerate()
                    .map(move |(index, v)| NamedTensor::from_array(format!("{class}.{index}"), &v.view()))
            })
            .collect();
        write_tensors(&tensors)
    }
}
