//! Conteneurs de paramètres au format safetensors.
//!
//! Les noms suivent les chemins PyTorch du réseau siamois
//! (`capsule_net.cnn.0.weight`, `capsule_net.digit_capsules.W`, ...). Un
//! checkpoint peut aussi tout imbriquer sous `model_state_dict.` ; les deux
//! formats donnent le même [`StateDict`].

use half::{bf16, f16};
use ndarray::{Array1, Array4, ArrayD, IxDyn};
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tracing::{debug, info};

use super::config::Activation;
use super::layers::{BatchNorm2d, ConvLayer};
use crate::error::{CapsNetError, Result};

/// Préfixe du format de checkpoint imbriqué.
pub const WRAPPED_PREFIX: &str = "model_state_dict.";

/// Un tenseur lu depuis un artefact, converti en f32.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl NamedTensor {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self {
            name: name.into(),
            shape,
            data,
        }
    }

    pub fn from_array<D: ndarray::Dimension>(name: impl Into<String>, array: &ndarray::ArrayView<f32, D>) -> Self {
        Self::new(name, array.shape().to_vec(), array.iter().copied().collect())
    }

    pub fn into_array(self) -> Result<ArrayD<f32>> {
        let name = self.name;
        ArrayD::from_shape_vec(IxDyn(&self.shape), self.data)
            .map_err(|e| CapsNetError::Artifact(format!("{name}: {e}")))
    }
}

/// Lit tous les tenseurs d'un buffer safetensors ; les flottants F64, F16 et
/// BF16 sont convertis en f32. Les entiers ne sont ignorés que si
/// `skip_non_float` accepte leur nom.
pub fn read_tensors(bytes: &[u8], skip_non_float: impl Fn(&str) -> bool) -> Result<Vec<NamedTensor>> {
    let tensors = SafeTensors::deserialize(bytes)
        .map_err(|e| CapsNetError::Artifact(format!("lecture safetensors impossible : {e}")))?;

    let mut out = Vec::with_capacity(tensors.len());
    for (name, view) in tensors.tensors() {
        let data = match decode_floats(view.dtype(), view.data()) {
            Some(data) => data,
            None if skip_non_float(&name) => continue,
            None => {
                return Err(CapsNetError::Artifact(format!(
                    "le tenseur {name} est de type {:?}, type flottant attendu",
                    view.dtype()
                )))
            }
        };
        out.push(NamedTensor::new(name, view.shape().to_vec(), data));
    }

    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

fn decode_floats(dtype: Dtype, raw: &[u8]) -> Option<Vec<f32>> {
    let data = match dtype {
        Dtype::F32 => raw
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        Dtype::F64 => raw
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32)
            .collect(),
        Dtype::F16 => raw
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        Dtype::BF16 => raw
            .chunks_exact(2)
            .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        _ => return None,
    };
    Some(data)
}

/// Sérialise les tenseurs au format safetensors.
pub fn write_tensors(tensors: &[NamedTensor]) -> Result<Vec<u8>> {
    let bytes: Vec<(String, Vec<usize>, Vec<u8>)> = tensors
        .iter()
        .map(|t| {
            let raw = t.data.iter().flat_map(|v| v.to_le_bytes()).collect();
            (t.name.clone(), t.shape.clone(), raw)
        })
        .collect();

    let views = bytes
        .iter()
        .map(|(name, shape, raw)| {
            TensorView::new(Dtype::F32, shape.clone(), raw)
                .map(|view| (name.clone(), view))
                .map_err(|e| CapsNetError::Artifact(format!("{name}: {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    safetensors::serialize(views, &None).map_err(|e| CapsNetError::Artifact(e.to_string()))
}

/// Table nom -> tenseur, immuable une fois chargée.
#[derive(Debug, Clone, Default)]
pub struct StateDict {
    tensors: BTreeMap<String, NamedTensor>,
}

impl StateDict {
    /// Normalise les deux formats : si un nom porte [`WRAPPED_PREFIX`], seules
    /// les entrées imbriquées sont gardées, sans le préfixe.
    pub fn from_tensors(tensors: impl IntoIterator<Item = NamedTensor>) -> Self {
        let tensors: Vec<NamedTensor> = tensors.into_iter().collect();
        let wrapped = tensors.iter().any(|t| t.name.starts_with(WRAPPED_PREFIX));

        let tensors = tensors
            .into_iter()
            .filter_map(|mut t| {
                if wrapped {
                    let inner = t.name.strip_prefix(WRAPPED_PREFIX)?.to_string();
                    t.name = inner;
                }
                Some((t.name.clone(), t))
            })
            .collect();

        Self { tensors }
    }

    pub fn from_safetensors(bytes: &[u8]) -> Result<Self> {
        let tensors = read_tensors(bytes, |name| name.ends_with("num_batches_tracked"))?;
        let dict = Self::from_tensors(tensors);
        debug!(tensors = dict.len(), "state dict lu");
        Ok(dict)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let dict = Self::from_safetensors(&bytes)?;
        info!(path = %path.display(), tensors = dict.len(), "poids du modèle chargés");
        Ok(dict)
    }

    pub fn to_safetensors(&self) -> Result<Vec<u8>> {
        let tensors: Vec<NamedTensor> = self.tensors.values().cloned().collect();
        write_tensors(&tensors)
    }

    /// Mêmes tenseurs imbriqués sous [`WRAPPED_PREFIX`].
    pub fn wrapped(&self) -> Vec<NamedTensor> {
        self.tensors
            .values()
            .map(|t| NamedTensor::new(format!("{WRAPPED_PREFIX}{}", t.name), t.shape.clone(), t.data.clone()))
            .collect()
    }

    pub fn insert(&mut self, tensor: NamedTensor) {
        self.tensors.insert(tensor.name.clone(), tensor);
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&NamedTensor> {
        self.tensors.get(name)
    }
}

/// Extrait les paramètres d'un [`StateDict`] en vérifiant les formes et en
/// notant les noms consommés.
pub struct WeightLoader<'a> {
    dict: &'a StateDict,
    consumed: HashSet<String>,
}

impl<'a> WeightLoader<'a> {
    pub fn new(dict: &'a StateDict) -> Self {
        Self {
            dict,
            consumed: HashSet::new(),
        }
    }

    pub fn tensor(&mut self, name: &str, expected: &[usize]) -> Result<Vec<f32>> {
        let tensor = self
            .dict
            .get(name)
            .ok_or_else(|| CapsNetError::MissingTensor(name.to_string()))?;
        if tensor.shape != expected {
            return Err(CapsNetError::ArtifactShape {
                name: name.to_string(),
                expected: expected.to_vec(),
                actual: tensor.shape.clone(),
            });
        }
        self.consumed.insert(name.to_string());
        Ok(tensor.data.clone())
    }

    pub fn array1(&mut self, name: &str, len: usize) -> Result<Array1<f32>> {
        Ok(Array1::from_vec(self.tensor(name, &[len])?))
    }

    /// Lit un tenseur stocké en `stored` et le voit en 4-D `shape`.
    pub fn array4_as(&mut self, name: &str, stored: &[usize], shape: (usize, usize, usize, usize)) -> Result<Array4<f32>> {
        let data = self.tensor(name, stored)?;
        Array4::from_shape_vec(shape, data).map_err(|e| CapsNetError::Artifact(format!("{name}: {e}")))
    }

    pub fn array4(&mut self, name: &str, shape: (usize, usize, usize, usize)) -> Result<Array4<f32>> {
        self.array4_as(name, &[shape.0, shape.1, shape.2, shape.3], shape)
    }

    pub fn conv(
        &mut self,
        prefix: &str,
        shape: (usize, usize, usize, usize),
        stride: usize,
        padding: usize,
        activation: Activation,
        with_bias: bool,
    ) -> Result<ConvLayer> {
        let weights = self.array4(&format!("{prefix}.weight"), shape)?;
        let biases = if with_bias {
            Some(self.array1(&format!("{prefix}.bias"), shape.0)?)
        } else {
            None
        };
        ConvLayer::from_parts(weights, biases, stride, padding, activation)
    }

    pub fn batch_norm(&mut self, prefix: &str, channels: usize, eps: f32) -> Result<BatchNorm2d> {
        Ok(BatchNorm2d {
            gamma: self.array1(&format!("{prefix}.weight"), channels)?,
            beta: self.array1(&format!("{prefix}.bias"), channels)?,
            running_mean: self.array1(&format!("{prefix}.running_mean"), channels)?,
            running_var: self.array1(&format!("{prefix}.running_var"), channels)?,
            eps,
        })
    }

    /// Échoue si l'artefact contient des paramètres inconnus de l'architecture.
    pub fn finish(self) -> Result<()> {
        let unexpected: Vec<&str> = self
            .dict
            .names()
            .filter(|name| !self.consumed.contains(*name))
            .collect();
        if unexpected.is_empty() {
            Ok(())
        } else {
            Err(CapsNetError::Artifact(format!(
                "tenseurs inattendus pour cette architecture : {}",
                unexpected.join(", ")
            )))
        }
    }
}
