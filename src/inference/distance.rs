use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};

use super::labels::{ClassLabel, NUM_CLASSES};
use super::reference::ReferenceSet;
use crate::error::{CapsNetError, Result};

/// Décalage ajouté à chaque différence avant la norme : deux vecteurs
/// identiques restent à une distance positive minime.
pub const PAIRWISE_EPSILON: f32 = 1e-6;
/// Epsilon des poids en inverse de la distance.
pub const DISTANCE_EPSILON: f32 = 1e-8;

/// Résultat de la comparaison d'un embedding avec les références.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub label: ClassLabel,
    /// Distance moyenne aux exemplaires de chaque classe, dans l'ordre des classes.
    pub mean_distances: [f32; NUM_CLASSES],
    /// Pourcentages en inverse de la distance ; somme = 100.
    pub closeness: [f32; NUM_CLASSES],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassScore {
    pub class: ClassLabel,
    pub score: f64,
}

/// Réponse sérialisée : nom de classe et scores arrondis à deux décimales.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub prediction: ClassLabel,
    pub closeness: Vec<ClassScore>,
}

impl Prediction {
    pub fn scores(&self) -> impl Iterator<Item = (ClassLabel, f32)> + '_ {
        ClassLabel::ALL.iter().copied().zip(self.closeness.iter().copied())
    }

    pub fn to_response(&self) -> PredictionResponse {
        PredictionResponse {
            prediction: self.label,
            closeness: self
                .scores()
                .map(|(class, score)| ClassScore {
                    class,
                    score: round2(score as f64),
                })
                .collect(),
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// `||x - y + ε||₂`, distance utilisée pour comparer aux références.
pub fn pairwise_distance(x: &ArrayView1<f32>, y: &ArrayView1<f32>) -> Result<f32> {
    if x.len() != y.len() {
        return Err(CapsNetError::DimensionMismatch {
            expected: y.len(),
            actual: x.len(),
        });
    }
    let squared: f32 = x
        .iter()
        .zip(y.iter())
        .map(|(a, b)| {
            let d = a - b + PAIRWISE_EPSILON;
            d * d
        })
        .sum();
    Ok(squared.sqrt())
}

/// Distance moyenne de `query` aux exemplaires de chaque classe.
pub fn mean_distances(query: &ArrayView1<f32>, references: &ReferenceSet) -> Result<[f32; NUM_CLASSES]> {
    if query.len() != references.dim() {
        return Err(CapsNetError::DimensionMismatch {
            expected: references.dim(),
            actual: query.len(),
        });
    }

    let mut means = [0.0; NUM_CLASSES];
    for (class, exemplars) in references.iter() {
        if exemplars.is_empty() {
            return Err(CapsNetError::EmptyReferenceClass(class));
        }
        let total = exemplars
            .iter()
            .map(|r| pairwise_distance(query, &r.view()))
            .sum::<Result<f32>>()?;
        means[class] = total / exemplars.len() as f32;
    }
    Ok(means)
}

/// `100 · w_c / Σ w` with `w_c = 1 / (d_c + ε)`.
pub fn closeness(mean_distances: &[f32; NUM_CLASSES]) -> [f32; NUM_CLASSES] {
    let weights = mean_distances.map(|d| 1.0 / (d + DISTANCE_EPSILON));
    let total: f32 = weights.iter().sum();
    weights.map(|w| 100.0 * w / total)
}

/// Indice de la plus petite distance ; en cas d'égalité, le premier gagne.
pub fn nearest_class(mean_distances: &[f32; NUM_CLASSES]) -> usize {
    mean_distances
        .iter()
        .enumerate()
        .fold(0, |best, (class, &d)| if d < mean_distances[best] { class } else { best })
}

/// Règle de décision : classe la plus proche en distance moyenne, plus les scores.
pub fn decide(query: &ArrayView1<f32>, references: &ReferenceSet) -> Result<Prediction> {
    let means = mean_distances(query, references)?;
    let label = ClassLabel::ALL[nearest_class(&means)];
    Ok(Prediction {
        label,
        mean_distances: means,
        closeness: closeness(&means),
    })
}
