use ndarray::{Array3, Array4, ArrayView3, ArrayView4, Axis};
use rayon::prelude::*;

use super::layers::squash;
use crate::error::{CapsNetError, Result};

/// Routage dynamique par agreement entre capsules primaires et capsules de classe.
///
/// Les tenseurs suivent la forme des prédictions `û` :
/// `(batch, num_primary, num_digit, digit_dim)`. Logits et coefficients de
/// couplage gardent cette forme avec un dernier axe unitaire.
#[derive(Debug, Clone, Copy)]
pub struct DynamicRouting {
    pub num_iterations: usize,
}

/// Accumulateur des itérations de routage.
#[derive(Debug, Clone)]
pub struct RoutingState {
    /// `b_ij`, remis à zéro à chaque appel
    pub logits: Array4<f32>,
    /// `c_ij = softmax_j(b_ij)`
    pub coupling: Array4<f32>,
    /// `v_j`, forme `(batch, num_digit, digit_dim)`
    pub outputs: Array3<f32>,
}

/// Capsules finales et coefficients de couplage de chaque itération.
#[derive(Debug, Clone)]
pub struct RoutingTrace {
    pub outputs: Array3<f32>,
    pub coupling_history: Vec<Array4<f32>>,
    pub final_logits: Array4<f32>,
}

impl RoutingState {
    fn zeros(batch_size: usize, input_caps: usize, output_caps: usize, dim: usize) -> Self {
        Self {
            logits: Array4::zeros((batch_size, input_caps, output_caps, 1)),
            coupling: Array4::zeros((batch_size, input_caps, output_caps, 1)),
            outputs: Array3::zeros((batch_size, output_caps, dim)),
        }
    }
}

impl DynamicRouting {
    pub fn new(num_iterations: usize) -> Self {
        Self { num_iterations }
    }

    pub fn route(&self, predictions: &ArrayView4<f32>) -> Result<Array3<f32>> {
        Ok(self.route_with_trace(predictions)?.outputs)
    }

    /// Exactement `num_iterations` itérations, sans arrêt anticipé.
    pub fn route_with_trace(&self, predictions: &ArrayView4<f32>) -> Result<RoutingTrace> {
        let (batch_size, input_caps, output_caps, dim) = predictions.dim();
        if input_caps == 0 || output_caps == 0 || dim == 0 {
            return Err(CapsNetError::shape(
                "prédictions du routage",
                "(batch, primaires, classes, dim) non vide",
                predictions.dim(),
            ));
        }

        let mut coupling_history = Vec::with_capacity(self.num_iterations);
        let initial = RoutingState::zeros(batch_size, input_caps, output_caps, dim);

        let state = (0..self.num_iterations).try_fold(initial, |state, _| {
            let next = self.step(predictions, state)?;
            coupling_history.push(next.coupling.clone());
            Ok::<_, CapsNetError>(next)
        })?;

        Ok(RoutingTrace {
            outputs: state.outputs,
            coupling_history,
            final_logits: state.logits,
        })
    }

    /// Une itération : softmax, somme pondérée, squash, mise à jour par agreement.
    pub fn step(&self, predictions: &ArrayView4<f32>, state: RoutingState) -> Result<RoutingState> {
        let coupling = self.softmax(&state.logits.view());
        let weighted = self.weighted_sum(predictions, &coupling.view());
        let outputs = squash(&weighted.view(), Axis(2))?;
        let logits = state.logits + self.agreement(predictions, &outputs.view());

        Ok(RoutingState {
            logits,
            coupling,
            outputs,
        })
    }

    /// Softmax parallélisé sur l'axe des capsules de sortie.
    fn softmax(&self, logits: &ArrayView4<f32>) -> Array4<f32> {
        let mut result = Array4::zeros(logits.dim());

        result
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(logits.axis_iter(Axis(0)).into_par_iter())
            .for_each(|(mut out_batch, in_batch)| {
                for (mut out_row, in_row) in out_batch.outer_iter_mut().zip(in_batch.outer_iter()) {
                    let max_val = in_row.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
                    let mut exp_sum = 0.0;
                    for (dst, &src) in out_row.iter_mut().zip(in_row.iter()) {
                        *dst = (src - max_val).exp();
                        exp_sum += *dst;
                    }
                    out_row.mapv_inplace(|v| v / exp_sum);
                }
            });

        result
    }

    /// `s_j = Σ_i c_ij · û_ij`
    fn weighted_sum(&self, predictions: &ArrayView4<f32>, coupling: &ArrayView4<f32>) -> Array3<f32> {
        let (batch_size, input_caps, output_caps, dim) = predictions.dim();
        let mut outputs = Array3::zeros((batch_size, output_caps, dim));

        outputs
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut output_batch)| {
                for ic in 0..input_caps {
                    for oc in 0..output_caps {
                        let coeff = coupling[[b, ic, oc, 0]];
                        for d in 0..dim {
                            output_batch[[oc, d]] += coeff * predictions[[b, ic, oc, d]];
                        }
                    }
                }
            });

        outputs
    }

    /// `a_ij = û_ij · v_j`
    fn agreement(&self, predictions: &ArrayView4<f32>, outputs: &ArrayView3<f32>) -> Array4<f32> {
        let (batch_size, input_caps, output_caps, dim) = predictions.dim();
        let mut agreement = Array4::zeros((batch_size, input_caps, output_caps, 1));

        agreement
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut agreement_batch)| {
                for ic in 0..input_caps {
                    for oc in 0..output_caps {
                        let mut dot = 0.0;
                        for d in 0..dim {
                            dot += predictions[[b, ic, oc, d]] * outputs[[b, oc, d]];
                        }
                        agreement_batch[[ic, oc, 0]] = dot;
                    }
                }
            });

        agreement
    }
}
