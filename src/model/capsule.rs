use ndarray::{s, Array3, Array4, ArrayView3, ArrayView4, Axis};
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use rand::Rng;
use rayon::prelude::*;
use tracing::debug;

use super::config::{Activation, CapsuleConfig};
use super::layers::{squash, ConvLayer};
use super::routing::{DynamicRouting, RoutingTrace};
use crate::error::{CapsNetError, Result};

/// Capsules primaires : une convolution dont les canaux sont regroupés en
/// `num_capsules` vecteurs de dimension `capsule_dim` par position.
#[derive(Debug, Clone)]
pub struct PrimaryCapsLayer {
    pub conv: ConvLayer,
    pub num_capsules: usize,
    pub capsule_dim: usize,
}

impl PrimaryCapsLayer {
    pub fn new<R: Rng + ?Sized>(in_channels: usize, config: &CapsuleConfig, rng: &mut R) -> Result<Self> {
        let conv = ConvLayer::new(
            in_channels,
            config.out_channels(),
            config.kernel_size,
            config.stride,
            config.padding,
            Activation::ReLU,
            true,
            rng,
        )?;
        Self::from_conv(conv, config.num_capsules, config.capsule_dim)
    }

    pub fn from_conv(conv: ConvLayer, num_capsules: usize, capsule_dim: usize) -> Result<Self> {
        if conv.out_channels() != num_capsules * capsule_dim {
            return Err(CapsNetError::shape(
                "conv des capsules primaires",
                format!("{} canaux de sortie", num_capsules * capsule_dim),
                conv.weights.dim(),
            ));
        }
        if conv.activation != Activation::ReLU {
            return Err(CapsNetError::Config("la conv des capsules primaires doit appliquer ReLU".into()));
        }
        Ok(Self {
            conv,
            num_capsules,
            capsule_dim,
        })
    }

    /// `(batch, C, H, W)` -> `(batch, num_capsules * H' * W', capsule_dim)`.
    ///
    /// Le canal `cap * capsule_dim + d` porte la composante `d` de la capsule `cap` ;
    /// ordre des instances : position d'abord, `(y * W' + x) * num_capsules + cap`.
    pub fn forward(&self, input: &ArrayView4<f32>) -> Result<Array3<f32>> {
        let conv_output = self.conv.forward(input)?;
        let (batch_size, _, out_height, out_width) = conv_output.dim();
        let num_caps = self.num_capsules;
        let dim = self.capsule_dim;

        let capsules = Array3::from_shape_fn(
            (batch_size, out_height * out_width * num_caps, dim),
            |(b, instance, d)| {
                let spatial = instance / num_caps;
                let cap = instance % num_caps;
                conv_output[[b, cap * dim + d, spatial / out_width, spatial % out_width]]
            },
        );

        debug!(
            grid = out_height * out_width,
            instances = capsules.dim().1,
            "capsules primaires"
        );
        squash(&capsules.view(), Axis(2))
    }
}

/// Capsules de classe obtenues par routage dynamique depuis les capsules primaires.
#[derive(Debug, Clone)]
pub struct DigitCapsLayer {
    pub routing: DynamicRouting,
    /// `W`, shape `(num_primary, num_digit, digit_dim, primary_dim)`
    pub weights: Array4<f32>,
}

impl DigitCapsLayer {
    pub fn new<R: Rng + ?Sized>(
        primary_capsules: usize,
        primary_capsule_dim: usize,
        digit_capsules: usize,
        digit_capsule_dim: usize,
        routing_iterations: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let normal = Normal::new(0.0_f32, 0.01).map_err(|e| CapsNetError::Config(e.to_string()))?;
        let weights = Array4::random_using(
            (primary_capsules, digit_capsules, digit_capsule_dim, primary_capsule_dim),
            normal,
            rng,
        );
        Ok(Self::from_weights(weights, routing_iterations))
    }

    pub fn from_weights(weights: Array4<f32>, routing_iterations: usize) -> Self {
        Self {
            routing: DynamicRouting::new(routing_iterations),
            weights,
        }
    }

    pub fn num_primary(&self) -> usize {
        self.weights.dim().0
    }

    pub fn num_capsules(&self) -> usize {
        self.weights.dim().1
    }

    pub fn capsule_dim(&self) -> usize {
        self.weights.dim().2
    }

    /// Vecteurs de prédiction `û_ij = W_ij · u_i`, forme `(batch, num_primary, num_digit, digit_dim)`.
    pub fn predictions(&self, primary_capsules: &ArrayView3<f32>) -> Result<Array4<f32>> {
        let (num_primary, num_digit, digit_dim, primary_dim) = self.weights.dim();
        let (batch_size, input_caps, input_dim) = primary_capsules.dim();
        if input_caps != num_primary || input_dim != primary_dim {
            return Err(CapsNetError::shape(
                "entrée des capsules de classe",
                format!("(batch, {num_primary}, {primary_dim})"),
                primary_capsules.dim(),
            ));
        }

        let mut predictions = Array4::zeros((batch_size, num_primary, num_digit, digit_dim));
        predictions
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut batch_predictions)| {
                for i in 0..num_primary {
                    let u = primary_capsules.slice(s![b, i, ..]);
                    for j in 0..num_digit {
                        let transformed = self.weights.slice(s![i, j, .., ..]).dot(&u);
                        batch_predictions.slice_mut(s![i, j, ..]).assign(&transformed);
                    }
                }
            });

        Ok(predictions)
    }

    /// `(batch, num_primary, primary_dim)` -> `(batch, num_digit, digit_dim)`.
    pub fn forward(&self, primary_capsules: &ArrayView3<f32>) -> Result<Array3<f32>> {
        let predictions = self.predictions(primary_capsules)?;
        self.routing.route(&predictions.view())
    }

    pub fn forward_with_trace(&self, primary_capsules: &ArrayView3<f32>) -> Result<RoutingTrace> {
        let predictions = self.predictions(primary_capsules)?;
        self.routing.route_with_trace(&predictions.view())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array1;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn primary_config() -> CapsuleConfig {
        CapsuleConfig {
            num_capsules: 4,
            capsule_dim: 8,
            kernel_size: 3,
            stride: 1,
            padding: 1,
        }
    }

    #[test]
    fn primary_capsule_count_and_bounds() {
        let mut rng = StdRng::seed_from_u64(21);
        let layer = PrimaryCapsLayer::new(16, &primary_config(), &mut rng).unwrap();
        let input = Array4::from_shape_fn((2, 16, 3, 3), |(b, c, h, w)| ((b + c + h * w) % 5) as f32 * 0.2);

        let capsules = layer.forward(&input.view()).unwrap();
        assert_eq!(capsules.dim(), (2, 4 * 3 * 3, 8));
        for capsule in capsules.lanes(Axis(2)) {
            assert!(capsule.dot(&capsule).sqrt() < 1.0);
        }
    }

    #[test]
    fn primary_instances_are_spatial_major() {
        // conv 1x1 quasi identité : le canal k copie le canal d'entrée k
        let mut weights = Array4::zeros((8, 8, 1, 1));
        for k in 0..8 {
            weights[[k, k, 0, 0]] = 1.0;
        }
        let conv = ConvLayer::from_parts(weights, Some(Array1::zeros(8)), 1, 0, Activation::ReLU).unwrap();
        let layer = PrimaryCapsLayer::from_conv(conv, 2, 4).unwrap();

        // position (0,1), capsule 1, composante 2 -> canal 6
        let mut input = Array4::zeros((1, 8, 1, 2));
        input[[0, 6, 0, 1]] = 3.0;

        let capsules = layer.forward(&input.view()).unwrap();
        assert_eq!(capsules.dim(), (1, 4, 4));
        let instance = 1 * 2 + 1;
        assert_abs_diff_eq!(capsules[[0, instance, 2]], 9.0 / 10.0, epsilon = 1e-5);
        assert_eq!(capsules.iter().filter(|v| **v != 0.0).count(), 1);
    }

    #[test]
    fn primary_rejects_wrong_channel_count() {
        let mut rng = StdRng::seed_from_u64(2);
        let layer = PrimaryCapsLayer::new(16, &primary_config(), &mut rng).unwrap();
        let input = Array4::zeros((1, 12, 3, 3));
        assert!(matches!(layer.forward(&input.view()), Err(CapsNetError::Shape { .. })));
    }

    #[test]
    fn digit_capsules_shape_and_determinism() {
        let mut rng = StdRng::seed_from_u64(4);
        let layer = DigitCapsLayer::new(36, 8, 4, 16, 3, &mut rng).unwrap();
        let primary = Array3::from_shape_fn((2, 36, 8), |(b, i, d)| ((b * 7 + i * 3 + d) % 11) as f32 / 11.0 - 0.5);

        let first = layer.forward(&primary.view()).unwrap();
        let second = layer.forward(&primary.view()).unwrap();
        assert_eq!(first.dim(), (2, 4, 16));
        assert_eq!(first, second);
    }

    #[test]
    fn predictions_apply_transformation_matrices() {
        let mut weights = Array4::zeros((1, 2, 3, 2));
        weights[[0, 0, 0, 0]] = 2.0;
        weights[[0, 1, 2, 1]] = -1.0;
        let layer = DigitCapsLayer::from_weights(weights, 3);

        let primary = Array3::from_shape_vec((1, 1, 2), vec![1.5, 4.0]).unwrap();
        let predictions = layer.predictions(&primary.view()).unwrap();
        assert_eq!(predictions.dim(), (1, 1, 2, 3));
        assert_eq!(predictions[[0, 0, 0, 0]], 3.0);
        assert_eq!(predictions[[0, 0, 1, 2]], -4.0);
    }

    #[test]
    fn digit_rejects_mismatched_primary_count() {
        let mut rng = StdRng::seed_from_u64(4);
        let layer = DigitCapsLayer::new(36, 8, 4, 16, 3, &mut rng).unwrap();
        let primary = Array3::zeros((1, 35, 8));
        assert!(matches!(layer.forward(&primary.view()), Err(CapsNetError::Shape { .. })));
    }
}
