use ndarray::{s, Array, Array1, Array2, Array4, ArrayView, ArrayView4, Axis, Dimension, Zip};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::Rng;
use rayon::prelude::*;

use crate::error::{CapsNetError, Result};
use crate::model::config::{conv_output_size, Activation};

/// Epsilon sous la racine du dénominateur de squash.
pub const SQUASH_EPSILON: f32 = 1e-8;

/// Convolution 2D (inférence uniquement), format NCHW.
#[derive(Debug, Clone)]
pub struct ConvLayer {
    pub weights: Array4<f32>,
    pub biases: Option<Array1<f32>>,
    pub stride: usize,
    pub padding: usize,
    pub activation: Activation,
    // `weights` vu en (out_channels, in_channels * k * k), construit une fois
    kernel_matrix: Array2<f32>,
}

impl ConvLayer {
    /// Initialisation He uniforme, biais à zéro.
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        activation: Activation,
        with_bias: bool,
        rng: &mut R,
    ) -> Result<Self> {
        let fan_in = in_channels * kernel_size * kernel_size;
        let scale = (2.0 / fan_in.max(1) as f32).sqrt();
        let uniform = Uniform::new(-scale, scale)
            .map_err(|e| CapsNetError::Config(format!("intervalle d'initialisation invalide ±{scale} : {e}")))?;
        let weights = Array4::random_using((out_channels, in_channels, kernel_size, kernel_size), uniform, rng);
        let biases = with_bias.then(|| Array1::zeros(out_channels));

        Self::from_parts(weights, biases, stride, padding, activation)
    }

    pub fn from_parts(
        weights: Array4<f32>,
        biases: Option<Array1<f32>>,
        stride: usize,
        padding: usize,
        activation: Activation,
    ) -> Result<Self> {
        let (out_channels, in_channels, kh, kw) = weights.dim();
        if kh != kw || kh == 0 {
            return Err(CapsNetError::shape("noyau de conv", "noyau carré non vide", weights.dim()));
        }
        if stride == 0 {
            return Err(CapsNetError::Config("le stride de convolution doit être positif".into()));
        }
        if let Some(b) = &biases {
            if b.len() != out_channels {
                return Err(CapsNetError::shape("biais de conv", out_channels, b.len()));
            }
        }
        let kernel_matrix = Array2::from_shape_vec(
            (out_channels, in_channels * kh * kw),
            weights.iter().copied().collect(),
        )
        .map_err(|e| CapsNetError::shape("matrice du noyau", "noyau contigu", e))?;

        Ok(Self {
            weights,
            biases,
            stride,
            padding,
            activation,
            kernel_matrix,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.weights.dim().1
    }

    pub fn out_channels(&self) -> usize {
        self.weights.dim().0
    }

    pub fn kernel_size(&self) -> usize {
        self.weights.dim().2
    }

    pub fn output_size(&self, height: usize, width: usize) -> Result<(usize, usize)> {
        let k = self.kernel_size();
        let oh = conv_output_size(height, k, self.stride, self.padding);
        let ow = conv_output_size(width, k, self.stride, self.padding);
        match (oh, ow) {
            (Some(oh), Some(ow)) if oh > 0 && ow > 0 => Ok((oh, ow)),
            _ => Err(CapsNetError::shape(
                "entrée de conv",
                format!("taille spatiale >= noyau {k} après padding {}", self.padding),
                (height, width),
            )),
        }
    }

    /// Convolution im2col + produit matriciel, parallélisée par batch.
    pub fn forward(&self, input: &ArrayView4<f32>) -> Result<Array4<f32>> {
        let (batch_size, in_channels, in_height, in_width) = input.dim();
        if in_channels != self.in_channels() {
            return Err(CapsNetError::shape(
                "canaux d'entrée de conv",
                self.in_channels(),
                input.dim(),
            ));
        }
        let (out_height, out_width) = self.output_size(in_height, in_width)?;
        let out_channels = self.out_channels();

        let padded = if self.padding > 0 {
            pad_input(input, self.padding, 0.0)
        } else {
            input.to_owned()
        };

        let mut output = Array4::zeros((batch_size, out_channels, out_height, out_width));

        output
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut out_batch)| {
                let cols = self.im2col(&padded.index_axis(Axis(0), b), out_height, out_width);
                let product = self.kernel_matrix.dot(&cols);
                for (oc, row) in product.outer_iter().enumerate() {
                    let bias = self.biases.as_ref().map_or(0.0, |b| b[oc]);
                    let mut plane = out_batch.index_axis_mut(Axis(0), oc);
                    for (dst, &src) in plane.iter_mut().zip(row.iter()) {
                        *dst = activate(src + bias, self.activation);
                    }
                }
            });

        Ok(output)
    }

    fn im2col(
        &self,
        padded: &ndarray::ArrayView3<f32>,
        out_height: usize,
        out_width: usize,
    ) -> Array2<f32> {
        let in_channels = padded.dim().0;
        let k = self.kernel_size();
        let mut cols = Array2::zeros((in_channels * k * k, out_height * out_width));

        for ic in 0..in_channels {
            let channel = padded.index_axis(Axis(0), ic);
            for kh in 0..k {
                for kw in 0..k {
                    let mut row = cols.row_mut((ic * k + kh) * k + kw);
                    for oh in 0..out_height {
                        let ih = oh * self.stride + kh;
                        for ow in 0..out_width {
                            row[oh * out_width + ow] = channel[[ih, ow * self.stride + kw]];
                        }
                    }
                }
            }
        }

        cols
    }
}

fn activate(value: f32, activation: Activation) -> f32 {
    match activation {
        Activation::ReLU => value.max(0.0),
        Activation::None => value,
    }
}

pub(crate) fn pad_input(input: &ArrayView4<f32>, padding: usize, fill: f32) -> Array4<f32> {
    let (batch_size, channels, height, width) = input.dim();
    let p = padding;

    let mut padded = Array4::from_elem((batch_size, channels, height + 2 * p, width + 2 * p), fill);
    padded
        .slice_mut(s![.., .., p..height + p, p..width + p])
        .assign(input);

    padded
}

/// Batch norm en mode évaluation (statistiques figées).
#[derive(Debug, Clone)]
pub struct BatchNorm2d {
    pub gamma: Array1<f32>,
    pub beta: Array1<f32>,
    pub running_mean: Array1<f32>,
    pub running_var: Array1<f32>,
    pub eps: f32,
}

impl BatchNorm2d {
    /// Statistiques identité : échelle 1, décalage 0.
    pub fn new(channels: usize, eps: f32) -> Self {
        Self {
            gamma: Array1::ones(channels),
            beta: Array1::zeros(channels),
            running_mean: Array1::zeros(channels),
            running_var: Array1::ones(channels),
            eps,
        }
    }

    pub fn channels(&self) -> usize {
        self.gamma.len()
    }

    pub fn forward(&self, mut input: Array4<f32>, activation: Activation) -> Result<Array4<f32>> {
        let channels = input.dim().1;
        if channels != self.channels() {
            return Err(CapsNetError::shape("canaux de batch norm", self.channels(), input.dim()));
        }

        let scale: Array1<f32> = Zip::from(&self.gamma)
            .and(&self.running_var)
            .map_collect(|&g, &v| g / (v + self.eps).sqrt());
        let shift: Array1<f32> = Zip::from(&self.beta)
            .and(&self.running_mean)
            .and(&scale)
            .map_collect(|&b, &m, &s| b - m * s);

        for mut sample in input.outer_iter_mut() {
            for (c, mut plane) in sample.outer_iter_mut().enumerate() {
                let (s, t) = (scale[c], shift[c]);
                plane.mapv_inplace(|x| activate(x * s + t, activation));
            }
        }

        Ok(input)
    }
}

/// Max pooling avec padding à `-inf`.
#[derive(Debug, Clone, Copy)]
pub struct MaxPool2d {
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
}

impl MaxPool2d {
    pub fn new(kernel_size: usize, stride: usize, padding: usize) -> Self {
        Self {
            kernel_size,
            stride,
            padding,
        }
    }

    pub fn forward(&self, input: &ArrayView4<f32>) -> Result<Array4<f32>> {
        let (batch_size, channels, height, width) = input.dim();
        let k = self.kernel_size;
        let (out_height, out_width) = match (
            conv_output_size(height, k, self.stride, self.padding),
            conv_output_size(width, k, self.stride, self.padding),
        ) {
            (Some(oh), Some(ow)) if oh > 0 && ow > 0 => (oh, ow),
            _ => return Err(CapsNetError::shape("entrée du max pool", format!("taille >= {k}"), input.dim())),
        };

        let padded = pad_input(input, self.padding, f32::NEG_INFINITY);
        let mut output = Array4::zeros((batch_size, channels, out_height, out_width));

        Zip::indexed(&mut output).par_for_each(|(b, c, oh, ow), out| {
            let (h0, w0) = (oh * self.stride, ow * self.stride);
            let window = padded.slice(s![b, c, h0..h0 + k, w0..w0 + k]);
            *out = window.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
        });

        Ok(output)
    }
}

/// Squash des capsules le long de `axis` :
/// `(|s|² / (1 + |s|²)) · s / sqrt(|s|² + ε)`.
///
/// Même direction, norme dans `[0, 1)`. Un vecteur nul reste nul.
pub fn squash<D: Dimension>(tensor: &ArrayView<f32, D>, axis: Axis) -> Result<Array<f32, D>> {
    if axis.index() >= tensor.ndim() {
        return Err(CapsNetError::shape(
            "axe de squash",
            format!("axe < {}", tensor.ndim()),
            axis.index(),
        ));
    }

    let mut result = tensor.to_owned();
    for mut lane in result.lanes_mut(axis) {
        let norm_squared: f32 = lane.iter().map(|v| v * v).sum();
        let norm = (norm_squared + SQUASH_EPSILON).sqrt();
        let factor = norm_squared / (1.0 + norm_squared) / norm;
        lane.mapv_inplace(|v| v * factor);
    }

    Ok(result)
}

/// Norme euclidienne de chaque vecteur le long de `axis` (axe supprimé).
pub fn lane_norms<D: Dimension + ndarray::RemoveAxis>(
    tensor: &ArrayView<f32, D>,
    axis: Axis,
) -> Array<f32, D::Smaller> {
    tensor.map_axis(axis, |lane| lane.iter().map(|v| v * v).sum::<f32>().sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array3};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn squash_bounds_norm_and_keeps_direction() {
        let vectors = array![[3.0_f32, 4.0], [0.01, -0.02], [-100.0, 250.0]];
        let squashed = squash(&vectors.view(), Axis(1)).unwrap();

        for (input, output) in vectors.outer_iter().zip(squashed.outer_iter()) {
            let in_norm = input.dot(&input).sqrt();
            let out_norm = output.dot(&output).sqrt();
            assert!(out_norm < 1.0);
            let cosine = input.dot(&output) / (in_norm * out_norm);
            assert_abs_diff_eq!(cosine, 1.0, epsilon = 1e-5);
        }

        // |s| = 5 -> 25/26
        let row = squashed.row(0);
        assert_abs_diff_eq!(row.dot(&row).sqrt(), 25.0 / 26.0, epsilon = 1e-5);
    }

    #[test]
    fn squash_preserves_zero() {
        let zeros = Array3::<f32>::zeros((2, 3, 8));
        let squashed = squash(&zeros.view(), Axis(2)).unwrap();
        assert!(squashed.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn squash_rejects_missing_axis() {
        let v = array![1.0_f32, 2.0];
        assert!(matches!(squash(&v.view(), Axis(1)), Err(CapsNetError::Shape { .. })));
    }

    #[test]
    fn conv_matches_direct_sum() {
        let weights = Array4::from_shape_fn((2, 1, 3, 3), |(o, _, h, w)| (o + 1) as f32 * (h * 3 + w) as f32 * 0.1);
        let conv = ConvLayer::from_parts(weights.clone(), Some(array![0.5, -1.0]), 1, 1, Activation::None).unwrap();
        let input = Array4::from_shape_fn((1, 1, 4, 4), |(_, _, h, w)| (h * 4 + w) as f32);

        let output = conv.forward(&input.view()).unwrap();
        assert_eq!(output.dim(), (1, 2, 4, 4));

        let padded = pad_input(&input.view(), 1, 0.0);
        for o in 0..2 {
            for y in 0..4 {
                for x in 0..4 {
                    let mut expected = if o == 0 { 0.5 } else { -1.0 };
                    for kh in 0..3 {
                        for kw in 0..3 {
                            expected += padded[[0, 0, y + kh, x + kw]] * weights[[o, 0, kh, kw]];
                        }
                    }
                    assert_abs_diff_eq!(output[[0, o, y, x]], expected, epsilon = 1e-4);
                }
            }
        }
    }

    #[test]
    fn conv_stride_and_relu() {
        let mut rng = StdRng::seed_from_u64(7);
        let conv = ConvLayer::new(3, 5, 3, 2, 1, Activation::ReLU, true, &mut rng).unwrap();
        let input = Array4::from_elem((2, 3, 9, 9), -0.3);
        let output = conv.forward(&input.view()).unwrap();
        assert_eq!(output.dim(), (2, 5, 5, 5));
        assert!(output.iter().all(|v| *v >= 0.0));
    }

    #[test]
    fn conv_rejects_wrong_channels() {
        let mut rng = StdRng::seed_from_u64(1);
        let conv = ConvLayer::new(4, 2, 3, 1, 1, Activation::None, false, &mut rng).unwrap();
        let input = Array4::zeros((1, 3, 8, 8));
        assert!(matches!(conv.forward(&input.view()), Err(CapsNetError::Shape { .. })));
    }

    #[test]
    fn batch_norm_uses_running_statistics() {
        let mut bn = BatchNorm2d::new(2, 1e-5);
        bn.running_mean = array![1.0, -2.0];
        bn.running_var = array![4.0, 1.0];
        bn.gamma = array![2.0, 1.0];
        bn.beta = array![0.0, 0.5];

        let input = Array4::from_elem((1, 2, 1, 1), 3.0);
        let output = bn.forward(input, Activation::None).unwrap();
        assert_abs_diff_eq!(output[[0, 0, 0, 0]], 2.0 * (3.0 - 1.0) / (4.0_f32 + 1e-5).sqrt(), epsilon = 1e-5);
        assert_abs_diff_eq!(output[[0, 1, 0, 0]], 5.0 / (1.0_f32 + 1e-5).sqrt() + 0.5, epsilon = 1e-5);
    }

    #[test]
    fn max_pool_ignores_padding() {
        let input = Array4::from_elem((1, 1, 4, 4), -5.0);
        let output = MaxPool2d::new(3, 2, 1).forward(&input.view()).unwrap();
        assert_eq!(output.dim(), (1, 1, 2, 2));
        assert!(output.iter().all(|v| *v == -5.0));
    }

    #[test]
    fn lane_norms_drop_axis() {
        let v = array![[3.0_f32, 4.0], [0.0, 0.0]];
        let norms = lane_norms(&v.view(), Axis(1));
        assert_eq!(norms, array![5.0, 0.0]);
    }
}
