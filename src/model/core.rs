use ndarray::{Array1, Array2, Array3, Array4, ArrayView4, Axis};
use tracing::{debug, info};

use super::backbone::ResNetBackbone;
use super::capsule::{DigitCapsLayer, PrimaryCapsLayer};
use super::config::NetworkConfig;
use super::layers::lane_norms;
use super::routing::RoutingTrace;
use crate::error::{CapsNetError, Result};

/// Encodeur capsule : backbone -> capsules primaires -> capsules de classe -> normes.
///
/// Paramètres figés à la construction ; chaque passe avant les emprunte en
/// lecture seule, une même instance peut servir plusieurs appelants.
#[derive(Debug, Clone)]
pub struct CapNet {
    pub network_config: NetworkConfig,
    pub backbone: ResNetBackbone,
    pub primary: PrimaryCapsLayer,
    pub digit: DigitCapsLayer,
}

/// Formes observées en passant une image nulle dans l'encodeur.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticReport {
    pub input_shape: (usize, usize, usize, usize),
    pub feature_shape: (usize, usize, usize, usize),
    pub primary_shape: (usize, usize, usize),
    pub digit_shape: (usize, usize, usize),
    pub embedding_shape: (usize, usize),
}

impl CapNet {
    pub fn new(
        network_config: NetworkConfig,
        backbone: ResNetBackbone,
        primary: PrimaryCapsLayer,
        digit: DigitCapsLayer,
    ) -> Result<Self> {
        network_config.validate()?;

        if backbone.output_channels() != primary.conv.in_channels() {
            return Err(CapsNetError::shape(
                "entrée des capsules primaires",
                format!("{} canaux du backbone", backbone.output_channels()),
                primary.conv.weights.dim(),
            ));
        }
        let expected_primary = network_config.num_primary_capsules();
        if digit.num_primary() != expected_primary {
            return Err(CapsNetError::shape(
                "poids des capsules de classe",
                format!("{expected_primary} capsules primaires"),
                digit.weights.dim(),
            ));
        }

        Ok(Self {
            network_config,
            backbone,
            primary,
            digit,
        })
    }

    pub fn input_shape(&self) -> (usize, usize, usize) {
        let size = self.network_config.input_size;
        (self.network_config.backbone.input_channels, size, size)
    }

    pub fn num_classes(&self) -> usize {
        self.digit.num_capsules()
    }

    /// N'accepte que `(batch >= 1, canaux, taille, taille)`.
    pub fn check_input(&self, input: &ArrayView4<f32>) -> Result<()> {
        let (batch, channels, height, width) = input.dim();
        let (c, h, w) = self.input_shape();
        if batch == 0 || channels != c || height != h || width != w {
            return Err(CapsNetError::shape(
                "entrée de l'encodeur",
                format!("(batch, {c}, {h}, {w})"),
                input.dim(),
            ));
        }
        Ok(())
    }

    /// Vecteurs des capsules de classe, `(batch, num_classes, digit_dim)`.
    pub fn capsules(&self, input: &ArrayView4<f32>) -> Result<Array3<f32>> {
        self.check_input(input)?;
        let features = self.backbone.forward(input)?;
        let primary = self.primary.forward(&features.view())?;
        self.digit.forward(&primary.view())
    }

    /// Capsules de classe avec les coefficients de couplage de chaque itération.
    pub fn capsules_with_trace(&self, input: &ArrayView4<f32>) -> Result<RoutingTrace> {
        self.check_input(input)?;
        let features = self.backbone.forward(input)?;
        let primary = self.primary.forward(&features.view())?;
        self.digit.forward_with_trace(&primary.view())
    }

    /// Normes des capsules par classe, `(batch, num_classes)`.
    pub fn forward(&self, input: &ArrayView4<f32>) -> Result<Array2<f32>> {
        let capsules = self.capsules(input)?;
        Ok(lane_norms(&capsules.view(), Axis(2)))
    }

    /// Embedding d'une image seule `(1, C, H, W)`.
    pub fn embed(&self, image: &ArrayView4<f32>) -> Result<Array1<f32>> {
        if image.dim().0 != 1 {
            return Err(CapsNetError::shape("image seule", "batch de 1", image.dim()));
        }
        let norms = self.forward(image)?;
        Ok(norms.index_axis_move(Axis(0), 0))
    }

    pub fn diagnostic(&self) -> Result<DiagnosticReport> {
        let (c, h, w) = self.input_shape();
        let input = Array4::zeros((1, c, h, w));

        let features = self.backbone.forward(&input.view())?;
        let primary = self.primary.forward(&features.view())?;
        let digit = self.digit.forward(&primary.view())?;
        let embedding = lane_norms(&digit.view(), Axis(2));

        let report = DiagnosticReport {
            input_shape: input.dim(),
            feature_shape: features.dim(),
            primary_shape: primary.dim(),
            digit_shape: digit.dim(),
            embedding_shape: embedding.dim(),
        };
        info!(?report, "diagnostic de l'encodeur");
        Ok(report)
    }
}

/// Réseau siamois : les deux entrées passent par le même encodeur.
#[derive(Debug, Clone)]
pub struct SiameseCapNet {
    pub capsule_net: CapNet,
}

impl SiameseCapNet {
    pub fn new(capsule_net: CapNet) -> Self {
        Self { capsule_net }
    }

    /// `||enc(x1) - enc(x2)||` par ligne, forme `(batch, 1)`.
    pub fn forward(&self, x1: &ArrayView4<f32>, x2: &ArrayView4<f32>) -> Result<Array2<f32>> {
        if x1.dim().0 != x2.dim().0 {
            return Err(CapsNetError::shape("paire siamoise", format!("batch {}", x1.dim().0), x2.dim()));
        }
        let e1 = self.capsule_net.forward(x1)?;
        let e2 = self.capsule_net.forward(x2)?;
        let difference = e1 - e2;
        let distances = lane_norms(&difference.view(), Axis(1)).insert_axis(Axis(1));
        debug!(pairs = distances.len(), "distances siamoises");
        Ok(distances)
    }

    pub fn encoder(&self) -> &CapNet {
        &self.capsule_net
    }
}
