use image::DynamicImage;
use ndarray::{Array2, ArrayView4};
use std::path::Path;
use tracing::{debug, info};

use super::distance::{decide, Prediction};
use super::labels::NUM_CLASSES;
use super::reference::ReferenceSet;
use crate::data::Preprocessor;
use crate::error::{CapsNetError, Result};
use crate::model::builder::ModelBuilder;
use crate::model::config::ClassifierConfig;
use crate::model::core::{CapNet, SiameseCapNet};
use crate::model::weights::StateDict;

/// Encodeur, embeddings de référence et prétraitement chargés une fois,
/// partagés en lecture seule par toutes les requêtes.
#[derive(Debug, Clone)]
pub struct InferenceContext {
    encoder: CapNet,
    references: ReferenceSet,
    preprocessor: Preprocessor,
}

impl InferenceContext {
    /// Charge les poids, construit l'encodeur et résout les références.
    pub fn initialize(config: &ClassifierConfig) -> Result<Self> {
        config.network.validate()?;

        let state_dict = StateDict::load(&config.model_path)?;
        let encoder = ModelBuilder::new()
            .with_network_config(config.network.clone())
            .with_state_dict(state_dict)
            .build()?;
        let references = ReferenceSet::load(&config.reference_path, &encoder)?;

        let context = Self::from_parts(encoder, references)?;
        info!(
            model = %config.model_path.display(),
            references = %config.reference_path.display(),
            "contexte d'inférence prêt"
        );
        Ok(context)
    }

    pub fn from_parts(encoder: CapNet, references: ReferenceSet) -> Result<Self> {
        if encoder.num_classes() != NUM_CLASSES {
            return Err(CapsNetError::Config(format!(
                "l'encodeur a {} capsules de classe, le classifieur en attend {NUM_CLASSES}",
                encoder.num_classes()
            )));
        }
        if references.dim() != encoder.num_classes() {
            return Err(CapsNetError::DimensionMismatch {
                expected: encoder.num_classes(),
                actual: references.dim(),
            });
        }

        let preprocessor = Preprocessor::new(encoder.network_config.input_size as u32);
        Ok(Self {
            encoder,
            references,
            preprocessor,
        })
    }

    pub fn encoder(&self) -> &CapNet {
        &self.encoder
    }

    pub fn references(&self) -> &ReferenceSet {
        &self.references
    }

    pub fn preprocessor(&self) -> &Preprocessor {
        &self.preprocessor
    }

    /// Classe un tenseur prétraité `(1, C, size, size)`.
    pub fn classify_tensor(&self, input: &ArrayView4<f32>) -> Result<Prediction> {
        let embedding = self.encoder.embed(input)?;
        let prediction = decide(&embedding.view(), &self.references)?;
        debug!(label = %prediction.label, distances = ?prediction.mean_distances, "image classée");
        Ok(prediction)
    }

    /// Classe tout un batch prétraité en une seule passe de l'encodeur.
    pub fn classify_batch(&self, batch: &ArrayView4<f32>) -> Result<Vec<Prediction>> {
        let embeddings = self.encoder.forward(batch)?;
        embeddings
            .outer_iter()
            .map(|row| decide(&row, &self.references))
            .collect()
    }

    pub fn classify_image(&self, img: &DynamicImage) -> Result<Prediction> {
        let input = self.preprocessor.process(img);
        self.classify_tensor(&input.view())
    }

    pub fn classify_bytes(&self, bytes: &[u8]) -> Result<Prediction> {
        let input = self.preprocessor.from_bytes(bytes)?;
        self.classify_tensor(&input.view())
    }

    pub fn classify_path(&self, path: impl AsRef<Path>) -> Result<Prediction> {
        let input = self.preprocessor.load(path)?;
        self.classify_tensor(&input.view())
    }

    /// Distance siamoise entre deux fichiers image, forme `(1, 1)`.
    pub fn compare_paths(&self, a: impl AsRef<Path>, b: impl AsRef<Path>) -> Result<Array2<f32>> {
        let x1 = self.preprocessor.load(a)?;
        let x2 = self.preprocessor.load(b)?;
        SiameseCapNet::new(self.encoder.clone()).forward(&x1.view(), &x2.view())
    }
}

/// Décodage, prétraitement, encodage et décision pour un fichier image.
pub fn predict_image(ctx: &InferenceContext, path: impl AsRef<Path>) -> Result<Prediction> {
    ctx.classify_path(path)
}
