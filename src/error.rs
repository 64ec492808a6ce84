use thiserror::Error;

/// Toutes les erreurs de l'encodeur, des chargeurs d'artefacts et de la règle de décision.
#[derive(Error, Debug)]
pub enum CapsNetError {
    /// Un tenseur arrive dans une couche avec un rang ou une taille incorrects.
    #[error("erreur de forme ({context}) : attendu {expected}, obtenu {actual}")]
    Shape {
        context: &'static str,
        expected: String,
        actual: String,
    },

    /// Une classe de référence sans aucun exemplaire.
    #[error("la classe de référence {0} n'a aucun exemplaire")]
    EmptyReferenceClass(usize),

    /// Requête et références n'ont pas la même dimension.
    #[error("dimension d'embedding incohérente : attendu {expected}, obtenu {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Paramètre requis par l'architecture absent de l'artefact.
    #[error("tenseur manquant dans l'artefact : {0}")]
    MissingTensor(String),

    /// Paramètre présent mais incompatible avec l'architecture.
    #[error("le tenseur {name} a la forme {actual:?}, l'architecture attend {expected:?}")]
    ArtifactShape {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Artefact illisible ou contenu non supporté.
    #[error("erreur d'artefact : {0}")]
    Artifact(String),

    #[error("erreur de configuration : {0}")]
    Config(String),

    #[error("erreur image : {0}")]
    Image(#[from] image::ImageError),

    #[error("erreur E/S : {0}")]
    Io(#[from] std::io::Error),

    #[error("erreur JSON : {0}")]
    Json(#[from] serde_json::Error),
}

impl CapsNetError {
    pub(crate) fn shape(
        context: &'static str,
        expected: impl std::fmt::Display,
        actual: impl std::fmt::Debug,
    ) -> Self {
        Self::Shape {
            context,
            expected: expected.to_string(),
            actual: format!("{actual:?}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, CapsNetError>;
