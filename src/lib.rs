//! Classification du stade de démence sur coupes IRM cérébrales.
//!
//! Un backbone ResNet-18 alimente les capsules primaires puis les capsules de
//! classe (routage dynamique) ; leurs normes sont comparées aux embeddings de
//! référence de chaque classe.

pub mod data;
pub mod error;
pub mod inference;
pub mod model;

pub use error::{CapsNetError, Result};
pub use inference::{predict_image, ClassLabel, InferenceContext, Prediction, PredictionResponse};
pub use model::{CapNet, ClassifierConfig, ModelBuilder, NetworkConfig, SiameseCapNet};
