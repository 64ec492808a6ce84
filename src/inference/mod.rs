pub mod context;
pub mod distance;
pub mod labels;
pub mod reference;

pub use context::{predict_image, InferenceContext};
pub use distance::{closeness, decide, mean_distances, ClassScore, Prediction, PredictionResponse};
pub use labels::{ClassLabel, NUM_CLASSES};
pub use reference::{ReferenceArtifact, ReferenceEntry, ReferenceSet};
