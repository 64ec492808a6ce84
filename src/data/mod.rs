pub mod preprocess;

pub use preprocess::{Preprocessor, TARGET_SIZE};
