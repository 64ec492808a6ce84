pub mod backbone;
pub mod builder;
pub mod capsule;
pub mod config;
pub mod core;
pub mod layers;
pub mod routing;
pub mod weights;

// Réexportations principales
pub use builder::{state_dict_of, ModelBuilder};
pub use config::{ClassifierConfig, NetworkConfig};
pub use core::{CapNet, DiagnosticReport, SiameseCapNet};
pub use layers::squash;
pub use routing::{DynamicRouting, RoutingTrace};
pub use weights::StateDict;
