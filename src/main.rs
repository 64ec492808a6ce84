use clap::{Parser, Subcommand, ValueHint};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use mri_capsnet::model::NetworkConfig;
use mri_capsnet::{ClassifierConfig, InferenceContext, ModelBuilder, Result};

#[derive(Parser)]
#[command(author, version, about = "Classifieur du stade de démence sur coupes IRM")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Classe une image et affiche la réponse JSON
    Predict {
        /// Configuration du classifieur (chemins des artefacts, géométrie de l'encodeur)
        #[arg(long, value_hint = ValueHint::FilePath)]
        config: PathBuf,

        #[arg(value_hint = ValueHint::FilePath)]
        image: PathBuf,
    },

    /// Passe une image nulle dans un encodeur aléatoire et affiche les formes
    Diagnostic {
        #[arg(long, value_hint = ValueHint::FilePath)]
        config: Option<PathBuf>,

        #[arg(long, default_value_t = 42)]
        seed: u64,
    },

    /// Distance siamoise entre deux images
    Compare {
        #[arg(long, value_hint = ValueHint::FilePath)]
        config: PathBuf,

        #[arg(value_hint = ValueHint::FilePath)]
        image_a: PathBuf,

        #[arg(value_hint = ValueHint::FilePath)]
        image_b: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Predict { config, image } => {
            let ctx = InferenceContext::initialize(&ClassifierConfig::from_json_file(config)?)?;
            let prediction = ctx.classify_path(&image)?;
            println!("{}", serde_json::to_string_pretty(&prediction.to_response())?);
        }
        Command::Diagnostic { config, seed } => {
            let network_config = match config {
                Some(path) => ClassifierConfig::from_json_file(path)?.network,
                None => NetworkConfig::default(),
            };
            let model = ModelBuilder::new()
                .with_network_config(network_config)
                .with_seed(seed)
                .build()?;
            let report = model.diagnostic()?;

            println!("🔍 DIAGNOSTIC DE L'ENCODEUR CAPSNET");
            println!("==================================");
            println!("   - Entrée:      {:?}", report.input_shape);
            println!("   - Backbone:    {:?}", report.feature_shape);
            println!("   - Primaires:   {:?}", report.primary_shape);
            println!("   - Chiffres:    {:?}", report.digit_shape);
            println!("   - Embedding:   {:?}", report.embedding_shape);
        }
        Command::Compare {
            config,
            image_a,
            image_b,
        } => {
            let ctx = InferenceContext::initialize(&ClassifierConfig::from_json_file(config)?)?;
            let distance = ctx.compare_paths(&image_a, &image_b)?;
            println!("{}", serde_json::json!({ "distance": distance[[0, 0]] }));
        }
    }

    Ok(())
}
