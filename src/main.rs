//! CLI entry point for convlstm-rs.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use convlstm_rs::cli::ConfigOverrides;
use convlstm_rs::dataset::SplitDatasetFactory;
use convlstm_rs::frames::DirFrameStore;
use convlstm_rs::metadata::SequenceMetadataTable;
use convlstm_rs::model::{ConvLstmModel, SequenceModel};
use convlstm_rs::{select_device, CurriculumTrainer, Result, TrainingConfig};

#[derive(Parser)]
#[command(name = "convlstm")]
#[command(about = "Curriculum training for ConvLSTM precipitation nowcasting")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: String,
        #[command(flatten)]
        overrides: ConfigOverrides,
    },
    /// Start training
    Train {
        /// Path to configuration file
        config: String,
        #[command(flatten)]
        overrides: ConfigOverrides,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "config.yaml")]
        output: String,
        /// Preset (default, tiny)
        #[arg(long, default_value = "default")]
        preset: String,
    },
}

fn load_config(path: &str, overrides: &ConfigOverrides) -> Result<TrainingConfig> {
    let mut config = TrainingConfig::from_file(path)?;
    overrides.apply(&mut config)?;
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config, overrides } => {
            tracing::info!("Validating configuration: {}", config);
            let config = load_config(&config, &overrides)?;
            println!("✓ Configuration is valid");
            println!("  Run id: {}", config.run_id);
            println!("  Hidden: {:?}", config.model.hidden);
            println!("  Loss: {:?}", config.training.loss);
            println!(
                "  Curriculum: seq_len {}..{}",
                config.curriculum.start_seq_len, config.curriculum.max_seq_len
            );
            println!(
                "  Parameters: {}",
                ConvLstmModel::expected_parameter_count(&config.model)
            );
        }
        Commands::Train { config, overrides } => {
            tracing::info!("Starting training with config: {}", config);
            let config = load_config(&config, &overrides)?;
            let device = select_device();

            let table = SequenceMetadataTable::from_csv(&config.data.metadata_csv)?;
            let split = table.split(config.data.train_fraction, config.data.split_seed)?;
            let store = Arc::new(DirFrameStore::new(
                &config.data.frame_dir,
                config.data.frame_format,
                &device,
            ));
            tracing::info!("Reading frames from {}", store.dir().display());
            let factory = SplitDatasetFactory::new(split, store);

            let model = ConvLstmModel::new(&config.model, &device)?;
            tracing::info!("Model built with {} parameters", model.parameter_count());

            let mut trainer = CurriculumTrainer::new(&config, model, device)?;
            let paths = trainer.train(&factory)?;
            println!("✓ Model saved to: {}", paths.model.display());
            println!("  History: {}", paths.history.display());
        }
        Commands::Init { output, preset } => {
            tracing::info!("Generating config for preset: {}", preset);
            let config = TrainingConfig::from_preset(&preset)?;
            config.to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
    }

    Ok(())
}
