//! CLI entry point for LoRA adapter inspection

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lora_inspect::container;
use lora_inspect::generation::{compose_prompt, GenerationRequest, DEFAULT_SEED, DEFAULT_STEPS};
use lora_inspect::{LoraModel, LoraSummary};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lora-inspect")]
#[command(author = "rzem-ai")]
#[command(version = "0.1.0")]
#[command(about = "Inspect LoRA adapters and find their trigger words", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize a LoRA adapter
    ///
    /// Prints base model, trigger phrase, most frequent training tag,
    /// derived trigger word, tensor dtypes and low-rank layer ranks.
    Inspect {
        /// Path to LoRA safetensors file
        path: PathBuf,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the trigger word of a LoRA adapter
    ///
    /// Prints nothing when no plausible trigger word is found.
    Trigger {
        /// Path to LoRA safetensors file
        path: PathBuf,
    },

    /// Write a bf16 copy of a LoRA adapter
    Convert {
        /// Path to LoRA safetensors file
        path: PathBuf,

        /// Output safetensors file
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Build the generation request for a prompt using a LoRA adapter
    ///
    /// The adapter's trigger word is prepended to the prompt unless the
    /// prompt already contains it.
    Prompt {
        /// Path to LoRA safetensors file
        path: PathBuf,

        /// Text prompt
        #[arg(short, long)]
        prompt: String,

        /// Output resolution as WIDTHxHEIGHT
        #[arg(short, long, default_value = "1280x720")]
        resolution: String,

        /// Seed for reproducibility (-1 picks one at random)
        #[arg(long, default_value_t = DEFAULT_SEED, allow_negative_numbers = true)]
        seed: i64,

        /// Ignore --seed and pick one at random
        #[arg(long)]
        random_seed: bool,

        /// Denoising steps (4-9)
        #[arg(long, default_value_t = DEFAULT_STEPS)]
        steps: u32,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { path, json } => {
            let lora = load(&path)?;
            let summary = LoraSummary::from_model(&path, &lora);
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print!("{summary}");
            }
        }

        Commands::Trigger { path } => {
            let lora = load(&path)?;
            if let Some(word) = lora.trigger_word() {
                println!("{word}");
            }
        }

        Commands::Convert { path, output } => {
            let lora = load(&path)?;
            let weights = lora
                .to_uniform_precision()
                .context("Failed to convert LoRA tensors")?;
            let skipped = container::write(&output, &weights, lora.metadata())
                .with_context(|| format!("Failed to write {}", output.display()))?;
            info!(
                output = %output.display(),
                tensors = weights.len(),
                skipped_metadata = skipped,
                "✓ Wrote bf16 LoRA"
            );
            if skipped > 0 {
                eprintln!("Dropped {skipped} non-string metadata entries");
            }
        }

        Commands::Prompt {
            path,
            prompt,
            resolution,
            seed,
            random_seed,
            steps,
        } => {
            let lora = load(&path)?;
            let trigger = lora.trigger_word();
            let request = GenerationRequest::new(
                compose_prompt(&prompt, trigger.as_deref()),
                &resolution,
                seed,
                random_seed,
                steps,
                &mut rand::thread_rng(),
            );
            println!("{}", serde_json::to_string_pretty(&request)?);
        }
    }

    Ok(())
}

fn load(path: &Path) -> Result<LoraModel> {
    LoraModel::load(path).with_context(|| format!("Failed to load LoRA: {}", path.display()))
}
