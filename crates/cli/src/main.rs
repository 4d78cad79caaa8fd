//! inferctl: command-line front end for the infercore engine
//!
//! Thin collaborator over the library: argument parsing, file wiring, and
//! exit-code mapping. Exit codes: 0 success, 1 initialization or runtime
//! failure, 2 argument errors (clap's default).

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use infercore::format::{self, MatrixPayload};
use infercore::generate::Generator;
use infercore::hybrid::{GenerationRoute, HybridPolicy};
use infercore::model::Model;
use infercore::quantize::{QuantizedMatrix4, QuantizedMatrix8};
use infercore::sampling::{GenerationParams, SamplingMethod};
use infercore::simd::Kernels;
use infercore::tokenizer::{Vocabulary, BOS_ID, EOS_ID, PAD_ID};

#[derive(Parser)]
#[command(name = "inferctl", about = "On-device quantized model inference")]
struct Cli {
    /// Verbose logging and JSON statistics
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate text from a prompt
    Generate {
        /// Path to the model architecture file
        #[arg(long)]
        model: PathBuf,
        /// Path to the model weights file
        #[arg(long)]
        weights: PathBuf,
        /// Path to the vocabulary file
        #[arg(long)]
        tokenizer: PathBuf,
        /// Prompt text (omit for an unconditional start)
        prompt: Option<String>,
        /// Maximum number of tokens to generate
        #[arg(long, default_value = "64")]
        max_tokens: usize,
        /// Sampling method: greedy, temperature, top-k, top-p
        #[arg(long, default_value = "greedy")]
        sampling: String,
        #[arg(long, default_value = "1.0")]
        temperature: f32,
        #[arg(long, default_value = "40")]
        top_k: usize,
        #[arg(long, default_value = "0.9")]
        top_p: f32,
        /// PRNG seed (0 = wall clock)
        #[arg(long, default_value = "0")]
        seed: u32,
        /// Read prompts line by line from stdin
        #[arg(long)]
        interactive: bool,
    },

    /// Print model architecture metadata
    Inspect {
        /// Path to the model architecture file
        #[arg(long)]
        model: PathBuf,
    },

    /// Quantize a standalone f32 matrix file
    Quantize {
        /// Input matrix file (f32 payload)
        #[arg(long)]
        input: PathBuf,
        /// Output matrix file
        #[arg(long)]
        output: PathBuf,
        /// Target precision: 4 or 8
        #[arg(long, default_value = "4")]
        bits: u32,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("inferctl: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Generate {
            model,
            weights,
            tokenizer,
            prompt,
            max_tokens,
            sampling,
            temperature,
            top_k,
            top_p,
            seed,
            interactive,
        } => {
            let method: SamplingMethod = sampling.parse().context("invalid --sampling")?;
            let params = GenerationParams {
                max_tokens,
                method,
                temperature,
                top_k,
                top_p,
                seed,
            };

            let kernels = Kernels::detect();
            info!(tier = kernels.tier().name(), "kernel tier");
            let mut model =
                Model::load(&model, &weights, kernels).context("failed to load model")?;
            let vocab =
                Arc::new(Vocabulary::load_file(&tokenizer).context("failed to load vocabulary")?);
            model.set_tokenizer(Arc::clone(&vocab));

            if interactive {
                let stdin = std::io::stdin();
                for line in stdin.lock().lines() {
                    let line = line?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    run_generation(&mut model, &vocab, &line, &params, cli.verbose)?;
                }
            } else {
                let prompt = prompt.unwrap_or_default();
                run_generation(&mut model, &vocab, &prompt, &params, cli.verbose)?;
            }
            Ok(())
        }

        Command::Inspect { model } => {
            let arch = format::read_arch_file(&model).context("failed to read architecture")?;
            println!(
                "kind: {:?}\nhidden: {}\ncontext: {}\nlayers: {}",
                arch.model_kind,
                arch.hidden_size,
                arch.context_size,
                arch.layers.len()
            );
            for (i, l) in arch.layers.iter().enumerate() {
                println!(
                    "  [{}] {:?} {}x{} {:?}",
                    i, l.kind, l.input_size, l.output_size, l.activation
                );
            }
            Ok(())
        }

        Command::Quantize {
            input,
            output,
            bits,
        } => {
            let dense = match format::read_matrix_file(&input)? {
                MatrixPayload::F32(m) => m,
                other => anyhow::bail!("input is already quantized: {:?}", other),
            };
            let payload = match bits {
                4 => MatrixPayload::Int4(QuantizedMatrix4::quantize(&dense)?),
                8 => MatrixPayload::Int8(QuantizedMatrix8::quantize(&dense)?),
                other => anyhow::bail!("unsupported precision: {} bits", other),
            };
            format::write_matrix_file(&output, &payload)?;
            println!(
                "quantized {}x{} matrix to {} bits -> {}",
                dense.rows,
                dense.cols,
                bits,
                output.display()
            );
            Ok(())
        }
    }
}

fn run_generation(
    model: &mut Model,
    vocab: &Vocabulary,
    prompt: &str,
    params: &GenerationParams,
    verbose: bool,
) -> Result<()> {
    let prompt_ids = vocab.encode(prompt);

    let policy = HybridPolicy::new(model.context_size());
    if policy.decide(prompt_ids.len(), params.max_tokens) == GenerationRoute::Remote {
        warn!(
            prompt = prompt_ids.len(),
            max_tokens = params.max_tokens,
            "request exceeds local thresholds; no remote endpoint configured, running locally"
        );
    }

    let mut generator = Generator::new(model);
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let tokens = generator.generate_stream(&prompt_ids, params, |id| {
        if matches!(id, BOS_ID | EOS_ID | PAD_ID) {
            return;
        }
        if let Some(tok) = vocab.token(id) {
            let _ = write!(out, "{}", tok);
            let _ = out.flush();
        }
    })?;
    writeln!(out)?;

    if verbose {
        let stats = generator.stats();
        eprintln!("{}", serde_json::to_string_pretty(&stats)?);
        eprintln!("tokens: {:?}", tokens);
    }
    Ok(())
}
