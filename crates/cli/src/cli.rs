//! CLI wiring for the excoder drivers.

use crate::console::{run_console, ConsoleOptions};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use excoder_llm::{EngineConfig, Model, SamplingParams, ScratchPolicy, TokenId};
use excoder_server::{ServerConfig, SessionPolicy};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "excoder", about = "SantaCoder-style code completion on the CPU")]
pub struct Cli {
    /// Worker threads for the numeric kernels. Defaults to one per core.
    #[arg(short = 't', long, global = true)]
    pub threads: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScratchPolicyArg {
    Grow,
    FailFast,
}

impl From<ScratchPolicyArg> for ScratchPolicy {
    fn from(value: ScratchPolicyArg) -> ScratchPolicy {
        match value {
            ScratchPolicyArg::Grow => ScratchPolicy::Grow,
            ScratchPolicyArg::FailFast => ScratchPolicy::FailFast,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPolicyArg {
    Shared,
    PerRequest,
}

impl From<SessionPolicyArg> for SessionPolicy {
    fn from(value: SessionPolicyArg) -> SessionPolicy {
        match value {
            SessionPolicyArg::Shared => SessionPolicy::Shared,
            SessionPolicyArg::PerRequest => SessionPolicy::PerRequest,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Complete a prompt and stream the result to stdout.
    Generate {
        #[arg(short, long)]
        model: PathBuf,
        /// Prompt text. Read from piped stdin, or picked at random, when absent.
        #[arg(short, long)]
        prompt: Option<String>,
        /// Sampling seed. Taken from the clock when absent.
        #[arg(short, long)]
        seed: Option<u64>,
        #[arg(short = 'n', long, default_value_t = 200)]
        n_predict: usize,
        #[arg(long, default_value_t = 40)]
        top_k: usize,
        #[arg(long, default_value_t = 0.9)]
        top_p: f32,
        #[arg(long, default_value_t = 0.9)]
        temp: f32,
        #[arg(short, long, default_value_t = 8)]
        batch_size: usize,
        /// Stop token id. Defaults to the vocabulary's `<|endoftext|>`.
        #[arg(long)]
        eos_token: Option<TokenId>,
        #[arg(long, value_enum, default_value = "grow")]
        scratch_policy: ScratchPolicyArg,
    },
    /// Serve OpenAI-style completions over HTTP.
    Serve {
        #[arg(short, long)]
        model: PathBuf,
        /// JSON server config. Flags below override it.
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(short, long)]
        seed: Option<u64>,
        #[arg(short, long)]
        batch_size: Option<usize>,
        #[arg(long, value_enum)]
        session_policy: Option<SessionPolicyArg>,
        #[arg(long, value_enum)]
        scratch_policy: Option<ScratchPolicyArg>,
        #[arg(long)]
        eos_token: Option<TokenId>,
    },
}

pub fn run_cli(cli: Cli) -> Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let Cli { threads, command } = cli;
    if let Some(threads) = threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .context("failed to configure the kernel thread pool")?;
        info!(threads, "kernel thread pool configured");
    }

    match command {
        Command::Generate {
            model,
            prompt,
            seed,
            n_predict,
            top_k,
            top_p,
            temp,
            batch_size,
            eos_token,
            scratch_policy,
        } => {
            let options = ConsoleOptions {
                model,
                prompt,
                seed,
                n_predict,
                batch_size,
                sampling: SamplingParams {
                    top_k,
                    top_p,
                    temperature: temp,
                },
                eos_token,
                scratch_margin_bytes: EngineConfig::default().scratch_margin_bytes,
                scratch_policy: scratch_policy.into(),
            };
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            run_console(&options, &mut out)?;
        }
        Command::Serve {
            model,
            config,
            host,
            port,
            seed,
            batch_size,
            session_policy,
            scratch_policy,
            eos_token,
        } => {
            let mut server_config = match config {
                Some(path) => ServerConfig::from_json_file(path)?,
                None => ServerConfig::default(),
            };
            apply_overrides(
                &mut server_config,
                ServeOverrides {
                    host,
                    port,
                    seed,
                    batch_size,
                    session_policy,
                    scratch_policy,
                    eos_token,
                },
            );

            let model = Model::load(&model)
                .with_context(|| format!("failed to load model from {}", model.display()))?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start the async runtime")?;
            runtime.block_on(excoder_server::serve(Arc::new(model), server_config))?;
        }
    }

    Ok(())
}

#[derive(Debug, Default)]
struct ServeOverrides {
    host: Option<String>,
    port: Option<u16>,
    seed: Option<u64>,
    batch_size: Option<usize>,
    session_policy: Option<SessionPolicyArg>,
    scratch_policy: Option<ScratchPolicyArg>,
    eos_token: Option<TokenId>,
}

fn apply_overrides(config: &mut ServerConfig, overrides: ServeOverrides) {
    if let Some(host) = overrides.host {
        config.host = host;
    }
    if let Some(port) = overrides.port {
        config.port = port;
    }
    if let Some(batch_size) = overrides.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(policy) = overrides.session_policy {
        config.session_policy = policy.into();
    }
    if let Some(policy) = overrides.scratch_policy {
        config.engine.scratch_policy = policy.into();
    }
    config.seed = overrides.seed.or(config.seed);
    config.eos_token = overrides.eos_token.or(config.eos_token);
}
