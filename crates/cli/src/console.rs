//! Console driver: one generation session, tokens streamed to a writer as they arrive.

use anyhow::{Context, Result};
use excoder_llm::{
    estimate_bytes_per_token, DecodeEvent, DecodeLoop, GenerationOutput, GenerationParams, Model,
    SamplingParams, ScratchBudget, ScratchPolicy, TokenId,
};
use std::io::{self, IsTerminal, Read, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::info;

/// Prompts picked from when neither an argument nor piped input is given.
pub const RANDOM_PROMPTS: [&str; 10] = [
    "So",
    "Once upon a time",
    "When",
    "The",
    "After",
    "If",
    "import",
    "He",
    "She",
    "They",
];

#[derive(Debug, Clone)]
pub struct ConsoleOptions {
    pub model: PathBuf,
    pub prompt: Option<String>,
    pub seed: Option<u64>,
    pub n_predict: usize,
    pub batch_size: usize,
    pub sampling: SamplingParams,
    pub eos_token: Option<TokenId>,
    pub scratch_margin_bytes: usize,
    pub scratch_policy: ScratchPolicy,
}

#[derive(Debug, Clone)]
pub struct ConsoleReport {
    pub seed: u64,
    pub prompt: String,
    pub bytes_per_token: usize,
    pub load_time: Duration,
    pub total_time: Duration,
    pub output: GenerationOutput,
}

pub fn clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Piped input wins over the random list. An empty pipe counts as no input.
pub fn resolve_prompt(piped: Option<String>, seed: u64) -> String {
    match piped {
        Some(text) if !text.is_empty() => text,
        _ => {
            let mut rng = fastrand::Rng::with_seed(seed);
            RANDOM_PROMPTS[rng.usize(..RANDOM_PROMPTS.len())].to_string()
        }
    }
}

fn read_piped_stdin() -> Result<Option<String>> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }
    let mut text = String::new();
    stdin
        .lock()
        .read_to_string(&mut text)
        .context("failed to read prompt from stdin")?;
    Ok(Some(text))
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Loads the model, runs one session and prints the timing summary.
pub fn run_console<W: Write>(options: &ConsoleOptions, out: &mut W) -> Result<ConsoleReport> {
    let total_start = Instant::now();
    let seed = options.seed.unwrap_or_else(clock_seed);
    writeln!(out, "seed = {seed}")?;

    let load_start = Instant::now();
    let model = Model::load(&options.model)
        .with_context(|| format!("failed to load model from {}", options.model.display()))?;
    let load_time = load_start.elapsed();

    let bytes_per_token =
        estimate_bytes_per_token(&model).context("scratch memory estimate failed")?;
    let budget = ScratchBudget::new(bytes_per_token, options.scratch_margin_bytes);

    let prompt = match &options.prompt {
        Some(prompt) => prompt.clone(),
        None => resolve_prompt(read_piped_stdin()?, seed),
    };
    let prompt_tokens = model.vocab().tokenize(&prompt);
    info!(
        prompt_tokens = prompt_tokens.len(),
        n_predict = options.n_predict,
        "starting generation"
    );

    let params = GenerationParams {
        max_tokens: options.n_predict,
        batch_size: options.batch_size,
        sampling: options.sampling,
        seed,
        eos_token: options.eos_token.or_else(|| model.end_of_text_token()),
    };
    let mut state = model.new_state(budget.arena(options.batch_size, options.scratch_policy));
    let vocab = model.vocab();

    let mut write_error: Option<io::Error> = None;
    let output = DecodeLoop::new(&model, params)
        .with_scratch_budget(budget)
        .run(&mut state, &prompt_tokens, |event| {
            if write_error.is_some() {
                return;
            }
            let bytes = match event {
                DecodeEvent::PromptChunk(chunk) => vocab.decode_bytes(chunk),
                DecodeEvent::Token(token) => vocab.decode_bytes(&[token]),
            };
            if let Err(err) = out.write_all(&bytes).and_then(|()| out.flush()) {
                write_error = Some(err);
            }
        })
        .context("prediction failed")?;
    if let Some(err) = write_error {
        return Err(err).context("failed to write generated text");
    }

    let timings = output.timings;
    let total_time = total_start.elapsed();
    writeln!(out)?;
    writeln!(out)?;
    writeln!(out, "mem per token = {bytes_per_token} bytes")?;
    writeln!(out, "    load time = {:.2} ms", millis(load_time))?;
    writeln!(out, "  sample time = {:.2} ms", millis(timings.sample))?;
    writeln!(
        out,
        " predict time = {:.2} ms / {:.2} ms per token",
        millis(timings.predict),
        millis(timings.predict_per_position())
    )?;
    writeln!(out, "   total time = {:.2} ms", millis(total_time))?;

    Ok(ConsoleReport {
        seed,
        prompt,
        bytes_per_token,
        load_time,
        total_time,
        output,
    })
}
