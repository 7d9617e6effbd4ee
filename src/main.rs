use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use wikiwatch::{
    batch::{run_batch, BatchConfig, WorkerPool},
    classifier::{self, Classifier, ClientConfig, OpenAiClient, RetryPolicy},
    pipeline::{self, DetectStage, EnrichStage, FileStage, StanceStage},
};

#[derive(Debug, clap::Parser)]
#[command(version, about)]
struct CommandLine {
    /// More log output (-v debug, -vv trace); `RUST_LOG` takes precedence
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Attach line and word decompositions to every diff record
    Enrich {
        #[command(flatten)]
        batch: BatchArgs,
    },
    /// Judge every revision as weaponised or not
    Detect {
        #[command(flatten)]
        batch: BatchArgs,
        #[command(flatten)]
        llm: LlmArgs,
    },
    /// Judge the stance of revisions already judged weaponised (CSV input)
    Stance {
        #[command(flatten)]
        batch: BatchArgs,
        #[command(flatten)]
        llm: LlmArgs,
    },
    /// Label each analysis of a CSV file with a weaponization technique
    Categorize {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
        /// Column holding the analysis text
        #[arg(long, default_value = "original_text")]
        column: String,
        #[arg(long, default_value_t = 4)]
        workers: usize,
        #[command(flatten)]
        llm: LlmArgs,
    },
}

#[derive(Debug, clap::Args)]
struct BatchArgs {
    #[arg(long)]
    input_dir: PathBuf,
    #[arg(long)]
    output_dir: PathBuf,
    /// Input file extension [default: jsonl, csv for `stance`]
    #[arg(long)]
    extension: Option<String>,
    /// Worker threads [default: 12 for `enrich`, 4 otherwise]
    #[arg(long)]
    workers: Option<usize>,
}

impl BatchArgs {
    fn into_config(self, default_extension: &str, default_workers: usize) -> BatchConfig {
        BatchConfig {
            input_dir: self.input_dir,
            extension: self.extension.unwrap_or_else(|| default_extension.to_string()),
            output_dir: self.output_dir,
            workers: self.workers.unwrap_or(default_workers),
        }
    }
}

#[derive(Debug, clap::Args)]
struct LlmArgs {
    #[arg(long, default_value = classifier::DEFAULT_MODEL)]
    model: String,
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
    #[arg(long, default_value = classifier::DEFAULT_BASE_URL)]
    base_url: String,
    /// Per request
    #[arg(long, default_value_t = 120)]
    timeout_secs: u64,
    #[arg(long, default_value_t = 3)]
    max_retries: usize,
    #[arg(long, default_value_t = 300)]
    max_tokens: u32,
    #[arg(long, default_value_t = 0.0)]
    temperature: f64,
}

impl LlmArgs {
    fn build(&self) -> anyhow::Result<(OpenAiClient, RetryPolicy)> {
        let api_key = self
            .api_key
            .clone()
            .context("no API key given, use --api-key or set OPENAI_API_KEY")?;

        let config = ClientConfig {
            base_url: self.base_url.clone(),
            model: self.model.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
            temperature: self.temperature,
            max_tokens: Some(self.max_tokens),
            ..ClientConfig::new(api_key)
        };
        let client = OpenAiClient::new(&config).context("failed to create model client")?;
        let retry = RetryPolicy {
            max_retries: self.max_retries,
            ..RetryPolicy::default()
        };

        tracing::debug!(message = "Model client ready", model = client.model(), base_url = %config.base_url);
        Ok((client, retry))
    }
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_stage<S: FileStage>(config: &BatchConfig, stage: &S) -> anyhow::Result<()> {
    let report = run_batch(config, stage)
        .with_context(|| format!("`{}` stage could not start", stage.name()))?;

    if !report.is_success() {
        tracing::warn!(
            message = "Some files failed and have no output",
            stage = stage.name(),
            failed = report.failures.len(),
            written = report.written.len()
        );
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = CommandLine::parse();
    init_logging(args.verbose);

    match args.command {
        Command::Enrich { batch } => run_stage(&batch.into_config("jsonl", 12), &EnrichStage),
        Command::Detect { batch, llm } => {
            let (client, retry) = llm.build()?;
            run_stage(
                &batch.into_config("jsonl", 4),
                &DetectStage::new(&client, &retry),
            )
        }
        Command::Stance { batch, llm } => {
            let (client, retry) = llm.build()?;
            run_stage(
                &batch.into_config("csv", 4),
                &StanceStage::new(&client, &retry),
            )
        }
        Command::Categorize {
            input,
            output,
            column,
            workers,
            llm,
        } => {
            let (client, retry) = llm.build()?;
            let classifier = Classifier::new(&client, &retry);
            let rows = pipeline::categorize_file(
                &input,
                &output,
                &column,
                &classifier,
                &WorkerPool::new(workers),
            )
            .with_context(|| format!("failed to categorize `{}`", input.display()))?;

            tracing::info!(message = "Categorized file", output = %output.display(), rows);
            Ok(())
        }
    }
}
