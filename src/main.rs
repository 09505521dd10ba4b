//! tierqa CLI - Multi-model QA evaluation and difficulty tiering.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tierqa::checkpoint::{AuditLog, CheckpointStore, Partition, run_output_dir};
use tierqa::client::{EndpointRegistry, HealthStatus};
use tierqa::models::{Config, OutputFormat, RunReport};
use tierqa::pipeline::{
    DataNormalizer, DefaultPrompts, Orchestrator, PipelineContext, RunSettings, ShutdownTrigger,
    load_records, shutdown_channel,
};
use tierqa::pool::{JudgeService, ResponderPool};
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "tierqa")]
#[command(version)]
#[command(about = "Evaluate QA datasets against several models and sort items into difficulty tiers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a dataset
    Run {
        /// Input dataset (.json or .jsonl)
        #[arg(short, long)]
        input: PathBuf,

        /// Output directory (overrides output.dir)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Evaluate from scratch into a new versioned output directory
        #[arg(long)]
        reevaluate: bool,

        /// Also retry every item in the error partition afterwards, not only
        /// those in this input (input items are retried on resume)
        #[arg(long)]
        retry_errors: bool,

        /// Keep judge reasoning and timings in the output
        #[arg(long)]
        debug: bool,

        /// Partition file format: json or jsonl
        #[arg(long)]
        format: Option<OutputFormat>,

        /// Items buffered per flush
        #[arg(long)]
        batch_size: Option<usize>,

        /// Items processed concurrently
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Retry the candidates that failed on items in the error partition
    Retry {
        /// Output directory (overrides output.dir)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate configuration file
    Validate {
        /// Also check that every endpoint answers
        #[arg(long)]
        ping: bool,
    },

    /// Show example configuration
    Example,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");
}

fn print_example_config() {
    let example = r#"# tierqa configuration file

[endpoints.openai]
base_url = "https://api.openai.com/v1"
api_key_env = "OPENAI_API_KEY"
timeout_secs = 600
max_retries = 2

[endpoints.local]
base_url = "http://localhost:8000/v1"
# headers = { "X-Team" = "${TEAM_ID}" }

[[candidates]]
name = "model1"
endpoint = "openai"
id = "gpt-4o-mini"
max_tokens = 4096

[[candidates]]
name = "model2"
endpoint = "local"
id = "qwen2.5-72b-instruct"
temperature = 0.6

[[candidates]]
name = "model3"
enabled = false
endpoint = "local"
id = "llama-3.1-70b-instruct"

[judge]
endpoint = "openai"
id = "gpt-4o"
# temperature defaults to 0.0

[pipeline]
item_concurrency = 4
candidate_concurrency = 3
batch_size = 4
max_retries = 3
backoff_base_ms = 1000
timeout_secs = 600
judge_timeout_secs = 120
resume = true

[output]
dir = "output"
format = "jsonl"   # or "json"
audit_log = true
debug = false

# [prompts]
# candidate_system = "prompts/candidate.md"
# judge_system = "prompts/judge.md"
"#;
    println!("{example}");
}

fn load_config(path: &Path) -> Result<Config> {
    Config::from_file(path).with_context(|| format!("Failed to load config from {path:?}"))
}

/// First Ctrl-C fires the shutdown token; a second one exits immediately.
fn watch_for_interrupt(trigger: ShutdownTrigger) {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if trigger.trigger() {
                warn!("Second interrupt, exiting without waiting for in-flight items");
                std::process::exit(130);
            }
            warn!("Interrupt received, finishing in-flight items (Ctrl-C again to force exit)");
        }
    });
}

fn build_orchestrator(config: &Config, dir: &Path) -> Result<Orchestrator> {
    let registry =
        EndpointRegistry::from_config(config).context("Failed to set up endpoints")?;
    let slots = registry.candidate_slots(config)?;
    let judge_adapter = registry.judge_adapter(config)?;
    let prompts = Arc::new(
        DefaultPrompts::from_config(&config.prompts).context("Failed to load prompt files")?,
    );

    let store = CheckpointStore::open(dir, config.output.format, config.pipeline.batch_size)
        .with_context(|| format!("Failed to open output directory {dir:?}"))?;
    let audit = if config.output.audit_log {
        Some(Arc::new(
            AuditLog::open(&dir.join("audit.jsonl")).context("Failed to open audit log")?,
        ))
    } else {
        None
    };

    let settings = RunSettings::from_config(config);
    let judge_timeout = settings.judge_timeout;

    let (trigger, shutdown) = shutdown_channel();
    watch_for_interrupt(trigger);

    let ctx = PipelineContext::new(Arc::new(store), audit, settings, shutdown);
    Ok(Orchestrator::new(
        ResponderPool::new(slots, prompts.clone()),
        JudgeService::new(judge_adapter, prompts, judge_timeout),
        ctx,
    ))
}

fn print_report(title: &str, report: &RunReport, orchestrator: &Orchestrator) {
    let store = &orchestrator.context().store;

    println!("\n=== {title} ===");
    println!("Items:        {}", report.total_items);
    if report.validation_skipped > 0 {
        println!("Invalid:      {}", report.validation_skipped);
    }
    println!("Resumed:      {}", report.resumed);
    if report.retried > 0 {
        println!("Retried:      {}", report.retried);
    }
    if report.already_classified > 0 {
        println!("Not re-run:   {} (already classified)", report.already_classified);
    }
    println!("Classified:   {}", report.classified);
    for (tier, count) in &report.tiers {
        println!("  {tier}:        {count}");
    }
    println!("Errors:       {}", report.errored);
    if report.promoted > 0 {
        println!("Promoted:     {}", report.promoted);
    }
    if report.interrupted > 0 {
        println!("Interrupted:  {}", report.interrupted);
    }
    if report.persistence_errors > 0 {
        println!("Flush errors: {}", report.persistence_errors);
    }
    println!("Runtime:      {:.1}s", report.runtime_secs);

    let counts = store.counts();
    let totals: Vec<String> = Partition::ALL
        .iter()
        .map(|p| format!("{p}={}", counts.get(p).copied().unwrap_or(0)))
        .collect();
    println!("Stored:       {}", totals.join(" "));
    println!("Output:       {:?}", store.dir());
    if report.cancelled {
        println!("Run was interrupted; rerun the same command to resume.");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Example => {
            print_example_config();
            return Ok(());
        }

        Commands::Validate { ping } => {
            let config = load_config(&cli.config)?;

            info!("Configuration is valid");
            info!(
                "  Candidates: {} configured, {} enabled",
                config.candidates.len(),
                config.enabled_candidates()
            );
            info!("  Judge: {} via '{}'", config.judge.id, config.judge.endpoint);
            info!(
                "  Pipeline: {} items x {} candidates, batch {}",
                config.pipeline.item_concurrency,
                config.pipeline.candidate_concurrency,
                config.pipeline.batch_size
            );

            if ping {
                let registry = EndpointRegistry::from_config(&config)
                    .context("Failed to set up endpoints")?;
                let results = registry.health_check_all().await;
                let unhealthy = results
                    .iter()
                    .filter(|r| r.status != HealthStatus::Healthy)
                    .count();
                if unhealthy > 0 {
                    anyhow::bail!("{unhealthy} endpoint(s) failed the health check");
                }
            }
            return Ok(());
        }

        Commands::Run {
            input,
            output,
            reevaluate,
            retry_errors,
            debug,
            format,
            batch_size,
            concurrency,
        } => {
            let mut config = load_config(&cli.config)?;
            if debug {
                config.output.debug = true;
            }
            if let Some(format) = format {
                config.output.format = format;
            }
            if let Some(batch_size) = batch_size {
                config.pipeline.batch_size = batch_size.max(1);
            }
            if let Some(concurrency) = concurrency {
                config.pipeline.item_concurrency = concurrency.max(1);
            }

            let base = output.unwrap_or_else(|| config.output.dir.clone());
            let dir = run_output_dir(&base, config.pipeline.resume, reevaluate);
            if dir != base {
                info!(dir = %dir.display(), "Evaluating into a fresh output directory");
            }

            let records = load_records(&input)
                .with_context(|| format!("Failed to load input from {input:?}"))?;
            let normalized = DataNormalizer::new().normalize_all(records);

            let orchestrator = build_orchestrator(&config, &dir)?;
            let mut report = orchestrator.run(normalized.items).await;
            report.validation_skipped = normalized.rejected.len();
            report.total_items += report.validation_skipped;

            if retry_errors && !report.cancelled {
                let retry = orchestrator.retry_errors().await?;
                print_report("Evaluation Complete", &report, &orchestrator);
                print_report("Retry Pass Complete", &retry, &orchestrator);
            } else {
                print_report("Evaluation Complete", &report, &orchestrator);
            }
        }

        Commands::Retry { output } => {
            let config = load_config(&cli.config)?;
            let dir = output.unwrap_or_else(|| config.output.dir.clone());

            let orchestrator = build_orchestrator(&config, &dir)?;
            let report = orchestrator.retry_errors().await?;
            print_report("Retry Pass Complete", &report, &orchestrator);
        }
    }

    Ok(())
}
