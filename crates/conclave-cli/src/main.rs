//! `conclave` -- CLI binary for the deliberation engine.
//!
//! Provides the following subcommands:
//!
//! - `conclave deliberate` -- Run one query through the council.
//! - `conclave models` -- List the models the registry knows about.
//! - `conclave config` -- Show the resolved configuration.
//!
//! Exit codes follow the gate contract: 0 pass / synthesis produced,
//! 1 fail, 2 unclear or low confidence, 3 insufficient panel,
//! 4 system error.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use conclave_core::{BiasAuditor, MetadataProvider, Orchestrator, TranscriptStore};
use conclave_types::{CouncilConfig, CouncilError, EventKind, Mode, Query, Tier, VerdictType};

/// conclave deliberation engine CLI.
#[derive(Parser)]
#[command(name = "conclave", about = "Multi-model deliberation engine", version)]
struct Cli {
    /// Enable verbose (debug-level) logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file path (JSON). Defaults and environment apply
    /// when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Run one query through the council.
    Deliberate(DeliberateArgs),

    /// List the models the registry knows about.
    Models,

    /// Show the resolved configuration.
    Config,
}

#[derive(clap::Args)]
struct DeliberateArgs {
    /// The query to deliberate.
    prompt: String,

    /// Chairman behavior: consensus, debate, or binary-verdict.
    #[arg(long, default_value = "consensus")]
    mode: String,

    /// Verdict type: free-form, binary, or rubric.
    #[arg(long = "verdict-type", default_value = "free-form")]
    verdict_type: String,

    /// Panel tier: quick, standard, high, or frontier.
    #[arg(long, default_value = "standard")]
    tier: String,

    /// Opaque snapshot id pinning the input (e.g. a commit hash).
    #[arg(long)]
    snapshot: Option<String>,

    /// Rubric focus tag (e.g. Security, Performance).
    #[arg(long)]
    focus: Option<String>,

    /// Session deadline in milliseconds.
    #[arg(long)]
    deadline_ms: Option<u64>,

    /// Stream Stage 3 tokens to stderr as they arrive.
    #[arg(long)]
    stream: bool,

    /// Reject any prompt material outside the declared snapshot.
    #[arg(long)]
    isolate: bool,

    /// Print the full result as JSON instead of the synthesis text.
    #[arg(long)]
    json: bool,
}

fn load_config(path: Option<&PathBuf>) -> conclave_types::Result<CouncilConfig> {
    match path {
        Some(path) => CouncilConfig::load(path),
        None => CouncilConfig::from_env(),
    }
}

fn parse_mode(s: &str) -> anyhow::Result<Mode> {
    match s {
        "consensus" => Ok(Mode::Consensus),
        "debate" => Ok(Mode::Debate),
        "binary-verdict" => Ok(Mode::BinaryVerdict),
        other => anyhow::bail!("unknown mode '{other}'"),
    }
}

fn parse_verdict_type(s: &str) -> anyhow::Result<VerdictType> {
    match s {
        "free-form" => Ok(VerdictType::FreeForm),
        "binary" => Ok(VerdictType::Binary),
        "rubric" => Ok(VerdictType::Rubric),
        other => anyhow::bail!("unknown verdict type '{other}'"),
    }
}

async fn deliberate(config: CouncilConfig, args: DeliberateArgs) -> i32 {
    let mut query = Query::new(args.prompt)
        .with_tier(Tier::parse(&args.tier).unwrap_or_default());
    query.mode = match parse_mode(&args.mode) {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("error: {e}");
            return 4;
        }
    };
    query.verdict_type = match parse_verdict_type(&args.verdict_type) {
        Ok(vt) => vt,
        Err(e) => {
            eprintln!("error: {e}");
            return 4;
        }
    };
    query.snapshot_id = args.snapshot;
    query.rubric_focus = args.focus;
    query.deadline_ms = args.deadline_ms;
    query.streaming = args.stream;
    query.context_isolation = args.isolate;

    let registry = MetadataProvider::from_config(&config);
    let gateway = conclave_llm::build_gateway(config.offline);
    let transcripts = TranscriptStore::new(config.transcript_root.clone());
    let auditor = Arc::new(Mutex::new(BiasAuditor::load(
        &config.transcript_root.join("bias-audit.json"),
    )));

    let orchestrator = Orchestrator::new(config, registry, gateway)
        .with_transcripts(transcripts)
        .with_auditor(auditor);

    // Mirror stage-3 tokens to stderr while streaming.
    if args.stream {
        let bus = orchestrator.bus();
        let mut subscription = bus.subscribe();
        tokio::spawn(async move {
            while let Some(event) = subscription.next().await {
                if event.kind == EventKind::Stage3Token {
                    if let Some(text) = event.payload.get("text").and_then(|t| t.as_str()) {
                        eprint!("{text}");
                    }
                }
                if event.kind.is_terminal() {
                    eprintln!();
                    break;
                }
            }
        });
    }

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_cancel.cancel();
        }
    });

    match orchestrator.deliberate_with_cancel(query, cancel).await {
        Ok(result) => {
            if args.json {
                match serde_json::to_string_pretty(&result) {
                    Ok(json) => println!("{json}"),
                    Err(e) => {
                        eprintln!("error: {e}");
                        return 4;
                    }
                }
            } else {
                println!("{}", result.synthesis);
                if let Some(verdict) = result.verdict() {
                    eprintln!(
                        "verdict: {verdict:?} (confidence {:.2})",
                        result
                            .aggregate
                            .binary
                            .map(|b| b.confidence)
                            .unwrap_or_default()
                    );
                }
                if let Some(dir) = result.transcript_dir.as_ref() {
                    eprintln!("transcript: {}", dir.display());
                }
                for notice in &result.notices {
                    eprintln!("degraded: {}", notice.message);
                }
            }
            result.exit_code()
        }
        Err(err) => {
            eprintln!("error: {err}");
            err.exit_code()
        }
    }
}

async fn list_models(config: CouncilConfig) -> i32 {
    let registry = MetadataProvider::from_config(&config);
    for descriptor in registry.all().await {
        println!(
            "{:<36} {:<10} tier={:<9} quality={:.2} ctx={}k",
            descriptor.id,
            descriptor.provider,
            descriptor.tier.as_str(),
            descriptor.quality,
            descriptor.context_window / 1000,
        );
    }
    0
}

fn show_config(config: &CouncilConfig) -> i32 {
    match serde_json::to_string_pretty(config) {
        Ok(json) => {
            println!("{json}");
            0
        }
        Err(e) => {
            eprintln!("error: {e}");
            4
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match load_config(cli.config.as_ref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            let code = match err {
                CouncilError::ConfigInvalid { .. } => 4,
                other => other.exit_code(),
            };
            std::process::exit(code);
        }
    };

    let code = match cli.command {
        Commands::Deliberate(args) => deliberate(config, args).await,
        Commands::Models => list_models(config).await,
        Commands::Config => show_config(&config),
    };
    std::process::exit(code);
}
