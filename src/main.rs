use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use chorus::config::Config;
use chorus::context::{MAX_CONTEXT_BYTES, load_context};
use chorus::dispatch::ImageAttachment;
use chorus::dispatch::async_poll::HttpJobBackend;
use chorus::dispatch::http::HttpDispatch;
use chorus::dispatch::registry::Registry;
use chorus::document::{DocumentMeta, LiveDocument};
use chorus::error::ChorusError;
use chorus::invoker::Invoker;
use chorus::notify::{DesktopNotifier, NoopNotifier, Notifier};
use chorus::orchestrator::{Orchestrator, QueryRequest, QueryRun};
use chorus::persist::persist_run;
use chorus::poller::JobPoller;
use chorus::synthesis::{ModelSummarizer, StageManager, SynthesisDepth};

#[derive(Parser)]
#[command(name = "chorus", version, about = "Ask several AI models the same question at once")]
struct Cli {
    /// Debug logging (RUST_LOG still wins)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit log lines as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send a prompt to several models and collect their answers
    Query(QueryArgs),
    /// List configured models
    Models,
    /// List model presets
    Presets,
}

#[derive(Args)]
struct QueryArgs {
    prompt: String,

    /// Comma-separated model ids
    #[arg(short, long, value_delimiter = ',')]
    models: Vec<String>,

    /// Named model set, used when --models is absent
    #[arg(short, long)]
    preset: Option<String>,

    /// Timeout in seconds for fast models
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Per-model timeout, e.g. o3=900
    #[arg(long = "model-timeout", value_parser = parse_model_timeout)]
    model_timeouts: Vec<(String, u64)>,

    /// Live document path
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Image attached for vision-capable models
    #[arg(short, long)]
    image: Option<PathBuf>,

    /// File or directory prepended to the prompt as context
    #[arg(short, long)]
    context: Option<PathBuf>,

    /// Synthesize the answers as tiers complete
    #[arg(short, long)]
    synthesize: bool,

    #[arg(long, value_enum)]
    depth: Option<SynthesisDepth>,

    #[arg(long)]
    synthesis_model: Option<String>,

    /// Ask models to search the web where supported
    #[arg(long)]
    web_search: bool,

    /// Cap on generated tokens for direct models
    #[arg(long)]
    max_tokens: Option<u64>,

    #[arg(long)]
    results_dir: Option<PathBuf>,

    /// Desktop notification when the run finishes
    #[arg(long)]
    notify: bool,

    /// Disable the progress display on stderr
    #[arg(long)]
    no_progress: bool,
}

fn parse_model_timeout(raw: &str) -> Result<(String, u64), String> {
    let (model, secs) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected MODEL=SECONDS, got '{raw}'"))?;
    let secs: u64 = secs
        .trim()
        .parse()
        .map_err(|e| format!("invalid seconds in '{raw}': {e}"))?;
    if secs == 0 {
        return Err(format!("timeout for '{model}' must be positive"));
    }
    Ok((model.trim().to_string(), secs))
}

fn init_tracing(verbose: bool, json: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// `.env` beside the binary first, then the usual CWD search.
fn load_dotenv() {
    let beside_exe = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(".env")))
        .filter(|p| p.exists());
    match beside_exe {
        Some(path) => {
            dotenvy::from_path(&path).ok();
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json);
    load_dotenv();

    let config = Config::load().context("loading configuration")?;
    let registry = Arc::new(Registry::from_config(&config));

    match cli.command {
        Command::Models => {
            print_models(&registry);
            Ok(())
        }
        Command::Presets => {
            for (name, models) in registry.presets() {
                println!("{name:<12} {}", models.join(", "));
            }
            Ok(())
        }
        Command::Query(args) => run_query(args, &config, registry).await,
    }
}

fn print_models(registry: &Registry) {
    println!(
        "{:<24} {:<12} {:<20} {:<11} {:<7} TIMEOUT",
        "MODEL", "PROVIDER", "BACKEND", "TIER", "VISION"
    );
    for m in registry.list() {
        println!(
            "{:<24} {:<12} {:<20} {:<11} {:<7} {}s",
            m.id,
            m.provider,
            m.backend_name(),
            m.tier().as_str(),
            if m.vision { "yes" } else { "no" },
            m.timeout_secs
        );
    }
}

async fn run_query(args: QueryArgs, config: &Config, registry: Arc<Registry>) -> anyhow::Result<()> {
    let defaults = &config.defaults;

    let models = if args.models.is_empty() {
        let name = args.preset.as_deref().unwrap_or(&defaults.preset);
        registry
            .preset(name)
            .map(<[String]>::to_vec)
            .ok_or_else(|| ChorusError::Config(format!("unknown preset '{name}'")))?
    } else {
        args.models.clone()
    };

    let image = match args.image {
        Some(ref path) => Some(
            ImageAttachment::load(path)
                .await
                .with_context(|| format!("loading image {}", path.display()))?,
        ),
        None => None,
    };

    let prompt = match args.context {
        Some(ref path) => match load_context(path, MAX_CONTEXT_BYTES).await {
            Some(ctx) => ctx.apply(&args.prompt),
            None => args.prompt.clone(),
        },
        None => args.prompt.clone(),
    };

    let http = Arc::new(HttpDispatch::new().context("building HTTP client")?);
    let jobs = Arc::new(HttpJobBackend::new().context("building HTTP client")?);
    let invoker = Arc::new(
        Invoker::new(http.clone())
            .with_web_search(args.web_search)
            .with_max_tokens(args.max_tokens),
    );
    let poller = Arc::new(JobPoller::new(jobs));

    let output = args.output.clone().unwrap_or_else(|| defaults.output.clone());
    let document = Arc::new(LiveDocument::new(output, defaults.long_prompt_threshold));

    let synthesis = if args.synthesize {
        let id = args
            .synthesis_model
            .as_deref()
            .unwrap_or(&defaults.synthesis_model);
        match registry.lookup(id) {
            Ok(descriptor) if !descriptor.is_background() => {
                let summarizer = Arc::new(ModelSummarizer::new(http.clone(), descriptor.clone()));
                Some(Arc::new(StageManager::new(
                    summarizer,
                    document.clone(),
                    args.prompt.clone(),
                    args.depth.unwrap_or(defaults.synthesis_depth),
                )))
            }
            Ok(_) => {
                tracing::warn!(model = id, "synthesis model must answer directly, synthesis disabled");
                None
            }
            Err(e) => {
                tracing::warn!(model = id, "{}, synthesis disabled", e.user_message());
                None
            }
        }
    } else {
        None
    };

    let req = QueryRequest {
        prompt,
        models,
        default_timeout: defaults.quick_timeout(args.timeout),
        model_timeouts: args
            .model_timeouts
            .iter()
            .map(|(m, secs)| (m.clone(), Duration::from_secs(*secs)))
            .collect::<HashMap<_, _>>(),
        image,
        meta: DocumentMeta {
            image: args.image.clone(),
            context: args.context.clone(),
            started_at: None,
        },
        render_interval: (!args.no_progress)
            .then(|| Duration::from_millis(defaults.render_interval_ms.max(50))),
    };

    let orchestrator = Orchestrator::new(registry, invoker, poller);
    let run = orchestrator
        .run(&req, document.clone(), synthesis)
        .await
        .context("query run failed")?;

    let results_dir = args
        .results_dir
        .clone()
        .unwrap_or_else(|| defaults.results_dir.clone());
    let run_dir = persist_run(&results_dir, &run)
        .await
        .context("persisting results")?;

    print_summary(&run, &document, &run_dir);

    let notifier: Box<dyn Notifier> = if args.notify {
        Box::new(DesktopNotifier::default())
    } else {
        Box::new(NoopNotifier)
    };
    notifier
        .announce(
            "chorus",
            &format!(
                "{} of {} models answered",
                run.success_count(),
                run.outcomes.len()
            ),
        )
        .await;

    Ok(())
}

fn print_summary(run: &QueryRun, document: &LiveDocument, run_dir: &std::path::Path) {
    for o in &run.outcomes {
        let detail = match (&o.error, o.latency_ms) {
            (Some(err), _) => err.clone(),
            (None, Some(ms)) => format!("{:.1}s", ms as f64 / 1000.0),
            (None, None) => String::new(),
        };
        println!("{:<24} {:<8} {detail}", o.model, o.status.as_str());
    }
    for id in &run.unresolved {
        println!("{id:<24} skipped  not configured");
    }
    if let Some(ref s) = run.synthesis {
        let kind = if s.preliminary { "preliminary" } else { "final" };
        println!("synthesis: {kind} ({})", s.trigger.as_str());
    }
    println!("document: {}", document.path().display());
    println!("results:  {}", run_dir.display());
}
