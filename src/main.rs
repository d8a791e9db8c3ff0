use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use smart_save::check::{check_integrity, CheckConfig};
use smart_save::inspect::{open_index, print_entries, print_stats};
use smart_save::metrics::{PrometheusMetrics, SharedMetrics};
use smart_save::store::{ContentStore, INDEX_DIR, INDEX_FILE};
use smart_save::{
    DigestAlgorithm, ImageFormat, ImageSink, MetadataCodec, ProvenanceContext, SaveConfig,
    SaveRequest, SaverRouter,
};

#[derive(Parser)]
#[command(version)]
struct Cli {
    #[arg(long, global = true, help = "Path to a smart-save.toml config file")]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        default_value = "info",
        help = "Log level (error, warn, info, debug, trace). Can also be set via RUST_LOG env var"
    )]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Parser, Debug)]
pub struct SaveArgs {
    #[arg(required = true, help = "Encoded image files to save")]
    inputs: Vec<PathBuf>,

    #[arg(long, short, default_value = "%date%/img_%counter%", help = "Naming template")]
    template: String,

    #[arg(long, help = "Destination root (SMART_SAVE_OUTPUT_DIR overrides it)")]
    root: Option<PathBuf>,

    #[arg(long, help = "Image format (png, jpeg, webp, bmp, tiff); guessed from the extension if omitted")]
    format: Option<ImageFormat>,

    #[arg(long, help = "JSON file with the provenance context")]
    provenance: Option<PathBuf>,

    #[arg(long, help = "JSON prompt graph to pull model, seed and prompts from")]
    graph: Option<PathBuf>,

    #[arg(long)]
    prompt: Option<String>,

    #[arg(long)]
    seed: Option<i64>,

    #[arg(long)]
    model: Option<String>,

    #[arg(long, help = "Print Prometheus metrics after saving")]
    print_metrics: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Save images
    Save(SaveArgs),

    /// Print the provenance stored with an image
    Extract {
        path: PathBuf,

        #[arg(long)]
        pretty: bool,
    },

    /// Rebuild the content index from the files on disk
    RebuildIndex {
        #[arg(long, default_value = "output")]
        root: PathBuf,

        #[arg(long, help = "Discard the existing log and hash every file again")]
        from_scratch: bool,
    },

    /// Check indexed files against their digests
    Check(CheckConfig),

    /// Inspect the content index
    Inspect {
        #[arg(long, default_value = "output")]
        root: PathBuf,

        #[command(subcommand)]
        command: InspectCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum InspectCommand {
    Stats,
    List {
        #[arg(long)]
        limit: Option<usize>,
    },
}

fn setup_tracing(log_level: &str) {
    // Try to use RUST_LOG env var first, fall back to CLI flag
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| {
            eprintln!("Invalid log level '{}', falling back to 'info'", log_level);
            EnvFilter::new("info")
        });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    setup_tracing(&cli.log_level);

    let config = match &cli.config {
        Some(path) => SaveConfig::load_from_file(path)?,
        None => SaveConfig::default(),
    };

    match cli.command {
        Command::Save(args) => run_save(args, config)?,
        Command::Extract { path, pretty } => extract(path, pretty, &config)?,
        Command::RebuildIndex { root, from_scratch } => rebuild_index(root, from_scratch, &config)?,
        Command::Check(args) => check_integrity(args, &config)?,
        Command::Inspect { root, command } => {
            let store = open_index(&root, config.digest)?;
            match command {
                InspectCommand::Stats => print_stats(&store)?,
                InspectCommand::List { limit } => print_entries(&store, limit),
            }
        }
    }
    Ok(())
}

fn build_provenance(args: &SaveArgs) -> Result<ProvenanceContext> {
    let mut provenance = match &args.provenance {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read provenance file {}", path.display()))?;
            ProvenanceContext::from_json_str(&text)
                .with_context(|| format!("Failed to parse provenance file {}", path.display()))?
        }
        None => ProvenanceContext::new(),
    };
    if let Some(path) = &args.graph {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read prompt graph {}", path.display()))?;
        let graph: serde_json::Value = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse prompt graph {}", path.display()))?;
        provenance.fill_from_graph(&graph);
    }
    if let Some(prompt) = &args.prompt {
        provenance.insert("prompt", prompt.as_str());
    }
    if let Some(seed) = args.seed {
        provenance.insert("seed", seed);
    }
    if let Some(model) = &args.model {
        provenance.insert("model", model.as_str());
    }
    Ok(provenance)
}

#[tokio::main]
async fn run_save(args: SaveArgs, config: SaveConfig) -> Result<()> {
    let prometheus = if args.print_metrics {
        Some(PrometheusMetrics::new()?)
    } else {
        None
    };
    let metrics = match &prometheus {
        Some(collector) => SharedMetrics::new(Arc::new(collector.clone())),
        None => SharedMetrics::default(),
    };
    let router = Arc::new(SaverRouter::new(config, metrics));
    let provenance = build_provenance(&args)?;

    // The pipeline is synchronous; each file gets its own blocking task.
    let mut tasks = JoinSet::new();
    for input in args.inputs.iter().cloned() {
        let router = Arc::clone(&router);
        let template = args.template.clone();
        let root = args.root.clone();
        let provenance = provenance.clone();
        let format = args.format;

        tasks.spawn_blocking(move || -> Result<_> {
            let format = match format {
                Some(format) => format,
                None => ImageFormat::from_path(&input)
                    .ok_or_else(|| anyhow!("cannot tell the image format of {}", input.display()))?,
            };
            let bytes = std::fs::read(&input)
                .with_context(|| format!("Failed to read {}", input.display()))?;
            let mut request = SaveRequest::new(bytes, format, template).with_provenance(provenance);
            if let Some(root) = root {
                request = request.with_root(root);
            }
            let outcome = router
                .save(request)
                .with_context(|| format!("Failed to save {}", input.display()))?;
            Ok(outcome)
        });
    }

    let total = args.inputs.len();
    let mut failed = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined? {
            Ok(outcome) => {
                let note = if outcome.deduplicated { " (duplicate)" } else { "" };
                println!("{} {}{}", outcome.digest, outcome.path.display(), note);
            }
            Err(e) => {
                error!("{e:#}");
                failed += 1;
            }
        }
    }

    if let Some(collector) = prometheus {
        print!("{}", collector.gather_text()?);
    }
    if failed > 0 {
        anyhow::bail!("{} of {} saves failed", failed, total);
    }
    info!(saved = total, "done");
    Ok(())
}

fn extract(path: PathBuf, pretty: bool, config: &SaveConfig) -> Result<()> {
    let codec = MetadataCodec::new(config.embed_parameters_text);
    let record = match codec.read_provenance(&path)? {
        Some(record) => record,
        None => {
            eprintln!("No provenance found in {}", path.display());
            return Ok(());
        }
    };
    if pretty {
        let value: serde_json::Value = serde_json::from_str(record.as_str())?;
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("{}", record.as_str());
    }
    Ok(())
}

fn rebuild_index(root: PathBuf, from_scratch: bool, config: &SaveConfig) -> Result<()> {
    let algorithm: DigestAlgorithm = config.digest;
    if from_scratch {
        let log = root.join(INDEX_DIR).join(INDEX_FILE);
        match std::fs::remove_file(&log) {
            Ok(()) => info!(log = %log.display(), "removed index log"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("Failed to remove {}", log.display())),
        }
    }
    let store = ContentStore::open(&root, algorithm, config.durability, false)?;
    let appended = store.reconcile()?;
    println!("Indexed {} new file(s); {} digest(s) in total", appended, store.len());
    Ok(())
}
