use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rustydigest::backend::{InferenceBackend, OllamaBackend};
use rustydigest::classify::{DocumentTypeClassifier, Taxonomy};
use rustydigest::config::{self, Config};
use rustydigest::logging;
use rustydigest::metrics::PipelineMetrics;
use rustydigest::resources::{Capability, ModelHandle, ModelRegistry, ResourceEstimator};
use rustydigest::summarize::{DocumentTree, HierarchicalSummarizer, SummarizerSettings};
use rustydigest::tasks::{DirectoryStructureSource, SqliteStore, TaskConsumer, TaskPorts};

#[derive(Parser)]
#[command(
    name = "rusty-digest",
    about = "Summarize and classify documents within a model's context budget"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create or upgrade the task database.
    Init,
    /// Process every pending task once.
    Consume,
    /// Summarize a structure tree JSON file and print the result.
    Summarize {
        #[arg(long)]
        structure: PathBuf,
        /// Print every node's summary and embedding as JSON instead of the root summary.
        #[arg(long)]
        tree: bool,
    },
    /// Classify the contents of a text file.
    Classify {
        #[arg(long)]
        input: PathBuf,
    },
    /// Print the current token budget of every model.
    Estimate,
    /// Download every declared model into the local cache.
    Pull,
}

#[tokio::main]
async fn main() {
    logging::init_tracing();
    if let Err(err) = run().await {
        tracing::error!(error = %format!("{err:#}"), "rusty-digest failed");
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = config::load().context("failed to load configuration")?;

    match cli.command {
        Command::Init => {
            let store = SqliteStore::connect(&config.database_path).await?;
            store.close().await;
            println!("Database ready at {}", config.database_path.display());
        }
        Command::Consume => consume(&config).await?,
        Command::Summarize {
            structure,
            tree: per_node,
        } => {
            let raw = tokio::fs::read_to_string(&structure)
                .await
                .with_context(|| format!("failed to read {}", structure.display()))?;
            let tree = DocumentTree::from_json(&raw)?;
            let registry = ModelRegistry::from_config(&config)?;
            let metrics = Arc::new(PipelineMetrics::new());
            let summarizer = summarizer(&config, &registry, metrics, per_node).await?;
            if per_node {
                let nodes = summarizer.summarize_tree(&tree, tree.root()).await;
                println!("{}", serde_json::to_string_pretty(&nodes)?);
            } else {
                let node_id = structure.display().to_string();
                let result = summarizer.summarize_document(&tree, &node_id).await;
                println!("{}", result.text);
            }
        }
        Command::Classify { input } => {
            let text = tokio::fs::read_to_string(&input)
                .await
                .with_context(|| format!("failed to read {}", input.display()))?;
            let registry = ModelRegistry::from_config(&config)?;
            let metrics = Arc::new(PipelineMetrics::new());
            let classifier = classifier(&config, &registry, metrics).await?;
            println!("{}", classifier.classify(&text).await);
        }
        Command::Estimate => {
            let registry = ModelRegistry::from_config(&config)?;
            let estimator = ResourceEstimator::from_config(&config);
            for capability in Capability::ALL {
                let model = registry.resolve(capability).await?;
                let budget = estimator.estimate(&model);
                let available = budget
                    .available_bytes
                    .map_or_else(|| "unknown".to_string(), |bytes| bytes.to_string());
                println!(
                    "{capability}: model={} device={} available_bytes={available} \
                     bytes_per_token={} max_tokens={} approx_characters={}",
                    model.serving_name,
                    model.device,
                    budget.bytes_per_token_estimate,
                    budget.max_tokens,
                    budget.approx_characters(model.chars_per_token),
                );
            }
        }
        Command::Pull => {
            let registry = ModelRegistry::from_config(&config)?;
            for model in registry.prefetch_all().await? {
                println!(
                    "{}: {} -> {}",
                    model.capability,
                    model.name,
                    model.local_cache_path.display()
                );
            }
        }
    }
    Ok(())
}

async fn consume(config: &Config) -> Result<()> {
    let store = Arc::new(SqliteStore::connect(&config.database_path).await?);
    let registry = ModelRegistry::from_config(config)?;
    let metrics = Arc::new(PipelineMetrics::new());

    let summarizer = summarizer(config, &registry, metrics.clone(), false).await?;
    let classifier = classifier(config, &registry, metrics.clone()).await?;
    let ports = TaskPorts {
        tasks: store.clone(),
        nodes: store.clone(),
        results: store.clone(),
        structures: Arc::new(DirectoryStructureSource::new(config.structure_dir.clone())),
    };

    let consumer = TaskConsumer::new(ports, Arc::new(summarizer), Arc::new(classifier))
        .with_metrics(metrics);
    let report = consumer.consume().await?;
    println!("{}", report.message());
    store.close().await;
    Ok(())
}

fn backend(config: &Config) -> Result<Arc<dyn InferenceBackend>> {
    let backend = OllamaBackend::new(
        config.inference_url.clone(),
        Duration::from_secs(config.request_timeout_secs),
    )?;
    Ok(Arc::new(backend))
}

async fn summarizer(
    config: &Config,
    registry: &ModelRegistry,
    metrics: Arc<PipelineMetrics>,
    with_embedder: bool,
) -> Result<HierarchicalSummarizer> {
    let model = registry
        .resolve(Capability::Summarizer)
        .await
        .context("failed to resolve summarizer model")?;
    let embedder = if with_embedder {
        optional_embedder(registry).await
    } else {
        None
    };
    Ok(HierarchicalSummarizer::new(
        backend(config)?,
        model,
        embedder,
        ResourceEstimator::from_config(config),
        SummarizerSettings::from_config(config),
    )
    .with_metrics(metrics))
}

async fn classifier(
    config: &Config,
    registry: &ModelRegistry,
    metrics: Arc<PipelineMetrics>,
) -> Result<DocumentTypeClassifier> {
    let model = registry
        .resolve(Capability::Classifier)
        .await
        .context("failed to resolve classifier model")?;
    let taxonomy = Taxonomy::load(config.taxonomy_path.as_deref())?;
    Ok(DocumentTypeClassifier::new(backend(config)?, model, taxonomy).with_metrics(metrics))
}

/// Node embeddings are skipped when the embedder cannot be made available.
async fn optional_embedder(registry: &ModelRegistry) -> Option<Arc<ModelHandle>> {
    match registry.resolve(Capability::Embedder).await {
        Ok(model) => Some(model),
        Err(error) => {
            tracing::warn!(error = %error, "Embedder unavailable; node embeddings disabled");
            None
        }
    }
}
