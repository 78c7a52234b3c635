use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use curio_core::{AppConfig, Item, ItemKind};
use curio_storage::{verify_connection, Gateway, LocalStore};
use curio_sync::{
    apply_retention, duplicate_groups, stage_import, usable_keys, BatchEnricher, ConflictAction,
    HttpAnalyzer, Progress, ProgressSink, RetentionPolicy,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "curio")]
#[command(about = "Curio saved-items collection manager")]
struct Cli {
    /// Directory holding the local store and configuration.
    #[arg(long, default_value = ".curio", global = true)]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List items, newest first.
    List {
        #[arg(long)]
        tag: Option<String>,
        #[arg(long)]
        category: Option<String>,
    },
    /// Import a bookmarks export (.json grouped export or .html).
    Import {
        file: PathBuf,
        /// Applied to every duplicate-content conflict, in order.
        #[arg(long, value_enum, default_value_t = OnConflict::Skip)]
        on_conflict: OnConflict,
    },
    /// Scan for duplicate links; prune them with --keep.
    Dedup {
        #[arg(long, value_enum)]
        keep: Option<KeepPolicy>,
    },
    /// Run AI enrichment over the collection or a filtered subset.
    Enrich {
        #[arg(long)]
        tag: Option<String>,
        #[arg(long)]
        category: Option<String>,
    },
    /// Analyze a single item by id, without the batch retry loop.
    Analyze { id: String },
    /// Check remote credentials without mutating anything.
    Verify {
        #[arg(long)]
        endpoint: String,
        #[arg(long)]
        token: String,
    },
    /// Show or update the stored configuration.
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigAction {
    Show,
    /// Update fields and persist. Remote settings are verified against
    /// the backend before the change is committed.
    Set {
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long)]
        token: Option<String>,
        /// Replaces the analysis key list; repeat for multiple keys.
        #[arg(long = "analysis-key")]
        analysis_keys: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OnConflict {
    Keep,
    Skip,
    SkipAll,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KeepPolicy {
    Newest,
    Oldest,
}

struct ConsoleProgress;

impl ProgressSink for ConsoleProgress {
    fn report(&self, progress: Progress) {
        eprintln!("{} {}/{}", progress.label, progress.processed, progress.total);
    }
}

fn kind_label(kind: ItemKind) -> &'static str {
    match kind {
        ItemKind::Link => "link",
        ItemKind::Note => "note",
        ItemKind::Snippet => "snippet",
    }
}

fn matches_filter(item: &Item, tag: Option<&str>, category: Option<&str>) -> bool {
    if let Some(tag) = tag {
        if !item.tags.iter().any(|t| t == tag) {
            return false;
        }
    }
    if let Some(category) = category {
        if item.effective_category() != category {
            return false;
        }
    }
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let local = LocalStore::new(&cli.data_dir);
    let config = local.load_config().await.context("loading configuration")?;
    let gateway = Gateway::from_config(&config, &cli.data_dir)?;

    match cli.command {
        Commands::List { tag, category } => list(&gateway, tag, category).await,
        Commands::Import { file, on_conflict } => import(&gateway, &file, on_conflict).await,
        Commands::Dedup { keep } => dedup(&gateway, keep).await,
        Commands::Enrich { tag, category } => enrich(&gateway, &config, tag, category).await,
        Commands::Analyze { id } => analyze(&gateway, &config, &id).await,
        Commands::Verify { endpoint, token } => {
            verify_connection(&endpoint, &token).await?;
            println!("connection verified: {endpoint}");
            Ok(())
        }
        Commands::Config { action } => match action {
            None | Some(ConfigAction::Show) => show_config(&config),
            Some(ConfigAction::Set {
                endpoint,
                token,
                analysis_keys,
            }) => set_config(&local, config, endpoint, token, analysis_keys).await,
        },
    }
}

async fn set_config(
    local: &LocalStore,
    mut config: AppConfig,
    endpoint: Option<String>,
    token: Option<String>,
    analysis_keys: Vec<String>,
) -> Result<()> {
    if let Some(endpoint) = endpoint {
        config.api_endpoint = Some(endpoint).filter(|s| !s.is_empty());
    }
    if let Some(token) = token {
        config.auth_token = Some(token).filter(|s| !s.is_empty());
    }
    if !analysis_keys.is_empty() {
        config.analysis_keys = analysis_keys;
    }

    // A bad credential must block the switch into remote mode.
    if config.remote_configured() {
        let endpoint = config.api_endpoint.as_deref().unwrap_or_default();
        let token = config.auth_token.as_deref().unwrap_or_default();
        verify_connection(endpoint, token)
            .await
            .context("verifying remote credentials")?;
    }

    local.save_config(&config).await.context("saving configuration")?;
    println!("configuration saved; reopen to use the new backend");
    show_config(&config)
}

async fn list(gateway: &Gateway, tag: Option<String>, category: Option<String>) -> Result<()> {
    let mut items = gateway.list_all().await?;
    items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    items.retain(|item| matches_filter(item, tag.as_deref(), category.as_deref()));

    for item in &items {
        println!(
            "{:8} {:40} {} [{}]",
            kind_label(item.kind),
            item.title,
            item.content,
            item.tags.join(", ")
        );
    }
    println!("{} item(s)", items.len());
    Ok(())
}

async fn import(gateway: &Gateway, file: &PathBuf, on_conflict: OnConflict) -> Result<()> {
    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("import");
    let candidates = curio_adapters::import_file(&bytes, name)?;
    let parsed = candidates.len();

    let mut outcome = stage_import(gateway, candidates).await?;
    println!("imported {} of {parsed} item(s) directly", outcome.imported);

    let action = match on_conflict {
        OnConflict::Keep => ConflictAction::Keep,
        OnConflict::Skip => ConflictAction::Skip,
        OnConflict::SkipAll => ConflictAction::SkipAll,
    };
    let mut kept = 0usize;
    let mut skipped = 0usize;
    while !outcome.conflicts.is_empty() {
        let remaining = outcome.conflicts.len();
        outcome.conflicts.resolve_head(action, gateway).await?;
        match action {
            ConflictAction::Keep => kept += 1,
            ConflictAction::Skip => skipped += 1,
            ConflictAction::SkipAll => skipped += remaining,
        }
    }
    if kept + skipped > 0 {
        println!("conflicts: kept {kept}, skipped {skipped}");
    }
    Ok(())
}

async fn dedup(gateway: &Gateway, keep: Option<KeepPolicy>) -> Result<()> {
    let items = gateway.list_all().await?;
    let groups = duplicate_groups(&items);
    if groups.is_empty() {
        println!("no duplicate links found");
        return Ok(());
    }

    for group in &groups {
        println!("{} ({} copies)", group.content, group.members.len());
        for member in &group.members {
            println!("  {} {}", member.id, member.title);
        }
    }

    let Some(keep) = keep else {
        println!("{} duplicate group(s); re-run with --keep to prune", groups.len());
        return Ok(());
    };
    let policy = match keep {
        KeepPolicy::Newest => RetentionPolicy::KeepNewest,
        KeepPolicy::Oldest => RetentionPolicy::KeepOldest,
    };
    match apply_retention(gateway, &groups, policy).await {
        Ok(deleted) => {
            println!("deleted {deleted} duplicate(s)");
            Ok(())
        }
        Err(err) => {
            // Resynchronize with ground truth; the failed delete may
            // have left the optimistic view stale.
            let _ = gateway.list_all().await;
            Err(err).context("pruning duplicates")
        }
    }
}

async fn enrich(
    gateway: &Gateway,
    config: &AppConfig,
    tag: Option<String>,
    category: Option<String>,
) -> Result<()> {
    let keys = usable_keys(config)?;
    let mut targets = gateway.list_all().await?;
    targets.retain(|item| matches_filter(item, tag.as_deref(), category.as_deref()));
    if targets.is_empty() {
        println!("nothing to enrich");
        return Ok(());
    }

    let enricher = BatchEnricher::new(Box::new(HttpAnalyzer::new()?), keys)?
        .with_progress(Box::new(ConsoleProgress));
    let completed = enricher.run(gateway, targets).await?;
    println!("enriched {completed} item(s)");
    Ok(())
}

async fn analyze(gateway: &Gateway, config: &AppConfig, id: &str) -> Result<()> {
    let keys = usable_keys(config)?;
    let items = gateway.list_all().await?;
    let item = items
        .into_iter()
        .find(|item| item.id == id)
        .with_context(|| format!("no item with id {id}"))?;

    let analyzer = HttpAnalyzer::new()?;
    let updated = curio_sync::analyze_one(gateway, &analyzer, &keys, item).await?;
    println!(
        "{}: {}",
        updated.title,
        updated.ai_summary.as_deref().unwrap_or_default()
    );
    Ok(())
}

fn show_config(config: &AppConfig) -> Result<()> {
    println!(
        "endpoint: {}",
        config.api_endpoint.as_deref().unwrap_or("(local mode)")
    );
    println!(
        "token: {}",
        if config.auth_token.is_some() {
            "(set)"
        } else {
            "(unset)"
        }
    );
    println!("analysis keys: {}", config.analysis_keys.len());
    println!("mode: {}", if config.remote_configured() { "remote" } else { "local" });
    Ok(())
}
