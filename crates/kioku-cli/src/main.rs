//! Kioku CLI
//!
//! Operator surface for the long-term memory engine: run the daily batch,
//! inspect and manage records, search the store.

use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::Colorize;
use kioku_core::retrieval::{priority_for, select_top_k, RetrievedMemory};
use kioku_core::{
    render_memories_block, AnthropicAnalysis, BatchReport, CompressionBatch, Config,
    EmbeddingProvider, MemoryPatch, MemoryRecord, MemoryStore, OpenAiEmbedding,
    SKIP_INTERVAL_NOT_ELAPSED,
};

/// Kioku - long-term memory for conversational assistants
#[derive(Parser)]
#[command(name = "kioku")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "CLI for the kioku memory engine")]
struct Cli {
    /// Path to the store file (default: platform data dir)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Path to the JSON config (default: built-in defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daily consolidation batch
    Batch {
        /// Ignore the interval guard
        #[arg(long, short)]
        force: bool,
        /// Print pre/post statistics
        #[arg(long, short)]
        verbose: bool,
    },

    /// List memories
    List {
        /// Filter by tier (1-4)
        #[arg(long)]
        level: Option<i32>,
        /// Only archived memories
        #[arg(long)]
        archived: bool,
        /// Only protected memories
        #[arg(long)]
        protected: bool,
    },

    /// Show one memory in full
    Show {
        /// Memory id (mem_YYYYMMDD_NNN)
        id: String,
    },

    /// Delete one memory
    Delete {
        id: String,
        /// Skip the confirmation prompt
        #[arg(long, short)]
        force: bool,
    },

    /// Mark a memory protected (exempt from compression and deletion)
    Protect { id: String },

    /// Clear a memory's protected flag
    Unprotect { id: String },

    /// Show store statistics
    Stats,

    /// Delete all non-protected archived memories
    PurgeArchive {
        /// Skip the confirmation prompt
        #[arg(long, short)]
        force: bool,
    },

    /// Score the store against a query (read-only; no recall marking)
    Search {
        text: String,
        /// Exclude the archive
        #[arg(long)]
        active_only: bool,
        /// Maximum results
        #[arg(long, default_value = "10")]
        limit: usize,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => {
            let config = Config::default();
            config.validate()?;
            config
        }
    };
    let store = MemoryStore::new(cli.db.clone())?;

    match cli.command {
        Commands::Batch { force, verbose } => run_batch(&store, &config, force, verbose),
        Commands::List {
            level,
            archived,
            protected,
        } => run_list(&store, level, archived, protected),
        Commands::Show { id } => run_show(&store, &id),
        Commands::Delete { id, force } => run_delete(&store, &id, force),
        Commands::Protect { id } => run_protect(&store, &config, &id, true),
        Commands::Unprotect { id } => run_protect(&store, &config, &id, false),
        Commands::Stats => run_stats(&store, cli.db),
        Commands::PurgeArchive { force } => run_purge_archive(&store, force),
        Commands::Search {
            text,
            active_only,
            limit,
        } => run_search(&store, &config, &text, active_only, limit),
    }
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    print!("{} {} [y/N] ", "WARNING:".red().bold(), prompt);
    std::io::stdout().flush()?;
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    let input = input.trim().to_lowercase();
    Ok(input == "y" || input == "yes")
}

fn run_batch(store: &MemoryStore, config: &Config, force: bool, verbose: bool) -> anyhow::Result<()> {
    if verbose {
        println!(
            "Pre-batch: {} active, {} archived",
            store.count(false)?,
            store.count(true)? - store.count(false)?
        );
    }

    let analysis = AnthropicAnalysis::from_config(&config.llm);
    let embedder = OpenAiEmbedding::from_config(&config.embedding);
    let batch = CompressionBatch::new(store, &analysis, &embedder, config);

    let started = std::time::Instant::now();
    let report = batch.run(force)?;

    if !report.executed {
        println!(
            "Skipped: {}",
            report
                .skipped_reason
                .as_deref()
                .unwrap_or(SKIP_INTERVAL_NOT_ELAPSED)
        );
        return Ok(());
    }

    print_report(&report, started.elapsed());

    if verbose {
        println!();
        println!("Post-batch:");
        for (level, count) in store.count_by_level()? {
            println!("  L{level}: {count}");
        }
        println!("  Archived: {}", store.count(true)? - store.count(false)?);
        println!("  Protected: {}", store.count_protected()?);
    }
    Ok(())
}

fn print_report(report: &BatchReport, elapsed: std::time::Duration) {
    println!("{}", "Compression batch completed:".green().bold());
    println!("  Elapsed: {:.2}s", elapsed.as_secs_f64());
    println!("  Recalled processed: {}", report.recalled_processed);
    println!("  Memory days updated: {}", report.days_updated);
    println!("  Scores updated: {}", report.scores_updated);
    println!(
        "  Compression: L1→L2 {}, L2→L3 {}, L3→L4 {}",
        report.l1_to_l2, report.l2_to_l3, report.l3_to_l4
    );
    println!("  Revived: {}", report.revived);
    println!(
        "  Forced demotions: L1 {}, L2 {}, L3 {}",
        report.l1_forced, report.l2_forced, report.l3_forced
    );
    println!(
        "  Relations: {} new, {} updated",
        report.relations_new, report.relations_updated
    );
    println!("  Deleted: {}", report.deleted);
}

fn summary_line(record: &MemoryRecord) -> String {
    let marker = if record.protected {
        " [protected]".yellow().to_string()
    } else {
        String::new()
    };
    let archived = if record.is_archived() {
        " [archived]".dimmed().to_string()
    } else {
        String::new()
    };
    format!(
        "{} [{}][L{}] score={:6.2} recalls={}{}{} {}",
        record.id.cyan(),
        record.created.format("%Y-%m-%d"),
        record.current_level,
        record.retention_score,
        record.recall_count,
        marker,
        archived,
        truncate_text(&record.trigger, 60),
    )
}

fn truncate_text(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let head: String = text.chars().take(max).collect();
    format!("{head}…")
}

fn run_list(
    store: &MemoryStore,
    level: Option<i32>,
    archived: bool,
    protected: bool,
) -> anyhow::Result<()> {
    let records = if archived {
        store.get_archived()?
    } else if let Some(level) = level {
        store.get_by_level(level)?
    } else {
        store.get_active()?
    };

    let mut shown = 0;
    for record in &records {
        if protected && !record.protected {
            continue;
        }
        println!("{}", summary_line(record));
        shown += 1;
    }
    if shown == 0 {
        println!("{}", "No memories found.".dimmed());
    }
    Ok(())
}

fn run_show(store: &MemoryStore, id: &str) -> anyhow::Result<()> {
    let Some(record) = store.get(id)? else {
        anyhow::bail!("memory not found: {id}");
    };

    println!("{}: {}", "Id".white().bold(), record.id);
    println!("{}: {}", "Created".white().bold(), record.created.to_rfc3339());
    println!("{}: L{}", "Level".white().bold(), record.current_level);
    println!("{}: {:.4}", "Retention score".white().bold(), record.retention_score);
    println!("{}: {:.4}", "Memory days".white().bold(), record.memory_days);
    println!("{}: {:.4}", "Decay coefficient".white().bold(), record.decay_coefficient);
    println!("{}: {}", "Category".white().bold(), record.category);
    println!(
        "{}: intensity {}, valence {}, arousal {}",
        "Affect".white().bold(),
        record.emotional_intensity,
        record.emotional_valence,
        record.emotional_arousal
    );
    println!("{}: {}", "Tags".white().bold(), record.emotional_tags.join(", "));
    println!("{}: {}", "Keywords".white().bold(), record.keywords.join(", "));
    println!(
        "{}: {} (since last batch: {})",
        "Recalls".white().bold(),
        record.recall_count,
        record.recalled_since_last_batch
    );
    println!("{}: {}", "Protected".white().bold(), record.protected);
    if let Some(ts) = record.archived_at {
        println!("{}: {}", "Archived at".white().bold(), ts.to_rfc3339());
    }
    if record.revival_requested {
        println!(
            "{}: requested at {}",
            "Revival".white().bold(),
            record
                .revival_requested_at
                .map(|ts| ts.to_rfc3339())
                .unwrap_or_else(|| "?".to_string())
        );
    }
    println!(
        "{}: {}",
        "Embedding".white().bold(),
        match &record.embedding {
            Some(v) => format!("{} dims", v.len()),
            None => "none".to_string(),
        }
    );
    if !record.relations.is_empty() {
        println!("{}:", "Relations".white().bold());
        for rel in &record.relations {
            println!("  → {} ({})", rel.id, rel.kind);
        }
    }
    println!();
    println!("{}: {}", "Trigger".white().bold(), record.trigger);
    println!("{}: {}", "Content".white().bold(), record.content);
    Ok(())
}

fn run_delete(store: &MemoryStore, id: &str, force: bool) -> anyhow::Result<()> {
    let Some(record) = store.get(id)? else {
        anyhow::bail!("memory not found: {id}");
    };

    if record.protected && !force {
        anyhow::bail!("memory {id} is protected; pass --force to delete it anyway");
    }
    if !force && !confirm(&format!("Delete {id}? This cannot be undone."))? {
        println!("{}", "Aborted.".yellow());
        return Ok(());
    }

    store.delete(id)?;
    println!("{}", format!("Deleted {id}.").green());
    Ok(())
}

fn run_protect(
    store: &MemoryStore,
    config: &Config,
    id: &str,
    protect: bool,
) -> anyhow::Result<()> {
    if store.get(id)?.is_none() {
        anyhow::bail!("memory not found: {id}");
    }

    if protect {
        let current = store.count_protected()?;
        if current >= config.protection.max_protected_memories as i64 {
            anyhow::bail!(
                "protected memory limit reached ({current}/{}); unprotect something first",
                config.protection.max_protected_memories
            );
        }
    }

    let mut patch = MemoryPatch::new();
    patch.protected = Some(protect);
    store.update(id, &patch)?;
    println!(
        "{}",
        format!(
            "{id} is now {}.",
            if protect { "protected" } else { "unprotected" }
        )
        .green()
    );
    Ok(())
}

fn run_stats(store: &MemoryStore, db: Option<PathBuf>) -> anyhow::Result<()> {
    println!("{}", "=== Kioku Memory Statistics ===".cyan().bold());
    println!();

    let total = store.count(true)?;
    let active = store.count(false)?;
    println!("{}: {}", "Total".white().bold(), total);
    println!("{}: {}", "Active".white().bold(), active);
    println!("{}: {}", "Archived".white().bold(), total - active);
    println!("{}: {}", "Protected".white().bold(), store.count_protected()?);

    println!();
    println!("{}", "By level:".white().bold());
    for (level, count) in store.count_by_level()? {
        println!("  L{level}: {count}");
    }

    if let Some(last_run) = store.get_state(kioku_core::STATE_LAST_COMPRESSION_RUN)? {
        println!();
        println!("{}: {}", "Last batch".white().bold(), last_run);
    }

    if let Some(path) = db {
        if let Ok(meta) = std::fs::metadata(&path) {
            println!(
                "{}: {:.2} MB",
                "Store size".white().bold(),
                meta.len() as f64 / 1024.0 / 1024.0
            );
        }
    }
    Ok(())
}

fn run_purge_archive(store: &MemoryStore, force: bool) -> anyhow::Result<()> {
    let candidates: Vec<MemoryRecord> = store
        .get_archived()?
        .into_iter()
        .filter(|r| !r.protected)
        .collect();

    if candidates.is_empty() {
        println!("{}", "Archive is empty.".dimmed());
        return Ok(());
    }

    for record in candidates.iter().take(10) {
        println!("  {}", summary_line(record));
    }
    if candidates.len() > 10 {
        println!("  ... and {} more", candidates.len() - 10);
    }

    if !force
        && !confirm(&format!(
            "Delete {} archived memories? This cannot be undone.",
            candidates.len()
        ))?
    {
        println!("{}", "Aborted.".yellow());
        return Ok(());
    }

    let mut deleted = 0;
    for record in &candidates {
        if store.delete(&record.id)? {
            deleted += 1;
        }
    }
    println!(
        "{}",
        format!("Purged {deleted}/{} archived memories.", candidates.len())
            .green()
            .bold()
    );
    Ok(())
}

fn run_search(
    store: &MemoryStore,
    config: &Config,
    text: &str,
    active_only: bool,
    limit: usize,
) -> anyhow::Result<()> {
    let embedder = OpenAiEmbedding::from_config(&config.embedding);
    let query = embedder.embed(text)?;

    let mut scored: Vec<RetrievedMemory> = Vec::new();
    for record in store.get_active()? {
        if record.embedding.is_none() {
            continue;
        }
        let priority = priority_for(&record, &query.vector, None, config);
        scored.push(RetrievedMemory {
            record,
            priority,
            from_archive: false,
        });
    }
    if !active_only {
        for record in store.get_archived()? {
            if record.embedding.is_none() {
                continue;
            }
            let priority = priority_for(&record, &query.vector, None, config);
            scored.push(RetrievedMemory {
                record,
                priority,
                from_archive: true,
            });
        }
    }

    let mut search_config = config.clone();
    search_config.retrieval.top_k = limit;
    let selected = select_top_k(scored, &search_config);

    if selected.is_empty() {
        println!("{}", "No matches.".dimmed());
        return Ok(());
    }

    for hit in &selected {
        println!("{:8.3}  {}", hit.priority, summary_line(&hit.record));
    }

    if let Some(block) = render_memories_block(&selected) {
        println!();
        println!("{block}");
    }
    Ok(())
}
