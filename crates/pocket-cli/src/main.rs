// ============================================================================
// pocket-db - CLI inspection tool for the pocket agent's memory database
// ============================================================================
// Usage:
//   pocket-db stats                               Show database statistics
//   pocket-db list-turns [--limit N] [--failed]   List recent conversation turns
//   pocket-db list-skills                         List learned skills
//   pocket-db recall <query> [--limit N]          Semantic recall against memory
//   pocket-db feedback <turn-id> <score>          Set feedback on a turn
//   pocket-db review                              Run one self-improvement pass
//   pocket-db prune --older-than 30 [--dry-run]   Prune stale memory
//   pocket-db export --format json                Export full database as JSON
// ============================================================================

use anyhow::Result;
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use pocket_core::memory::{FeedbackScore, MemoryStore, TurnFilter};
use pocket_core::{AgentConfig, SelfImprovementLoop};
use std::sync::Arc;
use tracing::info;

const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// Pocket agent memory inspection tool
#[derive(Parser)]
#[command(name = "pocket-db", version, about = "Inspect and maintain the pocket agent's memory")]
struct Cli {
    /// Path to the database file (default: ~/.pocket-agent/memory.redb)
    #[arg(long, global = true)]
    db_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show database statistics (turns, chunks, skills, vocabulary)
    Stats,

    /// List the most recent conversation turns
    ListTurns {
        #[arg(long, default_value = "20")]
        limit: usize,

        /// Only show failed turns
        #[arg(long)]
        failed: bool,
    },

    /// List learned skills, most successful first
    ListSkills,

    /// Show the memories most similar to a query
    Recall {
        query: String,

        #[arg(long, default_value = "5")]
        limit: usize,
    },

    /// Set the feedback score of a turn: positive, negative or unset
    Feedback { turn_id: u64, score: String },

    /// Run one self-improvement pass and print the health summary as JSON
    Review,

    /// Prune stale, unimportant memory
    Prune {
        /// Prune memory older than this many days
        #[arg(long, default_value = "30")]
        older_than: i64,

        /// Show what would be pruned without actually deleting
        #[arg(long)]
        dry_run: bool,
    },

    /// Export full database contents as JSON
    Export {
        /// Output format (currently only json is supported)
        #[arg(long, default_value = "json")]
        format: String,
    },
}

fn format_timestamp(ts_ms: i64) -> String {
    Utc.timestamp_millis_opt(ts_ms)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| format!("(invalid: {})", ts_ms))
}

fn truncate(text: &str, max: usize) -> String {
    let flat = text.replace('\n', " ");
    if flat.chars().count() <= max {
        flat
    } else {
        let mut cut: String = flat.chars().take(max.saturating_sub(1)).collect();
        cut.push('…');
        cut
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("Warning: Could not load .env file: {}", e);
    }

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pocket_core=warn".parse()?)
                .add_directive("pocket_db=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = AgentConfig::default();
    let db_path = cli.db_path.or_else(|| config.db_path.clone());
    let store = Arc::new(MemoryStore::open(db_path.as_deref())?);
    info!(db_path = ?store.db().path(), "Memory database opened");

    let result = match cli.command {
        Commands::Stats => cmd_stats(&store),
        Commands::ListTurns { limit, failed } => cmd_list_turns(&store, limit, failed),
        Commands::ListSkills => cmd_list_skills(&store),
        Commands::Recall { query, limit } => cmd_recall(&store, &query, limit),
        Commands::Feedback { turn_id, score } => cmd_feedback(&store, turn_id, &score),
        Commands::Review => cmd_review(&store, &config),
        Commands::Prune {
            older_than,
            dry_run,
        } => cmd_prune(&store, older_than, dry_run),
        Commands::Export { format } => cmd_export(&store, &format),
    };

    // Access-count bumps from recall land before exit
    store.flush_background().await;
    result
}

fn cmd_stats(store: &MemoryStore) -> Result<()> {
    let stats = store.db().stats()?;

    println!("=== Pocket Agent Memory Stats ===");
    match store.db().path() {
        Some(path) => println!("Database: {}", path.display()),
        None => println!("Database: (in memory)"),
    }
    println!();
    println!("Turns:      {} total, {} failed", stats.turns, stats.failed_turns);
    println!("Chunks:     {} total, {} embedded", stats.chunks, stats.embedded_chunks);
    println!("Skills:     {}", stats.skills);
    println!("Browsing:   {}", stats.browsing_facts);
    println!(
        "Vocabulary: {} terms over {} documents",
        stats.vocabulary_terms, stats.documents_embedded
    );

    Ok(())
}

fn cmd_list_turns(store: &MemoryStore, limit: usize, failed: bool) -> Result<()> {
    let filter = if failed { TurnFilter::Failed } else { TurnFilter::All };
    let turns = store.db().recent_turns(limit, filter)?;

    if turns.is_empty() {
        println!("No turns found.");
        return Ok(());
    }

    println!(
        "{:<6}  {:<22}  {:<4}  {:<8}  {:<20}  {}",
        "ID", "TIME", "OK", "FEEDBACK", "TOOLS", "MESSAGE"
    );
    println!("{}", "-".repeat(100));

    for turn in &turns {
        println!(
            "{:<6}  {:<22}  {:<4}  {:<8}  {:<20}  {}",
            turn.id,
            format_timestamp(turn.timestamp),
            if turn.was_successful { "yes" } else { "no" },
            turn.feedback_score,
            truncate(&turn.tools_used.join(","), 20),
            truncate(&turn.user_message, 40)
        );
    }

    println!("\nShowing {} turns", turns.len());
    Ok(())
}

fn cmd_list_skills(store: &MemoryStore) -> Result<()> {
    let skills = store.db().list_skills()?;

    if skills.is_empty() {
        println!("No skills learned yet.");
        return Ok(());
    }

    for skill in &skills {
        println!(
            "{}  ({} ok / {} failed, rate {:.2}, updated {})",
            skill.name,
            skill.success_count,
            skill.fail_count,
            skill.success_rate(),
            format_timestamp(skill.last_updated)
        );
        println!("    {}", truncate(&skill.description, 90));
        println!("    How to use: {}", truncate(&skill.how_to_use, 80));
    }

    println!("\nTotal: {} skills", skills.len());
    Ok(())
}

fn cmd_recall(store: &MemoryStore, query: &str, limit: usize) -> Result<()> {
    let results = store.recall_scored(query, limit)?;

    if results.is_empty() {
        println!("No memories found.");
        return Ok(());
    }

    for (chunk, score) in &results {
        println!(
            "{:.3}  #{:<5} {:<16} {}",
            score,
            chunk.id,
            chunk.source,
            truncate(&chunk.content, 70)
        );
    }
    Ok(())
}

fn cmd_feedback(store: &MemoryStore, turn_id: u64, score: &str) -> Result<()> {
    let score: FeedbackScore = score.parse().map_err(anyhow::Error::msg)?;
    if store.db().set_feedback(turn_id, score)? {
        println!("Turn {} feedback set to {}", turn_id, score);
    } else {
        println!("No turn with id {}", turn_id);
    }
    Ok(())
}

fn cmd_review(store: &Arc<MemoryStore>, config: &AgentConfig) -> Result<()> {
    info!("Running one self-improvement pass");
    let review = SelfImprovementLoop::new(Arc::clone(store), config.review_config());
    let summary = review.run_once()?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn cmd_prune(store: &MemoryStore, older_than: i64, dry_run: bool) -> Result<()> {
    let max_age_ms = older_than.saturating_mul(MS_PER_DAY);

    if dry_run {
        println!("=== DRY RUN - no data will be deleted ===\n");
        let cutoff = Utc::now().timestamp_millis().saturating_sub(max_age_ms);
        let report = store.db().count_prunable(cutoff)?;
        println!(
            "Would prune {} chunks, {} turns and {} browsing facts older than {} days",
            report.chunks, report.turns, report.browsing_facts, older_than
        );
        return Ok(());
    }

    info!("Pruning memory older than {} days", older_than);
    let report = store.prune_old_memories(max_age_ms)?;
    println!(
        "Pruned {} chunks, {} turns and {} browsing facts older than {} days",
        report.chunks, report.turns, report.browsing_facts, older_than
    );
    Ok(())
}

fn cmd_export(store: &MemoryStore, format: &str) -> Result<()> {
    if format != "json" {
        anyhow::bail!("Unsupported format '{}'. Only 'json' is supported.", format);
    }

    let db = store.db();
    let export = serde_json::json!({
        "exported_at": Utc::now().to_rfc3339(),
        "stats": db.stats()?,
        "turns": db.all_turns()?,
        "chunks": db.list_chunks()?,
        "skills": db.list_skills()?,
        "browsing": db.list_browsing()?,
    });

    println!("{}", serde_json::to_string_pretty(&export)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_prune_and_feedback() {
        let cli = Cli::try_parse_from(["pocket-db", "--db-path", "/tmp/m.redb", "prune", "--dry-run"]).unwrap();
        assert_eq!(cli.db_path.as_deref(), Some("/tmp/m.redb"));
        match cli.command {
            Commands::Prune { older_than, dry_run } => {
                assert_eq!(older_than, 30);
                assert!(dry_run);
            }
            _ => panic!("expected prune"),
        }

        let cli = Cli::try_parse_from(["pocket-db", "feedback", "7", "positive"]).unwrap();
        assert!(matches!(cli.command, Commands::Feedback { turn_id: 7, .. }));
        assert!(Cli::try_parse_from(["pocket-db", "feedback", "seven", "up"]).is_err());
    }

    #[test]
    fn test_truncate_flattens_and_bounds() {
        assert_eq!(truncate("open\ncamera", 20), "open camera");
        assert_eq!(truncate("abcdefgh", 5), "abcd…");
        assert_eq!(truncate("abcdefgh", 5).chars().count(), 5);
    }

    #[test]
    fn test_format_timestamp_millis() {
        assert_eq!(format_timestamp(0), "1970-01-01 00:00:00 UTC");
        assert_eq!(format_timestamp(86_400_000), "1970-01-02 00:00:00 UTC");
    }
}
