//! # jobtrail CLI
//!
//! Ingest exported mailboxes, classify job-search email with a local model,
//! and query the result.
//!
//! ## Usage
//!
//! ```bash
//! jobtrail --config ./config/jobtrail.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `jobtrail init` | Create the SQLite database and schema |
//! | `jobtrail ingest <file>` | Store an export and classify the new emails |
//! | `jobtrail process` | Classify emails still pending |
//! | `jobtrail classify "<text>"` | Classify a piece of text without storing it |
//! | `jobtrail emails` | List stored emails |
//! | `jobtrail stats` | Database and index overview |
//! | `jobtrail query "<question>"` | Answer a question from the indexed emails |
//! | `jobtrail search "<query>"` | Semantic, category, date, or similarity search |
//! | `jobtrail summary` | Narrative summary of recent activity |
//! | `jobtrail progress` | Application and response metrics |
//! | `jobtrail follow-ups` | Suggested next actions |
//! | `jobtrail health` | Inference endpoint and index status |
//! | `jobtrail models list\|pull\|info` | Manage Ollama models |
//! | `jobtrail index export\|import\|reset\|stats` | Maintain the vector index |
//! | `jobtrail get <row-id>` | Show one stored email |
//! | `jobtrail delete <row-id>` | Delete an email and its index entry |
//!
//! ## Examples
//!
//! ```bash
//! jobtrail init
//! jobtrail ingest ~/Downloads/messages.json --account me@example.com
//! jobtrail ingest inbox.mbox --dry-run
//! jobtrail search "onsite interview" --rerank
//! jobtrail search --category Offer
//! jobtrail search --since 2024-03-01 --until 2024-03-31
//! jobtrail follow-ups
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use jobtrail::classify::keyword_fallback;
use jobtrail::clean::priority_score;
use jobtrail::config;
use jobtrail::email_store::EmailFilter;
use jobtrail::get;
use jobtrail::inference::InferenceClient;
use jobtrail::migrate;
use jobtrail::models::{Category, SearchResult};
use jobtrail::normalize::{deduplicate, filter_relevant, normalize_at, ExportFormat};
use jobtrail::pipeline::{IngestOptions, Pipeline};
use jobtrail::progress::ProgressMode;
use jobtrail::stats;

/// jobtrail: local-first job-search email triage.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/jobtrail.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "jobtrail",
    about = "jobtrail: classify and search job-search email with a local model",
    version,
    long_about = "jobtrail ingests exported mailboxes (Gmail JSON, EML, MBOX), classifies each \
    message as an application, recruiter response, interview, offer, rejection, or other using a \
    local Ollama model, and indexes everything for semantic search and follow-up suggestions."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/jobtrail.toml")]
    config: PathBuf,

    /// Debug-level logging (overridden by `RUST_LOG`).
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Print results as JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Store an export and classify the newly stored emails.
    ///
    /// Classification runs after the rows are written; the command waits
    /// for it unless `--no-wait` is given, in which case `jobtrail process`
    /// picks the rows up later.
    Ingest {
        /// Export file (`.json`, `.eml`, or `.mbox`).
        file: PathBuf,

        /// Export format; guessed from the extension when omitted.
        #[arg(long)]
        format: Option<String>,

        /// Mailbox the export belongs to.
        #[arg(long, default_value = "default")]
        account: String,

        /// Parse and report counts without touching the database.
        #[arg(long)]
        dry_run: bool,

        /// Skip emails that don't look job-related.
        #[arg(long)]
        relevant_only: bool,

        /// Return once rows are stored; leave classification for `process`.
        #[arg(long)]
        no_wait: bool,

        /// Progress output: `off`, `human`, or `json` (default: human on a TTY).
        #[arg(long)]
        progress: Option<ProgressMode>,
    },

    /// Classify (and index) emails that are still pending.
    Process {
        #[arg(long, default_value_t = 500)]
        limit: i64,

        #[arg(long)]
        progress: Option<ProgressMode>,
    },

    /// Classify a piece of text without storing it.
    Classify {
        text: String,

        /// Also extract contact details (company, person, title, ...).
        #[arg(long)]
        contacts: bool,

        /// Use the keyword rules only; no model call.
        #[arg(long)]
        offline: bool,
    },

    /// List stored emails, newest first.
    Emails {
        #[arg(long)]
        account: Option<String>,

        /// Category label, e.g. `Interview` or `"Application Sent"`.
        #[arg(long)]
        category: Option<String>,

        /// Substring match over subject, snippet, and sender.
        #[arg(long)]
        search: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: i64,

        #[arg(long, default_value_t = 0)]
        offset: i64,
    },

    /// Database and index overview.
    Stats,

    /// Answer a question from the most similar indexed emails.
    Query {
        query: String,

        #[arg(long, default_value_t = 5)]
        limit: usize,
    },

    /// Search the index.
    ///
    /// Plain semantic search by default. `--category`, `--since/--until`,
    /// and `--similar-to` switch to the corresponding search mode.
    Search {
        query: Option<String>,

        #[arg(long)]
        category: Option<String>,

        /// Earliest date (YYYY-MM-DD), inclusive.
        #[arg(long)]
        since: Option<String>,

        /// Latest date (YYYY-MM-DD), inclusive.
        #[arg(long)]
        until: Option<String>,

        /// Index entry id to find neighbours of.
        #[arg(long)]
        similar_to: Option<String>,

        /// Retrieve 20 candidates and rerank by keyword overlap.
        #[arg(long)]
        rerank: bool,

        #[arg(long, default_value_t = 5)]
        limit: usize,
    },

    /// Narrative summary of recent activity.
    Summary {
        #[arg(long, default_value_t = 7)]
        days: i64,
    },

    /// Application, response, interview, and offer metrics.
    Progress {
        #[arg(long, default_value_t = 30)]
        days: i64,
    },

    /// Suggested follow-ups, most urgent first.
    FollowUps {
        /// Look-back window in days.
        #[arg(long, default_value_t = 60)]
        days: i64,
    },

    /// Inference endpoint and index status.
    Health,

    /// Manage models on the inference endpoint.
    Models {
        #[command(subcommand)]
        action: ModelsAction,
    },

    /// Maintain the vector index.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Show one stored email.
    Get { row_id: i64 },

    /// Delete an email and its index entry.
    Delete { row_id: i64 },
}

#[derive(Subcommand)]
enum ModelsAction {
    /// Models the endpoint can serve.
    List,
    /// Download a model.
    Pull { name: String },
    /// Model details as reported by the endpoint.
    Info { name: String },
}

#[derive(Subcommand)]
enum IndexAction {
    /// Write every entry to an archive file.
    Export { path: PathBuf },
    /// Add every entry from an archive file.
    Import { path: PathBuf },
    /// Drop every entry in the collection.
    Reset,
    /// Approximate collection statistics.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Commands that don't need a config file
    match &cli.command {
        Commands::Ingest {
            file,
            format,
            account,
            dry_run: true,
            relevant_only,
            ..
        } => {
            return run_dry_ingest(file, format.as_deref(), account, *relevant_only, cli.json);
        }
        Commands::Classify {
            text,
            offline: true,
            ..
        } => {
            let result = keyword_fallback(text);
            return emit(cli.json, &result, || {
                println!("{} ({:.2}, keyword rules)", result.category, result.confidence);
            });
        }
        _ => {}
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized at {}.", cfg.db.path.display());
        }
        Commands::Ingest {
            file,
            format,
            account,
            relevant_only,
            no_wait,
            progress,
            ..
        } => {
            let format = resolve_format(&file, format.as_deref())?;
            let raw = std::fs::read(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let mode = progress.unwrap_or_else(ProgressMode::default_for_tty);
            let pipeline = Pipeline::open(&cfg).await?.with_progress(Arc::from(mode.reporter()));

            let ingestion = pipeline
                .ingest(&raw, format, &account, IngestOptions { relevant_only })
                .await?;
            let report = &ingestion.report;
            if !cli.json {
                println!(
                    "Accepted {} new emails ({} parsed, {} malformed, {} duplicates, {} filtered, {} already stored).",
                    report.accepted,
                    report.parsed,
                    report.malformed,
                    report.duplicates,
                    report.filtered_out,
                    report.already_stored
                );
            }

            match ingestion.task {
                Some(task) if !no_wait => {
                    let processed = task.await.context("classification task panicked")?;
                    emit(cli.json, &(report, &processed), || {
                        println!(
                            "Classified {} ({} by keyword fallback, {} failed), indexed {}.",
                            processed.classified,
                            processed.fallback,
                            processed.failed,
                            processed.indexed
                        );
                    })?;
                }
                Some(_) => {
                    emit(cli.json, report, || {
                        println!("Classification deferred; run `jobtrail process`.");
                    })?;
                }
                None => emit(cli.json, report, || {})?,
            }
        }
        Commands::Process { limit, progress } => {
            let mode = progress.unwrap_or_else(ProgressMode::default_for_tty);
            let pipeline = Pipeline::open(&cfg).await?.with_progress(Arc::from(mode.reporter()));
            let report = pipeline.process_pending(limit).await?;
            emit(cli.json, &report, || {
                println!(
                    "Classified {} ({} by keyword fallback, {} failed), indexed {}.",
                    report.classified, report.fallback, report.failed, report.indexed
                );
            })?;
        }
        Commands::Classify { text, contacts, .. } => {
            let pipeline = Pipeline::open(&cfg).await?;
            let result = pipeline.classify_text(&text).await;
            let contact_info = if contacts {
                Some(pipeline.chain().extract_contact_info(&text).await)
            } else {
                None
            };
            emit(cli.json, &(&result, &contact_info), || {
                println!("category:   {}", result.category);
                println!("confidence: {:.2}", result.confidence);
                println!("source:     {}", result.source.as_str());
                println!("summary:    {}", result.summary);
                if let Some(info) = &contact_info {
                    println!("contacts:   {}", serde_json::to_string(info).unwrap_or_default());
                }
            })?;
        }
        Commands::Emails {
            account,
            category,
            search,
            limit,
            offset,
        } => {
            let pipeline = Pipeline::open(&cfg).await?;
            let filter = EmailFilter {
                account,
                category: category.as_deref().map(parse_category).transpose()?,
                search,
            };
            let page = pipeline.emails().list(&filter, limit, offset).await?;
            emit(cli.json, &page, || {
                println!(
                    "{:>6}  {:<10}  {:<18}  {:>3}  {}",
                    "ROW", "DATE", "CATEGORY", "PRI", "SUBJECT"
                );
                for e in &page.emails {
                    println!(
                        "{:>6}  {:<10}  {:<18}  {:>3}  {}",
                        e.row_id,
                        e.email.received_at.format("%Y-%m-%d"),
                        e.classification
                            .as_ref()
                            .map(|c| c.category.as_str())
                            .unwrap_or("(pending)"),
                        priority_score(&e.email.subject, &e.email.sender),
                        e.email.subject
                    );
                }
                println!(
                    "\n{} of {} emails (offset {}).",
                    page.emails.len(),
                    page.total,
                    offset
                );
            })?;
        }
        Commands::Stats => {
            let pipeline = Pipeline::open(&cfg).await?;
            let report = stats::collect_stats(&cfg, &pipeline).await?;
            emit(cli.json, &report, || stats::print_stats(&report))?;
        }
        Commands::Query { query, limit } => {
            let pipeline = Pipeline::open(&cfg).await?;
            let answer = pipeline.query(&query, limit).await?;
            emit(cli.json, &answer, || {
                println!("{}", answer.answer);
                println!();
                print_results(&answer.sources);
            })?;
        }
        Commands::Search {
            query,
            category,
            since,
            until,
            similar_to,
            rerank,
            limit,
        } => {
            let pipeline = Pipeline::open(&cfg).await?;
            let index = pipeline.index()?;

            let results = if let Some(id) = similar_to {
                index.get_similar_to(&id, limit).await?
            } else if since.is_some() || until.is_some() {
                let start = match since {
                    Some(s) => parse_day(&s)?,
                    None => NaiveDate::MIN,
                };
                let end = match until {
                    Some(s) => parse_day(&s)?,
                    None => Utc::now().date_naive(),
                };
                index.search_by_timeframe(start, end, limit).await?
            } else if let Some(label) = category {
                index.search_by_category(parse_category(&label)?, limit).await?
            } else {
                let Some(query) = query.filter(|q| !q.trim().is_empty()) else {
                    bail!("search needs a query, --category, --since/--until, or --similar-to");
                };
                if rerank {
                    index.search_with_rerank(&query, limit.max(20), limit).await?
                } else {
                    index.search(&query, limit, None).await?
                }
            };

            emit(cli.json, &results, || print_results(&results))?;
        }
        Commands::Summary { days } => {
            let pipeline = Pipeline::open(&cfg).await?;
            let summary = pipeline.summary(days).await?;
            emit(cli.json, &summary, || {
                println!("{}", summary.summary);
                println!();
                println!("Recent activity:");
                for a in &summary.recent_activity {
                    println!(
                        "  {}  {:<18}  {}",
                        a.date.format("%Y-%m-%d"),
                        a.category.as_deref().unwrap_or("(pending)"),
                        a.subject
                    );
                }
            })?;
        }
        Commands::Progress { days } => {
            let pipeline = Pipeline::open(&cfg).await?;
            let report = pipeline.progress(days).await?;
            emit(cli.json, &report, || {
                let m = &report.metrics;
                println!("Last {} days: {} emails", report.period_days, report.total_emails);
                println!("  Applications sent:    {}", m.applications_sent);
                println!(
                    "  Responses received:   {} ({}%)",
                    m.responses_received, m.response_rate_percent
                );
                println!(
                    "  Interviews scheduled: {} ({}%)",
                    m.interviews_scheduled, m.interview_rate_percent
                );
                println!(
                    "  Offers received:      {} ({}%)",
                    m.offers_received, m.offer_rate_percent
                );
                println!("  Rejections:           {}", m.rejections_received);
                println!(
                    "  Companies ({}):       {}",
                    report.unique_companies,
                    report.companies_contacted.join(", ")
                );
            })?;
        }
        Commands::FollowUps { days } => {
            let pipeline = Pipeline::open(&cfg).await?;
            let suggestions = pipeline.follow_ups(days).await?;
            emit(cli.json, &suggestions, || {
                if suggestions.is_empty() {
                    println!("Nothing to follow up on.");
                }
                for s in &suggestions {
                    println!(
                        "[{:?}] {} ({} days)  {}",
                        s.priority, s.action, s.days_since, s.email_subject
                    );
                    println!("    {}", s.reasoning);
                }
            })?;
        }
        Commands::Health => {
            let pipeline = Pipeline::open(&cfg).await?;
            let health = pipeline.health().await?;
            emit(cli.json, &health, || {
                println!("inference: {}", health.inference);
                println!("model:     {}", health.current_model);
                println!("emails:    {}", health.emails);
                match &health.index {
                    Some(ix) => println!("index:     {} entries", ix.total_count),
                    None => println!("index:     disabled"),
                }
            })?;
        }
        Commands::Models { action } => {
            let llm = InferenceClient::from_config(&cfg.inference)?;
            match action {
                ModelsAction::List => {
                    let models = llm.list_models().await;
                    emit(cli.json, &models, || {
                        for m in &models {
                            println!("{}", m);
                        }
                    })?;
                }
                ModelsAction::Pull { name } => {
                    if !llm.pull_model(&name).await {
                        bail!("failed to pull model {}", name);
                    }
                    println!("Pulled {}.", name);
                }
                ModelsAction::Info { name } => match llm.model_info(&name).await {
                    Some(info) => println!("{}", serde_json::to_string_pretty(&info)?),
                    None => bail!("no information for model {}", name),
                },
            }
        }
        Commands::Index { action } => {
            let pipeline = Pipeline::open(&cfg).await?;
            let index = pipeline.index()?;
            match action {
                IndexAction::Export { path } => {
                    let n = index.export_all(&path).await?;
                    println!("Exported {} entries to {}.", n, path.display());
                }
                IndexAction::Import { path } => {
                    let n = index.import_all(&path).await?;
                    println!("Imported {} entries from {}.", n, path.display());
                }
                IndexAction::Reset => {
                    index.reset().await?;
                    println!("Index {} reset.", index.collection());
                }
                IndexAction::Stats => {
                    let s = index.stats().await?;
                    emit(cli.json, &s, || {
                        println!("collection: {}", s.collection);
                        println!("model:      {}", s.embedding_model);
                        println!("entries:    {}", s.total_count);
                        println!("accounts:   {} (sampled)", s.unique_accounts);
                        for (c, n) in &s.categories {
                            println!("  {:<20} {}", c, n);
                        }
                        if s.total_count > s.sample_size {
                            println!("(counts from the first {} entries)", s.sample_size);
                        }
                    })?;
                }
            }
        }
        Commands::Get { row_id } => {
            let pipeline = Pipeline::open(&cfg).await?;
            let email = get::get_email(pipeline.emails(), row_id).await?;
            emit(cli.json, &email, || get::print_email(&email))?;
        }
        Commands::Delete { row_id } => {
            let pipeline = Pipeline::open(&cfg).await?;
            match pipeline.delete_email(row_id).await? {
                Some(_) => println!("Deleted email {}.", row_id),
                None => bail!("email not found: {}", row_id),
            }
        }
    }

    Ok(())
}

fn run_dry_ingest(
    file: &Path,
    format: Option<&str>,
    account: &str,
    relevant_only: bool,
    json: bool,
) -> Result<()> {
    let format = resolve_format(file, format)?;
    let raw = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;

    let normalized = normalize_at(&raw, format, account, Utc::now());
    let parsed = normalized.emails.len();
    let malformed = normalized.failures.len();
    let deduped = deduplicate(normalized.emails);
    let duplicates = deduped.removed();
    let kept = if relevant_only {
        filter_relevant(deduped.records)
    } else {
        deduped.records
    };

    #[derive(Serialize)]
    struct DryRun {
        format: String,
        parsed: usize,
        malformed: usize,
        duplicates: usize,
        would_store: usize,
    }
    let summary = DryRun {
        format: format.to_string(),
        parsed,
        malformed,
        duplicates,
        would_store: kept.len(),
    };

    emit(json, &summary, || {
        println!(
            "Dry run ({}): {} parsed, {} malformed, {} duplicates, {} would be stored.",
            summary.format, parsed, malformed, duplicates, summary.would_store
        );
        for e in kept.iter().take(20) {
            println!(
                "  {}  {:<24}  {}",
                e.received_at.format("%Y-%m-%d"),
                e.company,
                e.subject
            );
        }
    })
}

fn resolve_format(file: &Path, declared: Option<&str>) -> Result<ExportFormat> {
    if let Some(f) = declared {
        return Ok(f.parse::<ExportFormat>()?);
    }
    file.extension()
        .and_then(|e| e.to_str())
        .and_then(ExportFormat::from_extension)
        .with_context(|| {
            format!(
                "cannot guess the format of {}; pass --format json|eml|mbox",
                file.display()
            )
        })
}

fn parse_category(label: &str) -> Result<Category> {
    Category::parse(label).with_context(|| {
        let known: Vec<&str> = Category::ALL.iter().map(|c| c.as_str()).collect();
        format!("unknown category '{}' (expected one of: {})", label, known.join(", "))
    })
}

fn parse_day(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("invalid date '{}', expected YYYY-MM-DD", s))
}

fn emit<T: Serialize + ?Sized>(json: bool, value: &T, human: impl FnOnce()) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human();
    }
    Ok(())
}

fn print_results(results: &[SearchResult]) {
    if results.is_empty() {
        println!("No results.");
        return;
    }
    for (i, r) in results.iter().enumerate() {
        let score = r.rerank_score.unwrap_or(r.similarity);
        println!(
            "{}. [{:.3}] {}  {}",
            i + 1,
            score,
            r.metadata.get("category").map(String::as_str).unwrap_or("-"),
            r.metadata.get("subject").map(String::as_str).unwrap_or(&r.id)
        );
        if let Some(date) = r.metadata.get("date") {
            println!("    date: {}  id: {}", date.get(..10).unwrap_or(date), r.id);
        }
    }
}
