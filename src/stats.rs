//! Database and index overview for `jobtrail stats`.
//!
//! Shows how many emails are stored, how far classification and indexing
//! have got, and the per-category breakdown.

use anyhow::Result;
use serde::Serialize;

use crate::config::Config;
use crate::email_store::PipelineStats;
use crate::index::IndexStats;
use crate::pipeline::Pipeline;

#[derive(Debug, Serialize)]
pub struct StatsReport {
    pub database: String,
    pub database_bytes: u64,
    pub pipeline: PipelineStats,
    pub index: Option<IndexStats>,
}

pub async fn collect_stats(config: &Config, pipeline: &Pipeline) -> Result<StatsReport> {
    let database_bytes = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);
    let index = match pipeline.index() {
        Ok(index) => Some(index.stats().await?),
        Err(_) => None,
    };
    Ok(StatsReport {
        database: config.db.path.display().to_string(),
        database_bytes,
        pipeline: pipeline.emails().pipeline_stats().await?,
        index,
    })
}

/// Print the report to stdout.
pub fn print_stats(report: &StatsReport) {
    let p = &report.pipeline;

    println!("jobtrail: database stats");
    println!("========================");
    println!();
    println!("  Database:     {}", report.database);
    println!("  Size:         {}", format_bytes(report.database_bytes));
    println!();
    println!("  Emails:       {}", p.total);
    println!(
        "  Classified:   {} / {} ({}%)",
        p.processed,
        p.total,
        percent(p.processed, p.total)
    );
    println!(
        "  Indexed:      {} / {} ({}%)",
        p.indexed,
        p.total,
        percent(p.indexed, p.total)
    );

    if !p.by_category.is_empty() {
        println!();
        println!("  By category:");
        println!("  {:<22} {:>8}", "CATEGORY", "EMAILS");
        println!("  {}", "-".repeat(31));
        for (category, n) in &p.by_category {
            println!("  {:<22} {:>8}", category, n);
        }
    }

    println!();
    match &report.index {
        Some(ix) => {
            println!(
                "  Index:        {} ({} entries, model {})",
                ix.collection, ix.total_count, ix.embedding_model
            );
            if ix.total_count > ix.sample_size {
                println!(
                    "                category counts sampled from the first {} entries",
                    ix.sample_size
                );
            }
        }
        None => println!("  Index:        disabled"),
    }
    println!();
}

fn percent(part: i64, whole: i64) -> i64 {
    if whole > 0 {
        part * 100 / whole
    } else {
        0
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn percent_of_empty_is_zero() {
        assert_eq!(percent(3, 0), 0);
        assert_eq!(percent(1, 4), 25);
    }
}
