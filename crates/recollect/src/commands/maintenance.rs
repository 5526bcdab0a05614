//! Maintenance commands: retention analyze/apply and consolidation.
//!
//! Destructive runs take the store lock; `--dry-run` never writes.

use anyhow::Result;
use colored::Colorize;
use recollect_core::memory::{ConsolidationReport, MemoryCluster, RetentionReport, RetentionScore};

use super::{print_json, Context};
use crate::cli::RetentionAction;

/// Execute a retention subcommand.
pub fn retention(ctx: &Context, action: RetentionAction) -> Result<()> {
    match action {
        RetentionAction::Analyze { limit } => analyze(ctx, limit),
        RetentionAction::Apply { limit, dry_run } => apply(ctx, limit, dry_run),
    }
}

fn analyze(ctx: &Context, limit: Option<usize>) -> Result<()> {
    let service = ctx.service()?;
    let limit = limit.unwrap_or(ctx.config.engine.retention.analyze_limit);
    let scores = service.retention().analyze(limit)?;

    if ctx.json {
        return print_json(&scores);
    }

    if scores.is_empty() {
        println!("{} No memories to score", "⚠".yellow());
        return Ok(());
    }

    let threshold = ctx.config.engine.retention.prune_below;
    println!("{} {} memories, most prunable first:", "✓".green(), scores.len());
    println!();
    for score in &scores {
        print_score(score, threshold);
    }
    Ok(())
}

pub(crate) fn apply_retention(
    ctx: &Context,
    limit: Option<usize>,
    dry_run: bool,
) -> Result<RetentionReport> {
    let service = ctx.service()?;
    let lock = if dry_run {
        None
    } else {
        Some(service.lock(ctx.config.engine.lock.timeout())?)
    };

    let limit = limit.unwrap_or(ctx.config.engine.retention.analyze_limit);
    let scores = service.retention().analyze(limit)?;
    Ok(service.retention().apply(&scores, dry_run, lock.as_ref())?)
}

fn apply(ctx: &Context, limit: Option<usize>, dry_run: bool) -> Result<()> {
    let report = apply_retention(ctx, limit, dry_run)?;

    if ctx.json {
        return print_json(&report);
    }

    let verb = if report.dry_run { "Would prune" } else { "Pruned" };
    println!(
        "{} {} {} memories ({} bytes), kept {}, {} protected",
        "✓".green(),
        verb,
        report.pruned,
        report.bytes_reclaimed,
        report.kept,
        report.protected_count
    );
    for id in &report.pruned_ids {
        println!("  - {}", id.dimmed());
    }
    Ok(())
}

pub(crate) fn run_consolidation(
    ctx: &Context,
    max_items: Option<usize>,
    dry_run: bool,
) -> Result<(Vec<MemoryCluster>, ConsolidationReport)> {
    let service = ctx.service()?;
    let lock = if dry_run {
        None
    } else {
        Some(service.lock(ctx.config.engine.lock.timeout())?)
    };

    let max_items = max_items.unwrap_or(ctx.config.engine.consolidation.max_items);
    let clusters = service.consolidation().find_clusters(max_items)?;
    let report = service
        .consolidation()
        .execute(&clusters, dry_run, lock.as_ref())?;
    Ok((clusters, report))
}

/// Merge near-duplicate memories.
pub fn consolidate(ctx: &Context, max_items: Option<usize>, dry_run: bool) -> Result<()> {
    let (clusters, report) = run_consolidation(ctx, max_items, dry_run)?;

    if ctx.json {
        return print_json(&serde_json::json!({ "clusters": clusters, "report": report }));
    }

    if clusters.is_empty() {
        println!("{} No duplicate memories found", "✓".green());
        return Ok(());
    }

    let verb = if report.dry_run { "Would merge" } else { "Merged" };
    println!(
        "{} {} {} memories in {} clusters",
        "✓".green(),
        verb,
        report.memories_consolidated,
        report.clusters_found
    );
    for cluster in &clusters {
        println!(
            "  {} <- {}",
            cluster.canonical_id.cyan(),
            cluster
                .member_ids
                .iter()
                .filter(|id| **id != cluster.canonical_id)
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    Ok(())
}

fn print_score(score: &RetentionScore, threshold: f64) {
    let total = format!("{:.3}", score.total_score);
    let total = if score.is_protected {
        total.green()
    } else if score.total_score < threshold {
        total.red()
    } else {
        total.normal()
    };
    let protected = if score.is_protected { " protected" } else { "" };
    println!(
        "  {} [{}] {}{}",
        total,
        score.memory_type.to_string().cyan(),
        score.memory_id.dimmed(),
        protected
    );
    println!(
        "        age {:.2}  size {:.2}  access {:.2}  importance {:.2}",
        score.age_score, score.size_score, score.access_score, score.importance_score
    );
}
