//! Memory commands: store, recall, list, forget, stats.
//!
//! Uses recollect-core directly against the local SQLite store.

use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use colored::Colorize;
use recollect_core::memory::{
    AccessSink, LearnReport, MemoryContext, MemoryService, MemoryStore, RecallFilters,
    TrackerRegistry,
};
use recollect_core::types::{now_ms, MemoryQuery, MemoryRecord, MemoryType, NewMemory, QueryOrder};
use recollect_core::Database;

use super::{print_json, Context};

/// Store options for [`store`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub raw: bool,
    pub memory_type: String,
    pub importance: Option<f64>,
    pub dry_run: bool,
}

/// Learn from `text`, or store it verbatim with `raw`.
pub fn store(ctx: &Context, text: &str, options: &StoreOptions) -> Result<()> {
    let report = store_text(ctx, text, options)?;

    if ctx.json {
        return print_json(&report);
    }

    if options.raw {
        match report.stored_ids.first() {
            Some(id) => {
                println!("{} Stored memory", "✓".green());
                println!("  ID: {}", id);
            }
            None => println!("{} Memory is valid (dry run, not stored)", "✓".green()),
        }
        return Ok(());
    }

    if report.candidates.is_empty() {
        println!("{} Nothing worth remembering found", "⚠".yellow());
        return Ok(());
    }

    let verb = if options.dry_run { "Would store" } else { "Stored" };
    println!("{} {} {} memories:", "✓".green(), verb, report.candidates.len());
    for (i, candidate) in report.candidates.iter().enumerate() {
        println!(
            "  {}. [{}] {} {}",
            i + 1,
            candidate.memory_type.to_string().cyan(),
            candidate.content,
            format!("({:.2}, {})", candidate.confidence, candidate.pattern_used).dimmed()
        );
        if let Some(id) = report.stored_ids.get(i) {
            println!("     ID: {}", id.dimmed());
        }
    }
    Ok(())
}

pub(crate) fn store_text(ctx: &Context, text: &str, options: &StoreOptions) -> Result<LearnReport> {
    let service = ctx.service()?;
    let timeout = ctx.config.engine.lock.timeout();

    if options.raw {
        let memory_type: MemoryType = options.memory_type.parse()?;
        let mut memory = NewMemory::new(text, memory_type).with_provenance(&ctx.provenance);
        memory.importance = options.importance;

        if options.dry_run {
            memory.normalized(now_ms())?;
            return Ok(LearnReport::default());
        }
        let id = service.remember(memory, timeout)?;
        return Ok(LearnReport {
            candidates: Vec::new(),
            stored_ids: vec![id],
        });
    }

    if options.dry_run {
        return Ok(LearnReport {
            candidates: service.extract(text),
            stored_ids: Vec::new(),
        });
    }
    Ok(service.learn(text, &ctx.provenance, timeout)?)
}

/// Recall with access tracking; pending access events are flushed before
/// returning.
pub async fn recall_tracked(
    service: &MemoryService<Database>,
    prompt: &str,
    strategy: Option<&str>,
    limit: Option<usize>,
    filters: &RecallFilters,
) -> Result<MemoryContext> {
    let registry = TrackerRegistry::new(service.config().tracker.clone());
    let sink: Arc<dyn AccessSink> = service.store().clone();
    let tracker = registry.get_or_create(sink, service.store().store_path())?;

    let engine = service.recall_engine(Some(tracker));
    let result = match strategy {
        Some(name) => engine.recall_named(
            prompt,
            name,
            limit.unwrap_or(engine.config().default_max_memories),
            filters,
        ),
        None => engine.recall(
            prompt,
            engine.config().default_strategy,
            limit.unwrap_or(engine.config().default_max_memories),
            filters,
        ),
    };

    if let Err(e) = registry.shutdown_all().await {
        tracing::warn!(error = %e, "Failed to flush access events");
    }
    Ok(result?)
}

/// Recall memories relevant to a prompt.
pub async fn recall(
    ctx: &Context,
    prompt: &str,
    strategy: Option<&str>,
    limit: Option<usize>,
) -> Result<()> {
    let service = ctx.service()?;
    let context = recall_tracked(&service, prompt, strategy, limit, &ctx.filters()).await?;

    if ctx.json {
        return print_json(&context);
    }

    if context.memories.is_empty() {
        println!("{} No relevant memories", "⚠".yellow());
        return Ok(());
    }

    println!(
        "{} {} memories ({} strategy, confidence {:.2}, {}ms):",
        "✓".green(),
        context.memories.len(),
        context.strategy_used.to_string().cyan(),
        context.confidence,
        context.recall_time_ms
    );
    println!();
    for (i, (memory, score)) in context.memories.iter().zip(&context.scores).enumerate() {
        print_record(i + 1, memory);
        println!("   Score: {:.3}", score);
    }
    Ok(())
}

/// List stored memories, newest first.
pub fn list(ctx: &Context, memory_type: Option<&str>, limit: usize, archived: bool) -> Result<()> {
    let memories = list_records(ctx, memory_type, limit, archived)?;

    if ctx.json {
        return print_json(&memories);
    }

    if memories.is_empty() {
        println!("{} No memories found", "⚠".yellow());
        return Ok(());
    }

    println!("{} {} memories:", "✓".green(), memories.len());
    println!();
    for (i, memory) in memories.iter().enumerate() {
        print_record(i + 1, memory);
    }
    Ok(())
}

pub(crate) fn list_records(
    ctx: &Context,
    memory_type: Option<&str>,
    limit: usize,
    archived: bool,
) -> Result<Vec<MemoryRecord>> {
    let memory_types = match memory_type {
        Some(name) => vec![name.parse::<MemoryType>()?],
        None => Vec::new(),
    };
    let service = ctx.service()?;
    let memories = service
        .store()
        .query(&MemoryQuery {
            user_id: ctx.provenance.user_id.clone(),
            memory_types,
            include_archived: archived,
            include_expired: true,
            order: QueryOrder::Newest,
            limit: Some(limit),
            ..Default::default()
        })
        .context("Failed to list memories")?;
    Ok(memories)
}

/// Delete one memory.
pub fn forget(ctx: &Context, id: &str) -> Result<()> {
    let service = ctx.service()?;
    let deleted = {
        let _lock = service.lock(ctx.config.engine.lock.timeout())?;
        service.store().delete(id)?
    };

    if ctx.json {
        return print_json(&serde_json::json!({ "id": id, "deleted": deleted }));
    }
    if !deleted {
        bail!("Memory not found: {}", id);
    }
    println!("{} Deleted memory: {}", "✓".green(), id);
    Ok(())
}

/// Show store statistics.
pub fn stats(ctx: &Context) -> Result<()> {
    let service = ctx.service()?;
    let stats = service.store().stats(ctx.provenance.user_id.as_deref())?;

    if ctx.json {
        return print_json(&stats);
    }

    println!("{}", "Memory Statistics".bold());
    println!("  Store:    {}", service.store().path().display().to_string().cyan());
    println!("  Live:     {}", stats.total);
    println!("  Archived: {}", stats.archived);
    println!("  Accesses: {}", stats.total_accesses);
    println!("  Size:     {} bytes", stats.content_bytes);
    if !stats.by_type.is_empty() {
        println!();
        println!("  By type:");
        for (memory_type, count) in &stats.by_type {
            println!("    {:<12} {}", memory_type, count);
        }
    }
    Ok(())
}

/// Print a memory entry.
fn print_record(index: usize, memory: &MemoryRecord) {
    let archived = if memory.is_archived() {
        " (archived)".yellow().to_string()
    } else {
        String::new()
    };
    println!(
        "{}. [{}] {}{}",
        index,
        memory.memory_type.to_string().cyan(),
        memory.content,
        archived
    );
    println!(
        "   ID: {} | Importance: {:.2} | Accessed: {}x | Created: {}",
        memory.id.dimmed(),
        memory.importance,
        memory.access_count,
        format_timestamp(memory.created_at)
    );
    if !memory.entities.is_empty() {
        println!("   Entities: {}", memory.entities.join(", "));
    }
}

/// Render epoch milliseconds as local time.
fn format_timestamp(ms: i64) -> String {
    match chrono::DateTime::from_timestamp_millis(ms) {
        Some(utc) => utc
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M")
            .to_string(),
        None => ms.to_string(),
    }
}
