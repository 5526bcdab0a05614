//! Assistant hook entry points.
//!
//! Hooks run inside another tool's turn, so they never fail it: every error is
//! logged to stderr and the command still exits 0.
//!
//! Input on stdin is either plain text or a JSON object carrying the text in
//! `prompt`, `text` or `message`.

use std::io::Read;
use std::time::Duration;

use anyhow::Result;
use recollect_core::memory::MemoryContext;
use serde_json::Value;

use super::memory::recall_tracked;
use super::Context;
use crate::cli::HookAction;

/// Execute a hook subcommand. Always succeeds.
pub async fn execute(ctx: &Context, action: HookAction) -> Result<()> {
    let input = match read_stdin() {
        Ok(input) => input,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read hook input");
            String::new()
        }
    };
    let text = text_from_input(&input);

    match action {
        HookAction::Enhance { limit } => {
            println!("{}", enhance(ctx, &text, limit).await);
        }
        HookAction::Learn => learn(ctx, &text),
    }
    Ok(())
}

fn read_stdin() -> std::io::Result<String> {
    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;
    Ok(input)
}

/// Pull the user text out of raw hook input.
pub(crate) fn text_from_input(input: &str) -> String {
    let trimmed = input.trim();
    if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(trimmed) {
        for key in ["prompt", "text", "message"] {
            if let Some(Value::String(text)) = object.get(key) {
                return text.clone();
            }
        }
    }
    trimmed.to_string()
}

/// Enhanced prompt, or the prompt unchanged on any failure.
pub(crate) async fn enhance(ctx: &Context, prompt: &str, limit: Option<usize>) -> String {
    if prompt.trim().is_empty() {
        return prompt.to_string();
    }

    let result: Result<MemoryContext> = async {
        let service = ctx.service()?;
        recall_tracked(&service, prompt, None, limit, &ctx.filters()).await
    }
    .await;

    match result {
        Ok(context) => context.enhanced_prompt,
        Err(e) => {
            tracing::warn!(error = %e, "Prompt enhancement skipped");
            prompt.to_string()
        }
    }
}

/// Learn from text without waiting on the store lock.
pub(crate) fn learn(ctx: &Context, text: &str) {
    if text.trim().is_empty() {
        return;
    }

    let result = ctx
        .service()
        .and_then(|service| Ok(service.learn(text, &ctx.provenance, Duration::ZERO)?));

    match result {
        Ok(report) => {
            tracing::debug!(stored = report.stored_ids.len(), "Hook learned memories");
        }
        Err(e) => match e.downcast_ref::<recollect_core::Error>() {
            Some(core) if core.is_busy() => {
                tracing::debug!("Store busy, skipping learning this turn");
            }
            _ => tracing::warn!(error = %e, "Hook learning failed"),
        },
    }
}
