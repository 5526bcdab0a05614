//! recollect - local-first memory for assistants
//!
//! Stores facts and preferences learned from conversation text, recalls the
//! relevant ones for a prompt, and prunes and merges them over time.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod cli;
mod commands;
mod config;
mod database;

use cli::{Cli, Commands};
use commands::memory::StoreOptions;
use commands::Context;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing (stdout is reserved for command output)
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive("recollect=warn".parse()?))
        .init();

    let cli = Cli::parse();

    // Hooks must not fail on a broken config file
    let config = match (&cli.command, config::Config::load()) {
        (_, Ok(config)) => config,
        (Commands::Hook(_), Err(e)) => {
            tracing::warn!(error = %e, "Ignoring unreadable config in hook");
            config::Config::default()
        }
        (_, Err(e)) => return Err(e),
    };
    let ctx = Context::new(&cli, config);

    // Execute command
    match cli.command {
        Commands::Store {
            text,
            raw,
            memory_type,
            importance,
            dry_run,
        } => commands::memory::store(
            &ctx,
            &text,
            &StoreOptions {
                raw,
                memory_type,
                importance,
                dry_run,
            },
        ),
        Commands::Recall {
            prompt,
            strategy,
            limit,
        } => commands::memory::recall(&ctx, &prompt, strategy.as_deref(), limit).await,
        Commands::List {
            memory_type,
            limit,
            archived,
        } => commands::memory::list(&ctx, memory_type.as_deref(), limit, archived),
        Commands::Forget { id } => commands::memory::forget(&ctx, &id),
        Commands::Stats => commands::memory::stats(&ctx),
        Commands::Retention(cmd) => commands::maintenance::retention(&ctx, cmd.action),
        Commands::Consolidate { max_items, dry_run } => {
            commands::maintenance::consolidate(&ctx, max_items, dry_run)
        }
        Commands::Hook(cmd) => commands::hook::execute(&ctx, cmd.action).await,
        Commands::Version => {
            println!("recollect {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
