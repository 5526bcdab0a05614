//! Command implementations for the recollect CLI.
//!
//! Each submodule implements the logic for a command group.

pub mod hook;
pub mod maintenance;
pub mod memory;

use std::path::PathBuf;

use anyhow::Result;
use recollect_core::memory::{MemoryService, RecallFilters};
use recollect_core::types::Provenance;
use recollect_core::Database;
use serde::Serialize;

use crate::cli::Cli;
use crate::config::Config;
use crate::database;

/// Everything a command needs besides its own arguments.
pub struct Context {
    pub config: Config,
    pub db: Option<PathBuf>,
    pub provenance: Provenance,
    pub json: bool,
}

impl Context {
    /// Combine flags with config defaults; flags win.
    pub fn new(cli: &Cli, config: Config) -> Self {
        let mut provenance = Provenance::new(
            cli.user.clone().or_else(|| config.cli.user.clone()),
            cli.agent.clone().or_else(|| config.cli.agent.clone()),
            cli.session.clone(),
        );
        provenance.source_type = Some("cli".to_string());

        Self {
            config,
            db: cli.db.clone(),
            provenance,
            json: cli.json,
        }
    }

    /// Open the store and build the engine over it.
    pub fn service(&self) -> Result<MemoryService<Database>> {
        let db = database::open(self.db.as_deref())?;
        Ok(MemoryService::new(db, &self.config.engine))
    }

    /// Reads are scoped to the user only; agent and session tag writes.
    pub fn filters(&self) -> RecallFilters {
        RecallFilters {
            user_id: self.provenance.user_id.clone(),
            ..Default::default()
        }
    }
}

/// Print a value as pretty JSON.
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
