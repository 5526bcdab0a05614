//! CLI argument definitions using clap derive macros.
//!
//! Command structure for storing, recalling and maintaining memories.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// recollect - local-first memory for assistants
///
/// Learns facts and preferences from conversation text, recalls the relevant
/// ones for a prompt, and keeps the store small over time.
#[derive(Parser, Debug)]
#[command(name = "recollect")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Store path (defaults to the nearest .recollect/memory.db)
    #[arg(long, global = true, env = "RECOLLECT_DATABASE_PATH")]
    pub db: Option<PathBuf>,

    /// User the memories belong to
    #[arg(long, global = true, env = "RECOLLECT_USER")]
    pub user: Option<String>,

    /// Agent recording or reading the memories
    #[arg(long, global = true, env = "RECOLLECT_AGENT")]
    pub agent: Option<String>,

    /// Conversation session
    #[arg(long, global = true, env = "RECOLLECT_SESSION")]
    pub session: Option<String>,

    /// Output as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Learn memories from text (or store it verbatim with --raw)
    Store {
        /// Text to learn from
        text: String,

        /// Store the text as one memory instead of extracting
        #[arg(long)]
        raw: bool,

        /// Memory type for --raw (semantic, episodic, preference, procedural, working)
        #[arg(long = "type", default_value = "semantic")]
        memory_type: String,

        /// Importance for --raw, 0.0 to 1.0
        #[arg(long)]
        importance: Option<f64>,

        /// Show what would be stored without writing
        #[arg(long)]
        dry_run: bool,
    },

    /// Recall memories relevant to a prompt
    Recall {
        /// Prompt to find memories for
        prompt: String,

        /// Strategy: keyword, entity, temporal or auto
        #[arg(short, long)]
        strategy: Option<String>,

        /// Maximum memories to return
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// List stored memories
    List {
        /// Filter by memory type
        #[arg(long = "type")]
        memory_type: Option<String>,

        /// Maximum results
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Include archived memories
        #[arg(long)]
        archived: bool,
    },

    /// Delete a memory
    Forget {
        /// Memory ID
        id: String,
    },

    /// Show store statistics
    Stats,

    /// Retention scoring and pruning
    Retention(RetentionCommand),

    /// Merge near-duplicate memories
    Consolidate {
        /// Maximum memories to examine
        #[arg(long)]
        max_items: Option<usize>,

        /// Report clusters without merging
        #[arg(long)]
        dry_run: bool,
    },

    /// Assistant hook entry points (read stdin, never fail)
    Hook(HookCommand),

    /// Show version
    Version,
}

// ─────────────────────────────────────────────────────────────────────────────
// Retention Commands
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Args, Debug)]
pub struct RetentionCommand {
    #[command(subcommand)]
    pub action: RetentionAction,
}

#[derive(Subcommand, Debug)]
pub enum RetentionAction {
    /// Score memories, most prunable first
    Analyze {
        /// Maximum memories to score
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Prune low-scoring, unprotected memories
    Apply {
        /// Maximum memories to consider
        #[arg(short, long)]
        limit: Option<usize>,

        /// Report what would be pruned without deleting
        #[arg(long)]
        dry_run: bool,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Hook Commands
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Args, Debug)]
pub struct HookCommand {
    #[command(subcommand)]
    pub action: HookAction,
}

#[derive(Subcommand, Debug)]
pub enum HookAction {
    /// Print the prompt from stdin with relevant memories prepended
    Enhance {
        /// Maximum memories to include
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Learn memories from the text on stdin
    Learn,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "recollect", "recall", "what's my name", "--user", "alice", "--json",
        ])
        .unwrap();
        assert_eq!(cli.user.as_deref(), Some("alice"));
        assert!(cli.json);
        assert!(matches!(cli.command, Commands::Recall { .. }));
    }

    #[test]
    fn test_retention_apply_parses_dry_run() {
        let cli =
            Cli::try_parse_from(["recollect", "retention", "apply", "--dry-run", "-l", "10"])
                .unwrap();
        match cli.command {
            Commands::Retention(RetentionCommand {
                action: RetentionAction::Apply { limit, dry_run },
            }) => {
                assert_eq!(limit, Some(10));
                assert!(dry_run);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
