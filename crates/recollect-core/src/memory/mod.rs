//! Memory lifecycle engine.
//!
//! Write path, read path and maintenance over one store:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        MemoryService                             │
//! │   learn: guard ─▶ Extractor ─▶ MemoryStore::batch_upsert          │
//! │                                                                  │
//! │   recall: RecallEngine ─▶ MemoryStore::query ─▶ rank             │
//! │                 │                                                │
//! │                 └──▶ AccessTracker (bounded queue, one worker)   │
//! │                                 └──▶ AccessSink::record_access   │
//! │                                                                  │
//! │   maintain: guard ─▶ RetentionPolicy ─▶ ConsolidationEngine      │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use recollect_core::memory::{MemoryService, RecallStrategy, RecallFilters};
//!
//! let service = MemoryService::new(store, &config);
//! service.learn("My name is Alice and I work at TechCorp", &provenance, timeout)?;
//!
//! let engine = service.recall_engine(Some(tracker));
//! let context = engine.recall("What's my name?", RecallStrategy::Keyword, 5, &filters)?;
//! println!("{}", context.enhanced_prompt);
//! ```

mod access;
mod consolidation;
mod extraction;
mod recall;
mod retention;
mod service;
mod traits;

pub use access::*;
pub use consolidation::*;
pub use extraction::*;
pub use recall::*;
pub use retention::*;
pub use service::*;
pub use traits::*;
