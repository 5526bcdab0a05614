//! Application state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use recollect_core::db::IN_MEMORY_PATH;
use recollect_core::memory::{AccessSink, AccessTracker, MemoryService, TrackerRegistry};
use recollect_core::Database;
use tokio::sync::RwLock;

use crate::config::Config;

/// Engine bound to one store, created by `initialize`.
pub struct Session {
    pub store_path: PathBuf,
    pub service: Arc<MemoryService<Database>>,
    pub tracker: Arc<AccessTracker>,
}

impl Session {
    /// Open (or create) the store and attach its access tracker.
    pub fn open(config: &Config, registry: &TrackerRegistry, store_path: &Path) -> anyhow::Result<Self> {
        let db = if store_path == Path::new(IN_MEMORY_PATH) {
            Database::open_in_memory()?
        } else {
            Database::open_path(store_path)?
        };
        let db = Arc::new(db);

        let sink: Arc<dyn AccessSink> = db.clone();
        let tracker = registry.get_or_create(sink, db.path())?;
        let service = Arc::new(MemoryService::new(db, &config.engine));

        Ok(Self {
            store_path: store_path.to_path_buf(),
            service,
            tracker,
        })
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Server configuration
    pub config: Arc<Config>,
    /// Access trackers, one per store path
    pub registry: Arc<TrackerRegistry>,
    session: Arc<RwLock<Option<Arc<Session>>>>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let registry = TrackerRegistry::new(config.engine.tracker.clone());
        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            session: Arc::new(RwLock::new(None)),
        }
    }

    /// Current session, if `initialize` has run.
    pub async fn session(&self) -> Option<Arc<Session>> {
        self.session.read().await.clone()
    }

    /// Bind the server to `store_path`, replacing any previous session.
    pub async fn initialize(&self, store_path: &Path) -> anyhow::Result<Arc<Session>> {
        let mut current = self.session.write().await;
        if let Some(existing) = current.as_ref() {
            if existing.store_path == store_path && existing.tracker.is_running() {
                return Ok(Arc::clone(existing));
            }
        }

        let session = Arc::new(Session::open(&self.config, &self.registry, store_path)?);
        tracing::info!(store = %store_path.display(), "Session initialized");
        *current = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Flush and stop every tracker.
    pub async fn shutdown(&self) -> usize {
        match self.registry.shutdown_all().await {
            Ok(flushed) => flushed,
            Err(e) => {
                tracing::warn!(error = %e, "Tracker shutdown failed");
                0
            }
        }
    }
}
