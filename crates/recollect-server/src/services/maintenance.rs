//! MaintenanceService - periodic retention and consolidation
//!
//! Runs `MemoryService::run_maintenance` on a fixed interval against the
//! current session's store. The lock is tried once per cycle; a busy store
//! skips the cycle instead of waiting.

use std::sync::Arc;
use std::time::Duration;

use recollect_core::memory::MaintenanceReport;
use tokio::sync::{Mutex, RwLock};
use tokio::time::interval;
use tracing::{debug, error, info};

use crate::state::AppState;

/// Handle for the running maintenance task
struct MaintenanceHandle {
    abort_handle: tokio::task::AbortHandle,
    interval_secs: u64,
}

/// MaintenanceService manages the background maintenance loop
pub struct MaintenanceService {
    state: AppState,
    dry_run: bool,
    active: RwLock<Option<MaintenanceHandle>>,
    /// Lock for starting/stopping operations
    operation_lock: Mutex<()>,
}

impl MaintenanceService {
    pub fn new(state: AppState, dry_run: bool) -> Self {
        Self {
            state,
            dry_run,
            active: RwLock::new(None),
            operation_lock: Mutex::new(()),
        }
    }

    /// Run one cycle now.
    ///
    /// Returns `None` when no session exists or the store is busy.
    pub async fn run_once(&self) -> recollect_core::Result<Option<MaintenanceReport>> {
        let Some(session) = self.state.session().await else {
            debug!("No session yet, skipping maintenance");
            return Ok(None);
        };

        let service = Arc::clone(&session.service);
        let dry_run = self.dry_run;
        let outcome = tokio::task::spawn_blocking(move || {
            service.run_maintenance(dry_run, Duration::ZERO)
        })
        .await
        .map_err(|e| recollect_core::Error::Other(format!("maintenance task failed: {e}")))?;

        match outcome {
            Ok(report) => Ok(Some(report)),
            Err(e) if e.is_busy() => {
                debug!(store = %session.store_path.display(), "Store busy, skipping maintenance cycle");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Start the periodic loop, replacing any running one.
    pub async fn start(self: Arc<Self>, interval_secs: u64) {
        let _lock = self.operation_lock.lock().await;

        self.stop_inner().await;

        info!(interval_secs = interval_secs, dry_run = self.dry_run, "Starting periodic maintenance");

        let service = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut cycle = interval(Duration::from_secs(interval_secs.max(1)));
            // First tick completes immediately
            cycle.tick().await;

            loop {
                cycle.tick().await;

                match service.run_once().await {
                    Ok(Some(report)) if report.has_changes() => {
                        info!(
                            pruned = report.retention.pruned,
                            consolidated = report.consolidation.memories_consolidated,
                            "Maintenance cycle changed the store"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "Maintenance cycle failed");
                    }
                }
            }
        });

        let mut active = self.active.write().await;
        *active = Some(MaintenanceHandle {
            abort_handle: handle.abort_handle(),
            interval_secs,
        });
    }

    /// Stop the loop (internal, assumes lock is held)
    async fn stop_inner(&self) {
        let mut active = self.active.write().await;
        if let Some(handle) = active.take() {
            handle.abort_handle.abort();
            info!(interval_secs = handle.interval_secs, "Stopped periodic maintenance");
        }
    }

    /// Stop the periodic loop
    pub async fn stop(&self) {
        let _lock = self.operation_lock.lock().await;
        self.stop_inner().await;
    }

    /// Check if the periodic loop is running
    pub async fn is_active(&self) -> bool {
        self.active.read().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use recollect_core::memory::MemoryStore;
    use recollect_core::types::{MemoryType, NewMemory};

    fn state(dir: &tempfile::TempDir) -> AppState {
        let mut config = Config::default();
        config.database_path = dir.path().join("memory.db");
        AppState::new(config)
    }

    #[tokio::test]
    async fn test_run_once_without_session_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let service = MaintenanceService::new(state(&dir), false);
        assert!(service.run_once().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_once_consolidates() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let session = state
            .initialize(&state.config.database_path.clone())
            .await
            .unwrap();
        for agent in ["a1", "a2"] {
            let mut memory = NewMemory::new("likes green tea", MemoryType::Preference);
            memory.agent_id = Some(agent.to_string());
            session.service.store().upsert(memory).unwrap();
        }

        let service = MaintenanceService::new(state.clone(), false);
        let report = service.run_once().await.unwrap().unwrap();
        assert_eq!(report.consolidation.memories_consolidated, 1);

        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_busy_store_skips_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let session = state
            .initialize(&state.config.database_path.clone())
            .await
            .unwrap();
        let _held = session.service.lock(Duration::ZERO).unwrap();

        let service = MaintenanceService::new(state.clone(), false);
        assert!(service.run_once().await.unwrap().is_none());

        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let service = Arc::new(MaintenanceService::new(state(&dir), true));

        Arc::clone(&service).start(60).await;
        assert!(service.is_active().await);

        service.stop().await;
        assert!(!service.is_active().await);
    }
}
