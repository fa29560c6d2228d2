// src/matching/run_registry.rs
//! In-flight runs keyed by hierarchy. At most one unfinished run per
//! hierarchy; finished runs stay pollable until they expire.

use anyhow::Result;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::MatchError;
use crate::models::stats_models::{MatchMethodType, RunProgress, RunStatus};
use crate::models::HierarchyId;

pub type SharedProgress = Arc<Mutex<RunProgress>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunHandle {
    pub run_id: Uuid,
    pub hierarchy_id: HierarchyId,
    pub method: MatchMethodType,
}

/// What the owning run needs: its handle, the cancel flag to check and the
/// progress object to update.
#[derive(Debug, Clone)]
pub struct RunTicket {
    pub handle: RunHandle,
    pub cancel: Arc<AtomicBool>,
    pub progress: SharedProgress,
}

impl RunTicket {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

struct RunEntry {
    ticket: RunTicket,
    finished_at: Option<Instant>,
}

pub struct RunRegistry {
    runs: Mutex<HashMap<Uuid, RunEntry>>,
    retention: Duration,
}

impl RunRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
            retention,
        }
    }

    /// Registers a run. Fails with `AlreadyRunning` while another run for the
    /// same hierarchy is unfinished; nothing is queued.
    pub async fn create(
        &self,
        hierarchy_id: HierarchyId,
        method: MatchMethodType,
        total: usize,
    ) -> Result<RunTicket> {
        let mut runs = self.runs.lock().await;
        expire_locked(&mut runs, self.retention);

        if runs
            .values()
            .any(|e| e.finished_at.is_none() && e.ticket.handle.hierarchy_id == hierarchy_id)
        {
            return Err(MatchError::AlreadyRunning(hierarchy_id).into());
        }

        let ticket = RunTicket {
            handle: RunHandle {
                run_id: Uuid::new_v4(),
                hierarchy_id,
                method,
            },
            cancel: Arc::new(AtomicBool::new(false)),
            progress: Arc::new(Mutex::new(RunProgress::new(total))),
        };
        info!(
            "▶️  Run {} ({}) registered for hierarchy {}",
            ticket.handle.run_id,
            method.as_str(),
            hierarchy_id
        );
        runs.insert(
            ticket.handle.run_id,
            RunEntry {
                ticket: ticket.clone(),
                finished_at: None,
            },
        );
        Ok(ticket)
    }

    /// Snapshot of a run's progress.
    pub async fn poll(&self, run_id: Uuid) -> Result<RunProgress> {
        let progress = {
            let mut runs = self.runs.lock().await;
            expire_locked(&mut runs, self.retention);
            runs.get(&run_id)
                .map(|e| e.ticket.progress.clone())
                .ok_or(MatchError::RunNotFound(run_id))?
        };
        let snapshot = progress.lock().await.clone();
        Ok(snapshot)
    }

    /// Requests cooperative cancellation. False when the run is unknown or
    /// already finished.
    pub async fn cancel(&self, run_id: Uuid) -> bool {
        let runs = self.runs.lock().await;
        match runs.get(&run_id) {
            Some(entry) if entry.finished_at.is_none() => {
                entry.ticket.cancel.store(true, Ordering::SeqCst);
                info!("⏹️  Cancellation requested for run {}", run_id);
                true
            }
            _ => false,
        }
    }

    /// Marks a run finished and records its final status. The hierarchy can
    /// be run again immediately.
    pub async fn finish(&self, run_id: Uuid, status: RunStatus, error: Option<String>) {
        let progress = {
            let mut runs = self.runs.lock().await;
            match runs.get_mut(&run_id) {
                Some(entry) => {
                    entry.finished_at = Some(Instant::now());
                    entry.ticket.progress.clone()
                }
                None => return,
            }
        };
        let mut p = progress.lock().await;
        p.status = status;
        p.error = error;
        debug!("Run {} finished with status {:?}", run_id, status);
    }

    pub async fn is_running(&self, hierarchy_id: HierarchyId) -> bool {
        self.active_run(hierarchy_id).await.is_some()
    }

    /// Handle of the unfinished run of a hierarchy, if any.
    pub async fn active_run(&self, hierarchy_id: HierarchyId) -> Option<RunHandle> {
        self.runs
            .lock()
            .await
            .values()
            .find(|e| e.finished_at.is_none() && e.ticket.handle.hierarchy_id == hierarchy_id)
            .map(|e| e.ticket.handle)
    }

    /// Drops finished runs older than the retention period. Returns how many.
    pub async fn expire(&self) -> usize {
        let mut runs = self.runs.lock().await;
        expire_locked(&mut runs, self.retention)
    }
}

fn expire_locked(runs: &mut HashMap<Uuid, RunEntry>, retention: Duration) -> usize {
    let before = runs.len();
    runs.retain(|_, e| match e.finished_at {
        Some(at) => at.elapsed() < retention,
        None => true,
    });
    before - runs.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_run_for_same_hierarchy_is_rejected() {
        let registry = RunRegistry::new(Duration::from_secs(60));
        let first = registry.create(1, MatchMethodType::AiBatch, 10).await.unwrap();
        let err = registry.create(1, MatchMethodType::CountryTree, 0).await.unwrap_err();
        assert_eq!(err.downcast_ref::<MatchError>(), Some(&MatchError::AlreadyRunning(1)));
        assert!(registry.create(2, MatchMethodType::AiBatch, 0).await.is_ok());

        registry.finish(first.handle.run_id, RunStatus::Completed, None).await;
        assert!(!registry.is_running(1).await);
        assert!(registry.create(1, MatchMethodType::AiBatch, 0).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_sets_flag_only_for_unfinished_runs() {
        let registry = RunRegistry::new(Duration::from_secs(60));
        let ticket = registry.create(1, MatchMethodType::AiBatch, 5).await.unwrap();
        assert!(registry.cancel(ticket.handle.run_id).await);
        assert!(ticket.is_cancelled());

        registry.finish(ticket.handle.run_id, RunStatus::Cancelled, None).await;
        assert!(!registry.cancel(ticket.handle.run_id).await);
        assert!(!registry.cancel(Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn test_poll_reports_progress_and_final_status() {
        let registry = RunRegistry::new(Duration::from_secs(60));
        let ticket = registry.create(3, MatchMethodType::AiBatch, 4).await.unwrap();
        {
            let mut p = ticket.progress.lock().await;
            p.processed = 2;
            p.cost_so_far = 0.01;
        }
        let snapshot = registry.poll(ticket.handle.run_id).await.unwrap();
        assert_eq!(snapshot.processed, 2);
        assert_eq!(snapshot.status, RunStatus::Running);

        registry
            .finish(ticket.handle.run_id, RunStatus::Failed, Some("db down".into()))
            .await;
        let snapshot = registry.poll(ticket.handle.run_id).await.unwrap();
        assert_eq!(snapshot.status, RunStatus::Failed);
        assert_eq!(snapshot.error.as_deref(), Some("db down"));
    }

    #[tokio::test]
    async fn test_finished_runs_expire() {
        let registry = RunRegistry::new(Duration::ZERO);
        let ticket = registry.create(1, MatchMethodType::Geocode, 1).await.unwrap();
        assert_eq!(registry.expire().await, 0);
        registry.finish(ticket.handle.run_id, RunStatus::Completed, None).await;
        assert_eq!(registry.expire().await, 1);
        let err = registry.poll(ticket.handle.run_id).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<MatchError>(), Some(MatchError::RunNotFound(_))));
    }
}
