// ABOUTME: Moves service records through the deployment state machine.
// ABOUTME: Every change names the run making it; only the owning run may move a record.

use chrono::Utc;
use std::path::Path;
use std::sync::Arc;

use super::{DeploymentStatus, FailureReason, ServiceRecord, StatusError, StatusStore};
use crate::descriptor::DeploymentDescriptor;
use crate::types::{RunId, ServiceName};

/// What a new run intends to do, which decides its entry state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Deploy,
    Scale,
    /// Re-apply an earlier descriptor.
    Rollback,
}

/// A mid-run record untouched for this long is treated as abandoned.
const ABANDONED_AFTER_HOURS: i64 = 1;

#[derive(Clone)]
pub struct StatusTracker {
    store: Arc<dyn StatusStore>,
}

impl StatusTracker {
    pub fn new(store: Arc<dyn StatusStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, service: &ServiceName) -> Result<Option<ServiceRecord>, StatusError> {
        self.store.load(service).await
    }

    /// Where the store's records are shared with other processes.
    pub fn lock_dir(&self) -> Option<&Path> {
        self.store.lock_dir()
    }

    /// Claim the record for `run` and move it to the run's entry state.
    ///
    /// Deploys and rollbacks enter `pending` on a fresh or failed service and
    /// `updating` on a succeeded one. Scales enter `scaling` and need a
    /// succeeded service. A record still mid-run belongs to a live run and is
    /// refused, unless it has gone untouched long enough to be abandoned; see
    /// [`StatusTracker::abandon`] for runs known to be dead.
    pub async fn begin(
        &self,
        service: &ServiceName,
        run: &RunId,
        kind: RunKind,
    ) -> Result<ServiceRecord, StatusError> {
        let mut existing = self.store.load(service).await?;

        if let Some(record) = existing.as_mut()
            && !record.status.is_terminal()
        {
            let idle = Utc::now() - record.updated_at;
            if idle.num_hours() < ABANDONED_AFTER_HOURS {
                return Err(StatusError::InFlight {
                    service: service.clone(),
                    status: record.status,
                    run: record.last_run_id.clone(),
                });
            }
            tracing::warn!(
                "Status of {} was left {} by run {} {} minutes ago; treating it as failed",
                service,
                record.status,
                record.last_run_id.as_ref().map_or("unknown", |r| r.as_str()),
                idle.num_minutes()
            );
            record.status = DeploymentStatus::Failed;
        }

        let record = match (kind, existing) {
            (RunKind::Deploy | RunKind::Rollback, None) => {
                ServiceRecord::new(service.clone(), DeploymentStatus::Pending, run.clone())
            }
            (RunKind::Deploy | RunKind::Rollback, Some(mut record)) => {
                record.status = match (record.status, &record.last_success_descriptor) {
                    (DeploymentStatus::Failed, _) | (_, None) => DeploymentStatus::Pending,
                    _ => DeploymentStatus::Updating,
                };
                record.last_run_id = Some(run.clone());
                record.failure = None;
                record.rolled_back = false;
                record
            }
            (RunKind::Scale, None) => return Err(StatusError::NotFound(service.clone())),
            (RunKind::Scale, Some(mut record)) => {
                if !record.status.can_transition_to(DeploymentStatus::Scaling) {
                    return Err(StatusError::InvalidTransition {
                        service: service.clone(),
                        from: record.status,
                        to: DeploymentStatus::Scaling,
                    });
                }
                record.status = DeploymentStatus::Scaling;
                record.last_run_id = Some(run.clone());
                record.failure = None;
                record.rolled_back = false;
                record
            }
        };

        self.save(record).await
    }

    /// Fail the record of `stale`, a run whose process is known to be gone.
    ///
    /// Does nothing when the record has moved on or already ended.
    pub async fn abandon(&self, service: &ServiceName, stale: &RunId) -> Result<(), StatusError> {
        let Some(record) = self.store.load(service).await? else {
            return Ok(());
        };
        if record.status.is_terminal() || !record.is_owned_by(stale) {
            return Ok(());
        }
        tracing::warn!("Run {} of {} was interrupted while {}", stale, service, record.status);
        let reason = FailureReason::new(None, format!("run {} was interrupted", stale));
        self.fail(service, stale, reason, false).await?;
        Ok(())
    }

    /// Move the record owned by `run` to `next`.
    pub async fn transition(
        &self,
        service: &ServiceName,
        run: &RunId,
        next: DeploymentStatus,
    ) -> Result<ServiceRecord, StatusError> {
        let mut record = self.owned(service, run).await?;
        Self::check(&record, next)?;
        record.status = next;
        self.save(record).await
    }

    /// Finish `run` successfully, remembering `deployed` as the rollback target
    /// and the descriptor it replaced as the one before it.
    pub async fn succeed(
        &self,
        service: &ServiceName,
        run: &RunId,
        deployed: DeploymentDescriptor,
    ) -> Result<ServiceRecord, StatusError> {
        let mut record = self.owned(service, run).await?;
        Self::check(&record, DeploymentStatus::Succeeded)?;
        record.status = DeploymentStatus::Succeeded;
        if record.last_success_descriptor.as_ref() != Some(&deployed) {
            record.previous_descriptor = record.last_success_descriptor.take();
        }
        record.last_success_descriptor = Some(deployed);
        record.failure = None;
        record.rolled_back = false;
        self.save(record).await
    }

    /// Finish `run` as failed.
    ///
    /// A run that never left `pending` (cancelled while queued) is passed
    /// through `running` so the history stays a legal walk.
    pub async fn fail(
        &self,
        service: &ServiceName,
        run: &RunId,
        reason: FailureReason,
        rolled_back: bool,
    ) -> Result<ServiceRecord, StatusError> {
        let mut record = self.owned(service, run).await?;
        if record.status == DeploymentStatus::Pending {
            record.status = DeploymentStatus::Running;
        }
        Self::check(&record, DeploymentStatus::Failed)?;
        record.status = DeploymentStatus::Failed;
        record.failure = Some(reason);
        record.rolled_back = rolled_back;
        self.save(record).await
    }

    pub async fn remove(&self, service: &ServiceName) -> Result<(), StatusError> {
        self.store.delete(service).await
    }

    async fn owned(&self, service: &ServiceName, run: &RunId) -> Result<ServiceRecord, StatusError> {
        let record = self
            .store
            .load(service)
            .await?
            .ok_or_else(|| StatusError::NotFound(service.clone()))?;
        if !record.is_owned_by(run) {
            return Err(StatusError::NotOwner {
                service: service.clone(),
                run: run.clone(),
            });
        }
        Ok(record)
    }

    fn check(record: &ServiceRecord, next: DeploymentStatus) -> Result<(), StatusError> {
        if record.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(StatusError::InvalidTransition {
                service: record.service.clone(),
                from: record.status,
                to: next,
            })
        }
    }

    async fn save(&self, mut record: ServiceRecord) -> Result<ServiceRecord, StatusError> {
        record.updated_at = Utc::now();
        self.store.save(&record).await?;
        tracing::debug!(service = %record.service, status = %record.status, "Status updated");
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{MemoryStatusStore, StatusStore};
    use crate::types::ImageRef;

    fn tracker() -> StatusTracker {
        StatusTracker::new(Arc::new(MemoryStatusStore::new()))
    }

    fn web() -> ServiceName {
        ServiceName::new("web").unwrap()
    }

    fn descriptor() -> DeploymentDescriptor {
        DeploymentDescriptor::builder(web(), ImageRef::parse("nginx:1").unwrap())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn first_deploy_walks_pending_running_succeeded() {
        let tracker = tracker();
        let run = RunId::new("r1");

        let record = tracker.begin(&web(), &run, RunKind::Deploy).await.unwrap();
        assert_eq!(record.status, DeploymentStatus::Pending);
        tracker
            .transition(&web(), &run, DeploymentStatus::Running)
            .await
            .unwrap();
        let record = tracker.succeed(&web(), &run, descriptor()).await.unwrap();

        assert_eq!(record.status, DeploymentStatus::Succeeded);
        assert_eq!(record.last_success_descriptor, Some(descriptor()));
    }

    #[tokio::test]
    async fn redeploy_enters_updating() {
        let tracker = tracker();
        let first = RunId::new("r1");
        tracker.begin(&web(), &first, RunKind::Deploy).await.unwrap();
        tracker
            .transition(&web(), &first, DeploymentStatus::Running)
            .await
            .unwrap();
        tracker.succeed(&web(), &first, descriptor()).await.unwrap();

        let second = RunId::new("r2");
        let record = tracker.begin(&web(), &second, RunKind::Deploy).await.unwrap();
        assert_eq!(record.status, DeploymentStatus::Updating);
        assert!(record.last_success_descriptor.is_some());
    }

    #[tokio::test]
    async fn other_runs_cannot_move_the_record() {
        let tracker = tracker();
        tracker
            .begin(&web(), &RunId::new("r1"), RunKind::Deploy)
            .await
            .unwrap();

        let err = tracker
            .transition(&web(), &RunId::new("intruder"), DeploymentStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, StatusError::NotOwner { .. }));
        let record = tracker.get(&web()).await.unwrap().unwrap();
        assert_eq!(record.status, DeploymentStatus::Pending);
    }

    #[tokio::test]
    async fn scale_needs_a_succeeded_service() {
        let tracker = tracker();
        let err = tracker
            .begin(&web(), &RunId::new("r1"), RunKind::Scale)
            .await
            .unwrap_err();
        assert!(matches!(err, StatusError::NotFound(_)));

        let run = RunId::new("r2");
        tracker.begin(&web(), &run, RunKind::Deploy).await.unwrap();
        tracker
            .fail(&web(), &run, FailureReason::new(None, "boom"), false)
            .await
            .unwrap();
        let err = tracker
            .begin(&web(), &RunId::new("r3"), RunKind::Scale)
            .await
            .unwrap_err();
        assert!(matches!(err, StatusError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn begin_refuses_a_record_owned_by_a_live_run() {
        let tracker = tracker();
        let first = RunId::new("r1");
        tracker.begin(&web(), &first, RunKind::Deploy).await.unwrap();
        tracker
            .transition(&web(), &first, DeploymentStatus::Running)
            .await
            .unwrap();

        let err = tracker
            .begin(&web(), &RunId::new("r2"), RunKind::Deploy)
            .await
            .unwrap_err();

        assert!(
            matches!(&err, StatusError::InFlight { status: DeploymentStatus::Running, run: Some(run), .. } if *run == first),
            "got {:?}",
            err
        );
        let record = tracker.get(&web()).await.unwrap().unwrap();
        assert!(record.is_owned_by(&first));
        assert_eq!(record.status, DeploymentStatus::Running);
    }

    #[tokio::test]
    async fn abandoned_run_is_failed_so_the_next_can_start() {
        let tracker = tracker();
        let crashed = RunId::new("r1");
        tracker.begin(&web(), &crashed, RunKind::Deploy).await.unwrap();
        tracker
            .transition(&web(), &crashed, DeploymentStatus::Running)
            .await
            .unwrap();

        tracker.abandon(&web(), &crashed).await.unwrap();
        let record = tracker.get(&web()).await.unwrap().unwrap();
        assert_eq!(record.status, DeploymentStatus::Failed);
        assert_eq!(record.failure.unwrap().message, "run r1 was interrupted");

        let next = RunId::new("r2");
        let record = tracker.begin(&web(), &next, RunKind::Deploy).await.unwrap();
        assert_eq!(record.status, DeploymentStatus::Pending);
        assert!(record.is_owned_by(&next));
    }

    #[tokio::test]
    async fn abandon_leaves_records_that_moved_on() {
        let tracker = tracker();
        let current = RunId::new("r2");
        tracker.begin(&web(), &current, RunKind::Deploy).await.unwrap();

        tracker.abandon(&web(), &RunId::new("r1")).await.unwrap();

        let record = tracker.get(&web()).await.unwrap().unwrap();
        assert_eq!(record.status, DeploymentStatus::Pending);
        assert!(record.is_owned_by(&current));
    }

    #[tokio::test]
    async fn long_idle_record_counts_as_abandoned() {
        let store = Arc::new(MemoryStatusStore::new());
        let mut record = ServiceRecord::new(web(), DeploymentStatus::Running, RunId::new("r1"));
        record.updated_at = Utc::now() - chrono::Duration::hours(3);
        store.save(&record).await.unwrap();
        let tracker = StatusTracker::new(store);

        let record = tracker
            .begin(&web(), &RunId::new("r2"), RunKind::Deploy)
            .await
            .unwrap();
        assert_eq!(record.status, DeploymentStatus::Pending);
    }

    #[tokio::test]
    async fn success_remembers_the_descriptor_it_replaced() {
        let tracker = tracker();
        let v2 = DeploymentDescriptor::builder(web(), ImageRef::parse("nginx:2").unwrap())
            .build()
            .unwrap();
        for (run, deployed) in [("r1", descriptor()), ("r2", v2.clone()), ("r3", v2.clone())] {
            let run = RunId::new(run);
            let record = tracker.begin(&web(), &run, RunKind::Deploy).await.unwrap();
            if record.status == DeploymentStatus::Pending {
                tracker
                    .transition(&web(), &run, DeploymentStatus::Running)
                    .await
                    .unwrap();
            }
            tracker.succeed(&web(), &run, deployed).await.unwrap();
        }

        let record = tracker.get(&web()).await.unwrap().unwrap();
        assert_eq!(record.last_success_descriptor, Some(v2));
        assert_eq!(record.previous_descriptor, Some(descriptor()));
        assert_eq!(record.rollback_target(), Some(&descriptor()));
    }

    #[tokio::test]
    async fn failing_a_queued_run_passes_through_running() {
        let tracker = tracker();
        let run = RunId::new("r1");
        tracker.begin(&web(), &run, RunKind::Deploy).await.unwrap();

        let record = tracker
            .fail(&web(), &run, FailureReason::new(None, "cancelled"), false)
            .await
            .unwrap();
        assert_eq!(record.status, DeploymentStatus::Failed);
        assert_eq!(record.failure.unwrap().message, "cancelled");
    }
}
