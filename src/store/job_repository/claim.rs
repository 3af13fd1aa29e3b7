//! Worker claims and stale-claim reclaim.

use std::time::Duration;

use libsql::params::Params;
use libsql::{Value, params};
use tracing::{debug, info};

use super::BackgroundJobRepository;
use super::rows::{
    CLAIM_ORDER, collect_jobs, millis_before, placeholders, select_columns, to_millis,
};
use crate::error::{DatabaseError, Result};
use crate::jobs::model::now_millis;
use crate::jobs::{Job, PayloadMode};
use crate::store::pool::AccessMode;
use crate::store::schema::JOBS_TABLE;

impl BackgroundJobRepository {
    /// Atomically claim up to `limit` queued jobs for a worker.
    ///
    /// Selection and the move to `acknowledged_by_worker` happen in one
    /// immediate transaction, so concurrent callers never receive the same
    /// job. Higher `priority` metadata goes first, then oldest first.
    pub async fn get_and_acknowledge_queued_jobs(
        &self,
        limit: usize,
        task_types: Option<&[&str]>,
    ) -> Result<Vec<Job>> {
        let task_types = task_types.filter(|types| !types.is_empty());
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.ensure_schema().await?;

        let filter = match task_types {
            Some(types) => format!(" AND task_type IN {}", placeholders(types.len())),
            None => String::new(),
        };
        let select_ids = format!(
            "SELECT id FROM {JOBS_TABLE} WHERE status = 'queued'{filter} ORDER BY {CLAIM_ORDER} LIMIT ?"
        );
        let select_job = format!(
            "SELECT {} FROM {JOBS_TABLE} WHERE id = ?1",
            select_columns(PayloadMode::Full)
        );
        let (select_ids, select_job) = (&select_ids, &select_job);
        let now = to_millis(now_millis());

        let claimed = self
            .pool
            .with_transaction(|conn| async move {
                self.bootstrap_if_reopened(&conn).await?;

                let mut values: Vec<Value> = task_types
                    .unwrap_or_default()
                    .iter()
                    .map(|t| Value::Text(t.to_string()))
                    .collect();
                values.push(Value::Integer(limit as i64));

                let mut rows = conn
                    .query(select_ids, Params::Positional(values))
                    .await
                    .map_err(|e| DatabaseError::from_libsql("claim_select", e))?;
                let mut ids = Vec::new();
                while let Some(row) = rows
                    .next()
                    .await
                    .map_err(|e| DatabaseError::from_libsql("claim_select", e))?
                {
                    ids.push(row.get::<String>(0)?);
                }
                drop(rows);

                let mut jobs = Vec::with_capacity(ids.len());
                for id in &ids {
                    let changed = conn
                        .execute(
                            "UPDATE background_jobs
                             SET status = 'acknowledged_by_worker', updated_at = ?1, last_update = ?1
                             WHERE id = ?2 AND status = 'queued'",
                            params![now, id.as_str()],
                        )
                        .await
                        .map_err(|e| DatabaseError::from_libsql("claim_update", e))?;
                    if changed != 1 {
                        continue;
                    }
                    let rows = conn
                        .query(select_job, params![id.as_str()])
                        .await
                        .map_err(|e| DatabaseError::from_libsql("claim_reload", e))?;
                    jobs.extend(collect_jobs(rows, "claim_reload").await?);
                }
                Ok(jobs)
            })
            .await?;

        if !claimed.is_empty() {
            debug!(count = claimed.len(), limit, "Claimed queued jobs");
        }
        Ok(claimed)
    }

    /// Hand claims older than `threshold` back to the queue.
    pub async fn reset_stale_acknowledged_jobs(&self, threshold: Duration) -> Result<u64> {
        self.ensure_schema().await?;
        let now = to_millis(now_millis());
        let cutoff = millis_before(now, threshold);

        let count = self
            .pool
            .with_connection(AccessMode::ReadWrite, |conn| async move {
                self.bootstrap_if_reopened(&conn).await?;
                conn.execute(
                    "UPDATE background_jobs
                     SET status = 'queued', updated_at = ?1, last_update = ?1
                     WHERE status = 'acknowledged_by_worker' AND updated_at < ?2",
                    params![now, cutoff],
                )
                .await
                .map_err(|e| DatabaseError::from_libsql("reset_stale_acknowledged_jobs", e))
                .map_err(Into::into)
            })
            .await?;

        if count > 0 {
            info!(count, threshold_secs = threshold.as_secs(), "Reset stale acknowledged jobs");
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::super::test_support::test_repo;
    use super::*;
    use crate::jobs::{JobStatus, NewJob};

    async fn queued(repo: &BackgroundJobRepository, task: &str, priority: Option<i64>) -> Job {
        let mut request = NewJob::new("s1", "api", task, "p").with_status(JobStatus::Queued);
        if let Some(p) = priority {
            request = request.with_priority(p);
        }
        let job = repo.create_background_job(request).await.unwrap();
        // Distinct creation times for FIFO ordering.
        tokio::time::sleep(Duration::from_millis(3)).await;
        job
    }

    #[tokio::test]
    async fn claim_marks_jobs_acknowledged() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = test_repo(tmp.path()).await;
        let job = queued(&repo, "task", None).await;

        let claimed = repo.get_and_acknowledge_queued_jobs(1, None).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, job.id);
        assert_eq!(claimed[0].status, JobStatus::AcknowledgedByWorker);

        let again = repo.get_and_acknowledge_queued_jobs(1, None).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn claim_orders_by_priority_then_age() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = test_repo(tmp.path()).await;
        let oldest = queued(&repo, "task", None).await;
        let low = queued(&repo, "task", Some(0)).await;
        let urgent = queued(&repo, "task", Some(10)).await;
        let newer = queued(&repo, "task", None).await;

        let claimed = repo.get_and_acknowledge_queued_jobs(10, None).await.unwrap();
        let ids: Vec<_> = claimed.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![urgent.id.as_str(), oldest.id.as_str(), newer.id.as_str(), low.id.as_str()]
        );
    }

    #[tokio::test]
    async fn claim_filters_by_task_type() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = test_repo(tmp.path()).await;
        queued(&repo, "summary", None).await;
        let plan = queued(&repo, "implementation_plan", None).await;

        let claimed = repo
            .get_and_acknowledge_queued_jobs(5, Some(&["implementation_plan"][..]))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, plan.id);

        // Empty filter means no filter.
        let rest = repo.get_and_acknowledge_queued_jobs(5, Some(&[][..])).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].task_type, "summary");
    }

    #[tokio::test]
    async fn claim_skips_non_queued_jobs() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = test_repo(tmp.path()).await;
        repo.create_background_job(NewJob::new("s1", "api", "task", "p"))
            .await
            .unwrap();
        assert!(repo.get_and_acknowledge_queued_jobs(5, None).await.unwrap().is_empty());
        assert!(repo.get_and_acknowledge_queued_jobs(0, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_reset_only_touches_old_claims() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = test_repo(tmp.path()).await;

        let mut stale = Job::new("s1", "api", "task", "p", JobStatus::AcknowledgedByWorker);
        stale.updated_at = Utc::now() - chrono::Duration::minutes(10);
        repo.save_background_job(&stale).await.unwrap();

        let fresh = Job::new("s1", "api", "task", "p", JobStatus::AcknowledgedByWorker);
        repo.save_background_job(&fresh).await.unwrap();

        let mut old_running = Job::new("s1", "api", "task", "p", JobStatus::Running);
        old_running.updated_at = Utc::now() - chrono::Duration::minutes(10);
        repo.save_background_job(&old_running).await.unwrap();

        let count = repo
            .reset_stale_acknowledged_jobs(Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(count, 1);

        let status = |job: Option<Job>| job.unwrap().status;
        assert_eq!(status(repo.get_background_job(&stale.id).await), JobStatus::Queued);
        assert_eq!(
            status(repo.get_background_job(&fresh.id).await),
            JobStatus::AcknowledgedByWorker
        );
        assert_eq!(status(repo.get_background_job(&old_running.id).await), JobStatus::Running);
    }

    #[tokio::test]
    async fn huge_stale_threshold_resets_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = test_repo(tmp.path()).await;
        let job = queued(&repo, "task", None).await;
        repo.get_and_acknowledge_queued_jobs(1, None).await.unwrap();

        let count = repo
            .reset_stale_acknowledged_jobs(Duration::from_secs(u64::MAX / 1000))
            .await
            .unwrap();
        assert_eq!(count, 0);
        let job = repo.get_background_job(&job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::AcknowledgedByWorker);
    }
}
