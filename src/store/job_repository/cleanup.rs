//! Retention: soft-clearing and purging finished jobs.

use libsql::params;
use tracing::info;

use super::{BackgroundJobRepository, HISTORY_PURGE_DAYS};
use super::rows::{days_before, to_millis};
use crate::error::{DatabaseError, Result};
use crate::jobs::model::now_millis;
use crate::jobs::{HistoryCleanup, JobStatus};
use crate::store::pool::AccessMode;
use crate::store::schema::JOBS_TABLE;

impl BackgroundJobRepository {
    /// Apply the retention policy to finished jobs.
    ///
    /// `-1` deletes every terminal job now. Any other value purges terminal
    /// jobs older than 90 days; a positive value additionally hides terminal
    /// jobs older than that many days by setting `cleared`.
    pub async fn clear_background_job_history(&self, days_to_keep: i64) -> Result<HistoryCleanup> {
        self.ensure_schema().await?;
        let now = to_millis(now_millis());
        let terminal = JobStatus::terminal_sql_list();

        let delete_all = format!("DELETE FROM {JOBS_TABLE} WHERE status IN {terminal}");
        let purge_old =
            format!("DELETE FROM {JOBS_TABLE} WHERE status IN {terminal} AND created_at < ?1");
        let soft_clear = format!(
            "UPDATE {JOBS_TABLE} SET cleared = 1, updated_at = ?2
             WHERE status IN {terminal} AND cleared = 0 AND created_at < ?1"
        );
        let (delete_all, purge_old, soft_clear) = (&delete_all, &purge_old, &soft_clear);

        let cleanup = self
            .pool
            .with_transaction(|conn| async move {
                self.bootstrap_if_reopened(&conn).await?;
                let mut cleanup = HistoryCleanup::default();

                if days_to_keep == -1 {
                    cleanup.deleted = conn
                        .execute(delete_all, ())
                        .await
                        .map_err(|e| DatabaseError::from_libsql("clear_history_all", e))?;
                    return Ok(cleanup);
                }

                let purge_before = days_before(now, HISTORY_PURGE_DAYS);
                cleanup.deleted = conn
                    .execute(purge_old, params![purge_before])
                    .await
                    .map_err(|e| DatabaseError::from_libsql("clear_history_purge", e))?;

                if days_to_keep > 0 {
                    let clear_before = days_before(now, days_to_keep);
                    cleanup.cleared = conn
                        .execute(soft_clear, params![clear_before, now])
                        .await
                        .map_err(|e| DatabaseError::from_libsql("clear_history_soft", e))?;
                }
                Ok(cleanup)
            })
            .await?;

        if cleanup.deleted > 0 || cleanup.cleared > 0 {
            info!(
                days_to_keep,
                deleted = cleanup.deleted,
                cleared = cleanup.cleared,
                "Cleared background job history"
            );
        }
        Ok(cleanup)
    }

    /// Delete every terminal job.
    pub async fn clear_all_completed_jobs(&self) -> Result<u64> {
        self.ensure_schema().await?;
        let sql = format!(
            "DELETE FROM {JOBS_TABLE} WHERE status IN {}",
            JobStatus::terminal_sql_list()
        );
        let sql = &sql;

        let count = self
            .pool
            .with_connection(AccessMode::ReadWrite, |conn| async move {
                self.bootstrap_if_reopened(&conn).await?;
                conn.execute(sql, ())
                    .await
                    .map_err(|e| DatabaseError::from_libsql("clear_all_completed_jobs", e))
                    .map_err(Into::into)
            })
            .await?;

        info!(count, "Cleared completed jobs");
        Ok(count)
    }

    /// Delete every terminal job of one session.
    pub async fn clear_completed_jobs_for_session(&self, session_id: &str) -> Result<u64> {
        self.ensure_schema().await?;
        let sql = format!(
            "DELETE FROM {JOBS_TABLE} WHERE session_id = ?1 AND status IN {}",
            JobStatus::terminal_sql_list()
        );
        let sql = &sql;

        let count = self
            .pool
            .with_connection(AccessMode::ReadWrite, |conn| async move {
                self.bootstrap_if_reopened(&conn).await?;
                conn.execute(sql, params![session_id])
                    .await
                    .map_err(|e| DatabaseError::from_libsql("clear_completed_jobs_for_session", e))
                    .map_err(Into::into)
            })
            .await?;

        info!(session_id, count, "Cleared completed session jobs");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::super::test_support::test_repo;
    use super::*;
    use crate::jobs::{Job, PayloadMode};

    async fn save_aged(repo: &BackgroundJobRepository, status: JobStatus, age_days: i64) -> Job {
        let mut job = Job::new("s1", "api", "t", "p", status);
        job.created_at = Utc::now() - chrono::Duration::days(age_days);
        job.updated_at = job.created_at;
        repo.save_background_job(&job).await.unwrap()
    }

    #[tokio::test]
    async fn minus_one_deletes_only_terminal_jobs() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = test_repo(tmp.path()).await;
        for _ in 0..3 {
            save_aged(&repo, JobStatus::Completed, 0).await;
        }
        for _ in 0..2 {
            save_aged(&repo, JobStatus::Running, 0).await;
        }

        let cleanup = repo.clear_background_job_history(-1).await.unwrap();
        assert_eq!(cleanup, HistoryCleanup { deleted: 3, cleared: 0 });

        let left = repo.get_session_background_jobs("s1", PayloadMode::Full).await;
        assert_eq!(left.len(), 2);
        assert!(left.iter().all(|j| j.status == JobStatus::Running));
    }

    #[tokio::test]
    async fn retention_window_soft_clears_and_purges() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = test_repo(tmp.path()).await;
        let ancient = save_aged(&repo, JobStatus::Failed, 120).await;
        let week_old = save_aged(&repo, JobStatus::Completed, 10).await;
        let fresh = save_aged(&repo, JobStatus::Completed, 1).await;
        let old_active = save_aged(&repo, JobStatus::Queued, 120).await;

        let cleanup = repo.clear_background_job_history(7).await.unwrap();
        assert_eq!(cleanup, HistoryCleanup { deleted: 1, cleared: 1 });

        assert!(repo.get_background_job(&ancient.id).await.is_none());
        assert!(repo.get_background_job(&week_old.id).await.unwrap().cleared);
        assert!(!repo.get_background_job(&fresh.id).await.unwrap().cleared);
        assert!(repo.get_background_job(&old_active.id).await.is_some());

        // Second pass has nothing new to hide.
        let again = repo.clear_background_job_history(7).await.unwrap();
        assert_eq!(again, HistoryCleanup::default());
    }

    #[tokio::test]
    async fn zero_days_only_purges() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = test_repo(tmp.path()).await;
        save_aged(&repo, JobStatus::Completed, 100).await;
        let recent = save_aged(&repo, JobStatus::Completed, 30).await;

        let cleanup = repo.clear_background_job_history(0).await.unwrap();
        assert_eq!(cleanup, HistoryCleanup { deleted: 1, cleared: 0 });
        assert!(!repo.get_background_job(&recent.id).await.unwrap().cleared);
    }

    #[tokio::test]
    async fn clear_completed_all_and_per_session() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = test_repo(tmp.path()).await;
        repo.save_background_job(&Job::new("a", "api", "t", "p", JobStatus::Completed))
            .await
            .unwrap();
        repo.save_background_job(&Job::new("b", "api", "t", "p", JobStatus::Canceled))
            .await
            .unwrap();
        repo.save_background_job(&Job::new("b", "api", "t", "p", JobStatus::Running))
            .await
            .unwrap();

        assert_eq!(repo.clear_completed_jobs_for_session("a").await.unwrap(), 1);
        assert_eq!(repo.clear_all_completed_jobs().await.unwrap(), 1);
        assert_eq!(repo.get_session_background_jobs("b", PayloadMode::Full).await.len(), 1);
    }

    #[tokio::test]
    async fn huge_retention_window_clears_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = test_repo(tmp.path()).await;
        let done = save_aged(&repo, JobStatus::Completed, 30).await;

        let cleanup = repo.clear_background_job_history(i64::MAX / 1000).await.unwrap();
        assert_eq!(cleanup, HistoryCleanup::default());
        assert!(!repo.get_background_job(&done.id).await.unwrap().cleared);

        let cleanup = repo.clear_background_job_history(i64::MAX).await.unwrap();
        assert_eq!(cleanup, HistoryCleanup::default());
    }
}
