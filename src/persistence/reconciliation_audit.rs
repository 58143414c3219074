//! Reconciliation Audit Repository
//!
//! Append-only trail of reconciliation reports. Reports are stored whole as
//! JSON alongside a few indexed summary columns.

use super::models::ReconciliationAuditRecord;
use super::DbPool;
use crate::domain::errors::StoreError;
use crate::domain::services::position_reconciliation::ReconciliationReport;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, warn};

/// Reconciliation repository trait
#[async_trait]
pub trait ReconciliationRepository: Send + Sync {
    /// Stores a report. Returns false when a report with the same id exists.
    async fn save_reconciliation(&self, report: &ReconciliationReport) -> Result<bool, StoreError>;

    async fn get_last_reconciliation(&self) -> Result<Option<ReconciliationReport>, StoreError>;

    /// Reports from the last `days` days, newest first.
    async fn get_reconciliation_history(&self, days: u32) -> Result<Vec<ReconciliationReport>, StoreError>;
}

/// SQLite implementation of reconciliation repository
pub struct SqliteReconciliationRepository {
    pool: DbPool,
}

impl SqliteReconciliationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn into_report(record: ReconciliationAuditRecord) -> Result<ReconciliationReport, StoreError> {
    serde_json::from_str(&record.report_json).map_err(|e| {
        StoreError::Corrupt(format!(
            "reconciliation {}: {}",
            record.reconciliation_id, e
        ))
    })
}

#[async_trait]
impl ReconciliationRepository for SqliteReconciliationRepository {
    async fn save_reconciliation(&self, report: &ReconciliationReport) -> Result<bool, StoreError> {
        let report_json = serde_json::to_string(report)?;

        let rows = sqlx::query(
            r#"
            INSERT INTO reconciliation_audit (
                reconciliation_id, reconciliation_timestamp, status,
                positions_checked, broker_checked, anomaly_count, report_json, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(reconciliation_id) DO NOTHING
            "#,
        )
        .bind(&report.reconciliation_id)
        .bind(report.timestamp)
        .bind(report.status.to_string())
        .bind(report.positions_checked as i64)
        .bind(report.broker_checked)
        .bind(report.anomaly_count() as i64)
        .bind(&report_json)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to save reconciliation audit: {}", e);
            StoreError::from(e)
        })?
        .rows_affected();

        if rows == 1 {
            debug!(
                "Saved reconciliation audit {} ({})",
                report.reconciliation_id, report.status
            );
        } else {
            warn!(
                "Reconciliation audit {} already recorded, report not saved",
                report.reconciliation_id
            );
        }
        Ok(rows == 1)
    }

    async fn get_last_reconciliation(&self) -> Result<Option<ReconciliationReport>, StoreError> {
        let record = sqlx::query_as::<_, ReconciliationAuditRecord>(
            r#"
            SELECT * FROM reconciliation_audit
            ORDER BY reconciliation_timestamp DESC, id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get last reconciliation: {}", e);
            StoreError::from(e)
        })?;

        record.map(into_report).transpose()
    }

    async fn get_reconciliation_history(&self, days: u32) -> Result<Vec<ReconciliationReport>, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::days(days as i64);

        let records = sqlx::query_as::<_, ReconciliationAuditRecord>(
            r#"
            SELECT * FROM reconciliation_audit
            WHERE reconciliation_timestamp >= ?1
            ORDER BY reconciliation_timestamp DESC, id DESC
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get reconciliation history: {}", e);
            StoreError::from(e)
        })?;

        records.into_iter().map(into_report).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::services::position_reconciliation::{DiscrepancySeverity, ReconciliationAnomaly};
    use crate::persistence::init_database;

    #[tokio::test]
    async fn test_save_and_load_report() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let repo = SqliteReconciliationRepository::new(pool);

        let mut report = ReconciliationReport::new(Utc::now());
        report.positions_checked = 3;
        report.add(ReconciliationAnomaly::MissingAtBroker {
            position_id: "pos_XOM_1".to_string(),
            ticker: "XOM".to_string(),
            shares: 20,
        });

        assert!(repo.save_reconciliation(&report).await.unwrap());
        // Same id again is absorbed
        assert!(!repo.save_reconciliation(&report).await.unwrap());

        let last = repo.get_last_reconciliation().await.unwrap().unwrap();
        assert_eq!(last.reconciliation_id, report.reconciliation_id);
        assert_eq!(last.status, DiscrepancySeverity::Critical);
        assert_eq!(last.missing_at_broker.len(), 1);

        assert_eq!(repo.get_reconciliation_history(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_audit_trail() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let repo = SqliteReconciliationRepository::new(pool);
        assert!(repo.get_last_reconciliation().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reports_in_same_millisecond_are_both_kept() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let repo = SqliteReconciliationRepository::new(pool);

        let now = Utc::now();
        let first = ReconciliationReport::new(now);
        let second = ReconciliationReport::new(now);
        assert_ne!(first.reconciliation_id, second.reconciliation_id);

        assert!(repo.save_reconciliation(&first).await.unwrap());
        assert!(repo.save_reconciliation(&second).await.unwrap());
        assert_eq!(repo.get_reconciliation_history(10).await.unwrap().len(), 2);
    }
}
