use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqliteConnection;

use super::Database;
use crate::error::Result;
use crate::models::{AuditEvent, AuditRecord};

/// An audit row about to be appended.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub event: AuditEvent,
    pub master_ticket: Option<i64>,
    pub slave_name: Option<String>,
    pub slave_ticket: Option<i64>,
    pub details: Value,
}

impl AuditEntry {
    pub fn new(event: AuditEvent) -> Self {
        Self {
            event,
            master_ticket: None,
            slave_name: None,
            slave_ticket: None,
            details: Value::Object(Default::default()),
        }
    }

    pub fn master(mut self, ticket: i64) -> Self {
        self.master_ticket = Some(ticket);
        self
    }

    pub fn slave(mut self, name: &str) -> Self {
        self.slave_name = Some(name.to_string());
        self
    }

    pub fn slave_ticket(mut self, ticket: Option<i64>) -> Self {
        self.slave_ticket = ticket;
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AuditRow {
    id: i64,
    event_type: String,
    master_ticket: Option<i64>,
    slave_name: Option<String>,
    slave_ticket: Option<i64>,
    details: String,
    created_at: DateTime<Utc>,
}

impl From<AuditRow> for AuditRecord {
    fn from(row: AuditRow) -> Self {
        AuditRecord {
            id: row.id,
            event_type: row.event_type,
            master_ticket: row.master_ticket,
            slave_name: row.slave_name,
            slave_ticket: row.slave_ticket,
            details: serde_json::from_str(&row.details).unwrap_or(Value::String(row.details)),
            created_at: row.created_at,
        }
    }
}

/// Append an audit row on an open connection or transaction.
pub(crate) async fn log_event(conn: &mut SqliteConnection, entry: &AuditEntry) -> Result<i64> {
    let id = sqlx::query(
        r#"
        INSERT INTO audit_log (event_type, master_ticket, slave_name, slave_ticket, details, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(entry.event.as_str())
    .bind(entry.master_ticket)
    .bind(entry.slave_name.as_deref())
    .bind(entry.slave_ticket)
    .bind(entry.details.to_string())
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    Ok(id)
}

impl Database {
    /// Append an audit row outside any transaction.
    pub async fn record(&self, entry: AuditEntry) -> Result<i64> {
        let mut conn = self.pool().acquire().await?;
        log_event(&mut conn, &entry).await
    }

    /// Latest audit rows, newest first, optionally for one event type.
    pub async fn recent_audit(&self, limit: i64, event_type: Option<&str>) -> Result<Vec<AuditRecord>> {
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT id, event_type, master_ticket, slave_name, slave_ticket, details, created_at
            FROM audit_log
            WHERE (?1 IS NULL OR event_type = ?1)
            ORDER BY id DESC
            LIMIT ?2
            "#,
        )
        .bind(event_type)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(rows.into_iter().map(AuditRecord::from).collect())
    }

    pub async fn count_audit(&self, event: AuditEvent) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM audit_log WHERE event_type = ?")
            .bind(event.as_str())
            .fetch_one(self.pool())
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_record_and_filter() {
        let db = Database::in_memory().await.unwrap();
        db.record(
            AuditEntry::new(AuditEvent::PositionOpened)
                .master(1001)
                .slave("s1")
                .slave_ticket(Some(5001))
                .details(json!({"volume": "0.10"})),
        )
        .await
        .unwrap();
        db.record(AuditEntry::new(AuditEvent::SlaveAdded).slave("s2"))
            .await
            .unwrap();

        let all = db.recent_audit(10, None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].event_type, "slave_added");

        let opened = db.recent_audit(10, Some("position_opened")).await.unwrap();
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].slave_ticket, Some(5001));
        assert_eq!(opened[0].details["volume"], "0.10");
        assert_eq!(db.count_audit(AuditEvent::SlaveAdded).await.unwrap(), 1);
    }
}
