use chrono::{DateTime, TimeZone, Utc};
use sqlx::SqliteConnection;

use super::{parse_column, Database};
use crate::error::{CopierError, Result};
use crate::models::{
    OperationPayload, OperationStatus, OperationType, QueueStats, QueuedOperation,
};

#[derive(Debug, sqlx::FromRow)]
struct OperationRow {
    id: i64,
    operation_type: String,
    master_ticket: i64,
    slave_name: String,
    payload: String,
    attempts: i64,
    max_attempts: i64,
    status: String,
    error_message: Option<String>,
    next_retry_at: i64,
    recovered: bool,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<OperationRow> for QueuedOperation {
    type Error = CopierError;

    fn try_from(row: OperationRow) -> Result<Self> {
        let payload: OperationPayload = serde_json::from_str(&row.payload)?;
        let operation_type = parse_column::<OperationType>("operation_type", &row.operation_type)?;
        if payload.operation_type() != operation_type {
            return Err(CopierError::Consistency(format!(
                "entry {} is {} but carries a {} payload",
                row.id,
                operation_type,
                payload.operation_type()
            )));
        }

        Ok(QueuedOperation {
            id: row.id,
            operation_type,
            master_ticket: row.master_ticket,
            slave_name: row.slave_name,
            payload,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            max_attempts: u32::try_from(row.max_attempts).unwrap_or(0),
            status: parse_column::<OperationStatus>("status", &row.status)?,
            error_message: row.error_message,
            next_retry_at: millis_to_datetime(row.next_retry_at),
            created_at: row.created_at,
            completed_at: row.completed_at,
            recovered: row.recovered,
        })
    }
}

fn convert(rows: Vec<OperationRow>) -> Result<Vec<QueuedOperation>> {
    rows.into_iter().map(QueuedOperation::try_from).collect()
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// An entry about to be enqueued.
#[derive(Debug, Clone)]
pub struct NewOperation {
    pub master_ticket: i64,
    pub slave_name: String,
    pub payload: OperationPayload,
    pub max_attempts: u32,
}

impl NewOperation {
    pub fn operation_type(&self) -> OperationType {
        self.payload.operation_type()
    }
}

/// Result of `enqueue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Inserted(i64),
    /// An equivalent live entry already exists
    Duplicate(i64),
    /// A pending modify took the newer stops
    Refreshed(i64),
}

impl EnqueueOutcome {
    pub fn id(&self) -> i64 {
        match self {
            EnqueueOutcome::Inserted(id)
            | EnqueueOutcome::Duplicate(id)
            | EnqueueOutcome::Refreshed(id) => *id,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, EnqueueOutcome::Inserted(_))
    }
}

/// Filter for listing queue entries.
#[derive(Debug, Clone, Default)]
pub struct OperationFilter {
    pub status: Option<OperationStatus>,
    pub slave_name: Option<String>,
    pub master_ticket: Option<i64>,
    pub limit: Option<i64>,
}

const SELECT_OPERATION: &str = r#"
    SELECT id, operation_type, master_ticket, slave_name, payload, attempts,
           max_attempts, status, error_message, next_retry_at, recovered,
           created_at, completed_at
    FROM operation_queue
"#;

#[derive(Debug, sqlx::FromRow)]
struct LiveEntry {
    id: i64,
    status: String,
    payload: String,
}

impl Database {
    // ==================== Enqueue ====================

    /// Add an entry unless an equivalent one is already live for the pair.
    ///
    /// Opens and closes are deduplicated on (master_ticket, slave, type).
    /// A modify with a pending sibling overwrites the sibling's stops. A
    /// partial close, or a modify racing one already in flight, is only a
    /// duplicate when its payload is identical.
    pub async fn enqueue(&self, op: &NewOperation) -> Result<EnqueueOutcome> {
        let mut tx = self.begin().await?;
        let op_type = op.operation_type();

        let live: Vec<LiveEntry> = sqlx::query_as(
            r#"
            SELECT id, status, payload FROM operation_queue
            WHERE master_ticket = ? AND slave_name = ? AND operation_type = ?
              AND status IN ('pending', 'processing')
            ORDER BY id
            "#,
        )
        .bind(op.master_ticket)
        .bind(&op.slave_name)
        .bind(op_type.as_str())
        .fetch_all(&mut *tx)
        .await?;

        let payload = serde_json::to_string(&op.payload)?;

        for entry in &live {
            let same_payload = serde_json::from_str::<OperationPayload>(&entry.payload)
                .map(|existing| existing == op.payload)
                .unwrap_or(false);
            match op_type {
                OperationType::Open | OperationType::Close => {
                    return Ok(EnqueueOutcome::Duplicate(entry.id));
                }
                _ if same_payload => return Ok(EnqueueOutcome::Duplicate(entry.id)),
                OperationType::Modify if entry.status == OperationStatus::Pending.as_str() => {
                    sqlx::query("UPDATE operation_queue SET payload = ? WHERE id = ? AND status = 'pending'")
                        .bind(&payload)
                        .bind(entry.id)
                        .execute(&mut *tx)
                        .await?;
                    tx.commit().await?;
                    return Ok(EnqueueOutcome::Refreshed(entry.id));
                }
                _ => {}
            }
        }

        let now = Utc::now();
        let id = sqlx::query(
            r#"
            INSERT INTO operation_queue
                (operation_type, master_ticket, slave_name, payload, attempts,
                 max_attempts, status, next_retry_at, created_at)
            VALUES (?, ?, ?, ?, 0, ?, 'pending', ?, ?)
            "#,
        )
        .bind(op_type.as_str())
        .bind(op.master_ticket)
        .bind(&op.slave_name)
        .bind(&payload)
        .bind(i64::from(op.max_attempts))
        .bind(now.timestamp_millis())
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        tx.commit().await?;
        Ok(EnqueueOutcome::Inserted(id))
    }

    /// Write an entry that is terminal from the start, so a failure decided
    /// at enqueue time is visible in the queue.
    pub async fn insert_failed(
        &self,
        conn: &mut SqliteConnection,
        op: &NewOperation,
        error: &str,
    ) -> Result<i64> {
        let now = Utc::now();
        let id = sqlx::query(
            r#"
            INSERT INTO operation_queue
                (operation_type, master_ticket, slave_name, payload, attempts,
                 max_attempts, status, error_message, next_retry_at, created_at, completed_at)
            VALUES (?, ?, ?, ?, 0, ?, 'failed', ?, ?, ?, ?)
            "#,
        )
        .bind(op.operation_type().as_str())
        .bind(op.master_ticket)
        .bind(&op.slave_name)
        .bind(serde_json::to_string(&op.payload)?)
        .bind(i64::from(op.max_attempts))
        .bind(error)
        .bind(now.timestamp_millis())
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();

        Ok(id)
    }

    // ==================== Claim ====================

    /// Atomically move the oldest claimable entry for `slave_name` to
    /// `processing`.
    ///
    /// An entry is claimable when it is pending, due, inside the drain
    /// fence (if any), and no earlier entry for the same pair is still
    /// live. A live `open` for the pair blocks every other operation on it
    /// regardless of id order.
    pub async fn claim_next(
        &self,
        slave_name: &str,
        now_ms: i64,
        fence: Option<i64>,
    ) -> Result<Option<QueuedOperation>> {
        let row = sqlx::query_as::<_, OperationRow>(
            r#"
            UPDATE operation_queue SET status = 'processing'
            WHERE id = (
                SELECT q.id FROM operation_queue q
                WHERE q.slave_name = ?1
                  AND q.status = 'pending'
                  AND q.next_retry_at <= ?2
                  AND (?3 IS NULL OR q.id <= ?3)
                  AND NOT EXISTS (
                      SELECT 1 FROM operation_queue e
                      WHERE e.slave_name = q.slave_name
                        AND e.master_ticket = q.master_ticket
                        AND e.id <> q.id
                        AND e.status IN ('pending', 'processing')
                        AND (e.id < q.id
                             OR (e.operation_type = 'open' AND q.operation_type <> 'open'))
                  )
                ORDER BY q.id
                LIMIT 1
            )
            AND status = 'pending'
            RETURNING id, operation_type, master_ticket, slave_name, payload, attempts,
                      max_attempts, status, error_message, next_retry_at, recovered,
                      created_at, completed_at
            "#,
        )
        .bind(slave_name)
        .bind(now_ms)
        .bind(fence)
        .fetch_optional(self.pool())
        .await?;

        row.map(QueuedOperation::try_from).transpose()
    }

    /// Return entries left in `processing` by an interrupted run to
    /// `pending`, flagged as recovered.
    pub async fn recover_interrupted(&self) -> Result<Vec<QueuedOperation>> {
        let rows = sqlx::query_as::<_, OperationRow>(
            r#"
            UPDATE operation_queue SET status = 'pending', recovered = 1
            WHERE status = 'processing'
            RETURNING id, operation_type, master_ticket, slave_name, payload, attempts,
                      max_attempts, status, error_message, next_retry_at, recovered,
                      created_at, completed_at
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        convert(rows)
    }

    // ==================== Reads ====================

    pub async fn get_operation(&self, id: i64) -> Result<Option<QueuedOperation>> {
        let row = sqlx::query_as::<_, OperationRow>(&format!("{} WHERE id = ?", SELECT_OPERATION))
            .bind(id)
            .fetch_optional(self.pool())
            .await?;

        row.map(QueuedOperation::try_from).transpose()
    }

    /// List entries, newest first.
    pub async fn list_operations(&self, filter: &OperationFilter) -> Result<Vec<QueuedOperation>> {
        let rows = sqlx::query_as::<_, OperationRow>(&format!(
            r#"{}
            WHERE (?1 IS NULL OR status = ?1)
              AND (?2 IS NULL OR slave_name = ?2)
              AND (?3 IS NULL OR master_ticket = ?3)
            ORDER BY id DESC
            LIMIT ?4"#,
            SELECT_OPERATION
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.slave_name.as_deref())
        .bind(filter.master_ticket)
        .bind(filter.limit.unwrap_or(-1))
        .fetch_all(self.pool())
        .await?;

        convert(rows)
    }

    /// Pending and processing entries for a slave, oldest first.
    pub async fn live_operations_for_slave(&self, slave_name: &str) -> Result<Vec<QueuedOperation>> {
        let rows = sqlx::query_as::<_, OperationRow>(&format!(
            "{} WHERE slave_name = ? AND status IN ('pending', 'processing') ORDER BY id",
            SELECT_OPERATION
        ))
        .bind(slave_name)
        .fetch_all(self.pool())
        .await?;

        convert(rows)
    }

    /// Pending and processing entries for a master ticket, oldest first.
    pub async fn live_operations_for_ticket(&self, master_ticket: i64) -> Result<Vec<QueuedOperation>> {
        let rows = sqlx::query_as::<_, OperationRow>(&format!(
            "{} WHERE master_ticket = ? AND status IN ('pending', 'processing') ORDER BY id",
            SELECT_OPERATION
        ))
        .bind(master_ticket)
        .fetch_all(self.pool())
        .await?;

        convert(rows)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let counts: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM operation_queue GROUP BY status")
                .fetch_all(self.pool())
                .await?;

        let mut stats = QueueStats::default();
        for (status, count) in counts {
            match status.parse::<OperationStatus>() {
                Ok(OperationStatus::Pending) => stats.pending = count,
                Ok(OperationStatus::Processing) => stats.processing = count,
                Ok(OperationStatus::Completed) => stats.completed = count,
                Ok(OperationStatus::Failed) => stats.failed = count,
                Err(_) => {}
            }
        }
        Ok(stats)
    }

    /// Highest id handed out so far; 0 on an empty queue.
    pub async fn max_operation_id(&self) -> Result<i64> {
        let (max,): (Option<i64>,) = sqlx::query_as("SELECT MAX(id) FROM operation_queue")
            .fetch_one(self.pool())
            .await?;
        Ok(max.unwrap_or(0))
    }

    /// Live entries of a slave with id at or below `fence`.
    pub async fn live_count_up_to(&self, slave_name: &str, fence: i64) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM operation_queue
            WHERE slave_name = ? AND id <= ? AND status IN ('pending', 'processing')
            "#,
        )
        .bind(slave_name)
        .bind(fence)
        .fetch_one(self.pool())
        .await?;
        Ok(count)
    }
}

// ==================== Settlement (inside a transaction) ====================

pub(crate) async fn complete_operation(conn: &mut SqliteConnection, id: i64) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE operation_queue SET status = 'completed', completed_at = ?, error_message = NULL
        WHERE id = ? AND status = 'processing'
        "#,
    )
    .bind(Utc::now())
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Back to pending with one more attempt counted.
pub(crate) async fn schedule_retry(
    conn: &mut SqliteConnection,
    id: i64,
    attempts: u32,
    next_retry_at: DateTime<Utc>,
    error: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE operation_queue
        SET status = 'pending', attempts = ?, next_retry_at = ?, error_message = ?
        WHERE id = ? AND status = 'processing'
        "#,
    )
    .bind(i64::from(attempts))
    .bind(next_retry_at.timestamp_millis())
    .bind(error)
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(crate) async fn fail_operation(
    conn: &mut SqliteConnection,
    id: i64,
    attempts: u32,
    error: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE operation_queue
        SET status = 'failed', attempts = ?, error_message = ?, completed_at = ?
        WHERE id = ? AND status = 'processing'
        "#,
    )
    .bind(i64::from(attempts))
    .bind(error)
    .bind(Utc::now())
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Fail the pending entries of a slave, optionally only those of one kind,
/// and return them as they were claimed.
pub(crate) async fn fail_pending(
    conn: &mut SqliteConnection,
    slave_name: &str,
    only: Option<OperationType>,
    reason: &str,
) -> Result<Vec<QueuedOperation>> {
    let rows = sqlx::query_as::<_, OperationRow>(
        r#"
        UPDATE operation_queue SET status = 'failed', error_message = ?1, completed_at = ?2
        WHERE slave_name = ?3 AND status = 'pending'
          AND (?4 IS NULL OR operation_type = ?4)
        RETURNING id, operation_type, master_ticket, slave_name, payload, attempts,
                  max_attempts, status, error_message, next_retry_at, recovered,
                  created_at, completed_at
        "#,
    )
    .bind(reason)
    .bind(Utc::now())
    .bind(slave_name)
    .bind(only.map(|kind| kind.as_str()))
    .fetch_all(&mut *conn)
    .await?;

    let mut failed = convert(rows)?;
    failed.sort_by_key(|op| op.id);
    Ok(failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Direction;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use tokio_test::assert_ok;

    fn open_op(ticket: i64, slave: &str) -> NewOperation {
        NewOperation {
            master_ticket: ticket,
            slave_name: slave.to_string(),
            payload: OperationPayload::Open {
                symbol: "EURUSD".to_string(),
                direction: Direction::Buy,
                volume: dec!(0.1),
                master_volume: dec!(0.1),
                stop_loss: Decimal::ZERO,
                take_profit: Decimal::ZERO,
                magic: 123456,
                slippage: 20,
                comment: format!("CT:{}", ticket),
                request_id: format!("req-{}", ticket),
                master_balance: None,
            },
            max_attempts: 3,
        }
    }

    fn close_op(ticket: i64, slave: &str) -> NewOperation {
        NewOperation {
            master_ticket: ticket,
            slave_name: slave.to_string(),
            payload: OperationPayload::Close {
                reason: "master closed".to_string(),
            },
            max_attempts: 3,
        }
    }

    fn modify_op(ticket: i64, slave: &str, sl: Decimal) -> NewOperation {
        NewOperation {
            master_ticket: ticket,
            slave_name: slave.to_string(),
            payload: OperationPayload::Modify {
                stop_loss: sl,
                take_profit: Decimal::ZERO,
            },
            max_attempts: 3,
        }
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis() + 1
    }

    #[tokio::test]
    async fn test_enqueue_deduplicates_live_entries() {
        let db = Database::in_memory().await.unwrap();

        let first = db.enqueue(&open_op(1, "s1")).await.unwrap();
        assert!(first.is_new());
        let again = db.enqueue(&open_op(1, "s1")).await.unwrap();
        assert_eq!(again, EnqueueOutcome::Duplicate(first.id()));

        // Other slave, other entry
        assert!(db.enqueue(&open_op(1, "s2")).await.unwrap().is_new());
        assert_eq!(db.queue_stats().await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn test_pending_modify_is_refreshed() {
        let db = Database::in_memory().await.unwrap();
        let first = db.enqueue(&modify_op(1, "s1", dec!(1.05))).await.unwrap();
        let second = db.enqueue(&modify_op(1, "s1", dec!(1.06))).await.unwrap();
        assert_eq!(second, EnqueueOutcome::Refreshed(first.id()));

        let entry = db.get_operation(first.id()).await.unwrap().unwrap();
        assert_eq!(
            entry.payload,
            OperationPayload::Modify {
                stop_loss: dec!(1.06),
                take_profit: Decimal::ZERO
            }
        );
    }

    #[tokio::test]
    async fn test_claim_respects_causal_order() {
        let db = Database::in_memory().await.unwrap();
        let open = db.enqueue(&open_op(1, "s1")).await.unwrap().id();
        let close = db.enqueue(&close_op(1, "s1")).await.unwrap().id();
        let other = db.enqueue(&open_op(2, "s1")).await.unwrap().id();

        let claimed = db.claim_next("s1", now_ms(), None).await.unwrap().unwrap();
        assert_eq!(claimed.id, open);
        assert_eq!(claimed.status, OperationStatus::Processing);

        // Close for ticket 1 waits on the open in flight; ticket 2 is free
        let claimed = db.claim_next("s1", now_ms(), None).await.unwrap().unwrap();
        assert_eq!(claimed.id, other);
        assert!(db.claim_next("s1", now_ms(), None).await.unwrap().is_none());

        let mut tx = db.begin().await.unwrap();
        complete_operation(&mut tx, open).await.unwrap();
        tx.commit().await.unwrap();

        let claimed = db.claim_next("s1", now_ms(), None).await.unwrap().unwrap();
        assert_eq!(claimed.id, close);
    }

    #[tokio::test]
    async fn test_claim_skips_entries_not_due_and_outside_fence() {
        let db = Database::in_memory().await.unwrap();
        let first = db.enqueue(&open_op(1, "s1")).await.unwrap().id();
        let second = db.enqueue(&open_op(2, "s1")).await.unwrap().id();

        let claimed = db.claim_next("s1", now_ms(), None).await.unwrap().unwrap();
        let mut tx = db.begin().await.unwrap();
        schedule_retry(&mut tx, claimed.id, 1, Utc::now() + chrono::Duration::hours(1), "requote")
            .await
            .unwrap();
        tx.commit().await.unwrap();

        // Ticket 1 is backing off; fence stops anything past `first`
        assert!(db.claim_next("s1", now_ms(), Some(first)).await.unwrap().is_none());
        let claimed = db.claim_next("s1", now_ms(), None).await.unwrap().unwrap();
        assert_eq!(claimed.id, second);

        let retried = db.get_operation(first).await.unwrap().unwrap();
        assert_eq!(retried.attempts, 1);
        assert_eq!(retried.status, OperationStatus::Pending);
        assert_eq!(retried.error_message.as_deref(), Some("requote"));
    }

    #[tokio::test]
    async fn test_recover_interrupted() {
        let db = Database::in_memory().await.unwrap();
        let id = db.enqueue(&open_op(1, "s1")).await.unwrap().id();
        db.claim_next("s1", now_ms(), None).await.unwrap().unwrap();

        let recovered = db.recover_interrupted().await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].id, id);
        assert!(recovered[0].recovered);
        assert_eq!(recovered[0].status, OperationStatus::Pending);
        assert!(db.recover_interrupted().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fail_pending_and_fence_counts() {
        let db = Database::in_memory().await.unwrap();
        db.enqueue(&open_op(1, "s1")).await.unwrap();
        db.enqueue(&open_op(2, "s1")).await.unwrap();
        let fence = db.max_operation_id().await.unwrap();
        db.enqueue(&open_op(3, "s2")).await.unwrap();

        assert_eq!(db.live_count_up_to("s1", fence).await.unwrap(), 2);
        let mut tx = db.begin().await.unwrap();
        let failed = fail_pending(&mut tx, "s1", None, "slave removed").await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(failed.iter().map(|op| op.master_ticket).collect::<Vec<_>>(), vec![1, 2]);
        assert!(failed.iter().all(|op| op.status == OperationStatus::Failed));
        assert_eq!(db.live_count_up_to("s1", fence).await.unwrap(), 0);

        let failed = db
            .list_operations(&OperationFilter {
                status: Some(OperationStatus::Failed),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(failed.len(), 2);
        assert!(failed.iter().all(|op| op.error_message.as_deref() == Some("slave removed")));
    }

    #[tokio::test]
    async fn test_fail_pending_of_one_kind() {
        let db = Database::in_memory().await.unwrap();
        db.enqueue(&open_op(1, "s1")).await.unwrap();
        db.enqueue(&close_op(2, "s1")).await.unwrap();
        db.enqueue(&open_op(3, "s1")).await.unwrap();
        let claimed = db.claim_next("s1", now_ms(), None).await.unwrap().unwrap();
        assert_eq!(claimed.master_ticket, 1);

        let mut tx = db.begin().await.unwrap();
        let failed = fail_pending(&mut tx, "s1", Some(OperationType::Open), "slave disabled")
            .await
            .unwrap();
        tx.commit().await.unwrap();

        // The in-flight open and the close are left alone
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].master_ticket, 3);
        let live = db.live_operations_for_slave("s1").await.unwrap();
        assert_eq!(live.len(), 2);
        assert_eq!(live[0].status, OperationStatus::Processing);
        assert_eq!(live[1].operation_type, OperationType::Close);
    }

    #[tokio::test]
    async fn test_insert_failed_is_terminal() {
        let db = Database::in_memory().await.unwrap();
        let mut tx = db.begin().await.unwrap();
        let id = db
            .insert_failed(&mut tx, &open_op(9, "s1"), "invalid ratio")
            .await
            .unwrap();
        assert_ok!(tx.commit().await);

        let entry = db.get_operation(id).await.unwrap().unwrap();
        assert_eq!(entry.status, OperationStatus::Failed);
        assert!(entry.completed_at.is_some());
        assert!(db.claim_next("s1", now_ms(), None).await.unwrap().is_none());
    }
}
