use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::SqliteConnection;

use super::{parse_column, parse_decimal, Database};
use crate::error::{CopierError, Result};
use crate::models::{Direction, MappingStatus, PositionMapping, PositionStats};

#[derive(Debug, sqlx::FromRow)]
struct MappingRow {
    id: i64,
    master_ticket: i64,
    slave_name: String,
    slave_ticket: Option<i64>,
    symbol: String,
    master_volume: String,
    slave_volume: String,
    direction: String,
    status: String,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
}

impl TryFrom<MappingRow> for PositionMapping {
    type Error = CopierError;

    fn try_from(row: MappingRow) -> Result<Self> {
        Ok(PositionMapping {
            id: row.id,
            master_ticket: row.master_ticket,
            slave_name: row.slave_name,
            slave_ticket: row.slave_ticket,
            symbol: row.symbol,
            master_volume: parse_decimal("master_volume", &row.master_volume)?,
            slave_volume: parse_decimal("slave_volume", &row.slave_volume)?,
            direction: parse_column::<Direction>("direction", &row.direction)?,
            status: parse_column::<MappingStatus>("status", &row.status)?,
            last_error: row.last_error,
            created_at: row.created_at,
            closed_at: row.closed_at,
        })
    }
}

fn convert(rows: Vec<MappingRow>) -> Result<Vec<PositionMapping>> {
    rows.into_iter().map(PositionMapping::try_from).collect()
}

/// Fields of a mapping about to be written.
#[derive(Debug, Clone)]
pub struct NewMapping {
    pub master_ticket: i64,
    pub slave_name: String,
    pub slave_ticket: Option<i64>,
    pub symbol: String,
    pub master_volume: Decimal,
    pub slave_volume: Decimal,
    pub direction: Direction,
}

/// Filter for listing mappings.
#[derive(Debug, Clone, Default)]
pub struct MappingFilter {
    pub status: Option<MappingStatus>,
    pub slave_name: Option<String>,
    pub master_ticket: Option<i64>,
}

const SELECT_MAPPING: &str = r#"
    SELECT id, master_ticket, slave_name, slave_ticket, symbol, master_volume,
           slave_volume, direction, status, last_error, created_at, closed_at
    FROM position_mappings
"#;

impl Database {
    // ==================== Reads ====================

    pub async fn get_mapping(
        &self,
        master_ticket: i64,
        slave_name: &str,
    ) -> Result<Option<PositionMapping>> {
        let row = sqlx::query_as::<_, MappingRow>(&format!(
            "{} WHERE master_ticket = ? AND slave_name = ?",
            SELECT_MAPPING
        ))
        .bind(master_ticket)
        .bind(slave_name)
        .fetch_optional(self.pool())
        .await?;

        row.map(PositionMapping::try_from).transpose()
    }

    /// List mappings, newest first.
    pub async fn list_mappings(&self, filter: &MappingFilter) -> Result<Vec<PositionMapping>> {
        let rows = sqlx::query_as::<_, MappingRow>(&format!(
            r#"{}
            WHERE (?1 IS NULL OR status = ?1)
              AND (?2 IS NULL OR slave_name = ?2)
              AND (?3 IS NULL OR master_ticket = ?3)
            ORDER BY id DESC"#,
            SELECT_MAPPING
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.slave_name.as_deref())
        .bind(filter.master_ticket)
        .fetch_all(self.pool())
        .await?;

        convert(rows)
    }

    pub async fn mappings_for_master(&self, master_ticket: i64) -> Result<Vec<PositionMapping>> {
        self.list_mappings(&MappingFilter {
            master_ticket: Some(master_ticket),
            ..Default::default()
        })
        .await
    }

    pub async fn open_mappings_for_slave(&self, slave_name: &str) -> Result<Vec<PositionMapping>> {
        self.list_mappings(&MappingFilter {
            status: Some(MappingStatus::Open),
            slave_name: Some(slave_name.to_string()),
            ..Default::default()
        })
        .await
    }

    pub async fn open_mappings(&self) -> Result<Vec<PositionMapping>> {
        self.list_mappings(&MappingFilter {
            status: Some(MappingStatus::Open),
            ..Default::default()
        })
        .await
    }

    pub async fn position_stats(&self) -> Result<PositionStats> {
        let (total_master_positions,): (i64,) = sqlx::query_as(
            "SELECT COUNT(DISTINCT master_ticket) FROM position_mappings WHERE status = 'open'",
        )
        .fetch_one(self.pool())
        .await?;

        let (total_slave_positions,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM position_mappings WHERE status = 'open'")
                .fetch_one(self.pool())
                .await?;

        let positions_by_slave: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT slave_name, COUNT(*) FROM position_mappings
            WHERE status = 'open' GROUP BY slave_name ORDER BY slave_name
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        let positions_by_symbol: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT symbol, COUNT(*) FROM position_mappings
            WHERE status = 'open' GROUP BY symbol ORDER BY symbol
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        let mappings_by_status: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM position_mappings GROUP BY status ORDER BY status",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(PositionStats {
            total_master_positions,
            total_slave_positions,
            positions_by_slave,
            positions_by_symbol,
            mappings_by_status,
        })
    }
}

// ==================== Transactional writes ====================

/// Insert an open mapping. A second row for the same pair is a consistency error.
pub(crate) async fn insert_mapping(conn: &mut SqliteConnection, mapping: &NewMapping) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO position_mappings
            (master_ticket, slave_name, slave_ticket, symbol, master_volume,
             slave_volume, direction, status, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, 'open', ?)
        "#,
    )
    .bind(mapping.master_ticket)
    .bind(&mapping.slave_name)
    .bind(mapping.slave_ticket)
    .bind(&mapping.symbol)
    .bind(mapping.master_volume.to_string())
    .bind(mapping.slave_volume.to_string())
    .bind(mapping.direction.as_str())
    .bind(Utc::now())
    .execute(&mut *conn)
    .await;

    match result {
        Ok(done) => Ok(done.last_insert_rowid()),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(CopierError::Consistency(
            format!(
                "mapping for master {} on {} already exists",
                mapping.master_ticket, mapping.slave_name
            ),
        )),
        Err(e) => Err(e.into()),
    }
}

/// open -> closed. Returns false when the mapping was not open.
pub(crate) async fn close_mapping(
    conn: &mut SqliteConnection,
    master_ticket: i64,
    slave_name: &str,
) -> Result<bool> {
    let done = sqlx::query(
        r#"
        UPDATE position_mappings SET status = 'closed', closed_at = ?
        WHERE master_ticket = ? AND slave_name = ? AND status = 'open'
        "#,
    )
    .bind(Utc::now())
    .bind(master_ticket)
    .bind(slave_name)
    .execute(&mut *conn)
    .await?;

    Ok(done.rows_affected() > 0)
}

/// Record the volumes left after a partial close.
pub(crate) async fn reduce_mapping(
    conn: &mut SqliteConnection,
    master_ticket: i64,
    slave_name: &str,
    master_volume: Decimal,
    slave_volume: Decimal,
) -> Result<bool> {
    let done = sqlx::query(
        r#"
        UPDATE position_mappings SET master_volume = ?, slave_volume = ?
        WHERE master_ticket = ? AND slave_name = ? AND status = 'open'
        "#,
    )
    .bind(master_volume.to_string())
    .bind(slave_volume.to_string())
    .bind(master_ticket)
    .bind(slave_name)
    .execute(&mut *conn)
    .await?;

    Ok(done.rows_affected() > 0)
}

/// open -> error, or record an error row when the pair never had a mapping
/// (an open that failed before any order existed). Closed and error rows
/// are left untouched.
pub(crate) async fn mark_mapping_error(
    conn: &mut SqliteConnection,
    master_ticket: i64,
    slave_name: &str,
    error: &str,
    fallback: Option<&NewMapping>,
) -> Result<()> {
    let done = sqlx::query(
        r#"
        UPDATE position_mappings SET status = 'error', last_error = ?, closed_at = ?
        WHERE master_ticket = ? AND slave_name = ? AND status = 'open'
        "#,
    )
    .bind(error)
    .bind(Utc::now())
    .bind(master_ticket)
    .bind(slave_name)
    .execute(&mut *conn)
    .await?;

    if done.rows_affected() > 0 {
        return Ok(());
    }

    if let Some(mapping) = fallback {
        sqlx::query(
            r#"
            INSERT INTO position_mappings
                (master_ticket, slave_name, slave_ticket, symbol, master_volume,
                 slave_volume, direction, status, last_error, created_at, closed_at)
            VALUES (?, ?, NULL, ?, ?, ?, ?, 'error', ?, ?, ?)
            ON CONFLICT(master_ticket, slave_name) DO NOTHING
            "#,
        )
        .bind(mapping.master_ticket)
        .bind(&mapping.slave_name)
        .bind(&mapping.symbol)
        .bind(mapping.master_volume.to_string())
        .bind(mapping.slave_volume.to_string())
        .bind(mapping.direction.as_str())
        .bind(error)
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn new_mapping(master_ticket: i64, slave: &str) -> NewMapping {
        NewMapping {
            master_ticket,
            slave_name: slave.to_string(),
            slave_ticket: Some(master_ticket + 5000),
            symbol: "EURUSD".to_string(),
            master_volume: dec!(1.0),
            slave_volume: dec!(0.5),
            direction: Direction::Buy,
        }
    }

    #[tokio::test]
    async fn test_mapping_never_regresses() {
        let db = Database::in_memory().await.unwrap();
        let mut tx = db.begin().await.unwrap();
        insert_mapping(&mut tx, &new_mapping(1, "s1")).await.unwrap();
        assert!(close_mapping(&mut tx, 1, "s1").await.unwrap());
        tx.commit().await.unwrap();

        // Closed rows are history: no further transition applies
        let mut tx = db.begin().await.unwrap();
        assert!(!close_mapping(&mut tx, 1, "s1").await.unwrap());
        assert!(!reduce_mapping(&mut tx, 1, "s1", dec!(0.5), dec!(0.25)).await.unwrap());
        mark_mapping_error(&mut tx, 1, "s1", "late failure", Some(&new_mapping(1, "s1")))
            .await
            .unwrap();
        let err = insert_mapping(&mut tx, &new_mapping(1, "s1")).await.unwrap_err();
        assert!(matches!(err, CopierError::Consistency(_)));
        tx.commit().await.unwrap();

        let mapping = db.get_mapping(1, "s1").await.unwrap().unwrap();
        assert_eq!(mapping.status, MappingStatus::Closed);
        assert!(mapping.closed_at.is_some());
        assert_eq!(mapping.slave_volume, dec!(0.5));
    }

    #[tokio::test]
    async fn test_error_row_for_failed_open() {
        let db = Database::in_memory().await.unwrap();
        let mut tx = db.begin().await.unwrap();
        mark_mapping_error(&mut tx, 7, "s1", "no money", Some(&new_mapping(7, "s1")))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mapping = db.get_mapping(7, "s1").await.unwrap().unwrap();
        assert_eq!(mapping.status, MappingStatus::Error);
        assert_eq!(mapping.slave_ticket, None);
        assert_eq!(mapping.last_error.as_deref(), Some("no money"));
    }

    #[tokio::test]
    async fn test_stats_and_filters() {
        let db = Database::in_memory().await.unwrap();
        let mut tx = db.begin().await.unwrap();
        insert_mapping(&mut tx, &new_mapping(1, "s1")).await.unwrap();
        insert_mapping(&mut tx, &new_mapping(1, "s2")).await.unwrap();
        let mut gold = new_mapping(2, "s1");
        gold.symbol = "XAUUSD".to_string();
        insert_mapping(&mut tx, &gold).await.unwrap();
        close_mapping(&mut tx, 2, "s1").await.unwrap();
        tx.commit().await.unwrap();

        let stats = db.position_stats().await.unwrap();
        assert_eq!(stats.total_master_positions, 1);
        assert_eq!(stats.total_slave_positions, 2);
        assert_eq!(
            stats.positions_by_slave,
            vec![("s1".to_string(), 1), ("s2".to_string(), 1)]
        );
        assert_eq!(stats.positions_by_symbol, vec![("EURUSD".to_string(), 2)]);

        assert_eq!(db.open_mappings_for_slave("s1").await.unwrap().len(), 1);
        assert_eq!(db.mappings_for_master(1).await.unwrap().len(), 2);
        let closed = db
            .list_mappings(&MappingFilter {
                status: Some(MappingStatus::Closed),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].symbol, "XAUUSD");
    }
}
