use async_trait::async_trait;
use rusqlite::{Connection, params};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::model::OutboundResult;

pub(crate) const CREATE_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS outbound_send_queue (
    reference_id     INTEGER PRIMARY KEY,
    recipient        TEXT,
    payload          TEXT,
    delivery_state   TEXT NOT NULL DEFAULT 'pending',
    api_status       INTEGER,
    response_content TEXT,
    completed_at     TEXT
);
"#;

// completed_at keeps its first value so re-applying a result is a no-op.
const APPLY_RESULT_SQL: &str = "UPDATE outbound_send_queue
    SET delivery_state = ?2,
        api_status = ?3,
        response_content = ?4,
        completed_at = COALESCE(completed_at, ?5)
  WHERE reference_id = ?1";

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("storage error")]
    Storage(#[from] rusqlite::Error),
    #[error("storage worker failed: {0}")]
    Worker(String),
}

/// Whether the keyed update found its send-queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Applied,
    Unmatched,
}

/// Applies one decoded result to durable storage.
///
/// Implementations must tolerate the same result being applied more than
/// once, and must not retry on their own.
#[async_trait]
pub trait ResultPersister: Send + Sync {
    async fn persist(&self, result: &OutboundResult) -> Result<PersistOutcome, PersistError>;
}

pub fn ensure_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(CREATE_TABLE_SQL)
}

/// Runs the keyed update on `conn`. Every value is bound as a parameter.
pub fn apply_result(
    conn: &Connection,
    result: &OutboundResult,
    completed_at: OffsetDateTime,
) -> Result<PersistOutcome, PersistError> {
    let completed_at = completed_at
        .format(&Rfc3339)
        .map_err(|err| PersistError::Worker(format!("format completion time: {err}")))?;
    let mut stmt = conn.prepare_cached(APPLY_RESULT_SQL)?;
    let changed = stmt.execute(params![
        result.reference_id(),
        result.delivery_state().as_str(),
        result.status(),
        result.response_content(),
        completed_at,
    ])?;
    Ok(if changed == 0 {
        PersistOutcome::Unmatched
    } else {
        PersistOutcome::Applied
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn conn_with_entry(reference_id: i64) -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        ensure_schema(&conn).unwrap();
        conn.execute(
            "INSERT INTO outbound_send_queue (reference_id, recipient) VALUES (?1, ?2)",
            params![reference_id, "+5511999990000"],
        )
        .unwrap();
        conn
    }

    type Row = (String, Option<i32>, Option<String>, Option<String>);

    fn row(conn: &Connection, reference_id: i64) -> Row {
        conn.query_row(
            "SELECT delivery_state, api_status, response_content, completed_at
               FROM outbound_send_queue WHERE reference_id = ?1",
            params![reference_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .unwrap()
    }

    #[test]
    fn applies_result_to_matching_entry() {
        let conn = conn_with_entry(101);
        let result = OutboundResult::new(101, 200, Some("ok".into()));
        let outcome = apply_result(&conn, &result, datetime!(2024-05-01 10:00 UTC)).unwrap();
        assert_eq!(outcome, PersistOutcome::Applied);
        assert_eq!(
            row(&conn, 101),
            (
                "delivered".to_string(),
                Some(200),
                Some("ok".to_string()),
                Some("2024-05-01T10:00:00Z".to_string())
            )
        );
    }

    #[test]
    fn unknown_reference_is_unmatched() {
        let conn = conn_with_entry(101);
        let result = OutboundResult::new(999, 500, None);
        let outcome = apply_result(&conn, &result, OffsetDateTime::now_utc()).unwrap();
        assert_eq!(outcome, PersistOutcome::Unmatched);
        assert_eq!(row(&conn, 101).0, "pending");
    }

    #[test]
    fn reapplying_leaves_row_unchanged() {
        let conn = conn_with_entry(7);
        let result = OutboundResult::new(7, 503, Some("{\"error\":\"busy\"}".into()));
        apply_result(&conn, &result, datetime!(2024-05-01 10:00 UTC)).unwrap();
        let first = row(&conn, 7);
        apply_result(&conn, &result, datetime!(2024-05-01 11:30 UTC)).unwrap();
        assert_eq!(row(&conn, 7), first);
        assert_eq!(first.0, "failed");
    }

    #[test]
    fn hostile_content_is_stored_verbatim() {
        let conn = conn_with_entry(3);
        let content = "'); DROP TABLE outbound_send_queue; --";
        let result = OutboundResult::new(3, 400, Some(content.into()));
        apply_result(&conn, &result, OffsetDateTime::now_utc()).unwrap();
        assert_eq!(row(&conn, 3).2.as_deref(), Some(content));
    }

    #[test]
    fn storage_error_leaves_cause_to_source() {
        let conn = Connection::open_in_memory().unwrap();
        let err = apply_result(
            &conn,
            &OutboundResult::new(1, 200, None),
            datetime!(2024-01-01 00:00 UTC),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "storage error");
        let cause = std::error::Error::source(&err).unwrap().to_string();
        assert!(cause.contains("no such table"), "{cause}");
    }
}
