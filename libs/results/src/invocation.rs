use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::Connection;
use time::OffsetDateTime;
use tokio::task::spawn_blocking;
use tracing::{error, instrument, warn};

use crate::batch::{BatchError, BatchProcessor, BatchReport};
use crate::config::StorageConfig;
use crate::envelope::EnvelopeRecord;
use crate::model::OutboundResult;
use crate::persist::{PersistError, PersistOutcome, ResultPersister, apply_result, ensure_schema};

/// A single SQLite connection, used from Tokio's blocking pool.
pub struct StorageConnection {
    conn: Arc<Mutex<Connection>>,
}

impl StorageConnection {
    pub async fn open(config: &StorageConfig) -> Result<Self, PersistError> {
        let config = config.clone();
        let conn = spawn_blocking(move || -> Result<Connection, PersistError> {
            let conn = Connection::open(&config.connection_string)?;
            conn.busy_timeout(config.busy_timeout)?;
            if config.ensure_schema {
                ensure_schema(&conn)?;
            }
            Ok(conn)
        })
        .await
        .map_err(|err| PersistError::Worker(err.to_string()))??;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn with_conn<F, T>(&self, func: F) -> Result<T, PersistError>
    where
        F: FnOnce(&Connection) -> Result<T, PersistError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| PersistError::Worker("storage connection lock poisoned".into()))?;
            func(&guard)
        })
        .await
        .map_err(|err| PersistError::Worker(err.to_string()))?
    }

    /// Closes the connection, surfacing errors that a plain drop would hide.
    pub async fn close(self) -> Result<(), PersistError> {
        let conn = Arc::try_unwrap(self.conn)
            .map_err(|_| PersistError::Worker("storage connection still in use".into()))?
            .into_inner()
            .map_err(|_| PersistError::Worker("storage connection lock poisoned".into()))?;
        spawn_blocking(move || conn.close().map_err(|(_, err)| PersistError::Storage(err)))
            .await
            .map_err(|err| PersistError::Worker(err.to_string()))?
    }
}

#[async_trait]
impl ResultPersister for StorageConnection {
    async fn persist(&self, result: &OutboundResult) -> Result<PersistOutcome, PersistError> {
        let result = result.clone();
        self.with_conn(move |conn| apply_result(conn, &result, OffsetDateTime::now_utc()))
            .await
    }
}

/// Owns the storage connection for one batch.
///
/// Dropping an invocation releases its connection; [`Invocation::close`] does
/// the same but logs close failures.
pub struct Invocation {
    connection: StorageConnection,
}

impl Invocation {
    pub async fn open(config: &StorageConfig) -> Result<Self, BatchError> {
        let connection = StorageConnection::open(config).await.map_err(|source| {
            error!(error = %source, "could not open results storage");
            BatchError::Connect { source }
        })?;
        Ok(Self { connection })
    }

    pub fn connection(&self) -> &StorageConnection {
        &self.connection
    }

    pub async fn run(
        &self,
        records: Option<&[EnvelopeRecord]>,
    ) -> Result<BatchReport, BatchError> {
        BatchProcessor::new(&self.connection).process(records).await
    }

    pub async fn close(self) {
        if let Err(err) = self.connection.close().await {
            warn!(error = %err, "failed to close results storage");
        }
    }
}

/// Saves one batch of delivery results: open storage, process, release.
///
/// `Ok` means every record was consumed; `Err` means the batch must be
/// handed back to the queue.
#[instrument(
    name = "results.invocation",
    skip_all,
    fields(batch = records.map_or(0, |records| records.len()))
)]
pub async fn handle_batch(
    config: &StorageConfig,
    records: Option<&[EnvelopeRecord]>,
) -> Result<BatchReport, BatchError> {
    if records.is_none() {
        return Ok(BatchReport::default());
    }
    let invocation = Invocation::open(config).await?;
    let outcome = invocation.run(records).await;
    invocation.close().await;
    outcome
}
