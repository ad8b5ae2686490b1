use gsm_telemetry::{TelemetryLabels, record_counter};
use tracing::{debug, error, info, trace, warn};

use crate::decode::decode_result;
use crate::envelope::EnvelopeRecord;
use crate::persist::{PersistError, PersistOutcome, ResultPersister};

const PERSISTED_COUNTER: &str = "results_persisted_total";
const UNMATCHED_COUNTER: &str = "results_unmatched_total";
const SKIPPED_COUNTER: &str = "results_skipped_total";

/// Counters for a batch that ran to completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Results written, including the ones that matched no entry.
    pub persisted: usize,
    pub unmatched: usize,
    pub skipped_empty: usize,
    pub skipped_malformed: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("failed to open results storage")]
    Connect {
        #[source]
        source: PersistError,
    },
    #[error("failed to persist record {record_id} at position {index}")]
    Persist {
        record_id: String,
        index: usize,
        /// Records already written by this invocation before the failure.
        persisted: usize,
        #[source]
        source: PersistError,
    },
}

/// Drives one batch through decode then persist.
///
/// Undecodable records are logged and dropped; the first persistence failure
/// stops the batch so the whole delivery can be retried by the queue.
pub struct BatchProcessor<'a, P: ?Sized> {
    persister: &'a P,
    labels: TelemetryLabels,
}

impl<'a, P> BatchProcessor<'a, P>
where
    P: ResultPersister + ?Sized,
{
    pub fn new(persister: &'a P) -> Self {
        Self {
            persister,
            labels: TelemetryLabels::new("results"),
        }
    }

    pub fn with_labels(mut self, labels: TelemetryLabels) -> Self {
        self.labels = labels;
        self
    }

    pub async fn process(
        &self,
        records: Option<&[EnvelopeRecord]>,
    ) -> Result<BatchReport, BatchError> {
        let mut report = BatchReport::default();
        let Some(records) = records else {
            return Ok(report);
        };

        for (index, record) in records.iter().enumerate() {
            if record.is_blank() {
                trace!(record_id = %record.id(), "empty body, skipping");
                report.skipped_empty += 1;
                self.count_skip("empty");
                continue;
            }

            let result = match decode_result(record.body()) {
                Ok(result) => result,
                Err(err) => {
                    warn!(
                        record_id = %record.id(),
                        error = %err,
                        "could not decode delivery result, skipping record"
                    );
                    report.skipped_malformed += 1;
                    self.count_skip("malformed");
                    continue;
                }
            };

            match self.persister.persist(&result).await {
                Ok(PersistOutcome::Applied) => {
                    report.persisted += 1;
                    record_counter(PERSISTED_COUNTER, 1, &self.labels);
                    info!(
                        record_id = %record.id(),
                        reference_id = result.reference_id(),
                        status = result.status(),
                        "delivery result saved"
                    );
                }
                Ok(PersistOutcome::Unmatched) => {
                    report.persisted += 1;
                    report.unmatched += 1;
                    record_counter(PERSISTED_COUNTER, 1, &self.labels);
                    record_counter(UNMATCHED_COUNTER, 1, &self.labels);
                    debug!(
                        record_id = %record.id(),
                        reference_id = result.reference_id(),
                        "no send-queue entry for delivery result"
                    );
                }
                Err(source) => {
                    error!(
                        record_id = %record.id(),
                        reference_id = result.reference_id(),
                        error = %source,
                        "failed to persist delivery result, aborting batch"
                    );
                    return Err(BatchError::Persist {
                        record_id: record.id().to_string(),
                        index,
                        persisted: report.persisted,
                        source,
                    });
                }
            }
        }

        Ok(report)
    }

    fn count_skip(&self, reason: &str) {
        let mut labels = self.labels.clone();
        labels.extra.push(("reason".into(), reason.into()));
        record_counter(SKIPPED_COUNTER, 1, &labels);
    }
}
