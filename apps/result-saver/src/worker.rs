use std::error::Error as StdError;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_nats::jetstream::{
    self, AckKind, Message,
    consumer::{AckPolicy, PullConsumer, pull::Config as PullConfig},
    stream::{Config as StreamConfig, RetentionPolicy},
};
use futures::StreamExt;
use gsm_dlq::{DlqError, DlqPublisher};
use gsm_results::{BatchError, BatchReport, EnvelopeRecord, StorageConfig, handle_batch};
use gsm_telemetry::{TelemetryLabels, record_counter, record_histogram};
use tracing::{debug, error, info, warn};

use crate::ack::{AckDecision, plan_acks};
use crate::config::SaverConfig;

pub const STAGE: &str = "results";
const MSG_ID_HEADER: &str = "Nats-Msg-Id";
const BATCH_FAILED_COUNTER: &str = "results_batch_failed_total";
const INVOCATION_LATENCY_HISTOGRAM: &str = "results_invocation_ms";

#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error("invocation timed out after {0:?}")]
    TimedOut(Duration),
}

impl InvocationError {
    pub fn code(&self) -> &'static str {
        match self {
            InvocationError::Batch(BatchError::Connect { .. }) => "E_CONNECT",
            InvocationError::Batch(BatchError::Persist { .. }) => "E_PERSIST",
            InvocationError::TimedOut(_) => "E_TIMEOUT",
        }
    }
}

/// Runs one invocation under `timeout`. Expiry counts as a failed batch.
///
/// A timed-out invocation may still finish the write it had in flight, since
/// the blocking storage task is not cancelled; its connection is released once
/// that write returns. Re-applying a result is idempotent, so the redelivered
/// batch ends in the same state.
pub async fn invoke(
    storage: &StorageConfig,
    records: &[EnvelopeRecord],
    timeout: Duration,
) -> Result<BatchReport, InvocationError> {
    match tokio::time::timeout(timeout, handle_batch(storage, Some(records))).await {
        Ok(outcome) => Ok(outcome?),
        Err(_) => Err(InvocationError::TimedOut(timeout)),
    }
}

/// Log-friendly id: the producer's `Nats-Msg-Id` when present, else the stream sequence.
pub fn record_id(msg_id: Option<&str>, stream_sequence: Option<u64>) -> String {
    match (msg_id.filter(|id| !id.is_empty()), stream_sequence) {
        (Some(id), _) => id.to_string(),
        (None, Some(seq)) => format!("seq-{seq}"),
        (None, None) => "unknown".to_string(),
    }
}

pub fn envelope_from_message(msg: &Message) -> EnvelopeRecord {
    let msg_id = msg
        .headers
        .as_ref()
        .and_then(|headers| headers.get(MSG_ID_HEADER))
        .map(|value| value.as_str());
    let sequence = msg.info().ok().map(|info| info.stream_sequence);
    EnvelopeRecord::new(record_id(msg_id, sequence), msg.payload.clone())
}

/// Full error chain on one line.
pub fn describe(err: &dyn StdError) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

pub struct ResultSaver {
    config: SaverConfig,
    consumer: PullConsumer,
    dlq: DlqPublisher,
    labels: TelemetryLabels,
}

impl ResultSaver {
    /// Connects to NATS and makes sure the stream and durable consumer exist.
    pub async fn connect(config: SaverConfig) -> Result<Self> {
        let client = async_nats::connect(&config.nats_url)
            .await
            .with_context(|| format!("connect to {}", config.nats_url))?;
        let js = jetstream::new(client.clone());

        let stream = js
            .get_or_create_stream(StreamConfig {
                name: config.stream.clone(),
                subjects: vec![config.subject.clone()],
                retention: RetentionPolicy::WorkQueue,
                max_messages: -1,
                max_messages_per_subject: -1,
                max_bytes: -1,
                ..Default::default()
            })
            .await
            .with_context(|| format!("ensure stream {}", config.stream))?;

        let consumer = stream
            .get_or_create_consumer(
                &config.consumer,
                PullConfig {
                    durable_name: Some(config.consumer.clone()),
                    filter_subject: config.subject.clone(),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: config.ack_wait,
                    max_deliver: config.consumer_max_deliver(),
                    ..Default::default()
                },
            )
            .await
            .with_context(|| format!("ensure consumer {}", config.consumer))?;

        let dlq = DlqPublisher::new(STAGE, client, config.dlq.clone()).await?;
        let labels = TelemetryLabels::new(STAGE).with_stream(config.stream.clone());

        info!(
            stream = %config.stream,
            subject = %config.subject,
            consumer = %config.consumer,
            batch_size = config.batch_size,
            max_deliver = config.max_deliver,
            dlq = dlq.enabled(),
            "result saver listening for delivery results"
        );

        Ok(Self {
            config,
            consumer,
            dlq,
            labels,
        })
    }

    /// Processes batches until a shutdown signal arrives.
    ///
    /// A batch that is already being processed is always finished and settled.
    pub async fn run(&self) -> Result<()> {
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested, stopping result saver");
                    break;
                }
                fetched = self.fetch_batch() => match fetched {
                    Ok(messages) if messages.is_empty() => {
                        debug!("no delivery results waiting");
                    }
                    Ok(messages) => self.handle_messages(messages).await,
                    Err(err) => {
                        warn!(error = %err, "failed to fetch delivery results");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
            }
        }

        Ok(())
    }

    async fn fetch_batch(&self) -> Result<Vec<Message>> {
        let mut messages = self
            .consumer
            .fetch()
            .max_messages(self.config.batch_size)
            .expires(self.config.max_wait)
            .messages()
            .await
            .context("fetch delivery results")?;

        let mut batch = Vec::new();
        while let Some(result) = messages.next().await {
            match result {
                Ok(msg) => batch.push(msg),
                Err(err) => warn!(error = %err, "error receiving message from batch"),
            }
        }
        Ok(batch)
    }

    async fn handle_messages(&self, messages: Vec<Message>) {
        let records: Vec<EnvelopeRecord> = messages.iter().map(envelope_from_message).collect();
        let deliveries: Vec<u64> = messages
            .iter()
            .map(|msg| {
                msg.info()
                    .map(|info| u64::try_from(info.delivered).unwrap_or(1))
                    .unwrap_or(1)
            })
            .collect();

        let started = Instant::now();
        let outcome = invoke(
            &self.config.storage,
            &records,
            self.config.invocation_timeout,
        )
        .await;
        record_histogram(
            INVOCATION_LATENCY_HISTOGRAM,
            started.elapsed().as_secs_f64() * 1000.0,
            &self.labels,
        );

        match &outcome {
            Ok(report) => info!(
                batch = records.len(),
                persisted = report.persisted,
                unmatched = report.unmatched,
                skipped_empty = report.skipped_empty,
                skipped_malformed = report.skipped_malformed,
                "delivery result batch saved"
            ),
            Err(err) => {
                record_counter(BATCH_FAILED_COUNTER, 1, &self.labels);
                error!(
                    batch = records.len(),
                    code = err.code(),
                    error = %describe(err),
                    "delivery result batch failed, returning it to the queue"
                );
            }
        }

        let failure = outcome.as_ref().err();
        let plan = plan_acks(
            failure.is_none(),
            &deliveries,
            self.config.max_deliver,
            self.dlq.enabled(),
        );
        for (((msg, record), delivered), decision) in
            messages.iter().zip(&records).zip(&deliveries).zip(plan)
        {
            self.settle(msg, record, *delivered, decision, failure)
                .await;
        }
    }

    async fn settle(
        &self,
        msg: &Message,
        record: &EnvelopeRecord,
        delivered: u64,
        decision: AckDecision,
        failure: Option<&InvocationError>,
    ) {
        let kind = match decision {
            AckDecision::Ack => AckKind::Ack,
            AckDecision::Nak => AckKind::Nak(None),
            AckDecision::DeadLetter => {
                let error = DlqError {
                    code: failure.map_or("E_UNKNOWN", InvocationError::code).to_string(),
                    message: failure.map(|err| describe(err)).unwrap_or_default(),
                    stage: None,
                };
                match self
                    .dlq
                    .publish(&self.config.stream, record.id(), delivered, error, record.body())
                    .await
                {
                    Ok(()) => AckKind::Term,
                    Err(err) => {
                        error!(
                            record_id = %record.id(),
                            error = %err,
                            "failed to dead-letter exhausted delivery result"
                        );
                        AckKind::Nak(None)
                    }
                }
            }
        };

        if let Err(err) = msg.ack_with(kind).await {
            warn!(
                record_id = %record.id(),
                decision = ?decision,
                error = %err,
                "failed to settle delivery result message"
            );
        }
    }
}

pub async fn run(config: SaverConfig) -> Result<()> {
    ResultSaver::connect(config).await?.run().await
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGTERM, only Ctrl-C will stop the worker");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_id_prefers_message_id() {
        assert_eq!(record_id(Some("wamid.HBgL"), Some(42)), "wamid.HBgL");
        assert_eq!(record_id(Some(""), Some(42)), "seq-42");
        assert_eq!(record_id(None, Some(7)), "seq-7");
        assert_eq!(record_id(None, None), "unknown");
    }

    #[test]
    fn describe_walks_the_source_chain() {
        let err = InvocationError::Batch(BatchError::Persist {
            record_id: "seq-3".into(),
            index: 2,
            persisted: 2,
            source: gsm_results::PersistError::Worker("disk I/O error".into()),
        });
        assert_eq!(
            describe(&err),
            "failed to persist record seq-3 at position 2: storage worker failed: disk I/O error"
        );
        assert_eq!(err.code(), "E_PERSIST");
    }

    #[test]
    fn describe_prints_storage_cause_once() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let cause = conn
            .execute("UPDATE missing_table SET x = 1", [])
            .unwrap_err();
        let err = InvocationError::Batch(BatchError::Persist {
            record_id: "seq-1".into(),
            index: 0,
            persisted: 0,
            source: gsm_results::PersistError::Storage(cause),
        });
        let text = describe(&err);
        assert_eq!(
            text,
            "failed to persist record seq-1 at position 0: storage error: no such table: missing_table"
        );
        assert_eq!(text.matches("no such table").count(), 1);
    }

    #[test]
    fn timeout_has_its_own_code() {
        let err = InvocationError::TimedOut(Duration::from_secs(25));
        assert_eq!(err.code(), "E_TIMEOUT");
        assert_eq!(describe(&err), "invocation timed out after 25s");
    }
}
