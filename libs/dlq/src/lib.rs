//! Dead-letter handling for messages a worker gave up on.
//!
//! Entries are kept in a dedicated JetStream stream so operators can list,
//! inspect and replay them.
//!
//! ```no_run
//! use gsm_dlq::{DlqError, DlqPublisher, DlqSettings};
//!
//! # fn main() -> anyhow::Result<()> {
//! # let rt = tokio::runtime::Runtime::new()?;
//! rt.block_on(async {
//!     let client = async_nats::connect("nats://127.0.0.1:4222").await?;
//!     let dlq = DlqPublisher::new("results", client, DlqSettings::default()).await?;
//!     dlq.publish(
//!         "outbound-results",
//!         "42",
//!         5,
//!         DlqError {
//!             code: "E_PERSIST".into(),
//!             message: "database is locked".into(),
//!             stage: None,
//!         },
//!         br#"{"referenceId": 101, "status": 200}"#,
//!     )
//!     .await?;
//!     anyhow::Ok(())
//! })
//! # }
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use base64::{Engine, engine::general_purpose::STANDARD};
use async_nats::{
    Client,
    jetstream::{
        Context as JsContext,
        consumer::{AckPolicy, DeliverPolicy, pull::Config as PullConfig},
        stream::{Config as StreamConfig, RetentionPolicy, Stream},
    },
};
use futures::TryStreamExt;
use gsm_telemetry::{TelemetryLabels, record_counter};
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::{info, warn};

pub const DEFAULT_DLQ_SUBJECT_FMT: &str = "dlq.{stage}.{stream}";
const DLQ_STREAM_NAME: &str = "DLQ";
const DLQ_MAX_AGE: Duration = Duration::from_secs(14 * 24 * 60 * 60);
const DLQ_COUNTER: &str = "results_dead_lettered_total";

/// Where and whether dead-letter entries are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlqSettings {
    pub enabled: bool,
    pub subject_fmt: String,
}

impl Default for DlqSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            subject_fmt: DEFAULT_DLQ_SUBJECT_FMT.to_string(),
        }
    }
}

impl DlqSettings {
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let enabled = lookup("DLQ_ENABLED")
            .map(|v| !matches!(v.to_lowercase().as_str(), "0" | "false" | "no" | "off"))
            .unwrap_or(true);
        let subject_fmt =
            lookup("DLQ_SUBJECT_FMT").unwrap_or_else(|| DEFAULT_DLQ_SUBJECT_FMT.to_string());
        Self {
            enabled,
            subject_fmt,
        }
    }
}

/// Error metadata stored alongside each entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqError {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub stage: Option<String>,
}

/// Payload stored for each dead-lettered message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqRecord {
    pub stage: String,
    pub stream: String,
    pub msg_id: String,
    pub deliveries: u64,
    pub ts: String,
    pub error: DlqError,
    /// Readable view of the body, see [`body_value`]. Not used for replay.
    pub body: Value,
    /// Exact bytes of the original body.
    pub raw: RawBody,
}

/// Original message bytes: text when they are UTF-8, base64 otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "encoding", content = "data", rename_all = "lowercase")]
pub enum RawBody {
    Utf8(String),
    Base64(String),
}

impl RawBody {
    pub fn from_bytes(body: &[u8]) -> Self {
        match std::str::from_utf8(body) {
            Ok(text) => RawBody::Utf8(text.to_string()),
            Err(_) => RawBody::Base64(STANDARD.encode(body)),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            RawBody::Utf8(text) => Ok(text.clone().into_bytes()),
            RawBody::Base64(encoded) => STANDARD
                .decode(encoded)
                .context("decode base64 dlq body"),
        }
    }
}

impl DlqRecord {
    pub fn new(
        stage: &str,
        stream: &str,
        msg_id: &str,
        deliveries: u64,
        error: DlqError,
        body: &[u8],
        at: OffsetDateTime,
    ) -> Self {
        Self {
            stage: stage.to_string(),
            stream: stream.to_string(),
            msg_id: msg_id.to_string(),
            deliveries,
            ts: at
                .format(&Rfc3339)
                .unwrap_or_else(|_| "1970-01-01T00:00:00Z".into()),
            error: DlqError {
                stage: Some(stage.to_string()),
                ..error
            },
            body: body_value(body),
            raw: RawBody::from_bytes(body),
        }
    }

    /// Bytes to put back on the source subject when replaying.
    pub fn replay_payload(&self) -> Result<Vec<u8>> {
        self.raw.to_bytes()
    }
}

/// Objects and arrays are kept as JSON; anything else is stored as text.
pub fn body_value(body: &[u8]) -> Value {
    match serde_json::from_slice::<Value>(body) {
        Ok(value @ (Value::Object(_) | Value::Array(_))) => value,
        _ => Value::String(String::from_utf8_lossy(body).into_owned()),
    }
}

#[derive(Clone)]
pub struct DlqPublisher {
    js: JsContext,
    stage: String,
    settings: DlqSettings,
}

impl DlqPublisher {
    pub async fn new(stage: &str, client: Client, settings: DlqSettings) -> Result<Self> {
        let js = async_nats::jetstream::new(client);
        if settings.enabled {
            ensure_stream(&js, &settings.subject_fmt).await?;
        }
        Ok(Self {
            js,
            stage: stage.to_string(),
            settings,
        })
    }

    pub fn enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Stores one message in the DLQ stream and waits for the server ack.
    pub async fn publish(
        &self,
        stream: &str,
        msg_id: &str,
        deliveries: u64,
        error: DlqError,
        body: &[u8],
    ) -> Result<()> {
        if !self.settings.enabled {
            return Ok(());
        }

        let subject = format_subject(&self.settings.subject_fmt, &self.stage, stream);
        let record = DlqRecord::new(
            &self.stage,
            stream,
            msg_id,
            deliveries,
            error,
            body,
            OffsetDateTime::now_utc(),
        );
        let payload = serde_json::to_vec(&record)?;
        self.js
            .publish(subject.clone(), payload.into())
            .await
            .with_context(|| format!("publish DLQ entry to {subject}"))?
            .await
            .with_context(|| format!("confirm DLQ entry on {subject}"))?;

        let mut labels = TelemetryLabels::new(self.stage.clone()).with_stream(stream);
        labels
            .extra
            .push(("code".into(), record.error.code.clone()));
        record_counter(DLQ_COUNTER, 1, &labels);
        info!(
            stage = %record.stage,
            stream = %record.stream,
            msg_id = %record.msg_id,
            deliveries = record.deliveries,
            code = %record.error.code,
            "dlq entry published"
        );
        Ok(())
    }
}

async fn ensure_stream(js: &JsContext, subject_fmt: &str) -> Result<Stream> {
    let pattern = subject_fmt
        .replace("{stage}", "*")
        .replace("{stream}", "*");
    let cfg = StreamConfig {
        name: DLQ_STREAM_NAME.into(),
        subjects: vec![pattern],
        retention: RetentionPolicy::Limits,
        max_age: DLQ_MAX_AGE,
        max_messages_per_subject: -1,
        max_messages: -1,
        max_bytes: -1,
        allow_direct: true,
        description: Some("Greentic DLQ".into()),
        ..StreamConfig::default()
    };
    js.get_or_create_stream(cfg)
        .await
        .context("ensure DLQ stream")
}

/// Expands `{stage}` and `{stream}` in `fmt`. Unknown placeholders expand to nothing.
pub fn format_subject(fmt: &str, stage: &str, stream: &str) -> String {
    let mut out = String::new();
    let mut chars = fmt.chars();
    while let Some(ch) = chars.next() {
        if ch != '{' {
            out.push(ch);
            continue;
        }
        let key: String = chars.by_ref().take_while(|c| *c != '}').collect();
        match key.as_str() {
            "stage" => out.push_str(stage),
            "stream" => out.push_str(stream),
            _ => {}
        }
    }
    out
}

/// An entry read back from the DLQ stream.
#[derive(Debug, Clone)]
pub struct DlqEntry {
    pub record: DlqRecord,
    pub sequence: u64,
}

async fn read_entries(
    client: &Client,
    settings: &DlqSettings,
    stage: &str,
    stream: &str,
    limit: usize,
) -> Result<(Stream, Vec<DlqEntry>)> {
    let js = async_nats::jetstream::new(client.clone());
    let dlq = ensure_stream(&js, &settings.subject_fmt).await?;
    let filter_subject = format_subject(&settings.subject_fmt, stage, stream);
    let consumer = dlq
        .create_consumer(PullConfig {
            name: Some(format!("dlq-read-{stage}-{rand}", rand = nanoid!(6))),
            deliver_policy: DeliverPolicy::All,
            ack_policy: AckPolicy::None,
            filter_subject,
            inactive_threshold: Duration::from_secs(30),
            ..Default::default()
        })
        .await
        .context("create DLQ reader")?;
    let mut messages = consumer
        .fetch()
        .max_messages(limit)
        .messages()
        .await
        .context("fetch DLQ entries")?;

    let mut out = Vec::new();
    while let Some(msg) = messages.try_next().await.map_err(|e| anyhow::anyhow!(e))? {
        let sequence = msg.info().map(|info| info.stream_sequence).unwrap_or(0);
        match serde_json::from_slice::<DlqRecord>(&msg.payload) {
            Ok(record) => out.push(DlqEntry { record, sequence }),
            Err(err) => warn!(sequence, error = %err, "skipping unreadable dlq entry"),
        }
    }
    Ok((dlq, out))
}

pub async fn list_entries(
    client: &Client,
    settings: &DlqSettings,
    stage: &str,
    stream: &str,
    limit: usize,
) -> Result<Vec<DlqEntry>> {
    let (_, entries) = read_entries(client, settings, stage, stream, limit).await?;
    Ok(entries)
}

pub async fn get_entry(client: &Client, sequence: u64) -> Result<Option<DlqEntry>> {
    let js = async_nats::jetstream::new(client.clone());
    let Ok(stream) = js.get_stream(DLQ_STREAM_NAME).await else {
        return Ok(None);
    };
    match stream.direct_get(sequence).await {
        Ok(message) => Ok(serde_json::from_slice::<DlqRecord>(&message.payload)
            .ok()
            .map(|record| DlqEntry { sequence, record })),
        Err(err) => {
            warn!(sequence, error = %err, "failed to fetch dlq message");
            Ok(None)
        }
    }
}

/// Republishes the original body to `target_subject`.
pub async fn replay_entry(client: &Client, entry: &DlqEntry, target_subject: &str) -> Result<()> {
    let js = async_nats::jetstream::new(client.clone());
    js.publish(target_subject.to_string(), entry.record.replay_payload()?.into())
        .await
        .with_context(|| format!("replay publish to {target_subject}"))?
        .await
        .with_context(|| format!("confirm replay on {target_subject}"))?;
    Ok(())
}

/// Replays up to `limit` entries and removes each one once it is back on `target_subject`.
pub async fn replay_entries(
    client: &Client,
    settings: &DlqSettings,
    stage: &str,
    stream: &str,
    target_subject: &str,
    limit: usize,
) -> Result<Vec<DlqEntry>> {
    let (dlq, entries) = read_entries(client, settings, stage, stream, limit).await?;
    let mut processed = Vec::with_capacity(entries.len());
    for entry in entries {
        replay_entry(client, &entry, target_subject).await?;
        dlq.delete_message(entry.sequence)
            .await
            .map_err(|e| anyhow::anyhow!(e))
            .with_context(|| format!("remove replayed dlq entry {}", entry.sequence))?;
        processed.push(entry);
    }
    Ok(processed)
}
