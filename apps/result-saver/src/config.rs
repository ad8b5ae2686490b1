use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use gsm_dlq::DlqSettings;
use gsm_results::StorageConfig;

const DEFAULT_NATS_URL: &str = "nats://127.0.0.1:4222";
const DEFAULT_STREAM: &str = "outbound-results";
const DEFAULT_SUBJECT: &str = "greentic.messaging.results.>";
const DEFAULT_CONSUMER: &str = "result-saver";

#[derive(Debug, Clone)]
pub struct SaverConfig {
    pub storage: StorageConfig,
    pub nats_url: String,
    pub stream: String,
    pub subject: String,
    pub consumer: String,
    /// Upper bound on messages handed to one invocation.
    pub batch_size: usize,
    pub max_wait: Duration,
    /// Deliveries before a message is dead-lettered. 0 disables the limit.
    pub max_deliver: u64,
    pub ack_wait: Duration,
    pub invocation_timeout: Duration,
    pub dlq: DlqSettings,
}

impl SaverConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let connection_string = lookup("RESULTS_DB_URL")
            .filter(|v| !v.trim().is_empty())
            .context("RESULTS_DB_URL must point at the send-queue database")?;
        let storage = StorageConfig::new(connection_string)
            .with_ensure_schema(parse_bool(&lookup, "RESULTS_DB_ENSURE_SCHEMA")?.unwrap_or(false))
            .with_busy_timeout(Duration::from_millis(
                parse(&lookup, "RESULTS_DB_BUSY_TIMEOUT_MS")?.unwrap_or(5_000),
            ));

        let batch_size = parse(&lookup, "RESULTS_BATCH_SIZE")?.unwrap_or(10);
        if batch_size == 0 {
            bail!("RESULTS_BATCH_SIZE must be at least 1");
        }
        let ack_wait = Duration::from_secs(parse(&lookup, "RESULTS_ACK_WAIT_SECS")?.unwrap_or(30));
        let invocation_timeout =
            Duration::from_secs(parse(&lookup, "RESULTS_INVOCATION_TIMEOUT_SECS")?.unwrap_or(25));
        if invocation_timeout >= ack_wait {
            bail!(
                "RESULTS_INVOCATION_TIMEOUT_SECS ({}) must be shorter than RESULTS_ACK_WAIT_SECS ({})",
                invocation_timeout.as_secs(),
                ack_wait.as_secs()
            );
        }

        Ok(Self {
            storage,
            nats_url: lookup("NATS_URL").unwrap_or_else(|| DEFAULT_NATS_URL.into()),
            stream: lookup("RESULTS_STREAM").unwrap_or_else(|| DEFAULT_STREAM.into()),
            subject: lookup("RESULTS_SUBJECT").unwrap_or_else(|| DEFAULT_SUBJECT.into()),
            consumer: lookup("RESULTS_CONSUMER").unwrap_or_else(|| DEFAULT_CONSUMER.into()),
            batch_size,
            max_wait: Duration::from_secs(parse(&lookup, "RESULTS_MAX_WAIT_SECS")?.unwrap_or(5)),
            max_deliver: parse(&lookup, "RESULTS_MAX_DELIVER")?.unwrap_or(5),
            ack_wait,
            invocation_timeout,
            dlq: DlqSettings::from_lookup(&lookup),
        })
    }

    /// Value for the consumer's `max_deliver`; JetStream uses -1 for unlimited.
    pub fn consumer_max_deliver(&self) -> i64 {
        match self.max_deliver {
            0 => -1,
            n => i64::try_from(n).unwrap_or(i64::MAX),
        }
    }
}

fn parse<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("invalid {key}: {raw:?}"))
        })
        .transpose()
}

fn parse_bool<F>(lookup: &F, key: &str) -> Result<Option<bool>>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => bail!("invalid {key}: {raw:?}"),
        })
        .transpose()
}
