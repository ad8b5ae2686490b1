use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use gsm_dlq::{DlqEntry, DlqSettings, get_entry, list_entries, replay_entries};
use serde::Serialize;
use tracing::debug;

const DEFAULT_STAGE: &str = "results";
const DEFAULT_STREAM: &str = "outbound-results";
const DEFAULT_REPLAY_SUBJECT: &str = "greentic.messaging.results.replay";

#[derive(Parser, Debug)]
#[command(author, version, about = "Greentic Messaging delivery-result DLQ CLI")]
struct Cli {
    /// Emit JSON output
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List DLQ entries for a stage/stream
    List {
        #[arg(long, default_value = DEFAULT_STAGE)]
        stage: String,
        #[arg(long, default_value = DEFAULT_STREAM)]
        stream: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show a DLQ entry by stream sequence id
    Show {
        #[arg()]
        sequence: u64,
    },
    /// Publish DLQ entries back onto a results subject
    Replay {
        #[arg(long, default_value = DEFAULT_STAGE)]
        stage: String,
        #[arg(long, default_value = DEFAULT_STREAM)]
        stream: String,
        /// Subject the original bodies are republished to
        #[arg(long, default_value = DEFAULT_REPLAY_SUBJECT)]
        to: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[derive(Serialize)]
struct ListEntry {
    sequence: u64,
    stage: String,
    stream: String,
    msg_id: String,
    code: String,
    deliveries: u64,
    ts: String,
}

#[derive(Serialize)]
struct ShowEntry<'a> {
    sequence: u64,
    record: &'a gsm_dlq::DlqRecord,
}

#[derive(Serialize)]
struct ReplayResult {
    target_subject: String,
    processed: Vec<ListEntry>,
}

#[tokio::main]
async fn main() -> Result<()> {
    gsm_telemetry::install("gsm-cli-dlq")?;
    let cli = Cli::parse();
    let nats_url = std::env::var("NATS_URL").unwrap_or_else(|_| "nats://127.0.0.1:4222".into());
    let settings = DlqSettings::from_lookup(|key| std::env::var(key).ok());
    debug!(%nats_url, subject_fmt = %settings.subject_fmt, "connecting");
    let client = async_nats::connect(nats_url).await?;

    match cli.command {
        Commands::List {
            stage,
            stream,
            limit,
        } => {
            let entries = list_entries(&client, &settings, &stage, &stream, limit).await?;
            if cli.json {
                let payload: Vec<_> = entries.iter().map(list_entry).collect();
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else if entries.is_empty() {
                println!("No DLQ entries for stage={stage} stream={stream}");
            } else {
                print_table(&entries);
            }
        }
        Commands::Show { sequence } => {
            let Some(entry) = get_entry(&client, sequence).await? else {
                bail!("dlq entry {sequence} not found");
            };
            if cli.json {
                let payload = ShowEntry {
                    sequence,
                    record: &entry.record,
                };
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                println!("sequence  : {sequence}");
                println!("stage     : {}", entry.record.stage);
                println!("stream    : {}", entry.record.stream);
                println!("msg_id    : {}", entry.record.msg_id);
                println!("code      : {}", entry.record.error.code);
                println!("message   : {}", entry.record.error.message);
                println!("deliveries: {}", entry.record.deliveries);
                println!("timestamp : {}", entry.record.ts);
                println!(
                    "body      : {}",
                    serde_json::to_string_pretty(&entry.record.body)?
                );
            }
        }
        Commands::Replay {
            stage,
            stream,
            to,
            limit,
        } => {
            let processed =
                replay_entries(&client, &settings, &stage, &stream, &to, limit).await?;
            if cli.json {
                let payload = ReplayResult {
                    target_subject: to.clone(),
                    processed: processed.iter().map(list_entry).collect(),
                };
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else if processed.is_empty() {
                println!("No DLQ entries replayed for stage={stage} stream={stream}");
            } else {
                println!("Replayed {} entries to {to}", processed.len());
                print_table(&processed);
            }
        }
    }

    Ok(())
}

fn list_entry(entry: &DlqEntry) -> ListEntry {
    ListEntry {
        sequence: entry.sequence,
        stage: entry.record.stage.clone(),
        stream: entry.record.stream.clone(),
        msg_id: entry.record.msg_id.clone(),
        code: entry.record.error.code.clone(),
        deliveries: entry.record.deliveries,
        ts: entry.record.ts.clone(),
    }
}

fn print_table(entries: &[DlqEntry]) {
    println!(
        "{:<8} {:<8} {:<18} {:<12} {:<10} {:<6} {:<}",
        "SEQ", "STAGE", "STREAM", "MSG_ID", "CODE", "DELIV", "TS"
    );
    for entry in entries {
        println!(
            "{:<8} {:<8} {:<18} {:<12} {:<10} {:<6} {}",
            entry.sequence,
            entry.record.stage,
            entry.record.stream,
            entry.record.msg_id,
            entry.record.error.code,
            entry.record.deliveries,
            entry.record.ts
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn replay_defaults_target_results_stage() {
        let cli = Cli::try_parse_from(["gsm-cli-dlq", "replay"]).unwrap();
        match cli.command {
            Commands::Replay {
                stage, stream, to, limit,
            } => {
                assert_eq!(stage, "results");
                assert_eq!(stream, "outbound-results");
                assert_eq!(to, DEFAULT_REPLAY_SUBJECT);
                assert_eq!(limit, 10);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn list_accepts_global_json_flag() {
        let cli = Cli::try_parse_from(["gsm-cli-dlq", "list", "--limit", "5", "--json"]).unwrap();
        assert!(cli.json);
        assert!(matches!(cli.command, Commands::List { limit: 5, .. }));
    }
}
