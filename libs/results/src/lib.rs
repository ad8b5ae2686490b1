//! Persists delivery results reported by the egress side of the messaging
//! pipeline.
//!
//! A batch of queue deliveries is decoded record by record and each decoded
//! result is written to `outbound_send_queue` with a single keyed update.
//! Records that cannot be decoded are logged and dropped; a storage failure
//! aborts the batch so the queue can redeliver it.
//!
//! ```no_run
//! use gsm_results::{EnvelopeRecord, StorageConfig, handle_batch};
//!
//! # async fn demo() -> Result<(), gsm_results::BatchError> {
//! let config = StorageConfig::new("results.db");
//! let records = vec![EnvelopeRecord::new(
//!     "msg-1",
//!     r#"{"referenceId": 101, "status": 200, "responseContent": "ok"}"#,
//! )];
//! let report = handle_batch(&config, Some(&records)).await?;
//! assert_eq!(report.persisted, 1);
//! # Ok(())
//! # }
//! ```

mod batch;
mod config;
mod decode;
mod envelope;
mod invocation;
mod model;
mod persist;

pub use batch::{BatchError, BatchProcessor, BatchReport};
pub use config::StorageConfig;
pub use decode::{DecodeError, decode_result};
pub use envelope::EnvelopeRecord;
pub use invocation::{Invocation, StorageConnection, handle_batch};
pub use model::{DeliveryState, OutboundResult};
pub use persist::{PersistError, PersistOutcome, ResultPersister, apply_result, ensure_schema};
