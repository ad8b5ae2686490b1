//! JetStream worker that records outbound delivery results.
//!
//! Each fetch from the durable pull consumer becomes one invocation of
//! [`gsm_results::handle_batch`]. The whole batch is acked when it completes and
//! nak'ed when it fails, so a failed batch is redelivered intact. Messages that
//! run out of deliveries are copied to the DLQ before being terminated.

pub mod ack;
pub mod config;
mod worker;

pub use ack::{AckDecision, plan_acks};
pub use config::SaverConfig;
pub use worker::{
    InvocationError, ResultSaver, STAGE, describe, envelope_from_message, invoke, record_id, run,
};
