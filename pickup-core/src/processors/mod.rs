//! Background workers of the delivery pipeline.
//!
//! - `OutboxRelay`: claims `CREATED` outbox rows, publishes them, marks them
//!   `COMPLETED` or `FAILED` and hands failures to the DLQ
//! - `DlqWorker`: resends due DLQ messages with linear backoff until their
//!   retry budget is spent
//!
//! Both poll on an interval read from a [`SettingsStore`](crate::config::SettingsStore)
//! and stop when their shutdown token is cancelled.

pub mod dlq_worker;
pub mod outbox_relay;

pub use dlq_worker::{DlqReport, DlqWorker};
pub use outbox_relay::{OutboxRelay, RelayReport};

use crate::store::StoreError;
use thiserror::Error;

/// Errors that end a relay or DLQ tick early. Publish failures are not
/// errors here; they are recorded on the row.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
