//! Runtime settings for the lifecycle service and the background workers.
//!
//! These are the validated values the core works with. Parsing the config
//! file is the server crate's job.

mod settings_store;

pub use settings_store::{SettingsStore, SettingsWatcher};

use crate::lifecycle::PackagingPolicy;

/// Outbox relay tuning. Re-read on every tick.
#[derive(Debug, Clone, PartialEq)]
pub struct RelaySettings {
    /// Maximum outbox rows claimed per tick.
    pub batch_size: i64,
    pub interval: std::time::Duration,
    /// Hand failed publications to the DLQ.
    pub dead_letter_on_failure: bool,
    /// Retry budget given to each new DLQ message. Same value as the DLQ
    /// worker's `max_retries`.
    pub dlq_max_retries: i32,
    /// Delay before the first DLQ resend. Same value as
    /// [`DlqSettings::base_delay`].
    pub dlq_base_delay: time::Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            interval: std::time::Duration::from_secs(1),
            dead_letter_on_failure: true,
            dlq_max_retries: 5,
            dlq_base_delay: time::Duration::seconds(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DlqSettings {
    pub batch_size: i64,
    pub interval: std::time::Duration,
    /// Backoff unit: the n-th failed resend waits `base_delay * n`.
    pub base_delay: time::Duration,
}

impl Default for DlqSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            interval: std::time::Duration::from_secs(5),
            base_delay: time::Duration::seconds(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleSettings {
    /// ID of this pickup point, used as the actor for point-initiated events.
    pub point_id: i64,
    /// `source` field of every emitted event.
    pub source: String,
    /// How long after issue a client may still return an order.
    pub return_window: time::Duration,
    pub packaging: PackagingPolicy,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            point_id: 1,
            source: "pickup-point".to_string(),
            return_window: time::Duration::hours(48),
            packaging: PackagingPolicy::default(),
        }
    }
}
