//! Outbound notification of attendance summaries.
//!
//! Delivery itself belongs to an external messaging channel; this module only
//! defines the hand-off. Failures are reported to the caller, which logs them
//! and moves on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("spool write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("delivery rejected: {0}")]
    Rejected(String),
}

/// A message waiting to be delivered no earlier than `scheduled_for`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub destination: String,
    pub message: String,
    pub scheduled_for: DateTime<Utc>,
}

impl Notification {
    pub fn new(destination: impl Into<String>, message: impl Into<String>, scheduled_for: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            destination: destination.into(),
            message: message.into(),
            scheduled_for,
        }
    }
}

/// A delivery channel. Called once the scheduled time has passed.
pub trait Notifier: Send + Sync {
    fn deliver(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes the message to the log instead of sending it.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn deliver(&self, notification: &Notification) -> Result<(), NotifyError> {
        tracing::info!(
            id = %notification.id,
            destination = %notification.destination,
            message = %notification.message,
            "notification"
        );
        Ok(())
    }
}

/// Drops each message as a JSON file into a spool directory for an external
/// sender to pick up.
pub struct SpoolNotifier {
    dir: PathBuf,
}

impl SpoolNotifier {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl Notifier for SpoolNotifier {
    fn deliver(&self, notification: &Notification) -> Result<(), NotifyError> {
        std::fs::create_dir_all(&self.dir)?;
        let body = serde_json::to_vec_pretty(notification)?;

        // Write then rename so a pickup never sees a partial file.
        let tmp = self.dir.join(format!(".{}.json.tmp", notification.id));
        let path = self.dir.join(format!("{}.json", notification.id));
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &path)?;

        tracing::debug!(path = %path.display(), "notification spooled");
        Ok(())
    }
}
