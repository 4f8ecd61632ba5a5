//! Deferred delivery of notifications.
//!
//! Each queued notification waits on a background task until its scheduled
//! time, then goes to the [`Notifier`] on the blocking pool. Delivery errors
//! are logged and never reach the run that queued the message.

use chrono::Utc;
use headcount_core::notify::{Notification, Notifier};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub struct Outbox {
    tx: mpsc::UnboundedSender<Notification>,
    worker: JoinHandle<usize>,
}

impl Outbox {
    pub fn spawn(notifier: Arc<dyn Notifier>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();

        let worker = tokio::spawn(async move {
            let mut pending = Vec::new();
            while let Some(n) = rx.recv().await {
                pending.push(tokio::spawn(deliver_when_due(notifier.clone(), n)));
            }

            let mut delivered = 0;
            for task in pending {
                if matches!(task.await, Ok(true)) {
                    delivered += 1;
                }
            }
            delivered
        });

        Self { tx, worker }
    }

    pub fn enqueue(&self, notification: Notification) {
        tracing::info!(
            id = %notification.id,
            destination = %notification.destination,
            scheduled_for = %notification.scheduled_for,
            "notification queued"
        );
        if self.tx.send(notification).is_err() {
            tracing::warn!("outbox worker gone; notification dropped");
        }
    }

    /// Stop accepting messages and wait for every queued one to be attempted.
    /// Returns the number delivered successfully.
    pub async fn shutdown(self) -> usize {
        drop(self.tx);
        match self.worker.await {
            Ok(delivered) => delivered,
            Err(e) => {
                tracing::error!(error = %e, "outbox worker panicked");
                0
            }
        }
    }
}

async fn deliver_when_due(notifier: Arc<dyn Notifier>, notification: Notification) -> bool {
    if let Ok(wait) = (notification.scheduled_for - Utc::now()).to_std() {
        tokio::time::sleep(wait).await;
    }

    let id = notification.id;
    let result = tokio::task::spawn_blocking(move || notifier.deliver(&notification)).await;
    match result {
        Ok(Ok(())) => {
            tracing::info!(%id, "notification delivered");
            true
        }
        Ok(Err(e)) => {
            tracing::warn!(%id, error = %e, "notification delivery failed");
            false
        }
        Err(e) => {
            tracing::error!(%id, error = %e, "notification task panicked");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use headcount_core::notify::NotifyError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<String>>,
        reject: Option<&'static str>,
    }

    impl Notifier for Recording {
        fn deliver(&self, n: &Notification) -> Result<(), NotifyError> {
            if self.reject == Some(n.destination.as_str()) {
                return Err(NotifyError::Rejected("blocked".into()));
            }
            self.seen.lock().unwrap().push(n.message.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_delivery() {
        let notifier = Arc::new(Recording::default());
        let outbox = Outbox::spawn(notifier.clone());

        let due = Utc::now() + chrono::Duration::milliseconds(50);
        outbox.enqueue(Notification::new("dest", "report", due));

        assert_eq!(outbox.shutdown().await, 1);
        assert_eq!(*notifier.seen.lock().unwrap(), vec!["report"]);
    }

    #[tokio::test]
    async fn test_failed_delivery_is_not_counted() {
        let notifier = Arc::new(Recording {
            reject: Some("blocked"),
            ..Recording::default()
        });
        let outbox = Outbox::spawn(notifier.clone());

        outbox.enqueue(Notification::new("blocked", "a", Utc::now()));
        outbox.enqueue(Notification::new("ok", "b", Utc::now()));

        assert_eq!(outbox.shutdown().await, 1);
        assert_eq!(*notifier.seen.lock().unwrap(), vec!["b"]);
    }
}
