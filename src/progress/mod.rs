use serde::Serialize;
use tokio::sync::mpsc;

/// Status tags carried on the progress stream to the originating caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Processing,
    Uploading,
    Completed,
    Failed,
    Cancelled,
    Closed,
}

/// One event on the stream: an optional human-readable line and an optional
/// status tag. Serializes to the JSON shape the event-stream surface emits.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ProgressStatus>,
}

/// Push-only side of a one-way progress channel. Delivery is best effort: a
/// gone receiver never affects the execution that is reporting.
#[derive(Clone)]
pub struct ProgressSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ProgressSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Forwards one diagnostic line, without a status tag.
    pub fn line(&self, message: impl Into<String>) {
        let _ = self.tx.send(ProgressEvent {
            message: Some(message.into()),
            status: None,
        });
    }

    pub fn status(&self, status: ProgressStatus, message: Option<String>) {
        let _ = self.tx.send(ProgressEvent {
            message,
            status: Some(status),
        });
    }

    /// End-of-stream sentinel; the consumer side closes on it.
    pub fn close(&self) {
        let _ = self.tx.send(ProgressEvent {
            message: None,
            status: Some(ProgressStatus::Closed),
        });
    }
}

/// Drains a progress receiver into structured log lines. Used where no
/// event-stream consumer is attached (scheduled runs, headless mode).
pub fn drain_to_log(
    subject: String,
    mut rx: mpsc::UnboundedReceiver<ProgressEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match (event.status, event.message) {
                (Some(status), Some(message)) => {
                    tracing::info!(subject = %subject, status = ?status, "{message}");
                }
                (Some(status), None) => tracing::info!(subject = %subject, status = ?status, "progress"),
                (None, Some(message)) => tracing::debug!(subject = %subject, "{message}"),
                (None, None) => {}
            }
        }
    })
}
