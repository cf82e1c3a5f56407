//! Progress and log events delivered to the embedding UI.
//!
//! Everything the engine wants the caller to see while a download or build is
//! running flows through an [`EventSink`]. The sink wraps an unbounded tokio
//! channel so emitting never blocks the transfer or subprocess it reports on.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

/// One observable engine event.
///
/// Serialized with a `type` tag so the UI layer can switch on it directly.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EngineEvent {
    /// Byte-level download progress (only emitted when the length is known)
    DownloadProgress {
        percent: f64,
        current: u64,
        total: u64,
        status: String,
    },
    /// Free-form status line for the current operation
    Status {
        #[serde(skip_serializing_if = "Option::is_none")]
        percent: Option<f64>,
        status: String,
    },
    /// Build pipeline moved to a new stage
    Stage { status: String },
    /// One line of install/build subprocess output
    BuildLog {
        text: String,
        #[serde(rename = "isError")]
        is_error: bool,
        timestamp: DateTime<Utc>,
    },
}

/// Cloneable, non-blocking handle for emitting [`EngineEvent`]s.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<EngineEvent>>,
}

impl EventSink {
    /// Create a sink and the receiving end of its channel
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that drops everything
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: EngineEvent) {
        if let Some(tx) = &self.tx {
            // A dropped receiver just means nobody is watching anymore
            let _ = tx.send(event);
        }
    }

    pub fn status(&self, percent: Option<f64>, status: impl Into<String>) {
        self.emit(EngineEvent::Status {
            percent,
            status: status.into(),
        });
    }

    pub fn progress(&self, current: u64, total: u64, status: &str) {
        let percent = if total > 0 {
            (current as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        self.emit(EngineEvent::DownloadProgress {
            percent,
            current,
            total,
            status: status.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_percent() {
        let (sink, mut rx) = EventSink::channel();
        sink.progress(25, 100, "Downloading...");

        match rx.try_recv().unwrap() {
            EngineEvent::DownloadProgress {
                percent,
                current,
                total,
                ..
            } => {
                assert!((percent - 25.0).abs() < f64::EPSILON);
                assert_eq!(current, 25);
                assert_eq!(total, 100);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_emit_after_receiver_dropped_is_silent() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.status(None, "still fine");
    }

    #[test]
    fn test_disabled_sink() {
        EventSink::disabled().status(Some(100.0), "nobody listening");
    }

    #[test]
    fn test_build_log_serializes_ui_shape() {
        let event = EngineEvent::BuildLog {
            text: "added 12 packages".to_string(),
            is_error: false,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "build-log");
        assert_eq!(json["isError"], false);
        assert_eq!(json["text"], "added 12 packages");
    }
}
