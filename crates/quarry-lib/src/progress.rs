use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Lifecycle stage carried by every progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Checking,
    Downloading,
    Extracting,
    Patching,
    Verifying,
    Complete,
    RescueMode,
    Syncing,
}

/// A single tagged progress update.
///
/// All operations report through this one event type; consumers switch on
/// `stage` instead of wiring separate callbacks per concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage: Stage,
    /// 0.0..=100.0; negative values mean indeterminate.
    pub percent: f64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_bps: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_s: Option<u64>,
}

impl ProgressEvent {
    pub fn new(stage: Stage, percent: f64, message: impl Into<String>) -> Self {
        Self {
            stage,
            percent,
            message: message.into(),
            current_file: None,
            speed_bps: None,
            eta_s: None,
        }
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.current_file = Some(file.into());
        self
    }

    pub fn with_rate(mut self, speed_bps: u64, eta_s: Option<u64>) -> Self {
        self.speed_bps = Some(speed_bps);
        self.eta_s = eta_s;
        self
    }
}

/// Sink for progress events. Implementations forward updates to the UI or
/// notification system; the engine never blocks on a sink.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// A sink that discards everything. Useful for background verification and
/// tests.
pub struct SilentSink;

impl ProgressSink for SilentSink {
    fn emit(&self, _event: ProgressEvent) {}
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn emit(&self, event: ProgressEvent) {
        self(event);
    }
}

/// Cancellation token observed by long-running operations.
///
/// `destructive` controls whether partial download state (`.part` files) is
/// discarded on cancel; the default keeps partials for a later resume.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
    destructive: bool,
}

impl CancelToken {
    /// A token that can never fire. The receiver keeps reporting the last
    /// value after the sender is gone, so this stays `false` forever.
    pub fn none() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self {
            rx,
            destructive: false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    pub fn is_destructive(&self) -> bool {
        self.destructive
    }

    pub fn destructive(mut self) -> Self {
        self.destructive = true;
        self
    }
}

/// Owning side of a cancellation token.
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

impl CancelSource {
    pub fn new() -> (Self, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (
            Self { tx },
            CancelToken {
                rx,
                destructive: false,
            },
        )
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}
