//! Install progress emission.
//!
//! Phase changes always produce an event.  Within the downloading phase,
//! byte-level updates are coalesced: an event goes out when a whole percent
//! of the total has been received or 500 ms have passed since the last one,
//! whichever comes first.  The terminal event is emitted exactly once.

use semver::Version;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

use kiln_types::{CoreError, InstallPhase, InstallProgress};

/// Max quiet interval between downloading events.
const EMIT_INTERVAL: Duration = Duration::from_millis(500);

/// Coalescing sender for one install's progress stream.
///
/// Owned by the install worker; subscribers hold `broadcast::Receiver`s.
pub struct ProgressSender {
    tx: broadcast::Sender<InstallProgress>,
    model_id: String,
    version: Version,
    request_id: Uuid,
    phase: InstallPhase,
    received_bytes: u64,
    total_bytes: u64,
    last_emit: Instant,
    last_percent: u64,
    terminal_sent: bool,
}

impl ProgressSender {
    pub fn new(
        tx: broadcast::Sender<InstallProgress>,
        model_id: impl Into<String>,
        version: Version,
        request_id: Uuid,
    ) -> Self {
        Self {
            tx,
            model_id: model_id.into(),
            version,
            request_id,
            phase: InstallPhase::Idle,
            received_bytes: 0,
            total_bytes: 0,
            last_emit: Instant::now(),
            last_percent: 0,
            terminal_sent: false,
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Enter a new phase; always emits.
    pub fn phase(&mut self, phase: InstallPhase) {
        debug_assert!(!phase.is_terminal(), "terminal phases go through terminal()");
        self.phase = phase;
        if phase == InstallPhase::Downloading {
            self.last_percent = 0;
        }
        info!(
            model_id = %self.model_id,
            version = %self.version,
            phase = %phase,
            "install phase change"
        );
        self.emit(None);
    }

    /// Set the denominator for download progress.
    pub fn set_total_bytes(&mut self, total: u64) {
        self.total_bytes = total;
    }

    /// Record received bytes; emits when the coalescing window allows.
    ///
    /// The emitted counter never decreases, so a restarted artifact download
    /// does not break the stream's monotonicity guarantee.
    pub fn on_bytes(&mut self, received_total: u64) {
        self.received_bytes = received_total.max(self.received_bytes);
        let received_total = self.received_bytes;
        let percent = if self.total_bytes == 0 {
            0
        } else {
            received_total * 100 / self.total_bytes
        };
        if percent > self.last_percent || self.last_emit.elapsed() >= EMIT_INTERVAL {
            self.last_percent = percent;
            self.emit(None);
        }
    }

    /// Emit the single terminal event for this install.
    pub fn terminal(&mut self, phase: InstallPhase, error: Option<CoreError>) {
        debug_assert!(phase.is_terminal());
        if self.terminal_sent {
            return;
        }
        self.terminal_sent = true;
        self.phase = phase;
        info!(
            model_id = %self.model_id,
            version = %self.version,
            phase = %phase,
            "install finished"
        );
        self.emit(error);
    }

    pub fn terminal_sent(&self) -> bool {
        self.terminal_sent
    }

    fn emit(&mut self, error: Option<CoreError>) {
        let progress = match self.phase {
            InstallPhase::Idle => 0.0,
            InstallPhase::Downloading => {
                if self.total_bytes == 0 {
                    0.0
                } else {
                    (self.received_bytes as f64 / self.total_bytes as f64).min(1.0)
                }
            }
            // Verifying/extracting and terminals report their phase complete.
            _ => 1.0,
        };
        self.last_emit = Instant::now();
        // Send errors only mean no receiver is currently subscribed.
        let _ = self.tx.send(InstallProgress {
            model_id: self.model_id.clone(),
            version: self.version.clone(),
            request_id: self.request_id,
            phase: self.phase,
            received_bytes: self.received_bytes,
            total_bytes: self.total_bytes,
            progress,
            error,
        });
    }
}
