//! The unified LLM event stream.
//!
//! Adapters produce [`RawDelta`]s; the normalizer applies stop-string
//! matching and sequencing and yields wire [`StreamEvent`]s.  Every stream
//! carries a stable request id, a strictly increasing sequence starting at
//! 1, and exactly one terminal event.

mod stop;

pub use stop::{StopMatcher, StopScan};

use std::time::Instant;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use kiln_types::{
    CompletionResult, CoreError, FinishReason, GenerationStats, StreamEvent, StreamPayload,
};

/// What a backend adapter emits, before normalization.
#[derive(Debug)]
pub enum RawDelta {
    Text {
        text: String,
        token_ids: Option<Vec<u32>>,
    },
    Done {
        reason: FinishReason,
        stats: GenerationStats,
    },
    Error(CoreError),
}

/// Stop handling configuration for one stream.
#[derive(Debug, Clone, Default)]
pub struct StreamConfig {
    pub stop_strings: Vec<String>,
    /// When set, the matched stop string itself is included in the final
    /// delta.  Off by default.
    pub emit_stop_fragment: bool,
}

// ── Sequencer ─────────────────────────────────────────────────────────────────

/// Allocates the strictly increasing per-request sequence and enforces the
/// single-terminal rule.
#[derive(Debug)]
pub struct EventSequencer {
    request_id: Uuid,
    next: u64,
    terminal: bool,
}

impl EventSequencer {
    pub fn new(request_id: Uuid) -> Self {
        Self {
            request_id,
            next: 1,
            terminal: false,
        }
    }

    /// Wrap a payload into the next event.  Events after the terminal are a
    /// producer bug and are dropped.
    pub fn event(&mut self, payload: StreamPayload) -> Option<StreamEvent> {
        if self.terminal {
            debug_assert!(false, "event after terminal for request {}", self.request_id);
            return None;
        }
        if payload.is_terminal() {
            self.terminal = true;
        }
        let sequence = self.next;
        self.next += 1;
        Some(StreamEvent {
            request_id: self.request_id,
            sequence,
            payload,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }
}

// ── Normalizer ────────────────────────────────────────────────────────────────

/// Turn a raw adapter stream into the wire event stream.
///
/// Dropping the returned receiver tears the pipeline down; the adapter
/// observes its send side closing and stops generating.  A stop match does
/// the same: the raw receiver is dropped and the stream finishes with
/// `finishReason = stop`.
pub fn normalize(
    request_id: Uuid,
    config: StreamConfig,
    mut raw: mpsc::Receiver<RawDelta>,
) -> mpsc::Receiver<StreamEvent> {
    let (tx, rx) = mpsc::channel(64);

    tokio::spawn(async move {
        let mut sequencer = EventSequencer::new(request_id);
        let mut matcher = StopMatcher::new(config.stop_strings, config.emit_stop_fragment);
        let passthrough = matcher.is_passthrough();
        let started = Instant::now();
        let mut completion_tokens: u64 = 0;
        let mut time_to_first_token_ms: Option<u64> = None;

        macro_rules! send {
            ($payload:expr) => {
                match sequencer.event($payload) {
                    Some(event) => {
                        if tx.send(event).await.is_err() {
                            // Consumer went away; stop pumping.
                            return;
                        }
                    }
                    None => return,
                }
            };
        }

        while let Some(delta) = raw.recv().await {
            match delta {
                RawDelta::Text { text, token_ids } => {
                    completion_tokens += 1;
                    if time_to_first_token_ms.is_none() {
                        time_to_first_token_ms = Some(started.elapsed().as_millis() as u64);
                    }
                    match matcher.push(&text) {
                        StopScan::Emit(emitted) => {
                            if !emitted.is_empty() {
                                // Token ids survive only in passthrough mode;
                                // buffering re-segments the text.
                                let token_ids = if passthrough { token_ids } else { None };
                                send!(StreamPayload::Delta {
                                    delta_text: emitted,
                                    token_ids,
                                });
                            }
                        }
                        StopScan::Matched { emitted } => {
                            if !emitted.is_empty() {
                                send!(StreamPayload::Delta {
                                    delta_text: emitted,
                                    token_ids: None,
                                });
                            }
                            let stats = synthesized_stats(
                                completion_tokens,
                                time_to_first_token_ms,
                                started,
                            );
                            debug!(%request_id, "stop string matched; finishing stream");
                            send!(StreamPayload::Finish {
                                finish_reason: FinishReason::Stop,
                                stats,
                            });
                            // Dropping `raw` tells the adapter to stop.
                            return;
                        }
                    }
                }
                RawDelta::Done { reason, mut stats } => {
                    let tail = matcher.flush();
                    if !tail.is_empty() {
                        send!(StreamPayload::Delta {
                            delta_text: tail,
                            token_ids: None,
                        });
                    }
                    if stats.time_to_first_token_ms.is_none() {
                        stats.time_to_first_token_ms = time_to_first_token_ms;
                    }
                    if stats.completion_tokens == 0 {
                        stats.completion_tokens = completion_tokens;
                    }
                    send!(StreamPayload::Finish {
                        finish_reason: reason,
                        stats,
                    });
                    return;
                }
                RawDelta::Error(error) => {
                    send!(StreamPayload::Error {
                        error,
                        finish_reason: FinishReason::Error,
                    });
                    return;
                }
            }
        }

        // Producer vanished without a terminal raw delta.
        if !sequencer.is_terminal() {
            send!(StreamPayload::Error {
                error: CoreError::runtime_not_available(
                    "stream",
                    "generation stream ended without a terminal event",
                ),
                finish_reason: FinishReason::Error,
            });
        }
    });

    rx
}

fn synthesized_stats(
    completion_tokens: u64,
    time_to_first_token_ms: Option<u64>,
    started: Instant,
) -> GenerationStats {
    let elapsed_ms = started.elapsed().as_millis() as f64;
    GenerationStats {
        prompt_tokens: 0,
        completion_tokens,
        time_to_first_token_ms,
        ms_per_token: if completion_tokens > 0 {
            Some(elapsed_ms / completion_tokens as f64)
        } else {
            None
        },
    }
}

// ── Collection ────────────────────────────────────────────────────────────────

/// Fold a stream into the non-streaming result shape.
///
/// Lossless on `(text, finishReason, stats)`: the text is the concatenation
/// of every delta in sequence order.
pub async fn collect(mut rx: mpsc::Receiver<StreamEvent>) -> Result<CompletionResult, CoreError> {
    let mut text = String::new();
    while let Some(event) = rx.recv().await {
        match event.payload {
            StreamPayload::Delta { delta_text, .. } => text.push_str(&delta_text),
            StreamPayload::Metrics { .. } => {}
            StreamPayload::Finish {
                finish_reason,
                stats,
            } => {
                return Ok(CompletionResult {
                    text,
                    finish_reason,
                    stats,
                });
            }
            StreamPayload::Error { error, .. } => return Err(error),
        }
    }
    Err(CoreError::runtime_not_available(
        "stream",
        "stream closed without a terminal event",
    ))
}
