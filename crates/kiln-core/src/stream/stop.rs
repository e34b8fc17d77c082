//! Cross-chunk stop-string matching.
//!
//! The matcher owns a rolling buffer.  Text that cannot possibly be part of
//! a stop string is released immediately; the last `max(len) - 1` bytes are
//! retained across chunks so a stop straddling a chunk boundary is still
//! caught.  Matching is byte-exact substring search, scanning stop strings
//! in configured order; the earliest occurrence wins.

/// Result of feeding one chunk to the matcher.
#[derive(Debug, PartialEq)]
pub enum StopScan {
    /// Text safe to release to the consumer (possibly empty).
    Emit(String),
    /// A stop string matched.  `emitted` is everything up to (and excluding,
    /// unless configured otherwise) the match; the rest of the stream is to
    /// be discarded.
    Matched { emitted: String },
}

#[derive(Debug)]
pub struct StopMatcher {
    stops: Vec<String>,
    /// Bytes retained across chunks: longest stop length minus one.
    keep: usize,
    buffer: String,
    emit_stop_fragment: bool,
    matched: bool,
}

impl StopMatcher {
    pub fn new(stops: Vec<String>, emit_stop_fragment: bool) -> Self {
        let stops: Vec<String> = stops.into_iter().filter(|s| !s.is_empty()).collect();
        let keep = stops
            .iter()
            .map(|s| s.len())
            .max()
            .unwrap_or(0)
            .saturating_sub(1);
        Self {
            stops,
            keep,
            buffer: String::new(),
            emit_stop_fragment,
            matched: false,
        }
    }

    /// Whether text passes through unbuffered (no stop strings configured).
    pub fn is_passthrough(&self) -> bool {
        self.stops.is_empty()
    }

    pub fn matched(&self) -> bool {
        self.matched
    }

    /// Feed one chunk; returns what may be released now.
    pub fn push(&mut self, chunk: &str) -> StopScan {
        debug_assert!(!self.matched, "push after a match");
        self.buffer.push_str(chunk);

        // Earliest occurrence of any stop wins; configured order breaks ties
        // at the same position.
        let mut hit: Option<(usize, usize)> = None;
        for stop in &self.stops {
            if let Some(idx) = self.buffer.find(stop.as_str()) {
                let better = match hit {
                    Some((best_idx, _)) => idx < best_idx,
                    None => true,
                };
                if better {
                    hit = Some((idx, stop.len()));
                }
            }
        }

        if let Some((idx, stop_len)) = hit {
            self.matched = true;
            let end = if self.emit_stop_fragment {
                idx + stop_len
            } else {
                idx
            };
            let emitted = self.buffer[..end].to_owned();
            self.buffer.clear();
            return StopScan::Matched { emitted };
        }

        // Release all but the retained tail, respecting char boundaries.
        let mut split = self.buffer.len().saturating_sub(self.keep);
        while split > 0 && !self.buffer.is_char_boundary(split) {
            split -= 1;
        }
        let emitted: String = self.buffer.drain(..split).collect();
        StopScan::Emit(emitted)
    }

    /// Release the retained tail at natural end of stream.
    pub fn flush(&mut self) -> String {
        std::mem::take(&mut self.buffer)
    }
}
