//! Generation session bookkeeping
//!
//! Counters for one prompt-to-completion run, plus the timing data used for
//! tokens-per-second diagnostics.

use std::time::Instant;
use uuid::Uuid;

/// Snapshot of a session's progress
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationStats {
    pub tokens_generated: usize,
    pub tokens_per_second: f32,
    pub context_used: usize,
    pub context_total: usize,
}

/// Per-session counters that drive stop decisions and diagnostics
#[derive(Debug, Clone)]
pub struct SessionState {
    id: Uuid,
    input_tokens: usize,
    output_tokens: usize,
    lookahead_tokens: usize,
    context_capacity: usize,
    started: Option<Instant>,
}

impl SessionState {
    pub fn new(context_capacity: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            input_tokens: 0,
            output_tokens: 0,
            lookahead_tokens: 0,
            context_capacity,
            started: None,
        }
    }

    /// Starts a fresh session with a new id.
    pub fn reset(&mut self, context_capacity: usize) {
        *self = Self::new(context_capacity);
    }

    /// Records the prompt size. Returns false when the prompt plus
    /// `target_length` would overrun the context; the caller only logs this.
    pub fn begin(&mut self, input_tokens: usize, target_length: usize) -> bool {
        self.input_tokens = input_tokens;
        self.output_tokens = 0;
        self.lookahead_tokens = 0;
        self.started = Some(Instant::now());
        input_tokens.saturating_add(target_length) <= self.context_capacity
    }

    /// Counts one sampling step
    pub fn record_output(&mut self) {
        self.output_tokens += 1;
        self.check_capacity();
    }

    /// Counts a token sampled ahead of its public step
    pub fn record_lookahead(&mut self) {
        self.lookahead_tokens += 1;
        self.check_capacity();
    }

    fn check_capacity(&self) {
        if self.total_tokens() > self.context_capacity {
            tracing::warn!(
                session = %self.id,
                "Context overcommitted: {} tokens in a {} token context",
                self.total_tokens(),
                self.context_capacity
            );
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn input_tokens(&self) -> usize {
        self.input_tokens
    }

    pub fn output_tokens(&self) -> usize {
        self.output_tokens
    }

    pub fn lookahead_tokens(&self) -> usize {
        self.lookahead_tokens
    }

    /// Tokens the engine cache holds or is about to hold, lookahead included
    pub fn total_tokens(&self) -> usize {
        self.input_tokens + self.output_tokens + self.lookahead_tokens
    }

    pub fn context_capacity(&self) -> usize {
        self.context_capacity
    }

    /// Position of `cursor` relative to the end of the prompt
    pub fn relative_position(&self, cursor: usize) -> usize {
        cursor.saturating_sub(self.input_tokens)
    }

    pub fn elapsed_secs(&self) -> f32 {
        self.started.map_or(0.0, |t| t.elapsed().as_secs_f32())
    }

    pub fn stats(&self) -> GenerationStats {
        let elapsed = self.elapsed_secs();
        let generated = self.output_tokens + self.lookahead_tokens;
        GenerationStats {
            tokens_generated: generated,
            tokens_per_second: if elapsed > 0.0 {
                generated as f32 / elapsed
            } else {
                0.0
            },
            context_used: self.total_tokens(),
            context_total: self.context_capacity,
        }
    }
}
