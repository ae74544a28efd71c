//! Streaming generation controller
//!
//! Drives an [`InferenceEngine`] one token per call: `init` evaluates the
//! prompt, each `step` samples greedily, decides whether to stop, reassembles
//! UTF-8 and feeds the chosen token back to the engine.
//!
//! # Lookahead
//!
//! Two situations need the token *after* the one just sampled: a piece that
//! ends mid-character, and a newline that may be followed by another
//! speaker's role marker. In both cases the sampled token is evaluated early,
//! the next token is sampled from the fresh logits, and that token is parked
//! in [`StepOutput::pending_lookahead`]. The following `step` feeds the parked
//! token instead of sampling, so every decode call still carries exactly one
//! token at the next position.

use thiserror::Error;

use crate::inference::batch::{BatchBuffer, BatchError, Position, TokenId};
use crate::inference::engine::{EngineError, InferenceEngine};
use crate::inference::sampling::greedy_argmax;
use crate::inference::session::SessionState;
use crate::inference::stop::StopPolicy;
use crate::inference::streaming::{StepOutput, StopSignal};
use crate::inference::utf8::{Feed, Utf8Reassembler};

/// Reserved "no token" id, treated like end-of-generation
pub const NULL_TOKEN: TokenId = -1;

/// The only sequence used by a single-request session
const SEQ_ID: i32 = 0;

/// Errors surfaced to the host. Per-step decode and conversion failures are
/// logged and absorbed instead.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Prompt produced no tokens")]
    EmptyPrompt,

    #[error("Generation has not been initialized")]
    NotPrimed,
}

/// Controller lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Primed,
    Generating,
    Stopped(StopSignal),
}

/// Streams text out of an engine one token at a time.
pub struct GenerationController<E: InferenceEngine> {
    engine: E,
    batch: BatchBuffer,
    utf8: Utf8Reassembler,
    session: SessionState,
    policy: StopPolicy,
    phase: Phase,
    target_length: usize,
    /// Token sampled by a lookahead, not yet fed to the engine
    lookahead: Option<TokenId>,
    /// Batch slot holding the most recent logits
    logits_slot: Option<usize>,
    /// Newline withheld until the token after the parked one is checked
    held: Option<String>,
    /// The engine cache may hold entries from an earlier `init`
    cache_dirty: bool,
}

fn to_position(index: usize) -> Result<Position, BatchError> {
    Position::try_from(index).map_err(|_| BatchError::CapacityExceeded {
        capacity: Position::MAX as usize,
    })
}

impl<E: InferenceEngine> GenerationController<E> {
    /// Wraps `engine`, sizing the batch from its current context capacity.
    pub fn new(engine: E, policy: StopPolicy) -> Result<Self, GenerationError> {
        let context = engine.context_capacity();
        let batch = BatchBuffer::with_limit(context, 1, engine.max_batch_width())?;
        tracing::debug!(
            "Controller ready: n_vocab={}, n_ctx={context}, batch={}",
            engine.vocab_size(),
            batch.capacity()
        );

        Ok(Self {
            engine,
            batch,
            utf8: Utf8Reassembler::new(),
            session: SessionState::new(context),
            policy,
            phase: Phase::Idle,
            target_length: 0,
            lookahead: None,
            logits_slot: None,
            held: None,
            cache_dirty: false,
        })
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn batch(&self) -> &BatchBuffer {
        &self.batch
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn pending_lookahead(&self) -> Option<TokenId> {
        self.lookahead
    }

    /// Tokenizes and evaluates `prompt`. Returns the cursor for the first
    /// `step`, which is the prompt length.
    pub fn init(&mut self, prompt: &str, target_length: usize) -> Result<usize, GenerationError> {
        if self.cache_dirty {
            self.clear_cache();
        }
        self.phase = Phase::Idle;
        self.utf8.clear();
        self.lookahead = None;
        self.logits_slot = None;
        self.held = None;

        let tokens = self.engine.tokenize(prompt)?;
        if tokens.is_empty() {
            return Err(GenerationError::EmptyPrompt);
        }

        tracing::debug!(session = %self.session.id(), "Tokenized prompt into {} tokens", tokens.len());
        for &token in &tokens {
            if let Ok(piece) = self.engine.token_to_piece(token) {
                tracing::trace!("Token: {:?} (id: {token})", String::from_utf8_lossy(&piece));
            }
        }

        let context = self.session.context_capacity();
        if !self.session.begin(tokens.len(), target_length) {
            tracing::error!(
                session = %self.session.id(),
                "Required KV cache size is not big enough: prompt={}, n_len={target_length}, n_ctx={context}",
                tokens.len()
            );
        }

        let width = self.batch.capacity();
        if width == 0 {
            return Err(BatchError::CapacityExceeded { capacity: 0 }.into());
        }

        let last = tokens.len() - 1;
        self.cache_dirty = true;
        for (chunk_index, chunk) in tokens.chunks(width).enumerate() {
            self.batch.clear();
            for (offset, &token) in chunk.iter().enumerate() {
                let index = chunk_index * width + offset;
                self.batch
                    .append(token, to_position(index)?, SEQ_ID, index == last)?;
            }
            if let Err(e) = self.engine.evaluate(&self.batch) {
                tracing::error!(session = %self.session.id(), "Prompt decode failed: {e}");
                return Err(e.into());
            }
        }

        self.logits_slot = self.batch.last_index();
        self.target_length = target_length;
        self.phase = Phase::Primed;
        Ok(tokens.len())
    }

    /// Advances generation by one token.
    pub fn step(&mut self, cursor: usize) -> Result<StepOutput, GenerationError> {
        match self.phase {
            Phase::Idle => return Err(GenerationError::NotPrimed),
            Phase::Stopped(signal) => return Ok(self.output(String::new(), signal, cursor)),
            Phase::Primed | Phase::Generating => self.phase = Phase::Generating,
        }

        if let Some(token) = self.lookahead.take() {
            return self.feed_lookahead(token, cursor);
        }

        let token = match self.sample() {
            Ok(token) => token,
            Err(e) => {
                tracing::error!(session = %self.session.id(), "No token to sample: {e}");
                return Ok(self.stop(StopSignal::EndOfGeneration, cursor));
            }
        };

        self.session.record_output();
        let relative = self.session.relative_position(cursor);

        if self.is_terminal(token) {
            tracing::debug!("Detected end of generation token: {token}");
            return Ok(self.stop(StopSignal::EndOfGeneration, cursor));
        }
        if relative >= self.target_length {
            tracing::debug!("Max tokens reached: {relative} >= {}", self.target_length);
            return Ok(self.stop(StopSignal::MaxLengthReached, cursor));
        }
        if self.policy.is_stop_token(token) {
            return Ok(self.stop(StopSignal::SyntheticStop, cursor));
        }

        let piece = self.piece(token);
        let mut chunk = String::new();
        let mut fed = false;

        match self.utf8.feed(&piece) {
            Feed::Emit(text) => chunk = text,
            Feed::Discarded => {}
            Feed::NeedMore if self.can_look_ahead(relative) => {
                fed = true;
                if let Some(next) = self.look_ahead(token, cursor)? {
                    if self.is_feedable(next) {
                        let next_piece = self.piece(next);
                        if let Feed::Emit(text) = self.utf8.feed(&next_piece) {
                            chunk = self.hold_newline(text, relative);
                        }
                    }
                }
            }
            Feed::NeedMore => {}
        }

        if !fed && self.policy.should_peek(&piece) && self.can_look_ahead(relative) {
            return self.peek_turn(token, cursor, relative, chunk);
        }

        if !fed {
            self.advance(token, cursor)?;
        }

        Ok(self.output(chunk, StopSignal::None, cursor + 1))
    }

    /// Starts over with an empty cache and a batch sized for `context_capacity`.
    pub fn reset_session(&mut self, context_capacity: usize) -> Result<(), GenerationError> {
        let limit = self.engine.max_batch_width();
        if context_capacity.min(limit) != self.batch.capacity() || self.batch.is_released() {
            let batch = BatchBuffer::with_limit(context_capacity, 1, limit)?;
            self.batch = batch;
        } else {
            self.batch.clear();
        }

        self.clear_cache();
        self.session.reset(context_capacity);
        tracing::info!(session = %self.session.id(), "Session reset (n_ctx={context_capacity})");
        Ok(())
    }

    /// Empties the engine cache. The next call must be `init`.
    pub fn clear_cache(&mut self) {
        self.engine.clear_cache();
        self.utf8.clear();
        self.lookahead = None;
        self.logits_slot = None;
        self.held = None;
        self.cache_dirty = false;
        self.phase = Phase::Idle;
    }

    /// Feeds a token parked by the previous step.
    fn feed_lookahead(&mut self, token: TokenId, cursor: usize) -> Result<StepOutput, GenerationError> {
        let relative = self.session.relative_position(cursor);

        if self.is_terminal(token) {
            return Ok(self.stop(StopSignal::EndOfGeneration, cursor));
        }
        if self.policy.is_stop_token(token) {
            return Ok(self.stop(StopSignal::SyntheticStop, cursor));
        }
        if relative >= self.target_length {
            return Ok(self.stop(StopSignal::MaxLengthReached, cursor));
        }

        if let Some(held) = self.held.take() {
            return self.peek_turn(token, cursor, relative, held);
        }

        tracing::trace!("Feeding lookahead token {token} at {cursor}");
        self.advance(token, cursor)?;
        Ok(self.output(String::new(), StopSignal::None, cursor + 1))
    }

    /// Evaluates `token`, which ended a line, and looks at its successor.
    /// A role marker stops generation without emitting `chunk`.
    fn peek_turn(
        &mut self,
        token: TokenId,
        cursor: usize,
        relative: usize,
        mut chunk: String,
    ) -> Result<StepOutput, GenerationError> {
        if let Some(next) = self.look_ahead(token, cursor)? {
            if self.is_feedable(next) {
                let next_piece = self.piece(next);
                if self.policy.is_role_switch(&next_piece) {
                    tracing::debug!("Role marker follows newline, stopping");
                    return Ok(self.stop(StopSignal::SyntheticStop, cursor + 1));
                }
                if let Feed::Emit(text) = self.utf8.feed(&next_piece) {
                    chunk.push_str(&self.hold_newline(text, relative));
                }
            }
        }
        Ok(self.output(chunk, StopSignal::None, cursor + 1))
    }

    /// Text completed by a parked token skips the newline check of `step`.
    /// A trailing newline is held back so the next step can peek past the
    /// parked token, which sits at `relative + 1`.
    fn hold_newline(&mut self, mut text: String, relative: usize) -> String {
        if self.policy.should_peek(text.as_bytes()) && self.can_look_ahead(relative + 1) {
            text.pop();
            self.held = Some("\n".to_string());
        }
        text
    }

    /// Evaluates `token` now and samples its successor, parking it.
    fn look_ahead(&mut self, token: TokenId, cursor: usize) -> Result<Option<TokenId>, GenerationError> {
        self.advance(token, cursor)?;
        match self.sample() {
            Ok(next) => {
                self.session.record_lookahead();
                self.lookahead = Some(next);
                tracing::trace!("Lookahead after {token}: {next}");
                Ok(Some(next))
            }
            Err(e) => {
                tracing::warn!(session = %self.session.id(), "Lookahead sample failed: {e}");
                Ok(None)
            }
        }
    }

    /// Puts `token` at `cursor` into the batch and evaluates it. Engine
    /// failures are logged, not returned.
    fn advance(&mut self, token: TokenId, cursor: usize) -> Result<(), GenerationError> {
        self.batch.clear();
        self.batch.append(token, to_position(cursor)?, SEQ_ID, true)?;

        match self.engine.evaluate(&self.batch) {
            Ok(()) => self.logits_slot = self.batch.last_index(),
            Err(e) => tracing::warn!(
                session = %self.session.id(),
                "Decode failed at position {cursor}, continuing: {e}"
            ),
        }
        Ok(())
    }

    fn sample(&self) -> Result<TokenId, EngineError> {
        let slot = self.logits_slot.ok_or(EngineError::LogitsUnavailable(0))?;
        let logits = self.engine.logits(slot)?;
        greedy_argmax(logits).ok_or(EngineError::LogitsUnavailable(slot))
    }

    fn piece(&self, token: TokenId) -> Vec<u8> {
        match self.engine.token_to_piece(token) {
            Ok(piece) => piece,
            Err(e) => {
                tracing::warn!(session = %self.session.id(), "{e}");
                Vec::new()
            }
        }
    }

    fn is_terminal(&self, token: TokenId) -> bool {
        token == NULL_TOKEN || self.engine.is_end_of_generation(token)
    }

    /// Whether a parked token's text belongs in the output
    fn is_feedable(&self, token: TokenId) -> bool {
        !self.is_terminal(token) && !self.policy.is_stop_token(token)
    }

    /// A parked token occupies the next relative position; it must fit.
    fn can_look_ahead(&self, relative: usize) -> bool {
        relative + 1 < self.target_length
    }

    fn stop(&mut self, signal: StopSignal, cursor: usize) -> StepOutput {
        self.phase = Phase::Stopped(signal);
        self.lookahead = None;
        self.held = None;
        if self.utf8.has_pending() {
            tracing::debug!("Dropping {} incomplete bytes at stop", self.utf8.pending().len());
            self.utf8.clear();
        }

        let stats = self.session.stats();
        tracing::info!(
            session = %self.session.id(),
            "Generation stopped ({signal}): {} tokens, {:.1} tok/s, context {}/{}",
            stats.tokens_generated,
            stats.tokens_per_second,
            stats.context_used,
            stats.context_total
        );
        self.output(String::new(), signal, cursor)
    }

    fn output(&self, chunk: String, signal: StopSignal, cursor: usize) -> StepOutput {
        StepOutput {
            chunk,
            signal,
            cursor,
            pending_lookahead: self.lookahead,
        }
    }
}
