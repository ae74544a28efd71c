//! Inference engine boundary
//!
//! The controller only sees the engine through [`InferenceEngine`]. The
//! production implementation, [`LlamaCppEngine`], wraps a llama.cpp context
//! through `llama-cpp-2`.
//!
//! # Lifetimes
//!
//! A `LlamaContext` borrows the `LlamaModel` it was created from, so the
//! engine carries the model's lifetime. Neither type is `Send`; see
//! [`crate::inference::worker`] for how they are kept on one thread.

use std::num::NonZeroU32;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::token::LlamaToken;
use thiserror::Error;

use crate::inference::batch::{BatchBuffer, TokenId, MAX_STEP_WIDTH};

/// Errors that can occur during inference operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Backend not initialized")]
    BackendNotInitialized,

    #[error("No model loaded")]
    NoModelLoaded,

    #[error("Failed to initialize backend: {0}")]
    BackendInit(String),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Failed to create context: {0}")]
    ContextCreate(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Token {token} has no piece: {reason}")]
    Conversion { token: TokenId, reason: String },

    #[error("No logits for batch slot {0}")]
    LogitsUnavailable(usize),

    #[error("Worker thread error: {0}")]
    WorkerError(String),
}

/// The operations the generation controller needs from a model runtime.
pub trait InferenceEngine {
    /// Splits `text` into token ids
    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, EngineError>;

    /// Runs the model over `batch`, advancing the cache and producing logits
    /// for every slot that requested them.
    fn evaluate(&mut self, batch: &BatchBuffer) -> Result<(), EngineError>;

    /// Scores over the vocabulary for `slot` of the last evaluated batch
    fn logits(&self, slot: usize) -> Result<&[f32], EngineError>;

    /// Raw bytes of a token. May be a partial UTF-8 character.
    fn token_to_piece(&self, token: TokenId) -> Result<Vec<u8>, EngineError>;

    fn is_end_of_generation(&self, token: TokenId) -> bool;

    fn vocab_size(&self) -> usize;

    /// Tokens the cache can hold, prompt included
    fn context_capacity(&self) -> usize;

    /// Widest batch a single `evaluate` accepts
    fn max_batch_width(&self) -> usize {
        MAX_STEP_WIDTH
    }

    /// Forgets every evaluated token
    fn clear_cache(&mut self);
}

/// Context parameters for a [`LlamaCppEngine`]
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Context window size
    pub context_size: u32,
    /// Maximum tokens per decode call
    pub batch_size: u32,
    /// Threads for generation and prompt processing
    pub threads: i32,
    /// Prepend the model's BOS token when tokenizing
    pub add_bos: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            context_size: 2048,
            batch_size: MAX_STEP_WIDTH as u32,
            threads: 4,
            add_bos: true,
        }
    }
}

/// llama.cpp-backed engine over one context
pub struct LlamaCppEngine<'m> {
    model: &'m LlamaModel,
    ctx: LlamaContext<'m>,
    batch: LlamaBatch,
    add_bos: bool,
    /// Slot of the last successful decode that produced logits
    logits_slot: Option<i32>,
}

impl<'m> LlamaCppEngine<'m> {
    /// Creates a fresh context on `model`
    pub fn new(
        backend: &LlamaBackend,
        model: &'m LlamaModel,
        config: &EngineConfig,
    ) -> Result<Self, EngineError> {
        let n_ctx = NonZeroU32::new(config.context_size)
            .ok_or_else(|| EngineError::ContextCreate("context size must be non-zero".into()))?;
        let n_batch = config.batch_size.clamp(1, config.context_size);

        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_batch(n_batch)
            .with_n_threads(config.threads)
            .with_n_threads_batch(config.threads);

        let ctx = model
            .new_context(backend, ctx_params)
            .map_err(|e| EngineError::ContextCreate(e.to_string()))?;

        tracing::info!(
            "Created context: n_ctx={}, n_batch={}, threads={}",
            ctx.n_ctx(),
            n_batch,
            config.threads
        );

        Ok(Self {
            model,
            ctx,
            batch: LlamaBatch::new(n_batch as usize, 1),
            add_bos: config.add_bos,
            logits_slot: None,
        })
    }
}

impl InferenceEngine for LlamaCppEngine<'_> {
    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, EngineError> {
        let add_bos = if self.add_bos {
            AddBos::Always
        } else {
            AddBos::Never
        };
        let tokens = self
            .model
            .str_to_token(text, add_bos)
            .map_err(|e| EngineError::Tokenization(e.to_string()))?;
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    /// On failure the logits of the previous successful decode stay readable.
    fn evaluate(&mut self, batch: &BatchBuffer) -> Result<(), EngineError> {
        self.batch.clear();
        for slot in batch.slots() {
            self.batch
                .add(
                    LlamaToken::new(slot.token),
                    slot.position,
                    &[slot.seq_id],
                    slot.wants_logits,
                )
                .map_err(|e| EngineError::Decode(e.to_string()))?;
        }

        self.ctx
            .decode(&mut self.batch)
            .map_err(|e| EngineError::Decode(e.to_string()))?;

        self.logits_slot = batch
            .last_index()
            .filter(|&i| batch.wants_logits()[i])
            .and_then(|i| i32::try_from(i).ok());
        Ok(())
    }

    fn logits(&self, slot: usize) -> Result<&[f32], EngineError> {
        match self.logits_slot {
            Some(ready) if usize::try_from(ready).ok() == Some(slot) => {
                Ok(self.ctx.get_logits_ith(ready))
            }
            _ => Err(EngineError::LogitsUnavailable(slot)),
        }
    }

    fn token_to_piece(&self, token: TokenId) -> Result<Vec<u8>, EngineError> {
        self.model
            .token_to_bytes(LlamaToken::new(token), Special::Tokenize)
            .map_err(|e| EngineError::Conversion {
                token,
                reason: e.to_string(),
            })
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        self.model.is_eog_token(LlamaToken::new(token))
    }

    fn vocab_size(&self) -> usize {
        usize::try_from(self.model.n_vocab()).unwrap_or(0)
    }

    fn context_capacity(&self) -> usize {
        self.ctx.n_ctx() as usize
    }

    fn max_batch_width(&self) -> usize {
        self.ctx.n_batch() as usize
    }

    fn clear_cache(&mut self) {
        self.ctx.clear_kv_cache();
        self.logits_slot = None;
        tracing::debug!("KV cache cleared");
    }
}
