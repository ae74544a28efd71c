//! Scripted engine for controller tests
//!
//! Replays a fixed token sequence: the logits after the prompt point at
//! `script[0]`, after the next successful decode that requests logits at
//! `script[1]`, and so on. A failed decode leaves the previous logits in
//! place. Every evaluated batch is recorded.

use std::collections::HashMap;

use crate::inference::batch::{BatchBuffer, BatchSlot, TokenId};
use crate::inference::engine::{EngineError, InferenceEngine};

pub(crate) const EOG: TokenId = 2;
pub(crate) const UNKNOWN: TokenId = 99;

pub(crate) struct ScriptedEngine {
    prompt: Vec<TokenId>,
    script: Vec<TokenId>,
    pieces: HashMap<TokenId, Vec<u8>>,
    vocab_size: usize,
    context: usize,
    max_width: usize,
    logits: Vec<f32>,
    logits_slot: Option<usize>,
    decoded: usize,
    pub evaluations: Vec<Vec<BatchSlot>>,
    pub fail_evaluations: Vec<usize>,
    pub cache_clears: usize,
}

impl ScriptedEngine {
    /// `prompt` is what any non-empty text tokenizes to; `script` is the
    /// sequence the model produces. Pieces are registered with `piece`.
    pub fn new(prompt: Vec<TokenId>, script: Vec<TokenId>) -> Self {
        let mut pieces = HashMap::new();
        pieces.insert(EOG, b"</s>".to_vec());
        Self {
            prompt,
            script,
            pieces,
            vocab_size: 100,
            context: 64,
            max_width: 512,
            logits: Vec::new(),
            logits_slot: None,
            decoded: 0,
            evaluations: Vec::new(),
            fail_evaluations: Vec::new(),
            cache_clears: 0,
        }
    }

    pub fn piece(mut self, token: TokenId, bytes: &[u8]) -> Self {
        self.pieces.insert(token, bytes.to_vec());
        self
    }

    pub fn context(mut self, context: usize) -> Self {
        self.context = context;
        self
    }

    pub fn max_width(mut self, width: usize) -> Self {
        self.max_width = width;
        self
    }

    /// Fails the evaluation with this zero-based call index
    pub fn fail_evaluation(mut self, index: usize) -> Self {
        self.fail_evaluations.push(index);
        self
    }

    /// Tokens fed one at a time after the prompt, in order
    pub fn fed_tokens(&self) -> Vec<TokenId> {
        self.evaluations
            .iter()
            .skip(1)
            .flat_map(|slots| slots.iter().map(|s| s.token))
            .collect()
    }

    /// Concatenated pieces of `tokens`, decoded in one go
    pub fn detokenize(&self, tokens: &[TokenId]) -> String {
        let bytes: Vec<u8> = tokens
            .iter()
            .flat_map(|t| self.pieces.get(t).cloned().unwrap_or_default())
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl InferenceEngine for ScriptedEngine {
    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, EngineError> {
        if text.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.prompt.clone())
    }

    fn evaluate(&mut self, batch: &BatchBuffer) -> Result<(), EngineError> {
        let call = self.evaluations.len();
        self.evaluations.push(batch.slots().collect());
        if self.fail_evaluations.contains(&call) {
            return Err(EngineError::Decode(format!("scripted failure {call}")));
        }

        self.logits_slot = batch.last_index().filter(|&i| batch.wants_logits()[i]);
        if self.logits_slot.is_some() {
            let next = self.script.get(self.decoded).copied().unwrap_or(EOG);
            self.decoded += 1;
            self.logits = vec![0.0; self.vocab_size];
            self.logits[next as usize] = 1.0;
        }
        Ok(())
    }

    fn logits(&self, slot: usize) -> Result<&[f32], EngineError> {
        match self.logits_slot {
            Some(ready) if ready == slot => Ok(&self.logits),
            _ => Err(EngineError::LogitsUnavailable(slot)),
        }
    }

    fn token_to_piece(&self, token: TokenId) -> Result<Vec<u8>, EngineError> {
        self.pieces
            .get(&token)
            .cloned()
            .ok_or_else(|| EngineError::Conversion {
                token,
                reason: "not in vocabulary".to_string(),
            })
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == EOG
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn context_capacity(&self) -> usize {
        self.context
    }

    fn max_batch_width(&self) -> usize {
        self.max_width
    }

    fn clear_cache(&mut self) {
        self.cache_clears += 1;
        self.logits_slot = None;
    }
}
