//! Streaming text generation
//!
//! This module drives a llama.cpp model one token at a time and turns the
//! result into complete UTF-8 text chunks.

pub mod batch;
pub mod controller;
pub mod engine;
pub mod sampling;
pub mod session;
pub mod stop;
pub mod streaming;
pub mod utf8;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types for convenience
pub use batch::{BatchBuffer, BatchError, TokenId};
pub use controller::{GenerationController, GenerationError, Phase};
pub use engine::{EngineConfig, EngineError, InferenceEngine, LlamaCppEngine};
pub use stop::StopPolicy;
pub use streaming::{StepOutput, StopSignal, StreamToken};
pub use worker::{stream, GenerationParams, GenerationWorker, LoadedModelInfo};
