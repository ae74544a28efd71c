//! llmstream library
//!
//! Streams greedy completions out of a llama.cpp model, emitting only whole
//! UTF-8 characters.

pub mod inference;
pub mod storage;
