//! Stop-phrase policy
//!
//! Chat models often keep going past their turn and start writing the next
//! speaker's line. Which token ids and which role labels mark that boundary
//! depends on the vocabulary and the prompt format, so they are supplied per
//! model instead of being fixed here.

use crate::inference::batch::TokenId;

/// Vocabulary-specific rules for ending a response early
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopPolicy {
    /// Text that opens another speaker's turn, e.g. `"User"`
    pub role_markers: Vec<String>,
    /// Token ids that end the turn outright, e.g. a dedicated double-newline token
    pub stop_token_ids: Vec<TokenId>,
}

impl StopPolicy {
    pub fn new(role_markers: Vec<String>, stop_token_ids: Vec<TokenId>) -> Self {
        let role_markers = role_markers
            .into_iter()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();
        Self {
            role_markers,
            stop_token_ids,
        }
    }

    pub fn is_stop_token(&self, token: TokenId) -> bool {
        self.stop_token_ids.contains(&token)
    }

    /// Whether the token after `piece` has to be inspected before `piece` may
    /// be emitted. Only newline-terminated pieces qualify.
    pub fn should_peek(&self, piece: &[u8]) -> bool {
        !self.role_markers.is_empty() && is_newline_piece(piece)
    }

    /// Whether `next_piece` opens another speaker's turn.
    pub fn is_role_switch(&self, next_piece: &[u8]) -> bool {
        let text = String::from_utf8_lossy(next_piece);
        let text = text.trim_start();
        !text.is_empty()
            && self
                .role_markers
                .iter()
                .any(|marker| text.starts_with(marker.as_str()))
    }
}

/// A piece ending in a line feed
pub fn is_newline_piece(piece: &[u8]) -> bool {
    piece.last() == Some(&b'\n')
}
