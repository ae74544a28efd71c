//! Greedy token selection

use crate::inference::batch::TokenId;

/// Index of the highest logit. Ties go to the lowest token id and NaN scores
/// are never selected. `None` for an empty or all-NaN slice.
pub fn greedy_argmax(logits: &[f32]) -> Option<TokenId> {
    let mut best: Option<(usize, f32)> = None;
    for (id, &score) in logits.iter().enumerate() {
        if score.is_nan() {
            continue;
        }
        match best {
            Some((_, top)) if score <= top => {}
            _ => best = Some((id, score)),
        }
    }
    best.and_then(|(id, _)| TokenId::try_from(id).ok())
}
