//! Context-window fitting.
//!
//! Before dispatching to a model, the conversation is trimmed to its context
//! window by dropping the oldest non-system messages. Token counts are the
//! chars/4 estimate used everywhere budget accounting lacks provider usage;
//! one separator character is counted per adjacent message pair.

use crate::api::models::{ChatMessage, Role};

/// Result of fitting a conversation into a context window.
#[derive(Debug, Clone, PartialEq)]
pub struct FitResult {
    pub messages: Vec<ChatMessage>,
    pub trimmed: usize,
}

/// Estimated prompt tokens for a message list plus the reserved output.
pub fn estimate_request_tokens(messages: &[ChatMessage], max_output_tokens: u32) -> u64 {
    let content_chars: u64 = messages
        .iter()
        .map(|m| m.content.chars().count() as u64)
        .sum();
    let separator_chars = messages.len().saturating_sub(1) as u64;
    (content_chars + separator_chars).div_ceil(4) + max_output_tokens as u64
}

/// Trim the oldest non-system messages until the conversation fits
/// `context_tokens`.
///
/// Returns `None` when no non-system message remains to drop and the
/// conversation still does not fit; the caller records a permanent outcome
/// and skips the model.
pub fn fit(
    messages: &[ChatMessage],
    context_tokens: u32,
    max_output_tokens: u32,
) -> Option<FitResult> {
    let mut fitted: Vec<ChatMessage> = messages.to_vec();
    let mut trimmed = 0usize;

    loop {
        let fits = estimate_request_tokens(&fitted, max_output_tokens) <= context_tokens as u64;
        // An emptied conversation is not a fit, even if its estimate is.
        if fits && (trimmed == 0 || !fitted.is_empty()) {
            return Some(FitResult {
                messages: fitted,
                trimmed,
            });
        }

        let Some(index) = fitted.iter().position(|m| m.role != Role::System) else {
            return None;
        };
        fitted.remove(index);
        trimmed += 1;
    }
}
