//! Context window assembly.
//!
//! Given a session's accumulated turns, select the subset that fits a
//! token budget: one synthesized system turn first, then the most recent
//! turns in chronological order. Token costs are a heuristic cap, not an
//! accounting guarantee.

use std::collections::VecDeque;

use palaver_core::{SessionId, Turn, TurnRole};
use serde::{Deserialize, Serialize};

/// Rough token estimate, approximately 4 characters per token.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Context window configuration: the budget and the persona instruction
/// that always heads the prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextWindow {
    pub token_budget: usize,
    pub system_prompt: String,
}

impl ContextWindow {
    pub fn new(token_budget: usize, system_prompt: impl Into<String>) -> Self {
        Self {
            token_budget,
            system_prompt: system_prompt.into(),
        }
    }

    /// Build the prompt sent upstream.
    ///
    /// The synthesized system turn is always included and counted against
    /// the budget. The walk then goes newest to oldest, skipping any
    /// system turns already in the history, and stops at the first turn
    /// that would exceed the budget. The result is chronological with the
    /// system turn first; empty history yields just the system turn.
    pub fn fit(&self, turns: &[Turn]) -> Vec<Turn> {
        let session_id = turns
            .first()
            .map_or_else(SessionId::nil, |turn| turn.session_id);
        let system = Turn::system(self.system_prompt.clone(), session_id);

        let mut used = estimate_tokens(&self.system_prompt);
        let mut kept: VecDeque<Turn> = VecDeque::new();

        for turn in turns.iter().rev() {
            if turn.role == TurnRole::System {
                continue;
            }
            let cost = estimate_tokens(&turn.text);
            if used + cost > self.token_budget {
                break;
            }
            used += cost;
            kept.push_front(turn.clone());
        }

        let mut context = Vec::with_capacity(kept.len() + 1);
        context.push(system);
        context.extend(kept);
        context
    }
}

impl Default for ContextWindow {
    fn default() -> Self {
        Self {
            token_budget: 4096,
            system_prompt: "You are a helpful assistant.".to_string(),
        }
    }
}
