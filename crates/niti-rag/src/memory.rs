//! Per-session conversation memory.

use std::collections::VecDeque;

use crate::types::ConversationTurn;

/// Bounded turn history for one session. Once full, recording a new turn
/// evicts the oldest one.
#[derive(Debug)]
pub struct ConversationMemory {
    turns: VecDeque<ConversationTurn>,
    max_turns: usize,
}

impl ConversationMemory {
    pub fn new(max_turns: usize) -> Self {
        let max_turns = max_turns.max(1);
        Self {
            turns: VecDeque::with_capacity(max_turns),
            max_turns,
        }
    }

    pub fn record(&mut self, turn: ConversationTurn) {
        if self.turns.len() == self.max_turns {
            self.turns.pop_front();
        }
        self.turns.push_back(turn);
    }

    /// Chronological copy of the buffer. Taken once per query so no lock
    /// is held while retrieval and generation run.
    pub fn snapshot(&self) -> Vec<ConversationTurn> {
        self.turns.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}
