//! Strong typing for search handles and recognition results.
//!
//! Word ids stay plain `i32` because `-1` is a meaningful "no word" marker
//! shared with the language-model collaborators.

use serde::{Deserialize, Serialize};

/// Vocabulary word id. Negative values mean "no word".
pub type WordId = i32;

/// Index of a node in the lexicon tree.
pub type NodeId = usize;

/// Handle of a live token inside the token pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TokenId(pub usize);

impl TokenId {
    /// Get the slot index.
    pub fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for TokenId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "token#{}", self.0)
    }
}

/// One recognized word on a result path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizedWord {
    /// Vocabulary id.
    pub word_id: WordId,
    /// Surface form.
    pub word: String,
    /// Frame the word's first state was entered, or -1 if unknown.
    pub start_frame: i32,
}

/// Final result of decoding one utterance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recognition {
    /// Recognized words in time order, sentence markers included.
    pub words: Vec<RecognizedWord>,
    /// Cumulative acoustic log-probability of the result token.
    pub am_log_prob: f32,
    /// Cumulative language-model log-probability of the result token.
    pub lm_log_prob: f32,
    /// Combined score, `am + lm_scale * lm`.
    pub total_log_prob: f32,
    /// False when no token ended in a final lexicon node.
    pub complete: bool,
}

impl Recognition {
    /// Space-separated surface forms.
    pub fn text(&self) -> String {
        self.words
            .iter()
            .map(|w| w.word.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// One acoustic-state segment of the best path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSpan {
    /// First frame spent in the state.
    pub start_frame: i32,
    /// One past the last frame spent in the state.
    pub end_frame: i32,
    /// Acoustic model index of the state.
    pub model: u32,
}

impl std::fmt::Display for StateSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.start_frame, self.end_frame, self.model)
    }
}
