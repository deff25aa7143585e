//! Collaborator interfaces consumed by the search.
//!
//! Acoustic scoring, language-model storage and vocabulary interning live
//! outside this crate; the search only sees them through these traits.

use crate::constants::cache::LOOKAHEAD_FLOOR;
use crate::types::WordId;

/// Per-frame acoustic observation scores.
pub trait AcousticModel {
    /// Move to `frame`. Returns false when there is no such frame (end of input).
    fn advance_to(&mut self, frame: usize) -> bool;

    /// Observation log-probability of `state_model` at `frame`.
    fn log_prob(&self, state_model: u32, frame: usize) -> f32;
}

/// N-gram language model.
///
/// Word ids passed in and out are the model's own ids, not vocabulary ids.
pub trait NgramModel {
    /// Model id of `word`, or `None` if the model does not know it.
    fn word_index(&self, word: &str) -> Option<i32>;

    /// Model order, e.g. 3 for a trigram model. 0 disables scoring.
    fn order(&self) -> usize;

    /// Log-probability of the last id of `context` given the ones before it.
    /// Ids are ordered oldest first.
    fn log_prob(&self, context: &[i32]) -> f32;

    /// Fill `scores[w]` with `P(lex2lm[w] | prev)` for every vocabulary word `w`.
    fn fetch_bigram_list(&self, prev: i32, lex2lm: &[i32], scores: &mut [f32]) {
        for (score, &lm_id) in scores.iter_mut().zip(lex2lm) {
            *score = if prev < 0 || lm_id < 0 {
                LOOKAHEAD_FLOOR
            } else {
                self.log_prob(&[prev, lm_id])
            };
        }
    }

    /// Fill `scores[w]` with `P(lex2lm[w] | w1 w2)` for every vocabulary word `w`.
    fn fetch_trigram_list(&self, w1: i32, w2: i32, lex2lm: &[i32], scores: &mut [f32]) {
        for (score, &lm_id) in scores.iter_mut().zip(lex2lm) {
            *score = if w1 < 0 || w2 < 0 || lm_id < 0 {
                LOOKAHEAD_FLOOR
            } else {
                self.log_prob(&[w1, w2, lm_id])
            };
        }
    }
}

/// Finite-state language model.
pub trait FsaLanguageModel {
    /// Start node of the automaton.
    fn initial_node(&self) -> i32;

    /// Follow `symbol` from `node`, returning the destination node and the
    /// log-probability of the transition.
    fn walk(&self, node: i32, symbol: i32) -> (i32, f32);

    /// Symbol id of `word`, or `None` if the automaton does not know it.
    fn symbol_index(&self, word: &str) -> Option<i32>;
}

/// Word strings of the lexicon vocabulary.
pub trait Vocabulary {
    /// Number of words. Valid ids are `0..num_words()`.
    fn num_words(&self) -> usize;

    /// Surface form of `id`.
    fn word(&self, id: WordId) -> &str;

    /// Id of `word`, or `None` if it is not in the vocabulary.
    fn word_index(&self, word: &str) -> Option<WordId>;
}
