//! Shared, append-only history chains.
//!
//! Every token owns handles to three back-linked chains: recognized words for
//! LM scoring, word segments for lattice building, and acoustic states for
//! segmentation output. Tokens that share a past share the nodes of that past.
//!
//! A [`History`] handle is one reference. Cloning it links the node, dropping
//! it unlinks it, and the last unlink frees the node and unlinks its
//! predecessor. Nodes are never mutated after creation apart from the
//! idempotent printed flag (and the first-silence frame of an LM word).

use std::cell::Cell;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::constants::search::NO_WORD;
use crate::types::WordId;

struct HistoryNode<P> {
    payload: P,
    previous: Option<History<P>>,
    printed: Cell<bool>,
}

/// Reference-counted handle to the newest node of a history chain.
pub struct History<P>(Rc<HistoryNode<P>>);

impl<P> History<P> {
    /// Start a new chain.
    pub fn root(payload: P) -> Self {
        Self(Rc::new(HistoryNode {
            payload,
            previous: None,
            printed: Cell::new(false),
        }))
    }

    /// Create a node on top of `previous`. The returned handle is the
    /// caller's only reference to it; `previous` is linked once more.
    pub fn append(payload: P, previous: &History<P>) -> Self {
        Self(Rc::new(HistoryNode {
            payload,
            previous: Some(previous.clone()),
            printed: Cell::new(false),
        }))
    }

    pub fn payload(&self) -> &P {
        &self.0.payload
    }

    pub fn previous(&self) -> Option<&History<P>> {
        self.0.previous.as_ref()
    }

    /// Number of handles (tokens and successor nodes) referring to this node.
    pub fn reference_count(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }

    pub fn is_printed(&self) -> bool {
        self.0.printed.get()
    }

    pub fn mark_printed(&self) {
        self.0.printed.set(true);
    }

    /// Walk from this node back to the root.
    pub fn iter(&self) -> HistoryIter<'_, P> {
        HistoryIter { next: Some(self) }
    }

    /// Non-owning observer, used to check that a node has been freed.
    pub fn downgrade(&self) -> WeakHistory<P> {
        WeakHistory(Rc::downgrade(&self.0))
    }
}

impl<P> Clone for History<P> {
    fn clone(&self) -> Self {
        Self(Rc::clone(&self.0))
    }
}

impl<P> std::ops::Deref for History<P> {
    type Target = P;

    fn deref(&self) -> &P {
        &self.0.payload
    }
}

impl<P: fmt::Debug> fmt::Debug for History<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter().map(History::payload)).finish()
    }
}

impl<P> Drop for HistoryNode<P> {
    // Unlink the chain iteratively; long utterances build chains far deeper
    // than the call stack allows.
    fn drop(&mut self) {
        let mut previous = self.previous.take();
        while let Some(History(rc)) = previous {
            match Rc::try_unwrap(rc) {
                Ok(mut node) => previous = node.previous.take(),
                Err(_) => break,
            }
        }
    }
}

/// Iterator over a chain, newest first.
pub struct HistoryIter<'a, P> {
    next: Option<&'a History<P>>,
}

impl<'a, P> Iterator for HistoryIter<'a, P> {
    type Item = &'a History<P>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.previous();
        Some(current)
    }
}

/// Weak observer of a history node.
pub struct WeakHistory<P>(Weak<HistoryNode<P>>);

impl<P> WeakHistory<P> {
    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

/// A word in the LM history.
#[derive(Debug)]
pub struct LmWord {
    /// Vocabulary id, [`NO_WORD`] for the chain root.
    pub word_id: WordId,
    /// Id in the active language model (n-gram word or FSA symbol).
    pub lm_id: i32,
    /// Frame the word's first state was entered.
    pub word_start_frame: i32,
    word_first_silence_frame: Cell<i32>,
}

impl LmWord {
    pub fn new(word_id: WordId, lm_id: i32, word_start_frame: i32) -> Self {
        Self {
            word_id,
            lm_id,
            word_start_frame,
            word_first_silence_frame: Cell::new(-1),
        }
    }

    /// Chain root payload.
    pub fn root() -> Self {
        Self::new(NO_WORD, NO_WORD, -1)
    }

    /// First frame a silence state was entered after this word, or -1.
    pub fn word_first_silence_frame(&self) -> i32 {
        self.word_first_silence_frame.get()
    }

    /// Record the first silence frame. Later calls are ignored.
    pub fn note_silence(&self, frame: i32) {
        if self.word_first_silence_frame.get() == -1 {
            self.word_first_silence_frame.set(frame);
        }
    }
}

/// A completed word on a token's path, with the scores accrued for it.
#[derive(Debug, Clone, PartialEq)]
pub struct WordSegment {
    pub word_id: WordId,
    pub end_frame: i32,
    /// Lexicon node the token was in when the segment was closed.
    pub lex_node_id: usize,
    /// Acoustic score of this word alone.
    pub am_log_prob: f32,
    /// LM score of this word alone.
    pub lm_log_prob: f32,
    pub cum_am_log_prob: f32,
    pub cum_lm_log_prob: f32,
}

impl WordSegment {
    /// Chain root payload at the given lexicon node.
    pub fn root(lex_node_id: usize) -> Self {
        Self {
            word_id: NO_WORD,
            end_frame: -1,
            lex_node_id,
            am_log_prob: 0.0,
            lm_log_prob: 0.0,
            cum_am_log_prob: 0.0,
            cum_lm_log_prob: 0.0,
        }
    }

    /// Segment ending at `end_frame` with the given cumulative scores; the
    /// per-word scores are the difference to `previous`.
    pub fn closing(
        word_id: WordId,
        end_frame: i32,
        lex_node_id: usize,
        cum_am_log_prob: f32,
        cum_lm_log_prob: f32,
        previous: &WordSegment,
    ) -> Self {
        Self {
            word_id,
            end_frame,
            lex_node_id,
            am_log_prob: cum_am_log_prob - previous.cum_am_log_prob,
            lm_log_prob: cum_lm_log_prob - previous.cum_lm_log_prob,
            cum_am_log_prob,
            cum_lm_log_prob,
        }
    }
}

/// An acoustic state entered by a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSegment {
    pub hmm_model: u32,
    pub start_frame: i32,
}

pub type LmHistory = History<LmWord>;
pub type WordHistory = History<WordSegment>;
pub type StateHistory = History<StateSegment>;
