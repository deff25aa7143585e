//! Search hypotheses.

use crate::search::history::{LmHistory, StateHistory, WordHistory};
use crate::search::lattice::LatticeNodeRef;
use crate::search::pool::SlabPool;
use crate::types::NodeId;

/// A partial recognition hypothesis at one lexicon node in the current frame.
///
/// Cloning a token links every history it refers to; dropping it unlinks them.
#[derive(Clone, Debug)]
pub struct Token {
    pub node: NodeId,
    pub am_log_prob: f32,
    pub lm_log_prob: f32,
    /// Acoustic score used for pruning comparisons.
    pub cur_am_log_prob: f32,
    /// LM score used for pruning comparisons; includes lookahead inside words.
    pub cur_lm_log_prob: f32,
    pub total_log_prob: f32,
    /// Frames spent in the current state through self transitions.
    pub dur: u32,
    pub depth: u32,
    pub word_count: u32,
    pub lm_history: LmHistory,
    /// Hash of the recent LM words; only meaningful with an n-gram model.
    pub lm_hist_code: u32,
    /// Current FSA node; only meaningful with a finite-state model.
    pub fsa_lm_node: i32,
    pub word_history: Option<WordHistory>,
    pub state_history: Option<StateHistory>,
    /// Frame the current word's first state was entered, or -1.
    pub word_start_frame: i32,
    pub recent_lattice_node: Option<LatticeNodeRef>,
}

impl Token {
    /// Fresh token with zero scores and the given LM history.
    pub fn new(node: NodeId, lm_history: LmHistory) -> Self {
        Self {
            node,
            am_log_prob: 0.0,
            lm_log_prob: 0.0,
            cur_am_log_prob: 0.0,
            cur_lm_log_prob: 0.0,
            total_log_prob: 0.0,
            dur: 0,
            depth: 0,
            word_count: 0,
            lm_history,
            lm_hist_code: 0,
            fsa_lm_node: -1,
            word_history: None,
            state_history: None,
            word_start_frame: -1,
            recent_lattice_node: None,
        }
    }

    /// Most recent word of the LM history.
    pub fn last_word(&self) -> i32 {
        self.lm_history.word_id
    }
}

/// Combined score used for pruning and ranking.
pub fn token_log_prob(am_log_prob: f32, lm_log_prob: f32, lm_scale: f32) -> f32 {
    am_log_prob + lm_scale * lm_log_prob
}

/// Pool of live tokens.
pub type TokenPool = SlabPool<Token>;
