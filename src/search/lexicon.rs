//! Lexicon prefix tree as seen by the search.
//!
//! The tree is built elsewhere; this module only fixes its data shape. Nodes
//! either carry an HMM state (and consume a frame) or are epsilon nodes that
//! are passed through within the same frame.

use std::ops::{BitOr, BitOrAssign};

use crate::constants::search::NO_WORD;
use crate::types::{NodeId, WordId};

/// Per-node flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NodeFlags(u32);

impl NodeFlags {
    pub const NONE: Self = Self(0);
    /// A hypothesis may end here.
    pub const FINAL: Self = Self(1);
    /// Node where many word ends merge back into the tree.
    pub const FAN_IN: Self = Self(1 << 1);
    /// Node where the tree fans out into word beginnings.
    pub const FAN_OUT: Self = Self(1 << 2);
    /// A word-boundary word may be inserted after this node.
    pub const INSERT_WORD_BOUNDARY: Self = Self(1 << 3);
    /// First acoustic state of a word.
    pub const FIRST_STATE_OF_WORD: Self = Self(1 << 4);
    /// Node lies after the word id node of its word.
    pub const AFTER_WORD_ID: Self = Self(1 << 5);
    /// Tokens here are pruned with the word-end beam.
    pub const USE_WORD_END_BEAM: Self = Self(1 << 6);
    /// First state of a silence model.
    pub const SILENCE_FIRST: Self = Self(1 << 7);
    /// First state of a fan-in section.
    pub const FAN_IN_FIRST: Self = Self(1 << 8);

    pub fn bits(self) -> u32 {
        self.0
    }

    /// True if any of the bits of `other` are set.
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// True if all of the bits of `other` are set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for NodeFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for NodeFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// State duration model as a table of log-probabilities indexed by duration.
///
/// Durations past the end of the table reuse the last entry. An empty table
/// is not a valid model and scores every duration as 0.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DurationModel {
    log_probs: Vec<f32>,
}

impl DurationModel {
    pub fn new(log_probs: Vec<f32>) -> Self {
        Self { log_probs }
    }

    pub fn is_valid(&self) -> bool {
        !self.log_probs.is_empty()
    }

    pub fn log_prob(&self, duration: u32) -> f32 {
        match self.log_probs.len() {
            0 => 0.0,
            n => self.log_probs[(duration as usize).min(n - 1)],
        }
    }
}

/// Acoustic state attached to a lexicon node.
#[derive(Debug, Clone, PartialEq)]
pub struct HmmState {
    /// Acoustic model index passed to [`AcousticModel::log_prob`](crate::search::traits::AcousticModel::log_prob).
    pub model: u32,
    pub duration: DurationModel,
}

impl HmmState {
    pub fn new(model: u32) -> Self {
        Self {
            model,
            duration: DurationModel::default(),
        }
    }

    pub fn with_duration(mut self, duration: DurationModel) -> Self {
        self.duration = duration;
        self
    }
}

/// Transition to another node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LexArc {
    pub target: NodeId,
    pub log_prob: f32,
}

/// One node of the lexicon tree.
#[derive(Debug, Clone, PartialEq)]
pub struct LexNode {
    pub id: NodeId,
    /// Word completed by entering this node, or [`NO_WORD`].
    pub word_id: WordId,
    pub flags: NodeFlags,
    pub state: Option<HmmState>,
    pub arcs: Vec<LexArc>,
    /// Words still reachable from this node, used by LM lookahead.
    pub possible_word_ids: Vec<WordId>,
}

impl LexNode {
    /// An epsilon node without word id.
    pub fn new() -> Self {
        Self {
            id: 0,
            word_id: NO_WORD,
            flags: NodeFlags::NONE,
            state: None,
            arcs: Vec::new(),
            possible_word_ids: Vec::new(),
        }
    }

    pub fn with_state(mut self, state: HmmState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_word(mut self, word_id: WordId) -> Self {
        self.word_id = word_id;
        self
    }

    pub fn with_flags(mut self, flags: NodeFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_possible_words(mut self, words: Vec<WordId>) -> Self {
        self.possible_word_ids = words;
        self
    }

    pub fn has_flag(&self, flags: NodeFlags) -> bool {
        self.flags.intersects(flags)
    }
}

impl Default for LexNode {
    fn default() -> Self {
        Self::new()
    }
}

/// The lexicon prefix tree.
#[derive(Debug, Clone)]
pub struct LexiconTree {
    nodes: Vec<LexNode>,
    root: NodeId,
    start_node: NodeId,
    words: usize,
}

impl LexiconTree {
    /// Empty tree over a vocabulary of `words` words.
    pub fn new(words: usize) -> Self {
        Self {
            nodes: Vec::new(),
            root: 0,
            start_node: 0,
            words,
        }
    }

    /// Add a node and return its id. The first node added is the root and start node.
    pub fn add_node(&mut self, mut node: LexNode) -> NodeId {
        let id = self.nodes.len();
        node.id = id;
        self.nodes.push(node);
        id
    }

    /// Add a transition. Panics if `from` does not exist.
    pub fn add_arc(&mut self, from: NodeId, to: NodeId, log_prob: f32) {
        self.nodes[from].arcs.push(LexArc { target: to, log_prob });
    }

    pub fn set_root(&mut self, root: NodeId) {
        self.root = root;
    }

    /// Node the initial token is placed in.
    pub fn set_start_node(&mut self, node: NodeId) {
        self.start_node = node;
    }

    pub fn node(&self, id: NodeId) -> &LexNode {
        &self.nodes[id]
    }

    pub fn nodes(&self) -> &[LexNode] {
        &self.nodes
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn start_node(&self) -> NodeId {
        self.start_node
    }

    /// Vocabulary size the tree was built for.
    pub fn words(&self) -> usize {
        self.words
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// True if any node carries one of `flags`.
    pub fn any_node_has(&self, flags: NodeFlags) -> bool {
        self.nodes.iter().any(|n| n.has_flag(flags))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let flags = NodeFlags::FINAL | NodeFlags::FAN_IN;
        assert!(flags.contains(NodeFlags::FINAL));
        assert!(flags.intersects(NodeFlags::FAN_IN | NodeFlags::FAN_OUT));
        assert!(!flags.contains(NodeFlags::FAN_IN | NodeFlags::FAN_OUT));
        assert!(!NodeFlags::NONE.intersects(NodeFlags::FINAL));
    }

    #[test]
    fn test_duration_model() {
        let model = DurationModel::new(vec![-5.0, -1.0, -2.0]);
        assert!(model.is_valid());
        assert_eq!(model.log_prob(1), -1.0);
        assert_eq!(model.log_prob(10), -2.0);
        assert!(!DurationModel::default().is_valid());
        assert_eq!(DurationModel::default().log_prob(3), 0.0);
    }

    #[test]
    fn test_tree_construction() {
        let mut tree = LexiconTree::new(3);
        let root = tree.add_node(LexNode::new());
        let state = tree.add_node(
            LexNode::new()
                .with_state(HmmState::new(7))
                .with_flags(NodeFlags::FIRST_STATE_OF_WORD)
                .with_possible_words(vec![1, 2]),
        );
        tree.add_arc(root, state, -0.5);
        tree.add_arc(state, state, -0.1);

        assert_eq!(tree.len(), 2);
        assert_eq!(tree.node(state).id, state);
        assert_eq!(tree.node(root).arcs[0].target, state);
        assert_eq!(tree.node(state).state.as_ref().map(|s| s.model), Some(7));
        assert!(tree.any_node_has(NodeFlags::FIRST_STATE_OF_WORD));
        assert!(!tree.any_node_has(NodeFlags::INSERT_WORD_BOUNDARY));
    }
}
