//! Shared fixtures: a two-word loop lexicon with silence, table-driven
//! acoustics and toy language models.

#![allow(dead_code)]

use std::cell::Cell;
use std::collections::HashMap;

use tokenpass_decoder::search::{
    AcousticModel, FsaLanguageModel, History, HmmState, LexNode, LexiconTree, NgramModel, NodeFlags, WordList,
};
use tokenpass_decoder::SearchConfig;

pub const SIL_MODEL: u32 = 0;
pub const YES_MODEL: u32 = 1;
pub const NO_MODEL: u32 = 2;

pub const SENTENCE_START: i32 = 1;
pub const SENTENCE_END: i32 = 2;
pub const YES: i32 = 3;
pub const NO: i32 = 4;
pub const BOUNDARY: i32 = 5;

pub fn vocabulary() -> WordList {
    WordList::new(["<unk>", "<s>", "</s>", "yes", "no", "<w>"])
}

/// root -> first state of each word (self loop) -> word-id node -> silence
/// (final, self loop) -> root.
pub struct ToyLexicon {
    pub tree: LexiconTree,
    pub root: usize,
    pub yes_state: usize,
    pub no_state: usize,
    pub yes_word: usize,
    pub no_word: usize,
    pub silence: usize,
}

pub fn lexicon(extra_silence_flags: NodeFlags) -> ToyLexicon {
    let mut tree = LexiconTree::new(6);
    let root = tree.add_node(LexNode::new().with_possible_words(vec![YES, NO]));
    let yes_state = tree.add_node(
        LexNode::new()
            .with_state(HmmState::new(YES_MODEL))
            .with_flags(NodeFlags::FIRST_STATE_OF_WORD)
            .with_possible_words(vec![YES]),
    );
    let no_state = tree.add_node(
        LexNode::new()
            .with_state(HmmState::new(NO_MODEL))
            .with_flags(NodeFlags::FIRST_STATE_OF_WORD)
            .with_possible_words(vec![NO]),
    );
    let yes_word = tree.add_node(LexNode::new().with_word(YES));
    let no_word = tree.add_node(LexNode::new().with_word(NO));
    let silence = tree.add_node(
        LexNode::new()
            .with_state(HmmState::new(SIL_MODEL))
            .with_flags(NodeFlags::FINAL | NodeFlags::SILENCE_FIRST | extra_silence_flags),
    );

    tree.add_arc(root, yes_state, 0.0);
    tree.add_arc(root, no_state, 0.0);
    tree.add_arc(yes_state, yes_state, 0.0);
    tree.add_arc(yes_state, yes_word, 0.0);
    tree.add_arc(no_state, no_state, 0.0);
    tree.add_arc(no_state, no_word, 0.0);
    tree.add_arc(yes_word, silence, 0.0);
    tree.add_arc(no_word, silence, 0.0);
    tree.add_arc(silence, silence, 0.0);
    tree.add_arc(silence, root, 0.0);
    tree.set_root(root);
    tree.set_start_node(root);

    ToyLexicon {
        tree,
        root,
        yes_state,
        no_state,
        yes_word,
        no_word,
        silence,
    }
}

/// Observation scores indexed by frame, then by state model.
pub struct TableAcoustics {
    frames: Vec<[f32; 3]>,
}

impl TableAcoustics {
    pub fn new(frames: Vec<[f32; 3]>) -> Self {
        Self { frames }
    }

    /// Three frames of "yes" followed by two frames of silence.
    pub fn yes_utterance() -> Self {
        Self::new(vec![
            [-10.0, -1.0, -5.0],
            [-10.0, -1.0, -5.0],
            [-5.0, -1.0, -5.0],
            [-1.0, -6.0, -6.0],
            [-1.0, -6.0, -6.0],
        ])
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }
}

impl AcousticModel for TableAcoustics {
    fn advance_to(&mut self, frame: usize) -> bool {
        frame < self.frames.len()
    }

    fn log_prob(&self, state_model: u32, frame: usize) -> f32 {
        self.frames[frame][state_model as usize]
    }
}

const LM_WORDS: [&str; 5] = ["<s>", "</s>", "yes", "no", "<w>"];
const UNIGRAM_LOG_PROB: f32 = -3.0;
const UNSEEN_BIGRAM_LOG_PROB: f32 = -4.0;

/// Bigram model over [`LM_WORDS`] that counts its scoring calls.
pub struct ToyBigram {
    table: HashMap<(i32, i32), f32>,
    pub calls: Cell<usize>,
}

impl ToyBigram {
    pub fn new() -> Self {
        let id = |word: &str| LM_WORDS.iter().position(|w| *w == word).map(|p| p as i32).unwrap();
        let mut table = HashMap::new();
        for (prev, next, log_prob) in [
            ("<s>", "yes", -0.5),
            ("<s>", "no", -1.5),
            ("yes", "</s>", -0.2),
            ("no", "</s>", -0.4),
            ("yes", "no", -1.0),
            ("no", "yes", -1.0),
            ("yes", "yes", -2.0),
            ("no", "no", -2.0),
            ("yes", "<w>", -0.1),
            ("no", "<w>", -0.1),
            ("<w>", "yes", -0.6),
            ("<w>", "no", -0.6),
        ] {
            table.insert((id(prev), id(next)), log_prob);
        }
        Self {
            table,
            calls: Cell::new(0),
        }
    }

    pub fn bigram(&self, prev: i32, next: i32) -> f32 {
        self.table
            .get(&(prev, next))
            .copied()
            .unwrap_or(UNSEEN_BIGRAM_LOG_PROB)
    }
}

impl NgramModel for ToyBigram {
    fn word_index(&self, word: &str) -> Option<i32> {
        LM_WORDS.iter().position(|w| *w == word).map(|p| p as i32)
    }

    fn order(&self) -> usize {
        2
    }

    fn log_prob(&self, context: &[i32]) -> f32 {
        self.calls.set(self.calls.get() + 1);
        match context {
            [.., prev, next] => self.bigram(*prev, *next),
            [_] => UNIGRAM_LOG_PROB,
            [] => 0.0,
        }
    }
}

/// Finite-state model whose nodes are the last symbol seen.
pub struct ToyFsa {
    scores: ToyBigram,
}

impl ToyFsa {
    pub fn new() -> Self {
        Self {
            scores: ToyBigram::new(),
        }
    }
}

impl FsaLanguageModel for ToyFsa {
    fn initial_node(&self) -> i32 {
        0
    }

    fn walk(&self, node: i32, symbol: i32) -> (i32, f32) {
        (symbol, self.scores.bigram(node, symbol))
    }

    fn symbol_index(&self, word: &str) -> Option<i32> {
        self.scores.word_index(word)
    }
}

/// Sentence boundaries on, histories compared over two words.
pub fn boundary_config() -> SearchConfig {
    SearchConfig {
        sentence_start: Some("<s>".to_string()),
        sentence_end: Some("</s>".to_string()),
        similar_lm_history_span: 2,
        ..SearchConfig::default()
    }
}

pub fn assert_close(actual: f32, expected: f32) {
    assert!(
        (actual - expected).abs() < 1e-4,
        "expected {expected}, got {actual}"
    );
}

fn bump<'h, P>(counts: &mut Vec<(&'h History<P>, usize)>, node: &'h History<P>) {
    match counts.iter_mut().find(|(seen, _)| History::ptr_eq(seen, node)) {
        Some((_, count)) => *count += 1,
        None => counts.push((node, 1)),
    }
}

/// Check that every node reachable from `heads` is referenced exactly by the
/// heads pointing at it plus the nodes appended on top of it.
pub fn assert_reference_counts<P>(heads: &[&History<P>]) {
    let mut counts = Vec::new();
    for &head in heads {
        bump(&mut counts, head);
    }
    let mut walked: Vec<&History<P>> = Vec::new();
    for &head in heads {
        for node in head.iter() {
            if walked.iter().any(|seen| History::ptr_eq(seen, node)) {
                break;
            }
            walked.push(node);
            if let Some(previous) = node.previous() {
                bump(&mut counts, previous);
            }
        }
    }
    for (index, (node, expected)) in counts.iter().enumerate() {
        assert_eq!(node.reference_count(), *expected, "history node {index} of {}", counts.len());
    }
}
