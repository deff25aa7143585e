//! LM lookahead: optimistic LM scores for words that are not yet complete.
//!
//! For every LM context a full per-word score vector is fetched once from the
//! lookahead model. Each lexicon node then reduces that vector to the best
//! score among the words still reachable from it, and remembers the result
//! per context.

use std::num::NonZeroUsize;

use lru::LruCache;
use tracing::debug;

use crate::config::LookaheadMode;
use crate::constants::cache::LOOKAHEAD_FLOOR;
use crate::constants::search::NO_WORD;
use crate::search::history::LmHistory;
use crate::search::lexicon::LexNode;
use crate::search::traits::NgramModel;
use crate::types::WordId;

/// Lookahead counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LookaheadStats {
    /// Answers served from a node buffer.
    pub node_hits: u64,
    /// Node misses answered from an existing score vector.
    pub list_hits: u64,
    /// Score vectors fetched from the model.
    pub computations: u64,
}

/// Two-level lookahead cache.
pub struct LookaheadCache {
    mode: LookaheadMode,
    num_words: usize,
    score_lists: LruCache<u64, Vec<f32>>,
    node_buffers: Vec<Option<LruCache<u64, f32>>>,
    node_buffer_size: NonZeroUsize,
    stats: LookaheadStats,
}

fn capacity(size: usize) -> NonZeroUsize {
    NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN)
}

impl LookaheadCache {
    pub fn new(
        mode: LookaheadMode,
        num_words: usize,
        num_nodes: usize,
        max_score_lists: usize,
        max_node_buffer_size: usize,
    ) -> Self {
        let mut node_buffers = Vec::new();
        node_buffers.resize_with(num_nodes, || None);
        Self {
            mode,
            num_words,
            score_lists: LruCache::new(capacity(max_score_lists)),
            node_buffers,
            node_buffer_size: capacity(max_node_buffer_size),
            stats: LookaheadStats::default(),
        }
    }

    pub fn mode(&self) -> LookaheadMode {
        self.mode
    }

    pub fn stats(&self) -> LookaheadStats {
        self.stats
    }

    /// Number of cached score vectors.
    pub fn score_lists(&self) -> usize {
        self.score_lists.len()
    }

    /// Drop every cached vector and node buffer.
    pub fn clear(&mut self) {
        self.score_lists.clear();
        for buffer in &mut self.node_buffers {
            *buffer = None;
        }
    }

    /// Lookahead score for a token with `history` entering `node`.
    ///
    /// Zero when the context is unusable: no previous word, or a sentence end
    /// as the most recent (or, for trigrams, second most recent) word.
    pub fn score(
        &mut self,
        model: &dyn NgramModel,
        lex2lm: &[i32],
        history: &LmHistory,
        node: &LexNode,
        sentence_end: WordId,
    ) -> f32 {
        let unusable = |word: WordId| word == NO_WORD || word == sentence_end;
        let w2 = history.word_id;
        if unusable(w2) {
            return 0.0;
        }
        match self.mode {
            LookaheadMode::Off => 0.0,
            LookaheadMode::Bigram => self.bigram(model, lex2lm, w2, node),
            LookaheadMode::Trigram => {
                let Some(previous) = history.previous() else {
                    return 0.0;
                };
                let w1 = previous.word_id;
                if unusable(w1) {
                    return 0.0;
                }
                self.trigram(model, lex2lm, w1, w2, node)
            }
        }
    }

    /// Best bigram score of the words reachable from `node` after `w2`.
    pub fn bigram(&mut self, model: &dyn NgramModel, lex2lm: &[i32], w2: WordId, node: &LexNode) -> f32 {
        let prev = lm_id(lex2lm, w2);
        self.resolve(u64::from(w2 as u32), node, |scores| {
            debug!(context = w2, "computing bigram lookahead scores");
            model.fetch_bigram_list(prev, lex2lm, scores);
        })
    }

    /// Best trigram score of the words reachable from `node` after `w1 w2`.
    pub fn trigram(
        &mut self,
        model: &dyn NgramModel,
        lex2lm: &[i32],
        w1: WordId,
        w2: WordId,
        node: &LexNode,
    ) -> f32 {
        let index = u64::from(w1 as u32) * self.num_words as u64 + u64::from(w2 as u32);
        let (lm1, lm2) = (lm_id(lex2lm, w1), lm_id(lex2lm, w2));
        self.resolve(index, node, |scores| {
            debug!(w1, w2, "computing trigram lookahead scores");
            model.fetch_trigram_list(lm1, lm2, lex2lm, scores);
        })
    }

    fn resolve<F>(&mut self, index: u64, node: &LexNode, fill: F) -> f32
    where
        F: FnOnce(&mut [f32]),
    {
        if node.id >= self.node_buffers.len() {
            self.node_buffers.resize_with(node.id + 1, || None);
        }
        let node_buffer_size = self.node_buffer_size;
        let buffer = self.node_buffers[node.id].get_or_insert_with(|| LruCache::new(node_buffer_size));
        if let Some(&score) = buffer.get(&index) {
            self.stats.node_hits += 1;
            return score;
        }

        let num_words = self.num_words;
        let mut computed = false;
        let scores = self.score_lists.get_or_insert(index, || {
            computed = true;
            let mut scores = vec![0.0; num_words];
            fill(&mut scores);
            scores
        });
        if computed {
            self.stats.computations += 1;
        } else {
            self.stats.list_hits += 1;
        }
        let score = node
            .possible_word_ids
            .iter()
            .filter_map(|&word| scores.get(word as usize))
            .fold(LOOKAHEAD_FLOOR, |best, &score| if score > best { score } else { best });
        buffer.put(index, score);
        score
    }
}

fn lm_id(lex2lm: &[i32], word: WordId) -> i32 {
    usize::try_from(word)
        .ok()
        .and_then(|index| lex2lm.get(index))
        .copied()
        .unwrap_or(NO_WORD)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::history::LmWord;
    use std::cell::Cell;

    const END: WordId = 2;

    /// Scores word `w` after any context as `-w`.
    struct Linear {
        calls: Cell<usize>,
    }

    impl NgramModel for Linear {
        fn word_index(&self, _word: &str) -> Option<i32> {
            None
        }
        fn order(&self) -> usize {
            3
        }
        fn log_prob(&self, context: &[i32]) -> f32 {
            self.calls.set(self.calls.get() + 1);
            context.last().map_or(0.0, |&w| -(w as f32))
        }
    }

    fn history(words: &[WordId]) -> LmHistory {
        let mut head = LmHistory::root(LmWord::root());
        for &w in words {
            head = LmHistory::append(LmWord::new(w, w, 0), &head);
        }
        head
    }

    fn node(id: usize, words: Vec<WordId>) -> LexNode {
        let mut node = LexNode::new().with_possible_words(words);
        node.id = id;
        node
    }

    fn identity(n: i32) -> Vec<i32> {
        (0..n).collect()
    }

    #[test]
    fn test_bigram_takes_best_reachable_word() {
        let model = Linear { calls: Cell::new(0) };
        let lex2lm = identity(8);
        let mut cache = LookaheadCache::new(LookaheadMode::Bigram, 8, 4, 4, 4);
        let score = cache.score(&model, &lex2lm, &history(&[3]), &node(1, vec![5, 4, 7]), END);
        assert_eq!(score, -4.0);
    }

    #[test]
    fn test_repeat_query_is_served_from_node_buffer() {
        let model = Linear { calls: Cell::new(0) };
        let lex2lm = identity(8);
        let mut cache = LookaheadCache::new(LookaheadMode::Bigram, 8, 4, 4, 4);
        let hist = history(&[3]);
        let target = node(1, vec![5, 6]);

        let first = cache.score(&model, &lex2lm, &hist, &target, END);
        let calls = model.calls.get();
        let second = cache.score(&model, &lex2lm, &hist, &target, END);
        assert_eq!(first, second);
        assert_eq!(model.calls.get(), calls);
        assert_eq!(cache.stats(), LookaheadStats { node_hits: 1, list_hits: 0, computations: 1 });
    }

    #[test]
    fn test_vector_shared_between_nodes() {
        let model = Linear { calls: Cell::new(0) };
        let lex2lm = identity(8);
        let mut cache = LookaheadCache::new(LookaheadMode::Bigram, 8, 4, 4, 4);
        let hist = history(&[3]);
        cache.score(&model, &lex2lm, &hist, &node(1, vec![5]), END);
        let other = cache.score(&model, &lex2lm, &hist, &node(2, vec![6, 7]), END);
        assert_eq!(other, -6.0);
        assert_eq!(cache.stats().computations, 1);
        assert_eq!(cache.stats().list_hits, 1);
        assert_eq!(cache.score_lists(), 1);
    }

    #[test]
    fn test_trigram_context_rules() {
        let model = Linear { calls: Cell::new(0) };
        let lex2lm = identity(8);
        let mut cache = LookaheadCache::new(LookaheadMode::Trigram, 8, 4, 4, 4);
        let target = node(1, vec![5]);

        // Only one word of history.
        assert_eq!(cache.score(&model, &lex2lm, &history(&[3]), &target, END), 0.0);
        // Sentence end in either position.
        assert_eq!(cache.score(&model, &lex2lm, &history(&[END, 3]), &target, END), 0.0);
        assert_eq!(cache.score(&model, &lex2lm, &history(&[3, END]), &target, END), 0.0);
        assert_eq!(cache.stats().computations, 0);

        assert_eq!(cache.score(&model, &lex2lm, &history(&[4, 3]), &target, END), -5.0);
        assert_eq!(cache.stats().computations, 1);
    }

    #[test]
    fn test_unknown_words_floor() {
        let model = Linear { calls: Cell::new(0) };
        let mut lex2lm = identity(8);
        lex2lm[5] = NO_WORD;
        let mut cache = LookaheadCache::new(LookaheadMode::Bigram, 8, 4, 4, 4);
        let score = cache.score(&model, &lex2lm, &history(&[3]), &node(1, vec![5]), END);
        assert_eq!(score, LOOKAHEAD_FLOOR);
    }

    #[test]
    fn test_clear_forces_recomputation() {
        let model = Linear { calls: Cell::new(0) };
        let lex2lm = identity(8);
        let mut cache = LookaheadCache::new(LookaheadMode::Bigram, 8, 1, 4, 4);
        let hist = history(&[3]);
        // Node ids past the initial size are accepted.
        let target = node(3, vec![5]);
        cache.score(&model, &lex2lm, &hist, &target, END);
        cache.clear();
        cache.score(&model, &lex2lm, &hist, &target, END);
        assert_eq!(cache.stats().computations, 2);
        assert_eq!(cache.stats().node_hits, 0);
    }
}
