//! N-gram scoring of LM histories and the exact-match score cache.
//!
//! Cache keys are a hash of the most recent words. A hit is only trusted
//! after the cached word list has been compared against the live history;
//! on a mismatch the stale entry is evicted and the score recomputed.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::constants::search::NO_WORD;
use crate::search::history::LmHistory;
use crate::search::traits::NgramModel;
use crate::types::WordId;

/// Vocabulary ids of the sentence boundary words, [`NO_WORD`] when unused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentenceMarkers {
    pub start: WordId,
    pub end: WordId,
}

impl Default for SentenceMarkers {
    fn default() -> Self {
        Self {
            start: NO_WORD,
            end: NO_WORD,
        }
    }
}

/// Hash of the last `span` words of `history`, stopping at the chain root or
/// after a sentence start.
pub fn lm_history_hash(history: &LmHistory, span: usize, sentence_start: WordId) -> u32 {
    let mut code: u32 = 0;
    for node in history.iter().take(span) {
        if node.word_id == NO_WORD {
            break;
        }
        code = code.wrapping_add(node.word_id as u32);
        code = code.wrapping_add(code << 10);
        code ^= code >> 6;
        if node.word_id == sentence_start {
            break;
        }
    }
    code = code.wrapping_add(code << 3);
    code ^= code >> 11;
    code = code.wrapping_add(code << 15);
    code & 0x7fff_ffff
}

/// True if the last `span` words of `a` and `b` match.
///
/// A history that runs out (chain root or sentence end) only matches one that
/// runs out at the same position. A sentence end as the very first word of a
/// history is therefore treated like the chain root.
pub fn is_similar_lm_history(a: &LmHistory, b: &LmHistory, span: usize, sentence_end: WordId) -> bool {
    let ends = |word: WordId| word == NO_WORD || word == sentence_end;
    let mut a = Some(a);
    let mut b = Some(b);
    for _ in 0..span {
        let (Some(x), Some(y)) = (a, b) else {
            return a.is_none() && b.is_none();
        };
        if ends(x.word_id) {
            return ends(y.word_id);
        }
        if x.word_id != y.word_id {
            return false;
        }
        a = x.previous();
        b = y.previous();
    }
    true
}

/// Fill `context` with the LM ids of up to `order` recent words, oldest
/// first, stopping at the chain root or after a sentence start.
pub fn build_ngram_context(history: &LmHistory, order: usize, sentence_start: WordId, context: &mut Vec<i32>) {
    context.clear();
    for node in history.iter().take(order) {
        if node.word_id == NO_WORD {
            break;
        }
        context.push(node.lm_id);
        if node.word_id == sentence_start {
            break;
        }
    }
    context.reverse();
}

/// LM log-probability of the newest word of `history`.
pub fn ngram_log_prob(
    model: &dyn NgramModel,
    history: &LmHistory,
    sentence_start: WordId,
    context: &mut Vec<i32>,
) -> f32 {
    let order = model.order();
    if order == 0 {
        return 0.0;
    }
    build_ngram_context(history, order, sentence_start, context);
    model.log_prob(context)
}

struct CachedScore {
    score: f32,
    words: Vec<WordId>,
}

/// Cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LmCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub collisions: u64,
}

/// LRU cache of LM scores keyed by history hash.
pub struct LmScoreCache {
    entries: Option<LruCache<u32, CachedScore>>,
    stats: LmCacheStats,
}

impl LmScoreCache {
    /// `capacity == 0` or `enabled == false` disables caching.
    pub fn new(capacity: usize, enabled: bool) -> Self {
        let entries = NonZeroUsize::new(capacity)
            .filter(|_| enabled)
            .map(LruCache::new);
        Self {
            entries,
            stats: LmCacheStats::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.entries.is_some()
    }

    pub fn clear(&mut self) {
        if let Some(entries) = self.entries.as_mut() {
            entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, LruCache::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> LmCacheStats {
        self.stats
    }

    /// Score of `history`, from the cache when a validated entry exists,
    /// otherwise from `compute`.
    pub fn score<F>(
        &mut self,
        history: &LmHistory,
        code: u32,
        order: usize,
        markers: SentenceMarkers,
        compute: F,
    ) -> f32
    where
        F: FnOnce() -> f32,
    {
        let Some(entries) = self.entries.as_mut() else {
            return compute();
        };

        match entries.get(&code).map(|cached| (cached.score, matches_history(cached, history, order, markers))) {
            Some((score, true)) => {
                self.stats.hits += 1;
                return score;
            }
            Some((_, false)) => {
                self.stats.collisions += 1;
                entries.pop(&code);
            }
            None => self.stats.misses += 1,
        }

        let score = compute();
        let mut words = Vec::with_capacity(order + 1);
        for node in history.iter().take(order + 1) {
            if node.word_id == NO_WORD {
                break;
            }
            words.push(node.word_id);
            if node.word_id == markers.start {
                break;
            }
        }
        entries.put(code, CachedScore { score, words });
        score
    }
}

fn matches_history(cached: &CachedScore, history: &LmHistory, order: usize, markers: SentenceMarkers) -> bool {
    let mut live = Some(history);
    for &word in &cached.words {
        match live {
            Some(node) if node.word_id == word => live = node.previous(),
            _ => return false,
        }
    }
    // A short entry stopped at the history start; the live history must too.
    if cached.words.len() <= order {
        if let Some(node) = live {
            if node.word_id != NO_WORD && node.word_id != markers.end {
                return false;
            }
        }
    }
    true
}
