//! The frame-synchronous token-passing search.
//!
//! Every frame each active token is moved along the arcs of its lexicon node.
//! Epsilon nodes are passed through within the frame; nodes with an HMM state
//! consume the frame's observation. Tokens reaching the same node with an
//! equivalent LM history are recombined, after which the new population is
//! pruned and becomes the active list of the next frame.

use tracing::{debug, error, info, trace, warn};

use crate::config::{LookaheadMode, SearchConfig};
use crate::constants::search::NO_WORD;
use crate::error::{DecoderError, Result};
use crate::reliability::metrics::{self, MetricsTimer, DECODE_DURATION_SECONDS};
use crate::search::history::{LmHistory, LmWord, StateHistory, StateSegment, WordHistory, WordSegment};
use crate::search::lattice::WordGraph;
use crate::search::lexicon::{LexNode, LexiconTree, NodeFlags};
use crate::search::lm_cache::{
    is_similar_lm_history, lm_history_hash, ngram_log_prob, LmCacheStats, LmScoreCache, SentenceMarkers,
};
use crate::search::lookahead::{LookaheadCache, LookaheadStats};
use crate::search::pool::PoolStats;
use crate::search::pruning::{BeamController, PruneCandidate, Watermarks};
use crate::search::token::{token_log_prob, Token, TokenPool};
use crate::search::traits::{AcousticModel, FsaLanguageModel, NgramModel, Vocabulary};
use crate::types::{NodeId, Recognition, TokenId, WordId};

/// The language model scoring completed words.
#[derive(Clone, Copy)]
pub(crate) enum LanguageModel<'a> {
    Ngram(&'a dyn NgramModel),
    Fsa(&'a dyn FsaLanguageModel),
}

/// Snapshot of the search counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchStats {
    pub frame: usize,
    pub active_tokens: usize,
    pub pool: PoolStats,
    pub current_global_beam: f32,
    pub current_word_end_beam: f32,
    pub lm_cache: LmCacheStats,
    pub lookahead: LookaheadStats,
    /// Lattice nodes created since the last reset.
    pub lattice_nodes: usize,
}

/// Token-passing search over a lexicon prefix tree.
pub struct TokenPassSearch<'a> {
    pub(crate) lexicon: &'a LexiconTree,
    pub(crate) vocabulary: &'a dyn Vocabulary,
    pub(crate) config: SearchConfig,

    lm: Option<LanguageModel<'a>>,
    lookahead_lm: Option<&'a dyn NgramModel>,
    lex2lm: Vec<i32>,
    lex2lookahead: Vec<i32>,

    /// Vocabulary ids of the sentence boundary words.
    pub(crate) markers: SentenceMarkers,
    sentence_start_lm: i32,
    sentence_end_lm: i32,
    pub(crate) word_boundary: WordId,
    word_boundary_lm: i32,

    pub(crate) frame: usize,
    end_frame: Option<usize>,

    pub(crate) pool: TokenPool,
    pub(crate) active: Vec<TokenId>,
    new_tokens: Vec<TokenId>,
    word_end_tokens: Vec<TokenId>,
    /// Tokens stored in each lexicon node during the current frame.
    node_tokens: Vec<Vec<TokenId>>,
    active_nodes: Vec<NodeId>,

    lm_cache: LmScoreCache,
    lookahead: Option<LookaheadCache>,
    beams: BeamController,
    marks: Watermarks,
    word_graph: WordGraph,

    pub(crate) best_final_token: Option<TokenId>,
    finalized: bool,
    initialized: bool,

    context: Vec<i32>,
    candidates: Vec<PruneCandidate>,
    keep: Vec<bool>,
    reported_lm_cache: LmCacheStats,
    reported_lookahead: LookaheadStats,
}

impl<'a> TokenPassSearch<'a> {
    /// Create a search over `lexicon`.
    ///
    /// # Arguments
    /// * `lexicon` - The lexicon prefix tree
    /// * `vocabulary` - Word strings of the lexicon's word ids
    /// * `config` - Search configuration; validated here
    ///
    /// # Returns
    /// A search that still needs a language model and a call to
    /// [`reset_search`](Self::reset_search) before it can run.
    pub fn new(lexicon: &'a LexiconTree, vocabulary: &'a dyn Vocabulary, config: SearchConfig) -> Result<Self> {
        config.validate()?;

        let lookup = |role: &'static str, word: &Option<String>| -> Result<WordId> {
            match word {
                Some(word) => vocabulary.word_index(word).ok_or_else(|| DecoderError::UnknownWord {
                    role,
                    word: word.clone(),
                }),
                None => Ok(NO_WORD),
            }
        };
        let markers = SentenceMarkers {
            start: lookup("sentence start", &config.sentence_start)?,
            end: lookup("sentence end", &config.sentence_end)?,
        };
        let word_boundary = lookup("word boundary", &config.word_boundary)?;

        let lookahead = (config.lm_lookahead != LookaheadMode::Off).then(|| {
            LookaheadCache::new(
                config.lm_lookahead,
                vocabulary.num_words(),
                lexicon.len(),
                config.max_lookahead_score_lists,
                config.max_node_lookahead_buffer_size,
            )
        });

        let mut node_tokens = Vec::new();
        node_tokens.resize_with(lexicon.len(), Vec::new);

        Ok(Self {
            lexicon,
            vocabulary,
            lm: None,
            lookahead_lm: None,
            lex2lm: Vec::new(),
            lex2lookahead: Vec::new(),
            markers,
            sentence_start_lm: NO_WORD,
            sentence_end_lm: NO_WORD,
            word_boundary,
            word_boundary_lm: NO_WORD,
            frame: 0,
            end_frame: None,
            pool: TokenPool::default(),
            active: Vec::new(),
            new_tokens: Vec::new(),
            word_end_tokens: Vec::new(),
            node_tokens,
            active_nodes: Vec::new(),
            lm_cache: LmScoreCache::new(config.max_lm_cache_size, config.use_lm_cache),
            lookahead,
            beams: BeamController::new(config.global_beam, config.word_end_beam),
            marks: Watermarks::default(),
            word_graph: WordGraph::new(vocabulary.num_words()),
            best_final_token: None,
            finalized: false,
            initialized: false,
            context: Vec::new(),
            candidates: Vec::new(),
            keep: Vec::new(),
            reported_lm_cache: LmCacheStats::default(),
            reported_lookahead: LookaheadStats::default(),
            config,
        })
    }

    /// Use an n-gram model for scoring. Returns the number of vocabulary
    /// words the model does not know.
    pub fn set_ngram(&mut self, model: &'a dyn NgramModel) -> Result<usize> {
        if matches!(self.lm, Some(LanguageModel::Fsa(_))) {
            return Err(DecoderError::InvalidSetup(
                "an FSA language model is already attached".to_string(),
            ));
        }
        let (lex2lm, missing) = self.map_vocabulary(|word| model.word_index(word));
        self.lex2lm = lex2lm;
        self.lm = Some(LanguageModel::Ngram(model));
        self.initialized = false;
        info!(order = model.order(), missing, "n-gram language model attached");
        Ok(missing)
    }

    /// Use a finite-state model for scoring. Returns the number of
    /// vocabulary words without a symbol in the automaton.
    pub fn set_fsa_lm(&mut self, model: &'a dyn FsaLanguageModel) -> Result<usize> {
        if matches!(self.lm, Some(LanguageModel::Ngram(_))) {
            return Err(DecoderError::InvalidSetup(
                "an n-gram language model is already attached".to_string(),
            ));
        }
        let (lex2lm, missing) = self.map_vocabulary(|word| model.symbol_index(word));
        self.lex2lm = lex2lm;
        self.lm = Some(LanguageModel::Fsa(model));
        self.initialized = false;
        info!(missing, "FSA language model attached");
        Ok(missing)
    }

    /// Use `model` for LM lookahead. Returns the number of vocabulary words
    /// the model does not know.
    pub fn set_lookahead_ngram(&mut self, model: &'a dyn NgramModel) -> Result<usize> {
        if self.lm.is_none() {
            return Err(DecoderError::InvalidSetup(
                "attach the main language model before the lookahead model".to_string(),
            ));
        }
        let (lex2lookahead, missing) = self.map_vocabulary(|word| model.word_index(word));
        self.lex2lookahead = lex2lookahead;
        self.lookahead_lm = Some(model);
        if let Some(cache) = self.lookahead.as_mut() {
            cache.clear();
        }
        info!(missing, "lookahead language model attached");
        Ok(missing)
    }

    fn map_vocabulary<F>(&self, index: F) -> (Vec<i32>, usize)
    where
        F: Fn(&str) -> Option<i32>,
    {
        let mut missing = 0;
        let map = (0..self.vocabulary.num_words())
            .map(|id| match index(self.vocabulary.word(id as WordId)) {
                Some(lm_id) if lm_id >= 0 => lm_id,
                _ => {
                    missing += 1;
                    NO_WORD
                }
            })
            .collect();
        (map, missing)
    }

    /// Stop the search at `frame`. Cleared by [`reset_search`](Self::reset_search).
    pub fn set_end_frame(&mut self, frame: Option<usize>) {
        self.end_frame = frame;
    }

    pub fn frame(&self) -> usize {
        self.frame
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Ids of the tokens that survived the last frame.
    pub fn active_tokens(&self) -> &[TokenId] {
        &self.active
    }

    /// # Panics
    /// If `id` is not a live token.
    pub fn token(&self, id: TokenId) -> &Token {
        self.pool.get(id)
    }

    fn lm_id(&self, word: WordId) -> i32 {
        usize::try_from(word)
            .ok()
            .and_then(|index| self.lex2lm.get(index))
            .copied()
            .unwrap_or(NO_WORD)
    }

    fn uses_sentence_boundary(&self) -> bool {
        self.markers.start != NO_WORD && self.markers.end != NO_WORD
    }

    /// Discard all tokens and start a new utterance at `start_frame` with a
    /// single token at the lexicon start node.
    pub fn reset_search(&mut self, start_frame: usize) -> Result<()> {
        let Some(lm) = self.lm else {
            return Err(DecoderError::InvalidSetup("no language model attached".to_string()));
        };
        if self.lookahead.is_some() && self.lookahead_lm.is_none() {
            return Err(DecoderError::InvalidSetup(
                "LM lookahead is enabled but no lookahead model is attached".to_string(),
            ));
        }
        if self.config.generate_lattice && self.lexicon.any_node_has(NodeFlags::INSERT_WORD_BOUNDARY) {
            return Err(DecoderError::InvalidSetup(
                "word-boundary insertion nodes cannot be used when word graphs are generated".to_string(),
            ));
        }

        self.frame = start_frame;
        self.end_frame = None;
        self.best_final_token = None;
        self.finalized = false;

        self.word_boundary_lm = self.lm_id(self.word_boundary);
        self.sentence_start_lm = self.lm_id(self.markers.start);
        self.sentence_end_lm = self.lm_id(self.markers.end);

        for id in self
            .active
            .drain(..)
            .chain(self.new_tokens.drain(..))
            .chain(self.word_end_tokens.drain(..))
        {
            self.pool.release(id);
        }
        for node in self.active_nodes.drain(..) {
            self.node_tokens[node].clear();
        }

        let start_node = self.lexicon.start_node();
        let mut token = Token::new(start_node, LmHistory::root(LmWord::root()));
        if self.config.generate_lattice {
            token.word_history = Some(WordHistory::root(WordSegment::root(start_node)));
            token.recent_lattice_node = Some(self.word_graph.reset(start_node));
        }
        if let LanguageModel::Fsa(fsa) = lm {
            token.fsa_lm_node = fsa.initial_node();
        }
        if self.uses_sentence_boundary() {
            token.lm_history = LmHistory::append(
                LmWord::new(self.markers.start, self.sentence_start_lm, -1),
                &token.lm_history,
            );
        }
        if self.config.keep_state_segmentation {
            token.state_history = Some(StateHistory::root(StateSegment { hmm_model: 0, start_frame: 0 }));
        }
        let id = self.pool.acquire(token);
        self.active.push(id);

        if let Some(cache) = self.lookahead.as_mut() {
            cache.clear();
        }
        self.lm_cache.clear();
        self.beams.reset();
        self.marks.reset();
        self.initialized = true;

        info!(start_frame, "search reset");
        Ok(())
    }

    /// Process one frame.
    ///
    /// Returns `Ok(false)` at the end of input, after running finalization
    /// once when lattices or sentence ends are required.
    pub fn run(&mut self, acoustics: &mut dyn AcousticModel) -> Result<bool> {
        if !self.initialized {
            return Err(DecoderError::InvalidSetup(
                "reset_search must be called before run".to_string(),
            ));
        }

        let at_end = self.end_frame.is_some_and(|end| self.frame >= end);
        if at_end || !acoustics.advance_to(self.frame) {
            if !self.finalized && (self.config.generate_lattice || self.config.require_sentence_end) {
                self.update_final_tokens();
            }
            self.finalized = true;
            return Ok(false);
        }

        self.propagate_tokens(&*acoustics);
        self.prune_tokens();
        self.frame += 1;
        Ok(true)
    }

    /// Decode a whole utterance from frame 0.
    pub fn decode(&mut self, acoustics: &mut dyn AcousticModel) -> Result<Recognition> {
        let span = crate::decode_span!();
        let _enter = span.enter();
        let _timer = MetricsTimer::new(DECODE_DURATION_SECONDS);

        self.reset_search(0)?;
        while self.run(acoustics)? {}

        let (id, complete) = self.best_final_token()?;
        let words = self.recognized_words(true)?;
        let token = self.pool.get(id);
        span.record("frames", self.frame);
        span.record("active_tokens", self.active.len());
        span.record("complete", complete);

        Ok(Recognition {
            words,
            am_log_prob: token.am_log_prob,
            lm_log_prob: token.lm_log_prob,
            total_log_prob: token.total_log_prob,
            complete,
        })
    }

    pub fn stats(&self) -> SearchStats {
        SearchStats {
            frame: self.frame,
            active_tokens: self.active.len(),
            pool: self.pool.stats(),
            current_global_beam: self.beams.current_global(),
            current_word_end_beam: self.beams.current_word_end(),
            lm_cache: self.lm_cache.stats(),
            lookahead: self.lookahead.as_ref().map(LookaheadCache::stats).unwrap_or_default(),
            lattice_nodes: self.word_graph.nodes_created(),
        }
    }

    fn propagate_tokens(&mut self, acoustics: &dyn AcousticModel) {
        self.marks.reset();
        for node in self.active_nodes.drain(..) {
            self.node_tokens[node].clear();
        }

        // Sources leave the pool here; their slots are free for the new tokens.
        let mut active = std::mem::take(&mut self.active);
        for &id in &active {
            let token = self.pool.take(id);
            self.propagate_token(&token, acoustics);
        }
        active.clear();
        self.active = active;
    }

    fn propagate_token(&mut self, token: &Token, acoustics: &dyn AcousticModel) {
        let lexicon = self.lexicon;
        let source = lexicon.node(token.node);
        for arc in &source.arcs {
            self.move_token_to_node(token, arc.target, arc.log_prob, acoustics);
        }

        if source.has_flag(NodeFlags::INSERT_WORD_BOUNDARY)
            && self.word_boundary != NO_WORD
            && token.last_word() != self.word_boundary
        {
            // Optional word boundary: continue once more with the boundary
            // word appended to the LM history.
            let mut bounded = token.clone();
            bounded.lm_history = LmHistory::append(
                LmWord::new(self.word_boundary, self.word_boundary_lm, self.frame as i32),
                &token.lm_history,
            );
            bounded.word_start_frame = -1;
            self.update_lm_log_prob(&mut bounded);
            bounded.cur_lm_log_prob = bounded.lm_log_prob;
            for arc in source.arcs.iter().filter(|arc| arc.target != source.id) {
                self.move_token_to_node(&bounded, arc.target, arc.log_prob, acoustics);
            }
        }
    }

    fn move_token_to_node(
        &mut self,
        token: &Token,
        node_id: NodeId,
        transition_log_prob: f32,
        acoustics: &dyn AcousticModel,
    ) {
        let lexicon = self.lexicon;
        let node = lexicon.node(node_id);
        let source = lexicon.node(token.node);
        let frame = self.frame as i32;
        let transition = self.config.transition_scale * transition_log_prob;

        if self.config.generate_lattice {
            self.check_lattice_link(token);
        }

        let mut updated = token.clone();
        updated.node = node_id;
        updated.am_log_prob = token.am_log_prob + transition;

        if node_id != token.node {
            let old_word = token.last_word();

            if node.has_flag(NodeFlags::FIRST_STATE_OF_WORD) {
                updated.word_start_frame = frame;
            }

            if node.has_flag(NodeFlags::AFTER_WORD_ID) {
                updated.cur_lm_log_prob = updated.lm_log_prob;
            } else if node.word_id != NO_WORD {
                if !self.enter_word(token, node, &mut updated) {
                    return;
                }
            } else {
                updated.cur_lm_log_prob = token.cur_lm_log_prob;
                if !node.possible_word_ids.is_empty() {
                    if let (Some(cache), Some(model)) = (self.lookahead.as_mut(), self.lookahead_lm) {
                        updated.cur_lm_log_prob = updated.lm_log_prob
                            + cache.score(model, &self.lex2lookahead, &token.lm_history, node, self.markers.end);
                    }
                }
            }

            if self.config.keep_state_segmentation {
                if let Some(state) = &node.state {
                    let segment = StateSegment { hmm_model: state.model, start_frame: frame };
                    updated.state_history = Some(match &token.state_history {
                        Some(previous) => StateHistory::append(segment, previous),
                        None => StateHistory::root(segment),
                    });
                }
            }

            updated.dur = 0;
            updated.depth = token.depth + 1;
            let mut duration_log_prob = 0.0;
            if let Some(state) = &source.state {
                duration_log_prob = self.config.duration_scale * state.duration.log_prob(token.dur + 1);
                updated.am_log_prob += duration_log_prob;
            }

            if self.config.generate_lattice && node.has_flag(NodeFlags::FIRST_STATE_OF_WORD) {
                if let Some(previous) = &token.word_history {
                    let segment = WordSegment::closing(
                        old_word,
                        frame,
                        node_id,
                        token.am_log_prob + transition + duration_log_prob,
                        token.lm_log_prob,
                        previous,
                    );
                    updated.word_history = Some(WordHistory::append(segment, previous));
                }
            }

            updated.cur_am_log_prob = updated.am_log_prob;
        } else {
            updated.dur = token.dur + 1;
            let limited = source.state.as_ref().is_some_and(|state| state.duration.is_valid());
            if limited && updated.dur > self.config.max_state_duration {
                return;
            }
            updated.cur_am_log_prob = token.cur_am_log_prob + transition;
        }

        if node.has_flag(NodeFlags::FAN_IN_FIRST) || node.has_flag(NodeFlags::SILENCE_FIRST) || node_id == lexicon.root() {
            updated.depth = 0;
        }
        if node.has_flag(NodeFlags::SILENCE_FIRST) {
            updated.lm_history.note_silence(frame);
        }

        let Some(state) = &node.state else {
            // Epsilon node: pass through within this frame.
            updated.total_log_prob =
                token_log_prob(updated.cur_am_log_prob, updated.cur_lm_log_prob, self.config.lm_scale);
            if self.outside_beams(updated.total_log_prob, node) {
                return;
            }
            updated.dur = 0;
            if self.config.generate_lattice && node.has_flag(NodeFlags::FIRST_STATE_OF_WORD) {
                self.build_word_graph(&mut updated);
            }
            self.propagate_token(&updated, acoustics);
            return;
        };

        let acoustic_log_prob = acoustics.log_prob(state.model, self.frame);
        updated.am_log_prob += acoustic_log_prob;
        updated.cur_am_log_prob += acoustic_log_prob;
        updated.total_log_prob = token_log_prob(updated.cur_am_log_prob, updated.cur_lm_log_prob, self.config.lm_scale);

        let candidate = PruneCandidate {
            total_log_prob: updated.total_log_prob,
            flags: node.flags,
            word_count: updated.word_count,
            depth: updated.depth,
        };
        if self.outside_beams(updated.total_log_prob, node) || self.config.pruning.discards(&self.marks, &candidate) {
            return;
        }

        let similar = self.find_similar_token(&updated);
        if let Some(id) = similar {
            if updated.total_log_prob <= self.pool.get(id).total_log_prob {
                return;
            }
        }

        self.marks.observe(&candidate);

        if self.config.generate_lattice && node.has_flag(NodeFlags::FIRST_STATE_OF_WORD) && node_id != token.node {
            self.build_word_graph(&mut updated);
        }

        match similar {
            // Recombination: the better token takes over the slot.
            Some(id) => drop(self.pool.replace(id, updated)),
            None => {
                if self.node_tokens[node_id].is_empty() {
                    self.active_nodes.push(node_id);
                }
                let id = self.pool.acquire(updated);
                self.node_tokens[node_id].push(id);
                if node.has_flag(NodeFlags::USE_WORD_END_BEAM) {
                    self.word_end_tokens.push(id);
                } else {
                    self.new_tokens.push(id);
                }
            }
        }
    }

    /// Append the word of `node` to the LM history of `updated` and score
    /// it. Returns false when the path must end here.
    fn enter_word(&mut self, token: &Token, node: &LexNode, updated: &mut Token) -> bool {
        let word_id = node.word_id;
        let lm_id = self.lm_id(word_id);
        if lm_id < 0 {
            return false;
        }
        if word_id == self.word_boundary && token.last_word() == self.word_boundary {
            return false;
        }

        updated.lm_history = LmHistory::append(LmWord::new(word_id, lm_id, updated.word_start_frame), &token.lm_history);
        updated.word_start_frame = -1;
        self.update_lm_log_prob(updated);
        updated.cur_lm_log_prob = updated.lm_log_prob;
        updated.word_count += 1;

        if self.uses_sentence_boundary() && word_id == self.markers.end {
            // Lattices are built for single sentences only.
            if self.config.generate_lattice {
                return false;
            }

            let frame = self.frame as i32;
            updated.lm_history = LmHistory::append(
                LmWord::new(self.markers.start, self.sentence_start_lm, frame),
                &updated.lm_history,
            );
            if self.word_boundary != NO_WORD {
                updated.lm_history = LmHistory::append(
                    LmWord::new(self.word_boundary, self.word_boundary_lm, frame),
                    &updated.lm_history,
                );
            }
            match self.lm {
                Some(LanguageModel::Fsa(fsa)) => {
                    updated.fsa_lm_node = fsa.initial_node();
                    if self.word_boundary != NO_WORD {
                        updated.fsa_lm_node = fsa.walk(updated.fsa_lm_node, self.word_boundary_lm).0;
                    }
                }
                Some(LanguageModel::Ngram(_)) => {
                    updated.lm_hist_code = lm_history_hash(
                        &updated.lm_history,
                        self.config.similar_lm_history_span,
                        self.markers.start,
                    );
                }
                None => {}
            }
        }
        true
    }

    fn outside_beams(&self, total_log_prob: f32, node: &LexNode) -> bool {
        (node.has_flag(NodeFlags::USE_WORD_END_BEAM) && total_log_prob < self.beams.word_end_limit(&self.marks))
            || total_log_prob < self.beams.global_limit(&self.marks)
    }

    /// Token already stored in the node of `updated` whose LM state is
    /// equivalent to that of `updated`.
    fn find_similar_token(&self, updated: &Token) -> Option<TokenId> {
        let candidates = &self.node_tokens[updated.node];
        match self.lm {
            Some(LanguageModel::Fsa(_)) => candidates
                .iter()
                .copied()
                .find(|&id| self.pool.get(id).fsa_lm_node == updated.fsa_lm_node),
            _ => candidates.iter().copied().find(|&id| {
                let other = self.pool.get(id);
                other.lm_hist_code == updated.lm_hist_code
                    && is_similar_lm_history(
                        &updated.lm_history,
                        &other.lm_history,
                        self.config.similar_lm_history_span,
                        self.markers.end,
                    )
            }),
        }
    }

    /// Add the LM score of the newest word of `token`'s history.
    fn update_lm_log_prob(&mut self, token: &mut Token) {
        let word = token.lm_history.word_id;
        let penalty = self.config.insertion_penalty;
        match self.lm {
            Some(LanguageModel::Fsa(fsa)) => {
                if word != self.markers.start {
                    let (next, log_prob) = fsa.walk(token.fsa_lm_node, token.lm_history.lm_id);
                    token.fsa_lm_node = next;
                    token.lm_log_prob += log_prob + penalty;
                }
            }
            Some(LanguageModel::Ngram(model)) => {
                token.lm_hist_code =
                    lm_history_hash(&token.lm_history, self.config.similar_lm_history_span, self.markers.start);
                if word != self.markers.start {
                    token.lm_log_prob += self.ngram_score(model, &token.lm_history, token.lm_hist_code) + penalty;
                }
            }
            None => {}
        }
    }

    fn ngram_score(&mut self, model: &dyn NgramModel, history: &LmHistory, code: u32) -> f32 {
        let start = self.markers.start;
        let context = &mut self.context;
        self.lm_cache
            .score(history, code, model.order(), self.markers, || ngram_log_prob(model, history, start, context))
    }

    fn check_lattice_link(&self, token: &Token) {
        if let (Some(segment), Some(node)) = (&token.word_history, &token.recent_lattice_node) {
            if segment.lex_node_id != node.lex_node_id() {
                error!(
                    frame = self.frame,
                    word_history_node = segment.lex_node_id,
                    lattice_node = node.lex_node_id(),
                    "word history and lattice node disagree"
                );
                debug_assert!(false, "word history and lattice node disagree");
            }
        }
    }

    /// Link the newest word segment of `token` into the word graph.
    fn build_word_graph(&mut self, token: &mut Token) {
        let Some(segment) = token.word_history.as_ref() else {
            return;
        };
        if segment.word_id < 0 {
            return;
        }
        let target = self.word_graph.node_for(self.frame as i32, segment.word_id, segment.lex_node_id);
        match &token.recent_lattice_node {
            Some(source) => WordGraph::add_arc(
                source,
                &target,
                segment.am_log_prob,
                segment.lm_log_prob * self.config.lm_scale,
            ),
            None => error!(frame = self.frame, "token without a lattice node in word graph mode"),
        }
        token.recent_lattice_node = Some(target);
    }

    /// Close the current word of `token` as a word segment and link it into
    /// the word graph.
    fn close_word_segment(&mut self, token: &mut Token, word_id: WordId) {
        let Some(previous) = token.word_history.as_ref() else {
            return;
        };
        let segment = WordSegment::closing(
            word_id,
            self.frame as i32,
            token.node,
            token.am_log_prob,
            token.lm_log_prob,
            previous,
        );
        token.word_history = Some(WordHistory::append(segment, previous));
        self.build_word_graph(token);
    }

    fn prune_tokens(&mut self) {
        let word_end_limit = self.beams.word_end_limit(&self.marks);
        let mut pruned = 0;

        let mut survivors = std::mem::take(&mut self.new_tokens);
        for id in self.word_end_tokens.drain(..) {
            if self.pool.get(id).total_log_prob < word_end_limit {
                self.pool.release(id);
                pruned += 1;
            } else {
                survivors.push(id);
            }
        }

        let lexicon = self.lexicon;
        self.candidates.clear();
        self.candidates.extend(survivors.iter().map(|&id| {
            let token = self.pool.get(id);
            PruneCandidate {
                total_log_prob: token.total_log_prob,
                flags: lexicon.node(token.node).flags,
                word_count: token.word_count,
                depth: token.depth,
            }
        }));
        let report = self.beams.prune(
            &self.candidates,
            &self.marks,
            &self.config.pruning,
            self.config.max_num_tokens,
            &mut self.keep,
        );
        pruned += report.pruned;

        for (&id, &keep) in survivors.iter().zip(&self.keep) {
            if keep {
                self.active.push(id);
            } else {
                self.pool.release(id);
            }
        }
        survivors.clear();
        self.new_tokens = survivors;

        trace!(
            frame = self.frame,
            best = self.marks.best,
            worst = self.marks.worst,
            histogram = report.histogram_applied,
            "pruning pass"
        );
        debug!(
            frame = self.frame,
            active = self.active.len(),
            pruned,
            beam = self.beams.current_global(),
            word_end_beam = self.beams.current_word_end(),
            "frame done"
        );
        self.record_metrics(pruned, report.histogram_applied);
    }

    fn record_metrics(&mut self, pruned: usize, histogram_applied: bool) {
        metrics::record_frame(self.active.len(), pruned, self.beams.current_global(), histogram_applied);
        metrics::record_pool_capacity(self.pool.stats().capacity);

        let lm = self.lm_cache.stats();
        let lookahead = self.lookahead.as_ref().map(LookaheadCache::stats).unwrap_or_default();
        metrics::record_cache_activity(
            lm.hits.saturating_sub(self.reported_lm_cache.hits),
            lm.misses.saturating_sub(self.reported_lm_cache.misses),
            lm.collisions.saturating_sub(self.reported_lm_cache.collisions),
            lookahead.computations.saturating_sub(self.reported_lookahead.computations),
        );
        self.reported_lm_cache = lm;
        self.reported_lookahead = lookahead;
    }

    /// Force a sentence end into every active token and, in word graph mode,
    /// close the graph at the tokens in final nodes.
    fn update_final_tokens(&mut self) {
        self.best_final_token = None;
        let mut best: Option<(TokenId, f32)> = None;

        for slot in 0..self.active.len() {
            let mut token = self.pool.take(self.active[slot]);
            let in_final_node = self.lexicon.node(token.node).has_flag(NodeFlags::FINAL);
            let lattice_end = self.config.generate_lattice && in_final_node;

            // Tokens in a final node have not closed their last word yet.
            if lattice_end {
                let last_word = token.last_word();
                self.close_word_segment(&mut token, last_word);
            }

            token.lm_history = LmHistory::append(
                LmWord::new(self.markers.end, self.sentence_end_lm, self.frame as i32),
                &token.lm_history,
            );
            let penalty = self.config.insertion_penalty;
            match self.lm {
                Some(LanguageModel::Ngram(model)) => {
                    token.lm_hist_code =
                        lm_history_hash(&token.lm_history, self.config.similar_lm_history_span, self.markers.start);
                    token.lm_log_prob += self.ngram_score(model, &token.lm_history, token.lm_hist_code) + penalty;
                }
                Some(LanguageModel::Fsa(fsa)) => {
                    let (_, log_prob) = fsa.walk(token.fsa_lm_node, self.sentence_end_lm);
                    token.lm_log_prob += log_prob + penalty;
                    token.fsa_lm_node = fsa.initial_node();
                }
                None => {}
            }
            token.word_count += 1;
            token.total_log_prob = token_log_prob(token.am_log_prob, token.lm_log_prob, self.config.lm_scale);

            if lattice_end {
                self.close_word_segment(&mut token, self.markers.end);
            }

            let total = token.total_log_prob;
            let id = self.pool.acquire(token);
            self.active[slot] = id;
            if lattice_end && best.map_or(true, |(_, score)| total > score) {
                best = Some((id, total));
            }
        }

        self.best_final_token = best.map(|(id, _)| id);
        debug!(
            frame = self.frame,
            tokens = self.active.len(),
            final_token = self.best_final_token.is_some(),
            "final tokens updated"
        );
    }

    /// Best token in a final node, or the best token overall with
    /// `complete == false` when no token reached a final node.
    pub fn best_final_token(&self) -> Result<(TokenId, bool)> {
        if let Some(id) = self.best_final_token {
            return Ok((id, true));
        }

        let mut best_final: Option<TokenId> = None;
        let mut best_other: Option<TokenId> = None;
        for &id in &self.active {
            let token = self.pool.get(id);
            let slot = if self.lexicon.node(token.node).has_flag(NodeFlags::FINAL) {
                &mut best_final
            } else {
                &mut best_other
            };
            if slot.map_or(true, |best| token.total_log_prob > self.pool.get(best).total_log_prob) {
                *slot = Some(id);
            }
        }

        match (best_final, best_other) {
            (Some(id), _) => Ok((id, true)),
            (None, Some(id)) => {
                warn!("No tokens in final nodes. The result will be incomplete. Try increasing beam.");
                Ok((id, false))
            }
            (None, None) => Err(DecoderError::EmptySearch),
        }
    }

    /// First active token.
    pub fn first_token(&self) -> Result<TokenId> {
        self.active.first().copied().ok_or(DecoderError::EmptySearch)
    }

    /// The result token: the best final token or the first active token.
    pub(crate) fn result_token(&self, use_best: bool) -> Result<&Token> {
        let id = if use_best {
            self.best_final_token()?.0
        } else {
            self.first_token()?
        };
        Ok(self.pool.get(id))
    }
}
