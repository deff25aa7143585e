//! The token-passing search.
//!
//! This module contains the search itself together with the data it runs
//! over: the lexicon tree, token records and their pool, shared history
//! chains, LM score caches, pruning and word graph construction.

mod decoder;
pub mod history;
pub mod lattice;
pub mod lexicon;
mod lm_cache;
mod lookahead;
mod output;
pub mod pool;
mod pruning;
mod token;
pub mod traits;
mod vocabulary;

pub use decoder::{SearchStats, TokenPassSearch};
pub use history::{History, LmHistory, LmWord, StateHistory, StateSegment, WordHistory, WordSegment};
pub use lattice::{LatticeDocument, LatticeLabels, LatticeNodeRef, WordGraph};
pub use lexicon::{DurationModel, HmmState, LexArc, LexNode, LexiconTree, NodeFlags};
pub use lm_cache::{
    build_ngram_context, is_similar_lm_history, lm_history_hash, ngram_log_prob, LmCacheStats, LmScoreCache,
    SentenceMarkers,
};
pub use lookahead::{LookaheadCache, LookaheadStats};
pub use pool::{PoolStats, SlabPool};
pub use pruning::{BeamController, PruneCandidate, PruneReport, ScoreHistogram, Watermarks};
pub use token::{token_log_prob, Token, TokenPool};
pub use traits::{AcousticModel, FsaLanguageModel, NgramModel, Vocabulary};
pub use vocabulary::WordList;
