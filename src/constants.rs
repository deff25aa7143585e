//! Domain constants for the token-passing search.
//!
//! This module contains compile-time constants used throughout the decoder.
//! These are separated from runtime configuration to provide clear distinction
//! between values that never change and those that can be configured.

/// Search-wide numeric constants.
pub mod search {
    /// Word id used for "no word": history roots and non-word lexicon nodes.
    pub const NO_WORD: i32 = -1;

    /// Initial value of the per-frame best-score watermarks.
    pub const LOG_PROB_FLOOR: f32 = -1e20;

    /// Maximum depth of the lexicon tree tracked by depth-based pruning.
    pub const MAX_LEX_TREE_DEPTH: usize = 60;

    /// Number of word-count slots tracked by word-count pruning.
    pub const MAX_WORD_COUNT_SLOTS: usize = 200;

    /// Default maximum number of frames a token may stay in one state.
    pub const DEFAULT_MAX_STATE_DURATION: u32 = 80;
}

/// Pruning constants.
pub mod pruning {
    /// Number of bins used by histogram pruning.
    pub const NUM_HISTOGRAM_BINS: usize = 100;

    /// Geometric growth of the current beam on frames without histogram pruning.
    pub const BEAM_GROWTH: f32 = 1.1;

    /// Narrowest current beam histogram pruning may leave behind.
    pub const MIN_BEAM: f32 = 0.1;

    /// Default beam when none is configured.
    pub const DEFAULT_BEAM: f32 = 1e10;
}

/// Cache sizing constants.
pub mod cache {
    /// Default capacity of the LM score cache.
    pub const DEFAULT_MAX_LM_CACHE_SIZE: usize = 15000;

    /// Default number of cached lookahead score vectors.
    pub const DEFAULT_MAX_LOOKAHEAD_SCORE_LISTS: usize = 512;

    /// Default per-node lookahead result buffer size.
    pub const DEFAULT_MAX_NODE_LOOKAHEAD_BUFFER_SIZE: usize = 512;

    /// Lookahead score used when a node has no reachable word in the score vector.
    pub const LOOKAHEAD_FLOOR: f32 = -1e10;
}

/// Token pool constants.
pub mod pool {
    /// Number of token slots added each time the pool runs dry.
    pub const TOKEN_RESERVE_BLOCK: usize = 1024;
}

/// Lattice output constants.
pub mod lattice {
    /// Version tag written in the lattice header.
    pub const FORMAT_VERSION: &str = "1.1";

    /// Word label written for sentence boundary arcs.
    pub const NULL_WORD: &str = "!NULL";

    /// Minimum column width of a word in trace output.
    pub const TRACE_WORD_COLUMN: usize = 16;
}
