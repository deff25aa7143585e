//! The `tokenpass_decoder` core library.
//!
//! This crate provides the search core of a large-vocabulary speech
//! recognizer: a frame-synchronous token-passing search over a lexicon
//! prefix tree, with n-gram or finite-state language models, LM lookahead,
//! beam and histogram pruning, and word graph (lattice) generation.

pub mod config;
pub mod constants;
pub mod error;
pub mod reliability;
pub mod search;
pub mod types;

pub use config::{LookaheadMode, PruningStrategy, SearchConfig};
pub use error::{DecoderError, Result};
pub use search::{AcousticModel, FsaLanguageModel, NgramModel, TokenPassSearch, Vocabulary};
pub use types::{NodeId, Recognition, RecognizedWord, StateSpan, TokenId, WordId};
