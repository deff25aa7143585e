//! Search configuration.
//!
//! `SearchConfig` collects every tunable of the token-passing search. It is loaded
//! with figment from built-in defaults, `tokenpass.toml`, `tokenpass.yaml` and
//! `TOKENPASS_*` environment variables, in increasing order of precedence.

use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{cache, pruning, search};
use crate::error::{DecoderError, Result};

/// Language-model lookahead mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LookaheadMode {
    /// No lookahead; partial words carry the LM score of the last completed word.
    #[default]
    Off,
    /// Keyed by the most recent word.
    Bigram,
    /// Keyed by the two most recent words.
    Trigram,
}

/// Additional token-discard rule evaluated next to the global beam.
///
/// Every variant also applies the global and word-end beams; the extra
/// beams below compare a token against the best score of its peer group.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PruningStrategy {
    /// Global and word-end beams only.
    #[default]
    Beam,
    /// Extra beam over tokens in fan-in nodes.
    FanIn { beam: f32 },
    /// Extra beam over tokens in fan-out nodes.
    FanOut { beam: f32 },
    /// Extra beam over tokens with the same number of words.
    EqualWordCount { beam: f32 },
    /// Extra beam over tokens at the same tree depth.
    EqualDepth { beam: f32 },
}

/// Tunables of the token-passing search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    /// General beam width.
    #[serde(default = "default_beam")]
    pub global_beam: f32,

    /// Beam width applied to tokens in word-end nodes.
    #[serde(default = "default_beam")]
    pub word_end_beam: f32,

    /// Histogram pruning cap, 0 for unlimited.
    #[serde(default)]
    pub max_num_tokens: usize,

    /// Language-model scale factor.
    #[serde(default = "default_lm_scale")]
    pub lm_scale: f32,

    /// Log-probability added for every scored word.
    #[serde(default)]
    pub insertion_penalty: f32,

    /// Weight of the state duration model.
    #[serde(default)]
    pub duration_scale: f32,

    /// Weight of lexicon transition log-probabilities.
    #[serde(default = "default_transition_scale")]
    pub transition_scale: f32,

    /// Number of recent words compared when recombining tokens and hashing histories.
    #[serde(default)]
    pub similar_lm_history_span: usize,

    /// LM lookahead mode.
    #[serde(default)]
    pub lm_lookahead: LookaheadMode,

    /// Capacity of the lookahead score vector cache.
    #[serde(default = "default_max_lookahead_score_lists")]
    pub max_lookahead_score_lists: usize,

    /// Capacity of each lexicon node's lookahead result buffer.
    #[serde(default = "default_max_node_lookahead_buffer_size")]
    pub max_node_lookahead_buffer_size: usize,

    /// Enable the LM score cache.
    #[serde(default = "default_true")]
    pub use_lm_cache: bool,

    /// Capacity of the LM score cache.
    #[serde(default = "default_max_lm_cache_size")]
    pub max_lm_cache_size: usize,

    /// Frames a token may stay in a state with a valid duration model.
    #[serde(default = "default_max_state_duration")]
    pub max_state_duration: u32,

    /// Sentence start word, e.g. `<s>`.
    #[serde(default)]
    pub sentence_start: Option<String>,

    /// Sentence end word, e.g. `</s>`.
    #[serde(default)]
    pub sentence_end: Option<String>,

    /// Optional word-boundary word, e.g. `<w>`.
    #[serde(default)]
    pub word_boundary: Option<String>,

    /// Force a sentence end into every hypothesis at end of input.
    #[serde(default)]
    pub require_sentence_end: bool,

    /// Build a word graph during the search.
    #[serde(default)]
    pub generate_lattice: bool,

    /// Record the acoustic-state sequence of every token.
    #[serde(default)]
    pub keep_state_segmentation: bool,

    /// Pruning strategy.
    #[serde(default)]
    pub pruning: PruningStrategy,
}

fn default_beam() -> f32 { pruning::DEFAULT_BEAM }
fn default_lm_scale() -> f32 { 1.0 }
fn default_transition_scale() -> f32 { 1.0 }
fn default_true() -> bool { true }
fn default_max_lookahead_score_lists() -> usize { cache::DEFAULT_MAX_LOOKAHEAD_SCORE_LISTS }
fn default_max_node_lookahead_buffer_size() -> usize { cache::DEFAULT_MAX_NODE_LOOKAHEAD_BUFFER_SIZE }
fn default_max_lm_cache_size() -> usize { cache::DEFAULT_MAX_LM_CACHE_SIZE }
fn default_max_state_duration() -> u32 { search::DEFAULT_MAX_STATE_DURATION }

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            global_beam: default_beam(),
            word_end_beam: default_beam(),
            max_num_tokens: 0,
            lm_scale: default_lm_scale(),
            insertion_penalty: 0.0,
            duration_scale: 0.0,
            transition_scale: default_transition_scale(),
            similar_lm_history_span: 0,
            lm_lookahead: LookaheadMode::Off,
            max_lookahead_score_lists: default_max_lookahead_score_lists(),
            max_node_lookahead_buffer_size: default_max_node_lookahead_buffer_size(),
            use_lm_cache: true,
            max_lm_cache_size: default_max_lm_cache_size(),
            max_state_duration: default_max_state_duration(),
            sentence_start: None,
            sentence_end: None,
            word_boundary: None,
            require_sentence_end: false,
            generate_lattice: false,
            keep_state_segmentation: false,
            pruning: PruningStrategy::Beam,
        }
    }
}

impl SearchConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Environment variables prefixed `TOKENPASS_` (highest priority)
    /// 2. tokenpass.yaml (if exists)
    /// 3. tokenpass.toml (if exists)
    /// 4. Built-in defaults (lowest priority)
    pub fn load() -> Result<Self> {
        let config: SearchConfig = Self::default_figment()
            .merge(Toml::file("tokenpass.toml"))
            .merge(Yaml::file("tokenpass.yaml"))
            .merge(Env::prefixed("TOKENPASS_"))
            .extract()
            .map_err(|e| DecoderError::Config(format!("Failed to load configuration: {}", e)))?;

        config.validate()?;
        debug!(?config, "search configuration loaded");
        Ok(config)
    }

    /// Load configuration from one TOML or YAML file layered over the defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let figment = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::default_figment().merge(Yaml::file(path)),
            Some("toml") => Self::default_figment().merge(Toml::file(path)),
            _ => {
                return Err(DecoderError::Config(format!(
                    "Unsupported configuration file extension: {}",
                    path.display()
                )))
            }
        };

        let config: SearchConfig = figment.extract().map_err(|e| {
            DecoderError::Config(format!("Failed to load {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    fn default_figment() -> Figment {
        Figment::from(Serialized::defaults(SearchConfig::default()))
    }

    /// True when both sentence boundary words are configured.
    pub fn uses_sentence_boundary(&self) -> bool {
        self.sentence_start.is_some() && self.sentence_end.is_some()
    }

    /// Validate configuration values and combinations.
    pub fn validate(&self) -> Result<()> {
        if !(self.global_beam > 0.0) || !(self.word_end_beam > 0.0) {
            return Err(DecoderError::Config(
                "global_beam and word_end_beam must be positive".to_string(),
            ));
        }

        if !(self.lm_scale > 0.0) {
            return Err(DecoderError::Config("lm_scale must be positive".to_string()));
        }

        if self.sentence_start.is_some() != self.sentence_end.is_some() {
            return Err(DecoderError::Config(
                "sentence_start and sentence_end must be configured together".to_string(),
            ));
        }

        if self.generate_lattice {
            if !self.uses_sentence_boundary() {
                return Err(DecoderError::Config(
                    "Word graph can be generated only if sentence boundary is used".to_string(),
                ));
            }
            if self.similar_lm_history_span < 2 {
                return Err(DecoderError::Config(
                    "similar_lm_history_span must be at least 2 when a word graph is requested"
                        .to_string(),
                ));
            }
        }

        if self.require_sentence_end && !self.uses_sentence_boundary() {
            return Err(DecoderError::Config(
                "require_sentence_end needs sentence_start and sentence_end".to_string(),
            ));
        }

        if self.use_lm_cache && self.max_lm_cache_size == 0 {
            return Err(DecoderError::Config(
                "max_lm_cache_size must be positive when the LM cache is enabled".to_string(),
            ));
        }

        if self.lm_lookahead != LookaheadMode::Off
            && (self.max_lookahead_score_lists == 0 || self.max_node_lookahead_buffer_size == 0)
        {
            return Err(DecoderError::Config(
                "lookahead cache sizes must be positive when lookahead is enabled".to_string(),
            ));
        }

        match self.pruning {
            PruningStrategy::Beam => {}
            PruningStrategy::FanIn { beam }
            | PruningStrategy::FanOut { beam }
            | PruningStrategy::EqualWordCount { beam }
            | PruningStrategy::EqualDepth { beam } => {
                if !(beam > 0.0) {
                    return Err(DecoderError::Config(
                        "pruning strategy beam must be positive".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Export configuration to TOML format
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| DecoderError::Serialization(format!("Failed to serialize to TOML: {}", e)))
    }

    /// Export configuration to YAML format
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| DecoderError::Serialization(format!("Failed to serialize to YAML: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn lattice_config() -> SearchConfig {
        SearchConfig {
            sentence_start: Some("<s>".into()),
            sentence_end: Some("</s>".into()),
            similar_lm_history_span: 2,
            generate_lattice: true,
            ..SearchConfig::default()
        }
    }

    #[test]
    fn test_defaults_validate() {
        let config = SearchConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_lm_cache_size, 15000);
        assert_eq!(config.max_state_duration, 80);
        assert_eq!(config.lm_lookahead, LookaheadMode::Off);
    }

    #[test]
    fn test_lattice_requires_sentence_boundary() {
        let config = SearchConfig {
            sentence_start: None,
            sentence_end: None,
            ..lattice_config()
        };
        assert!(matches!(config.validate(), Err(DecoderError::Config(_))));
    }

    #[test]
    fn test_lattice_requires_history_span() {
        let config = SearchConfig {
            similar_lm_history_span: 1,
            ..lattice_config()
        };
        assert!(matches!(config.validate(), Err(DecoderError::Config(_))));
        assert!(lattice_config().validate().is_ok());
    }

    #[test]
    fn test_half_sentence_boundary_rejected() {
        let config = SearchConfig {
            sentence_start: Some("<s>".into()),
            ..SearchConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_non_positive_beam_rejected() {
        let config = SearchConfig {
            global_beam: 0.0,
            ..SearchConfig::default()
        };
        assert!(config.validate().is_err());

        let config = SearchConfig {
            pruning: PruningStrategy::FanIn { beam: -1.0 },
            ..SearchConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_layers_file_and_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "tokenpass.toml",
                r#"
                    global_beam = 250.0
                    max_num_tokens = 5000
                    lm_lookahead = "bigram"

                    [pruning]
                    kind = "fan_in"
                    beam = 120.0
                "#,
            )?;
            jail.set_env("TOKENPASS_LM_SCALE", "28.5");

            let config = SearchConfig::load().expect("config should load");
            assert_eq!(config.global_beam, 250.0);
            assert_eq!(config.max_num_tokens, 5000);
            assert_eq!(config.lm_scale, 28.5);
            assert_eq!(config.lm_lookahead, LookaheadMode::Bigram);
            assert_eq!(config.pruning, PruningStrategy::FanIn { beam: 120.0 });
            assert_eq!(config.word_end_beam, pruning::DEFAULT_BEAM);
            Ok(())
        });
    }

    #[test]
    fn test_load_rejects_invalid_combination() {
        Jail::expect_with(|jail| {
            jail.create_file("tokenpass.yaml", "generate_lattice: true\n")?;
            assert!(SearchConfig::load().is_err());
            Ok(())
        });
    }

    #[test]
    fn test_from_file_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("search.yaml");
        std::fs::write(
            &path,
            "sentence_start: \"<s>\"\nsentence_end: \"</s>\"\nrequire_sentence_end: true\n",
        )
        .unwrap();

        let config = SearchConfig::from_file(&path).unwrap();
        assert!(config.require_sentence_end);
        assert!(config.uses_sentence_boundary());

        let bad = dir.path().join("search.ini");
        std::fs::write(&bad, "").unwrap();
        assert!(SearchConfig::from_file(&bad).is_err());
    }

    #[test]
    fn test_serialization_round_trip() {
        let config = lattice_config();
        let toml_text = config.to_toml().unwrap();
        let parsed: SearchConfig = toml::from_str(&toml_text).unwrap();
        assert_eq!(parsed, config);

        let yaml_text = config.to_yaml().unwrap();
        let parsed: SearchConfig = serde_yaml::from_str(&yaml_text).unwrap();
        assert_eq!(parsed, config);
    }
}
