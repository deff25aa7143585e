//! Result extraction: paths, trace output, state segmentation, scores and
//! the word graph of the best token.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::constants::lattice::TRACE_WORD_COLUMN;
use crate::error::{DecoderError, ErrorContext, Result};
use crate::search::decoder::TokenPassSearch;
use crate::search::history::{History, LmHistory};
use crate::search::lattice::{LatticeDocument, LatticeLabels};
use crate::search::token::token_log_prob;
use crate::types::{RecognizedWord, StateSpan};

/// Nodes of `head`'s chain that are due for output, newest first.
///
/// With `whole_path` every unprinted node is returned. Otherwise only the
/// trailing run of nodes referenced by a single successor is returned: the
/// part of the path that every live token shares.
fn pending_nodes<'h, P>(head: &'h History<P>, whole_path: bool, wanted: impl Fn(&P) -> bool) -> Vec<&'h History<P>> {
    let mut pending = Vec::new();
    let mut collect = whole_path;
    for node in head.iter() {
        if !whole_path && collect && node.reference_count() > 1 {
            pending.clear();
            collect = false;
        }
        if node.is_printed() {
            break;
        }
        if node.previous().is_some_and(|previous| previous.reference_count() == 1) {
            collect = true;
        }
        if collect && wanted(node.payload()) {
            pending.push(node);
        }
    }
    pending
}

impl<'a> TokenPassSearch<'a> {
    /// LM words of the result token in time order.
    ///
    /// The walk stops at the history root or at `limit`, which is excluded.
    pub fn path(&self, use_best: bool, limit: Option<&LmHistory>) -> Result<Vec<LmHistory>> {
        let token = self.result_token(use_best)?;
        let mut words: Vec<LmHistory> = token
            .lm_history
            .iter()
            .take_while(|node| node.word_id >= 0 && !limit.is_some_and(|limit| History::ptr_eq(node, limit)))
            .cloned()
            .collect();
        words.reverse();
        Ok(words)
    }

    /// Recognized words of the result token in time order.
    pub fn recognized_words(&self, use_best: bool) -> Result<Vec<RecognizedWord>> {
        Ok(self
            .path(use_best, None)?
            .iter()
            .map(|node| RecognizedWord {
                word_id: node.word_id,
                word: self.vocabulary.word(node.word_id).to_string(),
                start_frame: node.word_start_frame,
            })
            .collect())
    }

    /// Write the word segments of the result token, one per line: the word
    /// padded to a fixed column, then end frame, lexicon node and the
    /// negated acoustic, LM and cumulative scores.
    ///
    /// With `best_path == false` only the not yet printed part shared by all
    /// tokens is written, so repeated calls produce the recognition
    /// incrementally.
    pub fn write_word_history<W: Write>(&self, out: &mut W, best_path: bool) -> Result<()> {
        if !self.config.generate_lattice {
            return Err(DecoderError::LatticeNotGenerated);
        }
        let token = self.result_token(best_path)?;
        let Some(head) = &token.word_history else {
            return Err(DecoderError::LatticeNotGenerated);
        };

        for segment in pending_nodes(head, best_path, |segment| segment.word_id >= 0).into_iter().rev() {
            segment.mark_printed();
            let word = self.vocabulary.word(segment.word_id);
            let padding = TRACE_WORD_COLUMN.saturating_sub(word.len()).max(1);
            writeln!(
                out,
                "{} {:padding$}{}\t{}\t{:.3}\t{:.3}\t{:.3}",
                word,
                "",
                segment.end_frame,
                segment.lex_node_id,
                -segment.am_log_prob,
                -segment.lm_log_prob,
                -token_log_prob(segment.cum_am_log_prob, segment.cum_lm_log_prob, self.config.lm_scale),
            )?;
        }
        if best_path {
            writeln!(out)?;
        }
        out.flush()?;
        Ok(())
    }

    /// Write the recognized words separated by spaces. Incremental like
    /// [`write_word_history`](Self::write_word_history) when `best_path` is false.
    pub fn write_recognized_text<W: Write>(&self, out: &mut W, best_path: bool) -> Result<()> {
        let token = self.result_token(best_path)?;
        for word in pending_nodes(&token.lm_history, best_path, |word| word.word_id >= 0)
            .into_iter()
            .rev()
        {
            word.mark_printed();
            write!(out, "{} ", self.vocabulary.word(word.word_id))?;
        }
        if best_path {
            writeln!(out)?;
        }
        out.flush()?;
        Ok(())
    }

    /// Acoustic states on the best path with the frames spent in each.
    pub fn state_segmentation(&self) -> Result<Vec<StateSpan>> {
        let (id, _) = self.best_final_token()?;
        let token = self.pool.get(id);
        let Some(head) = &token.state_history else {
            return Ok(Vec::new());
        };

        let mut states: Vec<_> = head.iter().filter(|node| node.previous().is_some()).collect();
        states.reverse();
        let mut spans = Vec::with_capacity(states.len());
        for (index, state) in states.iter().enumerate() {
            let end_frame = states
                .get(index + 1)
                .map_or(self.frame as i32, |next| next.start_frame);
            spans.push(StateSpan {
                start_frame: state.start_frame,
                end_frame,
                model: state.hmm_model,
            });
        }
        Ok(spans)
    }

    /// Write the state segmentation as `start end model` lines.
    pub fn write_state_segmentation<W: Write>(&self, out: &mut W) -> Result<()> {
        for span in self.state_segmentation()? {
            writeln!(out, "{span}")?;
        }
        Ok(())
    }

    /// The state segmentation on one line: `start model` pairs followed by
    /// the current frame.
    pub fn state_history_string(&self) -> Result<String> {
        let mut text = String::new();
        for span in self.state_segmentation()? {
            text.push_str(&format!("{} {} ", span.start_frame, span.model));
        }
        text.push_str(&self.frame.to_string());
        Ok(text)
    }

    pub fn am_log_prob(&self, best: bool) -> Result<f32> {
        Ok(self.result_token(best)?.am_log_prob)
    }

    pub fn lm_log_prob(&self, best: bool) -> Result<f32> {
        Ok(self.result_token(best)?.lm_log_prob)
    }

    pub fn total_log_prob(&self, best: bool) -> Result<f32> {
        Ok(self.result_token(best)?.total_log_prob)
    }

    /// The word graph behind the best token, ready to be written.
    pub fn lattice_document(&self) -> Result<LatticeDocument> {
        if !self.config.generate_lattice {
            return Err(DecoderError::LatticeNotGenerated);
        }
        let (id, _) = self.best_final_token()?;
        let Some(end) = &self.pool.get(id).recent_lattice_node else {
            return Err(DecoderError::LatticeNotGenerated);
        };

        let null_words = [self.markers.start, self.markers.end];
        let labels = LatticeLabels {
            vocabulary: self.vocabulary,
            null_words: &null_words,
            lm_scale: self.config.lm_scale,
            insertion_penalty: self.config.insertion_penalty,
        };
        Ok(LatticeDocument::from_graph(end, &labels))
    }

    pub fn write_lattice<W: Write>(&self, out: &mut W) -> Result<()> {
        self.lattice_document()?.write(out)
    }

    /// Write the lattice of the best token to `path`.
    pub fn write_lattice_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let document = self.lattice_document()?;
        let file = File::create(path).with_context(|| format!("creating lattice file {}", path.display()))?;
        let mut out = BufWriter::new(file);
        document.write(&mut out)?;
        out.flush()
            .with_context(|| format!("writing lattice file {}", path.display()))
    }
}
