//! Word graph construction and the textual lattice format.
//!
//! Lattice nodes are shared by the tokens whose most recent completed word
//! they represent. Each node owns its incoming arcs, and every arc keeps its
//! source alive, so a node lives exactly as long as some token can still
//! reach it. Fragments behind pruned tokens disappear on their own.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Write;
use std::rc::{Rc, Weak};

use crate::constants::lattice::{FORMAT_VERSION, NULL_WORD};
use crate::constants::search::NO_WORD;
use crate::error::{DecoderError, Result};
use crate::search::traits::Vocabulary;
use crate::types::WordId;

struct LatticeNode {
    id: usize,
    frame: i32,
    word_id: WordId,
    lex_node_id: usize,
    incoming: RefCell<Vec<LatticeArc>>,
}

struct LatticeArc {
    source: LatticeNodeRef,
    am_weight: f32,
    lm_weight: f32,
}

/// Counted reference to a lattice node.
#[derive(Clone)]
pub struct LatticeNodeRef(Rc<LatticeNode>);

impl LatticeNodeRef {
    /// Creation index; the root is 0.
    pub fn id(&self) -> usize {
        self.0.id
    }

    pub fn frame(&self) -> i32 {
        self.0.frame
    }

    pub fn word_id(&self) -> WordId {
        self.0.word_id
    }

    pub fn lex_node_id(&self) -> usize {
        self.0.lex_node_id
    }

    pub fn incoming_arcs(&self) -> usize {
        self.0.incoming.borrow().len()
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }

    pub fn reference_count(&self) -> usize {
        Rc::strong_count(&self.0)
    }
}

impl std::fmt::Debug for LatticeNodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatticeNode")
            .field("id", &self.0.id)
            .field("frame", &self.0.frame)
            .field("word_id", &self.0.word_id)
            .field("lex_node_id", &self.0.lex_node_id)
            .finish()
    }
}

impl Drop for LatticeNode {
    // Release predecessors iteratively, like history chains.
    fn drop(&mut self) {
        let mut pending: Vec<LatticeArc> = std::mem::take(self.incoming.get_mut());
        while let Some(arc) = pending.pop() {
            if let Ok(mut node) = Rc::try_unwrap(arc.source.0) {
                pending.append(node.incoming.get_mut());
            }
        }
    }
}

#[derive(Default)]
struct RecentWordNodes {
    frame: i32,
    nodes: Vec<(usize, Weak<LatticeNode>)>,
}

/// Builder for the word graph of one utterance.
pub struct WordGraph {
    next_id: usize,
    recent: Vec<RecentWordNodes>,
}

impl WordGraph {
    pub fn new(words: usize) -> Self {
        Self {
            next_id: 0,
            recent: Self::empty_recent(words),
        }
    }

    fn empty_recent(words: usize) -> Vec<RecentWordNodes> {
        (0..words)
            .map(|_| RecentWordNodes {
                frame: -1,
                nodes: Vec::new(),
            })
            .collect()
    }

    /// Start a new graph and return its root node (id 0).
    pub fn reset(&mut self, lex_node_id: usize) -> LatticeNodeRef {
        self.next_id = 0;
        let words = self.recent.len();
        self.recent = Self::empty_recent(words);
        self.create_node(-1, NO_WORD, lex_node_id)
    }

    /// Number of nodes created since the last reset.
    pub fn nodes_created(&self) -> usize {
        self.next_id
    }

    fn create_node(&mut self, frame: i32, word_id: WordId, lex_node_id: usize) -> LatticeNodeRef {
        let node = LatticeNodeRef(Rc::new(LatticeNode {
            id: self.next_id,
            frame,
            word_id,
            lex_node_id,
            incoming: RefCell::new(Vec::new()),
        }));
        self.next_id += 1;
        node
    }

    /// Node for `word_id` ending at `frame` in lexicon node `lex_node_id`,
    /// reusing one created earlier in the same frame when it is still alive.
    pub fn node_for(&mut self, frame: i32, word_id: WordId, lex_node_id: usize) -> LatticeNodeRef {
        let slot = usize::try_from(word_id).ok().filter(|&w| w < self.recent.len());
        let Some(slot) = slot else {
            return self.create_node(frame, word_id, lex_node_id);
        };

        let recent = &mut self.recent[slot];
        if recent.frame != frame {
            recent.frame = frame;
            recent.nodes.clear();
        }
        let existing = recent
            .nodes
            .iter()
            .find(|(lex, _)| *lex == lex_node_id)
            .and_then(|(_, weak)| weak.upgrade());
        if let Some(node) = existing {
            return LatticeNodeRef(node);
        }

        let node = self.create_node(frame, word_id, lex_node_id);
        let recent = &mut self.recent[slot];
        recent.nodes.retain(|(lex, _)| *lex != lex_node_id);
        recent.nodes.push((lex_node_id, Rc::downgrade(&node.0)));
        node
    }

    /// Add an arc from `source` into `target`.
    pub fn add_arc(source: &LatticeNodeRef, target: &LatticeNodeRef, am_weight: f32, lm_weight: f32) {
        target.0.incoming.borrow_mut().push(LatticeArc {
            source: source.clone(),
            am_weight,
            lm_weight,
        });
    }
}

/// Options for rendering a graph as a lattice document.
pub struct LatticeLabels<'a> {
    pub vocabulary: &'a dyn Vocabulary,
    /// Words written as `!NULL`.
    pub null_words: &'a [WordId],
    pub lm_scale: f32,
    pub insertion_penalty: f32,
}

/// Node line of a lattice document.
#[derive(Debug, Clone, PartialEq)]
pub struct LatticeNodeLine {
    pub id: usize,
    pub frame: i32,
}

/// Arc line of a lattice document.
#[derive(Debug, Clone, PartialEq)]
pub struct LatticeArcLine {
    pub id: usize,
    pub source: usize,
    pub target: usize,
    pub word: String,
    pub am_log_prob: f32,
    pub lm_log_prob: f32,
}

/// A lattice in its textual form.
#[derive(Debug, Clone, PartialEq)]
pub struct LatticeDocument {
    pub lm_scale: f32,
    pub insertion_penalty: f32,
    pub start: usize,
    pub end: usize,
    pub nodes: Vec<LatticeNodeLine>,
    pub arcs: Vec<LatticeArcLine>,
}

impl LatticeDocument {
    /// Collect every node from which `end` can be reached, numbered densely
    /// in creation order.
    pub fn from_graph(end: &LatticeNodeRef, labels: &LatticeLabels<'_>) -> Self {
        let mut reachable: HashMap<usize, LatticeNodeRef> = HashMap::new();
        let mut stack = vec![end.clone()];
        while let Some(node) = stack.pop() {
            if reachable.contains_key(&node.id()) {
                continue;
            }
            for arc in node.0.incoming.borrow().iter() {
                if !reachable.contains_key(&arc.source.id()) {
                    stack.push(arc.source.clone());
                }
            }
            reachable.insert(node.id(), node);
        }

        let mut ordered: Vec<LatticeNodeRef> = reachable.into_values().collect();
        ordered.sort_by_key(LatticeNodeRef::id);
        let renumber: HashMap<usize, usize> = ordered
            .iter()
            .enumerate()
            .map(|(index, node)| (node.id(), index))
            .collect();

        let nodes = ordered
            .iter()
            .enumerate()
            .map(|(id, node)| LatticeNodeLine { id, frame: node.frame() })
            .collect();

        let mut arcs = Vec::new();
        for (target, node) in ordered.iter().enumerate() {
            let incoming = node.0.incoming.borrow();
            // The root has no incoming arcs and no word to label.
            if incoming.is_empty() {
                continue;
            }
            let word = if node.word_id() < 0 || labels.null_words.contains(&node.word_id()) {
                NULL_WORD.to_string()
            } else {
                labels.vocabulary.word(node.word_id()).to_string()
            };
            for arc in incoming.iter() {
                arcs.push(LatticeArcLine {
                    id: arcs.len(),
                    source: renumber[&arc.source.id()],
                    target,
                    word: word.clone(),
                    am_log_prob: arc.am_weight,
                    lm_log_prob: arc.lm_weight / labels.lm_scale - labels.insertion_penalty,
                });
            }
        }

        Self {
            lm_scale: labels.lm_scale,
            insertion_penalty: labels.insertion_penalty,
            start: 0,
            end: renumber[&end.id()],
            nodes,
            arcs,
        }
    }

    pub fn write<W: Write>(&self, out: &mut W) -> Result<()> {
        write!(
            out,
            "VERSION={}\nbase=10\ndir=f\nlmscale={:.6} wdpenalty={:.6}\nN={}\tL={}\nstart={} end={}\n",
            FORMAT_VERSION,
            self.lm_scale,
            self.insertion_penalty,
            self.nodes.len(),
            self.arcs.len(),
            self.start,
            self.end
        )?;
        for node in &self.nodes {
            writeln!(out, "I={}\tt={}", node.id, node.frame)?;
        }
        for arc in &self.arcs {
            writeln!(
                out,
                "J={}\tS={}\tE={}\tW={}\tv=0\ta={}\tl={}",
                arc.id,
                arc.source,
                arc.target,
                arc.word,
                scientific(arc.am_log_prob),
                scientific(arc.lm_log_prob)
            )?;
        }
        Ok(())
    }

    pub fn to_text(&self) -> Result<String> {
        let mut buffer = Vec::new();
        self.write(&mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| DecoderError::LatticeParse { line: 0, message: e.to_string() })
    }

    /// Parse a lattice written by [`LatticeDocument::write`].
    pub fn parse(text: &str) -> Result<Self> {
        let mut doc = LatticeDocument {
            lm_scale: 1.0,
            insertion_penalty: 0.0,
            start: 0,
            end: 0,
            nodes: Vec::new(),
            arcs: Vec::new(),
        };
        let mut declared: Option<(usize, usize)> = None;

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let fields = Fields::parse(raw, line)?;
            if fields.is_empty() {
                continue;
            }

            if fields.has("I") {
                doc.nodes.push(LatticeNodeLine {
                    id: fields.number("I")?,
                    frame: fields.number("t")?,
                });
            } else if fields.has("J") {
                doc.arcs.push(LatticeArcLine {
                    id: fields.number("J")?,
                    source: fields.number("S")?,
                    target: fields.number("E")?,
                    word: fields.text("W")?.to_string(),
                    am_log_prob: fields.number("a")?,
                    lm_log_prob: fields.number("l")?,
                });
            } else {
                if fields.has("lmscale") {
                    doc.lm_scale = fields.number("lmscale")?;
                }
                if fields.has("wdpenalty") {
                    doc.insertion_penalty = fields.number("wdpenalty")?;
                }
                if fields.has("N") {
                    declared = Some((fields.number("N")?, fields.number("L")?));
                }
                if fields.has("start") {
                    doc.start = fields.number("start")?;
                }
                if fields.has("end") {
                    doc.end = fields.number("end")?;
                }
            }
        }

        let Some((nodes, arcs)) = declared else {
            return Err(DecoderError::LatticeParse {
                line: 0,
                message: "missing N=/L= header".to_string(),
            });
        };
        if nodes != doc.nodes.len() || arcs != doc.arcs.len() {
            return Err(DecoderError::LatticeParse {
                line: 0,
                message: format!(
                    "header declares {} nodes and {} arcs, found {} and {}",
                    nodes,
                    arcs,
                    doc.nodes.len(),
                    doc.arcs.len()
                ),
            });
        }
        if let Some(arc) = doc.arcs.iter().find(|a| a.source >= nodes || a.target >= nodes) {
            return Err(DecoderError::LatticeParse {
                line: 0,
                message: format!("arc {} refers to a missing node", arc.id),
            });
        }
        Ok(doc)
    }
}

struct Fields<'a> {
    line: usize,
    pairs: Vec<(&'a str, &'a str)>,
}

impl<'a> Fields<'a> {
    fn parse(raw: &'a str, line: usize) -> Result<Self> {
        let mut pairs = Vec::new();
        for item in raw.split_whitespace() {
            let (key, value) = item.split_once('=').ok_or_else(|| DecoderError::LatticeParse {
                line,
                message: format!("expected key=value, found {:?}", item),
            })?;
            pairs.push((key, value));
        }
        Ok(Self { line, pairs })
    }

    fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    fn has(&self, key: &str) -> bool {
        self.pairs.iter().any(|(k, _)| *k == key)
    }

    fn text(&self, key: &str) -> Result<&'a str> {
        self.pairs
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
            .ok_or_else(|| DecoderError::LatticeParse {
                line: self.line,
                message: format!("missing field {}", key),
            })
    }

    fn number<T: std::str::FromStr>(&self, key: &str) -> Result<T> {
        let value = self.text(key)?;
        value.parse().map_err(|_| DecoderError::LatticeParse {
            line: self.line,
            message: format!("invalid value {:?} for {}", value, key),
        })
    }
}

/// Format like C's `%e`: six fraction digits and a signed two-digit exponent.
fn scientific(value: f32) -> String {
    let formatted = format!("{:.6e}", value);
    match formatted.split_once('e') {
        Some((mantissa, exponent)) => {
            let exponent: i32 = exponent.parse().unwrap_or(0);
            let sign = if exponent < 0 { '-' } else { '+' };
            format!("{}e{}{:02}", mantissa, sign, exponent.abs())
        }
        None => formatted,
    }
}
