mod common;

use common::*;
use tokenpass_decoder::search::{LatticeDocument, NodeFlags, TokenPassSearch};
use tokenpass_decoder::SearchConfig;

fn lattice_config() -> SearchConfig {
    SearchConfig {
        generate_lattice: true,
        ..boundary_config()
    }
}

#[test]
fn test_lattice_follows_best_path() {
    let lex = lexicon(NodeFlags::NONE);
    let vocab = vocabulary();
    let lm = ToyBigram::new();
    let mut search = TokenPassSearch::new(&lex.tree, &vocab, lattice_config()).unwrap();
    search.set_ngram(&lm).unwrap();
    let result = search.decode(&mut TableAcoustics::yes_utterance()).unwrap();
    assert!(result.complete);
    assert_eq!(result.text(), "<s> yes </s>");

    let doc = search.lattice_document().unwrap();
    assert_eq!(doc.start, 0);
    assert_eq!(doc.nodes[0].frame, -1);
    assert_eq!(doc.nodes[doc.end].frame, 5);
    assert!(doc.nodes.iter().enumerate().all(|(i, node)| node.id == i));

    // Sentence boundaries are written as null words.
    assert!(doc
        .arcs
        .iter()
        .filter(|arc| arc.target == doc.end || arc.source == 0)
        .all(|arc| arc.word == "!NULL"));
    assert!(doc.arcs.iter().any(|arc| arc.word == "yes"
        && (arc.am_log_prob + 5.0).abs() < 1e-4
        && (arc.lm_log_prob + 0.5).abs() < 1e-4));
    assert!(doc.arcs.iter().all(|arc| arc.source < doc.nodes.len() && arc.target < doc.nodes.len()));
}

#[test]
fn test_lattice_file_round_trip() {
    let lex = lexicon(NodeFlags::NONE);
    let vocab = vocabulary();
    let lm = ToyBigram::new();
    let mut search = TokenPassSearch::new(&lex.tree, &vocab, lattice_config()).unwrap();
    search.set_ngram(&lm).unwrap();
    search.decode(&mut TableAcoustics::yes_utterance()).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("utterance.slf");
    search.write_lattice_file(&path).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.starts_with("VERSION=1.1\nbase=10\ndir=f\n"));

    let written = search.lattice_document().unwrap();
    let parsed = LatticeDocument::parse(&text).unwrap();
    assert_eq!(parsed.start, written.start);
    assert_eq!(parsed.end, written.end);
    assert_eq!(parsed.nodes, written.nodes);
    assert_eq!(parsed.arcs.len(), written.arcs.len());
    for (a, b) in parsed.arcs.iter().zip(&written.arcs) {
        assert_eq!((a.id, a.source, a.target, &a.word), (b.id, b.source, b.target, &b.word));
        assert!((a.am_log_prob - b.am_log_prob).abs() < 1e-3);
        assert!((a.lm_log_prob - b.lm_log_prob).abs() < 1e-3);
    }
}

#[test]
fn test_lattice_file_in_missing_directory() {
    let lex = lexicon(NodeFlags::NONE);
    let vocab = vocabulary();
    let lm = ToyBigram::new();
    let mut search = TokenPassSearch::new(&lex.tree, &vocab, lattice_config()).unwrap();
    search.set_ngram(&lm).unwrap();
    search.decode(&mut TableAcoustics::yes_utterance()).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let err = search
        .write_lattice_file(dir.path().join("missing").join("utterance.slf"))
        .unwrap_err();
    assert!(err.to_string().contains("creating lattice file"));
}

#[test]
fn test_word_history_trace() {
    let lex = lexicon(NodeFlags::NONE);
    let vocab = vocabulary();
    let lm = ToyBigram::new();
    let mut search = TokenPassSearch::new(&lex.tree, &vocab, lattice_config()).unwrap();
    search.set_ngram(&lm).unwrap();
    search.decode(&mut TableAcoustics::yes_utterance()).unwrap();

    let mut out = Vec::new();
    search.write_word_history(&mut out, true).unwrap();
    let text = String::from_utf8(out).unwrap();
    let lines: Vec<_> = text.lines().collect();

    assert_eq!(lines.len(), 4);
    assert!(lines[0].starts_with("<s> "));
    assert_eq!(lines[1], format!("yes {:13}5\t{}\t5.000\t0.500\t5.500", "", lex.silence));
    assert!(lines[2].starts_with("</s> "));
    assert_eq!(lines[3], "");
}

#[test]
fn test_lattice_nodes_freed_with_tokens() {
    let lex = lexicon(NodeFlags::NONE);
    let vocab = vocabulary();
    let lm = ToyBigram::new();
    let mut search = TokenPassSearch::new(&lex.tree, &vocab, lattice_config()).unwrap();
    search.set_ngram(&lm).unwrap();
    search.decode(&mut TableAcoustics::yes_utterance()).unwrap();

    let (id, _) = search.best_final_token().unwrap();
    let end = search.token(id).recent_lattice_node.clone().unwrap();
    assert!(end.incoming_arcs() > 0);

    // Resetting drops every token; only our handle keeps the end node.
    search.reset_search(0).unwrap();
    assert_eq!(end.reference_count(), 1);
}
