//! In-memory vocabulary.

use std::collections::HashMap;

use crate::search::traits::Vocabulary;
use crate::types::WordId;

/// Word list with a reverse index. Id 0 is conventionally the unknown word.
#[derive(Debug, Clone, Default)]
pub struct WordList {
    words: Vec<String>,
    index: HashMap<String, WordId>,
}

impl WordList {
    /// Build from words in id order. Later duplicates keep the first id.
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut list = Self::default();
        for word in words {
            list.add(word);
        }
        list
    }

    /// Add a word, returning its id.
    pub fn add(&mut self, word: impl Into<String>) -> WordId {
        let word = word.into();
        if let Some(&id) = self.index.get(&word) {
            return id;
        }
        let id = self.words.len() as WordId;
        self.index.insert(word.clone(), id);
        self.words.push(word);
        id
    }
}

impl Vocabulary for WordList {
    fn num_words(&self) -> usize {
        self.words.len()
    }

    fn word(&self, id: WordId) -> &str {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.words.get(i))
            .map(String::as_str)
            .unwrap_or("")
    }

    fn word_index(&self, word: &str) -> Option<WordId> {
        self.index.get(word).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_follow_insertion_order() {
        let mut words = WordList::new(["<unk>", "<s>", "</s>"]);
        assert_eq!(words.add("hello"), 3);
        assert_eq!(words.add("<s>"), 1);
        assert_eq!(words.num_words(), 4);
        assert_eq!(words.word(3), "hello");
        assert_eq!(words.word_index("</s>"), Some(2));
        assert_eq!(words.word_index("missing"), None);
        assert_eq!(words.word(-1), "");
    }
}
