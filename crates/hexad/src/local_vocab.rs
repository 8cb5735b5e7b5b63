//! Per-result bags of strings materialised during evaluation that are not
//! part of the global dictionary.
//!
//! A [`LocalVocabChunk`] is immutable once published and carries a
//! process-unique id, so a [`ValueId::from_local_vocab_index`] minted for it
//! stays resolvable in every result the chunk is merged into. Merging bags
//! only clones `Arc`s; the lifetime of a chunk is the longest holder among
//! the tables derived from it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::{FastMap8, InternalError, Result, ValueId};

static NEXT_CHUNK_ID: AtomicU32 = AtomicU32::new(0);

#[derive(Debug)]
pub struct LocalVocabChunk {
    id: u32,
    words: Vec<String>,
}

impl LocalVocabChunk {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn word(&self, index: u32) -> Option<&str> {
        self.words.get(index as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

/// Accumulates the strings one operator materialises for one fragment;
/// frozen into an immutable chunk at the yield point.
#[derive(Debug)]
pub struct LocalVocabBuilder {
    id: u32,
    words: Vec<String>,
    index: FastMap8<String, u32>,
}

impl Default for LocalVocabBuilder {
    fn default() -> Self {
        LocalVocabBuilder::new()
    }
}

impl LocalVocabBuilder {
    pub fn new() -> LocalVocabBuilder {
        LocalVocabBuilder {
            id: NEXT_CHUNK_ID.fetch_add(1, Ordering::Relaxed),
            words: Vec::new(),
            index: FastMap8::default(),
        }
    }

    /// Interns `word` and returns the id addressing it. Duplicates get the
    /// id minted for the first occurrence.
    pub fn get_or_add(&mut self, word: &str) -> ValueId {
        if let Some(&existing) = self.index.get(word) {
            return ValueId::from_local_vocab_index(self.id, existing);
        }
        let position = self.words.len() as u32;
        self.words.push(word.to_owned());
        self.index.insert(word.to_owned(), position);
        ValueId::from_local_vocab_index(self.id, position)
    }

    pub fn word(&self, index: u32) -> Option<&str> {
        self.words.get(index as usize).map(String::as_str)
    }

    pub fn chunk_id(&self) -> u32 {
        self.id
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn freeze(self) -> Arc<LocalVocabChunk> {
        Arc::new(LocalVocabChunk { id: self.id, words: self.words })
    }
}

/// The bag of chunks one table fragment keeps alive.
#[derive(Debug, Default, Clone)]
pub struct LocalVocab {
    chunks: BTreeMap<u32, Arc<LocalVocabChunk>>,
}

impl LocalVocab {
    pub fn new() -> LocalVocab {
        LocalVocab::default()
    }

    pub fn from_builder(builder: LocalVocabBuilder) -> LocalVocab {
        let mut vocab = LocalVocab::new();
        if !builder.is_empty() {
            vocab.adopt(builder.freeze());
        }
        vocab
    }

    pub fn adopt(&mut self, chunk: Arc<LocalVocabChunk>) {
        self.chunks.insert(chunk.id(), chunk);
    }

    /// Merges the chunks of `other` into `self`. Chunk ids are unique per
    /// process, so a collision always refers to the same chunk.
    pub fn merge(&mut self, other: &LocalVocab) {
        for (&id, chunk) in &other.chunks {
            self.chunks.entry(id).or_insert_with(|| chunk.clone());
        }
    }

    /// One output vocab whose lifetime covers every row of a merged table.
    pub fn merged<'a>(vocabs: impl IntoIterator<Item = &'a LocalVocab>) -> LocalVocab {
        let mut result = LocalVocab::new();
        for vocab in vocabs {
            result.merge(vocab);
        }
        result
    }

    pub fn resolve(&self, id: ValueId) -> Result<&str> {
        let (chunk_id, word) = id
            .as_local_vocab_index()
            .expect("resolve called with an id that is not a local vocab index");
        let chunk = self
            .chunks
            .get(&chunk_id)
            .ok_or(InternalError::DeadLocalVocabChunk { chunk: chunk_id })?;
        chunk
            .word(word)
            .ok_or_else(|| InternalError::DeadLocalVocabChunk { chunk: chunk_id }.into())
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_dedupes_within_a_builder() {
        let mut builder = LocalVocabBuilder::new();
        let a = builder.get_or_add("hello");
        let b = builder.get_or_add("world");
        let c = builder.get_or_add("hello");
        assert_eq!(a, c);
        assert_ne!(a, b);
    }

    #[test]
    fn resolve_after_freeze_and_merge() {
        let mut builder = LocalVocabBuilder::new();
        let id = builder.get_or_add("concatenated");
        let vocab = LocalVocab::from_builder(builder);

        let mut other_builder = LocalVocabBuilder::new();
        let other_id = other_builder.get_or_add("other");
        let other = LocalVocab::from_builder(other_builder);

        let merged = LocalVocab::merged([&vocab, &other]);
        assert_eq!(merged.resolve(id).unwrap(), "concatenated");
        assert_eq!(merged.resolve(other_id).unwrap(), "other");
        assert_eq!(merged.num_chunks(), 2);
    }

    #[test]
    fn resolving_a_dropped_chunk_fails() {
        let mut builder = LocalVocabBuilder::new();
        let id = builder.get_or_add("ephemeral");
        drop(builder);
        let empty = LocalVocab::new();
        assert!(empty.resolve(id).is_err());
    }

    #[test]
    fn merging_the_same_chunk_twice_keeps_one_copy() {
        let mut builder = LocalVocabBuilder::new();
        builder.get_or_add("w");
        let vocab = LocalVocab::from_builder(builder);
        let merged = LocalVocab::merged([&vocab, &vocab.clone()]);
        assert_eq!(merged.num_chunks(), 1);
    }
}
