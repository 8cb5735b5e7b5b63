//! The on-disk full-text index: an fst word dictionary pointing into a
//! postings file of `(text record, entity, term frequency)` entries.
//!
//! A query word may carry a trailing `*`; the dictionary is then walked
//! with a prefix automaton and the postings of every matching word are
//! merged. Scores are plain term frequencies.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::mem::size_of;
use std::path::Path;

use bytemuck::{Pod, Zeroable};
use byteorder::{ByteOrder, LittleEndian};
use charabia::Tokenize;
use fst::automaton::{Automaton, Str};
use fst::{IntoStreamer, Map, MapBuilder, Streamer};
use memmap2::Mmap;

use crate::{FastMap8, InternalError, Result, ValueId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct TextPosting {
    pub record: ValueId,
    pub entity: ValueId,
    pub frequency: u64,
}

const POSTING_LEN: usize = size_of::<TextPosting>();

/// Splits a text into normalised words.
pub fn tokenize(text: &str) -> Vec<String> {
    text.tokenize()
        .filter(|token| token.is_word())
        .map(|token| token.lemma().to_string())
        .collect()
}

/// Accumulates postings during index construction.
#[derive(Default)]
pub struct TextIndexWriter {
    postings: BTreeMap<String, Vec<TextPosting>>,
    record_count: u64,
}

impl TextIndexWriter {
    pub fn new() -> TextIndexWriter {
        TextIndexWriter::default()
    }

    /// Registers one text record and the entity it is attached to.
    pub fn add_record(&mut self, record: ValueId, entity: ValueId, text: &str) {
        let mut frequencies = FastMap8::<String, u64>::default();
        for word in tokenize(text) {
            *frequencies.entry(word).or_insert(0) += 1;
        }
        for (word, frequency) in frequencies {
            self.postings
                .entry(word)
                .or_default()
                .push(TextPosting { record, entity, frequency });
        }
        self.record_count += 1;
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    pub fn finish(self, fst_path: &Path, postings_path: &Path) -> Result<u64> {
        let mut dictionary =
            MapBuilder::new(BufWriter::new(File::create(fst_path)?)).map_err(InternalError::Fst)?;
        let mut postings_bytes: Vec<u8> = Vec::new();
        let word_count = self.postings.len() as u64;
        for (word, mut entries) in self.postings {
            entries.sort_unstable_by_key(|posting| (posting.record, posting.entity));
            let offset = postings_bytes.len() as u64;
            dictionary.insert(word, offset).map_err(InternalError::Fst)?;
            let mut header = [0u8; 4];
            LittleEndian::write_u32(&mut header, entries.len() as u32);
            postings_bytes.extend_from_slice(&header);
            postings_bytes.extend_from_slice(bytemuck::cast_slice(&entries));
        }
        dictionary.finish().map_err(InternalError::Fst)?;
        std::fs::write(postings_path, postings_bytes)?;
        Ok(word_count)
    }
}

/// Memory-mapped reader over the dictionary and postings files.
pub struct TextIndex {
    dictionary: Map<Mmap>,
    postings: Option<Mmap>,
    postings_file: String,
}

impl TextIndex {
    pub fn open(fst_path: &Path, postings_path: &Path) -> Result<TextIndex> {
        let file = File::open(fst_path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let dictionary = Map::new(mmap).map_err(InternalError::Fst)?;
        Ok(TextIndex {
            dictionary,
            postings: crate::vocabulary::map_file(postings_path)?,
            postings_file: postings_path.display().to_string(),
        })
    }

    pub fn word_count(&self) -> u64 {
        self.dictionary.len() as u64
    }

    fn postings_at(&self, offset: u64) -> Result<Vec<TextPosting>> {
        let corrupt = |reason: &str| InternalError::CorruptIndex {
            path: self.postings_file.clone(),
            reason: reason.to_owned(),
        };
        let bytes = self.postings.as_ref().map(|m| &m[..]).unwrap_or(&[]);
        let header = bytes
            .get(offset as usize..offset as usize + 4)
            .ok_or_else(|| corrupt("postings offset out of range"))?;
        let count = LittleEndian::read_u32(header) as usize;
        let body = bytes
            .get(offset as usize + 4..offset as usize + 4 + count * POSTING_LEN)
            .ok_or_else(|| corrupt("truncated postings"))?;
        Ok(bytemuck::pod_collect_to_vec(body))
    }

    /// The postings of `word`, where a trailing `*` makes it a prefix
    /// pattern. Merged postings are sorted by record and entity, with the
    /// frequencies of co-occurring words summed.
    pub fn postings_for_word(&self, word: &str) -> Result<Vec<TextPosting>> {
        let (prefix, is_prefix) = match word.strip_suffix('*') {
            Some(prefix) => (prefix, true),
            None => (word, false),
        };
        if !is_prefix {
            return match self.dictionary.get(prefix) {
                Some(offset) => self.postings_at(offset),
                None => Ok(Vec::new()),
            };
        }
        let automaton = Str::new(prefix).starts_with();
        let mut stream = self.dictionary.search(automaton).into_stream();
        let mut merged: BTreeMap<(ValueId, ValueId), u64> = BTreeMap::new();
        while let Some((_, offset)) = stream.next() {
            for posting in self.postings_at(offset)? {
                *merged.entry((posting.record, posting.entity)).or_insert(0) +=
                    posting.frequency;
            }
        }
        Ok(merged
            .into_iter()
            .map(|((record, entity), frequency)| TextPosting { record, entity, frequency })
            .collect())
    }

    pub fn contains_word(&self, word: &str) -> bool {
        self.dictionary.get(word).is_some()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn record(i: u64) -> ValueId {
        ValueId::from_text_record_index(i)
    }

    fn entity(i: u64) -> ValueId {
        ValueId::from_vocab_index(i)
    }

    fn build(records: &[(u64, u64, &str)]) -> (TempDir, TextIndex) {
        let dir = TempDir::new().unwrap();
        let fst_path = dir.path().join("text.fst");
        let postings_path = dir.path().join("text.postings");
        let mut writer = TextIndexWriter::new();
        for &(r, e, text) in records {
            writer.add_record(record(r), entity(e), text);
        }
        writer.finish(&fst_path, &postings_path).unwrap();
        (dir, TextIndex::open(&fst_path, &postings_path).unwrap())
    }

    #[test]
    fn exact_word_lookup() {
        let (_dir, index) = build(&[
            (0, 10, "he failed the test"),
            (1, 11, "testing can help"),
            (2, 12, "the test on friday was really hard"),
        ]);
        let postings = index.postings_for_word("test").unwrap();
        assert_eq!(postings.len(), 2);
        assert_eq!(postings[0].record, record(0));
        assert_eq!(postings[1].record, record(2));
        assert!(index.postings_for_word("exam").unwrap().is_empty());
    }

    #[test]
    fn prefix_lookup_merges_postings() {
        let (_dir, index) = build(&[
            (0, 10, "he failed the test"),
            (1, 11, "testing can help"),
            (2, 12, "the test on friday was really hard"),
            (3, 13, "some other sentence"),
        ]);
        let postings = index.postings_for_word("test*").unwrap();
        let records: Vec<ValueId> = postings.iter().map(|p| p.record).collect();
        assert_eq!(records, vec![record(0), record(1), record(2)]);
    }

    #[test]
    fn repeated_words_accumulate_frequency() {
        let (_dir, index) = build(&[(0, 10, "fish and more fish and even more fish")]);
        let postings = index.postings_for_word("fish").unwrap();
        assert_eq!(postings.len(), 1);
        assert_eq!(postings[0].frequency, 3);
    }
}
