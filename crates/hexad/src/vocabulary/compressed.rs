//! Block-wise dictionary compression for sorted vocabularies.
//!
//! Words are grouped into fixed-size blocks and front-coded: the first word
//! of a block is stored verbatim, every following word as the length of the
//! prefix it shares with its predecessor plus the remaining suffix. Sorted
//! dictionaries share long prefixes between neighbours, so this is where
//! the bulk of the compression comes from. Externalised words do not break
//! the chain; their text is pulled from the external file while decoding a
//! block.

use std::borrow::Cow;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use memmap2::Mmap;

use super::{external_words_path, map_file, read_word_at, VocabularyRead, WordWriter};
use crate::{InternalError, Result};

const FLAG_EXTERNAL: u8 = 1;

/// Writer for the compressed layout. Words must arrive in sorted order for
/// the shared prefixes to be worth anything, but the format itself does not
/// care.
pub struct CompressedVocabularyWriter {
    blocks: BufWriter<File>,
    block_offsets: Vec<u64>,
    external_words: BufWriter<File>,
    base: PathBuf,
    block_size: usize,
    bytes_written: u64,
    external_bytes_written: u64,
    previous_word: String,
    count: u64,
    finished: bool,
}

impl CompressedVocabularyWriter {
    pub fn new(base: &Path, block_size: u32) -> Result<CompressedVocabularyWriter> {
        debug_assert!(block_size > 0);
        Ok(CompressedVocabularyWriter {
            blocks: BufWriter::new(File::create(blocks_path(base))?),
            block_offsets: Vec::new(),
            external_words: BufWriter::new(File::create(external_words_path(base))?),
            base: base.to_owned(),
            block_size: block_size as usize,
            bytes_written: 0,
            external_bytes_written: 0,
            previous_word: String::new(),
            count: 0,
            finished: false,
        })
    }
}

fn shared_prefix_len(a: &str, b: &str) -> usize {
    let limit = u16::MAX as usize;
    a.bytes().zip(b.bytes()).take(limit).take_while(|(x, y)| x == y).count()
}

impl WordWriter for CompressedVocabularyWriter {
    fn push_word(&mut self, word: &str, is_external: bool) -> Result<u64> {
        debug_assert!(!self.finished);
        let index = self.count;
        if index as usize % self.block_size == 0 {
            self.block_offsets.push(self.bytes_written);
            // A block starts a fresh chain.
            self.previous_word.clear();
        }
        if is_external {
            self.blocks.write_u8(FLAG_EXTERNAL)?;
            self.blocks.write_u64::<LittleEndian>(self.external_bytes_written)?;
            self.bytes_written += 1 + 8;
            self.external_words.write_u32::<LittleEndian>(word.len() as u32)?;
            self.external_words.write_all(word.as_bytes())?;
            self.external_bytes_written += 4 + word.len() as u64;
        } else {
            let prefix = shared_prefix_len(&self.previous_word, word);
            let suffix = &word.as_bytes()[prefix..];
            self.blocks.write_u8(0)?;
            self.blocks.write_u16::<LittleEndian>(prefix as u16)?;
            self.blocks.write_u32::<LittleEndian>(suffix.len() as u32)?;
            self.blocks.write_all(suffix)?;
            self.bytes_written += 1 + 2 + 4 + suffix.len() as u64;
        }
        self.previous_word.clear();
        self.previous_word.push_str(word);
        self.count += 1;
        Ok(index)
    }

    fn finish(&mut self) -> Result<u64> {
        if !self.finished {
            self.blocks.flush()?;
            self.external_words.flush()?;
            let mut offsets = BufWriter::new(File::create(block_offsets_path(&self.base))?);
            offsets.write_u64::<LittleEndian>(self.count)?;
            for &offset in &self.block_offsets {
                offsets.write_u64::<LittleEndian>(offset)?;
            }
            offsets.flush()?;
            self.finished = true;
        }
        Ok(self.count)
    }
}

impl Drop for CompressedVocabularyWriter {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

/// Memory-mapped reader for the compressed layout. `word(i)` decodes the
/// block containing `i` up to the requested entry.
pub struct CompressedVocabulary {
    blocks: Option<Mmap>,
    external_words: Option<Mmap>,
    block_offsets: Vec<u64>,
    blocks_file: PathBuf,
    external_file: PathBuf,
    block_size: usize,
    len: u64,
}

impl CompressedVocabulary {
    pub fn open(base: &Path, block_size: u32) -> Result<CompressedVocabulary> {
        debug_assert!(block_size > 0);
        let offsets_file = block_offsets_path(base);
        let corrupt = |reason: &str| InternalError::CorruptIndex {
            path: offsets_file.display().to_string(),
            reason: reason.to_owned(),
        };
        let (len, block_offsets) = match map_file(&offsets_file)? {
            None => (0, Vec::new()),
            Some(mmap) => {
                let mut bytes = &mmap[..];
                let len = bytes.read_u64::<LittleEndian>().map_err(|_| corrupt("truncated"))?;
                let expected_blocks = (len as usize).div_ceil(block_size as usize);
                let mut offsets = Vec::with_capacity(expected_blocks);
                for _ in 0..expected_blocks {
                    offsets.push(
                        bytes
                            .read_u64::<LittleEndian>()
                            .map_err(|_| corrupt("missing block offset"))?,
                    );
                }
                (len, offsets)
            }
        };
        Ok(CompressedVocabulary {
            blocks: map_file(&blocks_path(base))?,
            external_words: map_file(&external_words_path(base))?,
            block_offsets,
            blocks_file: blocks_path(base),
            external_file: external_words_path(base),
            block_size: block_size as usize,
            len,
        })
    }

    fn corrupt(&self, reason: &str) -> crate::Error {
        InternalError::CorruptIndex {
            path: self.blocks_file.display().to_string(),
            reason: reason.to_owned(),
        }
        .into()
    }

    /// Decodes entries of the block holding `index` until reaching it.
    fn decode(&self, index: u64) -> Result<String> {
        let block = index as usize / self.block_size;
        let within = index as usize % self.block_size;
        let bytes = self.blocks.as_ref().map(|m| &m[..]).unwrap_or(&[]);
        let mut slice = bytes
            .get(self.block_offsets[block] as usize..)
            .ok_or_else(|| self.corrupt("block offset out of range"))?;
        let mut word = String::new();
        for _ in 0..=within {
            let flags = slice.read_u8().map_err(|_| self.corrupt("truncated entry"))?;
            if flags & FLAG_EXTERNAL != 0 {
                let offset = slice
                    .read_u64::<LittleEndian>()
                    .map_err(|_| self.corrupt("truncated external offset"))?;
                word.clear();
                word.push_str(read_word_at(
                    self.external_words.as_ref(),
                    &self.external_file,
                    offset,
                )?);
            } else {
                let prefix = slice
                    .read_u16::<LittleEndian>()
                    .map_err(|_| self.corrupt("truncated prefix length"))?
                    as usize;
                let suffix_len = slice
                    .read_u32::<LittleEndian>()
                    .map_err(|_| self.corrupt("truncated suffix length"))?
                    as usize;
                let suffix =
                    slice.get(..suffix_len).ok_or_else(|| self.corrupt("truncated suffix"))?;
                slice = &slice[suffix_len..];
                if prefix > word.len() {
                    return Err(self.corrupt("front-coding prefix exceeds previous word"));
                }
                word.truncate(prefix);
                word.push_str(str::from_utf8(suffix).map_err(InternalError::Utf8)?);
            }
        }
        Ok(word)
    }
}

impl VocabularyRead for CompressedVocabulary {
    fn len(&self) -> u64 {
        self.len
    }

    fn word(&self, index: u64) -> Result<Cow<'_, str>> {
        if index >= self.len {
            return Err(InternalError::VocabIndexOutOfBounds { index, len: self.len }.into());
        }
        self.decode(index).map(Cow::Owned)
    }
}

fn blocks_path(base: &Path) -> PathBuf {
    base.with_extension("cwords")
}

fn block_offsets_path(base: &Path) -> PathBuf {
    base.with_extension("cblocks")
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn build(words: &[(&str, bool)], block_size: u32) -> (TempDir, CompressedVocabulary) {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("vocabulary");
        let mut writer = CompressedVocabularyWriter::new(&base, block_size).unwrap();
        for (i, (word, external)) in words.iter().enumerate() {
            assert_eq!(writer.push_word(word, *external).unwrap(), i as u64);
        }
        assert_eq!(writer.finish().unwrap(), words.len() as u64);
        drop(writer);
        (dir, CompressedVocabulary::open(&base, block_size).unwrap())
    }

    #[test]
    fn front_coded_roundtrip() {
        let words: Vec<String> =
            (0..100).map(|i| format!("<http://example.org/entity/{i:04}>")).collect();
        let mut sorted: Vec<&str> = words.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        let entries: Vec<(&str, bool)> = sorted.iter().map(|w| (*w, false)).collect();
        let (_dir, vocabulary) = build(&entries, 16);
        assert_eq!(vocabulary.len(), 100);
        for (i, word) in sorted.iter().enumerate() {
            assert_eq!(vocabulary.word(i as u64).unwrap(), *word);
        }
    }

    #[test]
    fn external_words_interleave_with_the_chain() {
        let entries = [
            ("<a>", false),
            ("<ab>", false),
            ("a long externalised literal about nothing", true),
            ("a long externalised literal about something", false),
        ];
        let (_dir, vocabulary) = build(&entries, 3);
        for (i, (word, _)) in entries.iter().enumerate() {
            assert_eq!(vocabulary.word(i as u64).unwrap(), *word, "word {i}");
        }
    }

    #[test]
    fn binary_search_over_compressed_blocks() {
        let mut words: Vec<String> = (0..64).map(|i| format!("word{i:03}")).collect();
        words.sort_unstable();
        let entries: Vec<(&str, bool)> = words.iter().map(|w| (w.as_str(), false)).collect();
        let (_dir, vocabulary) = build(&entries, 8);
        assert_eq!(vocabulary.index_of("word031").unwrap(), Some(31));
        assert_eq!(vocabulary.prefix_range("word03").unwrap(), 30..40);
    }
}
