//! The on-disk vocabulary: an append-only, sorted dictionary mapping dense
//! `u64` indices to strings.
//!
//! On disk a vocabulary is a words file (length-prefixed UTF-8 strings) and
//! an offsets file (one little-endian `u64` per word). Words above the
//! externalisation threshold live in a separate words file that is only
//! touched on demand; the offset entry of such a word carries a tag bit.
//! The compressed layer ([`compressed`]) stacks block-wise front coding on
//! top, and [`geo`] adds the geometry-info sidecar maintained by the
//! parallel writer pipeline in [`geo_writer`].

pub mod compressed;
pub mod geo;
pub mod geo_writer;

use std::borrow::Cow;
use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::str;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use memmap2::Mmap;

use crate::{InternalError, Result};

const EXTERNAL_BIT: u64 = 1 << 63;

/// Sink for the words of one vocabulary, fed in sorted order during index
/// construction. `finish` is idempotent; the first call flushes and returns
/// the number of words written.
pub trait WordWriter {
    fn push_word(&mut self, word: &str, is_external: bool) -> Result<u64>;
    fn finish(&mut self) -> Result<u64>;
}

impl<W: WordWriter + ?Sized> WordWriter for Box<W> {
    fn push_word(&mut self, word: &str, is_external: bool) -> Result<u64> {
        (**self).push_word(word, is_external)
    }

    fn finish(&mut self) -> Result<u64> {
        (**self).finish()
    }
}

/// Random access into a vocabulary. Implementations return borrowed bytes
/// where the on-disk representation allows it.
pub trait VocabularyRead {
    fn len(&self) -> u64;

    fn word(&self, index: u64) -> Result<Cow<'_, str>>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First index whose word is not less than `target`.
    fn lower_bound(&self, target: &str) -> Result<u64> {
        self.partition_point(|word| word < target)
    }

    /// First index whose word is greater than `target`.
    fn upper_bound(&self, target: &str) -> Result<u64> {
        self.partition_point(|word| word <= target)
    }

    fn index_of(&self, target: &str) -> Result<Option<u64>> {
        let index = self.lower_bound(target)?;
        if index < self.len() && self.word(index)?.as_ref() == target {
            Ok(Some(index))
        } else {
            Ok(None)
        }
    }

    /// The contiguous index range of all words starting with `prefix`.
    fn prefix_range(&self, prefix: &str) -> Result<Range<u64>> {
        let start = self.lower_bound(prefix)?;
        let end = self.partition_point(|word| {
            word.starts_with(prefix) || matches!(word.cmp(prefix), Ordering::Less)
        })?;
        Ok(start..end)
    }

    /// First index for which `pred` is false; the words must be sorted so
    /// that `pred` is monotone over them.
    fn partition_point(&self, pred: impl Fn(&str) -> bool) -> Result<u64> {
        let mut low = 0;
        let mut high = self.len();
        while low < high {
            let mid = low + (high - low) / 2;
            if pred(self.word(mid)?.as_ref()) {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        Ok(low)
    }
}

pub(crate) fn map_file(path: &Path) -> Result<Option<Mmap>> {
    let file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(None);
    }
    // The index directory is not mutated while the engine has it open.
    let mmap = unsafe { Mmap::map(&file)? };
    Ok(Some(mmap))
}

fn read_word_at<'a>(bytes: Option<&'a Mmap>, path: &Path, offset: u64) -> Result<&'a str> {
    let bytes = bytes.map(|m| &m[..]).unwrap_or(&[]);
    let corrupt = |reason: &str| InternalError::CorruptIndex {
        path: path.display().to_string(),
        reason: reason.to_owned(),
    };
    let mut slice = bytes.get(offset as usize..).ok_or_else(|| corrupt("offset out of range"))?;
    let length = slice.read_u32::<LittleEndian>().map_err(|_| corrupt("truncated word length"))?;
    let word = slice.get(..length as usize).ok_or_else(|| corrupt("truncated word"))?;
    str::from_utf8(word).map_err(|e| InternalError::Utf8(e).into())
}

/// Streaming writer for the plain (uncompressed) vocabulary layout.
pub struct VocabularyWriter {
    words: BufWriter<File>,
    offsets: BufWriter<File>,
    external_words: BufWriter<File>,
    bytes_written: u64,
    external_bytes_written: u64,
    count: u64,
    finished: bool,
}

impl VocabularyWriter {
    pub fn new(base: &Path) -> Result<VocabularyWriter> {
        let create = |path: PathBuf| -> Result<BufWriter<File>> {
            Ok(BufWriter::new(File::create(path)?))
        };
        Ok(VocabularyWriter {
            words: create(words_path(base))?,
            offsets: create(offsets_path(base))?,
            external_words: create(external_words_path(base))?,
            bytes_written: 0,
            external_bytes_written: 0,
            count: 0,
            finished: false,
        })
    }
}

impl WordWriter for VocabularyWriter {
    fn push_word(&mut self, word: &str, is_external: bool) -> Result<u64> {
        debug_assert!(!self.finished);
        let index = self.count;
        if is_external {
            self.offsets.write_u64::<LittleEndian>(EXTERNAL_BIT | self.external_bytes_written)?;
            self.external_words.write_u32::<LittleEndian>(word.len() as u32)?;
            self.external_words.write_all(word.as_bytes())?;
            self.external_bytes_written += 4 + word.len() as u64;
        } else {
            self.offsets.write_u64::<LittleEndian>(self.bytes_written)?;
            self.words.write_u32::<LittleEndian>(word.len() as u32)?;
            self.words.write_all(word.as_bytes())?;
            self.bytes_written += 4 + word.len() as u64;
        }
        self.count += 1;
        Ok(index)
    }

    fn finish(&mut self) -> Result<u64> {
        if !self.finished {
            self.words.flush()?;
            self.offsets.flush()?;
            self.external_words.flush()?;
            self.finished = true;
        }
        Ok(self.count)
    }
}

impl Drop for VocabularyWriter {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

/// Memory-mapped reader for the plain layout. Random reads are cheap and
/// thread-safe; external words are only paged in when actually accessed.
pub struct Vocabulary {
    words: Option<Mmap>,
    offsets: Option<Mmap>,
    external_words: Option<Mmap>,
    words_file: PathBuf,
    external_file: PathBuf,
    len: u64,
}

impl Vocabulary {
    pub fn open(base: &Path) -> Result<Vocabulary> {
        let offsets = map_file(&offsets_path(base))?;
        let len = offsets.as_ref().map_or(0, |m| m.len() as u64 / 8);
        Ok(Vocabulary {
            words: map_file(&words_path(base))?,
            offsets,
            external_words: map_file(&external_words_path(base))?,
            words_file: words_path(base),
            external_file: external_words_path(base),
            len,
        })
    }

    fn offset_entry(&self, index: u64) -> Result<u64> {
        if index >= self.len {
            return Err(InternalError::VocabIndexOutOfBounds { index, len: self.len }.into());
        }
        let offsets = self.offsets.as_ref().expect("non-zero len implies an offsets map");
        let mut bytes = &offsets[index as usize * 8..];
        Ok(bytes.read_u64::<LittleEndian>().expect("offset entry is in range"))
    }
}

impl VocabularyRead for Vocabulary {
    fn len(&self) -> u64 {
        self.len
    }

    fn word(&self, index: u64) -> Result<Cow<'_, str>> {
        let entry = self.offset_entry(index)?;
        let word = if entry & EXTERNAL_BIT != 0 {
            read_word_at(self.external_words.as_ref(), &self.external_file, entry & !EXTERNAL_BIT)?
        } else {
            read_word_at(self.words.as_ref(), &self.words_file, entry)?
        };
        Ok(Cow::Borrowed(word))
    }
}

pub(crate) fn words_path(base: &Path) -> PathBuf {
    base.with_extension("words")
}

pub(crate) fn offsets_path(base: &Path) -> PathBuf {
    base.with_extension("offsets")
}

pub(crate) fn external_words_path(base: &Path) -> PathBuf {
    base.with_extension("external-words")
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn build(words: &[(&str, bool)]) -> (TempDir, Vocabulary) {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("vocabulary");
        let mut writer = VocabularyWriter::new(&base).unwrap();
        for (i, (word, external)) in words.iter().enumerate() {
            assert_eq!(writer.push_word(word, *external).unwrap(), i as u64);
        }
        assert_eq!(writer.finish().unwrap(), words.len() as u64);
        // finish is idempotent
        assert_eq!(writer.finish().unwrap(), words.len() as u64);
        drop(writer);
        let vocabulary = Vocabulary::open(&base).unwrap();
        (dir, vocabulary)
    }

    #[test]
    fn roundtrip_with_external_words() {
        let words =
            [("<a>", false), ("<b>", false), ("a very long literal", true), ("zebra", false)];
        let (_dir, vocabulary) = build(&words);
        assert_eq!(vocabulary.len(), 4);
        for (i, (word, _)) in words.iter().enumerate() {
            assert_eq!(vocabulary.word(i as u64).unwrap(), *word);
        }
        assert!(vocabulary.word(4).is_err());
    }

    #[test]
    fn bounds_and_prefix_range() {
        let (_dir, vocabulary) = build(&[
            ("<http://example.org/a>", false),
            ("<http://example.org/b>", false),
            ("<http://other.org/x>", false),
            ("\"literal\"", false),
        ]);
        assert_eq!(vocabulary.lower_bound("<http://example.org/b>").unwrap(), 1);
        assert_eq!(vocabulary.upper_bound("<http://example.org/b>").unwrap(), 2);
        assert_eq!(vocabulary.prefix_range("<http://example.org/").unwrap(), 0..2);
        assert_eq!(vocabulary.index_of("<http://other.org/x>").unwrap(), Some(2));
        assert_eq!(vocabulary.index_of("<missing>").unwrap(), None);
    }

    #[test]
    fn empty_vocabulary() {
        let (_dir, vocabulary) = build(&[]);
        assert_eq!(vocabulary.len(), 0);
        assert!(vocabulary.is_empty());
        assert_eq!(vocabulary.prefix_range("x").unwrap(), 0..0);
    }
}
