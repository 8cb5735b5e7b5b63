//! The loaded index: vocabulary, six permutations, text index, materialized
//! views and the delta-triples overlay, opened once per process lifetime.

pub mod builder;
pub mod delta_triples;
pub mod permutation;
pub mod text_index;
pub mod views;

use std::borrow::Cow;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use self::delta_triples::DeltaTriples;
use self::permutation::{Permutation, PermutationIndex, ALL_PERMUTATIONS};
use self::text_index::TextIndex;
use self::views::ViewCatalog;
use crate::local_vocab::LocalVocab;
use crate::vocabulary::compressed::CompressedVocabulary;
use crate::vocabulary::geo::{sidecar_path, GeoVocabulary, GeometryInfo};
use crate::vocabulary::{Vocabulary, VocabularyRead};
use crate::{
    Datatype, InternalError, Result, UserError, ValueId, INDEX_FORMAT_VERSION,
};

/// The contents of `meta.json`: everything a reader must know to interpret
/// the other files, plus build-time statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexMeta {
    pub format_version: u32,
    pub triple_count: u64,
    pub vocabulary_words: u64,
    pub vocabulary_compressed: bool,
    pub vocabulary_block_size: u32,
    pub permutation_block_size: u32,
    pub has_geo: bool,
    pub has_text: bool,
    pub invalid_geometries: u64,
    pub invalid_geometry_areas: u64,
}

/// The vocabulary layouts an index can carry. The geo variants answer
/// [`AnyVocabulary::geo_info`] from the sidecar.
pub enum AnyVocabulary {
    Plain(Vocabulary),
    PlainGeo(GeoVocabulary<Vocabulary>),
    Compressed(CompressedVocabulary),
    CompressedGeo(GeoVocabulary<CompressedVocabulary>),
}

impl AnyVocabulary {
    pub fn geo_info(&self, index: u64) -> Option<GeometryInfo> {
        match self {
            AnyVocabulary::Plain(_) | AnyVocabulary::Compressed(_) => None,
            AnyVocabulary::PlainGeo(vocabulary) => vocabulary.geo_info(index),
            AnyVocabulary::CompressedGeo(vocabulary) => vocabulary.geo_info(index),
        }
    }
}

impl VocabularyRead for AnyVocabulary {
    fn len(&self) -> u64 {
        match self {
            AnyVocabulary::Plain(v) => v.len(),
            AnyVocabulary::PlainGeo(v) => v.len(),
            AnyVocabulary::Compressed(v) => v.len(),
            AnyVocabulary::CompressedGeo(v) => v.len(),
        }
    }

    fn word(&self, index: u64) -> Result<Cow<'_, str>> {
        match self {
            AnyVocabulary::Plain(v) => v.word(index),
            AnyVocabulary::PlainGeo(v) => v.word(index),
            AnyVocabulary::Compressed(v) => v.word(index),
            AnyVocabulary::CompressedGeo(v) => v.word(index),
        }
    }
}

pub struct Index {
    dir: PathBuf,
    meta: IndexMeta,
    vocabulary: AnyVocabulary,
    permutations: [PermutationIndex; 6],
    text: Option<TextIndex>,
    views: ViewCatalog,
    delta: DeltaTriples,
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index").field("dir", &self.dir).finish_non_exhaustive()
    }
}

impl Index {
    pub fn open(dir: &Path) -> Result<Index> {
        let meta_path = dir.join("meta.json");
        let meta: IndexMeta =
            serde_json::from_slice(&fs::read(&meta_path)?).map_err(InternalError::SerdeJson)?;
        if meta.format_version != INDEX_FORMAT_VERSION {
            return Err(InternalError::IndexVersionMismatch {
                found: meta.format_version,
                required: INDEX_FORMAT_VERSION,
            }
            .into());
        }

        let base = dir.join("vocabulary");
        let vocabulary = match (meta.vocabulary_compressed, meta.has_geo) {
            (false, false) => AnyVocabulary::Plain(Vocabulary::open(&base)?),
            (false, true) => AnyVocabulary::PlainGeo(GeoVocabulary::open(
                Vocabulary::open(&base)?,
                &sidecar_path(&base),
            )?),
            (true, false) => AnyVocabulary::Compressed(CompressedVocabulary::open(
                &base,
                meta.vocabulary_block_size,
            )?),
            (true, true) => AnyVocabulary::CompressedGeo(GeoVocabulary::open(
                CompressedVocabulary::open(&base, meta.vocabulary_block_size)?,
                &sidecar_path(&base),
            )?),
        };

        let mut permutations = Vec::with_capacity(6);
        for permutation in ALL_PERMUTATIONS {
            permutations
                .push(PermutationIndex::open(&dir.join(permutation.file_name()), permutation)?);
        }
        let Ok(permutations) = <[PermutationIndex; 6]>::try_from(permutations) else {
            unreachable!("exactly six permutations were opened")
        };

        let text = if meta.has_text {
            Some(TextIndex::open(&dir.join("text.fst"), &dir.join("text.postings"))?)
        } else {
            None
        };

        let views = {
            let vocabulary = &vocabulary;
            ViewCatalog::load(&dir.join("views"), |term| {
                Ok(vocabulary.index_of(term)?.map(ValueId::from_vocab_index))
            })?
        };

        tracing::info!(
            dir = %dir.display(),
            triples = meta.triple_count,
            words = meta.vocabulary_words,
            "opened index"
        );
        Ok(Index {
            dir: dir.to_owned(),
            meta,
            vocabulary,
            permutations,
            text,
            views,
            delta: DeltaTriples::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn meta(&self) -> &IndexMeta {
        &self.meta
    }

    pub fn vocabulary(&self) -> &AnyVocabulary {
        &self.vocabulary
    }

    pub fn permutation(&self, permutation: Permutation) -> &PermutationIndex {
        &self.permutations[ALL_PERMUTATIONS
            .iter()
            .position(|&p| p == permutation)
            .expect("all six permutations exist")]
    }

    pub fn text_index(&self) -> Result<&TextIndex> {
        self.text.as_ref().ok_or_else(|| UserError::NoTextIndex.into())
    }

    pub fn has_text_index(&self) -> bool {
        self.text.is_some()
    }

    pub fn views(&self) -> &ViewCatalog {
        &self.views
    }

    pub fn delta(&self) -> &DeltaTriples {
        &self.delta
    }

    /// The id of a term that exists in the knowledge graph, if any.
    pub fn id_for_term(&self, term: &str) -> Result<Option<ValueId>> {
        Ok(self.vocabulary.index_of(term)?.map(ValueId::from_vocab_index))
    }

    /// Renders an id back into its term, resolving vocabulary and
    /// local-vocabulary indices.
    pub fn term_for_id(&self, id: ValueId, local_vocab: &LocalVocab) -> Result<String> {
        Ok(match id.datatype() {
            Datatype::Undefined => String::new(),
            Datatype::Bool => {
                (if id.as_bool().unwrap() { "true" } else { "false" }).to_owned()
            }
            Datatype::Int => id.as_int().unwrap().to_string(),
            Datatype::Double => {
                let mut formatted = String::new();
                write!(formatted, "{:?}", id.as_double().unwrap()).unwrap();
                formatted
            }
            Datatype::Date => {
                let date = id.as_date().unwrap();
                format!(
                    "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}",
                    date.year, date.month, date.day, date.hour, date.minute, date.second
                )
            }
            Datatype::GeoPoint => {
                let (lat, lng) = id.as_geo_point().unwrap();
                format!("POINT({lng} {lat})")
            }
            Datatype::VocabIndex => self.vocabulary.word(id.payload())?.into_owned(),
            Datatype::TextRecordIndex => self.vocabulary.word(id.payload())?.into_owned(),
            Datatype::LocalVocabIndex => local_vocab.resolve(id)?.to_owned(),
            Datatype::BlankNodeIndex => format!("_:b{}", id.payload()),
        })
    }
}
