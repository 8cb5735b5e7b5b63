//! Bulk index construction: collects terms and triples, writes the (geo)
//! vocabulary through the parallel pipeline, externally sorts the six
//! permutations, builds the text index and stamps `meta.json`.

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use grenad::MergeFunction;

use super::permutation::{PermutationWriter, ALL_PERMUTATIONS};
use super::text_index::TextIndexWriter;
use super::views::{MaterializedView, ViewDefinition};
use super::IndexMeta;
use crate::value_id::DateValue;
use crate::vocabulary::compressed::CompressedVocabularyWriter;
use crate::vocabulary::geo::sidecar_path;
use crate::vocabulary::geo_writer::{GeoWordWriter, GeoWriterStats};
use crate::vocabulary::{VocabularyWriter, WordWriter};
use crate::{
    EngineConfig, FastMap8, IdTriple, Index, InternalError, Result, ValueId,
    INDEX_FORMAT_VERSION,
};

/// One parsed RDF term, already classified by the tokenising collaborator
/// (the N-Triples reader, or a test fixture).
#[derive(Debug, Clone, PartialEq)]
pub enum InputTerm {
    Iri(String),
    BlankNode(String),
    /// A string literal, stored in the vocabulary by its lexical form.
    Literal(String),
    Int(i64),
    Double(f64),
    Bool(bool),
    Date(DateValue),
}

impl InputTerm {
    fn vocab_word(&self) -> Option<&str> {
        match self {
            InputTerm::Iri(iri) => Some(iri),
            InputTerm::Literal(literal) => Some(literal),
            _ => None,
        }
    }
}

/// Cheap prescreen for WKT literals so only candidates go through the
/// parser workers.
fn looks_like_wkt(literal: &str) -> bool {
    const KEYWORDS: [&str; 7] = [
        "POINT",
        "LINESTRING",
        "POLYGON",
        "MULTIPOINT",
        "MULTILINESTRING",
        "MULTIPOLYGON",
        "GEOMETRYCOLLECTION",
    ];
    let trimmed = literal.trim_start();
    KEYWORDS
        .iter()
        .any(|keyword| trimmed.len() >= keyword.len() && trimmed[..keyword.len()].eq_ignore_ascii_case(keyword))
}

struct KeepFirst;

impl MergeFunction for KeepFirst {
    type Error = std::convert::Infallible;

    fn merge<'a>(
        &self,
        _key: &[u8],
        values: &[Cow<'a, [u8]>],
    ) -> std::result::Result<Cow<'a, [u8]>, Self::Error> {
        Ok(values[0].clone())
    }
}

fn sorter_error<E: std::fmt::Display>(error: grenad::Error<E>) -> crate::Error {
    match error {
        grenad::Error::Io(io) => io.into(),
        other => InternalError::CorruptIndex {
            path: "<permutation sorter>".to_owned(),
            reason: other.to_string(),
        }
        .into(),
    }
}

/// Accumulates a knowledge graph and writes the on-disk index in `finish`.
pub struct IndexBuilder {
    dir: PathBuf,
    config: EngineConfig,
    compressed_vocabulary: bool,
    terms: BTreeSet<String>,
    has_geo: bool,
    triples: Vec<[InputTerm; 3]>,
}

impl IndexBuilder {
    pub fn new(dir: &Path, config: EngineConfig) -> IndexBuilder {
        IndexBuilder {
            dir: dir.to_owned(),
            config,
            compressed_vocabulary: true,
            terms: BTreeSet::new(),
            has_geo: false,
            triples: Vec::new(),
        }
    }

    /// Switches to the plain (uncompressed) vocabulary layout.
    pub fn uncompressed_vocabulary(mut self) -> IndexBuilder {
        self.compressed_vocabulary = false;
        self
    }

    pub fn push_triple(&mut self, triple: [InputTerm; 3]) {
        for term in &triple {
            if let Some(word) = term.vocab_word() {
                if !self.has_geo && matches!(term, InputTerm::Literal(_)) && looks_like_wkt(word) {
                    self.has_geo = true;
                }
                if !self.terms.contains(word) {
                    self.terms.insert(word.to_owned());
                }
            }
        }
        self.triples.push(triple);
    }

    pub fn triple_count(&self) -> usize {
        self.triples.len()
    }

    pub fn finish(self) -> Result<IndexMeta> {
        fs::create_dir_all(&self.dir)?;
        let base = self.dir.join("vocabulary");
        let threshold = self.config.externalisation_threshold as usize;

        // Stage one: the sorted vocabulary, with the geometry sidecar kept
        // in lockstep by the pipeline whenever WKT literals exist.
        let mut ids: FastMap8<&str, u64> = FastMap8::default();
        let geo_stats;
        let word_count;
        {
            let mut writer: Box<dyn WordWriter> = if self.compressed_vocabulary {
                Box::new(CompressedVocabularyWriter::new(
                    &base,
                    self.config.vocabulary_block_size,
                )?)
            } else {
                Box::new(VocabularyWriter::new(&base)?)
            };
            if self.has_geo {
                let mut geo_writer =
                    GeoWordWriter::new(writer, &sidecar_path(&base), &self.config)?;
                for word in &self.terms {
                    let external = word.len() > threshold;
                    let index = if looks_like_wkt(word) {
                        geo_writer.push_word(word, external)?
                    } else {
                        geo_writer.push_word_skipping_geometry(word, external)?
                    };
                    ids.insert(word, index);
                }
                word_count = WordWriter::finish(&mut geo_writer)?;
                geo_stats = geo_writer.stats();
            } else {
                for word in &self.terms {
                    let index = writer.push_word(word, word.len() > threshold)?;
                    ids.insert(word, index);
                }
                word_count = writer.finish()?;
                geo_stats = GeoWriterStats::default();
            }
        }

        // Stage two: encode triples, register text records, sort the six
        // permutations externally and write their block files.
        let mut blank_nodes: FastMap8<&str, u64> = FastMap8::default();
        let mut text = TextIndexWriter::new();
        let mut encoded: Vec<IdTriple> = Vec::with_capacity(self.triples.len());
        fn encode_term<'a>(
            term: &'a InputTerm,
            ids: &FastMap8<&str, u64>,
            blank_nodes: &mut FastMap8<&'a str, u64>,
        ) -> ValueId {
            match term {
                InputTerm::Iri(iri) => ValueId::from_vocab_index(ids[iri.as_str()]),
                InputTerm::Literal(literal) => ValueId::from_vocab_index(ids[literal.as_str()]),
                InputTerm::BlankNode(label) => {
                    let next = blank_nodes.len() as u64;
                    ValueId::from_blank_node_index(
                        *blank_nodes.entry(label.as_str()).or_insert(next),
                    )
                }
                InputTerm::Int(value) => ValueId::from_int(*value),
                InputTerm::Double(value) => ValueId::from_double(*value),
                InputTerm::Bool(value) => ValueId::from_bool(*value),
                InputTerm::Date(value) => ValueId::from_date(*value),
            }
        }
        for [subject, predicate, object] in &self.triples {
            let triple = [
                encode_term(subject, &ids, &mut blank_nodes),
                encode_term(predicate, &ids, &mut blank_nodes),
                encode_term(object, &ids, &mut blank_nodes),
            ];
            if let InputTerm::Literal(literal) = object {
                let index = ids[literal.as_str()];
                text.add_record(
                    ValueId::from_text_record_index(index),
                    ValueId::from_vocab_index(index),
                    literal,
                );
            }
            encoded.push(triple);
        }

        let has_text = text.record_count() > 0;
        if has_text {
            text.finish(&self.dir.join("text.fst"), &self.dir.join("text.postings"))?;
        }

        let mut triple_count = 0;
        for permutation in ALL_PERMUTATIONS {
            let mut sorter = grenad::Sorter::builder(KeepFirst).build();
            let mut key = [0u8; 24];
            for &triple in &encoded {
                let permuted = permutation.apply(triple);
                for (slot, id) in key.chunks_exact_mut(8).zip(permuted) {
                    slot.copy_from_slice(&id.order_key().to_be_bytes());
                }
                sorter
                    .insert(key, bytemuck::bytes_of(&permuted))
                    .map_err(sorter_error)?;
            }
            let mut writer = PermutationWriter::create(
                &self.dir.join(permutation.file_name()),
                permutation,
                self.config.block_size,
            )?;
            let mut stream = sorter.into_stream_merger_iter().map_err(sorter_error)?;
            while let Some((_, value)) = stream.next().map_err(sorter_error)? {
                writer.push(bytemuck::pod_read_unaligned(value))?;
            }
            triple_count = writer.finish()?;
        }

        let meta = IndexMeta {
            format_version: INDEX_FORMAT_VERSION,
            triple_count,
            vocabulary_words: word_count,
            vocabulary_compressed: self.compressed_vocabulary,
            vocabulary_block_size: self.config.vocabulary_block_size,
            permutation_block_size: self.config.block_size,
            has_geo: self.has_geo,
            has_text,
            invalid_geometries: geo_stats.invalid_geometries,
            invalid_geometry_areas: geo_stats.invalid_areas,
        };
        fs::write(
            self.dir.join("meta.json"),
            serde_json::to_vec_pretty(&meta).map_err(InternalError::SerdeJson)?,
        )?;
        tracing::info!(
            dir = %self.dir.display(),
            triples = meta.triple_count,
            words = meta.vocabulary_words,
            geo = meta.has_geo,
            text = meta.has_text,
            "index build finished"
        );
        Ok(meta)
    }
}

/// Materialises the chain view `?s <p1> ?m . ?m <p2> ?o` over an opened
/// index and stores it under `views/<name>.view`.
pub fn build_chain_view(
    index: &Index,
    name: &str,
    first_predicate: &str,
    second_predicate: &str,
) -> Result<u64> {
    let resolve = |term: &str| -> Result<ValueId> {
        index
            .id_for_term(term)?
            .ok_or_else(|| crate::UserError::UnknownViewPredicate(term.to_owned()).into())
    };
    let p1 = resolve(first_predicate)?;
    let p2 = resolve(second_predicate)?;

    // ?s <p1> ?m, sorted by ?m via POS of p1; ?m <p2> ?o via PSO of p2.
    let pos = index.permutation(super::permutation::Permutation::Pos);
    let pso = index.permutation(super::permutation::Permutation::Pso);
    let mut left: Vec<(ValueId, ValueId)> = Vec::new();
    for block in pos.blocks_for_prefix(Some(p1), None) {
        for [p, o, s] in pos.read_block(block)? {
            if p == p1 {
                left.push((o, s));
            }
        }
    }
    let mut right: Vec<(ValueId, ValueId)> = Vec::new();
    for block in pso.blocks_for_prefix(Some(p2), None) {
        for [p, s, o] in pso.read_block(block)? {
            if p == p2 {
                right.push((s, o));
            }
        }
    }
    // Both lists are sorted by the join value, so a single forward merge
    // produces the chain rows.
    let mut rows: Vec<IdTriple> = Vec::new();
    let mut j = 0;
    for (m, s) in left {
        while j < right.len() && right[j].0 < m {
            j += 1;
        }
        let mut k = j;
        while k < right.len() && right[k].0 == m {
            rows.push([s, m, right[k].1]);
            k += 1;
        }
    }

    let views_dir = index.dir().join("views");
    fs::create_dir_all(&views_dir)?;
    let definition = ViewDefinition {
        name: name.to_owned(),
        first_predicate: first_predicate.to_owned(),
        second_predicate: second_predicate.to_owned(),
    };
    let count = rows.len() as u64;
    MaterializedView::write(&views_dir.join(format!("{name}.view")), definition, rows)?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::vocabulary::VocabularyRead;

    fn iri(value: &str) -> InputTerm {
        InputTerm::Iri(value.to_owned())
    }

    fn literal(value: &str) -> InputTerm {
        InputTerm::Literal(value.to_owned())
    }

    fn config() -> EngineConfig {
        EngineConfig { worker_count: 2, block_size: 4, vocabulary_block_size: 4, ..EngineConfig::default() }
    }

    #[test]
    fn build_and_open_roundtrip_with_geometry() {
        let dir = TempDir::new().unwrap();
        let mut builder = IndexBuilder::new(dir.path(), config());
        builder.push_triple([iri("<museum>"), iri("<location>"), literal("POINT(2.2945 48.8584)")]);
        builder.push_triple([iri("<museum>"), iri("<name>"), literal("the louvre")]);
        builder.push_triple([iri("<park>"), iri("<shape>"), literal("POLYGON((0 0, 1 0, 1 1, 0 0))")]);
        builder.push_triple([iri("<park>"), iri("<rating>"), InputTerm::Int(5)]);
        let meta = builder.finish().unwrap();
        assert_eq!(meta.triple_count, 4);
        assert!(meta.has_geo);
        assert!(meta.has_text);
        assert_eq!(meta.invalid_geometries, 0);

        let index = Index::open(dir.path()).unwrap();
        assert_eq!(index.vocabulary().len(), meta.vocabulary_words);
        let point = index.id_for_term("POINT(2.2945 48.8584)").unwrap().unwrap();
        let info = index.vocabulary().geo_info(point.payload()).expect("a geometry record");
        let (lng, lat) = info.centroid();
        assert!((lng - 2.2945).abs() < 1e-9);
        assert!((lat - 48.8584).abs() < 1e-9);
        // Non-geometry words answer with the sentinel.
        let museum = index.id_for_term("<museum>").unwrap().unwrap();
        assert!(index.vocabulary().geo_info(museum.payload()).is_none());
        // The integer object is inline, not in the vocabulary.
        assert!(index.id_for_term("5").unwrap().is_none());
    }

    #[test]
    fn blank_nodes_get_dense_ids() {
        let dir = TempDir::new().unwrap();
        let mut builder = IndexBuilder::new(dir.path(), config());
        builder.push_triple([
            InputTerm::BlankNode("b0".to_owned()),
            iri("<p>"),
            InputTerm::BlankNode("b1".to_owned()),
        ]);
        builder.push_triple([InputTerm::BlankNode("b0".to_owned()), iri("<p>"), iri("<x>")]);
        builder.finish().unwrap();
        let index = Index::open(dir.path()).unwrap();
        assert_eq!(index.meta().triple_count, 2);
        // Both triples share one blank subject.
        let scan = index.permutation(super::super::permutation::Permutation::Spo);
        let rows = scan.read_block(&scan.metadata()[0]).unwrap();
        assert_eq!(rows[0][0], rows[1][0]);
    }

    #[test]
    fn uncompressed_vocabulary_layout_roundtrips() {
        let dir = TempDir::new().unwrap();
        let mut builder = IndexBuilder::new(dir.path(), config()).uncompressed_vocabulary();
        builder.push_triple([iri("<a>"), iri("<p>"), literal("plain text")]);
        let meta = builder.finish().unwrap();
        assert!(!meta.vocabulary_compressed);
        let index = Index::open(dir.path()).unwrap();
        assert_eq!(index.vocabulary().word(0).unwrap(), "<a>");
    }
}
