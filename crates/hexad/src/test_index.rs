//! Shared test fixture: builds a small index in a temp directory and opens
//! it, so operator and end-to-end tests run against the real on-disk
//! formats.

use std::sync::Arc;

use tempfile::TempDir;

use crate::index::builder::{IndexBuilder, InputTerm};
use crate::search::{ExecutionContext, Operator, TableFragment};
use crate::{EngineConfig, IdTable, Index, LocalVocab, ValueId};

pub(crate) struct TestIndex {
    pub index: Arc<Index>,
    pub config: Arc<EngineConfig>,
    _tempdir: TempDir,
}

pub(crate) fn test_config() -> EngineConfig {
    EngineConfig {
        worker_count: 2,
        block_size: 50,
        vocabulary_block_size: 4,
        queue_capacity: 64,
        ..EngineConfig::default()
    }
}

pub(crate) fn iri(value: &str) -> InputTerm {
    InputTerm::Iri(value.to_owned())
}

pub(crate) fn literal(value: &str) -> InputTerm {
    InputTerm::Literal(value.to_owned())
}

impl TestIndex {
    pub fn build(triples: Vec<[InputTerm; 3]>, config: EngineConfig) -> TestIndex {
        let tempdir = TempDir::new().unwrap();
        let mut builder = IndexBuilder::new(tempdir.path(), config.clone());
        for triple in triples {
            builder.push_triple(triple);
        }
        builder.finish().unwrap();
        let index = Arc::new(Index::open(tempdir.path()).unwrap());
        TestIndex { index, config: Arc::new(config), _tempdir: tempdir }
    }

    /// A few people, a `<knows>` chain, and some literal objects that feed
    /// the text index.
    pub fn small() -> TestIndex {
        TestIndex::build(
            vec![
                [iri("<alice>"), iri("<knows>"), iri("<bob>")],
                [iri("<bob>"), iri("<knows>"), iri("<carol>")],
                [iri("<carol>"), iri("<knows>"), iri("<dave>")],
                [iri("<eve>"), iri("<likes>"), iri("<bob>")],
                [iri("<a>"), iri("<says>"), literal("he failed the test")],
                [iri("<a>"), iri("<says>"), literal("testing can help")],
                [iri("<b>"), iri("<says>"), literal("the test on friday was really hard")],
                [iri("<b>"), iri("<says>"), literal("some other sentence")],
            ],
            test_config(),
        )
    }

    /// `count` subjects with one integer-valued triple each; spans several
    /// permutation blocks so block-level tests have something to prune.
    pub fn with_numbers(count: i64) -> TestIndex {
        let triples = (0..count)
            .map(|i| {
                [iri(&format!("<s{i:06}>")), iri("<value>"), InputTerm::Int(i)]
            })
            .collect();
        TestIndex::build(triples, test_config())
    }

    pub fn context(&self) -> ExecutionContext {
        ExecutionContext::new(self.index.clone(), self.config.clone())
    }

    /// Runs an operator to completion, merging all fragments into one
    /// table with one covering local vocab.
    pub fn materialise(&self, operation: &impl Operator) -> TableFragment {
        let context = self.context();
        let mut table = IdTable::new(operation.result_width(), context.budget.clone());
        let mut vocab = LocalVocab::new();
        for fragment in operation.compute(&context).unwrap() {
            let fragment = fragment.unwrap();
            for row in fragment.table.rows() {
                table.push_row(row).unwrap();
            }
            vocab.merge(&fragment.vocab);
        }
        TableFragment { table, vocab }
    }

    pub fn id(&self, term: &str) -> ValueId {
        self.index.id_for_term(term).unwrap().unwrap_or_else(|| panic!("unknown term {term}"))
    }

    pub fn term(&self, id: ValueId) -> String {
        self.index.term_for_id(id, &LocalVocab::new()).unwrap()
    }
}
