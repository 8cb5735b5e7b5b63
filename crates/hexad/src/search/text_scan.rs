//! Leaf operators over the full-text index.

use std::sync::Arc;

use super::{
    cancellable, single_fragment_stream, Definedness, ExecutionContext, Operator,
    QueryExecutionTree, TableFragment, TableStream, Variable, VariableColumns,
};
use crate::index::text_index::TextPosting;
use crate::{IdTable, Index, LocalVocab, Result, UserError, ValueId};

/// Binds text records containing `word` (`*` suffix for a prefix pattern)
/// to a text variable, with the term frequency as score.
#[derive(Clone, Debug)]
pub struct TextIndexScanForWord {
    index: Arc<Index>,
    text_variable: Variable,
    word: String,
    postings_count: u64,
}

impl TextIndexScanForWord {
    pub fn new(index: Arc<Index>, text_variable: Variable, word: &str) -> Result<Self> {
        let postings_count = index.text_index()?.postings_for_word(word)?.len() as u64;
        Ok(TextIndexScanForWord {
            index,
            text_variable,
            word: word.to_owned(),
            postings_count,
        })
    }

    fn score_variable(&self) -> Variable {
        Variable::new(format!("ql_score_{}", self.text_variable.name()))
    }
}

impl Operator for TextIndexScanForWord {
    fn result_width(&self) -> usize {
        2
    }

    fn result_sorted_on(&self) -> Vec<usize> {
        vec![0]
    }

    fn variable_columns(&self) -> VariableColumns {
        let mut variables = VariableColumns::new();
        variables.insert(self.text_variable.clone(), (0, Definedness::AlwaysDefined));
        variables.insert(self.score_variable(), (1, Definedness::AlwaysDefined));
        variables
    }

    fn cache_key(&self) -> String {
        // The text variable's name does not influence the rows produced.
        format!("TextScanForWord(word={})", self.word)
    }

    fn size_estimate(&self) -> u64 {
        self.postings_count
    }

    fn cost_estimate(&self) -> u64 {
        self.postings_count
    }

    fn known_empty_result(&self) -> bool {
        self.postings_count == 0
    }

    fn children(&self) -> Vec<Arc<QueryExecutionTree>> {
        Vec::new()
    }

    fn compute(&self, context: &ExecutionContext) -> Result<TableStream> {
        let postings = self.index.text_index()?.postings_for_word(&self.word)?;
        let mut table = IdTable::new(2, context.budget.clone());
        let mut previous: Option<ValueId> = None;
        let mut frequency: u64 = 0;
        let mut flush = |record: Option<ValueId>, frequency: u64, table: &mut IdTable| {
            match record {
                Some(record) => {
                    table.push_row(&[record, ValueId::from_int(frequency as i64)])
                }
                None => Ok(()),
            }
        };
        for TextPosting { record, frequency: posting_frequency, .. } in postings {
            if previous == Some(record) {
                frequency += posting_frequency;
            } else {
                flush(previous, frequency, &mut table)?;
                previous = Some(record);
                frequency = posting_frequency;
            }
        }
        flush(previous, frequency, &mut table)?;
        Ok(cancellable(
            single_fragment_stream(TableFragment { table, vocab: LocalVocab::new() }),
            context.cancellation.clone(),
        ))
    }
}

/// How the entity side of a `ql:contains-entity` scan is given.
#[derive(Clone, Debug)]
pub enum EntityBinding {
    Variable(Variable),
    Fixed { term: String, id: ValueId },
}

/// Binds `(text record, entity, score)` rows for records that mention an
/// entity and contain `word`. A fixed entity that is not part of the
/// knowledge graph is rejected at construction.
#[derive(Clone, Debug)]
pub struct TextIndexScanForEntity {
    index: Arc<Index>,
    text_variable: Variable,
    entity: EntityBinding,
    word: String,
    postings_count: u64,
}

impl TextIndexScanForEntity {
    pub fn with_variable(
        index: Arc<Index>,
        text_variable: Variable,
        entity_variable: Variable,
        word: &str,
    ) -> Result<Self> {
        Self::new(index, text_variable, EntityBinding::Variable(entity_variable), word)
    }

    pub fn with_fixed_entity(
        index: Arc<Index>,
        text_variable: Variable,
        entity: &str,
        word: &str,
    ) -> Result<Self> {
        let id = index.id_for_term(entity)?.ok_or_else(|| UserError::UnknownTextScanEntity {
            entity: entity.to_owned(),
        })?;
        Self::new(
            index,
            text_variable,
            EntityBinding::Fixed { term: entity.to_owned(), id },
            word,
        )
    }

    fn new(
        index: Arc<Index>,
        text_variable: Variable,
        entity: EntityBinding,
        word: &str,
    ) -> Result<Self> {
        let postings_count = index.text_index()?.postings_for_word(word)?.len() as u64;
        Ok(TextIndexScanForEntity {
            index,
            text_variable,
            entity,
            word: word.to_owned(),
            postings_count,
        })
    }

    fn score_variable(&self) -> Variable {
        Variable::new(format!("ql_score_{}", self.text_variable.name()))
    }

    fn has_entity_column(&self) -> bool {
        matches!(self.entity, EntityBinding::Variable(_))
    }
}

impl Operator for TextIndexScanForEntity {
    fn result_width(&self) -> usize {
        if self.has_entity_column() {
            3
        } else {
            2
        }
    }

    fn result_sorted_on(&self) -> Vec<usize> {
        vec![0]
    }

    fn variable_columns(&self) -> VariableColumns {
        let mut variables = VariableColumns::new();
        variables.insert(self.text_variable.clone(), (0, Definedness::AlwaysDefined));
        match &self.entity {
            EntityBinding::Variable(entity) => {
                variables.insert(entity.clone(), (1, Definedness::AlwaysDefined));
                variables.insert(self.score_variable(), (2, Definedness::AlwaysDefined));
            }
            EntityBinding::Fixed { .. } => {
                variables.insert(self.score_variable(), (1, Definedness::AlwaysDefined));
            }
        }
        variables
    }

    fn cache_key(&self) -> String {
        // The fixed entity participates in the key; a variable entity's
        // name does not.
        match &self.entity {
            EntityBinding::Variable(_) => {
                format!("TextScanForEntity(word={}, entity=?)", self.word)
            }
            EntityBinding::Fixed { id, .. } => {
                format!("TextScanForEntity(word={}, entity={id:?})", self.word)
            }
        }
    }

    fn size_estimate(&self) -> u64 {
        self.postings_count
    }

    fn cost_estimate(&self) -> u64 {
        self.postings_count
    }

    fn known_empty_result(&self) -> bool {
        self.postings_count == 0
    }

    fn children(&self) -> Vec<Arc<QueryExecutionTree>> {
        Vec::new()
    }

    fn compute(&self, context: &ExecutionContext) -> Result<TableStream> {
        let postings = self.index.text_index()?.postings_for_word(&self.word)?;
        let mut table = IdTable::new(self.result_width(), context.budget.clone());
        for TextPosting { record, entity, frequency } in postings {
            let score = ValueId::from_int(frequency as i64);
            match &self.entity {
                EntityBinding::Variable(_) => table.push_row(&[record, entity, score])?,
                EntityBinding::Fixed { id, .. } => {
                    if entity == *id {
                        table.push_row(&[record, score])?;
                    }
                }
            }
        }
        Ok(cancellable(
            single_fragment_stream(TableFragment { table, vocab: LocalVocab::new() }),
            context.cancellation.clone(),
        ))
    }
}
