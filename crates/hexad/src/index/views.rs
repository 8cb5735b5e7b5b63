//! Storage for materialized views: precomputed results of canonical query
//! patterns, swapped in for matching user queries by the planner.
//!
//! The only shape stored today is the simple chain
//! `?s <p1> ?m . ?m <p2> ?o`, materialised as a three-column table sorted
//! by its first column and indexed by the ordered predicate pair.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{FastMap8, IdTriple, InternalError, Result, ValueId};

const VIEW_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewDefinition {
    pub name: String,
    /// The two predicates of the chain, as vocabulary terms.
    pub first_predicate: String,
    pub second_predicate: String,
}

#[derive(Serialize, Deserialize)]
struct ViewFile {
    format_version: u32,
    definition: ViewDefinition,
    rows: Vec<IdTriple>,
}

/// One loaded view: its definition, the resolved predicate pair, and the
/// precomputed `(s, m, o)` rows sorted by `s`.
#[derive(Debug)]
pub struct MaterializedView {
    definition: ViewDefinition,
    predicates: (ValueId, ValueId),
    rows: Vec<IdTriple>,
}

impl MaterializedView {
    pub fn write(path: &Path, definition: ViewDefinition, mut rows: Vec<IdTriple>) -> Result<()> {
        rows.sort_unstable();
        let file = ViewFile { format_version: VIEW_FORMAT_VERSION, definition, rows };
        fs::write(path, bincode::serialize(&file).map_err(InternalError::Bincode)?)?;
        Ok(())
    }

    fn open(path: &Path, predicates: (ValueId, ValueId)) -> Result<MaterializedView> {
        let bytes = fs::read(path)?;
        let file: ViewFile = bincode::deserialize(&bytes).map_err(InternalError::Bincode)?;
        if file.format_version != VIEW_FORMAT_VERSION {
            return Err(InternalError::IndexVersionMismatch {
                found: file.format_version,
                required: VIEW_FORMAT_VERSION,
            }
            .into());
        }
        Ok(MaterializedView { definition: file.definition, predicates, rows: file.rows })
    }

    pub fn definition(&self) -> &ViewDefinition {
        &self.definition
    }

    pub fn predicates(&self) -> (ValueId, ValueId) {
        self.predicates
    }

    pub fn rows(&self) -> &[IdTriple] {
        &self.rows
    }
}

/// All views of one index, keyed by their ordered predicate pair.
#[derive(Default)]
pub struct ViewCatalog {
    views: Vec<Arc<MaterializedView>>,
    by_predicates: FastMap8<(ValueId, ValueId), usize>,
}

impl ViewCatalog {
    /// Loads every `*.view` file in `dir`; a missing directory simply means
    /// no views. `resolve` maps a predicate term to its id, if present.
    pub fn load(
        dir: &Path,
        resolve: impl Fn(&str) -> Result<Option<ValueId>>,
    ) -> Result<ViewCatalog> {
        let mut catalog = ViewCatalog::default();
        if !dir.is_dir() {
            return Ok(catalog);
        }
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().map_or(true, |extension| extension != "view") {
                continue;
            }
            // Peek at the definition to resolve the predicate pair.
            let bytes = fs::read(&path)?;
            let file: ViewFile = bincode::deserialize(&bytes).map_err(InternalError::Bincode)?;
            let (Some(p1), Some(p2)) = (
                resolve(&file.definition.first_predicate)?,
                resolve(&file.definition.second_predicate)?,
            ) else {
                tracing::warn!(
                    view = file.definition.name,
                    "skipping view whose predicates are not in the vocabulary"
                );
                continue;
            };
            let view = MaterializedView::open(&path, (p1, p2))?;
            catalog.by_predicates.insert((p1, p2), catalog.views.len());
            catalog.views.push(Arc::new(view));
        }
        tracing::debug!(views = catalog.views.len(), "loaded materialized views");
        Ok(catalog)
    }

    /// The chain view for the ordered predicate pair, if one exists.
    pub fn chain_view(&self, first: ValueId, second: ValueId) -> Option<Arc<MaterializedView>> {
        self.by_predicates.get(&(first, second)).map(|&i| self.views[i].clone())
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<MaterializedView>> {
        self.views.iter().find(|view| view.definition.name == name).cloned()
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn vocab(i: u64) -> ValueId {
        ValueId::from_vocab_index(i)
    }

    #[test]
    fn write_load_and_lookup() {
        let dir = TempDir::new().unwrap();
        let definition = ViewDefinition {
            name: "follows-follows".to_owned(),
            first_predicate: "<follows>".to_owned(),
            second_predicate: "<follows>".to_owned(),
        };
        let rows = vec![
            [vocab(3), vocab(4), vocab(5)],
            [vocab(0), vocab(1), vocab(2)],
        ];
        MaterializedView::write(&dir.path().join("follows.view"), definition, rows).unwrap();

        let catalog = ViewCatalog::load(dir.path(), |term| {
            Ok((term == "<follows>").then(|| vocab(42)))
        })
        .unwrap();
        assert_eq!(catalog.len(), 1);
        let view = catalog.chain_view(vocab(42), vocab(42)).unwrap();
        // Rows come back sorted by the first column.
        assert_eq!(view.rows()[0], [vocab(0), vocab(1), vocab(2)]);
        assert!(catalog.chain_view(vocab(42), vocab(7)).is_none());
        assert!(catalog.by_name("follows-follows").is_some());
    }

    #[test]
    fn missing_views_directory_is_empty_catalog() {
        let catalog =
            ViewCatalog::load(Path::new("/nonexistent/views"), |_| Ok(None)).unwrap();
        assert!(catalog.is_empty());
    }
}
