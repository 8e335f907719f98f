//! The seam between the core and the external repository index.
//!
//! The on-disk index, parsers, and embedding store live outside the core;
//! a session consumes them through [`RepositorySnapshot`], pinned for the
//! session tree's lifetime. [`InMemoryIndex`] is a pre-built snapshot over
//! explicit span/symbol tables, used by embedders and the test suites;
//! index *construction* is not this crate's business.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::error::NavErr;
use crate::protocol::CodeSpan;
use crate::protocol::Relation;
use crate::protocol::SpanKind;
use crate::protocol::Symbol;
use crate::protocol::content_digest;

/// Snapshot-scoped query primitives backing the navigation facade.
///
/// Implementations must be deterministic per snapshot and safe for
/// concurrent reads. All returned collections are in a stable order.
pub trait RepositorySnapshot: Send + Sync {
    /// Exact qualified-name lookup.
    fn symbol(&self, qualified_name: &str) -> Result<Option<Symbol>, NavErr>;

    /// Every symbol in the snapshot, ordered by qualified name.
    fn all_symbols(&self) -> Result<Vec<Symbol>, NavErr>;

    /// Graph neighbors of a symbol along one relation, ordered by
    /// qualified name. Empty when the symbol has no such edges.
    fn neighbors(&self, qualified_name: &str, relation: Relation) -> Result<Vec<Symbol>, NavErr>;

    /// Total edge degree of a symbol across every relation.
    fn symbol_edge_count(&self, qualified_name: &str) -> Result<usize, NavErr>;

    /// Every file path in the snapshot, sorted.
    fn files(&self) -> Result<Vec<String>, NavErr>;

    /// Full source of one file; `None` for paths the snapshot never held.
    fn file_source(&self, path: &str) -> Result<Option<String>, NavErr>;

    /// Materialise a span's source text. Fails with [`NavErr::Stale`] when
    /// the span's digest no longer matches the snapshot content (the file
    /// changed or was removed after the span was handed out).
    fn span_source(&self, span: &CodeSpan) -> Result<String, NavErr>;

    /// Designated entry points, when the index records them.
    fn entry_points(&self) -> Result<Vec<String>, NavErr>;

    /// Attempt to re-pin the snapshot after a stale read. Implementations
    /// without that ability return `Err(NavErr::Stale)` again.
    fn refresh(&self) -> Result<(), NavErr>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEdge {
    relation: Relation,
    target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexedSymbol {
    kind: SpanKind,
    spans: Vec<CodeSpan>,
    edges: Vec<IndexEdge>,
}

/// A fully materialised snapshot: file sources plus symbol/edge tables.
/// Loadable from JSON, which is how the CLI consumes pre-built indices.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InMemoryIndex {
    files: BTreeMap<String, String>,
    symbols: BTreeMap<String, IndexedSymbol>,
    entry_points: Vec<String>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&mut self, path: impl Into<String>, source: impl Into<String>) {
        self.files.insert(path.into(), source.into());
    }

    /// Drop a file from the snapshot. Spans handed out earlier keep their
    /// digests and will fail `span_source` with `Stale`.
    pub fn remove_file(&mut self, path: &str) {
        self.files.remove(path);
    }

    pub fn set_entry_points(&mut self, entry_points: Vec<String>) {
        self.entry_points = entry_points;
    }

    /// Build a span over `start_line..=end_line` of a stored file,
    /// computing the digest from the current content. Lines are 1-based.
    pub fn span(
        &self,
        path: &str,
        start_line: u32,
        end_line: u32,
        kind: SpanKind,
        symbol: Option<&str>,
    ) -> Option<CodeSpan> {
        let source = self.files.get(path)?;
        let text = slice_lines(source, start_line, end_line)?;
        Some(CodeSpan {
            path: path.to_string(),
            start_line,
            end_line,
            language: language_for(path),
            kind,
            symbol: symbol.map(str::to_string),
            digest: content_digest(&text),
        })
    }

    /// Register a symbol with its defining spans.
    pub fn add_symbol(&mut self, qualified_name: impl Into<String>, kind: SpanKind, spans: Vec<CodeSpan>) {
        self.symbols.insert(
            qualified_name.into(),
            IndexedSymbol {
                kind,
                spans,
                edges: Vec::new(),
            },
        );
    }

    /// Insert a directed edge and its inverse. Both endpoints must already
    /// be registered; unknown endpoints are ignored so a half-built index
    /// never dangles.
    pub fn add_edge(&mut self, from: &str, relation: Relation, to: &str) {
        if !self.symbols.contains_key(from) || !self.symbols.contains_key(to) {
            return;
        }
        if let Some(sym) = self.symbols.get_mut(from) {
            sym.edges.push(IndexEdge {
                relation,
                target: to.to_string(),
            });
        }
        if let Some(sym) = self.symbols.get_mut(to) {
            sym.edges.push(IndexEdge {
                relation: relation.inverse(),
                target: from.to_string(),
            });
        }
    }

    fn materialise(&self, qualified_name: &str, sym: &IndexedSymbol) -> Symbol {
        Symbol {
            qualified_name: qualified_name.to_string(),
            kind: sym.kind,
            spans: sym.spans.clone(),
        }
    }
}

impl RepositorySnapshot for InMemoryIndex {
    fn symbol(&self, qualified_name: &str) -> Result<Option<Symbol>, NavErr> {
        Ok(self
            .symbols
            .get(qualified_name)
            .map(|sym| self.materialise(qualified_name, sym)))
    }

    fn all_symbols(&self) -> Result<Vec<Symbol>, NavErr> {
        Ok(self
            .symbols
            .iter()
            .map(|(name, sym)| self.materialise(name, sym))
            .collect())
    }

    fn neighbors(&self, qualified_name: &str, relation: Relation) -> Result<Vec<Symbol>, NavErr> {
        let Some(sym) = self.symbols.get(qualified_name) else {
            return Ok(Vec::new());
        };
        let mut targets: Vec<&str> = sym
            .edges
            .iter()
            .filter(|edge| edge.relation == relation)
            .map(|edge| edge.target.as_str())
            .collect();
        targets.sort_unstable();
        targets.dedup();
        Ok(targets
            .into_iter()
            .filter_map(|name| {
                self.symbols
                    .get(name)
                    .map(|target| self.materialise(name, target))
            })
            .collect())
    }

    fn symbol_edge_count(&self, qualified_name: &str) -> Result<usize, NavErr> {
        Ok(self
            .symbols
            .get(qualified_name)
            .map(|sym| sym.edges.len())
            .unwrap_or(0))
    }

    fn files(&self) -> Result<Vec<String>, NavErr> {
        Ok(self.files.keys().cloned().collect())
    }

    fn file_source(&self, path: &str) -> Result<Option<String>, NavErr> {
        Ok(self.files.get(path).cloned())
    }

    fn span_source(&self, span: &CodeSpan) -> Result<String, NavErr> {
        let stale = || NavErr::Stale {
            path: span.path.clone(),
        };
        let source = self.files.get(&span.path).ok_or_else(stale)?;
        let text = slice_lines(source, span.start_line, span.end_line).ok_or_else(stale)?;
        if content_digest(&text) != span.digest {
            return Err(stale());
        }
        Ok(text)
    }

    fn entry_points(&self) -> Result<Vec<String>, NavErr> {
        Ok(self.entry_points.clone())
    }

    fn refresh(&self) -> Result<(), NavErr> {
        // A materialised snapshot has nothing newer to pin.
        Ok(())
    }
}

fn slice_lines(source: &str, start_line: u32, end_line: u32) -> Option<String> {
    if start_line == 0 || end_line < start_line {
        return None;
    }
    let lines: Vec<&str> = source.lines().collect();
    let start = (start_line - 1) as usize;
    let end = end_line as usize;
    if end > lines.len() {
        return None;
    }
    Some(lines[start..end].join("\n"))
}

pub(crate) fn language_for(path: &str) -> String {
    let ext = path.rsplit('.').next().unwrap_or("");
    let lang = match ext {
        "rs" => "rust",
        "py" => "python",
        "js" => "javascript",
        "ts" => "typescript",
        "go" => "go",
        "java" => "java",
        "c" | "h" => "c",
        "cc" | "cpp" | "hpp" => "cpp",
        "md" => "markdown",
        "toml" => "toml",
        _ => "text",
    };
    lang.to_string()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> InMemoryIndex {
        let mut index = InMemoryIndex::new();
        index.add_file("src/lib.rs", "mod a;\nfn alpha() {\n    beta();\n}\nfn beta() {}\n");
        let alpha = index
            .span("src/lib.rs", 2, 4, SpanKind::Function, Some("crate::alpha"))
            .unwrap();
        let beta = index
            .span("src/lib.rs", 5, 5, SpanKind::Function, Some("crate::beta"))
            .unwrap();
        index.add_symbol("crate::alpha", SpanKind::Function, vec![alpha]);
        index.add_symbol("crate::beta", SpanKind::Function, vec![beta]);
        index.add_edge("crate::alpha", Relation::Calls, "crate::beta");
        index
    }

    #[test]
    fn span_source_round_trips() {
        let index = sample();
        let span = index.symbol("crate::beta").unwrap().unwrap().spans[0].clone();
        assert_eq!(index.span_source(&span).unwrap(), "fn beta() {}");
    }

    #[test]
    fn edge_insertion_implies_inverse() {
        let index = sample();
        let callees = index.neighbors("crate::alpha", Relation::Calls).unwrap();
        assert_eq!(callees.len(), 1);
        assert_eq!(callees[0].qualified_name, "crate::beta");

        let callers = index.neighbors("crate::beta", Relation::CalledBy).unwrap();
        assert_eq!(callers.len(), 1);
        assert_eq!(callers[0].qualified_name, "crate::alpha");
    }

    #[test]
    fn removed_file_yields_stale_span() {
        let mut index = sample();
        let span = index.symbol("crate::beta").unwrap().unwrap().spans[0].clone();
        index.remove_file("src/lib.rs");
        assert!(matches!(
            index.span_source(&span),
            Err(NavErr::Stale { .. })
        ));
    }

    #[test]
    fn edited_file_yields_stale_span() {
        let mut index = sample();
        let span = index.symbol("crate::beta").unwrap().unwrap().spans[0].clone();
        index.add_file("src/lib.rs", "mod a;\nfn alpha() {\n    beta();\n}\nfn beta() { panic!() }\n");
        assert!(matches!(
            index.span_source(&span),
            Err(NavErr::Stale { .. })
        ));
    }

    #[test]
    fn edges_to_unknown_symbols_are_dropped() {
        let mut index = sample();
        index.add_edge("crate::alpha", Relation::Imports, "crate::ghost");
        assert!(index.neighbors("crate::alpha", Relation::Imports).unwrap().is_empty());
    }

    #[test]
    fn json_round_trip_preserves_snapshot() {
        let index = sample();
        let json = serde_json::to_string(&index).unwrap();
        let back: InMemoryIndex = serde_json::from_str(&json).unwrap();
        assert_eq!(back.files().unwrap(), index.files().unwrap());
        assert_eq!(
            back.symbol("crate::alpha").unwrap(),
            index.symbol("crate::alpha").unwrap()
        );
    }
}
