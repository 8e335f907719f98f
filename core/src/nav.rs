//! Read-only navigation facade over a pinned repository snapshot.
//!
//! Every operation is side-effect-free and deterministic per snapshot:
//! collections come back in (path, start_line) order, lookups follow a
//! fixed resolution order, and spans stay lazy (coordinates and digest
//! only) until `read_span` materialises the text.

use std::sync::Arc;

use regex_lite::Regex;
use wildmatch::WildMatch;

use crate::config::Policy;
use crate::error::NavErr;
use crate::error::RlmErr;
use crate::error::SandboxErr;
use crate::error::ViolationKind;
use crate::index::RepositorySnapshot;
use crate::protocol::CodeSpan;
use crate::protocol::RepoOverview;
use crate::protocol::Relation;
use crate::protocol::SpanKind;
use crate::protocol::Symbol;
use crate::protocol::SymbolSummary;
use crate::protocol::content_digest;

/// How many hot files `repo_overview` reports.
const OVERVIEW_HOT_FILES: usize = 5;

pub struct Nav {
    snapshot: Arc<dyn RepositorySnapshot>,
    denylist: Vec<WildMatch>,
    regex_search: bool,
}

impl Nav {
    pub fn new(snapshot: Arc<dyn RepositorySnapshot>, policy: &Policy) -> Nav {
        let denylist = policy
            .denylist_globs
            .iter()
            .map(|glob| WildMatch::new(glob))
            .collect();
        Nav {
            snapshot,
            denylist,
            regex_search: policy.regex_search,
        }
    }

    pub fn snapshot(&self) -> &Arc<dyn RepositorySnapshot> {
        &self.snapshot
    }

    pub fn get_function(&self, name: &str) -> Result<Option<CodeSpan>, NavErr> {
        self.resolve(name, &[SpanKind::Function, SpanKind::Method])
    }

    pub fn get_class(&self, name: &str) -> Result<Option<CodeSpan>, NavErr> {
        self.resolve(name, &[SpanKind::Class])
    }

    pub fn get_method(&self, class_name: &str, method_name: &str) -> Result<Option<CodeSpan>, NavErr> {
        let symbols = self.symbols_of_kind(&[SpanKind::Method, SpanKind::Function])?;
        let dotted = format!("{class_name}.{method_name}");
        let pathed = format!("{class_name}::{method_name}");

        let matches_exact = |sym: &Symbol| {
            let q = sym.qualified_name.as_str();
            q == dotted
                || q == pathed
                || q.ends_with(&format!("::{pathed}"))
                || q.ends_with(&format!("::{dotted}"))
                || q.ends_with(&format!(".{dotted}"))
        };
        let exact: Vec<&Symbol> = symbols.iter().filter(|s| matches_exact(s)).collect();
        if !exact.is_empty() {
            return Ok(best_candidate(exact));
        }

        let lowered = dotted.to_ascii_lowercase();
        let ci: Vec<&Symbol> = symbols
            .iter()
            .filter(|s| {
                let q = s.qualified_name.to_ascii_lowercase();
                q == lowered || q.ends_with(&format!("::{lowered}")) || q.ends_with(&format!(".{lowered}"))
            })
            .collect();
        if ci.len() == 1 {
            return Ok(best_candidate(ci));
        }
        Ok(None)
    }

    /// Symbol summaries, optionally filtered to one file and/or one kind,
    /// ordered by (path, start_line).
    pub fn list_symbols(
        &self,
        path: Option<&str>,
        kind: Option<SpanKind>,
    ) -> Result<Vec<SymbolSummary>, NavErr> {
        let mut out = Vec::new();
        for sym in self.snapshot.all_symbols()? {
            if let Some(kind) = kind
                && sym.kind != kind
            {
                continue;
            }
            let Some((span_path, span_line)) =
                primary_span(&sym, path).map(|span| (span.path.clone(), span.start_line))
            else {
                continue;
            };
            out.push(SymbolSummary {
                qualified_name: sym.qualified_name,
                kind: sym.kind,
                path: span_path,
                start_line: span_line,
            });
        }
        out.sort_by(|a, b| {
            (a.path.as_str(), a.start_line, a.qualified_name.as_str()).cmp(&(
                b.path.as_str(),
                b.start_line,
                b.qualified_name.as_str(),
            ))
        });
        Ok(out)
    }

    /// Substring search over source text (regex when the policy opts in),
    /// one span per matching line, in (path, start_line) order. Scope
    /// narrows the walk to paths under the given prefix.
    pub fn search_pattern(
        &self,
        pattern: &str,
        scope: Option<&str>,
    ) -> Result<Vec<CodeSpan>, NavErr> {
        if pattern.is_empty() {
            return Err(NavErr::BadPattern("empty pattern".to_string()));
        }
        let regex = if self.regex_search {
            Some(Regex::new(pattern).map_err(|e| NavErr::BadPattern(e.to_string()))?)
        } else {
            None
        };

        let mut out = Vec::new();
        for path in self.snapshot.files()? {
            if let Some(scope) = scope
                && !path.starts_with(scope)
            {
                continue;
            }
            let Some(source) = self.snapshot.file_source(&path)? else {
                continue;
            };
            for (idx, line) in source.lines().enumerate() {
                let hit = match &regex {
                    Some(re) => re.is_match(line),
                    None => line.contains(pattern),
                };
                if !hit {
                    continue;
                }
                let line_no = (idx + 1) as u32;
                out.push(CodeSpan {
                    path: path.clone(),
                    start_line: line_no,
                    end_line: line_no,
                    language: crate::index::language_for(&path),
                    kind: SpanKind::Block,
                    symbol: None,
                    digest: content_digest(line),
                });
            }
        }
        Ok(out)
    }

    /// Graph neighbors along one relation; empty when none.
    pub fn neighbors(&self, symbol_name: &str, relation: Relation) -> Result<Vec<Symbol>, NavErr> {
        // Accept unqualified names with the same resolution the lookups use.
        let qualified = match self.snapshot.symbol(symbol_name)? {
            Some(sym) => sym.qualified_name,
            None => {
                let all = self.snapshot.all_symbols()?;
                let candidates: Vec<&Symbol> = all
                    .iter()
                    .filter(|s| last_component(&s.qualified_name) == symbol_name)
                    .collect();
                match best_symbol_name(candidates) {
                    Some(name) => name,
                    None => return Ok(Vec::new()),
                }
            }
        };
        self.snapshot.neighbors(&qualified, relation)
    }

    /// Materialise a span's source. The policy deny-list and repository
    /// root containment are enforced before any read happens.
    pub fn read_span(&self, span: &CodeSpan) -> Result<String, RlmErr> {
        self.check_path(&span.path)?;
        Ok(self.snapshot.span_source(span)?)
    }

    /// Deterministic bootstrap summary of the snapshot.
    pub fn repo_overview(&self) -> Result<RepoOverview, NavErr> {
        let files = self.snapshot.files()?;
        let symbols = self.snapshot.all_symbols()?;
        let span_count: usize = symbols.iter().map(|s| s.spans.len()).sum();

        // Rank files by the summed edge degree of the symbols they define.
        let mut degree: Vec<(String, usize)> = Vec::new();
        for path in &files {
            let mut total = 0usize;
            for sym in &symbols {
                if sym.spans.iter().any(|span| span.path == *path) {
                    total += self.snapshot.symbol_edge_count(&sym.qualified_name)?;
                }
            }
            degree.push((path.clone(), total));
        }
        degree.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        Ok(RepoOverview {
            file_count: files.len(),
            span_count,
            hot_files: degree
                .into_iter()
                .take(OVERVIEW_HOT_FILES)
                .map(|(path, _)| path)
                .collect(),
            entry_points: self.snapshot.entry_points()?,
        })
    }

    fn check_path(&self, path: &str) -> Result<(), RlmErr> {
        let escapes = path.starts_with('/')
            || path.starts_with('\\')
            || path.split(['/', '\\']).any(|seg| seg == "..");
        if escapes {
            return Err(RlmErr::Sandbox(SandboxErr::Violation {
                kind: ViolationKind::Path,
                detail: format!("`{path}` resolves outside the repository root"),
            }));
        }
        if self.denylist.iter().any(|glob| glob.matches(path)) {
            return Err(RlmErr::Sandbox(SandboxErr::Violation {
                kind: ViolationKind::Path,
                detail: format!("`{path}` matches the path deny-list"),
            }));
        }
        Ok(())
    }

    fn symbols_of_kind(&self, kinds: &[SpanKind]) -> Result<Vec<Symbol>, NavErr> {
        Ok(self
            .snapshot
            .all_symbols()?
            .into_iter()
            .filter(|s| kinds.contains(&s.kind))
            .collect())
    }

    /// Resolution order: exact qualified match, then exact unqualified
    /// match, then unique case-insensitive match, then null. Unqualified
    /// ambiguity ranks by fewest path components, tie broken by (path,
    /// start_line) so repeated lookups agree.
    fn resolve(&self, name: &str, kinds: &[SpanKind]) -> Result<Option<CodeSpan>, NavErr> {
        if let Some(sym) = self.snapshot.symbol(name)?
            && kinds.contains(&sym.kind)
        {
            return Ok(first_span(&sym));
        }

        let symbols = self.symbols_of_kind(kinds)?;
        let unqualified: Vec<&Symbol> = symbols
            .iter()
            .filter(|s| last_component(&s.qualified_name) == name)
            .collect();
        if !unqualified.is_empty() {
            return Ok(best_candidate(unqualified));
        }

        let lowered = name.to_ascii_lowercase();
        let ci: Vec<&Symbol> = symbols
            .iter()
            .filter(|s| last_component(&s.qualified_name).to_ascii_lowercase() == lowered)
            .collect();
        if ci.len() == 1 {
            return Ok(best_candidate(ci));
        }
        Ok(None)
    }
}

fn primary_span<'a>(sym: &'a Symbol, path: Option<&str>) -> Option<&'a CodeSpan> {
    sym.spans
        .iter()
        .filter(|span| path.is_none_or(|p| span.path == p))
        .min_by(|a, b| (a.path.as_str(), a.start_line).cmp(&(b.path.as_str(), b.start_line)))
}

fn component_count(qualified_name: &str) -> usize {
    qualified_name
        .split("::")
        .flat_map(|seg| seg.split('.'))
        .filter(|seg| !seg.is_empty())
        .count()
}

fn last_component(qualified_name: &str) -> &str {
    qualified_name
        .rsplit("::")
        .next()
        .and_then(|seg| seg.rsplit('.').next())
        .unwrap_or(qualified_name)
}

fn first_span(sym: &Symbol) -> Option<CodeSpan> {
    let mut spans = sym.spans.clone();
    spans.sort_by(|a, b| (a.path.as_str(), a.start_line).cmp(&(b.path.as_str(), b.start_line)));
    spans.into_iter().next()
}

fn sort_key(sym: &Symbol) -> (usize, String, u32) {
    let (path, line) = sym
        .spans
        .iter()
        .map(|s| (s.path.clone(), s.start_line))
        .min()
        .unwrap_or_default();
    (component_count(&sym.qualified_name), path, line)
}

fn best_candidate(mut candidates: Vec<&Symbol>) -> Option<CodeSpan> {
    candidates.sort_by_key(|sym| sort_key(sym));
    candidates.first().and_then(|sym| first_span(sym))
}

fn best_symbol_name(mut candidates: Vec<&Symbol>) -> Option<String> {
    candidates.sort_by_key(|sym| sort_key(sym));
    candidates.first().map(|sym| sym.qualified_name.clone())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::index::InMemoryIndex;
    use pretty_assertions::assert_eq;

    fn sample_nav(regex_search: bool) -> Nav {
        let mut index = InMemoryIndex::new();
        index.add_file(
            "src/main.rs",
            "fn main() {\n    run();\n}\nfn run() {\n    process();\n}\n",
        );
        index.add_file(
            "src/deep/nested/util.rs",
            "fn process() {\n    helper();\n}\nfn helper() {}\n",
        );
        index.add_file("docs/secret.pem", "PRIVATE KEY\n");

        let main_span = index
            .span("src/main.rs", 1, 3, SpanKind::Function, Some("crate::main"))
            .unwrap();
        let run_span = index
            .span("src/main.rs", 4, 6, SpanKind::Function, Some("crate::run"))
            .unwrap();
        let process_span = index
            .span(
                "src/deep/nested/util.rs",
                1,
                3,
                SpanKind::Function,
                Some("crate::deep::nested::process"),
            )
            .unwrap();
        index.add_symbol("crate::main", SpanKind::Function, vec![main_span]);
        index.add_symbol("crate::run", SpanKind::Function, vec![run_span]);
        index.add_symbol(
            "crate::deep::nested::process",
            SpanKind::Function,
            vec![process_span],
        );
        index.add_edge("crate::main", Relation::Calls, "crate::run");
        index.add_edge("crate::run", Relation::Calls, "crate::deep::nested::process");
        index.set_entry_points(vec!["crate::main".to_string()]);

        let mut policy = Policy::from_env();
        policy.regex_search = regex_search;
        Nav::new(Arc::new(index), &policy)
    }

    #[test]
    fn qualified_lookup_wins() {
        let nav = sample_nav(false);
        let span = nav.get_function("crate::run").unwrap().unwrap();
        assert_eq!(span.symbol.as_deref(), Some("crate::run"));
    }

    #[test]
    fn unqualified_lookup_resolves() {
        let nav = sample_nav(false);
        let span = nav.get_function("process").unwrap().unwrap();
        assert_eq!(span.path, "src/deep/nested/util.rs");
    }

    #[test]
    fn case_insensitive_unique_match_resolves() {
        let nav = sample_nav(false);
        let span = nav.get_function("RUN").unwrap().unwrap();
        assert_eq!(span.symbol.as_deref(), Some("crate::run"));
    }

    #[test]
    fn unknown_name_returns_none_not_error() {
        let nav = sample_nav(false);
        assert_eq!(nav.get_function("vanished").unwrap(), None);
    }

    #[test]
    fn spans_stay_lazy_until_read() {
        let nav = sample_nav(false);
        let span = nav.get_function("run").unwrap().unwrap();
        assert!(!span.digest.is_empty());
        let text = nav.read_span(&span).unwrap();
        assert!(text.starts_with("fn run()"));
    }

    #[test]
    fn search_is_ordered_and_deterministic() {
        let nav = sample_nav(false);
        let first = nav.search_pattern("()", None).unwrap();
        let second = nav.search_pattern("()", None).unwrap();
        assert_eq!(first, second);
        let mut sorted = first.clone();
        sorted.sort_by(|a, b| (a.path.as_str(), a.start_line).cmp(&(b.path.as_str(), b.start_line)));
        assert_eq!(first, sorted);
    }

    #[test]
    fn search_scope_narrows_paths() {
        let nav = sample_nav(false);
        let hits = nav.search_pattern("helper", Some("src/deep/")).unwrap();
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|s| s.path.starts_with("src/deep/")));
    }

    #[test]
    fn regex_search_is_gated_by_policy() {
        let substring = sample_nav(false);
        // As a substring this matches nothing.
        assert!(substring.search_pattern("fn (run|main)", None).unwrap().is_empty());

        let regex = sample_nav(true);
        let hits = regex.search_pattern("fn (run|main)", None).unwrap();
        assert_eq!(hits.len(), 2);

        assert!(matches!(
            regex.search_pattern("fn (", None),
            Err(NavErr::BadPattern(_))
        ));
    }

    #[test]
    fn neighbors_follow_the_graph() {
        let nav = sample_nav(false);
        let callees = nav.neighbors("crate::main", Relation::Calls).unwrap();
        assert_eq!(callees.len(), 1);
        assert_eq!(callees[0].qualified_name, "crate::run");

        let callers = nav.neighbors("process", Relation::CalledBy).unwrap();
        assert_eq!(callers[0].qualified_name, "crate::run");

        assert!(nav.neighbors("crate::main", Relation::Inherits).unwrap().is_empty());
    }

    #[test]
    fn read_span_refuses_denied_and_escaping_paths() {
        let nav = sample_nav(false);
        let denied = CodeSpan {
            path: "docs/secret.pem".to_string(),
            start_line: 1,
            end_line: 1,
            language: "text".to_string(),
            kind: SpanKind::Other,
            symbol: None,
            digest: String::new(),
        };
        assert!(matches!(
            nav.read_span(&denied),
            Err(RlmErr::Sandbox(SandboxErr::Violation {
                kind: ViolationKind::Path,
                ..
            }))
        ));

        let escape = CodeSpan {
            path: "../../etc/passwd".to_string(),
            ..denied
        };
        assert!(matches!(
            nav.read_span(&escape),
            Err(RlmErr::Sandbox(SandboxErr::Violation {
                kind: ViolationKind::Path,
                ..
            }))
        ));
    }

    #[test]
    fn overview_counts_and_hot_files() {
        let nav = sample_nav(false);
        let overview = nav.repo_overview().unwrap();
        assert_eq!(overview.file_count, 3);
        assert_eq!(overview.span_count, 3);
        assert_eq!(overview.entry_points, vec!["crate::main".to_string()]);
        // src/main.rs defines main+run which carry the most edges.
        assert_eq!(overview.hot_files[0], "src/main.rs");
    }

    #[test]
    fn list_symbols_orders_by_path_then_line() {
        let nav = sample_nav(false);
        let all = nav.list_symbols(None, None).unwrap();
        let names: Vec<&str> = all.iter().map(|s| s.qualified_name.as_str()).collect();
        assert_eq!(
            names,
            vec!["crate::deep::nested::process", "crate::main", "crate::run"]
        );
        let only_main = nav.list_symbols(Some("src/main.rs"), None).unwrap();
        assert_eq!(only_main.len(), 2);
    }
}
