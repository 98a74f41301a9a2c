//! Implicit dependency scanning: finding the files a source refers to by
//! reading its content, and dispatching to the right scanner by suffix.

use crate::canon::{join_canon, parent_dir};
use crate::smallmap::SmallMap;
use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

/// A reference to another file found while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// Looked up next to the referring file first, then on the search path.
    Local(String),
    /// Looked up on the search path only.
    System(String),
}

/// Extracts references from a file's content.  Must be a pure function of
/// the content: the same bytes always give the same references.
pub trait Scanner: Send + Sync {
    fn name(&self) -> &str;
    fn scan(&self, content: &[u8]) -> Vec<Reference>;
}

/// Finds C-preprocessor-style directives: `#include "a.h"` or
/// `#include <a.h>`, with whitespace allowed around the `#`.
pub struct IncludeScanner {
    directives: Vec<String>,
}

impl IncludeScanner {
    pub fn new() -> Self {
        Self::with_directives(&["include", "import"])
    }

    pub fn with_directives(directives: &[&str]) -> Self {
        IncludeScanner {
            directives: directives.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn scan_line(&self, line: &str) -> Option<Reference> {
        let rest = line.trim_start().strip_prefix('#')?.trim_start();
        let directive = self.directives.iter().find(|d| rest.starts_with(d.as_str()))?;
        let rest = rest[directive.len()..].trim_start();
        let (close, local) = match rest.chars().next()? {
            '"' => ('"', true),
            '<' => ('>', false),
            _ => return None,
        };
        let rest = &rest[1..];
        let end = rest.find(close)?;
        let name = &rest[..end];
        if name.is_empty() {
            return None;
        }
        Some(if local {
            Reference::Local(name.to_string())
        } else {
            Reference::System(name.to_string())
        })
    }
}

impl Default for IncludeScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl Scanner for IncludeScanner {
    fn name(&self) -> &str {
        "include"
    }

    fn scan(&self, content: &[u8]) -> Vec<Reference> {
        let text = String::from_utf8_lossy(content);
        text.lines().filter_map(|line| self.scan_line(line)).collect()
    }
}

/// What to do with a reference that resolves to nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingRefs {
    /// Drop it silently.
    #[default]
    Ignore,
    /// Drop it with a warning.
    Warn,
    /// Fail the node that needed the scan.
    Error,
}

impl std::str::FromStr for MissingRefs {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "ignore" => MissingRefs::Ignore,
            "warn" => MissingRefs::Warn,
            "error" => MissingRefs::Error,
            _ => anyhow::bail!("unknown missing-reference mode {:?}", s),
        })
    }
}

type Predicate = Box<dyn Fn(&str) -> bool + Send + Sync>;

enum Entry {
    Scanner(Arc<dyn Scanner>),
    /// Chooses among scanners by the next suffix inward; "" is the fallback.
    Selector(SmallMap<String, Arc<dyn Scanner>>),
}

/// Maps file suffixes to scanners.
#[derive(Default)]
pub struct ScannerRegistry {
    by_suffix: SmallMap<String, Entry>,
    predicates: Vec<(Predicate, Arc<dyn Scanner>)>,
}

/// The last `.ext` of a path's file name, dot included.
fn suffix_of(path: &str) -> Option<&str> {
    let file = match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    };
    match file.rfind('.') {
        Some(0) | None => None,
        Some(i) => Some(&file[i..]),
    }
}

/// Inputs needed to resolve references for one node.
pub struct ScanContext<'a> {
    pub search_path: &'a [String],
    /// Whether the build can produce the named file, so a reference to it
    /// resolves even before it exists.
    pub is_buildable: &'a dyn Fn(&str) -> bool,
}

/// Result of scanning a node's sources.
#[derive(Debug, Default)]
pub struct ScanOutput {
    /// Resolved paths, deduplicated, in discovery order.
    pub deps: Vec<String>,
    /// (referring file, reference) pairs that resolved to nothing.
    pub unresolved: Vec<(String, String)>,
    /// Files that couldn't be read.
    pub errors: Vec<String>,
}

impl ScannerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_suffix.is_empty() && self.predicates.is_empty()
    }

    /// Map `suffix` to `scanner`.  The first registration for a suffix wins;
    /// returns false if the suffix already had one.
    pub fn register(&mut self, suffix: &str, scanner: Arc<dyn Scanner>) -> bool {
        match self.by_suffix.get_mut(suffix) {
            None => {
                self.by_suffix
                    .insert(suffix.to_string(), Entry::Scanner(scanner));
                true
            }
            Some(Entry::Scanner(_)) => false,
            Some(Entry::Selector(subs)) => subs.insert_if_absent(String::new(), scanner),
        }
    }

    /// Map files ending in `sub_suffix` + `suffix` (like `.tab` + `.c`) to
    /// `scanner`, keeping whatever handles other files ending in `suffix`.
    pub fn register_nested(
        &mut self,
        suffix: &str,
        sub_suffix: &str,
        scanner: Arc<dyn Scanner>,
    ) -> bool {
        match self.by_suffix.get_mut(suffix) {
            None => {
                let mut subs = SmallMap::new();
                subs.insert(sub_suffix.to_string(), scanner);
                self.by_suffix
                    .insert(suffix.to_string(), Entry::Selector(subs));
                true
            }
            Some(entry) => match entry {
                Entry::Selector(subs) => subs.insert_if_absent(sub_suffix.to_string(), scanner),
                Entry::Scanner(existing) => {
                    let mut subs = SmallMap::new();
                    subs.insert(String::new(), existing.clone());
                    subs.insert(sub_suffix.to_string(), scanner);
                    *entry = Entry::Selector(subs);
                    true
                }
            },
        }
    }

    /// Consulted for files no suffix matches, in registration order.
    pub fn register_predicate(
        &mut self,
        predicate: impl Fn(&str) -> bool + Send + Sync + 'static,
        scanner: Arc<dyn Scanner>,
    ) {
        self.predicates.push((Box::new(predicate), scanner));
    }

    /// The scanner for a path, if any.
    pub fn lookup(&self, path: &str) -> Option<&Arc<dyn Scanner>> {
        let by_suffix = suffix_of(path).and_then(|suffix| {
            match self.by_suffix.get(suffix)? {
                Entry::Scanner(scanner) => Some(scanner),
                Entry::Selector(subs) => {
                    let inner = &path[..path.len() - suffix.len()];
                    suffix_of(inner)
                        .and_then(|sub| subs.get(sub))
                        .or_else(|| subs.get(""))
                }
            }
        });
        by_suffix.or_else(|| {
            self.predicates
                .iter()
                .find(|(pred, _)| pred(path))
                .map(|(_, scanner)| scanner)
        })
    }

    /// Scan `sources` and, transitively, every file they refer to.
    pub fn scan(&self, sources: &[String], ctx: &ScanContext) -> ScanOutput {
        let mut out = ScanOutput::default();
        let mut seen: FxHashSet<String> = sources.iter().cloned().collect();
        let mut queue: VecDeque<String> = sources.iter().cloned().collect();
        while let Some(file) = queue.pop_front() {
            let scanner = match self.lookup(&file) {
                Some(scanner) => scanner,
                None => continue,
            };
            let content = match std::fs::read(&file) {
                Ok(content) => content,
                // Not built yet; it'll be scanned once it exists.
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    out.errors.push(format!("{}: {}", file, err));
                    continue;
                }
            };
            for reference in scanner.scan(&content) {
                match resolve(&file, &reference, ctx) {
                    Some(path) => {
                        if seen.insert(path.clone()) {
                            out.deps.push(path.clone());
                            queue.push_back(path);
                        }
                    }
                    None => {
                        let name = match reference {
                            Reference::Local(name) | Reference::System(name) => name,
                        };
                        out.unresolved.push((file.clone(), name));
                    }
                }
            }
        }
        out
    }
}

fn resolve(from: &str, reference: &Reference, ctx: &ScanContext) -> Option<String> {
    let exists = |candidate: &str| Path::new(candidate).exists() || (ctx.is_buildable)(candidate);
    let name = match reference {
        Reference::Local(name) => {
            let candidate = join_canon(parent_dir(from), name);
            if exists(&candidate) {
                return Some(candidate);
            }
            name
        }
        Reference::System(name) => name,
    };
    ctx.search_path
        .iter()
        .map(|dir| join_canon(dir, name))
        .find(|candidate| exists(candidate))
}
