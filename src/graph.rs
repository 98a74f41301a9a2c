//! The build graph: nodes (files, directories, aliases), the edges between
//! them, and the actions that produce derived nodes.

use crate::canon::canon_path;
use crate::densemap::{self, DenseMap};
use crate::decider::Decider;
use rustc_hash::{FxHashMap, FxHashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Id for Node entries in a Graph.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);
impl densemap::Index for NodeId {
    fn index(&self) -> usize {
        self.0 as usize
    }
}
impl From<usize> for NodeId {
    fn from(u: usize) -> NodeId {
        NodeId(u as u32)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NodeKind {
    /// A file nothing in the graph produces.
    SourceFile,
    /// A file produced by an action.
    DerivedFile,
    /// A directory, whose content is its list of entries.
    Directory,
    /// A named group of other nodes, not backed by anything on disk.
    Alias,
}

impl NodeKind {
    pub fn is_file(&self) -> bool {
        matches!(self, NodeKind::SourceFile | NodeKind::DerivedFile)
    }

    /// Whether two declarations of the same identity can be the same node.
    fn compatible(&self, other: NodeKind) -> bool {
        *self == other || (self.is_file() && other.is_file())
    }
}

/// Configuration errors: all of these are detected before any action runs.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
    #[error("conflicting actions for {node:?}: {existing:?} vs {new:?}")]
    ConflictingActions {
        node: String,
        existing: String,
        new: String,
    },
    #[error("{name:?} is already declared as {existing:?}, not {requested:?}")]
    KindConflict {
        name: String,
        existing: NodeKind,
        requested: NodeKind,
    },
    #[error("missing source {name:?}, needed by {needed_by:?}, and no action produces it")]
    MissingSource { name: String, needed_by: String },
    #[error("graph must be finalized before walking it")]
    NotFinalized,
    #[error("unknown target {0:?}")]
    UnknownTarget(String),
}

/// Paths handed to an action function.
pub struct ActionContext<'a> {
    pub target: &'a Path,
    pub sources: &'a [PathBuf],
}

pub type ActionFn = dyn Fn(&ActionContext) -> anyhow::Result<()> + Send + Sync;

#[derive(Clone)]
pub enum ActionKind {
    /// A shell command line.
    Command(String),
    /// An in-process function.
    Function(Arc<ActionFn>),
}

impl std::fmt::Debug for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionKind::Command(cmd) => write!(f, "Command({:?})", cmd),
            ActionKind::Function(_) => write!(f, "Function(..)"),
        }
    }
}

/// How to (re)build a node.
#[derive(Clone, Debug)]
pub struct Action {
    pub kind: ActionKind,
    /// The text identifying this action for change detection.  Two actions
    /// with the same signature text are considered the same action.
    pub signature: String,
    pub description: Option<String>,
    /// Path of a Makefile-style depfile the action writes, listing inputs it
    /// discovered while running.
    pub depfile: Option<PathBuf>,
}

impl Action {
    /// A shell command; the command line is its own signature.
    pub fn command(cmdline: impl Into<String>) -> Self {
        let cmdline = cmdline.into();
        Action {
            signature: cmdline.clone(),
            kind: ActionKind::Command(cmdline),
            description: None,
            depfile: None,
        }
    }

    /// An in-process function, identified by `signature`.
    pub fn function(
        signature: impl Into<String>,
        f: impl Fn(&ActionContext) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        Action {
            kind: ActionKind::Function(Arc::new(f)),
            signature: signature.into(),
            description: None,
            depfile: None,
        }
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    pub fn with_depfile(mut self, path: impl Into<PathBuf>) -> Self {
        self.depfile = Some(path.into());
        self
    }

    pub fn cmdline(&self) -> Option<&str> {
        match &self.kind {
            ActionKind::Command(cmd) => Some(cmd),
            ActionKind::Function(_) => None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NodeFlags {
    /// Don't delete the target before rebuilding it.
    pub precious: bool,
    /// Leave the target alone when cleaning.
    pub noclean: bool,
    /// Never fetch this node from, or store it in, the artifact cache.
    pub nocache: bool,
    /// Run the action on every walk, whatever the record says.
    pub always_build: bool,
}

#[derive(Debug, Clone)]
pub struct FileLoc {
    pub filename: Arc<PathBuf>,
    pub line: usize,
}
impl std::fmt::Display for FileLoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "{}:{}", self.filename.display(), self.line)
    }
}

#[derive(Debug)]
pub struct Node {
    /// Canonical identity: a path for files and directories, a name for aliases.
    pub name: String,
    pub kind: NodeKind,
    /// Explicit inputs, in order.
    pub sources: Vec<NodeId>,
    /// Declared extra inputs that affect the signature.
    pub implicit: Vec<NodeId>,
    /// Inputs found by scanning or read from a depfile.  May name files that
    /// no longer exist.
    pub discovered: Vec<NodeId>,
    /// Inputs that must be up to date first but don't affect the signature.
    pub order_only: Vec<NodeId>,
    /// Children left out of change detection, whatever edge brought them in.
    /// They are still brought up to date first.
    pub ignored: Vec<NodeId>,
    /// Nodes with an edge of any kind to this one.
    pub parents: Vec<NodeId>,
    pub action: Option<Action>,
    /// Nodes modified as a byproduct of running this node's action.
    pub side_effects: Vec<NodeId>,
    /// Directories the scanner searches for referenced files.
    pub search_path: Vec<String>,
    /// Per-node override of the walk's change policy.
    pub decider: Option<Decider>,
    pub flags: NodeFlags,
    pub location: Option<FileLoc>,
}

impl Node {
    fn new(name: String, kind: NodeKind) -> Self {
        Node {
            name,
            kind,
            sources: Vec::new(),
            implicit: Vec::new(),
            discovered: Vec::new(),
            order_only: Vec::new(),
            ignored: Vec::new(),
            parents: Vec::new(),
            action: None,
            side_effects: Vec::new(),
            search_path: Vec::new(),
            decider: None,
            flags: NodeFlags::default(),
            location: None,
        }
    }

    pub fn path(&self) -> &Path {
        Path::new(&self.name)
    }

    /// Inputs that, if changed, invalidate this node, in signature order.
    pub fn dirtying_children(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.sources
            .iter()
            .chain(self.implicit.iter())
            .chain(self.discovered.iter())
            .copied()
            .filter(move |c| !self.ignored.contains(c))
    }

    /// Every node that must be finished before this one is evaluated.
    pub fn all_children(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.dirtying_children()
            .chain(self.ignored.iter().copied())
            .chain(self.order_only.iter().copied())
    }

    /// Children whose absence is a configuration error rather than a change.
    pub fn required_children(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.sources
            .iter()
            .chain(self.implicit.iter())
            .chain(self.ignored.iter())
            .chain(self.order_only.iter())
            .copied()
    }

    pub fn is_derived(&self) -> bool {
        self.action.is_some()
    }
}

pub struct Graph {
    nodes: DenseMap<NodeId, Node>,
    by_name: FxHashMap<String, NodeId>,
    finalized: bool,
}

impl Default for Graph {
    fn default() -> Self {
        Graph::new()
    }
}

impl Graph {
    pub fn new() -> Graph {
        Graph {
            nodes: DenseMap::default(),
            by_name: FxHashMap::default(),
            finalized: false,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 0
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    pub fn all_ids(&self) -> impl Iterator<Item = NodeId> {
        self.nodes.all_ids()
    }

    /// Look up a node by name, canonicalizing the name first.
    pub fn lookup(&self, name: &str) -> Option<NodeId> {
        let canon = canon_path(name);
        self.by_name.get(&canon).copied()
    }

    /// Register a node, or return the existing node with the same identity.
    pub fn add_node(&mut self, name: &str, kind: NodeKind) -> anyhow::Result<NodeId> {
        let canon = if kind == NodeKind::Alias {
            name.to_string()
        } else {
            canon_path(name)
        };
        if let Some(&id) = self.by_name.get(&canon) {
            let node = &mut self.nodes[id];
            if !node.kind.compatible(kind) {
                return Err(GraphError::KindConflict {
                    name: canon,
                    existing: node.kind,
                    requested: kind,
                }
                .into());
            }
            if kind == NodeKind::DerivedFile {
                node.kind = NodeKind::DerivedFile;
            }
            return Ok(id);
        }
        let id = self.nodes.push(Node::new(canon.clone(), kind));
        self.by_name.insert(canon, id);
        Ok(id)
    }

    /// Get or create a file node.  Used by the loader and for scanner
    /// results, where any name refers to a file.
    pub fn file_id(&mut self, name: &str) -> NodeId {
        let canon = canon_path(name);
        if let Some(&id) = self.by_name.get(&canon) {
            return id;
        }
        let id = self.nodes.push(Node::new(canon.clone(), NodeKind::SourceFile));
        self.by_name.insert(canon, id);
        id
    }

    fn link_parent(&mut self, child: NodeId, parent: NodeId) {
        let parents = &mut self.nodes[child].parents;
        if !parents.contains(&parent) {
            parents.push(parent);
        }
    }

    fn push_edge(&mut self, node: NodeId, child: NodeId, list: fn(&mut Node) -> &mut Vec<NodeId>) {
        let edges = list(&mut self.nodes[node]);
        if edges.contains(&child) {
            return;
        }
        edges.push(child);
        self.link_parent(child, node);
        self.finalized = false;
    }

    /// Add an explicit source of `node`.
    pub fn add_dependency(&mut self, node: NodeId, child: NodeId) {
        self.nodes[node].implicit.retain(|&c| c != child);
        self.push_edge(node, child, |n| &mut n.sources);
    }

    /// Add a declared extra input of `node`.
    pub fn add_implicit(&mut self, node: NodeId, child: NodeId) {
        if self.nodes[node].sources.contains(&child) {
            return;
        }
        self.push_edge(node, child, |n| &mut n.implicit);
    }

    /// Add a must-precede input of `node` that doesn't affect its signature.
    pub fn add_order_only(&mut self, node: NodeId, child: NodeId) {
        self.push_edge(node, child, |n| &mut n.order_only);
    }

    /// Keep `child` out of `node`'s change detection.  It is still built
    /// before `node`.
    pub fn add_ignore(&mut self, node: NodeId, child: NodeId) {
        self.push_edge(node, child, |n| &mut n.ignored);
    }

    pub fn add_side_effect(&mut self, node: NodeId, effect: NodeId) {
        let effects = &mut self.nodes[node].side_effects;
        if !effects.contains(&effect) {
            effects.push(effect);
        }
    }

    /// Attach the action that produces `node`.  Registering a different
    /// action for a node that already has one is an error; registering the
    /// same one again is harmless.
    pub fn set_action(&mut self, node: NodeId, action: Action) -> anyhow::Result<()> {
        let n = &mut self.nodes[node];
        if let Some(existing) = &n.action {
            if existing.signature != action.signature {
                return Err(GraphError::ConflictingActions {
                    node: n.name.clone(),
                    existing: existing.signature.clone(),
                    new: action.signature,
                }
                .into());
            }
            return Ok(());
        }
        if n.kind == NodeKind::SourceFile {
            n.kind = NodeKind::DerivedFile;
        }
        n.action = Some(action);
        Ok(())
    }

    /// Replace the discovered inputs of a node, returning true if they changed.
    /// Anything already declared as an input is filtered out.
    pub fn set_discovered(&mut self, node: NodeId, mut deps: Vec<NodeId>) -> bool {
        {
            let n = &self.nodes[node];
            let mut seen = FxHashSet::default();
            deps.retain(|id| {
                *id != node
                    && !n.sources.contains(id)
                    && !n.implicit.contains(id)
                    && seen.insert(*id)
            });
            if deps == n.discovered {
                return false;
            }
        }
        for &dep in &deps {
            self.link_parent(dep, node);
        }
        self.nodes[node].discovered = deps;
        true
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Validate the graph before the first walk: every edge must lead to an
    /// acyclic structure.  Reports the first cycle found with its members.
    pub fn finalize(&mut self) -> anyhow::Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            OnStack,
            Done,
        }
        let mut marks: DenseMap<NodeId, Mark> = DenseMap::default();
        for _ in 0..self.nodes.len() {
            marks.push(Mark::New);
        }

        // Iterative DFS; each stack frame is (node, index of next child).
        for root in self.nodes.all_ids() {
            if marks[root] != Mark::New {
                continue;
            }
            let mut stack: Vec<(NodeId, usize)> = vec![(root, 0)];
            marks[root] = Mark::OnStack;
            while let Some(&(id, next)) = stack.last() {
                let child = self.nodes[id].all_children().nth(next);
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                match child {
                    None => {
                        marks[id] = Mark::Done;
                        stack.pop();
                    }
                    Some(child) => match marks[child] {
                        Mark::Done => {}
                        Mark::New => {
                            marks[child] = Mark::OnStack;
                            stack.push((child, 0));
                        }
                        Mark::OnStack => {
                            let start = stack
                                .iter()
                                .position(|&(n, _)| n == child)
                                .unwrap_or(0);
                            let path = stack[start..]
                                .iter()
                                .map(|&(n, _)| n)
                                .chain(std::iter::once(child))
                                .collect::<Vec<_>>();
                            return Err(self.cycle_error(&path).into());
                        }
                    },
                }
            }
        }
        self.finalized = true;
        Ok(())
    }

    pub fn cycle_error(&self, path: &[NodeId]) -> GraphError {
        GraphError::Cycle(path.iter().map(|&id| self.nodes[id].name.clone()).collect())
    }

    /// Finds a dependency path from `from` down to `to`, if any.  Used when
    /// newly discovered edges might close a cycle during a walk.
    pub fn find_path(&self, from: NodeId, to: NodeId) -> Option<Vec<NodeId>> {
        let mut visited = FxHashSet::default();
        let mut stack: Vec<(NodeId, usize)> = vec![(from, 0)];
        visited.insert(from);
        while let Some(&(id, next)) = stack.last() {
            if id == to {
                return Some(stack.iter().map(|&(n, _)| n).collect());
            }
            let child = self.nodes[id].all_children().nth(next);
            if let Some(top) = stack.last_mut() {
                top.1 += 1;
            }
            match child {
                None => {
                    stack.pop();
                }
                Some(child) => {
                    if visited.insert(child) {
                        stack.push((child, 0));
                    }
                }
            }
        }
        None
    }
}
