//! Walking the graph: deciding which nodes are out of date, running their
//! actions in dependency order and recording what each build saw.

use crate::cache::{ArtifactCache, CacheOptions};
use crate::db::{BuildRecord, ChildRecord, FileInfo, SignatureStore};
use crate::decider::{Candidate, Decider, Decision, Reason, SigSource};
use crate::densemap::DenseMap;
use crate::fs::{MTime, Stat};
use crate::graph::{Graph, GraphError, Node, NodeId, NodeKind};
use crate::process::Termination;
use crate::progress::{build_message, Progress};
use crate::scan::{MissingRefs, ScanContext, ScannerRegistry};
use crate::sig::{self, SigHasher, Signature};
use crate::task::{CachePlan, FinishedTask, Runner, TaskSpec};
use crate::{signal, trace};
use dashmap::DashMap;
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Where a node is in the walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    /// Not part of this walk.
    NoState,
    /// Wanted, waiting for its children to finish.
    Pending,
    /// Scanning found inputs that must finish before it can be decided.
    NeedsRescan,
    /// Out of date, waiting for a worker.
    Ready,
    Executing,
    UpToDate,
    Executed,
    /// Its action failed, or it depends on something that did.
    Failed,
}

const STATE_COUNT: usize = 8;

impl NodeState {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            NodeState::UpToDate | NodeState::Executed | NodeState::Failed
        )
    }
}

/// Count of nodes in each state, for progress display.
#[derive(Clone, Debug, Default)]
pub struct StateCounts([usize; STATE_COUNT]);

impl StateCounts {
    pub fn add(&mut self, state: NodeState, delta: isize) {
        let slot = &mut self.0[state as usize];
        *slot = (*slot as isize + delta).max(0) as usize;
    }

    pub fn get(&self, state: NodeState) -> usize {
        self.0[state as usize]
    }

    /// Nodes in the walk.
    pub fn total(&self) -> usize {
        self.0.iter().sum::<usize>() - self.get(NodeState::NoState)
    }

    pub fn finished(&self) -> usize {
        self.get(NodeState::UpToDate) + self.get(NodeState::Executed) + self.get(NodeState::Failed)
    }

    fn unfinished(&self) -> usize {
        self.total() - self.finished()
    }
}

/// What happened during a walk.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Stats {
    /// Actions that ran and succeeded.
    pub executed: usize,
    /// Targets copied out of the artifact cache.
    pub fetched: usize,
    /// Nodes with actions that were already up to date.
    pub up_to_date: usize,
    pub failed: usize,
    /// Nodes not attempted because something they need failed.
    pub skipped: usize,
    /// Dry run only: nodes that would have been rebuilt.
    pub would_build: usize,
    /// Failed actions walked past under `ignore_errors`.
    pub ignored: usize,
}

#[derive(Clone)]
pub struct Options {
    /// Maximum number of concurrently running tasks.
    pub parallelism: usize,
    /// Stop after this many failures; 0 means never stop.
    pub keep_going: usize,
    /// Change policy for nodes that don't choose their own.
    pub decider: Decider,
    /// Decide, but don't run anything or record anything.
    pub dry_run: bool,
    /// Log why each out-of-date node is out of date.
    pub explain: bool,
    pub missing_refs: MissingRefs,
    pub cache: Option<Arc<dyn ArtifactCache>>,
    pub cache_options: CacheOptions,
    /// Treat a failed action as finished: its parents still run, and it is
    /// left without a record so the next walk tries it again.
    pub ignore_errors: bool,
    /// Take a node's scanned inputs from its record instead of scanning.
    pub implicit_cache: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            parallelism: 1,
            keep_going: 1,
            decider: Decider::default(),
            dry_run: false,
            explain: false,
            missing_refs: MissingRefs::default(),
            cache: None,
            cache_options: CacheOptions::default(),
            ignore_errors: false,
            implicit_cache: false,
        }
    }
}

/// Memoized on-disk state of a node.  `csig` is None until computed, and
/// Some(None) when there is no content (missing file).
#[derive(Clone, Copy)]
struct Memo {
    stat: Stat,
    csig: Option<Option<Signature>>,
}

/// A node's inputs as they stood just before its action was dispatched.
struct Snapshot {
    inputs: Vec<(NodeId, FileInfo)>,
    taken_at: SystemTime,
}

/// Scanner output for one node, kept until a file it read is rebuilt.
struct ScanMemo {
    /// Names of the files the scan read or resolved.
    files: FxHashSet<String>,
    result: Result<Vec<String>, String>,
}

/// Outcome of visiting a node while collecting the wanted set.
enum Want {
    Finished,
    Waiting,
    /// Carries the failed node responsible.
    Failed(NodeId),
}

/// Outcome of scanning a node that is about to be decided.
enum Rescan {
    Done,
    Waiting(usize),
    ChildFailed(NodeId),
    Failed(String),
}

pub struct Work<'a> {
    graph: &'a mut Graph,
    db: &'a SignatureStore,
    scanners: &'a ScannerRegistry,
    progress: &'a mut dyn Progress,
    options: Options,

    states: DenseMap<NodeId, NodeState>,
    counts: StateCounts,
    /// For Pending and NeedsRescan nodes: how many children are unfinished.
    waiting: FxHashMap<NodeId, usize>,
    /// Nodes whose absence is a configuration error.
    required: FxHashSet<NodeId>,
    /// Inputs reported by each node's depfile, from this walk or the record.
    depfile_deps: FxHashMap<NodeId, Vec<NodeId>>,
    /// Nodes whose children are all finished, in the order they finished.
    eval_queue: VecDeque<NodeId>,
    /// Out-of-date nodes waiting for a worker, in the order they were found.
    ready: VecDeque<NodeId>,
    memo: DashMap<NodeId, Memo>,
    build_sigs: FxHashMap<NodeId, Signature>,
    snapshots: FxHashMap<NodeId, Snapshot>,
    scan_memo: FxHashMap<NodeId, ScanMemo>,
    /// Side effects of running tasks; at most one task holds each.
    held_effects: FxHashSet<NodeId>,
    /// Dry run only: nodes that would have been rebuilt.
    would_build: FxHashSet<NodeId>,
    failures: usize,
    stop: bool,
    stats: Stats,
}

impl<'a> Work<'a> {
    pub fn new(
        graph: &'a mut Graph,
        db: &'a SignatureStore,
        scanners: &'a ScannerRegistry,
        options: Options,
        progress: &'a mut dyn Progress,
    ) -> Self {
        Work {
            graph,
            db,
            scanners,
            progress,
            options,
            states: DenseMap::default(),
            counts: StateCounts::default(),
            waiting: FxHashMap::default(),
            required: FxHashSet::default(),
            depfile_deps: FxHashMap::default(),
            eval_queue: VecDeque::new(),
            ready: VecDeque::new(),
            memo: DashMap::new(),
            build_sigs: FxHashMap::default(),
            snapshots: FxHashMap::default(),
            scan_memo: FxHashMap::default(),
            held_effects: FxHashSet::default(),
            would_build: FxHashSet::default(),
            failures: 0,
            stop: false,
            stats: Stats::default(),
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn state(&self, id: NodeId) -> NodeState {
        *self.states.get_or(id, &NodeState::NoState)
    }

    fn set_state(&mut self, id: NodeId, state: NodeState) {
        let old = self.state(id);
        if old != NodeState::NoState {
            self.counts.add(old, -1);
        }
        if state != NodeState::NoState {
            self.counts.add(state, 1);
        }
        self.states.set_grow(id, state, NodeState::NoState);
    }

    fn name(&self, id: NodeId) -> &str {
        &self.graph.node(id).name
    }

    /// Add a target by name to the set of things to bring up to date.
    pub fn want_file(&mut self, name: &str) -> anyhow::Result<NodeId> {
        let id = self
            .graph
            .lookup(name)
            .ok_or_else(|| GraphError::UnknownTarget(name.to_string()))?;
        self.want_node(id)?;
        Ok(id)
    }

    pub fn want_node(&mut self, id: NodeId) -> anyhow::Result<()> {
        if !self.graph.is_finalized() {
            return Err(GraphError::NotFinalized.into());
        }
        self.required.insert(id);
        let mut stack = Vec::new();
        self.want_rec(id, &mut stack)?;
        Ok(())
    }

    /// Visit a node and everything below it, counting unfinished children.
    /// `stack` holds the nodes currently being visited, to spot cycles that
    /// discovered inputs introduce.
    fn want_rec(&mut self, id: NodeId, stack: &mut Vec<NodeId>) -> anyhow::Result<Want> {
        match self.state(id) {
            NodeState::NoState => {}
            NodeState::Pending | NodeState::NeedsRescan => {
                if let Some(pos) = stack.iter().position(|&n| n == id) {
                    let mut path = stack[pos..].to_vec();
                    path.push(id);
                    return Err(self.graph.cycle_error(&path).into());
                }
                return Ok(Want::Waiting);
            }
            NodeState::Ready | NodeState::Executing => return Ok(Want::Waiting),
            NodeState::UpToDate | NodeState::Executed => return Ok(Want::Finished),
            NodeState::Failed => return Ok(Want::Failed(id)),
        }

        self.set_state(id, NodeState::Pending);
        self.restore_depfile_deps(id)?;
        for child in self.graph.node(id).required_children() {
            self.required.insert(child);
        }
        let mut seen = FxHashSet::default();
        let children: Vec<NodeId> = self
            .graph
            .node(id)
            .all_children()
            .filter(|&c| seen.insert(c))
            .collect();

        stack.push(id);
        let mut waiting = 0;
        let mut failed = None;
        for child in children {
            match self.want_rec(child, stack)? {
                Want::Finished => {}
                Want::Waiting => waiting += 1,
                Want::Failed(cause) => {
                    failed.get_or_insert(cause);
                }
            }
        }
        stack.pop();

        if let Some(cause) = failed {
            self.skip(id, cause);
            return Ok(Want::Failed(cause));
        }
        self.waiting.insert(id, waiting);
        if waiting == 0 {
            self.eval_queue.push_back(id);
        }
        Ok(Want::Waiting)
    }

    /// Bring back the inputs a node's depfile reported last time, so they
    /// are brought up to date before the node is decided.
    fn restore_depfile_deps(&mut self, id: NodeId) -> anyhow::Result<()> {
        if self.graph.node(id).action.is_none() {
            return Ok(());
        }
        let record = match self.db.get_record(&self.graph.node(id).name) {
            Some(record) if !record.depfile_deps.is_empty() => record,
            _ => return Ok(()),
        };
        let deps: Vec<NodeId> = record
            .depfile_deps
            .iter()
            .map(|name| self.graph.file_id(name))
            .collect();
        for &dep in &deps {
            if let Some(path) = self.graph.find_path(dep, id) {
                let cycle: Vec<NodeId> = std::iter::once(id).chain(path).collect();
                return Err(self.graph.cycle_error(&cycle).into());
            }
        }
        self.graph.set_discovered(id, deps.clone());
        self.depfile_deps.insert(id, deps);
        Ok(())
    }

    fn cacheable(&self, node: &Node) -> bool {
        self.options.cache.is_some()
            && node.kind == NodeKind::DerivedFile
            && !node.flags.nocache
            && !node.flags.always_build
            && node.side_effects.is_empty()
    }

    fn policy(&self, id: NodeId) -> Decider {
        self.graph.node(id).decider.unwrap_or(self.options.decider)
    }

    fn memo(&self, id: NodeId) -> Memo {
        if let Some(memo) = self.memo.get(&id).map(|m| *m) {
            return memo;
        }
        let memo = Memo {
            stat: self.compute_stat(id),
            csig: None,
        };
        self.memo.insert(id, memo);
        memo
    }

    fn compute_stat(&self, id: NodeId) -> Stat {
        let node = self.graph.node(id);
        match node.kind {
            // An alias is as new as its newest input.
            NodeKind::Alias => {
                let mtime = node
                    .dirtying_children()
                    .map(|c| self.stat(c).mtime)
                    .max()
                    .unwrap_or(MTime::Missing);
                Stat {
                    mtime,
                    size: 0,
                    is_dir: false,
                }
            }
            _ => crate::fs::stat(node.path()).unwrap_or(Stat::MISSING),
        }
    }

    fn compute_content(&self, id: NodeId, stat: &Stat) -> Option<Signature> {
        let node = self.graph.node(id);
        if node.kind == NodeKind::Alias {
            let mut hasher = SigHasher::default();
            for child in node.dirtying_children() {
                hasher.write_string(self.name(child));
                hasher.write_opt_sig(self.content(child).as_ref());
            }
            return Some(hasher.finish());
        }
        if !stat.exists() {
            return None;
        }
        let result = if stat.is_dir {
            sig::dir_signature(node.path())
        } else {
            sig::file_signature(node.path())
        };
        result.ok()
    }

    /// Stat and hash the walk's source files up front, in parallel.
    fn prefetch(&self) {
        let hash = self.options.decider == Decider::Content;
        let sources: Vec<(NodeId, PathBuf)> = self
            .graph
            .all_ids()
            .filter(|&id| self.state(id) != NodeState::NoState)
            .filter(|&id| {
                let node = self.graph.node(id);
                node.action.is_none() && node.kind.is_file()
            })
            .map(|id| (id, self.graph.node(id).path().to_path_buf()))
            .collect();
        let memo = &self.memo;
        sources.par_iter().for_each(|(id, path)| {
            let stat = crate::fs::stat(path).unwrap_or(Stat::MISSING);
            let csig = match (hash, stat.exists() && !stat.is_dir) {
                (false, _) => None,
                (true, true) => Some(sig::file_signature(path).ok()),
                (true, false) => None,
            };
            memo.insert(*id, Memo { stat, csig });
        });
    }

    /// Fail before running anything if a required source is absent.
    fn check_sources(&self) -> anyhow::Result<()> {
        let mut required: Vec<NodeId> = self.required.iter().copied().collect();
        required.sort();
        for id in required {
            let node = self.graph.node(id);
            if node.action.is_some() || node.kind == NodeKind::Alias {
                continue;
            }
            if self.stat(id).exists() {
                continue;
            }
            let needed_by = node
                .parents
                .iter()
                .find(|&&p| self.state(p) != NodeState::NoState)
                .map_or("the command line", |&p| self.name(p));
            return Err(GraphError::MissingSource {
                name: node.name.clone(),
                needed_by: needed_by.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Find the inputs a node's sources refer to, plus its depfile inputs.
    fn scan_deps(&mut self, id: NodeId) -> Result<Vec<NodeId>, String> {
        let names = if self.scanners.is_empty() {
            Vec::new()
        } else {
            self.scanned_names(id)?
        };
        let mut deps: Vec<NodeId> = names.iter().map(|n| self.graph.file_id(n)).collect();
        if let Some(depfile) = self.depfile_deps.get(&id) {
            deps.extend(depfile.iter().copied());
        }
        Ok(deps)
    }

    fn scanned_names(&mut self, id: NodeId) -> Result<Vec<String>, String> {
        if let Some(memo) = self.scan_memo.get(&id) {
            return memo.result.clone();
        }
        if self.options.implicit_cache {
            if let Some(names) = self.stored_scan(id) {
                return Ok(names);
            }
        }

        let graph = &*self.graph;
        let node = graph.node(id);
        let sources: Vec<String> = node
            .sources
            .iter()
            .chain(node.implicit.iter())
            .filter(|&s| !node.ignored.contains(s))
            .map(|&s| graph.node(s))
            .filter(|s| s.kind.is_file())
            .map(|s| s.name.clone())
            .collect();
        let is_buildable =
            |name: &str| graph.lookup(name).map_or(false, |id| graph.node(id).is_derived());
        let ctx = ScanContext {
            search_path: &node.search_path,
            is_buildable: &is_buildable,
        };
        let scanners = self.scanners;
        let out = trace::scope("scan", || scanners.scan(&sources, &ctx));
        for err in &out.errors {
            self.progress.log(&format!("keel: warning: scanning {}", err));
        }
        let result = match self.options.missing_refs {
            MissingRefs::Error => match out.unresolved.first() {
                Some((from, name)) => {
                    Err(format!("{}: can't find referenced file {:?}", from, name))
                }
                None => Ok(out.deps.clone()),
            },
            MissingRefs::Warn => {
                for (from, name) in &out.unresolved {
                    self.progress
                        .log(&format!("keel: warning: {}: can't find {:?}", from, name));
                }
                Ok(out.deps.clone())
            }
            MissingRefs::Ignore => Ok(out.deps.clone()),
        };
        let files = sources.into_iter().chain(out.deps).collect();
        self.scan_memo.insert(
            id,
            ScanMemo {
                files,
                result: result.clone(),
            },
        );
        result
    }

    /// The scanned inputs stored with a node's record: everything recorded
    /// that was neither declared nor reported by its depfile.
    fn stored_scan(&self, id: NodeId) -> Option<Vec<String>> {
        let node = self.graph.node(id);
        let record = self.db.get_record(&node.name)?;
        let declared: FxHashSet<&str> = node
            .sources
            .iter()
            .chain(node.implicit.iter())
            .map(|&c| self.name(c))
            .collect();
        Some(
            record
                .children
                .iter()
                .map(|c| &c.name)
                .filter(|name| !declared.contains(name.as_str()))
                .filter(|name| !record.depfile_deps.contains(*name))
                .cloned()
                .collect(),
        )
    }

    /// Forget scans that read a file `id`'s action just wrote.
    fn forget_scans_of(&mut self, id: NodeId) {
        let node = self.graph.node(id);
        let written: Vec<&str> = std::iter::once(id)
            .chain(node.side_effects.iter().copied())
            .map(|n| self.graph.node(n).name.as_str())
            .collect();
        self.scan_memo
            .retain(|_, memo| !written.iter().any(|w| memo.files.contains(*w)));
    }

    /// Rescan a node whose children are finished, wanting any new inputs.
    fn rescan(&mut self, id: NodeId) -> anyhow::Result<Rescan> {
        let deps = match self.scan_deps(id) {
            Ok(deps) => deps,
            Err(msg) => return Ok(Rescan::Failed(msg)),
        };
        let before: FxHashSet<NodeId> = self.graph.node(id).discovered.iter().copied().collect();
        self.graph.set_discovered(id, deps);
        let discovered = self.graph.node(id).discovered.clone();

        let mut waiting = 0;
        for child in discovered {
            if before.contains(&child) {
                continue;
            }
            match self.state(child) {
                NodeState::UpToDate | NodeState::Executed => continue,
                NodeState::Failed => return Ok(Rescan::ChildFailed(child)),
                _ => {}
            }
            if let Some(path) = self.graph.find_path(child, id) {
                let cycle: Vec<NodeId> = std::iter::once(id).chain(path).collect();
                return Err(self.graph.cycle_error(&cycle).into());
            }
            let mut stack = vec![id];
            match self.want_rec(child, &mut stack)? {
                Want::Finished => {}
                Want::Waiting => waiting += 1,
                Want::Failed(cause) => return Ok(Rescan::ChildFailed(cause)),
            }
        }
        Ok(if waiting > 0 {
            Rescan::Waiting(waiting)
        } else {
            Rescan::Done
        })
    }

    fn decide(&self, id: NodeId) -> Decision {
        let node = self.graph.node(id);
        if self.options.dry_run {
            if let Some(child) = node
                .dirtying_children()
                .find(|c| self.would_build.contains(c))
            {
                return Decision::Rebuild(Reason::InputWouldRebuild(self.name(child).to_string()));
            }
        }
        let action = match &node.action {
            Some(action) => action,
            None => return Decision::UpToDate,
        };
        if node.flags.always_build {
            return Decision::Rebuild(Reason::AlwaysBuild);
        }
        let inputs: Vec<NodeId> = node.dirtying_children().collect();
        let candidate = Candidate {
            action_sig: sig::action_signature(&action.signature),
            inputs: &inputs,
            target: if node.kind == NodeKind::Alias {
                None
            } else {
                Some(id)
            },
        };
        let record = self.db.get_record(&node.name);
        self.policy(id).decide(record.as_ref(), &candidate, self)
    }

    /// The cache key for a node's build: its action plus its inputs' content.
    fn build_signature(&self, id: NodeId) -> Option<Signature> {
        let node = self.graph.node(id);
        let action = node.action.as_ref()?;
        let inputs: Vec<Option<Signature>> =
            node.dirtying_children().map(|c| self.content(c)).collect();
        Some(sig::build_signature(
            &sig::action_signature(&action.signature),
            inputs.iter().map(|s| s.as_ref()),
        ))
    }

    /// Decide a node whose children have all finished.
    fn evaluate(&mut self, id: NodeId) -> anyhow::Result<()> {
        if self.graph.node(id).action.is_none() {
            self.finish(id, NodeState::UpToDate);
            return Ok(());
        }
        match self.rescan(id)? {
            Rescan::Done => {}
            Rescan::Waiting(n) => {
                self.waiting.insert(id, n);
                self.set_state(id, NodeState::NeedsRescan);
                return Ok(());
            }
            Rescan::ChildFailed(cause) => {
                self.mark_failed(id, cause);
                return Ok(());
            }
            Rescan::Failed(msg) => {
                self.progress.log(&format!("keel: {}", msg));
                self.node_failed(id);
                return Ok(());
            }
        }

        match self.decide(id) {
            Decision::UpToDate => {
                self.stats.up_to_date += 1;
                self.populate_cache(id);
                self.finish(id, NodeState::UpToDate);
            }
            Decision::Rebuild(reason) => {
                if self.options.explain {
                    let msg = format!("keel explain: {}: {}", self.name(id), reason);
                    self.progress.log(&msg);
                }
                if self.options.dry_run {
                    self.stats.would_build += 1;
                    self.would_build.insert(id);
                    self.progress.log(build_message(self.graph.node(id)));
                    self.finish(id, NodeState::Executed);
                } else {
                    self.set_state(id, NodeState::Ready);
                    self.ready.push_back(id);
                }
            }
        }
        Ok(())
    }

    /// With `force`, store up-to-date targets the cache doesn't have yet.
    fn populate_cache(&mut self, id: NodeId) {
        let opts = self.options.cache_options;
        if !opts.force || opts.readonly || self.options.dry_run {
            return;
        }
        let cache = match &self.options.cache {
            Some(cache) if self.cacheable(self.graph.node(id)) => cache.clone(),
            _ => return,
        };
        let key = match self.build_signature(id) {
            Some(key) => key,
            None => return,
        };
        if cache.has(&key) {
            return;
        }
        if let Err(err) = cache.store(&key, self.graph.node(id).path()) {
            let msg = format!("keel: warning: cache store: {:#}", err);
            self.progress.log(&msg);
        }
    }

    /// Mark a node finished and release the parents waiting on it.
    fn finish(&mut self, id: NodeId, state: NodeState) {
        self.set_state(id, state);
        let parents = self.graph.node(id).parents.clone();
        for parent in parents {
            if !matches!(
                self.state(parent),
                NodeState::Pending | NodeState::NeedsRescan
            ) {
                continue;
            }
            if !self.graph.node(parent).all_children().any(|c| c == id) {
                continue;
            }
            if let Some(waiting) = self.waiting.get_mut(&parent) {
                *waiting = waiting.saturating_sub(1);
                if *waiting == 0 {
                    self.eval_queue.push_back(parent);
                }
            }
        }
    }

    /// A node's own action (or scan) failed.
    fn node_failed(&mut self, id: NodeId) {
        self.failures += 1;
        self.stats.failed += 1;
        self.mark_failed(id, id);
        if self.options.keep_going > 0 && self.failures >= self.options.keep_going {
            self.stop = true;
        }
    }

    /// `id` won't be attempted because `cause` failed.
    fn skip(&mut self, id: NodeId, cause: NodeId) {
        self.set_state(id, NodeState::Failed);
        self.stats.skipped += 1;
        let msg = format!(
            "keel: skipped {}: depends on failed {}",
            self.name(id),
            self.name(cause)
        );
        self.progress.log(&msg);
    }

    /// Mark `id` failed because of `cause`, and every waiting node above it.
    fn mark_failed(&mut self, id: NodeId, cause: NodeId) {
        if id == cause {
            self.set_state(id, NodeState::Failed);
        } else {
            self.skip(id, cause);
        }
        let mut stack = vec![id];
        while let Some(node) = stack.pop() {
            let parents = self.graph.node(node).parents.clone();
            for parent in parents {
                if !matches!(
                    self.state(parent),
                    NodeState::Pending | NodeState::NeedsRescan
                ) {
                    continue;
                }
                if !self.graph.node(parent).all_children().any(|c| c == node) {
                    continue;
                }
                self.skip(parent, cause);
                stack.push(parent);
            }
        }
    }

    /// Pick the oldest ready node whose side effects are all free.
    fn next_ready(&mut self) -> Option<NodeId> {
        let pos = self.ready.iter().position(|&id| {
            self.graph
                .node(id)
                .side_effects
                .iter()
                .all(|e| !self.held_effects.contains(e))
        })?;
        self.ready.remove(pos)
    }

    /// Observe an input for a record: its stat, and its content if `hash`.
    fn observe(&self, id: NodeId, hash: bool) -> FileInfo {
        let stat = self.stat(id);
        FileInfo {
            mtime: stat.mtime,
            size: stat.size,
            csig: if hash { self.content(id) } else { None },
        }
    }

    fn snapshot_inputs(&self, id: NodeId) -> Snapshot {
        let taken_at = SystemTime::now();
        let node = self.graph.node(id);
        let hash = self.policy(id).records_content() || self.cacheable(node);
        let inputs = node
            .dirtying_children()
            .map(|child| (child, self.observe(child, hash)))
            .collect();
        Snapshot { inputs, taken_at }
    }

    fn start_task(&mut self, runner: &mut Runner, id: NodeId) {
        // Inputs are recorded as they are now, not as they are once the
        // action has finished with them.
        let snapshot = self.snapshot_inputs(id);
        self.snapshots.insert(id, snapshot);
        let cache_plan = match &self.options.cache {
            Some(cache) if self.cacheable(self.graph.node(id)) => {
                self.build_signature(id).map(|key| CachePlan {
                    cache: cache.clone(),
                    key,
                    store: !self.options.cache_options.readonly,
                    strict: self.options.cache_options.strict,
                })
            }
            _ => None,
        };
        if let Some(plan) = &cache_plan {
            self.build_sigs.insert(id, plan.key);
        }

        let node = self.graph.node(id);
        let action = match &node.action {
            Some(action) => action.clone(),
            None => return,
        };
        for &effect in &node.side_effects {
            self.held_effects.insert(effect);
        }
        let spec = TaskSpec {
            id,
            target: node.path().to_path_buf(),
            kind: node.kind,
            action,
            sources: node
                .sources
                .iter()
                .map(|&s| self.graph.node(s).path().to_path_buf())
                .collect(),
            precious: node.flags.precious,
            cache: cache_plan,
            hash_target: self.policy(id).records_content(),
        };
        self.progress.task_started(id, self.graph.node(id));
        self.set_state(id, NodeState::Executing);
        runner.start(spec);
    }

    fn task_finished(&mut self, task: FinishedTask) {
        let id = task.id;
        let result = task.result;
        trace::write_complete(self.name(id), task.tid + 1, task.span.0, task.span.1);
        for effect in &self.graph.node(id).side_effects {
            self.held_effects.remove(effect);
        }
        self.progress.task_finished(id, self.graph.node(id), &result);
        for warning in &result.warnings {
            self.progress.log(&format!("keel: warning: {}", warning));
        }

        match result.termination {
            Termination::Success => {}
            Termination::Failure if self.options.ignore_errors => {
                self.ignore_failure(id);
                return;
            }
            termination => {
                if termination == Termination::Interrupted {
                    self.stop = true;
                }
                self.snapshots.remove(&id);
                self.node_failed(id);
                return;
            }
        }

        self.forget_scans_of(id);
        self.memo.remove(&id);
        if let Some(info) = &result.target {
            self.memo.insert(
                id,
                Memo {
                    stat: Stat {
                        mtime: info.mtime,
                        size: info.size,
                        is_dir: self.graph.node(id).kind == NodeKind::Directory,
                    },
                    csig: info.csig.map(Some),
                },
            );
        }
        if let Some(names) = &result.depfile_deps {
            let deps: Vec<NodeId> = names.iter().map(|n| self.graph.file_id(n)).collect();
            self.depfile_deps.insert(id, deps);
        }
        // Pick up anything the action itself revealed.
        if let Ok(deps) = self.scan_deps(id) {
            self.graph.set_discovered(id, deps);
        }
        self.record(id, result.target);
        if result.fetched {
            self.stats.fetched += 1;
        } else {
            self.stats.executed += 1;
        }
        self.finish(id, NodeState::Executed);
    }

    /// A failed action under `ignore_errors`: parents go ahead, and the
    /// node keeps no record so it runs again next time.
    fn ignore_failure(&mut self, id: NodeId) {
        self.snapshots.remove(&id);
        self.memo.remove(&id);
        self.forget_scans_of(id);
        self.db.remove_record(&self.graph.node(id).name);
        self.stats.ignored += 1;
        self.finish(id, NodeState::Executed);
    }

    /// Write what this build saw to the signature store.
    fn record(&mut self, id: NodeId, target: Option<FileInfo>) {
        let snapshot = self.snapshots.remove(&id);
        let node = self.graph.node(id);
        let action = match &node.action {
            Some(action) => action,
            None => return,
        };
        let hash = self.policy(id).records_content() || self.build_sigs.contains_key(&id);
        let children = node
            .dirtying_children()
            .map(|child| {
                let seen = snapshot
                    .as_ref()
                    .and_then(|s| s.inputs.iter().find(|(c, _)| *c == child))
                    .map(|&(_, info)| info);
                let info = match seen {
                    Some(info) => info,
                    // Only learned of after the action ran.  Anything written
                    // since it started may not be what the action read.
                    None => {
                        let mut info = self.observe(child, hash);
                        let started = snapshot.as_ref().map(|s| s.taken_at);
                        if let (MTime::Stamp(mtime), Some(started)) = (info.mtime, started) {
                            if mtime >= started {
                                info.csig = None;
                            }
                        }
                        info
                    }
                };
                ChildRecord {
                    name: self.name(child).to_string(),
                    info,
                }
            })
            .collect();
        let depfile_deps = self
            .depfile_deps
            .get(&id)
            .map(|deps| deps.iter().map(|&d| self.name(d).to_string()).collect())
            .unwrap_or_default();
        let record = BuildRecord {
            action_sig: sig::action_signature(&action.signature),
            build_sig: self.build_sigs.get(&id).copied(),
            children,
            depfile_deps,
            target,
            recorded_at: SystemTime::now(),
        };
        self.db.set_record(&node.name, record);
    }

    fn should_stop(&self) -> bool {
        self.stop || signal::interrupted()
    }

    fn run_loop(&mut self, runner: &mut Runner) -> anyhow::Result<()> {
        trace::scope("prefetch", || self.prefetch());
        self.check_sources()?;
        loop {
            while let Some(id) = self.eval_queue.pop_front() {
                if matches!(
                    self.state(id),
                    NodeState::Pending | NodeState::NeedsRescan
                ) {
                    self.evaluate(id)?;
                }
            }

            if !self.should_stop() {
                while runner.can_start_more() {
                    match self.next_ready() {
                        Some(id) => self.start_task(runner, id),
                        None => break,
                    }
                }
            }
            self.progress.update(&self.counts);

            if !runner.is_running() {
                if self.eval_queue.is_empty() {
                    break;
                }
                continue;
            }
            if let Some(task) = runner.wait(Duration::from_millis(500)) {
                self.task_finished(task);
            }
        }
        if !self.should_stop() && self.counts.unfinished() > 0 {
            anyhow::bail!(
                "internal error: walk ended with {} unfinished nodes",
                self.counts.unfinished()
            );
        }
        Ok(())
    }

    /// Bring every wanted node up to date.  Returns the number of targets
    /// built (or fetched), or None if anything failed or the walk was
    /// interrupted.  Configuration errors found during the walk (cycles
    /// through discovered inputs, missing sources) are returned as errors.
    /// Either way the signature store is flushed before returning.
    pub fn run(&mut self) -> anyhow::Result<Option<usize>> {
        let mut runner = Runner::new(self.options.parallelism.max(1));
        let result = self.run_loop(&mut runner);
        // Let in-flight tasks finish so their results are recorded.
        while runner.is_running() {
            if let Some(task) = runner.wait(Duration::from_millis(500)) {
                self.task_finished(task);
            }
        }
        if let Err(err) = self.db.flush() {
            self.progress
                .log(&format!("keel: warning: signature store: {:#}", err));
        }
        self.progress.update(&self.counts);
        result?;
        if self.failures > 0 || self.should_stop() {
            return Ok(None);
        }
        Ok(Some(self.stats.executed + self.stats.fetched))
    }
}

impl SigSource for Work<'_> {
    fn name(&self, id: NodeId) -> &str {
        Work::name(self, id)
    }

    fn stat(&self, id: NodeId) -> Stat {
        self.memo(id).stat
    }

    fn content(&self, id: NodeId) -> Option<Signature> {
        let memo = self.memo(id);
        if let Some(csig) = memo.csig {
            return csig;
        }
        let csig = self.compute_content(id, &memo.stat);
        self.memo.insert(
            id,
            Memo {
                stat: memo.stat,
                csig: Some(csig),
            },
        );
        csig
    }
}
