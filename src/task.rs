//! Runs build tasks, potentially in parallel.
//! Unaware of the build graph and walk state; a task is an action plus the
//! paths it touches, and maybe a cache entry to try first.

use crate::cache::ArtifactCache;
use crate::db::FileInfo;
use crate::depfile;
use crate::graph::{Action, ActionContext, ActionKind, NodeId, NodeKind};
use crate::process::{self, Termination};
use crate::sig::{self, Signature};
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

/// How a task uses the artifact cache.
pub struct CachePlan {
    pub cache: Arc<dyn ArtifactCache>,
    pub key: Signature,
    pub store: bool,
    pub strict: bool,
}

/// Everything a worker needs to bring one node up to date.
pub struct TaskSpec {
    pub id: NodeId,
    pub target: PathBuf,
    pub kind: NodeKind,
    pub action: Action,
    pub sources: Vec<PathBuf>,
    pub precious: bool,
    pub cache: Option<CachePlan>,
    /// Whether to compute the target's content signature afterwards.
    pub hash_target: bool,
}

pub struct FinishedTask {
    /// A (faked) "thread id", used to put different finished tasks in
    /// different tracks in a performance trace.
    pub tid: usize,
    pub id: NodeId,
    pub span: (Instant, Instant),
    pub result: TaskResult,
}

/// The result of executing a build step.
pub struct TaskResult {
    pub termination: Termination,
    /// Console output.
    pub output: Vec<u8>,
    /// True if the target was copied out of the cache rather than built.
    pub fetched: bool,
    /// Inputs the action reported in its depfile, if it ran and has one.
    pub depfile_deps: Option<Vec<String>>,
    /// The target as it stands after the task.
    pub target: Option<FileInfo>,
    /// Problems that didn't fail the task.
    pub warnings: Vec<String>,
}

impl TaskResult {
    fn failure(output: Vec<u8>, warnings: Vec<String>) -> Self {
        TaskResult {
            termination: Termination::Failure,
            output,
            fetched: false,
            depfile_deps: None,
            target: None,
            warnings,
        }
    }
}

fn run_action(spec: &TaskSpec) -> anyhow::Result<(Termination, Vec<u8>)> {
    match &spec.action.kind {
        ActionKind::Command(cmdline) => process::run_command(cmdline),
        ActionKind::Function(f) => {
            let ctx = ActionContext {
                target: &spec.target,
                sources: &spec.sources,
            };
            match f(&ctx) {
                Ok(()) => Ok((Termination::Success, Vec::new())),
                Err(err) => Ok((Termination::Failure, format!("{:#}", err).into_bytes())),
            }
        }
    }
}

/// Removes a stale target before rebuilding it, so an action that fails
/// halfway can't leave something that looks up to date.
fn remove_stale(spec: &TaskSpec) -> anyhow::Result<()> {
    if spec.precious || spec.kind != NodeKind::DerivedFile {
        return Ok(());
    }
    match std::fs::remove_file(&spec.target) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => anyhow::bail!("remove {}: {}", spec.target.display(), err),
    }
}

fn target_info(spec: &TaskSpec) -> anyhow::Result<Option<FileInfo>> {
    if spec.kind == NodeKind::Alias {
        return Ok(None);
    }
    let stat = crate::fs::stat(&spec.target)?;
    let csig = if spec.hash_target && stat.exists() {
        Some(if stat.is_dir {
            sig::dir_signature(&spec.target)?
        } else {
            sig::file_signature(&spec.target)?
        })
    } else {
        None
    };
    Ok(Some(FileInfo {
        mtime: stat.mtime,
        size: stat.size,
        csig,
    }))
}

/// Executes a build task: from the cache if possible, else by running its
/// action.  Returns an Err() if we failed outside of the action itself.
fn run_task(spec: &TaskSpec) -> anyhow::Result<TaskResult> {
    let mut warnings = Vec::new();

    let mut fetched = false;
    if let Some(plan) = &spec.cache {
        match plan.cache.fetch(&plan.key, &spec.target) {
            Ok(hit) => fetched = hit,
            Err(err) if plan.strict => {
                return Ok(TaskResult::failure(format!("{:#}", err).into_bytes(), warnings));
            }
            Err(err) => warnings.push(format!("{:#}; building instead", err)),
        }
    }

    let mut output = Vec::new();
    let mut depfile_deps = None;
    if !fetched {
        remove_stale(spec)?;
        if spec.kind != NodeKind::Alias {
            crate::fs::create_parent_dirs(&spec.target)?;
        }
        let (termination, out) = run_action(spec)?;
        output = out;
        if termination != Termination::Success {
            return Ok(TaskResult {
                termination,
                output,
                fetched: false,
                depfile_deps: None,
                target: None,
                warnings,
            });
        }
        if let Some(path) = &spec.action.depfile {
            depfile_deps = Some(depfile::read(path)?);
        }
        if let Some(plan) = &spec.cache {
            if plan.store && spec.target.is_file() {
                if let Err(err) = plan.cache.store(&plan.key, &spec.target) {
                    warnings.push(format!("cache store: {:#}", err));
                }
            }
        }
    }

    Ok(TaskResult {
        termination: Termination::Success,
        output,
        fetched,
        depfile_deps,
        target: target_info(spec)?,
        warnings,
    })
}

/// Tracks faked "thread ids" -- integers assigned to build tasks to track
/// parallelism in perf trace output.
struct ThreadIds {
    /// An entry is true when claimed, false or nonexistent otherwise.
    slots: Vec<bool>,
}
impl ThreadIds {
    fn new() -> Self {
        ThreadIds { slots: Vec::new() }
    }

    fn claim(&mut self) -> usize {
        match self.slots.iter().position(|&used| !used) {
            Some(idx) => {
                self.slots[idx] = true;
                idx
            }
            None => {
                let idx = self.slots.len();
                self.slots.push(true);
                idx
            }
        }
    }

    fn release(&mut self, slot: usize) {
        self.slots[slot] = false;
    }
}

pub struct Runner {
    finished_send: mpsc::Sender<FinishedTask>,
    finished_recv: mpsc::Receiver<FinishedTask>,
    pub running: usize,
    tids: ThreadIds,
    parallelism: usize,
}

impl Runner {
    pub fn new(parallelism: usize) -> Self {
        let (tx, rx) = mpsc::channel();
        Runner {
            finished_send: tx,
            finished_recv: rx,
            running: 0,
            tids: ThreadIds::new(),
            parallelism,
        }
    }

    pub fn can_start_more(&self) -> bool {
        self.running < self.parallelism
    }

    pub fn is_running(&self) -> bool {
        self.running > 0
    }

    pub fn start(&mut self, spec: TaskSpec) {
        let tid = self.tids.claim();
        let tx = self.finished_send.clone();
        std::thread::spawn(move || {
            let start = Instant::now();
            let result = run_task(&spec).unwrap_or_else(|err| {
                TaskResult::failure(format!("{:#}", err).into_bytes(), Vec::new())
            });
            let finish = Instant::now();

            let task = FinishedTask {
                tid,
                id: spec.id,
                span: (start, finish),
                result,
            };
            // The send will only fail if the receiver disappeared, e.g. due to shutting down.
            let _ = tx.send(task);
        });
        self.running += 1;
    }

    /// Wait for a task to complete, with a timeout.
    /// If the timeout elapses return None.
    pub fn wait(&mut self, dur: Duration) -> Option<FinishedTask> {
        let task = match self.finished_recv.recv_timeout(dur) {
            Ok(task) => task,
            // We hold a sender ourselves, so the channel never disconnects.
            Err(_) => return None,
        };
        self.tids.release(task.tid);
        self.running -= 1;
        Some(task)
    }
}
