//! Build progress tracking and reporting, for the purpose of display to the
//! user.

use crate::graph::{Node, NodeId};
use crate::process::Termination;
use crate::task::TaskResult;
use crate::terminal;
use crate::work::{NodeState, StateCounts};
use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Compute the message to display on the console for a given node.
pub fn build_message(node: &Node) -> &str {
    let action = match &node.action {
        None => return &node.name,
        Some(action) => action,
    };
    action
        .description
        .as_deref()
        .filter(|desc| !desc.is_empty())
        .or_else(|| action.cmdline())
        .unwrap_or(&node.name)
}

/// The command line if there is one, for verbose output.
fn verbose_message(node: &Node) -> &str {
    node.action
        .as_ref()
        .and_then(|action| action.cmdline())
        .unwrap_or_else(|| build_message(node))
}

/// Trait for build progress notifications.
pub trait Progress {
    /// Called as nodes progress through walk states.
    fn update(&mut self, counts: &StateCounts);

    /// Called when a task starts.
    fn task_started(&mut self, id: NodeId, node: &Node);

    /// Called when a task completes.
    fn task_finished(&mut self, id: NodeId, node: &Node, result: &TaskResult);

    /// Log a line of output without corrupting the progress display.
    /// This line is persisted beyond further progress updates.  For example,
    /// used when a task fails; we want the final output to show that failed
    /// task's output even if we do more work after it fails.
    fn log(&mut self, msg: &str);
}

fn write_output(output: &[u8]) {
    if output.is_empty() {
        return;
    }
    let mut stdout = std::io::stdout().lock();
    let _ = stdout.write_all(output);
    if !output.ends_with(b"\n") {
        let _ = stdout.write_all(b"\n");
    }
}

fn finish_message(node: &Node, result: &TaskResult) -> Option<String> {
    match result.termination {
        Termination::Success if result.fetched => {
            Some(format!("fetched from cache: {}", node.name))
        }
        Termination::Success => None,
        Termination::Interrupted => Some(format!("interrupted: {}", build_message(node))),
        Termination::Failure => Some(format!("failed: {}", build_message(node))),
    }
}

/// Progress implementation that prints nothing.  Used by `-q` and tests.
#[derive(Default)]
pub struct SilentProgress {
    /// Everything passed to log(), for inspection.
    pub logged: Vec<String>,
}

impl Progress for SilentProgress {
    fn update(&mut self, _counts: &StateCounts) {}
    fn task_started(&mut self, _id: NodeId, _node: &Node) {}
    fn task_finished(&mut self, _id: NodeId, _node: &Node, _result: &TaskResult) {}
    fn log(&mut self, msg: &str) {
        self.logged.push(msg.to_string());
    }
}

/// Progress implementation for "dumb" console, without any overprinting.
#[derive(Default)]
pub struct DumbConsoleProgress {
    /// Whether to print command lines of started programs.
    verbose: bool,

    /// The id of the last command printed, used to avoid printing it twice
    /// when we have two updates from the same command in a row.
    last_started: Option<NodeId>,
}

impl DumbConsoleProgress {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            last_started: None,
        }
    }
}

impl Progress for DumbConsoleProgress {
    fn update(&mut self, _counts: &StateCounts) {
        // ignore
    }

    fn task_started(&mut self, id: NodeId, node: &Node) {
        self.log(if self.verbose {
            verbose_message(node)
        } else {
            build_message(node)
        });
        self.last_started = Some(id);
    }

    fn task_finished(&mut self, id: NodeId, node: &Node, result: &TaskResult) {
        match finish_message(node, result) {
            Some(msg) => self.log(&msg),
            None => {
                if !result.output.is_empty() && self.last_started != Some(id) {
                    self.log(build_message(node))
                }
            }
        }
        write_output(&result.output);
    }

    fn log(&mut self, msg: &str) {
        println!("{}", msg);
    }
}

/// Progress implementation for "fancy" console, with progress bar etc.
/// Each time it prints, it clears from the cursor to the end of the console,
/// prints the status text, and then moves moves the cursor back up to the
/// start position.  This means on errors etc. we can clear any status by
/// clearing the console too.
pub struct FancyConsoleProgress {
    state: Arc<Mutex<FancyState>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

/// Screen updates happen after this duration passes, to reduce the amount
/// of printing in the case of rapid updates.  This helps with terminal flicker.
const UPDATE_DELAY: Duration = Duration::from_millis(50);

fn lock(state: &Mutex<FancyState>) -> MutexGuard<'_, FancyState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl FancyConsoleProgress {
    pub fn new(verbose: bool) -> Self {
        let dirty_cond = Arc::new(Condvar::new());
        let state = Arc::new(Mutex::new(FancyState {
            done: false,
            dirty: false,
            dirty_cond: dirty_cond.clone(),
            counts: StateCounts::default(),
            tasks: VecDeque::new(),
            verbose,
        }));

        // Thread to debounce status updates -- waits a bit, then prints after
        // any dirty state.
        let thread = std::thread::spawn({
            let state = state.clone();
            move || loop {
                // Wait to be notified of a display update, or timeout at 500ms.
                // The timeout is for the case where there are lengthy build
                // steps and the progress will show how long they've been
                // running.
                {
                    let guard = lock(&state);
                    let (guard, _) = dirty_cond
                        .wait_timeout_while(guard, Duration::from_millis(500), |state| {
                            !state.dirty
                        })
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    if guard.done {
                        break;
                    }
                }

                // Delay a little bit in case more display updates come in.
                std::thread::sleep(UPDATE_DELAY);

                // Update regardless of whether we timed out or not.
                let mut guard = lock(&state);
                if guard.done {
                    break;
                }
                guard.print_progress();
            }
        });

        FancyConsoleProgress {
            state,
            thread: Some(thread),
        }
    }
}

impl Progress for FancyConsoleProgress {
    fn update(&mut self, counts: &StateCounts) {
        lock(&self.state).update(counts);
    }

    fn task_started(&mut self, id: NodeId, node: &Node) {
        lock(&self.state).task_started(id, node);
    }

    fn task_finished(&mut self, id: NodeId, node: &Node, result: &TaskResult) {
        lock(&self.state).task_finished(id, node, result);
    }

    fn log(&mut self, msg: &str) {
        lock(&self.state).log(msg);
    }
}

impl Drop for FancyConsoleProgress {
    fn drop(&mut self) {
        lock(&self.state).cleanup();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Currently running build task, as tracked for progress updates.
struct Task {
    id: NodeId,
    /// When the task started running.
    start: Instant,
    /// Build status message for the task.
    message: String,
}

struct FancyState {
    done: bool,
    dirty: bool,
    dirty_cond: Arc<Condvar>,

    /// Counts of nodes in each state.
    counts: StateCounts,
    /// Build tasks that are currently executing.
    /// Pushed to as tasks are started, so it's always in order of age.
    tasks: VecDeque<Task>,
    /// Whether to print command lines of started programs.
    verbose: bool,
}

impl FancyState {
    fn dirty(&mut self) {
        self.dirty = true;
        self.dirty_cond.notify_one();
    }

    fn update(&mut self, counts: &StateCounts) {
        self.counts = counts.clone();
        self.dirty();
    }

    fn task_started(&mut self, id: NodeId, node: &Node) {
        if self.verbose {
            self.log(verbose_message(node));
        }
        self.tasks.push_back(Task {
            id,
            start: Instant::now(),
            message: build_message(node).to_string(),
        });
        self.dirty();
    }

    fn task_finished(&mut self, id: NodeId, node: &Node, result: &TaskResult) {
        if let Some(pos) = self.tasks.iter().position(|t| t.id == id) {
            self.tasks.remove(pos);
        }
        match finish_message(node, result) {
            Some(msg) => self.log(&msg),
            None => {
                if !result.output.is_empty() {
                    self.log(build_message(node))
                }
            }
        }
        write_output(&result.output);
        self.dirty();
    }

    fn log(&mut self, msg: &str) {
        self.clear_progress();
        println!("{}", msg);
        self.dirty();
    }

    fn cleanup(&mut self) {
        self.clear_progress();
        self.done = true;
        self.dirty(); // let thread quit
    }

    fn clear_progress(&self) {
        // If the user hit ctl-c, it may have printed something on the line.
        // So \r to go to first column first, then clear anything below.
        let _ = std::io::stdout().write_all(b"\r\x1b[J");
    }

    fn print_progress(&mut self) {
        self.clear_progress();
        let failed = self.counts.get(NodeState::Failed);
        let mut progress_line = format!(
            "[{}] {}/{} done, ",
            progress_bar(&self.counts, 40),
            self.counts.finished(),
            self.counts.total()
        );
        if failed > 0 {
            progress_line.push_str(&format!("{} failed, ", failed));
        }
        progress_line.push_str(&format!(
            "{}/{} running",
            self.tasks.len(),
            self.counts.get(NodeState::Ready) + self.counts.get(NodeState::Executing),
        ));
        println!("{}", progress_line);
        let mut lines = 1;

        let max_cols = terminal::get_cols().unwrap_or(80);
        let max_tasks = 8;
        let now = Instant::now();
        for task in self.tasks.iter().take(max_tasks) {
            let delta = now.duration_since(task.start).as_secs() as usize;
            println!("{}", task_message(&task.message, delta, max_cols));
            lines += 1;
        }

        if self.tasks.len() > max_tasks {
            let remaining = self.tasks.len() - max_tasks;
            println!("...and {} more", remaining);
            lines += 1;
        }

        // Move cursor up to the first printed line, for overprinting.
        print!("\x1b[{}A", lines);
        let _ = std::io::stdout().flush();
        self.dirty = false;
    }
}

/// Format a task's status message to optionally include how long it has been running
/// and also to fit within a maximum number of terminal columns.
fn task_message(message: &str, seconds: usize, max_cols: usize) -> String {
    let time_note = if seconds > 2 {
        format!(" ({}s)", seconds)
    } else {
        "".into()
    };
    let mut out: String = message.to_owned();
    if out.chars().count() + time_note.len() >= max_cols {
        let keep = max_cols.saturating_sub(time_note.len() + 3);
        out = out.chars().take(keep).collect();
        out.push_str("...");
    }
    out.push_str(&time_note);
    out
}

/// Render a StateCounts as an ASCII progress bar.
fn progress_bar(counts: &StateCounts, bar_size: usize) -> String {
    let mut bar = String::with_capacity(bar_size);
    let mut sum: usize = 0;
    let total = counts.total();
    if total == 0 {
        return " ".repeat(bar_size);
    }
    for (count, ch) in [
        (counts.finished(), '='),
        (
            counts.get(NodeState::Ready) + counts.get(NodeState::Executing),
            '-',
        ),
        (
            counts.get(NodeState::Pending) + counts.get(NodeState::NeedsRescan),
            ' ',
        ),
    ] {
        sum += count;
        let mut target_size = sum * bar_size / total;
        if count > 0 && target_size == bar.len() && target_size < bar_size {
            // Special case: for non-zero count, ensure we always get at least
            // one tick.
            target_size += 1;
        }
        while bar.len() < target_size {
            bar.push(ch);
        }
    }
    bar
}
