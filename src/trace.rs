//! Chrome trace output, enabled with `-d trace`.  Load the resulting file in
//! chrome://tracing or Perfetto to see where a build spent its time.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Mutex;
use std::time::Instant;

static TRACE: Mutex<Option<Trace>> = Mutex::new(None);

struct Trace {
    start: Instant,
    w: BufWriter<File>,
}

impl Trace {
    fn new(path: &str) -> std::io::Result<Self> {
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(w, "[")?;
        Ok(Trace {
            start: Instant::now(),
            w,
        })
    }

    fn write_complete(
        &mut self,
        name: &str,
        tid: usize,
        start: Instant,
        end: Instant,
    ) -> std::io::Result<()> {
        writeln!(
            self.w,
            "{{\"pid\": 0, \"tid\": {}, \"name\": {:?}, \"ts\": {}, \"ph\": \"X\", \"dur\": {}}},",
            tid,
            name,
            start.saturating_duration_since(self.start).as_micros(),
            end.saturating_duration_since(start).as_micros(),
        )
    }

    fn close(&mut self) -> std::io::Result<()> {
        let now = Instant::now();
        // The final event has no trailing comma, keeping the array valid JSON.
        write!(
            self.w,
            "{{\"pid\": 0, \"tid\": 0, \"name\": \"main\", \"ts\": 0, \"ph\": \"X\", \"dur\": {}}}\n]\n",
            now.saturating_duration_since(self.start).as_micros()
        )?;
        self.w.flush()
    }
}

fn with_trace(f: impl FnOnce(&mut Trace) -> std::io::Result<()>) {
    let mut guard = TRACE.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(trace) = guard.as_mut() {
        // Tracing is best-effort; a failed write just loses the event.
        let _ = f(trace);
    }
}

pub fn open(path: &str) -> std::io::Result<()> {
    let trace = Trace::new(path)?;
    *TRACE.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(trace);
    Ok(())
}

pub fn enabled() -> bool {
    TRACE
        .lock()
        .map(|guard| guard.is_some())
        .unwrap_or(false)
}

/// Record a span that already happened, e.g. a task on a worker thread.
pub fn write_complete(name: &str, tid: usize, start: Instant, end: Instant) {
    with_trace(|t| t.write_complete(name, tid, start, end));
}

/// Run `f`, recording how long it took.
#[inline]
pub fn scope<T>(name: &'static str, f: impl FnOnce() -> T) -> T {
    if !enabled() {
        return f();
    }
    let start = Instant::now();
    let result = f();
    write_complete(name, 0, start, Instant::now());
    result
}

pub fn close() -> std::io::Result<()> {
    let mut guard = TRACE.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    match guard.take() {
        Some(mut trace) => trace.close(),
        None => Ok(()),
    }
}
