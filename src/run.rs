use crate::cache::{ArtifactCache, CacheOptions, DirCache};
use crate::db::SignatureStore;
use crate::decider::Decider;
use crate::graph::{GraphError, NodeId};
use crate::progress::{DumbConsoleProgress, FancyConsoleProgress, Progress, SilentProgress};
use crate::scan::MissingRefs;
use crate::work::{self, Stats};
use crate::{clean, load, signal, terminal, trace};
use anyhow::anyhow;
use std::path::Path;
use std::sync::Arc;

/// Process exit codes.
pub const EXIT_SUCCESS: i32 = 0;
/// A node failed, or `-q` found something out of date.
pub const EXIT_FAILED: i32 = 1;
/// Cycle, conflicting actions, missing source, bad manifest.
pub const EXIT_CONFIG: i32 = 2;
pub const EXIT_NO_TARGETS: i32 = 3;
/// Bad usage, or I/O failure outside any action.
pub const EXIT_INTERNAL: i32 = 4;
pub const EXIT_INTERRUPTED: i32 = 130;

const DB_FILENAME: &str = ".keel_db";

#[derive(argh::FromArgs)] // this struct generates the flags and --help output
/// keel, an incremental build engine
struct Args {
    /// chdir before running
    #[argh(option, short = 'C')]
    chdir: Option<String>,

    /// input build file [default=build.keel]
    #[argh(option, short = 'f', default = "(\"build.keel\".into())")]
    build_file: String,

    /// debugging tools, use -d list to list
    #[argh(option, short = 'd')]
    debug: Vec<String>,

    /// subcommands, use -t list to list
    #[argh(option, short = 't')]
    tool: Option<String>,

    /// parallelism [default uses system thread count]
    #[argh(option, short = 'j')]
    parallelism: Option<usize>,

    /// keep going until at least N failures (0 means infinity) [default=1]
    #[argh(option, short = 'k', default = "1")]
    keep_going: usize,

    /// ignore failed actions: build what depends on them anyway
    #[argh(switch, short = 'i')]
    ignore_errors: bool,

    /// dry run: print what would run without running it
    #[argh(switch, short = 'n')]
    dry_run: bool,

    /// question: run nothing, exit 1 if anything is out of date
    #[argh(switch, short = 'q')]
    question: bool,

    /// print executed command lines
    #[argh(switch, short = 'v')]
    verbose: bool,

    /// change detection policy: timestamp, content, or hybrid [default=content]
    #[argh(option)]
    decider: Option<String>,

    /// what to do with unresolved scanner references: ignore, warn, or error
    #[argh(option, default = "(\"ignore\".into())")]
    missing_refs: String,

    /// reuse scanner results from the last build instead of scanning
    #[argh(switch)]
    implicit_cache: bool,

    /// scan again even with --implicit-cache
    #[argh(switch)]
    implicit_deps_changed: bool,

    /// artifact cache directory
    #[argh(option)]
    cache_dir: Option<String>,

    /// fetch from the cache but never store into it
    #[argh(switch)]
    cache_readonly: bool,

    /// also store up-to-date targets in the cache
    #[argh(switch)]
    cache_force: bool,

    /// fail a node whose cache entry is unusable instead of rebuilding it
    #[argh(switch)]
    cache_strict: bool,

    /// targets to build
    #[argh(positional)]
    targets: Vec<String>,
}

/// Exit code for an error that escaped the build.
pub fn error_code(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<GraphError>().is_some() {
        EXIT_CONFIG
    } else {
        EXIT_INTERNAL
    }
}

fn parse_args() -> Result<Args, i32> {
    let strings: Vec<String> = std::env::args().collect();
    let cmd = strings
        .first()
        .and_then(|arg0| Path::new(arg0).file_name())
        .and_then(|name| name.to_str())
        .unwrap_or("keel");
    let rest: Vec<&str> = strings.iter().skip(1).map(String::as_str).collect();
    <Args as argh::FromArgs>::from_args(&[cmd], &rest).map_err(|early| match early.status {
        Ok(()) => {
            println!("{}", early.output);
            EXIT_SUCCESS
        }
        Err(()) => {
            eprintln!("{}\nRun {} --help for more information.", early.output, cmd);
            EXIT_INTERNAL
        }
    })
}

fn open_cache(args: &Args, progress: &mut dyn Progress) -> Option<Arc<dyn ArtifactCache>> {
    let dir = args.cache_dir.as_ref()?;
    match DirCache::open(dir) {
        Ok(cache) => Some(Arc::new(cache)),
        Err(err) => {
            progress.log(&format!("keel: warning: {:#}; building without a cache", err));
            None
        }
    }
}

fn print_summary(args: &Args, stats: &Stats, ran: usize) {
    if args.dry_run {
        match stats.would_build {
            0 => println!("keel: no work to do"),
            n => println!("keel: would run {} tasks", n),
        }
        return;
    }
    if stats.ignored > 0 {
        println!("keel: ignored {} failed tasks", stats.ignored);
    }
    match ran {
        // Special case: don't print numbers when no work done.
        0 => println!("keel: no work to do"),
        n if stats.fetched > 0 => println!(
            "keel: ran {} tasks ({} fetched from cache), now up to date",
            n, stats.fetched
        ),
        n => println!("keel: ran {} tasks, now up to date", n),
    }
}

fn run_impl() -> anyhow::Result<i32> {
    let args = match parse_args() {
        Ok(args) => args,
        Err(code) => return Ok(code),
    };

    let mut explain = false;
    for debug in &args.debug {
        match debug.as_str() {
            "list" => {
                println!("debug tools:");
                println!("  explain  print why each target is rebuilt");
                println!("  trace    generate json performance trace");
                return Ok(EXIT_SUCCESS);
            }
            "explain" => explain = true,
            "trace" => trace::open("trace.json")?,
            _ => anyhow::bail!("unknown -d {:?}, use -d list to list", debug),
        }
    }
    if let Some(tool) = args.tool.as_deref() {
        match tool {
            "list" => {
                println!("subcommands:");
                println!("  clean  remove built targets");
                return Ok(EXIT_SUCCESS);
            }
            "clean" => {}
            _ => anyhow::bail!("unknown -t {:?}, use -t list to list", tool),
        }
    }

    let decider = match &args.decider {
        Some(name) => name.parse::<Decider>()?,
        None => Decider::default(),
    };
    let missing_refs = args.missing_refs.parse::<MissingRefs>()?;
    let parallelism = match args.parallelism {
        Some(0) => anyhow::bail!("invalid -j 0"),
        Some(n) => n,
        None => usize::from(std::thread::available_parallelism()?),
    };

    if let Some(dir) = &args.chdir {
        let dir = Path::new(dir);
        std::env::set_current_dir(dir).map_err(|err| anyhow!("chdir {:?}: {}", dir, err))?;
    }

    let mut progress: Box<dyn Progress> = if args.question {
        Box::new(SilentProgress::default())
    } else if terminal::use_fancy() {
        Box::new(FancyConsoleProgress::new(args.verbose))
    } else {
        Box::new(DumbConsoleProgress::new(args.verbose))
    };

    let mut state = match trace::scope("load::read", || load::read(&args.build_file)) {
        Ok(state) => state,
        Err(err) => {
            drop(progress);
            eprintln!("keel: error: {:#}", err);
            return Ok(EXIT_CONFIG);
        }
    };

    let mut targets: Vec<NodeId> = Vec::new();
    for name in &args.targets {
        match state.graph.lookup(name) {
            Some(id) => targets.push(id),
            None => return Err(GraphError::UnknownTarget(name.clone()).into()),
        }
    }
    if targets.is_empty() {
        targets = state.default.clone();
    }
    if targets.is_empty() {
        drop(progress);
        eprintln!("keel: error: no targets specified and no default");
        return Ok(EXIT_NO_TARGETS);
    }

    if args.tool.as_deref() == Some("clean") {
        let removed = clean::clean(&state.graph, &targets, progress.as_mut())?;
        drop(progress);
        println!("keel: removed {} files", removed);
        return Ok(EXIT_SUCCESS);
    }

    let (db, warning) = trace::scope("db::open", || SignatureStore::open(DB_FILENAME));
    if let Some(err) = warning {
        progress.log(&format!("keel: warning: {:#}; starting fresh", err));
    }
    let cache = open_cache(&args, progress.as_mut());

    signal::register_sigint();
    let options = work::Options {
        parallelism,
        keep_going: args.keep_going,
        decider,
        dry_run: args.dry_run || args.question,
        explain,
        missing_refs,
        cache,
        cache_options: CacheOptions {
            readonly: args.cache_readonly,
            force: args.cache_force,
            strict: args.cache_strict,
        },
        ignore_errors: args.ignore_errors,
        implicit_cache: args.implicit_cache && !args.implicit_deps_changed,
    };
    let (result, stats) = {
        let mut work = work::Work::new(
            &mut state.graph,
            &db,
            &state.scanners,
            options,
            progress.as_mut(),
        );
        let result = trace::scope("want", || {
            targets.iter().try_for_each(|&target| work.want_node(target))
        })
        .and_then(|()| trace::scope("work.run", || work.run()));
        (result, work.stats().clone())
    };
    drop(progress);

    let ran = match result {
        Err(err) => {
            eprintln!("keel: error: {:#}", err);
            return Ok(error_code(&err));
        }
        Ok(None) if signal::interrupted() => {
            eprintln!("keel: interrupted");
            return Ok(EXIT_INTERRUPTED);
        }
        // Don't print any summary, the failing task is enough info.
        Ok(None) => return Ok(EXIT_FAILED),
        Ok(Some(ran)) => ran,
    };
    if args.question {
        return Ok(if stats.would_build > 0 {
            EXIT_FAILED
        } else {
            EXIT_SUCCESS
        });
    }
    print_summary(&args, &stats, ran);
    Ok(EXIT_SUCCESS)
}

/// Run the command line, returning the process exit code.
pub fn run() -> anyhow::Result<i32> {
    let res = run_impl();
    if let Err(err) = trace::close() {
        eprintln!("keel: warning: writing trace: {}", err);
    }
    res
}
