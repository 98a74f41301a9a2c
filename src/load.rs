//! Graph loading: parses build.keel and constructs the build graph from it.

use crate::canon::canon_path;
use crate::decider::Decider;
use crate::eval::{self, LazyVars, Vars};
use crate::graph::{Action, FileLoc, Graph, GraphError, NodeId, NodeKind};
use crate::parse::{self, Statement};
use crate::scan::{IncludeScanner, ScannerRegistry};
use crate::trace;
use anyhow::{anyhow, bail};
use std::borrow::Cow;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A variable lookup environment for magic $in/$out variables.
struct BuildImplicitVars<'a> {
    ins: &'a [String],
    out: &'a str,
}

impl<'a> eval::Env for BuildImplicitVars<'a> {
    fn get_var(&self, var: &str) -> Option<Cow<str>> {
        match var {
            "in" => Some(Cow::Owned(self.ins.join(" "))),
            "in_newline" => Some(Cow::Owned(self.ins.join("\n"))),
            "out" => Some(Cow::Borrowed(self.out)),
            _ => None,
        }
    }
}

fn parse_flag(key: &str, val: Option<String>) -> anyhow::Result<bool> {
    match val.as_deref() {
        None | Some("") | Some("0") | Some("false") => Ok(false),
        Some("1") | Some("true") => Ok(true),
        Some(other) => bail!("bad value {:?} for {}", other, key),
    }
}

/// A build or alias waiting for every declaration to be seen, with the
/// top-level bindings as they stood at its statement.
enum Deferred<'text> {
    Build(parse::Build<'text>, Vars<'text>),
    Alias(parse::Alias, Vars<'text>),
}

/// Internal state used while loading.
#[derive(Default)]
struct Loader {
    graph: Graph,
    default: Vec<NodeId>,
    rules: HashMap<String, LazyVars>,
    scanners: ScannerRegistry,
}

impl Loader {
    fn add_build(
        &mut self,
        filename: &Arc<PathBuf>,
        env: &Vars,
        b: parse::Build,
    ) -> anyhow::Result<()> {
        let loc = FileLoc {
            filename: filename.clone(),
            line: b.line,
        };
        let rule = match self.rules.get(b.rule) {
            Some(r) => r,
            None => bail!("{}: unknown rule {:?}", loc, b.rule),
        };

        let out = canon_path(b.out.as_str());
        let ins: Vec<String> = b.ins.iter().map(|p| canon_path(p.as_str())).collect();
        let implicit_vars = BuildImplicitVars {
            ins: &ins,
            out: &out,
        };
        let build_vars = &b.vars;
        let envs: [&dyn eval::Env; 4] = [&implicit_vars, build_vars, rule, env];
        let lookup = |key: &str| {
            build_vars
                .get(key)
                .or_else(|| rule.get(key))
                .map(|var| var.evaluate(&envs))
        };

        let cmdline = match lookup("command") {
            Some(cmdline) if !cmdline.is_empty() => cmdline,
            _ => bail!("{}: rule {:?} has no command", loc, b.rule),
        };
        let mut action = Action::command(cmdline);
        if let Some(desc) = lookup("description") {
            action = action.with_description(desc);
        }
        if let Some(depfile) = lookup("depfile").filter(|d| !d.is_empty()) {
            action = action.with_depfile(depfile);
        }
        let decider = match lookup("decider").filter(|d| !d.is_empty()) {
            Some(name) => Some(
                name.parse::<Decider>()
                    .map_err(|err| anyhow!("{}: {}", loc, err))?,
            ),
            None => None,
        };
        let side_effects = lookup("side_effect").unwrap_or_default();
        let search_path = lookup("search_path").unwrap_or_default();
        let precious = parse_flag("precious", lookup("precious"))?;
        let noclean = parse_flag("noclean", lookup("noclean"))?;
        let nocache = parse_flag("nocache", lookup("nocache"))?;
        let always_build = parse_flag("always_build", lookup("always_build"))?;
        let ignore = lookup("ignore").unwrap_or_default();

        // A declared directory stays a directory when something builds it.
        let id = match self.graph.lookup(&out) {
            Some(id) if self.graph.node(id).kind == NodeKind::Directory => id,
            _ => self.graph.add_node(&out, NodeKind::DerivedFile)?,
        };
        self.graph.set_action(id, action)?;
        for name in &ins {
            let child = self.graph.file_id(name);
            self.graph.add_dependency(id, child);
        }
        for name in &b.implicit {
            let child = self.graph.file_id(name);
            self.graph.add_implicit(id, child);
        }
        for name in &b.order_only {
            let child = self.graph.file_id(name);
            self.graph.add_order_only(id, child);
        }
        for name in ignore.split_whitespace() {
            let child = self.graph.file_id(name);
            self.graph.add_ignore(id, child);
        }
        for name in side_effects.split_whitespace() {
            let effect = self.graph.file_id(name);
            self.graph.add_side_effect(id, effect);
        }

        let node = self.graph.node_mut(id);
        node.search_path = search_path
            .split_whitespace()
            .map(|dir| canon_path(dir))
            .collect();
        node.decider = decider;
        node.flags.precious = precious;
        node.flags.noclean = noclean;
        node.flags.nocache = nocache;
        node.flags.always_build = always_build;
        node.location = Some(loc);
        Ok(())
    }

    fn add_alias(
        &mut self,
        filename: &Arc<PathBuf>,
        env: &Vars,
        a: parse::Alias,
    ) -> anyhow::Result<()> {
        let id = self.graph.add_node(&a.name, NodeKind::Alias)?;
        let ins: Vec<String> = a.ins.iter().map(|p| canon_path(p.as_str())).collect();
        for name in &ins {
            let child = self.graph.file_id(name);
            self.graph.add_dependency(id, child);
        }

        let implicit_vars = BuildImplicitVars {
            ins: &ins,
            out: &a.name,
        };
        let envs: [&dyn eval::Env; 3] = [&implicit_vars, &a.vars, env];
        let lookup = |key: &str| a.vars.get(key).map(|var| var.evaluate(&envs));
        if let Some(cmdline) = lookup("command").filter(|c| !c.is_empty()) {
            let mut action = Action::command(cmdline);
            if let Some(desc) = lookup("description") {
                action = action.with_description(desc);
            }
            self.graph.set_action(id, action)?;
        }
        self.graph.node_mut(id).location = Some(FileLoc {
            filename: filename.clone(),
            line: a.line,
        });
        Ok(())
    }

    fn add_scan(&mut self, scan: &parse::Scan) -> anyhow::Result<()> {
        let scanner = match scan.scanner {
            "include" => Arc::new(IncludeScanner::new()),
            other => bail!("unknown scanner {:?}", other),
        };
        match scan.nested {
            None => self.scanners.register(scan.suffix, scanner),
            Some(nested) => self.scanners.register_nested(scan.suffix, nested, scanner),
        };
        Ok(())
    }

    fn parse(&mut self, path: PathBuf, text: &str) -> anyhow::Result<()> {
        let filename = Arc::new(path);
        let mut parser = parse::Parser::new(text);
        let mut deferred = Vec::new();
        let mut defaults = Vec::new();
        loop {
            let stmt = match parser
                .read()
                .map_err(|err| anyhow!(parser.format_parse_error(&filename, err)))?
            {
                None => break,
                Some(s) => s,
            };
            match stmt {
                Statement::Rule(rule) => {
                    self.rules.insert(rule.name.to_owned(), rule.vars);
                }
                Statement::Directory(dirs) => {
                    for dir in dirs {
                        self.graph.add_node(&dir, NodeKind::Directory)?;
                    }
                }
                Statement::Alias(alias) => {
                    // Register the name now so earlier builds can refer to it.
                    self.graph.add_node(&alias.name, NodeKind::Alias)?;
                    deferred.push(Deferred::Alias(alias, parser.vars.clone()));
                }
                Statement::Build(build) => deferred.push(Deferred::Build(build, parser.vars.clone())),
                Statement::Default(names) => defaults.extend(names),
                Statement::Scan(scan) => self.add_scan(&scan)?,
            }
        }

        for item in deferred {
            match item {
                Deferred::Build(build, env) => self.add_build(&filename, &env, build)?,
                Deferred::Alias(alias, env) => self.add_alias(&filename, &env, alias)?,
            }
        }
        for name in defaults {
            let id = self
                .graph
                .lookup(&name)
                .ok_or(GraphError::UnknownTarget(name))?;
            self.default.push(id);
        }
        Ok(())
    }
}

/// State loaded by read().
pub struct State {
    pub graph: Graph,
    pub default: Vec<NodeId>,
    pub scanners: ScannerRegistry,
}

/// Build a finalized graph from manifest text.
pub fn parse(path: &Path, text: &str) -> anyhow::Result<State> {
    let mut text = text.to_string();
    if !text.ends_with('\n') {
        text.push('\n');
    }
    text.push('\0');
    let mut loader = Loader::default();
    loader.parse(path.to_path_buf(), &text)?;
    trace::scope("graph.finalize", || loader.graph.finalize())?;
    Ok(State {
        graph: loader.graph,
        default: loader.default,
        scanners: loader.scanners,
    })
}

/// Load the manifest at `build_filename`.
pub fn read(build_filename: &str) -> anyhow::Result<State> {
    let path = Path::new(build_filename);
    let text = trace::scope("fs::read", || std::fs::read_to_string(path))
        .map_err(|err| anyhow!("read {}: {}", path.display(), err))?;
    trace::scope("load::parse", || parse(path, &text))
}
