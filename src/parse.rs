//! Parser for build.keel manifests.
//!
//! The syntax is ninja-like: top-level variable bindings, `rule` blocks,
//! `build` statements with indented per-build bindings, plus `alias`,
//! `directory`, `default` and `scan` statements.
//!
//! To avoid allocations parsing frequently uses references into the input
//! text, marked with the lifetime `'text`.

use crate::eval::{EvalPart, EvalString, LazyVars, Vars};
use crate::lexer::{Lexer, ParseResult};
use std::path::Path;

#[derive(Debug)]
pub struct Rule<'text> {
    pub name: &'text str,
    pub vars: LazyVars,
}

#[derive(Debug)]
pub struct Build<'text> {
    pub rule: &'text str,
    pub line: usize,
    pub out: String,
    pub ins: Vec<String>,
    pub implicit: Vec<String>,
    pub order_only: Vec<String>,
    pub vars: LazyVars,
}

/// `alias name: members...`, optionally with a `command` of its own.
#[derive(Debug)]
pub struct Alias {
    pub line: usize,
    pub name: String,
    pub ins: Vec<String>,
    pub vars: LazyVars,
}

/// `scan .suffix [.nested] = scanner`
#[derive(Debug, PartialEq)]
pub struct Scan<'text> {
    pub suffix: &'text str,
    pub nested: Option<&'text str>,
    pub scanner: &'text str,
}

#[derive(Debug)]
pub enum Statement<'text> {
    Rule(Rule<'text>),
    Build(Build<'text>),
    Alias(Alias),
    Directory(Vec<String>),
    Default(Vec<String>),
    Scan(Scan<'text>),
}

pub struct Parser<'text> {
    lexer: Lexer<'text>,
    pub vars: Vars<'text>,
    /// Paths are always read into this buffer first, then copied out.
    path_buf: String,
}

fn is_ident_char(c: char) -> bool {
    matches!(c, 'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '-' | '.')
}

/// Characters of a `$name` reference; unlike idents, no '.', so that
/// `$out.d` means the value of `out` followed by ".d".
fn is_varname_char(c: char) -> bool {
    matches!(c, 'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '-')
}

fn is_path_char(c: char) -> bool {
    matches!(
      c,
      'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '-' | '.' | '/' | ',' | '+' | '@'
    )
}

impl<'text> Parser<'text> {
    /// `buf` must be nul-terminated.
    pub fn new(buf: &'text str) -> Parser<'text> {
        Parser {
            lexer: Lexer::new(buf),
            vars: Vars::new(),
            path_buf: String::with_capacity(64),
        }
    }

    pub fn format_parse_error(&self, filename: &Path, err: crate::lexer::ParseError) -> String {
        self.lexer.format_parse_error(filename, err)
    }

    pub fn read(&mut self) -> ParseResult<Option<Statement<'text>>> {
        loop {
            match self.lexer.peek() {
                '\0' => return Ok(None),
                '\n' | '\r' => self.lexer.next(),
                '#' => self.skip_comment()?,
                ' ' | '\t' => return self.lexer.parse_error("unexpected whitespace"),
                _ => {
                    let ident = self.read_ident()?;
                    self.lexer.skip_spaces();
                    match ident {
                        "rule" => return Ok(Some(Statement::Rule(self.read_rule()?))),
                        "build" => return Ok(Some(Statement::Build(self.read_build()?))),
                        "alias" => return Ok(Some(Statement::Alias(self.read_alias()?))),
                        "directory" => {
                            let dirs = self.read_path_list()?;
                            return Ok(Some(Statement::Directory(dirs)));
                        }
                        "default" => {
                            let defaults = self.read_path_list()?;
                            return Ok(Some(Statement::Default(defaults)));
                        }
                        "scan" => return Ok(Some(Statement::Scan(self.read_scan()?))),
                        ident => {
                            let val = self.read_vardef()?.evaluate(&[&self.vars]);
                            self.vars.insert(ident, val);
                        }
                    }
                }
            }
        }
    }

    fn expect_eol(&mut self) -> ParseResult<()> {
        self.lexer.skip_spaces();
        self.lexer.skip('\r');
        self.lexer.expect('\n')
    }

    fn read_vardef(&mut self) -> ParseResult<EvalString<&'text str>> {
        self.lexer.skip_spaces();
        self.lexer.expect('=')?;
        self.lexer.skip_spaces();
        self.read_eval()
    }

    /// Read the indented bindings following a rule/build/alias line.
    fn read_scoped_vars(&mut self) -> ParseResult<LazyVars> {
        let mut vars = LazyVars::new();
        while matches!(self.lexer.peek(), ' ' | '\t') {
            self.lexer.skip_spaces();
            match self.lexer.peek() {
                '\n' | '\r' => {
                    self.expect_eol()?;
                    continue;
                }
                '#' => {
                    self.skip_comment()?;
                    continue;
                }
                _ => {}
            }
            let name = self.read_ident()?;
            self.lexer.skip_spaces();
            let val = self.read_vardef()?;
            vars.insert(name.to_owned(), val.into_owned());
        }
        Ok(vars)
    }

    fn read_rule(&mut self) -> ParseResult<Rule<'text>> {
        let name = self.read_ident()?;
        self.expect_eol()?;
        let vars = self.read_scoped_vars()?;
        Ok(Rule { name, vars })
    }

    fn read_paths_to(&mut self, v: &mut Vec<String>) -> ParseResult<()> {
        self.lexer.skip_spaces();
        while let Some(path) = self.read_path()? {
            v.push(path);
            self.lexer.skip_spaces();
        }
        Ok(())
    }

    fn read_build(&mut self) -> ParseResult<Build<'text>> {
        let line = self.lexer.line;
        let mut outs = Vec::new();
        self.read_paths_to(&mut outs)?;
        let out = match outs.len() {
            1 => outs.remove(0),
            0 => return self.lexer.parse_error("expected output path"),
            _ => return self.lexer.parse_error("a build has exactly one output"),
        };

        self.lexer.expect(':')?;
        self.lexer.skip_spaces();
        let rule = self.read_ident()?;

        let mut ins = Vec::new();
        self.read_paths_to(&mut ins)?;

        let mut implicit = Vec::new();
        if self.lexer.peek() == '|' {
            self.lexer.next();
            if self.lexer.peek() == '|' {
                self.lexer.back();
            } else {
                self.read_paths_to(&mut implicit)?;
            }
        }

        let mut order_only = Vec::new();
        if self.lexer.peek() == '|' {
            self.lexer.next();
            self.lexer.expect('|')?;
            self.read_paths_to(&mut order_only)?;
        }

        self.expect_eol()?;
        let vars = self.read_scoped_vars()?;
        Ok(Build {
            rule,
            line,
            out,
            ins,
            implicit,
            order_only,
            vars,
        })
    }

    fn read_alias(&mut self) -> ParseResult<Alias> {
        let line = self.lexer.line;
        let name = match self.read_path()? {
            Some(name) => name,
            None => return self.lexer.parse_error("expected alias name"),
        };
        self.lexer.skip_spaces();
        self.lexer.expect(':')?;
        let mut ins = Vec::new();
        self.read_paths_to(&mut ins)?;
        self.expect_eol()?;
        let vars = self.read_scoped_vars()?;
        Ok(Alias {
            line,
            name,
            ins,
            vars,
        })
    }

    fn read_path_list(&mut self) -> ParseResult<Vec<String>> {
        let mut paths = Vec::new();
        self.read_paths_to(&mut paths)?;
        if paths.is_empty() {
            return self.lexer.parse_error("expected path");
        }
        self.expect_eol()?;
        Ok(paths)
    }

    fn read_scan(&mut self) -> ParseResult<Scan<'text>> {
        let suffix = self.read_ident()?;
        self.lexer.skip_spaces();
        let nested = if self.lexer.peek() == '=' {
            None
        } else {
            let nested = self.read_ident()?;
            self.lexer.skip_spaces();
            Some(nested)
        };
        self.lexer.expect('=')?;
        self.lexer.skip_spaces();
        let scanner = self.read_ident()?;
        self.expect_eol()?;
        Ok(Scan {
            suffix,
            nested,
            scanner,
        })
    }

    fn skip_comment(&mut self) -> ParseResult<()> {
        loop {
            match self.lexer.read() {
                '\0' => return Ok(()),
                '\n' => return Ok(()),
                _ => {}
            }
        }
    }

    fn read_ident(&mut self) -> ParseResult<&'text str> {
        let start = self.lexer.ofs;
        while is_ident_char(self.lexer.peek()) {
            self.lexer.next();
        }
        let end = self.lexer.ofs;
        if end == start {
            return self.lexer.parse_error("failed to scan ident");
        }
        Ok(self.lexer.slice(start, end))
    }

    fn read_eval(&mut self) -> ParseResult<EvalString<&'text str>> {
        let mut parts = Vec::with_capacity(1);
        let mut ofs = self.lexer.ofs;
        loop {
            match self.lexer.peek() {
                '\0' => return self.lexer.parse_error("unexpected EOF"),
                '\n' => break,
                '\r' if self.lexer.peek_newline() => break,
                '$' => {
                    let end = self.lexer.ofs;
                    if end > ofs {
                        parts.push(EvalPart::Literal(self.lexer.slice(ofs, end)));
                    }
                    self.lexer.next();
                    parts.push(self.read_escape()?);
                    ofs = self.lexer.ofs;
                }
                _ => self.lexer.next(),
            }
        }
        let end = self.lexer.ofs;
        if end > ofs {
            parts.push(EvalPart::Literal(self.lexer.slice(ofs, end)));
        }
        self.expect_eol()?;
        Ok(EvalString::new(parts))
    }

    fn read_path(&mut self) -> ParseResult<Option<String>> {
        self.path_buf.clear();
        loop {
            let c = self.lexer.peek();
            if is_path_char(c) {
                self.path_buf.push(c);
                self.lexer.next();
                continue;
            }
            match c {
                '\0' => return self.lexer.parse_error("unexpected EOF"),
                '$' => {
                    self.lexer.next();
                    match self.read_escape()? {
                        EvalPart::Literal(l) => self.path_buf.push_str(l),
                        EvalPart::VarRef(v) => {
                            if let Some(v) = self.vars.get(v) {
                                self.path_buf.push_str(v);
                            }
                        }
                    }
                }
                ':' | '|' | ' ' | '\t' | '\n' | '\r' => break,
                c => return self.lexer.parse_error(format!("unexpected character {:?}", c)),
            }
        }
        if self.path_buf.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.path_buf.clone()))
    }

    /// Read what follows a `$`.
    fn read_escape(&mut self) -> ParseResult<EvalPart<&'text str>> {
        Ok(match self.lexer.peek() {
            '\n' => {
                self.lexer.next();
                self.lexer.skip_spaces();
                EvalPart::Literal(self.lexer.slice(0, 0))
            }
            ' ' | '$' | ':' => {
                self.lexer.next();
                EvalPart::Literal(self.lexer.slice(self.lexer.ofs - 1, self.lexer.ofs))
            }
            '{' => {
                self.lexer.next();
                let start = self.lexer.ofs;
                loop {
                    match self.lexer.read() {
                        '\0' => return self.lexer.parse_error("unexpected EOF"),
                        '}' => break,
                        _ => {}
                    }
                }
                let end = self.lexer.ofs - 1;
                EvalPart::VarRef(self.lexer.slice(start, end))
            }
            _ => {
                let start = self.lexer.ofs;
                while is_varname_char(self.lexer.peek()) {
                    self.lexer.next();
                }
                if self.lexer.ofs == start {
                    return self.lexer.parse_error("bad $-escape (literal $ must be written as $$)");
                }
                EvalPart::VarRef(self.lexer.slice(start, self.lexer.ofs))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(text: &str) -> Vec<String> {
        let text = format!("{}\0", text);
        let mut parser = Parser::new(&text);
        let mut stmts = Vec::new();
        loop {
            match parser.read() {
                Ok(None) => break,
                Ok(Some(stmt)) => stmts.push(format!("{:?}", stmt)),
                Err(err) => panic!("{}", parser.format_parse_error(Path::new("test"), err)),
            }
        }
        stmts
    }

    fn must_read<'a>(parser: &mut Parser<'a>) -> Statement<'a> {
        match parser.read() {
            Ok(Some(stmt)) => stmt,
            Ok(None) => panic!("unexpected end"),
            Err(err) => panic!("{}", parser.format_parse_error(Path::new("test"), err)),
        }
    }

    #[test]
    fn parse_defaults() {
        let text = "var = 3\ndefault a b$var c\n\0";
        let mut parser = Parser::new(text);
        let default = match must_read(&mut parser) {
            Statement::Default(d) => d,
            s => panic!("expected default, got {:?}", s),
        };
        assert_eq!(default, vec!["a", "b3", "c"]);
    }

    #[test]
    fn parse_build() {
        let text = "dir = src
build out/foo.o: cc $dir/foo.c | config.h || gen
  side_effect = build.log
  precious = 1
\0";
        let mut parser = Parser::new(text);
        let build = match must_read(&mut parser) {
            Statement::Build(b) => b,
            s => panic!("expected build, got {:?}", s),
        };
        assert_eq!(build.rule, "cc");
        assert_eq!(build.line, 2);
        assert_eq!(build.out, "out/foo.o");
        assert_eq!(build.ins, vec!["src/foo.c"]);
        assert_eq!(build.implicit, vec!["config.h"]);
        assert_eq!(build.order_only, vec!["gen"]);
        let side_effect = build.vars.get("side_effect").map(|v| v.evaluate(&[]));
        assert_eq!(side_effect.as_deref(), Some("build.log"));
        assert!(parser.read().unwrap().is_none());
    }

    #[test]
    fn order_only_without_implicit() {
        let text = "build out: cc in || dir\n\0";
        let mut parser = Parser::new(text);
        match must_read(&mut parser) {
            Statement::Build(b) => {
                assert!(b.implicit.is_empty());
                assert_eq!(b.order_only, vec!["dir"]);
            }
            s => panic!("expected build, got {:?}", s),
        }
    }

    #[test]
    fn parse_rule_keeps_references_lazy() {
        let text = "rule cc
  command = cc $cflags -c $in -o ${out}
  # comment inside a rule

\0";
        let mut parser = Parser::new(text);
        let rule = match must_read(&mut parser) {
            Statement::Rule(r) => r,
            s => panic!("expected rule, got {:?}", s),
        };
        assert_eq!(rule.name, "cc");
        let command = rule.vars.get("command").unwrap();
        assert_eq!(
            *command,
            EvalString::new(vec![
                EvalPart::Literal("cc ".to_string()),
                EvalPart::VarRef("cflags".to_string()),
                EvalPart::Literal(" -c ".to_string()),
                EvalPart::VarRef("in".to_string()),
                EvalPart::Literal(" -o ".to_string()),
                EvalPart::VarRef("out".to_string()),
            ])
        );
    }

    #[test]
    fn parse_alias_directory_scan() {
        let stmts = read_all(
            "directory gen include
alias all: foo.o bar.o
scan .c = include
scan .h .inc = include
",
        );
        assert_eq!(stmts.len(), 4);
        assert!(stmts[0].starts_with("Directory([\"gen\", \"include\"])"));
        assert!(stmts[1].contains("name: \"all\""));
        assert!(stmts[1].contains("ins: [\"foo.o\", \"bar.o\"]"));
        assert!(stmts[2].contains("suffix: \".c\", nested: None, scanner: \"include\""));
        assert!(stmts[3].contains("suffix: \".h\", nested: Some(\".inc\")"));
    }

    #[test]
    fn escapes() {
        let text = "x = a$$b$ c$:d
default $x.d
\0";
        let mut parser = Parser::new(text);
        let default = match must_read(&mut parser) {
            Statement::Default(d) => d,
            s => panic!("expected default, got {:?}", s),
        };
        assert_eq!(default, vec!["a$b c:d.d"]);
    }

    #[test]
    fn crlf_lines() {
        let stmts = read_all("v = 1\r\ndefault a$v\r\n");
        assert_eq!(stmts, vec!["Default([\"a1\"])"]);
    }

    #[test]
    fn two_outputs_is_an_error() {
        let text = "build a b: cc in\n\0";
        let mut parser = Parser::new(text);
        let err = parser.read().unwrap_err();
        let msg = parser.format_parse_error(Path::new("build.keel"), err);
        assert!(msg.contains("exactly one output"), "{}", msg);
        assert!(msg.contains("build.keel:1:"), "{}", msg);
    }
}
