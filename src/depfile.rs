//! Parsing of Makefile-syntax depfiles written by actions, listing the
//! inputs they read.

use crate::lexer::{Lexer, ParseResult};
use std::path::Path;

/// Skip spaces and backslashed newlines.
fn skip_spaces(lexer: &mut Lexer) {
    loop {
        match lexer.peek() {
            ' ' | '\t' => lexer.next(),
            '\\' => {
                lexer.next();
                match lexer.peek() {
                    '\n' => lexer.next(),
                    '\r' if lexer.peek_newline() => {
                        lexer.next();
                        lexer.next();
                    }
                    _ => {
                        lexer.back();
                        return;
                    }
                }
            }
            _ => return,
        }
    }
}

fn read_path<'a>(lexer: &mut Lexer<'a>) -> Option<&'a str> {
    skip_spaces(lexer);
    let start = lexer.ofs;
    loop {
        match lexer.peek() {
            '\0' | ' ' | '\t' | '\n' | '\r' => break,
            ':' => {
                // A colon ends the path unless it follows a drive letter.
                if lexer.ofs != start + 1 {
                    break;
                }
                lexer.next();
                if !matches!(lexer.peek(), '/' | '\\') {
                    lexer.back();
                    break;
                }
            }
            '\\' => {
                lexer.next();
                if matches!(lexer.peek(), '\n' | '\r') {
                    lexer.back();
                    break;
                }
            }
            _ => lexer.next(),
        }
    }
    let end = lexer.ofs;
    if end == start {
        return None;
    }
    Some(lexer.slice(start, end))
}

/// Parse a depfile, returning the inputs of all its rules in order.
/// Target names are not checked: an action reports inputs for the node
/// that asked for the depfile.
pub fn parse<'a>(lexer: &mut Lexer<'a>) -> ParseResult<Vec<&'a str>> {
    let mut deps = Vec::new();
    loop {
        while matches!(lexer.peek(), '\n' | '\r') {
            lexer.next();
        }
        skip_spaces(lexer);
        if lexer.peek() == '\0' {
            break;
        }
        if matches!(lexer.peek(), '\n' | '\r') {
            continue;
        }
        if read_path(lexer).is_none() {
            return lexer.parse_error("expected file");
        }
        lexer.expect(':')?;
        while let Some(path) = read_path(lexer) {
            if !deps.contains(&path) {
                deps.push(path);
            }
        }
        skip_spaces(lexer);
        match lexer.peek() {
            '\n' | '\r' | '\0' => {}
            c => return lexer.parse_error(format!("unexpected {:?}", c)),
        }
    }
    Ok(deps)
}

/// Read and parse the depfile at `path`.
pub fn read(path: &Path) -> anyhow::Result<Vec<String>> {
    let mut text = std::fs::read_to_string(path)
        .map_err(|err| anyhow::anyhow!("read depfile {}: {}", path.display(), err))?;
    text.push('\0');
    let mut lexer = Lexer::new(&text);
    match parse(&mut lexer) {
        Ok(deps) => Ok(deps.into_iter().map(str::to_string).collect()),
        Err(err) => anyhow::bail!(lexer.format_parse_error(path, err)),
    }
}
