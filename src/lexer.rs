//! Walks an input string (a manifest or depfile) character by character.

use std::path::Path;

#[derive(Debug)]
pub struct ParseError {
    msg: String,
    ofs: usize,
}
pub type ParseResult<T> = Result<T, ParseError>;

/// A cursor over nul-terminated text.  The trailing nul stands in for
/// end-of-input so callers never need bounds checks.
pub struct Lexer<'a> {
    buf: &'a str,
    pub ofs: usize,
    pub line: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(buf: &'a str) -> Self {
        if !buf.ends_with('\0') {
            panic!("Lexer requires nul-terminated buf");
        }
        Lexer {
            buf,
            ofs: 0,
            line: 1,
        }
    }

    /// Text between two offsets.  Callers only split at ASCII delimiters,
    /// which are always char boundaries.
    pub fn slice(&self, start: usize, end: usize) -> &'a str {
        &self.buf[start..end]
    }
    pub fn peek(&self) -> char {
        self.buf.as_bytes()[self.ofs] as char
    }
    pub fn peek_newline(&self) -> bool {
        if self.peek() == '\n' {
            return true;
        }
        if self.ofs + 1 >= self.buf.len() {
            return false;
        }
        self.peek() == '\r' && self.buf.as_bytes()[self.ofs + 1] == b'\n'
    }
    pub fn next(&mut self) {
        if self.peek() == '\n' {
            self.line += 1;
        }
        if self.ofs == self.buf.len() - 1 {
            panic!("lexed past end")
        }
        self.ofs += 1;
    }
    pub fn back(&mut self) {
        if self.ofs == 0 {
            panic!("back at start")
        }
        self.ofs -= 1;
        if self.peek() == '\n' {
            self.line -= 1;
        }
    }
    pub fn read(&mut self) -> char {
        let c = self.peek();
        if c != '\0' {
            self.next();
        }
        c
    }
    pub fn skip(&mut self, ch: char) -> bool {
        if self.peek() == ch {
            self.next();
            return true;
        }
        false
    }

    pub fn skip_spaces(&mut self) {
        while self.skip(' ') || self.skip('\t') {}
    }

    pub fn expect(&mut self, ch: char) -> ParseResult<()> {
        if self.peek() != ch {
            return self.parse_error(format!("expected {:?}, got {:?}", ch, self.peek()));
        }
        self.next();
        Ok(())
    }

    pub fn parse_error<T, S: Into<String>>(&self, msg: S) -> ParseResult<T> {
        Err(ParseError {
            msg: msg.into(),
            ofs: self.ofs,
        })
    }

    pub fn format_parse_error(&self, filename: &Path, err: ParseError) -> String {
        let mut ofs = 0;
        let text = &self.buf[..self.buf.len() - 1];
        for (line_number, line) in text.split('\n').enumerate() {
            if ofs + line.len() >= err.ofs {
                let mut msg = "parse error: ".to_string();
                msg.push_str(&err.msg);
                msg.push('\n');

                let prefix = format!("{}:{}: ", filename.display(), line_number + 1);
                msg.push_str(&prefix);

                let col = err.ofs - ofs;
                let mut context: String = line.chars().take(60).collect();
                if context.len() < line.len() {
                    context.push_str("...");
                }
                msg.push_str(&context);
                msg.push('\n');

                msg.push_str(&" ".repeat(prefix.len() + col.min(60)));
                msg.push_str("^\n");
                return msg;
            }
            ofs += line.len() + 1;
        }
        format!("parse error: {}\n{}: at end of file\n", err.msg, filename.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_points_at_column() {
        let mut lexer = Lexer::new("first\nsecond line\0");
        while lexer.peek() != 'l' {
            lexer.next();
        }
        assert_eq!(lexer.line, 2);
        let err = lexer.parse_error::<(), _>("bad").unwrap_err();
        let msg = lexer.format_parse_error(Path::new("build.keel"), err);
        assert_eq!(
            msg,
            format!(
                "parse error: bad\nbuild.keel:2: second line\n{}^\n",
                " ".repeat("build.keel:2: ".len() + 7)
            )
        );
    }

    #[test]
    fn read_stops_at_nul() {
        let mut lexer = Lexer::new("a\0");
        assert_eq!(lexer.read(), 'a');
        assert_eq!(lexer.read(), '\0');
        assert_eq!(lexer.read(), '\0');
    }
}
