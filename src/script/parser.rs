use super::ast::{Expr, ExprKind, Position, Program};
use super::error::SyntaxError;

/// Deepest list nesting a module may use. Evaluation recurses once per level,
/// so this also bounds the evaluator's native stack per call.
pub const MAX_NESTING_DEPTH: usize = 128;

/// Parse module source text into a [`Program`] named after its locator.
pub fn parse_program(name: &str, source: &str) -> Result<Program, SyntaxError> {
    let mut parser = Parser::new(name, source);
    let mut forms = Vec::new();
    loop {
        parser.skip_ws();
        if parser.eof() {
            break;
        }
        if parser.current() == Some(b')') {
            return Err(parser.error("unexpected ')'"));
        }
        forms.push(parser.parse_expr()?);
    }
    Ok(Program::new(name, source, forms))
}

struct Parser<'a> {
    name: &'a str,
    src: &'a str,
    bytes: &'a [u8],
    index: usize,
    line: u32,
    line_start: usize,
    depth: usize,
}

type ParseResult<T> = std::result::Result<T, SyntaxError>;

impl<'a> Parser<'a> {
    fn new(name: &'a str, src: &'a str) -> Self {
        Self {
            name,
            src,
            bytes: src.as_bytes(),
            index: 0,
            line: 1,
            line_start: 0,
            depth: 0,
        }
    }

    fn eof(&self) -> bool {
        self.index >= self.bytes.len()
    }

    fn current(&self) -> Option<u8> {
        self.bytes.get(self.index).copied()
    }

    fn position(&self) -> Position {
        Position::new(self.line, (self.index - self.line_start + 1) as u32)
    }

    fn advance(&mut self) {
        if let Some(ch) = self.current() {
            self.index += 1;
            if ch == b'\n' {
                self.line += 1;
                self.line_start = self.index;
            }
        }
    }

    fn skip_ws(&mut self) {
        loop {
            while let Some(ch) = self.current() {
                if ch.is_ascii_whitespace() {
                    self.advance();
                } else {
                    break;
                }
            }
            if matches!(self.current(), Some(b';') | Some(b'#')) {
                while let Some(ch) = self.current() {
                    self.advance();
                    if ch == b'\n' {
                        break;
                    }
                }
                continue;
            }
            break;
        }
    }

    fn parse_expr(&mut self) -> ParseResult<Expr> {
        self.skip_ws();
        let pos = self.position();
        let kind = match self.current() {
            None => return Err(self.error("unexpected end of input")),
            Some(b'(') => self.parse_list()?,
            Some(b'"') => self.parse_string()?,
            Some(b':') => self.parse_keyword()?,
            Some(b'-' | b'+' | b'0'..=b'9') => self.parse_number_or_symbol()?,
            Some(_) => self.parse_symbol_or_bool()?,
        };
        Ok(Expr::new(kind, pos))
    }

    fn parse_list(&mut self) -> ParseResult<ExprKind> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(self.error(&format!(
                "expression nesting exceeds {} levels",
                MAX_NESTING_DEPTH
            )));
        }
        // consume '('
        self.advance();
        self.depth += 1;
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.eof() {
                return Err(self.error("unterminated list"));
            }
            if self.current() == Some(b')') {
                self.advance();
                break;
            }
            items.push(self.parse_expr()?);
        }
        self.depth -= 1;
        Ok(ExprKind::List(items))
    }

    fn parse_string(&mut self) -> ParseResult<ExprKind> {
        // consume opening quote
        self.advance();
        let mut buf = Vec::new();
        while let Some(ch) = self.current() {
            self.advance();
            match ch {
                b'"' => {
                    return String::from_utf8(buf)
                        .map(ExprKind::String)
                        .map_err(|_| self.error("string literal is not valid UTF-8"));
                }
                b'\\' => {
                    let escaped = self
                        .current()
                        .ok_or_else(|| self.error("incomplete escape"))?;
                    self.advance();
                    let value = match escaped {
                        b'"' => b'"',
                        b'\\' => b'\\',
                        b'n' => b'\n',
                        b'r' => b'\r',
                        b't' => b'\t',
                        other => {
                            return Err(self.error(&format!("unknown escape: \\{}", other as char)));
                        }
                    };
                    buf.push(value);
                }
                _ => buf.push(ch),
            }
        }
        Err(self.error("unterminated string literal"))
    }

    fn parse_keyword(&mut self) -> ParseResult<ExprKind> {
        self.advance(); // consume ':'
        let start = self.index;
        while let Some(ch) = self.current() {
            if is_symbol_char(ch) {
                self.advance();
            } else {
                break;
            }
        }
        if start == self.index {
            return Err(self.error("empty keyword"));
        }
        Ok(ExprKind::Keyword(self.src[start..self.index].to_string()))
    }

    fn parse_number_or_symbol(&mut self) -> ParseResult<ExprKind> {
        let start = self.index;
        if self.current() == Some(b'-') || self.current() == Some(b'+') {
            self.advance();
        }
        let mut has_digit = false;
        while let Some(ch) = self.current() {
            if ch.is_ascii_digit() {
                has_digit = true;
                self.advance();
            } else {
                break;
            }
        }

        let mut is_float = false;
        if self.current() == Some(b'.') && self.peek_char().is_some_and(|c| c.is_ascii_digit()) {
            is_float = true;
            self.advance();
            while let Some(ch) = self.current() {
                if ch.is_ascii_digit() {
                    self.advance();
                } else {
                    break;
                }
            }
        }

        // `-` and `+` on their own, or followed by letters, are symbols.
        if !has_digit || self.current().is_some_and(is_symbol_char) {
            self.index = start;
            return self.parse_symbol_or_bool();
        }

        let text = &self.src[start..self.index];
        if is_float {
            text.parse::<f64>()
                .map(ExprKind::Float)
                .map_err(|_| self.error("invalid float literal"))
        } else {
            text.parse::<i64>()
                .map(ExprKind::Integer)
                .map_err(|_| self.error("invalid integer literal"))
        }
    }

    fn parse_symbol_or_bool(&mut self) -> ParseResult<ExprKind> {
        let start = self.index;
        while let Some(ch) = self.current() {
            if is_symbol_char(ch) {
                self.advance();
            } else {
                break;
            }
        }
        if start == self.index {
            return Err(self.error("unexpected character"));
        }
        let text = &self.src[start..self.index];
        if text.starts_with('.') || text.ends_with('.') || text.contains("..") {
            return Err(self.error(&format!("malformed attribute access '{}'", text)));
        }
        match text {
            "true" | "True" => Ok(ExprKind::Boolean(true)),
            "false" | "False" => Ok(ExprKind::Boolean(false)),
            _ => Ok(ExprKind::Symbol(text.to_string())),
        }
    }

    fn peek_char(&self) -> Option<u8> {
        self.bytes.get(self.index + 1).copied()
    }

    fn error(&self, message: &str) -> SyntaxError {
        SyntaxError {
            msg: message.to_string(),
            filename: self.name.to_string(),
            pos: self.position(),
        }
    }
}

fn is_symbol_char(ch: u8) -> bool {
    match ch {
        b'(' | b')' | b'"' | b';' | b'#' => false,
        c if c.is_ascii_whitespace() => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_function_definition() {
        let src = "(def run (plan)\n  (plan.print \"hello\"))";
        let program = parse_program("main.star", src).expect("parse");
        assert_eq!(program.forms.len(), 1);
        assert_eq!(program.forms[0].head_symbol(), Some("def"));
    }

    #[test]
    fn tracks_line_and_column() {
        let src = "; header\n(let x 1)\n  (let y \"two\")";
        let program = parse_program("main.star", src).expect("parse");
        assert_eq!(program.forms[0].pos, Position::new(2, 1));
        assert_eq!(program.forms[1].pos, Position::new(3, 3));
    }

    #[test]
    fn parses_numbers_strings_and_keywords() {
        let src = "(f :key 42 -7 1.5 \"text\" - True)";
        let program = parse_program("main.star", src).expect("parse");
        let items = program.forms[0].as_list().expect("list");
        assert_eq!(items[1].kind, ExprKind::Keyword("key".into()));
        assert_eq!(items[2].kind, ExprKind::Integer(42));
        assert_eq!(items[3].kind, ExprKind::Integer(-7));
        assert_eq!(items[4].kind, ExprKind::Float(1.5));
        assert_eq!(items[5].kind, ExprKind::String("text".into()));
        assert_eq!(items[6].kind, ExprKind::Symbol("-".into()));
        assert_eq!(items[7].kind, ExprKind::Boolean(true));
    }

    #[test]
    fn reports_unterminated_list_with_position() {
        let err = parse_program("main.star", "(def run (plan)\n").unwrap_err();
        assert_eq!(err.msg, "unterminated list");
        assert_eq!(err.filename, "main.star");
        assert_eq!(err.pos.line, 2);
    }

    #[test]
    fn rejects_excessive_nesting() {
        let depth = 200_000;
        let src = format!("{}1{}", "(do ".repeat(depth), ")".repeat(depth));
        let err = parse_program("main.star", &src).unwrap_err();
        assert_eq!(err.msg, format!("expression nesting exceeds {} levels", MAX_NESTING_DEPTH));

        let ok = format!("{}1{}", "(do ".repeat(MAX_NESTING_DEPTH), ")".repeat(MAX_NESTING_DEPTH));
        assert!(parse_program("main.star", &ok).is_ok());
    }

    #[test]
    fn rejects_stray_closing_paren() {
        let err = parse_program("main.star", "(let x 1))").unwrap_err();
        assert_eq!(err.msg, "unexpected ')'");
    }
}
