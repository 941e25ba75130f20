//! Tokenizer for the script language.
//!
//! Newlines are significant and come out as [`TokenKind::Line`] (runs of
//! them collapse into one). A string containing `%(` is split: the text
//! before each interpolation is an [`TokenKind::Interpolation`] token, the
//! embedded expression is lexed normally, and the final piece is a plain
//! [`TokenKind::String`].
use super::parser::CompileError;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    LeftBrace,
    RightBrace,
    Colon,
    Dot,
    DotDot,
    DotDotDot,
    Comma,
    Star,
    Slash,
    Percent,
    Plus,
    Minus,
    LtLt,
    GtGt,
    Pipe,
    PipePipe,
    Caret,
    Amp,
    AmpAmp,
    Bang,
    Tilde,
    Question,
    Eq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    EqEq,
    BangEq,

    As,
    Break,
    Class,
    Construct,
    Continue,
    Else,
    False,
    For,
    Foreign,
    If,
    Import,
    In,
    Is,
    Null,
    Return,
    Static,
    Super,
    This,
    True,
    Var,
    While,

    Name(String),
    /// `_name`
    Field(String),
    /// `__name`
    StaticField(String),
    Number(f64),
    String(Vec<u8>),
    Interpolation(Vec<u8>),

    Line,
    Eof,
}

impl TokenKind {
    /// The operator a binary or unary method is named after, if any.
    pub fn operator(&self) -> Option<&'static str> {
        Some(match self {
            Self::Star => "*",
            Self::Slash => "/",
            Self::Percent => "%",
            Self::Plus => "+",
            Self::Minus => "-",
            Self::LtLt => "<<",
            Self::GtGt => ">>",
            Self::Pipe => "|",
            Self::Caret => "^",
            Self::Amp => "&",
            Self::Bang => "!",
            Self::Tilde => "~",
            Self::Lt => "<",
            Self::Gt => ">",
            Self::LtEq => "<=",
            Self::GtEq => ">=",
            Self::EqEq => "==",
            Self::BangEq => "!=",
            Self::DotDot => "..",
            Self::DotDotDot => "...",
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    /// Source text of the token, used in error messages.
    pub lexeme: String,
}

fn keyword(name: &str) -> Option<TokenKind> {
    Some(match name {
        "as" => TokenKind::As,
        "break" => TokenKind::Break,
        "class" => TokenKind::Class,
        "construct" => TokenKind::Construct,
        "continue" => TokenKind::Continue,
        "else" => TokenKind::Else,
        "false" => TokenKind::False,
        "for" => TokenKind::For,
        "foreign" => TokenKind::Foreign,
        "if" => TokenKind::If,
        "import" => TokenKind::Import,
        "in" => TokenKind::In,
        "is" => TokenKind::Is,
        "null" => TokenKind::Null,
        "return" => TokenKind::Return,
        "static" => TokenKind::Static,
        "super" => TokenKind::Super,
        "this" => TokenKind::This,
        "true" => TokenKind::True,
        "var" => TokenKind::Var,
        "while" => TokenKind::While,
        _ => return None,
    })
}

struct Lexer<'src> {
    src: &'src [u8],
    pos: usize,
    start: usize,
    line: usize,
    /// Open-paren depth of every interpolation we are inside of.
    interpolations: Vec<usize>,
    tokens: Vec<Token>,
}

pub fn tokenize(source: &str) -> Result<Vec<Token>, CompileError> {
    let mut lexer = Lexer {
        src: source.as_bytes(),
        pos: 0,
        start: 0,
        line: 1,
        interpolations: Vec::new(),
        tokens: Vec::new(),
    };
    lexer.run()?;
    Ok(lexer.tokens)
}

impl Lexer<'_> {
    fn peek(&self) -> u8 {
        self.src.get(self.pos).copied().unwrap_or(0)
    }

    fn peek_next(&self) -> u8 {
        self.src.get(self.pos + 1).copied().unwrap_or(0)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn advance(&mut self) -> u8 {
        let c = self.peek();
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
        }
        c
    }

    fn eat(&mut self, c: u8) -> bool {
        if !self.at_end() && self.peek() == c {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error(&self, message: &str) -> CompileError {
        CompileError::new(self.line, format!("Error: {message}"))
    }

    fn push(&mut self, kind: TokenKind) {
        self.push_at(kind, self.line);
    }

    fn push_at(&mut self, kind: TokenKind, line: usize) {
        let lexeme = String::from_utf8_lossy(&self.src[self.start..self.pos]).into_owned();
        self.tokens.push(Token { kind, line, lexeme });
    }

    fn run(&mut self) -> Result<(), CompileError> {
        loop {
            self.skip_blanks()?;
            self.start = self.pos;
            if self.at_end() {
                break;
            }
            let line = self.line;
            let c = self.advance();
            let kind = match c {
                b'\n' => {
                    if !matches!(self.tokens.last(), Some(Token { kind: TokenKind::Line, .. }) | None) {
                        self.push_at(TokenKind::Line, line);
                    }
                    continue;
                }
                b'(' => {
                    if let Some(depth) = self.interpolations.last_mut() {
                        *depth += 1;
                    }
                    TokenKind::LeftParen
                }
                b')' => {
                    if let Some(depth) = self.interpolations.last_mut() {
                        *depth -= 1;
                        if *depth == 0 {
                            self.interpolations.pop();
                            self.string()?;
                            continue;
                        }
                    }
                    TokenKind::RightParen
                }
                b'[' => TokenKind::LeftBracket,
                b']' => TokenKind::RightBracket,
                b'{' => TokenKind::LeftBrace,
                b'}' => TokenKind::RightBrace,
                b':' => TokenKind::Colon,
                b',' => TokenKind::Comma,
                b'*' => TokenKind::Star,
                b'/' => TokenKind::Slash,
                b'%' => TokenKind::Percent,
                b'+' => TokenKind::Plus,
                b'-' => TokenKind::Minus,
                b'^' => TokenKind::Caret,
                b'~' => TokenKind::Tilde,
                b'?' => TokenKind::Question,
                b'.' => {
                    if self.eat(b'.') {
                        if self.eat(b'.') {
                            TokenKind::DotDotDot
                        } else {
                            TokenKind::DotDot
                        }
                    } else {
                        TokenKind::Dot
                    }
                }
                b'|' if self.eat(b'|') => TokenKind::PipePipe,
                b'|' => TokenKind::Pipe,
                b'&' if self.eat(b'&') => TokenKind::AmpAmp,
                b'&' => TokenKind::Amp,
                b'!' if self.eat(b'=') => TokenKind::BangEq,
                b'!' => TokenKind::Bang,
                b'=' if self.eat(b'=') => TokenKind::EqEq,
                b'=' => TokenKind::Eq,
                b'<' if self.eat(b'<') => TokenKind::LtLt,
                b'<' if self.eat(b'=') => TokenKind::LtEq,
                b'<' => TokenKind::Lt,
                b'>' if self.eat(b'>') => TokenKind::GtGt,
                b'>' if self.eat(b'=') => TokenKind::GtEq,
                b'>' => TokenKind::Gt,
                b'"' => {
                    self.string()?;
                    continue;
                }
                b'0'..=b'9' => self.number()?,
                c if c == b'_' || c.is_ascii_alphabetic() => self.name(),
                _ => {
                    return Err(self.error(&format!(
                        "Invalid character '{}'.",
                        String::from_utf8_lossy(&self.src[self.start..self.pos])
                    )));
                }
            };
            self.push(kind);
        }
        if !self.interpolations.is_empty() {
            return Err(self.error("Unterminated interpolation."));
        }
        self.start = self.pos;
        if !matches!(self.tokens.last(), Some(Token { kind: TokenKind::Line, .. })) {
            self.push(TokenKind::Line);
        }
        self.push(TokenKind::Eof);
        Ok(())
    }

    fn skip_blanks(&mut self) -> Result<(), CompileError> {
        loop {
            match self.peek() {
                b' ' | b'\t' | b'\r' if !self.at_end() => {
                    self.advance();
                }
                b'/' if self.peek_next() == b'/' => {
                    while !self.at_end() && self.peek() != b'\n' {
                        self.advance();
                    }
                }
                b'/' if self.peek_next() == b'*' => self.block_comment()?,
                // shebang on the first line
                b'#' if self.pos == 0 && self.peek_next() == b'!' => {
                    while !self.at_end() && self.peek() != b'\n' {
                        self.advance();
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn block_comment(&mut self) -> Result<(), CompileError> {
        self.pos += 2;
        let mut depth = 1;
        while depth > 0 {
            if self.at_end() {
                return Err(self.error("Unterminated block comment."));
            }
            if self.peek() == b'/' && self.peek_next() == b'*' {
                self.pos += 2;
                depth += 1;
            } else if self.peek() == b'*' && self.peek_next() == b'/' {
                self.pos += 2;
                depth -= 1;
            } else {
                self.advance();
            }
        }
        Ok(())
    }

    fn name(&mut self) -> TokenKind {
        while self.peek() == b'_' || self.peek().is_ascii_alphanumeric() {
            self.advance();
        }
        let text = String::from_utf8_lossy(&self.src[self.start..self.pos]).into_owned();
        if let Some(kind) = keyword(&text) {
            return kind;
        }
        if let Some(rest) = text.strip_prefix("__") {
            TokenKind::StaticField(rest.to_owned())
        } else if let Some(rest) = text.strip_prefix('_') {
            TokenKind::Field(rest.to_owned())
        } else {
            TokenKind::Name(text)
        }
    }

    fn number(&mut self) -> Result<TokenKind, CompileError> {
        if self.src[self.start] == b'0' && matches!(self.peek(), b'x' | b'X') {
            self.advance();
            let digits = self.pos;
            while self.peek().is_ascii_hexdigit() {
                self.advance();
            }
            let text = std::str::from_utf8(&self.src[digits..self.pos]).unwrap_or_default();
            return u64::from_str_radix(text, 16)
                .map(|n| TokenKind::Number(n as f64))
                .map_err(|_| self.error("Invalid number literal."));
        }
        while self.peek().is_ascii_digit() {
            self.advance();
        }
        if self.peek() == b'.' && self.peek_next().is_ascii_digit() {
            self.advance();
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }
        if matches!(self.peek(), b'e' | b'E') {
            self.advance();
            if matches!(self.peek(), b'+' | b'-') {
                self.advance();
            }
            if !self.peek().is_ascii_digit() {
                return Err(self.error("Unterminated scientific notation."));
            }
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }
        std::str::from_utf8(&self.src[self.start..self.pos])
            .ok()
            .and_then(|text| text.parse().ok())
            .map(TokenKind::Number)
            .ok_or_else(|| self.error("Invalid number literal."))
    }

    fn hex_escape(&mut self, digits: usize) -> Result<u32, CompileError> {
        let mut value = 0u32;
        for _ in 0..digits {
            let c = self.advance();
            let digit = (c as char)
                .to_digit(16)
                .ok_or_else(|| self.error("Incomplete escape sequence."))?;
            value = value * 16 + digit;
        }
        Ok(value)
    }

    /// Lexes string text up to the closing quote or the next `%(`.
    fn string(&mut self) -> Result<(), CompileError> {
        let line = self.line;
        let mut bytes = Vec::new();
        loop {
            if self.at_end() {
                return Err(self.error("Unterminated string."));
            }
            match self.advance() {
                b'"' => break,
                b'%' if self.peek() == b'(' => {
                    self.advance();
                    self.interpolations.push(1);
                    self.push_at(TokenKind::Interpolation(bytes), line);
                    return Ok(());
                }
                b'\\' => match self.advance() {
                    b'"' => bytes.push(b'"'),
                    b'\\' => bytes.push(b'\\'),
                    b'%' => bytes.push(b'%'),
                    b'0' => bytes.push(0),
                    b'a' => bytes.push(0x07),
                    b'b' => bytes.push(0x08),
                    b'e' => bytes.push(0x1b),
                    b'f' => bytes.push(0x0c),
                    b'n' => bytes.push(b'\n'),
                    b'r' => bytes.push(b'\r'),
                    b't' => bytes.push(b'\t'),
                    b'v' => bytes.push(0x0b),
                    b'x' => bytes.push(self.hex_escape(2)? as u8),
                    b'u' => self.push_code_point(&mut bytes, 4)?,
                    b'U' => self.push_code_point(&mut bytes, 8)?,
                    other => {
                        return Err(self.error(&format!(
                            "Invalid escape character '{}'.",
                            other as char
                        )));
                    }
                },
                c => bytes.push(c),
            }
        }
        self.push_at(TokenKind::String(bytes), line);
        Ok(())
    }

    fn push_code_point(&mut self, bytes: &mut Vec<u8>, digits: usize) -> Result<(), CompileError> {
        let value = self.hex_escape(digits)?;
        let c = char::from_u32(value).ok_or_else(|| self.error("Invalid Unicode escape."))?;
        let mut buf = [0; 4];
        bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source)
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn operators_and_names() {
        assert_eq!(
            kinds("a.b(_c, __d) <= 1..2"),
            vec![
                TokenKind::Name("a".into()),
                TokenKind::Dot,
                TokenKind::Name("b".into()),
                TokenKind::LeftParen,
                TokenKind::Field("c".into()),
                TokenKind::Comma,
                TokenKind::StaticField("d".into()),
                TokenKind::RightParen,
                TokenKind::LtEq,
                TokenKind::Number(1.0),
                TokenKind::DotDot,
                TokenKind::Number(2.0),
                TokenKind::Line,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn newlines_collapse_and_comments_vanish() {
        assert_eq!(
            kinds("1 // one\n\n/* two /* nested */ */\n2"),
            vec![
                TokenKind::Number(1.0),
                TokenKind::Line,
                TokenKind::Number(2.0),
                TokenKind::Line,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn interpolation_splits_the_string() {
        assert_eq!(
            kinds("\"a %(f(1)) b\""),
            vec![
                TokenKind::Interpolation(b"a ".to_vec()),
                TokenKind::Name("f".into()),
                TokenKind::LeftParen,
                TokenKind::Number(1.0),
                TokenKind::RightParen,
                TokenKind::String(b" b".to_vec()),
                TokenKind::Line,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn escapes_keep_embedded_zeros() {
        assert_eq!(
            kinds(r#""a\0b\x41é""#)[0],
            TokenKind::String(vec![b'a', 0, b'b', b'A', 0xc3, 0xa9])
        );
    }

    #[test]
    fn numbers() {
        assert_eq!(kinds("0xff")[0], TokenKind::Number(255.0));
        assert_eq!(kinds("1.5e3")[0], TokenKind::Number(1500.0));
        // a method call on an integer, not a fraction
        assert_eq!(kinds("1.abs")[1], TokenKind::Dot);
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let err = tokenize("\"oops").unwrap_err();
        assert_eq!(err.message, "Error: Unterminated string.");
        assert_eq!(err.line, 1);
    }
}
