//! Lexer for condition expressions
//!
//! Produces the token stream consumed by the parser in
//! [`expression`](super::expression).

use super::expression::ExpressionError;

/// A token produced by the lexer
#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    /// The kind of token
    pub kind: TokenKind,
    /// Character offset in the input (0-based)
    pub pos: usize,
}

/// Token types
#[derive(Clone, Debug, PartialEq)]
pub enum TokenKind {
    // Literals
    Number(f64),
    Integer(i64),
    Str(String),
    True,
    False,
    Null,

    // Field lookups: `a.b.c` or `` `any key` ``
    Ident(String),

    // Keywords / logical operators
    And,
    Or,
    Not,
    In,

    // Arithmetic
    Plus,
    Minus,
    Star,
    Slash,
    Percent,

    // Comparison
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,

    // Structural
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,

    Eof,
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::Integer(n) => write!(f, "{}", n),
            Self::Str(s) => write!(f, "'{}'", s),
            Self::True => write!(f, "true"),
            Self::False => write!(f, "false"),
            Self::Null => write!(f, "null"),
            Self::Ident(name) => write!(f, "{}", name),
            Self::And => write!(f, "and"),
            Self::Or => write!(f, "or"),
            Self::Not => write!(f, "not"),
            Self::In => write!(f, "in"),
            Self::Plus => write!(f, "+"),
            Self::Minus => write!(f, "-"),
            Self::Star => write!(f, "*"),
            Self::Slash => write!(f, "/"),
            Self::Percent => write!(f, "%"),
            Self::EqEq => write!(f, "=="),
            Self::NotEq => write!(f, "!="),
            Self::Lt => write!(f, "<"),
            Self::Le => write!(f, "<="),
            Self::Gt => write!(f, ">"),
            Self::Ge => write!(f, ">="),
            Self::LParen => write!(f, "("),
            Self::RParen => write!(f, ")"),
            Self::LBracket => write!(f, "["),
            Self::RBracket => write!(f, "]"),
            Self::Comma => write!(f, ","),
            Self::Eof => write!(f, "end of input"),
        }
    }
}

/// Lexer for condition expressions
pub struct Lexer {
    input: Vec<char>,
    pos: usize,
}

impl Lexer {
    /// Create a new lexer from input text
    pub fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            pos: 0,
        }
    }

    /// Tokenize the entire input
    pub fn tokenize(&mut self) -> Result<Vec<Token>, ExpressionError> {
        let mut tokens = Vec::new();

        loop {
            self.skip_whitespace();

            if self.pos >= self.input.len() {
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    pos: self.pos,
                });
                break;
            }

            tokens.push(self.next_token()?);
        }

        Ok(tokens)
    }

    fn next_token(&mut self) -> Result<Token, ExpressionError> {
        let start = self.pos;
        let ch = self.input[self.pos];

        let kind = match ch {
            '(' => self.single(TokenKind::LParen),
            ')' => self.single(TokenKind::RParen),
            '[' => self.single(TokenKind::LBracket),
            ']' => self.single(TokenKind::RBracket),
            ',' => self.single(TokenKind::Comma),
            '+' => self.single(TokenKind::Plus),
            '-' => self.single(TokenKind::Minus),
            '*' => self.single(TokenKind::Star),
            '/' => self.single(TokenKind::Slash),
            '%' => self.single(TokenKind::Percent),
            '=' => {
                if self.peek_at(1) == Some('=') {
                    self.pos += 2;
                    TokenKind::EqEq
                } else {
                    return Err(self.error(start, "expected '==' (assignment is not supported)"));
                }
            }
            '!' => {
                if self.peek_at(1) == Some('=') {
                    self.pos += 2;
                    TokenKind::NotEq
                } else {
                    self.single(TokenKind::Not)
                }
            }
            '<' => {
                if self.peek_at(1) == Some('=') {
                    self.pos += 2;
                    TokenKind::Le
                } else {
                    self.single(TokenKind::Lt)
                }
            }
            '>' => {
                if self.peek_at(1) == Some('=') {
                    self.pos += 2;
                    TokenKind::Ge
                } else {
                    self.single(TokenKind::Gt)
                }
            }
            '&' => {
                if self.peek_at(1) == Some('&') {
                    self.pos += 2;
                    TokenKind::And
                } else {
                    return Err(self.error(start, "expected '&&'"));
                }
            }
            '|' => {
                if self.peek_at(1) == Some('|') {
                    self.pos += 2;
                    TokenKind::Or
                } else {
                    return Err(self.error(start, "expected '||'"));
                }
            }
            '"' | '\'' => self.read_string(ch)?,
            '`' => self.read_quoted_key()?,
            c if c.is_ascii_digit() => self.read_number()?,
            c if c.is_alphabetic() || c == '_' => self.read_word(),
            other => {
                return Err(self.error(start, &format!("unexpected character '{}'", other)));
            }
        };

        Ok(Token { kind, pos: start })
    }

    fn single(&mut self, kind: TokenKind) -> TokenKind {
        self.pos += 1;
        kind
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.input.get(self.pos + offset).copied()
    }

    fn skip_whitespace(&mut self) {
        while self.pos < self.input.len() && self.input[self.pos].is_whitespace() {
            self.pos += 1;
        }
    }

    fn read_string(&mut self, quote: char) -> Result<TokenKind, ExpressionError> {
        let start = self.pos;
        self.pos += 1;
        let mut value = String::new();

        while self.pos < self.input.len() {
            let ch = self.input[self.pos];
            if ch == quote {
                self.pos += 1;
                return Ok(TokenKind::Str(value));
            }
            if ch == '\\' {
                self.pos += 1;
                let escaped = self
                    .input
                    .get(self.pos)
                    .copied()
                    .ok_or_else(|| self.error(start, "unterminated escape sequence"))?;
                value.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    other => other,
                });
            } else {
                value.push(ch);
            }
            self.pos += 1;
        }

        Err(self.error(start, "unterminated string literal"))
    }

    fn read_quoted_key(&mut self) -> Result<TokenKind, ExpressionError> {
        let start = self.pos;
        self.pos += 1;
        let mut key = String::new();

        while self.pos < self.input.len() {
            let ch = self.input[self.pos];
            self.pos += 1;
            if ch == '`' {
                return Ok(TokenKind::Ident(key));
            }
            key.push(ch);
        }

        Err(self.error(start, "unterminated quoted key"))
    }

    fn read_number(&mut self) -> Result<TokenKind, ExpressionError> {
        let start = self.pos;
        let mut is_float = false;

        while self.pos < self.input.len() {
            let ch = self.input[self.pos];
            if ch.is_ascii_digit() {
                self.pos += 1;
            } else if ch == '.'
                && !is_float
                && self.peek_at(1).is_some_and(|c| c.is_ascii_digit())
            {
                is_float = true;
                self.pos += 1;
            } else {
                break;
            }
        }

        let text: String = self.input[start..self.pos].iter().collect();
        if is_float {
            text.parse::<f64>()
                .map(TokenKind::Number)
                .map_err(|_| self.error(start, &format!("invalid number '{}'", text)))
        } else {
            match text.parse::<i64>() {
                Ok(n) => Ok(TokenKind::Integer(n)),
                Err(_) => text
                    .parse::<f64>()
                    .map(TokenKind::Number)
                    .map_err(|_| self.error(start, &format!("invalid number '{}'", text))),
            }
        }
    }

    fn read_word(&mut self) -> TokenKind {
        let start = self.pos;
        while self.pos < self.input.len() {
            let ch = self.input[self.pos];
            if ch.is_alphanumeric() || ch == '_' || ch == '.' {
                self.pos += 1;
            } else {
                break;
            }
        }

        let word: String = self.input[start..self.pos].iter().collect();
        match word.as_str() {
            "and" => TokenKind::And,
            "or" => TokenKind::Or,
            "not" => TokenKind::Not,
            "in" => TokenKind::In,
            "true" | "True" => TokenKind::True,
            "false" | "False" => TokenKind::False,
            "null" | "None" => TokenKind::Null,
            _ => TokenKind::Ident(word),
        }
    }

    fn error(&self, pos: usize, message: &str) -> ExpressionError {
        ExpressionError::Lex {
            pos,
            message: message.to_string(),
        }
    }
}
