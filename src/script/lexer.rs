//! Tokenizer for command scripts.

use super::error::ParseError;

/// A lexical token.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),

    // Keywords
    Let,
    Fn,
    If,
    Else,
    While,
    For,
    In,
    Return,
    Break,
    Continue,
    Throw,
    True,
    False,
    Null,

    // Punctuation
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Colon,
    Semicolon,

    // Operators
    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    AndAnd,
    OrOr,

    Eof,
}

impl Token {
    /// Short description used in syntax errors.
    pub fn describe(&self) -> String {
        match self {
            Token::Int(n) => format!("number {n}"),
            Token::Float(n) => format!("number {n}"),
            Token::Str(_) => "string".to_string(),
            Token::Ident(name) => format!("'{name}'"),
            Token::Eof => "end of script".to_string(),
            other => format!("'{}'", other.symbol()),
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            Token::Let => "let",
            Token::Fn => "fn",
            Token::If => "if",
            Token::Else => "else",
            Token::While => "while",
            Token::For => "for",
            Token::In => "in",
            Token::Return => "return",
            Token::Break => "break",
            Token::Continue => "continue",
            Token::Throw => "throw",
            Token::True => "true",
            Token::False => "false",
            Token::Null => "null",
            Token::LParen => "(",
            Token::RParen => ")",
            Token::LBrace => "{",
            Token::RBrace => "}",
            Token::LBracket => "[",
            Token::RBracket => "]",
            Token::Comma => ",",
            Token::Dot => ".",
            Token::Colon => ":",
            Token::Semicolon => ";",
            Token::Assign => "=",
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Star => "*",
            Token::Slash => "/",
            Token::Percent => "%",
            Token::Bang => "!",
            Token::Eq => "==",
            Token::NotEq => "!=",
            Token::Lt => "<",
            Token::LtEq => "<=",
            Token::Gt => ">",
            Token::GtEq => ">=",
            Token::AndAnd => "&&",
            Token::OrOr => "||",
            Token::Int(_)
            | Token::Float(_)
            | Token::Str(_)
            | Token::Ident(_)
            | Token::Eof => "",
        }
    }
}

/// A token with the line it started on.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub line: u32,
}

/// Script tokenizer.
pub struct Lexer<'a> {
    input: &'a str,
    pos: usize,
    line: u32,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            input,
            pos: 0,
            line: 1,
        }
    }

    /// Tokenize the whole input. The last token is always [`Token::Eof`].
    pub fn tokenize(mut self) -> Result<Vec<Spanned>, ParseError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia();
            let line = self.line;
            let Some(c) = self.peek_char() else {
                tokens.push(Spanned {
                    token: Token::Eof,
                    line,
                });
                return Ok(tokens);
            };

            let token = if c.is_ascii_digit() {
                self.number()?
            } else if c == '"' {
                self.string()?
            } else if c == '_' || c.is_alphabetic() {
                self.word()
            } else {
                self.operator(c)?
            };
            tokens.push(Spanned { token, line });
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_second(&self) -> Option<char> {
        let mut chars = self.input[self.pos..].chars();
        chars.next();
        chars.next()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek_char()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    /// Skip whitespace and `//` comments.
    fn skip_trivia(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.advance();
            } else if c == '/' && self.peek_second() == Some('/') {
                while let Some(c) = self.peek_char() {
                    if c == '\n' {
                        break;
                    }
                    self.advance();
                }
            } else {
                break;
            }
        }
    }

    fn number(&mut self) -> Result<Token, ParseError> {
        let start = self.pos;
        while matches!(self.peek_char(), Some(c) if c.is_ascii_digit()) {
            self.advance();
        }

        let is_float = self.peek_char() == Some('.')
            && matches!(self.peek_second(), Some(c) if c.is_ascii_digit());
        if is_float {
            self.advance();
            while matches!(self.peek_char(), Some(c) if c.is_ascii_digit()) {
                self.advance();
            }
            let text = &self.input[start..self.pos];
            return text
                .parse::<f64>()
                .map(Token::Float)
                .map_err(|_| ParseError::new(self.line, format!("invalid number '{text}'")));
        }

        let text = &self.input[start..self.pos];
        text.parse::<i64>()
            .map(Token::Int)
            .map_err(|_| ParseError::new(self.line, format!("number '{text}' is too large")))
    }

    fn string(&mut self) -> Result<Token, ParseError> {
        let start_line = self.line;
        self.advance(); // opening quote

        let mut value = String::new();
        loop {
            match self.advance() {
                None => return Err(ParseError::new(start_line, "unterminated string")),
                Some('"') => return Ok(Token::Str(value)),
                Some('\\') => {
                    let escaped = match self.advance() {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('r') => '\r',
                        Some('"') => '"',
                        Some('\\') => '\\',
                        Some(other) => {
                            return Err(ParseError::new(
                                self.line,
                                format!("unknown escape sequence '\\{other}'"),
                            ))
                        }
                        None => return Err(ParseError::new(start_line, "unterminated string")),
                    };
                    value.push(escaped);
                }
                Some(c) => value.push(c),
            }
        }
    }

    fn word(&mut self) -> Token {
        let start = self.pos;
        while matches!(self.peek_char(), Some(c) if c == '_' || c.is_alphanumeric()) {
            self.advance();
        }

        match &self.input[start..self.pos] {
            "let" => Token::Let,
            "fn" => Token::Fn,
            "if" => Token::If,
            "else" => Token::Else,
            "while" => Token::While,
            "for" => Token::For,
            "in" => Token::In,
            "return" => Token::Return,
            "break" => Token::Break,
            "continue" => Token::Continue,
            "throw" => Token::Throw,
            "true" => Token::True,
            "false" => Token::False,
            "null" => Token::Null,
            ident => Token::Ident(ident.to_string()),
        }
    }

    fn operator(&mut self, c: char) -> Result<Token, ParseError> {
        let next = self.peek_second();
        let (token, width) = match (c, next) {
            ('=', Some('=')) => (Token::Eq, 2),
            ('!', Some('=')) => (Token::NotEq, 2),
            ('<', Some('=')) => (Token::LtEq, 2),
            ('>', Some('=')) => (Token::GtEq, 2),
            ('&', Some('&')) => (Token::AndAnd, 2),
            ('|', Some('|')) => (Token::OrOr, 2),
            ('=', _) => (Token::Assign, 1),
            ('!', _) => (Token::Bang, 1),
            ('<', _) => (Token::Lt, 1),
            ('>', _) => (Token::Gt, 1),
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            ('%', _) => (Token::Percent, 1),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('{', _) => (Token::LBrace, 1),
            ('}', _) => (Token::RBrace, 1),
            ('[', _) => (Token::LBracket, 1),
            (']', _) => (Token::RBracket, 1),
            (',', _) => (Token::Comma, 1),
            ('.', _) => (Token::Dot, 1),
            (':', _) => (Token::Colon, 1),
            (';', _) => (Token::Semicolon, 1),
            _ => {
                return Err(ParseError::new(
                    self.line,
                    format!("unexpected character '{c}'"),
                ))
            }
        };

        for _ in 0..width {
            self.advance();
        }
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(input: &str) -> Vec<Token> {
        Lexer::new(input)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|s| s.token)
            .collect()
    }

    #[test]
    fn test_let_statement() {
        assert_eq!(
            tokens("let x = 42;"),
            vec![
                Token::Let,
                Token::Ident("x".to_string()),
                Token::Assign,
                Token::Int(42),
                Token::Semicolon,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_two_char_operators() {
        assert_eq!(
            tokens("== != <= >= && || < >"),
            vec![
                Token::Eq,
                Token::NotEq,
                Token::LtEq,
                Token::GtEq,
                Token::AndAnd,
                Token::OrOr,
                Token::Lt,
                Token::Gt,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            tokens(r#""a\"b\n\\""#),
            vec![Token::Str("a\"b\n\\".to_string()), Token::Eof]
        );
    }

    #[test]
    fn test_float_and_member_access() {
        assert_eq!(
            tokens("1.5 a.b"),
            vec![
                Token::Float(1.5),
                Token::Ident("a".to_string()),
                Token::Dot,
                Token::Ident("b".to_string()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_comments_and_line_numbers() {
        let spanned = Lexer::new("// header\nlet a = 1;\n\nsay(a);")
            .tokenize()
            .unwrap();
        assert_eq!(spanned[0].token, Token::Let);
        assert_eq!(spanned[0].line, 2);
        let say = spanned
            .iter()
            .find(|s| s.token == Token::Ident("say".to_string()))
            .unwrap();
        assert_eq!(say.line, 4);
    }

    #[test]
    fn test_unicode_identifiers_and_strings() {
        assert_eq!(
            tokens("let ねこ = \"にゃー\";"),
            vec![
                Token::Let,
                Token::Ident("ねこ".to_string()),
                Token::Assign,
                Token::Str("にゃー".to_string()),
                Token::Semicolon,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_unterminated_string() {
        let err = Lexer::new("say(\"oops);").tokenize().unwrap_err();
        assert!(err.message.contains("unterminated string"));
        assert_eq!(err.line, 1);
    }

    #[test]
    fn test_unexpected_character() {
        let err = Lexer::new("let a = 1;\nlet b = @;").tokenize().unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("'@'"));
    }

    #[test]
    fn test_integer_overflow_literal() {
        let err = Lexer::new("99999999999999999999").tokenize().unwrap_err();
        assert!(err.message.contains("too large"));
    }
}
