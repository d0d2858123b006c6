//! Tokenizer

use super::{ExprError, ExprResult};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Assign,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Bang,
    AndAnd,
    OrOr,
    /// Statement separator: newline or `;` outside brackets
    Separator,
    Eof,
}

/// Token plus its byte offset in the source
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub position: usize,
}

pub fn tokenize(source: &str) -> ExprResult<Vec<Spanned>> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens: Vec<Spanned> = Vec::new();
    let mut depth: usize = 0;
    let mut i = 0;

    let syntax = |position: usize, message: String| ExprError::Syntax { position, message };

    while i < chars.len() {
        let (pos, c) = chars[i];

        if c == '\n' || c == ';' {
            let last_is_sep = matches!(tokens.last().map(|t| &t.token), Some(Token::Separator) | None);
            if depth == 0 && !last_is_sep {
                tokens.push(Spanned { token: Token::Separator, position: pos });
            }
            i += 1;
            continue;
        }
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '#' {
            while i < chars.len() && chars[i].1 != '\n' {
                i += 1;
            }
            continue;
        }

        if c.is_ascii_digit() {
            let start = i;
            let mut is_float = false;
            while i < chars.len() && chars[i].1.is_ascii_digit() {
                i += 1;
            }
            if i + 1 < chars.len() && chars[i].1 == '.' && chars[i + 1].1.is_ascii_digit() {
                is_float = true;
                i += 1;
                while i < chars.len() && chars[i].1.is_ascii_digit() {
                    i += 1;
                }
            }
            if i < chars.len() && (chars[i].1 == 'e' || chars[i].1 == 'E') {
                let mut j = i + 1;
                if j < chars.len() && (chars[j].1 == '+' || chars[j].1 == '-') {
                    j += 1;
                }
                if j < chars.len() && chars[j].1.is_ascii_digit() {
                    is_float = true;
                    i = j;
                    while i < chars.len() && chars[i].1.is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let text: String = chars[start..i].iter().map(|(_, c)| c).collect();
            let token = if is_float {
                Token::Float(
                    text.parse()
                        .map_err(|_| syntax(pos, format!("invalid number '{}'", text)))?,
                )
            } else {
                Token::Int(
                    text.parse()
                        .map_err(|_| syntax(pos, format!("integer '{}' out of range", text)))?,
                )
            };
            tokens.push(Spanned { token, position: pos });
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].1.is_alphanumeric() || chars[i].1 == '_') {
                i += 1;
            }
            let text: String = chars[start..i].iter().map(|(_, c)| c).collect();
            tokens.push(Spanned { token: Token::Ident(text), position: pos });
            continue;
        }

        if c == '"' || c == '\'' {
            let quote = c;
            let mut text = String::new();
            i += 1;
            loop {
                let Some(&(_, ch)) = chars.get(i) else {
                    return Err(syntax(pos, "unterminated string".to_string()));
                };
                i += 1;
                if ch == quote {
                    break;
                }
                if ch == '\\' {
                    let Some(&(_, escaped)) = chars.get(i) else {
                        return Err(syntax(pos, "unterminated string".to_string()));
                    };
                    i += 1;
                    text.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        '0' => '\0',
                        other => other,
                    });
                } else {
                    text.push(ch);
                }
            }
            tokens.push(Spanned { token: Token::Str(text), position: pos });
            continue;
        }

        let next = chars.get(i + 1).map(|(_, c)| *c);
        let (token, width) = match (c, next) {
            ('=', Some('=')) => (Token::Eq, 2),
            ('!', Some('=')) => (Token::Ne, 2),
            ('<', Some('=')) => (Token::Le, 2),
            ('>', Some('=')) => (Token::Ge, 2),
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
            (',', _) => (Token::Comma, 1),
            (':', _) => (Token::Colon, 1),
            ('.', _) => (Token::Dot, 1),
            ('(', _) => (Token::LParen, 1),
            ('[', _) => (Token::LBracket, 1),
            ('{', _) => (Token::LBrace, 1),
            (')', _) => (Token::RParen, 1),
            (']', _) => (Token::RBracket, 1),
            ('}', _) => (Token::RBrace, 1),
            (other, _) => return Err(syntax(pos, format!("unexpected character '{}'", other))),
        };

        match token {
            Token::LParen | Token::LBracket | Token::LBrace => depth += 1,
            Token::RParen | Token::RBracket | Token::RBrace => depth = depth.saturating_sub(1),
            _ => {}
        }

        tokens.push(Spanned { token, position: pos });
        i += width;
    }

    if matches!(tokens.last().map(|t| &t.token), Some(Token::Separator)) {
        tokens.pop();
    }
    tokens.push(Spanned {
        token: Token::Eof,
        position: source.len(),
    });
    Ok(tokens)
}
