use super::PredicateError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Ident(String),
    Str(String),
    Int(u64),
    True,
    False,
    In,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Not,
    AndAnd,
    OrOr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Spanned {
    pub token: Token,
    pub offset: usize,
}

fn syntax(offset: usize, message: impl Into<String>) -> PredicateError {
    PredicateError::Syntax {
        offset,
        message: message.into(),
    }
}

pub(crate) fn tokenize(input: &str) -> Result<Vec<Spanned>, PredicateError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        // two-character operators first
        let next = chars.get(i + 1).map(|(_, c)| *c);
        let pair = match (c, next) {
            ('&', Some('&')) => Some(Token::AndAnd),
            ('|', Some('|')) => Some(Token::OrOr),
            ('=', Some('=')) => Some(Token::Eq),
            ('!', Some('=')) => Some(Token::Ne),
            ('<', Some('=')) => Some(Token::Le),
            ('>', Some('=')) => Some(Token::Ge),
            _ => None,
        };
        if let Some(token) = pair {
            tokens.push(Spanned { token, offset });
            i += 2;
            continue;
        }

        let single = match c {
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            '[' => Some(Token::LBracket),
            ']' => Some(Token::RBracket),
            ',' => Some(Token::Comma),
            '.' => Some(Token::Dot),
            '!' => Some(Token::Not),
            '<' => Some(Token::Lt),
            '>' => Some(Token::Gt),
            '+' => Some(Token::Plus),
            '-' => Some(Token::Minus),
            '*' => Some(Token::Star),
            '/' => Some(Token::Slash),
            _ => None,
        };
        if let Some(token) = single {
            tokens.push(Spanned { token, offset });
            i += 1;
            continue;
        }

        if c == '"' || c == '\'' {
            let (value, consumed) = lex_string(&chars[i..], c, offset)?;
            tokens.push(Spanned {
                token: Token::Str(value),
                offset,
            });
            i += consumed;
            continue;
        }

        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].1.is_ascii_digit() {
                i += 1;
            }
            let digits: String = chars[start..i].iter().map(|(_, c)| *c).collect();
            let value = digits
                .parse::<u64>()
                .map_err(|_| syntax(offset, format!("integer literal {digits} out of range")))?;
            // CEL spells unsigned literals with a `u` suffix; both forms are accepted.
            if i < chars.len() && matches!(chars[i].1, 'u' | 'U') {
                i += 1;
            }
            if i < chars.len() && (chars[i].1.is_alphanumeric() || chars[i].1 == '_') {
                return Err(syntax(chars[i].0, "unexpected character after number"));
            }
            tokens.push(Spanned {
                token: Token::Int(value),
                offset,
            });
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].1.is_alphanumeric() || chars[i].1 == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().map(|(_, c)| *c).collect();
            let token = match word.as_str() {
                "true" => Token::True,
                "false" => Token::False,
                "in" => Token::In,
                _ => Token::Ident(word),
            };
            tokens.push(Spanned { token, offset });
            continue;
        }

        return Err(syntax(offset, format!("unexpected character {c:?}")));
    }

    tokens.push(Spanned {
        token: Token::Eof,
        offset: input.len(),
    });

    Ok(tokens)
}

fn lex_string(
    chars: &[(usize, char)],
    quote: char,
    offset: usize,
) -> Result<(String, usize), PredicateError> {
    let mut value = String::new();
    let mut i = 1;

    while i < chars.len() {
        let c = chars[i].1;
        if c == quote {
            return Ok((value, i + 1));
        }
        if c == '\\' {
            let escaped = chars
                .get(i + 1)
                .map(|(_, c)| *c)
                .ok_or_else(|| syntax(offset, "unterminated string literal"))?;
            value.push(match escaped {
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                '\\' => '\\',
                '"' => '"',
                '\'' => '\'',
                other => {
                    return Err(syntax(chars[i].0, format!("unknown escape sequence \\{other}")))
                }
            });
            i += 2;
            continue;
        }
        value.push(c);
        i += 1;
    }

    Err(syntax(offset, "unterminated string literal"))
}
