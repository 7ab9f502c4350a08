use crate::error::ValidationError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    /// `^` or `**`
    Caret,
    LParen,
    RParen,
    Comma,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    /// Byte offset of the token in the source text.
    pub position: usize,
}

/// Split an expression into tokens, rejecting characters outside the grammar.
pub(crate) fn tokenize(input: &str) -> Result<Vec<Token>, ValidationError> {
    let bytes = input.as_bytes();
    let mut idx = 0usize;
    let mut tokens = Vec::new();

    while idx < bytes.len() {
        let b = bytes[idx];
        if b.is_ascii_whitespace() {
            idx += 1;
            continue;
        }

        let start = idx;
        let kind = match b {
            b'+' => {
                idx += 1;
                TokenKind::Plus
            }
            b'-' => {
                idx += 1;
                TokenKind::Minus
            }
            b'*' if bytes.get(idx + 1) == Some(&b'*') => {
                idx += 2;
                TokenKind::Caret
            }
            b'*' => {
                idx += 1;
                TokenKind::Star
            }
            b'/' => {
                idx += 1;
                TokenKind::Slash
            }
            b'^' => {
                idx += 1;
                TokenKind::Caret
            }
            b'(' => {
                idx += 1;
                TokenKind::LParen
            }
            b')' => {
                idx += 1;
                TokenKind::RParen
            }
            b',' => {
                idx += 1;
                TokenKind::Comma
            }
            _ if b.is_ascii_digit() || b == b'.' => {
                idx = scan_number(bytes, idx);
                let raw = &input[start..idx];
                let value = raw.parse::<f64>().map_err(|_| {
                    ValidationError::syntax(format!("invalid numeric literal '{}'", raw), start)
                })?;
                if !value.is_finite() {
                    return Err(ValidationError::syntax(
                        format!("numeric literal '{}' is out of range", raw),
                        start,
                    ));
                }
                TokenKind::Number(value)
            }
            _ if b.is_ascii_alphabetic() || b == b'_' => {
                idx += 1;
                while idx < bytes.len() && (bytes[idx].is_ascii_alphanumeric() || bytes[idx] == b'_')
                {
                    idx += 1;
                }
                TokenKind::Ident(input[start..idx].to_string())
            }
            _ => {
                let ch = input[start..].chars().next().unwrap_or('?');
                return Err(ValidationError::syntax(
                    format!("unsupported character '{}'", ch),
                    start,
                ));
            }
        };

        tokens.push(Token {
            kind,
            position: start,
        });
    }

    Ok(tokens)
}

/// Returns the end offset of the numeric literal starting at `idx`.
fn scan_number(bytes: &[u8], mut idx: usize) -> usize {
    while idx < bytes.len() && (bytes[idx].is_ascii_digit() || bytes[idx] == b'.') {
        idx += 1;
    }

    // Exponent only when a digit follows `e`, `e+` or `e-`; otherwise `e`
    // starts an identifier and the parser reports the juxtaposition.
    if idx < bytes.len() && matches!(bytes[idx], b'e' | b'E') {
        let mut exp = idx + 1;
        if exp < bytes.len() && matches!(bytes[exp], b'+' | b'-') {
            exp += 1;
        }
        if exp < bytes.len() && bytes[exp].is_ascii_digit() {
            while exp < bytes.len() && bytes[exp].is_ascii_digit() {
                exp += 1;
            }
            idx = exp;
        }
    }

    idx
}
