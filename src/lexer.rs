use crate::error::{Error, Result};

/// A lexed token with the byte offset where it started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    /// Raw template text outside any directive.
    Text(String),
    /// `{{ expr }}` — output with HTML escaping.
    OutputEscaped(String),
    /// `{! expr !}` — output without escaping.
    OutputRaw(String),
    /// `{% name payload %}` for `if`/`elseif`/`else`/`for`/`set`.
    BlockOpen { name: String, payload: String },
    /// `{% endif %}` / `{% endfor %}`; `name` is the block kind being closed.
    BlockClose { name: String },
    /// `{# ... #}`; present in the stream, dropped by the parser.
    Comment,
}

/// Scan raw template text into a token stream.
///
/// Pure function over the input; the four delimiters are disjoint two-byte
/// prefixes resolved greedily left-to-right. Comment bodies are consumed
/// verbatim up to the literal `#}`, so directive-like text inside a comment
/// is inert. An opened directive with no closing marker before end of input
/// is an error naming the opening offset.
pub fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < input.len() {
        let rest = &input[pos..];

        let (open, close): (&'static str, &'static str) = if rest.starts_with("{{") {
            ("{{", "}}")
        } else if rest.starts_with("{!") {
            ("{!", "!}")
        } else if rest.starts_with("{%") {
            ("{%", "%}")
        } else if rest.starts_with("{#") {
            ("{#", "#}")
        } else {
            // Plain text up to the next possible delimiter start.
            let mut end = rest.len();
            for (i, _) in rest.char_indices().skip(1) {
                if is_delimiter_start(&rest[i..]) {
                    end = i;
                    break;
                }
            }
            tokens.push(Token {
                kind: TokenKind::Text(rest[..end].to_owned()),
                offset: pos,
            });
            pos += end;
            continue;
        };

        let body_start = pos + open.len();
        let Some(close_rel) = input[body_start..].find(close) else {
            return Err(Error::UnterminatedDirective {
                delimiter: open,
                offset: pos,
            });
        };
        let body = &input[body_start..body_start + close_rel];
        let kind = match open {
            "{{" => TokenKind::OutputEscaped(body.trim().to_owned()),
            "{!" => TokenKind::OutputRaw(body.trim().to_owned()),
            "{#" => TokenKind::Comment,
            _ => block_token(body),
        };
        tokens.push(Token { kind, offset: pos });
        pos = body_start + close_rel + close.len();
    }

    Ok(tokens)
}

fn is_delimiter_start(rest: &str) -> bool {
    rest.starts_with("{{")
        || rest.starts_with("{!")
        || rest.starts_with("{%")
        || rest.starts_with("{#")
}

/// Split a `{% ... %}` body into the block keyword and its payload.
fn block_token(body: &str) -> TokenKind {
    let trimmed = body.trim();
    let (name, payload) = match trimmed.find(char::is_whitespace) {
        Some(split) => (&trimmed[..split], trimmed[split..].trim_start()),
        None => (trimmed, ""),
    };

    if let Some(closed) = name.strip_prefix("end") {
        TokenKind::BlockClose {
            name: closed.to_owned(),
        }
    } else {
        TokenKind::BlockOpen {
            name: name.to_owned(),
            payload: payload.to_owned(),
        }
    }
}
