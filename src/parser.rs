use crate::ast::Node;
use crate::error::{Error, Result};
use crate::expr::parse_expression;
use crate::lexer::{Token, TokenKind};

/// Build the template AST from a token stream.
///
/// Recursive descent with the block nesting carried on the call stack: each
/// `if`/`for` recurses into its body, so an inner block's closer can never
/// leak out to close an outer one. Comments exist in the stream but produce
/// no node.
pub(crate) fn parse(tokens: &[Token]) -> Result<Vec<Node>> {
    let mut parser = Parser { tokens, pos: 0 };
    let nodes = parser.parse_nodes(None)?;
    debug_assert!(parser.pos >= tokens.len(), "parser must consume all tokens");
    Ok(nodes)
}

struct Parser<'t> {
    tokens: &'t [Token],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    /// Parse sibling nodes. With `enclosing` set, stops (without consuming)
    /// at any `elseif`/`else`/closing tag so the caller can dispatch it;
    /// hitting end of input inside a block is a hard failure naming the
    /// expected closer.
    fn parse_nodes(&mut self, enclosing: Option<&str>) -> Result<Vec<Node>> {
        let mut nodes = Vec::new();

        while let Some(token) = self.peek() {
            match &token.kind {
                TokenKind::Text(content) => {
                    nodes.push(Node::Text {
                        content: content.clone(),
                    });
                    self.pos += 1;
                }
                TokenKind::Comment => {
                    self.pos += 1;
                }
                TokenKind::OutputEscaped(payload) => {
                    let expr = parse_expression(payload, token.offset)?;
                    nodes.push(Node::Output { expr, escape: true });
                    self.pos += 1;
                }
                TokenKind::OutputRaw(payload) => {
                    let expr = parse_expression(payload, token.offset)?;
                    nodes.push(Node::Output {
                        expr,
                        escape: false,
                    });
                    self.pos += 1;
                }
                TokenKind::BlockOpen { name, payload } => match name.as_str() {
                    "if" => {
                        let payload = payload.clone();
                        let offset = token.offset;
                        self.pos += 1;
                        nodes.push(self.parse_if(&payload, offset)?);
                    }
                    "for" => {
                        let payload = payload.clone();
                        let offset = token.offset;
                        self.pos += 1;
                        nodes.push(self.parse_for(&payload, offset)?);
                    }
                    "set" => {
                        nodes.push(parse_set(payload, token.offset)?);
                        self.pos += 1;
                    }
                    "elseif" | "else" => {
                        if enclosing.is_some() {
                            return Ok(nodes);
                        }
                        return Err(Error::parse(
                            token.offset,
                            format!("`{name}` outside of any open block"),
                        ));
                    }
                    _ => {
                        return Err(Error::UnknownBlock {
                            name: name.clone(),
                            offset: token.offset,
                        });
                    }
                },
                TokenKind::BlockClose { name } => {
                    let Some(expected) = enclosing else {
                        return Err(Error::parse(
                            token.offset,
                            format!("`end{name}` without matching `{name}`"),
                        ));
                    };
                    if name != expected {
                        return Err(Error::MismatchedBlock {
                            expected: expected.to_owned(),
                            found: name.clone(),
                            offset: token.offset,
                        });
                    }
                    return Ok(nodes);
                }
            }
        }

        match enclosing {
            None => Ok(nodes),
            Some(expected) => Err(Error::UnexpectedEof {
                expected: expected.to_owned(),
            }),
        }
    }

    /// Consume a branch terminator previously left in place by
    /// `parse_nodes`. Returns the open/close token kind and its offset.
    fn take_terminator(&mut self, enclosing: &str) -> Result<(TokenKind, usize)> {
        let Some(token) = self.tokens.get(self.pos) else {
            return Err(Error::UnexpectedEof {
                expected: enclosing.to_owned(),
            });
        };
        self.pos += 1;
        Ok((token.kind.clone(), token.offset))
    }

    fn parse_if(&mut self, payload: &str, offset: usize) -> Result<Node> {
        let mut branches = vec![(parse_expression(payload, offset)?, Vec::new())];
        let mut else_body = None;

        let mut in_else = false;
        loop {
            let body = self.parse_nodes(Some("if"))?;
            let (kind, offset) = self.take_terminator("if")?;
            match kind {
                TokenKind::BlockOpen { name, payload } if name == "elseif" => {
                    if in_else {
                        return Err(Error::parse(offset, "`elseif` after `else`"));
                    }
                    if let Some(last) = branches.last_mut() {
                        last.1 = body;
                    }
                    let condition = parse_expression(&payload, offset)?;
                    branches.push((condition, Vec::new()));
                }
                TokenKind::BlockOpen { name, payload } if name == "else" => {
                    if in_else {
                        return Err(Error::parse(offset, "duplicate `else`"));
                    }
                    if !payload.is_empty() {
                        return Err(Error::parse(offset, "`else` takes no condition"));
                    }
                    if let Some(last) = branches.last_mut() {
                        last.1 = body;
                    }
                    in_else = true;
                }
                TokenKind::BlockClose { .. } => {
                    // parse_nodes already verified the closer kind.
                    if in_else {
                        else_body = Some(body);
                    } else if let Some(last) = branches.last_mut() {
                        last.1 = body;
                    }
                    return Ok(Node::If {
                        branches,
                        else_body,
                    });
                }
                _ => {
                    return Err(Error::parse(
                        offset,
                        "expected `elseif`, `else`, or `endif`",
                    ));
                }
            }
        }
    }

    fn parse_for(&mut self, payload: &str, offset: usize) -> Result<Node> {
        let (key_name, value_name, iterable) = parse_for_head(payload, offset)?;

        let body = self.parse_nodes(Some("for"))?;
        let (kind, offset) = self.take_terminator("for")?;
        let else_body = match kind {
            TokenKind::BlockClose { .. } => None,
            TokenKind::BlockOpen { name, payload } if name == "else" => {
                if !payload.is_empty() {
                    return Err(Error::parse(offset, "`else` takes no condition"));
                }
                let nodes = self.parse_nodes(Some("for"))?;
                let (closer, closer_offset) = self.take_terminator("for")?;
                match closer {
                    TokenKind::BlockClose { .. } => Some(nodes),
                    other => {
                        return Err(Error::parse(
                            closer_offset,
                            format!("expected `endfor`, found `{other:?}`"),
                        ));
                    }
                }
            }
            TokenKind::BlockOpen { name, .. } if name == "elseif" => {
                return Err(Error::parse(offset, "`elseif` is only valid inside `if`"));
            }
            other => {
                return Err(Error::parse(
                    offset,
                    format!("expected `else` or `endfor`, found `{other:?}`"),
                ));
            }
        };

        Ok(Node::For {
            key_name,
            value_name,
            iterable,
            body,
            else_body,
        })
    }
}

/// `set name = expr`.
fn parse_set(payload: &str, offset: usize) -> Result<Node> {
    let (name, rest) = take_identifier(payload)
        .ok_or_else(|| Error::parse(offset, "expected a variable name after `set`"))?;
    let rest = rest.trim_start();
    let Some(expr_src) = rest.strip_prefix('=') else {
        return Err(Error::parse(offset, "expected `=` in `set`"));
    };
    if expr_src.starts_with('=') {
        return Err(Error::parse(offset, "expected a single `=` in `set`"));
    }
    let expr = parse_expression(expr_src.trim(), offset)?;
    Ok(Node::Set {
        name: name.to_owned(),
        expr,
    })
}

/// `[key ,] value in iterable`.
fn parse_for_head(payload: &str, offset: usize) -> Result<(Option<String>, String, crate::ast::Expr)> {
    let (first, rest) = take_identifier(payload)
        .ok_or_else(|| Error::parse(offset, "expected a loop variable after `for`"))?;
    let rest = rest.trim_start();

    let (key_name, value_name, rest) = if let Some(after_comma) = rest.strip_prefix(',') {
        let after_comma = after_comma.trim_start();
        let (second, rest) = take_identifier(after_comma)
            .ok_or_else(|| Error::parse(offset, "expected a value name after `,`"))?;
        (Some(first.to_owned()), second.to_owned(), rest.trim_start())
    } else {
        (None, first.to_owned(), rest)
    };

    let Some(iter_src) = strip_keyword(rest, "in") else {
        return Err(Error::parse(offset, "expected `in` in `for`"));
    };
    let iterable = parse_expression(iter_src.trim(), offset)?;
    Ok((key_name, value_name, iterable))
}

fn take_identifier(input: &str) -> Option<(&str, &str)> {
    let trimmed = input.trim_start();
    let end = trimmed
        .char_indices()
        .find(|(_, c)| !(c.is_alphanumeric() || *c == '_'))
        .map_or(trimmed.len(), |(i, _)| i);
    if end == 0 {
        return None;
    }
    Some((&trimmed[..end], &trimmed[end..]))
}

/// Strip a leading keyword followed by a word boundary.
fn strip_keyword<'a>(input: &'a str, word: &str) -> Option<&'a str> {
    let rest = input.strip_prefix(word)?;
    if rest.starts_with(|c: char| c.is_alphanumeric() || c == '_') {
        return None;
    }
    Some(rest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expr, PathSeg};
    use crate::lexer::tokenize;
    use crate::value::Value;

    fn parse_str(input: &str) -> Result<Vec<Node>> {
        parse(&tokenize(input)?)
    }

    fn var(name: &str) -> Expr {
        Expr::VarPath(vec![PathSeg::Key(name.to_owned())])
    }

    fn text(content: &str) -> Node {
        Node::Text {
            content: content.to_owned(),
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_text_and_output() {
        assert_eq!(
            parse_str("Hello {{ name }}!").unwrap(),
            vec![
                text("Hello "),
                Node::Output {
                    expr: var("name"),
                    escape: true,
                },
                text("!"),
            ]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_raw_output_is_not_escaped() {
        assert_eq!(
            parse_str("{! body !}").unwrap(),
            vec![Node::Output {
                expr: var("body"),
                escape: false,
            }]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_comments_produce_no_node() {
        assert_eq!(
            parse_str("a{# ignored #}b").unwrap(),
            vec![text("a"), text("b")]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_simple_if() {
        assert_eq!(
            parse_str("{% if ok %}yes{% endif %}").unwrap(),
            vec![Node::If {
                branches: vec![(var("ok"), vec![text("yes")])],
                else_body: None,
            }]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_if_elseif_else() {
        assert_eq!(
            parse_str("{% if a %}A{% elseif b %}B{% else %}C{% endif %}").unwrap(),
            vec![Node::If {
                branches: vec![
                    (var("a"), vec![text("A")]),
                    (var("b"), vec![text("B")]),
                ],
                else_body: Some(vec![text("C")]),
            }]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_nested_if_else_binds_to_inner() {
        // The else belongs to the inner if; the outer has none.
        let nodes =
            parse_str("{% if a %}{% if b %}x{% else %}y{% endif %}{% endif %}").unwrap();
        match &nodes[0] {
            Node::If {
                branches,
                else_body: None,
            } => match &branches[0].1[0] {
                Node::If { else_body, .. } => assert!(else_body.is_some()),
                other => panic!("expected nested if, got {other:?}"),
            },
            other => panic!("expected outer if without else, got {other:?}"),
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_for_loop() {
        assert_eq!(
            parse_str("{% for item in items %}{{ item }}{% endfor %}").unwrap(),
            vec![Node::For {
                key_name: None,
                value_name: "item".to_owned(),
                iterable: var("items"),
                body: vec![Node::Output {
                    expr: var("item"),
                    escape: true,
                }],
                else_body: None,
            }]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_for_with_key_and_value() {
        let nodes = parse_str("{% for k, v in map %}{{ k }}{% endfor %}").unwrap();
        match &nodes[0] {
            Node::For {
                key_name, value_name, ..
            } => {
                assert_eq!(key_name.as_deref(), Some("k"));
                assert_eq!(value_name, "v");
            }
            other => panic!("expected for, got {other:?}"),
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_for_else() {
        let nodes = parse_str("{% for x in items %}x{% else %}none{% endfor %}").unwrap();
        match &nodes[0] {
            Node::For { else_body, .. } => {
                assert_eq!(else_body.as_deref(), Some(&[text("none")][..]));
            }
            other => panic!("expected for, got {other:?}"),
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_set() {
        assert_eq!(
            parse_str("{% set total = price * quantity %}").unwrap(),
            vec![Node::Set {
                name: "total".to_owned(),
                expr: Expr::Binary {
                    op: crate::ast::BinaryOp::Mul,
                    lhs: Box::new(var("price")),
                    rhs: Box::new(var("quantity")),
                },
            }]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_set_literal() {
        assert_eq!(
            parse_str("{% set name = \"x\" %}").unwrap(),
            vec![Node::Set {
                name: "name".to_owned(),
                expr: Expr::Literal(Value::String("x".to_owned())),
            }]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unknown_block_name() {
        let err = parse_str("{% include \"x\" %}").unwrap_err();
        match err {
            Error::UnknownBlock { name, .. } => assert_eq!(name, "include"),
            other => panic!("expected UnknownBlock, got {other:?}"),
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_mismatched_closer_names_expected_block() {
        let err = parse_str("{% if a %}{% for x in xs %}{% endif %}{% endfor %}").unwrap_err();
        match err {
            Error::MismatchedBlock { expected, found, .. } => {
                assert_eq!(expected, "for");
                assert_eq!(found, "if");
            }
            other => panic!("expected MismatchedBlock, got {other:?}"),
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unclosed_if_reports_expected_closer() {
        let err = parse_str("{% if a %}body").unwrap_err();
        match err {
            Error::UnexpectedEof { expected } => assert_eq!(expected, "if"),
            other => panic!("expected UnexpectedEof, got {other:?}"),
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unclosed_for_reports_expected_closer() {
        let err = parse_str("{% for x in xs %}body").unwrap_err();
        match err {
            Error::UnexpectedEof { expected } => assert_eq!(expected, "for"),
            other => panic!("expected UnexpectedEof, got {other:?}"),
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_stray_endif() {
        assert!(parse_str("text{% endif %}").is_err());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_stray_else() {
        assert!(parse_str("{% else %}").is_err());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_elseif_after_else_is_rejected() {
        assert!(parse_str("{% if a %}x{% else %}y{% elseif b %}z{% endif %}").is_err());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_for_missing_in() {
        assert!(parse_str("{% for item items %}x{% endfor %}").is_err());
    }
}
