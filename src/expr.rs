use crate::ast::{BinaryOp, Expr, IsPredicate, PathSeg, UnaryOp};
use crate::error::{Error, Result};
use crate::value::Value;

/// Parse the text inside a directive payload into an expression tree.
///
/// `offset` is the byte position of the payload within the template source,
/// used only for error reporting. The whole payload must be consumed.
pub(crate) fn parse_expression(source: &str, offset: usize) -> Result<Expr> {
    let tokens = scan(source, offset)?;
    let mut cursor = Cursor {
        tokens,
        pos: 0,
        end_offset: offset + source.len(),
    };
    let expr = cursor.parse_ternary()?;
    match cursor.peek() {
        None => Ok(expr),
        Some((_, off)) => Err(Error::parse(*off, "unexpected trailing input")),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Number(f64),
    Str(String),
    Pipe,
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Question,
    Colon,
    EqEq,
    NotEq,
    StrictEq,
    StrictNe,
    Lt,
    Gt,
    Le,
    Ge,
    Plus,
    Minus,
    Tilde,
    Star,
    Slash,
}

/// Scan a payload into operator/literal tokens. Keywords (`and`, `or`,
/// `not`, `in`, `is`, `true`, `false`, `null`) stay as identifiers and are
/// recognized by the grammar, not the scanner.
fn scan(source: &str, base: usize) -> Result<Vec<(Tok, usize)>> {
    let mut tokens = Vec::new();
    let bytes = source.as_bytes();
    let mut pos = 0;

    while pos < source.len() {
        let rest = &source[pos..];
        let c = rest.chars().next().unwrap_or_default();
        let off = base + pos;

        if c.is_whitespace() {
            pos += c.len_utf8();
            continue;
        }

        // Longest operators first.
        if rest.starts_with("===") {
            tokens.push((Tok::StrictEq, off));
            pos += 3;
            continue;
        }
        if rest.starts_with("!==") {
            tokens.push((Tok::StrictNe, off));
            pos += 3;
            continue;
        }
        let two = match rest.get(..2) {
            Some("==") => Some(Tok::EqEq),
            Some("!=") => Some(Tok::NotEq),
            Some("<=") => Some(Tok::Le),
            Some(">=") => Some(Tok::Ge),
            _ => None,
        };
        if let Some(tok) = two {
            tokens.push((tok, off));
            pos += 2;
            continue;
        }

        let single = match c {
            '|' => Some(Tok::Pipe),
            '.' => Some(Tok::Dot),
            ',' => Some(Tok::Comma),
            '(' => Some(Tok::LParen),
            ')' => Some(Tok::RParen),
            '[' => Some(Tok::LBracket),
            ']' => Some(Tok::RBracket),
            '?' => Some(Tok::Question),
            ':' => Some(Tok::Colon),
            '<' => Some(Tok::Lt),
            '>' => Some(Tok::Gt),
            '+' => Some(Tok::Plus),
            '-' => Some(Tok::Minus),
            '~' => Some(Tok::Tilde),
            '*' => Some(Tok::Star),
            '/' => Some(Tok::Slash),
            _ => None,
        };
        if let Some(tok) = single {
            tokens.push((tok, off));
            pos += 1;
            continue;
        }

        if c == '"' || c == '\'' {
            let (value, consumed) = scan_string(rest, c, off)?;
            tokens.push((Tok::Str(value), off));
            pos += consumed;
            continue;
        }

        if c.is_ascii_digit() {
            let mut end = pos;
            let mut seen_dot = false;
            while end < source.len() {
                let b = bytes[end];
                if b.is_ascii_digit() {
                    end += 1;
                } else if b == b'.' && !seen_dot && source[end + 1..].starts_with(|c: char| c.is_ascii_digit()) {
                    seen_dot = true;
                    end += 1;
                } else {
                    break;
                }
            }
            let number: f64 = source[pos..end]
                .parse()
                .map_err(|_| Error::parse(off, "malformed number literal"))?;
            tokens.push((Tok::Number(number), off));
            pos = end;
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let mut end = pos;
            while end < source.len() {
                let ch = source[end..].chars().next().unwrap_or_default();
                if ch.is_alphanumeric() || ch == '_' {
                    end += ch.len_utf8();
                } else {
                    break;
                }
            }
            tokens.push((Tok::Ident(source[pos..end].to_owned()), off));
            pos = end;
            continue;
        }

        return Err(Error::parse(off, format!("unexpected character `{c}`")));
    }

    Ok(tokens)
}

fn scan_string(rest: &str, quote: char, off: usize) -> Result<(String, usize)> {
    let mut value = String::new();
    let mut chars = rest.char_indices().skip(1);
    while let Some((i, c)) = chars.next() {
        match c {
            c if c == quote => return Ok((value, i + quote.len_utf8())),
            '\\' => match chars.next() {
                Some((_, 'n')) => value.push('\n'),
                Some((_, 't')) => value.push('\t'),
                Some((_, 'r')) => value.push('\r'),
                Some((_, '\\')) => value.push('\\'),
                Some((_, c)) if c == quote => value.push(c),
                Some((_, c)) => {
                    value.push('\\');
                    value.push(c);
                }
                None => break,
            },
            c => value.push(c),
        }
    }
    Err(Error::parse(off, "unclosed string literal"))
}

struct Cursor {
    tokens: Vec<(Tok, usize)>,
    pos: usize,
    end_offset: usize,
}

impl Cursor {
    fn peek(&self) -> Option<&(Tok, usize)> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self) -> Option<&Tok> {
        self.peek().map(|(t, _)| t)
    }

    fn next_offset(&self) -> usize {
        self.peek().map_or(self.end_offset, |(_, off)| *off)
    }

    fn advance(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek_kind() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Consume the given keyword if it is next.
    fn eat_keyword(&mut self, word: &str) -> bool {
        match self.peek_kind() {
            Some(Tok::Ident(name)) if name == word => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    fn peek_keyword(&self, word: &str) -> bool {
        matches!(self.peek_kind(), Some(Tok::Ident(name)) if name == word)
    }

    fn expect(&mut self, tok: &Tok, what: &str) -> Result<()> {
        if self.eat(tok) {
            Ok(())
        } else {
            Err(Error::parse(self.next_offset(), format!("expected {what}")))
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<String> {
        match self.advance() {
            Some(Tok::Ident(name)) => Ok(name),
            _ => Err(Error::parse(
                self.next_offset(),
                format!("expected {what}"),
            )),
        }
    }

    // Precedence levels, lowest first. Each level delegates to the next
    // tighter one, the same laddered shape as the boolean grammar this
    // parser grew out of.

    /// `cond ? a : b`, right-associative.
    fn parse_ternary(&mut self) -> Result<Expr> {
        let cond = self.parse_test()?;
        if self.eat(&Tok::Question) {
            let then = self.parse_ternary()?;
            self.expect(&Tok::Colon, "`:` in ternary")?;
            let otherwise = self.parse_ternary()?;
            Ok(Expr::Ternary {
                cond: Box::new(cond),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            })
        } else {
            Ok(cond)
        }
    }

    /// `in` / `not in` / `is [not] predicate` tests.
    fn parse_test(&mut self) -> Result<Expr> {
        let left = self.parse_or()?;

        if self.eat_keyword("in") {
            let haystack = self.parse_or()?;
            return Ok(Expr::InTest {
                needle: Box::new(left),
                haystack: Box::new(haystack),
                negated: false,
            });
        }

        // `not` after an operand can only begin `not in`.
        if self.peek_keyword("not") {
            let checkpoint = self.pos;
            self.pos += 1;
            if self.eat_keyword("in") {
                let haystack = self.parse_or()?;
                return Ok(Expr::InTest {
                    needle: Box::new(left),
                    haystack: Box::new(haystack),
                    negated: true,
                });
            }
            self.pos = checkpoint;
            return Err(Error::parse(self.next_offset(), "expected `in` after `not`"));
        }

        if self.eat_keyword("is") {
            let negated = self.eat_keyword("not");
            let off = self.next_offset();
            let name = self.expect_ident("test predicate after `is`")?;
            let predicate = IsPredicate::from_name(&name)
                .ok_or_else(|| Error::parse(off, format!("unknown test predicate `{name}`")))?;
            return Ok(Expr::IsTest {
                target: Box::new(left),
                predicate,
                negated,
            });
        }

        Ok(left)
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.eat_keyword("or") {
            let right = self.parse_and()?;
            left = Expr::Binary {
                op: BinaryOp::Or,
                lhs: Box::new(left),
                rhs: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_not()?;
        while self.eat_keyword("and") {
            let right = self.parse_not()?;
            left = Expr::Binary {
                op: BinaryOp::And,
                lhs: Box::new(left),
                rhs: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.eat_keyword("not") {
            let operand = self.parse_not()?;
            Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            })
        } else {
            self.parse_equality()
        }
    }

    fn parse_equality(&mut self) -> Result<Expr> {
        let mut left = self.parse_relational()?;
        loop {
            let op = match self.peek_kind() {
                Some(Tok::EqEq) => BinaryOp::Eq,
                Some(Tok::NotEq) => BinaryOp::Ne,
                Some(Tok::StrictEq) => BinaryOp::StrictEq,
                Some(Tok::StrictNe) => BinaryOp::StrictNe,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_relational()?;
            left = Expr::Binary {
                op,
                lhs: Box::new(left),
                rhs: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_relational(&mut self) -> Result<Expr> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek_kind() {
                Some(Tok::Lt) => BinaryOp::Lt,
                Some(Tok::Gt) => BinaryOp::Gt,
                Some(Tok::Le) => BinaryOp::Le,
                Some(Tok::Ge) => BinaryOp::Ge,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_additive()?;
            left = Expr::Binary {
                op,
                lhs: Box::new(left),
                rhs: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek_kind() {
                Some(Tok::Plus) => BinaryOp::Add,
                Some(Tok::Minus) => BinaryOp::Sub,
                Some(Tok::Tilde) => BinaryOp::Concat,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            left = Expr::Binary {
                op,
                lhs: Box::new(left),
                rhs: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary_minus()?;
        loop {
            let op = match self.peek_kind() {
                Some(Tok::Star) => BinaryOp::Mul,
                Some(Tok::Slash) => BinaryOp::Div,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_unary_minus()?;
            left = Expr::Binary {
                op,
                lhs: Box::new(left),
                rhs: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary_minus(&mut self) -> Result<Expr> {
        if self.eat(&Tok::Minus) {
            let operand = self.parse_unary_minus()?;
            Ok(Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
            })
        } else {
            self.parse_postfix()
        }
    }

    /// Path extension and the filter chain. Filters left-associate:
    /// `x|f|g` is `g(f(x))`.
    fn parse_postfix(&mut self) -> Result<Expr> {
        let mut base = self.parse_primary()?;

        loop {
            match self.peek_kind() {
                Some(Tok::Dot) if matches!(base, Expr::VarPath(_)) => {
                    self.pos += 1;
                    let seg = match self.advance() {
                        Some(Tok::Ident(name)) => PathSeg::Key(name),
                        Some(Tok::Number(n)) if n.fract() == 0.0 => PathSeg::Index(n as i64),
                        _ => {
                            return Err(Error::parse(
                                self.next_offset(),
                                "expected identifier after `.`",
                            ));
                        }
                    };
                    if let Expr::VarPath(segments) = &mut base {
                        segments.push(seg);
                    }
                }
                Some(Tok::LBracket) if matches!(base, Expr::VarPath(_)) => {
                    self.pos += 1;
                    let off = self.next_offset();
                    let seg = match self.advance() {
                        Some(Tok::Number(n)) if n.fract() == 0.0 => PathSeg::Index(n as i64),
                        Some(Tok::Str(key)) => PathSeg::Key(key),
                        _ => {
                            return Err(Error::parse(
                                off,
                                "expected a literal index or key inside `[ ]`",
                            ));
                        }
                    };
                    self.expect(&Tok::RBracket, "`]`")?;
                    if let Expr::VarPath(segments) = &mut base {
                        segments.push(seg);
                    }
                }
                Some(Tok::Pipe) => {
                    self.pos += 1;
                    let name = self.expect_ident("filter name after `|`")?;
                    let args = if self.eat(&Tok::LParen) {
                        self.parse_args()?
                    } else {
                        Vec::new()
                    };
                    base = Expr::FilterApply {
                        base: Box::new(base),
                        name,
                        args,
                    };
                }
                _ => break,
            }
        }

        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let off = self.next_offset();
        match self.advance() {
            Some(Tok::Number(n)) => Ok(Expr::Literal(Value::Number(n))),
            Some(Tok::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Tok::LParen) => {
                let inner = self.parse_ternary()?;
                self.expect(&Tok::RParen, "`)`")?;
                Ok(inner)
            }
            Some(Tok::LBracket) => {
                let mut items = Vec::new();
                if !self.eat(&Tok::RBracket) {
                    loop {
                        items.push(self.parse_ternary()?);
                        if self.eat(&Tok::Comma) {
                            continue;
                        }
                        self.expect(&Tok::RBracket, "`]` after array literal")?;
                        break;
                    }
                }
                Ok(Expr::ArrayLiteral(items))
            }
            Some(Tok::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ => {
                    if self.eat(&Tok::LParen) {
                        let args = self.parse_args()?;
                        Ok(Expr::FunctionCall { name, args })
                    } else {
                        Ok(Expr::VarPath(vec![PathSeg::Key(name)]))
                    }
                }
            },
            _ => Err(Error::parse(off, "expected an expression")),
        }
    }

    /// Comma-separated arguments after a consumed `(`.
    fn parse_args(&mut self) -> Result<Vec<Expr>> {
        let mut args = Vec::new();
        if self.eat(&Tok::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_ternary()?);
            if self.eat(&Tok::Comma) {
                continue;
            }
            self.expect(&Tok::RParen, "`)` after arguments")?;
            return Ok(args);
        }
    }
}
