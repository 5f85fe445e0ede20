use serde::{Deserialize, Serialize};

use crate::value::Value;

/// A statement-level node in the template tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    /// A constant block of text from the template, emitted verbatim.
    Text { content: String },
    /// An interpolated expression. `escape` is true for `{{ }}` output and
    /// false for `{! !}` output; escaping is applied exactly once.
    Output { expr: Expr, escape: bool },
    /// An `if` with its ordered `elseif` branches and optional `else` body.
    If {
        branches: Vec<(Expr, Vec<Node>)>,
        else_body: Option<Vec<Node>>,
    },
    /// A `for [key,] value in iterable` loop. The `else` body runs exactly
    /// once when the iterable yields no elements at render time.
    For {
        key_name: Option<String>,
        value_name: String,
        iterable: Expr,
        body: Vec<Node>,
        else_body: Option<Vec<Node>>,
    },
    /// `set name = expr`; writes into the current scope.
    Set { name: String, expr: Expr },
}

/// One step of a variable path: a map key or a list index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PathSeg {
    Key(String),
    Index(i64),
}

/// An expression inside a directive payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Literal(Value),
    /// Dotted/bracketed lookup rooted in the scope stack, e.g. `user.name`
    /// or `scores[0]`. Resolution is uniform over maps and lists.
    VarPath(Vec<PathSeg>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Ternary {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    ArrayLiteral(Vec<Expr>),
    FunctionCall {
        name: String,
        args: Vec<Expr>,
    },
    /// Postfix pipe application; chains left-associate, so `x|f|g`
    /// evaluates as `g(f(x))`.
    FilterApply {
        base: Box<Expr>,
        name: String,
        args: Vec<Expr>,
    },
    InTest {
        needle: Box<Expr>,
        haystack: Box<Expr>,
        negated: bool,
    },
    IsTest {
        target: Box<Expr>,
        predicate: IsPredicate,
        negated: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Or,
    And,
    /// Loose equality; a number and a numeric string compare equal.
    Eq,
    Ne,
    /// Strict equality; identical type and value.
    StrictEq,
    StrictNe,
    Lt,
    Gt,
    Le,
    Ge,
    Add,
    Sub,
    /// String concatenation (`~`).
    Concat,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// Pure predicates usable on the right of `is` / `is not`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsPredicate {
    /// Presence in scope, checked without substituting a default.
    Defined,
    Null,
    Empty,
    Even,
    Odd,
    String,
    Number,
    Array,
}

impl IsPredicate {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "defined" => Some(Self::Defined),
            "null" => Some(Self::Null),
            "empty" => Some(Self::Empty),
            "even" => Some(Self::Even),
            "odd" => Some(Self::Odd),
            "string" => Some(Self::String),
            "number" => Some(Self::Number),
            "array" => Some(Self::Array),
            _ => None,
        }
    }
}
