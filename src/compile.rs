use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::ast::{Expr, Node};
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::render;
use crate::value::Value;

/// A compiled template: the directly invokable program plus the source
/// identity and modification time it was compiled from.
///
/// The program is the portable executable form — a tree interpreted by the
/// runtime — so it can be persisted by the cache store and re-executed
/// without touching the source text again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledTemplate {
    pub(crate) name: String,
    pub(crate) program: Vec<Node>,
    /// Source mtime as (seconds, nanos) since the unix epoch.
    pub(crate) source_mtime: (u64, u32),
}

impl CompiledTemplate {
    pub(crate) fn execute(
        &self,
        root: BTreeMap<String, Value>,
        registry: &Registry,
    ) -> Result<String> {
        render::execute(&self.program, root, registry)
    }
}

/// Lower a parsed AST into a compiled template.
///
/// Every filter and function name reachable in the program is checked
/// against the registry here, so an unknown name fails the whole compilation
/// before any rendering starts. Evaluation re-checks at call time as the
/// late-bound backstop.
pub(crate) fn compile(
    name: impl Into<String>,
    program: Vec<Node>,
    registry: &Registry,
    source_mtime: SystemTime,
) -> Result<CompiledTemplate> {
    for node in &program {
        validate_node(node, registry)?;
    }
    Ok(CompiledTemplate {
        name: name.into(),
        program,
        source_mtime: encode_mtime(source_mtime),
    })
}

pub(crate) fn encode_mtime(mtime: SystemTime) -> (u64, u32) {
    match mtime.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(elapsed) => (elapsed.as_secs(), elapsed.subsec_nanos()),
        Err(_) => (0, 0),
    }
}

fn validate_node(node: &Node, registry: &Registry) -> Result<()> {
    match node {
        Node::Text { .. } => Ok(()),
        Node::Output { expr, .. } => validate_expr(expr, registry),
        Node::If {
            branches,
            else_body,
        } => {
            for (condition, body) in branches {
                validate_expr(condition, registry)?;
                for node in body {
                    validate_node(node, registry)?;
                }
            }
            if let Some(body) = else_body {
                for node in body {
                    validate_node(node, registry)?;
                }
            }
            Ok(())
        }
        Node::For {
            iterable,
            body,
            else_body,
            ..
        } => {
            validate_expr(iterable, registry)?;
            for node in body {
                validate_node(node, registry)?;
            }
            if let Some(body) = else_body {
                for node in body {
                    validate_node(node, registry)?;
                }
            }
            Ok(())
        }
        Node::Set { expr, .. } => validate_expr(expr, registry),
    }
}

fn validate_expr(expr: &Expr, registry: &Registry) -> Result<()> {
    match expr {
        Expr::Literal(_) | Expr::VarPath(_) => Ok(()),
        Expr::Binary { lhs, rhs, .. } => {
            validate_expr(lhs, registry)?;
            validate_expr(rhs, registry)
        }
        Expr::Unary { operand, .. } => validate_expr(operand, registry),
        Expr::Ternary {
            cond,
            then,
            otherwise,
        } => {
            validate_expr(cond, registry)?;
            validate_expr(then, registry)?;
            validate_expr(otherwise, registry)
        }
        Expr::ArrayLiteral(items) => {
            items.iter().try_for_each(|item| validate_expr(item, registry))
        }
        Expr::FunctionCall { name, args } => {
            if !registry.has_function(name) {
                return Err(Error::UndefinedFunction { name: name.clone() });
            }
            args.iter().try_for_each(|arg| validate_expr(arg, registry))
        }
        Expr::FilterApply { base, name, args } => {
            if !registry.has_filter(name) {
                return Err(Error::UndefinedFilter { name: name.clone() });
            }
            validate_expr(base, registry)?;
            args.iter().try_for_each(|arg| validate_expr(arg, registry))
        }
        Expr::InTest {
            needle, haystack, ..
        } => {
            validate_expr(needle, registry)?;
            validate_expr(haystack, registry)
        }
        Expr::IsTest { target, .. } => validate_expr(target, registry),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::parser::parse;

    fn compile_str(source: &str, registry: &Registry) -> Result<CompiledTemplate> {
        let program = parse(&tokenize(source)?)?;
        compile("test", program, registry, SystemTime::UNIX_EPOCH)
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_known_filter_names_compile() {
        let registry = Registry::with_builtins();
        assert!(compile_str("{{ name|upper|trim }}", &registry).is_ok());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unknown_filter_fails_at_compile_time() {
        let registry = Registry::with_builtins();
        let err = compile_str("{{ name|nonexistent }}", &registry).unwrap_err();
        match err {
            Error::UndefinedFilter { name } => assert_eq!(name, "nonexistent"),
            other => panic!("expected UndefinedFilter, got {other:?}"),
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unknown_function_fails_at_compile_time() {
        let registry = Registry::with_builtins();
        let err = compile_str("{% if check(x) %}y{% endif %}", &registry).unwrap_err();
        assert!(matches!(err, Error::UndefinedFunction { .. }));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_validation_reaches_nested_bodies() {
        let registry = Registry::with_builtins();
        let err = compile_str(
            "{% for x in xs %}{% if x %}{{ x|bogus }}{% endif %}{% endfor %}",
            &registry,
        )
        .unwrap_err();
        assert!(matches!(err, Error::UndefinedFilter { .. }));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_compilation_is_idempotent() {
        let registry = Registry::with_builtins();
        let a = compile_str("Hello {{ name|upper }}!", &registry).unwrap();
        let b = compile_str("Hello {{ name|upper }}!", &registry).unwrap();
        assert_eq!(a.program, b.program);
    }
}
