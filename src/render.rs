use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::ast::{BinaryOp, Expr, IsPredicate, Node, PathSeg, UnaryOp};
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::value::Value;

/// Execute a compiled program against a root variable scope.
///
/// All output is accumulated and returned in one piece; an error anywhere
/// during execution discards the partial buffer, so rendering is
/// all-or-nothing.
pub(crate) fn execute(
    nodes: &[Node],
    root: BTreeMap<String, Value>,
    registry: &Registry,
) -> Result<String> {
    let mut renderer = Renderer {
        scopes: Scopes::new(root),
        registry,
        output: String::new(),
    };
    renderer.exec_nodes(nodes)?;
    Ok(renderer.output)
}

/// The ordered stack of variable scopes. The root scope holds caller data;
/// each `for` body pushes a child scope that is popped on loop exit. `set`
/// writes into the innermost scope.
struct Scopes {
    frames: Vec<BTreeMap<String, Value>>,
}

impl Scopes {
    fn new(root: BTreeMap<String, Value>) -> Self {
        Self { frames: vec![root] }
    }

    fn push(&mut self) {
        self.frames.push(BTreeMap::new());
    }

    fn pop(&mut self) {
        if self.frames.len() > 1 {
            self.frames.pop();
        }
    }

    fn get(&self, name: &str) -> Option<&Value> {
        self.frames.iter().rev().find_map(|frame| frame.get(name))
    }

    fn set(&mut self, name: impl Into<String>, value: Value) {
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(name.into(), value);
        }
    }
}

struct Renderer<'a> {
    scopes: Scopes,
    registry: &'a Registry,
    output: String,
}

impl Renderer<'_> {
    fn exec_nodes(&mut self, nodes: &[Node]) -> Result<()> {
        for node in nodes {
            self.exec_node(node)?;
        }
        Ok(())
    }

    fn exec_node(&mut self, node: &Node) -> Result<()> {
        match node {
            Node::Text { content } => {
                self.output.push_str(content);
            }
            Node::Output { expr, escape } => {
                let value = self.eval(expr)?;
                let rendered = value.to_display();
                if *escape {
                    html_escape_into(&rendered, &mut self.output);
                } else {
                    self.output.push_str(&rendered);
                }
            }
            Node::If {
                branches,
                else_body,
            } => {
                for (condition, body) in branches {
                    if self.eval(condition)?.is_truthy() {
                        return self.exec_nodes(body);
                    }
                }
                if let Some(body) = else_body {
                    self.exec_nodes(body)?;
                }
            }
            Node::For {
                key_name,
                value_name,
                iterable,
                body,
                else_body,
            } => {
                let entries = iteration_entries(self.eval(iterable)?);
                if entries.is_empty() {
                    // The else clause runs exactly once, and only when the
                    // iterable yielded nothing at render time.
                    if let Some(body) = else_body {
                        self.exec_nodes(body)?;
                    }
                    return Ok(());
                }

                let length = entries.len();
                let parent_loop = self.scopes.get("loop").cloned();
                for (index0, (key, value)) in entries.into_iter().enumerate() {
                    self.scopes.push();
                    if let Some(key_name) = key_name {
                        self.scopes.set(key_name.clone(), key);
                    }
                    self.scopes.set(value_name.clone(), value);
                    self.scopes.set(
                        "loop",
                        loop_context(index0, length, parent_loop.clone()),
                    );
                    let result = self.exec_nodes(body);
                    self.scopes.pop();
                    result?;
                }
            }
            Node::Set { name, expr } => {
                let value = self.eval(expr)?;
                self.scopes.set(name.clone(), value);
            }
        }
        Ok(())
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::VarPath(segments) => Ok(self.resolve_path(segments)),
            Expr::Binary { op, lhs, rhs } => self.eval_binary(*op, lhs, rhs),
            Expr::Unary { op, operand } => {
                let value = self.eval(operand)?;
                Ok(match op {
                    UnaryOp::Not => Value::Bool(!value.is_truthy()),
                    UnaryOp::Neg => Value::Number(-value.as_number()),
                })
            }
            Expr::Ternary {
                cond,
                then,
                otherwise,
            } => {
                if self.eval(cond)?.is_truthy() {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
            Expr::ArrayLiteral(items) => {
                let values: Result<Vec<_>> = items.iter().map(|e| self.eval(e)).collect();
                Ok(Value::List(values?))
            }
            Expr::FunctionCall { name, args } => {
                let values: Result<Vec<_>> = args.iter().map(|e| self.eval(e)).collect();
                let function = self.registry.function(name)?;
                function(&values?)
            }
            Expr::FilterApply { base, name, args } => {
                let value = self.eval(base)?;
                let values: Result<Vec<_>> = args.iter().map(|e| self.eval(e)).collect();
                let filter = self.registry.filter(name)?;
                filter(&value, &values?)
            }
            Expr::InTest {
                needle,
                haystack,
                negated,
            } => {
                let needle = self.eval(needle)?;
                let haystack = self.eval(haystack)?;
                let found = match &haystack {
                    Value::List(items) => items.iter().any(|item| item.loose_eq(&needle)),
                    Value::String(s) => s.contains(&needle.to_display()),
                    Value::Map(map) => map.contains_key(&needle.to_display()),
                    _ => false,
                };
                Ok(Value::Bool(found != *negated))
            }
            Expr::IsTest {
                target,
                predicate,
                negated,
            } => {
                let outcome = self.eval_is(target, *predicate)?;
                Ok(Value::Bool(outcome != *negated))
            }
        }
    }

    fn eval_binary(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Result<Value> {
        // and/or short-circuit and yield the deciding operand.
        match op {
            BinaryOp::And => {
                let left = self.eval(lhs)?;
                if !left.is_truthy() {
                    return Ok(left);
                }
                return self.eval(rhs);
            }
            BinaryOp::Or => {
                let left = self.eval(lhs)?;
                if left.is_truthy() {
                    return Ok(left);
                }
                return self.eval(rhs);
            }
            _ => {}
        }

        let left = self.eval(lhs)?;
        let right = self.eval(rhs)?;

        Ok(match op {
            BinaryOp::Eq => Value::Bool(left.loose_eq(&right)),
            BinaryOp::Ne => Value::Bool(!left.loose_eq(&right)),
            BinaryOp::StrictEq => Value::Bool(left.strict_eq(&right)),
            BinaryOp::StrictNe => Value::Bool(!left.strict_eq(&right)),
            BinaryOp::Lt => Value::Bool(compare(&left, &right) == Some(Ordering::Less)),
            BinaryOp::Gt => Value::Bool(compare(&left, &right) == Some(Ordering::Greater)),
            BinaryOp::Le => Value::Bool(matches!(
                compare(&left, &right),
                Some(Ordering::Less | Ordering::Equal)
            )),
            BinaryOp::Ge => Value::Bool(matches!(
                compare(&left, &right),
                Some(Ordering::Greater | Ordering::Equal)
            )),
            BinaryOp::Add => Value::Number(left.as_number() + right.as_number()),
            BinaryOp::Sub => Value::Number(left.as_number() - right.as_number()),
            BinaryOp::Mul => Value::Number(left.as_number() * right.as_number()),
            BinaryOp::Div => {
                let divisor = right.as_number();
                if divisor == 0.0 {
                    return Err(Error::runtime("division by zero"));
                }
                Value::Number(left.as_number() / divisor)
            }
            BinaryOp::Concat => {
                let mut s = left.to_display();
                s.push_str(&right.to_display());
                Value::String(s)
            }
            BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
        })
    }

    fn eval_is(&mut self, target: &Expr, predicate: IsPredicate) -> Result<bool> {
        // `defined` inspects the scope without substituting a default, so it
        // never evaluates the target.
        if predicate == IsPredicate::Defined {
            return Ok(match target {
                Expr::VarPath(segments) => self.is_path_defined(segments),
                _ => true,
            });
        }

        let value = self.eval(target)?;
        Ok(match predicate {
            IsPredicate::Defined => unreachable!("handled above"),
            IsPredicate::Null => matches!(value, Value::Null),
            IsPredicate::Empty => value.is_empty_value(),
            IsPredicate::Even => as_integer(&value).is_some_and(|n| n % 2 == 0),
            IsPredicate::Odd => as_integer(&value).is_some_and(|n| n.rem_euclid(2) == 1),
            IsPredicate::String => matches!(value, Value::String(_)),
            IsPredicate::Number => matches!(value, Value::Number(_)),
            IsPredicate::Array => matches!(value, Value::List(_)),
        })
    }

    /// Permissive lookup: a missing root, key, or index resolves to null.
    fn resolve_path(&self, segments: &[PathSeg]) -> Value {
        let Some((root, rest)) = segments.split_first() else {
            return Value::Null;
        };
        let PathSeg::Key(name) = root else {
            return Value::Null;
        };
        match self.scopes.get(name) {
            Some(value) => value.get_path(rest),
            None => Value::Null,
        }
    }

    /// Presence check for `is defined`: every step of the path must exist.
    fn is_path_defined(&self, segments: &[PathSeg]) -> bool {
        let Some((PathSeg::Key(name), rest)) = segments.split_first() else {
            return false;
        };
        let Some(mut current) = self.scopes.get(name) else {
            return false;
        };
        for seg in rest {
            current = match (current, seg) {
                (Value::Map(map), PathSeg::Key(key)) => match map.get(key) {
                    Some(v) => v,
                    None => return false,
                },
                (Value::List(list), PathSeg::Index(i)) => {
                    match usize::try_from(*i).ok().and_then(|i| list.get(i)) {
                        Some(v) => v,
                        None => return false,
                    }
                }
                (Value::List(list), PathSeg::Key(key)) => {
                    match key.parse::<usize>().ok().and_then(|i| list.get(i)) {
                        Some(v) => v,
                        None => return false,
                    }
                }
                _ => return false,
            };
        }
        true
    }
}

/// Flatten an iterable into (key, value) pairs. Lists yield their index as
/// the key, maps their key, strings iterate per character. Scalars yield
/// nothing, which routes control to the loop's else clause.
fn iteration_entries(value: Value) -> Vec<(Value, Value)> {
    match value {
        Value::List(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, v)| (Value::Number(i as f64), v))
            .collect(),
        Value::Map(map) => map
            .into_iter()
            .map(|(k, v)| (Value::String(k), v))
            .collect(),
        Value::String(s) => s
            .chars()
            .enumerate()
            .map(|(i, c)| (Value::Number(i as f64), Value::String(c.to_string())))
            .collect(),
        Value::Null | Value::Bool(_) | Value::Number(_) => Vec::new(),
    }
}

/// The per-iteration `loop` variable. `parent` is the enclosing loop's
/// context, present only inside nested loops; it is a plain value, so it is
/// lookup-only by construction.
fn loop_context(index0: usize, length: usize, parent: Option<Value>) -> Value {
    let mut map = BTreeMap::new();
    map.insert("index".to_owned(), Value::Number((index0 + 1) as f64));
    map.insert("index0".to_owned(), Value::Number(index0 as f64));
    map.insert("revindex".to_owned(), Value::Number((length - index0) as f64));
    map.insert(
        "revindex0".to_owned(),
        Value::Number((length - 1 - index0) as f64),
    );
    map.insert("first".to_owned(), Value::Bool(index0 == 0));
    map.insert("last".to_owned(), Value::Bool(index0 == length - 1));
    map.insert("length".to_owned(), Value::Number(length as f64));
    if let Some(parent) = parent {
        map.insert("parent".to_owned(), parent);
    }
    Value::Map(map)
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) if n.fract() == 0.0 => Some(*n as i64),
        _ => None,
    }
}

fn compare(lhs: &Value, rhs: &Value) -> Option<Ordering> {
    match (lhs, rhs) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => lhs.as_number().partial_cmp(&rhs.as_number()),
    }
}

/// HTML-escape `&`, `<`, `>`, `"`, `'`; applied exactly once per escaped
/// output node.
fn html_escape_into(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#039;"),
            c => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::parser::parse;

    fn render(source: &str, vars: &[(&str, Value)]) -> Result<String> {
        let nodes = parse(&tokenize(source)?)?;
        let root = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect();
        execute(&nodes, root, &Registry::with_builtins())
    }

    fn render_ok(source: &str, vars: &[(&str, Value)]) -> String {
        render(source, vars).unwrap()
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_basic_substitution() {
        assert_eq!(
            render_ok("Hello {{ name }}!", &[("name", Value::from("World"))]),
            "Hello World!"
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_escaped_vs_raw_output() {
        assert_eq!(render_ok("{{ \"<b>\" }}", &[]), "&lt;b&gt;");
        assert_eq!(render_ok("{! \"<b>\" !}", &[]), "<b>");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_escaping_covers_all_significant_chars() {
        assert_eq!(
            render_ok("{{ s }}", &[("s", Value::from("a&b<c>d\"e'f"))]),
            "a&amp;b&lt;c&gt;d&quot;e&#039;f"
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_if_else_branching() {
        let template = "{% if age >= 18 %}Adult{% else %}Minor{% endif %}";
        assert_eq!(render_ok(template, &[("age", Value::from(20))]), "Adult");
        assert_eq!(render_ok(template, &[("age", Value::from(16))]), "Minor");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_elseif_takes_first_truthy_branch() {
        let template = "{% if a %}A{% elseif b %}B{% elseif c %}C{% else %}D{% endif %}";
        let f = Value::Bool(false);
        let t = Value::Bool(true);
        assert_eq!(
            render_ok(template, &[("a", f.clone()), ("b", t.clone()), ("c", t.clone())]),
            "B"
        );
        assert_eq!(
            render_ok(template, &[("a", f.clone()), ("b", f.clone()), ("c", f)]),
            "D"
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_for_loop_concatenates() {
        assert_eq!(
            render_ok(
                "{% for item in items %}{{ item }}{% endfor %}",
                &[("items", Value::from(vec!["a", "b", "c"]))]
            ),
            "abc"
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_loop_context_fields() {
        let out = render_ok(
            "{% for x in items %}{{ loop.index }}:{{ loop.index0 }}:{{ loop.revindex }}:{{ loop.revindex0 }}:{{ loop.length }};{% endfor %}",
            &[("items", Value::from(vec!["a", "b", "c"]))],
        );
        assert_eq!(out, "1:0:3:2:3;2:1:2:1:3;3:2:1:0:3;");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_loop_first_and_last() {
        let out = render_ok(
            "{% for x in items %}{% if loop.first %}[{% endif %}{{ x }}{% if loop.last %}]{% endif %}{% endfor %}",
            &[("items", Value::from(vec!["a", "b", "c"]))],
        );
        assert_eq!(out, "[abc]");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_nested_loop_parent_context() {
        let out = render_ok(
            "{% for outer in rows %}{% for inner in outer %}{{ loop.parent.index }}.{{ loop.index }} {% endfor %}{% endfor %}",
            &[(
                "rows",
                Value::List(vec![
                    Value::from(vec!["a", "b"]),
                    Value::from(vec!["c"]),
                ]),
            )],
        );
        assert_eq!(out, "1.1 1.2 2.1 ");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_for_else_on_empty_iterable() {
        let template = "{% for x in items %}{{ x }}{% else %}none{% endfor %}";
        assert_eq!(render_ok(template, &[("items", Value::List(vec![]))]), "none");
        assert_eq!(
            render_ok(template, &[("items", Value::from(vec!["x"]))]),
            "x"
        );
        assert_eq!(render_ok(template, &[]), "none");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_for_over_map_binds_key_and_value() {
        let mut map = BTreeMap::new();
        map.insert("a".to_owned(), Value::from(1));
        map.insert("b".to_owned(), Value::from(2));
        let out = render_ok(
            "{% for k, v in entries %}{{ k }}={{ v }};{% endfor %}",
            &[("entries", Value::Map(map))],
        );
        assert_eq!(out, "a=1;b=2;");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_set_persists_in_current_scope() {
        assert_eq!(
            render_ok(
                "{% set total = price * quantity %}Total: {{ total }}",
                &[("price", Value::from(10)), ("quantity", Value::from(5))]
            ),
            "Total: 50"
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_set_inside_loop_does_not_leak() {
        // The loop body scope is popped each iteration, so a `set` inside it
        // is invisible to siblings after endfor.
        assert_eq!(
            render_ok(
                "{% for x in items %}{% set inner = x %}{% endfor %}[{{ inner }}]",
                &[("items", Value::from(vec!["a"]))]
            ),
            "[]"
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_filter_chain_left_associates() {
        assert_eq!(
            render_ok("{{ name|trim|upper }}", &[("name", Value::from("  john  "))]),
            "JOHN"
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_undefined_filter_raises() {
        let err = render("{{ name|nonexistent }}", &[("name", Value::from("x"))]).unwrap_err();
        match err {
            Error::UndefinedFilter { name } => assert_eq!(name, "nonexistent"),
            other => panic!("expected UndefinedFilter, got {other:?}"),
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_undefined_function_raises() {
        let err = render("{{ missing_fn(1) }}", &[]).unwrap_err();
        assert!(matches!(err, Error::UndefinedFunction { .. }));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_missing_variable_renders_empty() {
        assert_eq!(render_ok("[{{ nothing }}]", &[]), "[]");
        assert_eq!(render_ok("[{{ user.missing.deep }}]", &[]), "[]");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_short_circuit_yields_deciding_operand() {
        assert_eq!(
            render_ok("{{ missing or \"fallback\" }}", &[]),
            "fallback"
        );
        assert_eq!(
            render_ok(
                "{{ a and b }}",
                &[("a", Value::from(true)), ("b", Value::from("yes"))]
            ),
            "yes"
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_ternary() {
        assert_eq!(
            render_ok(
                "{{ logged_in ? \"hi\" : \"guest\" }}",
                &[("logged_in", Value::from(true))]
            ),
            "hi"
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_loose_and_strict_equality() {
        assert_eq!(
            render_ok("{% if age == \"18\" %}y{% else %}n{% endif %}", &[("age", Value::from(18))]),
            "y"
        );
        assert_eq!(
            render_ok(
                "{% if age === \"18\" %}y{% else %}n{% endif %}",
                &[("age", Value::from(18))]
            ),
            "n"
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_in_and_not_in() {
        let items = Value::from(vec!["a", "b"]);
        assert_eq!(
            render_ok(
                "{% if \"a\" in items %}y{% endif %}",
                &[("items", items.clone())]
            ),
            "y"
        );
        assert_eq!(
            render_ok(
                "{% if \"z\" not in items %}y{% endif %}",
                &[("items", items)]
            ),
            "y"
        );
        assert_eq!(render_ok("{% if \"ell\" in \"hello\" %}y{% endif %}", &[]), "y");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_is_predicates() {
        assert_eq!(
            render_ok(
                "{% if user is defined %}y{% else %}n{% endif %}",
                &[("user", Value::Null)]
            ),
            "y"
        );
        assert_eq!(
            render_ok("{% if user is defined %}y{% else %}n{% endif %}", &[]),
            "n"
        );
        assert_eq!(
            render_ok("{% if x is not defined %}y{% endif %}", &[]),
            "y"
        );
        assert_eq!(
            render_ok("{% if n is even %}even{% endif %}", &[("n", Value::from(4))]),
            "even"
        );
        assert_eq!(
            render_ok("{% if n is odd %}odd{% endif %}", &[("n", Value::from(3))]),
            "odd"
        );
        assert_eq!(
            render_ok(
                "{% if xs is array %}arr{% endif %}",
                &[("xs", Value::List(vec![]))]
            ),
            "arr"
        );
        assert_eq!(
            render_ok("{% if v is null %}null{% endif %}", &[("v", Value::Null)]),
            "null"
        );
        assert_eq!(
            render_ok("{% if s is empty %}empty{% endif %}", &[("s", Value::from(""))]),
            "empty"
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_arithmetic_and_concat() {
        assert_eq!(render_ok("{{ 1 + 2 * 3 }}", &[]), "7");
        assert_eq!(render_ok("{{ (1 + 2) * 3 }}", &[]), "9");
        assert_eq!(render_ok("{{ \"a\" ~ 1 ~ \"b\" }}", &[]), "a1b");
        assert_eq!(render_ok("{{ -n }}", &[("n", Value::from(5))]), "-5");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_division_by_zero_is_a_runtime_error() {
        let err = render("{{ 1 / 0 }}", &[]).unwrap_err();
        assert!(matches!(err, Error::Runtime { .. }));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_path_lookup_over_maps_and_lists() {
        let mut user = BTreeMap::new();
        user.insert("age".to_owned(), Value::from(30));
        assert_eq!(
            render_ok("{{ user.age }}", &[("user", Value::Map(user))]),
            "30"
        );
        assert_eq!(
            render_ok(
                "{{ scores[1] }}",
                &[("scores", Value::from(vec![10, 20, 30]))]
            ),
            "20"
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_string_iteration() {
        assert_eq!(
            render_ok(
                "{% for c in word %}{{ c }}.{% endfor %}",
                &[("word", Value::from("abc"))]
            ),
            "a.b.c."
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_runtime_error_discards_partial_output() {
        let err = render("before {{ 1 / 0 }} after", &[]).unwrap_err();
        assert!(matches!(err, Error::Runtime { .. }));
    }
}
