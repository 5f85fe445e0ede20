use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::error::{Error, Result};
use crate::value::Value;

/// A named transformation applied with postfix pipe syntax. The first
/// argument is the piped value, the rest are the parenthesized arguments.
pub type FilterFn = Box<dyn Fn(&Value, &[Value]) -> Result<Value> + Send + Sync>;

/// A named callable invoked as `name(args...)` inside an expression.
pub type FunctionFn = Box<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

/// Name→callable tables for filters and functions.
///
/// Registration is additive and last-write-wins; resolution is read-only
/// during rendering. Unknown names are not rejected until compile/eval time,
/// so templates may reference extensions registered later in setup.
pub struct Registry {
    filters: BTreeMap<String, FilterFn>,
    functions: BTreeMap<String, FunctionFn>,
}

impl Registry {
    /// An empty registry with no built-ins. Mostly useful in tests.
    pub fn empty() -> Self {
        Self {
            filters: BTreeMap::new(),
            functions: BTreeMap::new(),
        }
    }

    /// The standard registry: all built-in filters, no functions.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        install_builtins(&mut registry);
        registry
    }

    pub fn register_filter(&mut self, name: impl Into<String>, filter: FilterFn) {
        self.filters.insert(name.into(), filter);
    }

    pub fn register_function(&mut self, name: impl Into<String>, function: FunctionFn) {
        self.functions.insert(name.into(), function);
    }

    pub fn has_filter(&self, name: &str) -> bool {
        self.filters.contains_key(name)
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub(crate) fn filter(&self, name: &str) -> Result<&FilterFn> {
        self.filters.get(name).ok_or_else(|| Error::UndefinedFilter {
            name: name.to_owned(),
        })
    }

    pub(crate) fn function(&self, name: &str) -> Result<&FunctionFn> {
        self.functions
            .get(name)
            .ok_or_else(|| Error::UndefinedFunction {
                name: name.to_owned(),
            })
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("filters", &self.filters.keys().collect::<Vec<_>>())
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

macro_rules! filter {
    ($registry:expr, $name:literal, $f:expr) => {
        $registry.register_filter($name, Box::new($f));
    };
}

fn install_builtins(r: &mut Registry) {
    // Text
    filter!(r, "upper", |v, _| Ok(Value::String(v.to_display().to_uppercase())));
    filter!(r, "lower", |v, _| Ok(Value::String(v.to_display().to_lowercase())));
    filter!(r, "capitalize", |v, _| {
        let s = v.to_display();
        let mut chars = s.chars();
        let capitalized = match chars.next() {
            Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
            None => s,
        };
        Ok(Value::String(capitalized))
    });
    filter!(r, "trim", |v, _| Ok(Value::String(v.to_display().trim().to_owned())));

    // Numeric
    filter!(r, "abs", |v, _| Ok(Value::Number(v.as_number().abs())));
    filter!(r, "round", |v, args| {
        let precision = args.first().map_or(0.0, Value::as_number).max(0.0) as u32;
        let factor = 10f64.powi(precision as i32);
        Ok(Value::Number((v.as_number() * factor).round() / factor))
    });
    filter!(r, "number_format", |v, args| {
        let decimals = args.first().map_or(0.0, Value::as_number).max(0.0) as usize;
        let dec_point = args.get(1).map_or_else(|| ".".to_owned(), Value::to_display);
        let thousands_sep = args.get(2).map_or_else(|| ",".to_owned(), Value::to_display);
        Ok(Value::String(number_format(
            v.as_number(),
            decimals,
            &dec_point,
            &thousands_sep,
        )))
    });

    // Sequence
    filter!(r, "length", |v, _| {
        let len = match v {
            Value::String(s) => s.chars().count(),
            Value::List(l) => l.len(),
            Value::Map(m) => m.len(),
            Value::Null => 0,
            Value::Bool(_) | Value::Number(_) => v.to_display().chars().count(),
        };
        Ok(Value::Number(len as f64))
    });
    filter!(r, "join", |v, args| {
        let sep = args.first().map_or_else(String::new, Value::to_display);
        let joined = match v {
            Value::List(items) => items
                .iter()
                .map(Value::to_display)
                .collect::<Vec<_>>()
                .join(&sep),
            other => other.to_display(),
        };
        Ok(Value::String(joined))
    });
    filter!(r, "first", |v, _| {
        Ok(match v {
            Value::List(items) => items.first().cloned().unwrap_or(Value::Null),
            Value::String(s) => s
                .chars()
                .next()
                .map_or(Value::Null, |c| Value::String(c.to_string())),
            _ => Value::Null,
        })
    });
    filter!(r, "last", |v, _| {
        Ok(match v {
            Value::List(items) => items.last().cloned().unwrap_or(Value::Null),
            Value::String(s) => s
                .chars()
                .next_back()
                .map_or(Value::Null, |c| Value::String(c.to_string())),
            _ => Value::Null,
        })
    });

    // String
    filter!(r, "truncate", |v, args| {
        let s = v.to_display();
        let limit = args.first().map_or(30.0, Value::as_number).max(0.0) as usize;
        let suffix = args.get(1).map_or_else(|| "...".to_owned(), Value::to_display);
        if s.chars().count() <= limit {
            return Ok(Value::String(s));
        }
        let truncated: String = s.chars().take(limit).collect();
        Ok(Value::String(truncated + &suffix))
    });
    filter!(r, "replace", |v, args| {
        let search = args.first().map_or_else(String::new, Value::to_display);
        let replace = args.get(1).map_or_else(String::new, Value::to_display);
        if search.is_empty() {
            return Ok(Value::String(v.to_display()));
        }
        Ok(Value::String(v.to_display().replace(&search, &replace)))
    });

    // HTML. These emit markup, so they are meant for `{! !}` output.
    filter!(r, "striptags", |v, _| {
        let s = v.to_display();
        let mut out = String::with_capacity(s.len());
        let mut in_tag = false;
        for c in s.chars() {
            match c {
                '<' => in_tag = true,
                '>' => in_tag = false,
                c if !in_tag => out.push(c),
                _ => {}
            }
        }
        Ok(Value::String(out))
    });
    filter!(r, "nl2br", |v, _| {
        let s = v.to_display();
        let mut out = String::with_capacity(s.len());
        let mut chars = s.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '\r' if chars.peek() == Some(&'\n') => {
                    chars.next();
                    out.push_str("<br />\r\n");
                }
                '\n' => out.push_str("<br />\n"),
                c => out.push(c),
            }
        }
        Ok(Value::String(out))
    });

    filter!(r, "default", |v, args| {
        let fallback = args.first().cloned().unwrap_or(Value::Null);
        if v.is_truthy() {
            Ok(v.clone())
        } else {
            Ok(fallback)
        }
    });
    filter!(r, "json", |v, _| {
        Ok(Value::String(serde_json::to_string(v)?))
    });
    filter!(r, "url_encode", |v, _| {
        Ok(Value::String(
            urlencoding::encode(&v.to_display()).into_owned(),
        ))
    });
    filter!(r, "date", |v, args| {
        let format = args
            .first()
            .map_or_else(|| "%Y-%m-%d %H:%M:%S".to_owned(), Value::to_display);
        let datetime = parse_datetime(v)
            .ok_or_else(|| Error::runtime(format!("cannot interpret {} as a date", v.type_name())))?;
        Ok(Value::String(datetime.format(&format).to_string()))
    });
}

/// PHP-style `number_format`: fixed decimals, configurable decimal point and
/// thousands separator.
fn number_format(n: f64, decimals: usize, dec_point: &str, thousands_sep: &str) -> String {
    let formatted = format!("{n:.decimals$}");
    let negative = formatted.starts_with('-');
    let unsigned = formatted.trim_start_matches('-');
    let (int_part, frac_part) = match unsigned.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (unsigned, None),
    };

    let mut grouped = String::new();
    let digits: Vec<char> = int_part.chars().collect();
    for (i, c) in digits.iter().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push_str(thousands_sep);
        }
        grouped.push(*c);
    }

    let mut out = String::new();
    if negative {
        out.push('-');
    }
    out.push_str(&grouped);
    if let Some(frac) = frac_part {
        out.push_str(dec_point);
        out.push_str(frac);
    }
    out
}

/// Accepts a unix timestamp or a handful of common string formats, UTC.
fn parse_datetime(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => Utc.timestamp_opt(*n as i64, 0).single(),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
                return Some(Utc.from_utc_datetime(&naive));
            }
            if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
            }
            None
        }
        _ => None,
    }
}
