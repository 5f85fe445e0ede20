use std::collections::BTreeMap;

use crate::value::Value;

/// The caller-supplied variables for a single render call.
///
/// These become the outermost scope, layered over any defaults assigned on
/// the engine; on key collision the render-call value wins.
///
/// # Examples
///
/// ```
/// use stencil::{Context, Value};
///
/// let mut context = Context::new();
/// context.insert("name", "World").insert("age", 30);
/// assert!(context.contains("name"));
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Context {
    data: BTreeMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<K: AsRef<str>, V: Into<Value>>(&mut self, key: K, value: V) -> &mut Self {
        self.data.insert(key.as_ref().to_owned(), value.into());
        self
    }

    pub fn get<K: AsRef<str>>(&self, key: K) -> Option<&Value> {
        self.data.get(key.as_ref())
    }

    pub fn contains<K: AsRef<str>>(&self, key: K) -> bool {
        self.data.contains_key(key.as_ref())
    }

    pub(crate) fn vars(&self) -> &BTreeMap<String, Value> {
        &self.data
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Context {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            data: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}
