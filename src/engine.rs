use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::SystemTime;

use tracing::debug;

use crate::cache::CacheStore;
use crate::compile::compile;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::lexer::tokenize;
use crate::parser::parse;
use crate::registry::{FilterFn, FunctionFn, Registry};
use crate::value::Value;

/// The template engine facade.
///
/// Orchestrates the pipeline — lex, parse, compile, cache — and executes
/// compiled templates against caller data merged over engine-level defaults.
/// An `Engine` is an explicitly constructed value owned by the host
/// application; construct one and pass it where it is needed.
///
/// # Examples
///
/// ```no_run
/// use stencil::{Context, Engine};
///
/// let mut engine = Engine::new("templates", "cache");
/// engine.assign("site_name", "Example");
///
/// let mut context = Context::new();
/// context.insert("name", "World");
/// let html = engine.render("hello.html", Some(&context)).unwrap();
/// ```
pub struct Engine {
    template_root: PathBuf,
    cache: CacheStore,
    registry: Registry,
    defaults: BTreeMap<String, Value>,
}

impl Engine {
    /// Create an engine loading template sources from `template_root` and
    /// persisting compiled artifacts under `cache_dir`.
    pub fn new(template_root: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            template_root: template_root.into(),
            cache: CacheStore::new(cache_dir),
            registry: Registry::with_builtins(),
            defaults: BTreeMap::new(),
        }
    }

    /// Render a template file with the given context.
    ///
    /// The name is resolved relative to the template root. A cached compiled
    /// form is reused while its recorded mtime is current; otherwise the
    /// source is recompiled (and re-cached when caching is enabled).
    ///
    /// # Errors
    ///
    /// - [`Error::TemplateNotFound`] if no source file exists for `name`.
    /// - Lex/parse errors for malformed template syntax.
    /// - [`Error::UndefinedFilter`] / [`Error::UndefinedFunction`] for names
    ///   absent from the registry.
    /// - [`Error::Runtime`] for non-recoverable evaluation faults.
    pub fn render<N: AsRef<str>>(&self, name: N, context: Option<&Context>) -> Result<String> {
        let name = name.as_ref();
        let path = self.template_root.join(name);
        let metadata = fs::metadata(&path).map_err(|_| Error::TemplateNotFound {
            name: name.to_owned(),
        })?;
        let source_mtime = metadata.modified()?;

        let compiled = match self.cache.get(name, source_mtime) {
            Some(compiled) => compiled,
            None => {
                let source = fs::read_to_string(&path)?;
                debug!(template = name, "compiling template");
                let program = parse(&tokenize(&source)?)?;
                let compiled = compile(name, program, &self.registry, source_mtime)?;
                self.cache.put(&compiled)?;
                compiled
            }
        };

        compiled.execute(self.merged_vars(context), &self.registry)
    }

    /// Compile and execute a template from a string, bypassing the template
    /// root and the cache. Useful for one-off snippets and tests.
    pub fn render_str(&self, source: &str, context: Option<&Context>) -> Result<String> {
        let program = parse(&tokenize(source)?)?;
        let compiled = compile("<string>", program, &self.registry, SystemTime::UNIX_EPOCH)?;
        compiled.execute(self.merged_vars(context), &self.registry)
    }

    /// Set an engine-level default variable, visible to every render unless
    /// shadowed by the call's context.
    pub fn assign<K: AsRef<str>, V: Into<Value>>(&mut self, key: K, value: V) -> &mut Self {
        self.defaults.insert(key.as_ref().to_owned(), value.into());
        self
    }

    /// Set several defaults at once.
    pub fn assign_many<K, V, I>(&mut self, vars: I) -> &mut Self
    where
        K: AsRef<str>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        for (key, value) in vars {
            self.assign(key, value);
        }
        self
    }

    /// Register (or replace) a filter.
    pub fn add_filter(&mut self, name: impl Into<String>, filter: FilterFn) -> &mut Self {
        self.registry.register_filter(name, filter);
        self
    }

    /// Register (or replace) a function.
    pub fn add_function(&mut self, name: impl Into<String>, function: FunctionFn) -> &mut Self {
        self.registry.register_function(name, function);
        self
    }

    pub fn has_filter(&self, name: &str) -> bool {
        self.registry.has_filter(name)
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.registry.has_function(name)
    }

    /// Toggle the compiled-template cache. Disabling forces a fresh
    /// compilation on every render without deleting existing artifacts.
    pub fn set_cache_enabled(&mut self, enabled: bool) -> &mut Self {
        self.cache.set_enabled(enabled);
        self
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache.is_enabled()
    }

    /// Remove all persisted cache artifacts unconditionally.
    pub fn clear_cache(&self) -> Result<()> {
        self.cache.clear()
    }

    /// Drop the cached compiled form of a single template.
    pub fn invalidate(&self, name: &str) -> Result<()> {
        self.cache.invalidate(name)
    }

    fn merged_vars(&self, context: Option<&Context>) -> BTreeMap<String, Value> {
        let mut vars = self.defaults.clone();
        if let Some(context) = context {
            for (key, value) in context.vars() {
                vars.insert(key.clone(), value.clone());
            }
        }
        vars
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("template_root", &self.template_root)
            .field("cache_enabled", &self.cache.is_enabled())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
