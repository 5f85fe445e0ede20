use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the template pipeline.
///
/// Everything is reported to the caller of `render`; there is no recovery
/// inside the pipeline. Lex and parse failures abort before any output is
/// produced, and a runtime failure mid-render discards the partial output.
#[derive(Debug, Error)]
pub enum Error {
    /// An opening delimiter with no matching close before end of input.
    #[error("unterminated `{delimiter}` directive starting at offset {offset}")]
    UnterminatedDirective { delimiter: &'static str, offset: usize },

    /// Malformed grammar inside a directive payload.
    #[error("parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },

    /// A `{% ... %}` keyword the grammar does not recognize.
    #[error("unknown block `{name}` at offset {offset}")]
    UnknownBlock { name: String, offset: usize },

    /// A closing tag that does not match the innermost open block.
    #[error("expected `end{expected}`, found `end{found}` at offset {offset}")]
    MismatchedBlock {
        expected: String,
        found: String,
        offset: usize,
    },

    /// Input ended while a block was still open.
    #[error("unexpected end of template, expected `end{expected}`")]
    UnexpectedEof { expected: String },

    /// A filter name that is not registered, caught at compile or eval time.
    #[error("undefined filter `{name}`")]
    UndefinedFilter { name: String },

    /// A function name that is not registered, caught at compile or eval time.
    #[error("undefined function `{name}`")]
    UndefinedFunction { name: String },

    /// `render` was asked for a template with no source file.
    #[error("template not found: {name}")]
    TemplateNotFound { name: String },

    /// Non-recoverable evaluation fault (e.g. division by zero). Ordinary
    /// missing-variable lookups resolve to null instead of raising this.
    #[error("runtime error: {message}")]
    Runtime { message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A cache artifact could not be encoded.
    #[error("cache artifact error: {0}")]
    Artifact(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn parse(offset: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            offset,
            message: message.into(),
        }
    }

    pub(crate) fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }
}
