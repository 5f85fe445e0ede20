mod ast;
mod cache;
mod compile;
mod context;
mod engine;
mod error;
mod expr;
mod lexer;
mod parser;
mod registry;
mod render;
mod value;

// Public exports.
pub use compile::CompiledTemplate;
pub use context::Context;
pub use engine::Engine;
pub use error::{Error, Result};
pub use registry::{FilterFn, FunctionFn, Registry};
pub use value::Value;
