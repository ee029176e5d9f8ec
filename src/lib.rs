//! # riverscript: an embeddable tree-walking interpreter
//!
//! riverscript evaluates a dynamically typed scripting language inside a Rust
//! host. Scripts arrive as a statement tree, either built directly with the
//! [`ast`] constructors, produced by a host-supplied [`parser::Parser`], or
//! decoded from bytecode ([`codec`]). They are evaluated against a live, mutable
//! scope with two-way value exchange between script and host.
//!
//! ## Pipeline
//!
//! ```text
//! Source / Bytecode → Parser / Codec → Validate (optional) → Evaluator
//! ```
//!
//! ## Components
//!
//! - Statement and expression tree ([`ast`])
//! - Evaluation engine ([`eval`]): scopes, values, the host type bridge,
//!   channels, and resource governance
//! - Structural validation and free-symbol analysis ([`validate`])
//! - The embedding surface ([`engine::Engine`]) and its settings ([`config`])
//! - Errors for every stage ([`error`])
//!
//! ## Resource governance
//!
//! Every statement and expression is a checkpoint. A run observes its
//! [`eval::CancelSignal`] (manual or deadline based), accounts cycles, pauses
//! when an optional rate limit is exceeded, and fails fatally when more scopes
//! are alive than the configured ceiling allows.

pub mod ast;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod eval;
pub mod parser;
pub mod validate;

// Re-exports
pub use ast::*;
pub use config::EngineConfig;
pub use engine::{Engine, ScriptSource};
pub use error::*;
pub use eval::*;
pub use parser::{ParseError, Parser};
