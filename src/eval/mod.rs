//! riverscript evaluation system
//!
//! The evaluator walks the statement tree produced by a parser (or decoded from
//! bytecode) and executes it against a live [`scope::Scope`].
//!
//! # Core Components
//!
//! ## Evaluator
//! [`evaluator::Evaluator`] owns the per-run [`context::ExecutionContext`]. Its
//! methods are split by node family: [`statement`] for statements and control
//! flow, [`expression`] for expressions, [`function`] for calls, closures and
//! deferred calls.
//!
//! ## Values and the host bridge
//! [`value::Value`] is the closed set of script values. [`bridge`] converts them
//! to and from host types ([`bridge::HostType`]) whenever a value enters a typed
//! container or crosses a host function boundary.
//!
//! ## Resource governance
//! [`governor`] holds the cancellation signal, the rate limiter and the live
//! scope ceiling. The context consults them before every statement and
//! expression.
//!
//! ## Channels
//! [`channel::ChannelValue`] backs `make(chan T, n)`, `<-`, `select` and `go`.

pub mod bridge;
pub mod builtins;
pub mod channel;
pub mod context;
pub mod evaluator;
pub mod expression;
pub mod function;
pub mod governor;
pub mod operators;
pub mod scope;
pub mod statement;
pub mod value;

pub use bridge::{convert, HostType, IntKind, FloatKind, StructType};
pub use channel::ChannelValue;
pub use context::ExecutionContext;
pub use evaluator::{EvalError, EvalResult, Evaluator};
pub use function::CallContext;
pub use governor::{CancelSignal, Governor, RateLimiter};
pub use scope::Scope;
pub use statement::{ControlFlow, StatementResult};
pub use value::{Function, HostFunction, HostObject, HostStruct, ListValue, MapValue, Value};
