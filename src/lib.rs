//! qbind - bind calls to declarative query functions and run them

pub mod binder;
pub mod chain;
pub mod config;
pub mod definition;
pub mod engine;
pub mod error;
pub mod event_log;
pub mod postprocess;
pub mod query;
pub mod result;
pub mod scope;
pub mod signature;
pub mod sink;
pub mod template;
pub mod value;

pub use binder::{bind, BoundArguments, FunctionContext};
pub use chain::ChainAdapter;
pub use config::QbindConfig;
pub use definition::{QueryDefinition, QueryFile};
pub use engine::{create_engine_factory, Engine, EngineFactory, EngineGuard};
pub use error::{FixSuggestion, QueryError};
pub use event_log::{Event, EventKind, EventLog};
pub use postprocess::{ConditionalDistribution, GroupBy, Postprocessor};
pub use query::{Phase, QueryFunction};
pub use result::{QueryResult, Results};
pub use scope::{BuiltinTable, EmptyScope, LexicalContext, Namespace, OnMissing, VariableScope};
pub use signature::{Parameter, Signature};
pub use sink::{OutputSink, SharedSink};
pub use template::CompiledTemplate;
pub use value::{CallArgs, Kwargs, Value};
