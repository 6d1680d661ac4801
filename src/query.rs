//! Query functions and their invocation lifecycle
//!
//! A [`QueryFunction`] wraps a compiled template together with everything
//! needed to call it like a function. One call walks the phases
//!
//! ```text
//! Defined → Invoking → Bound → Executing → Postprocessing → Completed
//!              └──────────┴─────────┴─────────────┴──→ Failed
//! ```
//!
//! Binding finishes before any engine exists, so a bad call has no side
//! effects. Each call gets its own engine, released on every exit path.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::binder::{self, BoundArguments, FunctionContext};
use crate::chain::ChainAdapter;
use crate::engine::{EngineFactory, EngineGuard};
use crate::error::{QueryError, Result};
use crate::event_log::{EventKind, EventLog};
use crate::postprocess::{ConditionalDistribution, Postprocessor};
use crate::result::Results;
use crate::sink::{sink_value, SharedSink, OUTPUT_WRITER_ARG};
use crate::template::CompiledTemplate;
use crate::value::{CallArgs, Value};

/// Parameter name the engine reserves for itself
pub const SELF_PARAM: &str = "self";
/// Name a `self` query parameter is passed under
pub const RENAMED_SELF_PARAM: &str = "__self__";
/// Signature parameter hidden from `input_keys`
const CONTEXT_PARAM: &str = "context";

/// Lifecycle phase of one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Defined,
    Invoking,
    Bound,
    Executing,
    Postprocessing,
    Completed,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Defined => "defined",
            Phase::Invoking => "invoking",
            Phase::Bound => "bound",
            Phase::Executing => "executing",
            Phase::Postprocessing => "postprocessing",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A callable query: compiled template + binding + execution lifecycle
#[derive(Clone)]
pub struct QueryFunction {
    name: String,
    template: Arc<CompiledTemplate>,
    output_variables: Vec<String>,
    postprocessors: Arc<[Arc<dyn Postprocessor>]>,
    engine_factory: Arc<dyn EngineFactory>,
    forced_model: Option<String>,
    output_sink: Option<SharedSink>,
    /// Attached once, before the first call
    context: Option<FunctionContext>,
    events: Option<EventLog>,
}

impl QueryFunction {
    pub fn new(
        template: CompiledTemplate,
        output_variables: Vec<String>,
        postprocessors: Vec<Arc<dyn Postprocessor>>,
        engine_factory: Arc<dyn EngineFactory>,
    ) -> Self {
        Self {
            name: template.name().to_string(),
            template: Arc::new(template),
            output_variables,
            postprocessors: postprocessors.into(),
            engine_factory,
            forced_model: None,
            output_sink: None,
            context: None,
            events: None,
        }
    }

    pub fn with_context(mut self, context: FunctionContext) -> Result<Self> {
        self.attach_context(context)?;
        Ok(self)
    }

    /// Set the function context; a second attach is rejected
    pub fn attach_context(&mut self, context: FunctionContext) -> Result<()> {
        if self.context.is_some() {
            return Err(QueryError::Definition {
                reason: format!("query function '{}' already has a function context", self.name),
            });
        }
        self.context = Some(context);
        Ok(())
    }

    pub fn with_event_log(mut self, log: EventLog) -> Self {
        self.events = Some(log);
        self
    }

    /// Run every call on `model` instead of the engine default
    pub fn force_model(&mut self, model: impl Into<String>) {
        self.forced_model = Some(model.into());
    }

    pub fn set_output_sink(&mut self, sink: SharedSink) {
        self.output_sink = Some(sink);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn template(&self) -> &CompiledTemplate {
        &self.template
    }

    pub fn context(&self) -> Option<&FunctionContext> {
        self.context.as_ref()
    }

    pub fn forced_model(&self) -> Option<&str> {
        self.forced_model.as_deref()
    }

    pub fn postprocessors(&self) -> &[Arc<dyn Postprocessor>] {
        &self.postprocessors
    }

    pub fn engine_name(&self) -> &str {
        self.engine_factory.name()
    }

    /// Signature parameter names, without `context`
    pub fn input_keys(&self) -> Vec<String> {
        self.context
            .as_ref()
            .map(|ctx| {
                ctx.signature
                    .names()
                    .filter(|n| *n != CONTEXT_PARAM)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn output_keys(&self) -> &[String] {
        &self.output_variables
    }

    /// Bind a call without running it
    pub fn make_kwargs(&self, args: &CallArgs) -> Result<BoundArguments> {
        let context = self.context.as_ref().ok_or_else(|| QueryError::MissingContext {
            query: self.name.clone(),
        })?;
        binder::bind(context, &self.name, args)
    }

    /// Adapter for external chaining; output keys default to the declared
    /// output variables
    pub fn as_chain(self: &Arc<Self>, output_keys: Option<Vec<String>>) -> ChainAdapter {
        ChainAdapter::new(Arc::clone(self), output_keys)
    }

    /// Invoke the query
    #[instrument(skip(self, args), fields(query = %self.name, engine = %self.engine_factory.name()))]
    pub async fn call(&self, args: CallArgs) -> Result<Results> {
        let invocation = self.events.as_ref().map(EventLog::begin_invocation);
        let started = Instant::now();
        self.emit(invocation, |invocation| EventKind::InvocationStarted {
            invocation,
            query: Arc::from(self.name.as_str()),
            positional: args.positional.len(),
            keywords: args.keyword.keys().cloned().collect(),
        });

        let mut phase = Phase::Invoking;
        let outcome = self.invoke(args, invocation, &mut phase).await;

        match &outcome {
            Ok(results) => {
                debug!(results = results.len(), "query completed");
                self.emit(invocation, |invocation| EventKind::InvocationCompleted {
                    invocation,
                    result_count: results.len(),
                    duration_ms: started.elapsed().as_millis() as u64,
                });
            }
            Err(e) => {
                warn!(%phase, error = %e, "query failed");
                self.emit(invocation, |invocation| EventKind::InvocationFailed {
                    invocation,
                    phase,
                    error: e.to_string(),
                });
            }
        }
        outcome
    }

    async fn invoke(
        &self,
        args: CallArgs,
        invocation: Option<u64>,
        phase: &mut Phase,
    ) -> Result<Results> {
        let BoundArguments {
            mut query_kwargs,
            mut runtime_kwargs,
        } = self.make_kwargs(&args)?;
        *phase = Phase::Bound;
        debug!(
            query_params = query_kwargs.len(),
            runtime_params = runtime_kwargs.len(),
            "arguments bound"
        );
        self.emit(invocation, |invocation| EventKind::ArgumentsBound {
            invocation,
            query_kwargs: Value::Record(query_kwargs.clone()).to_json(),
            runtime_keys: runtime_kwargs.keys().cloned().collect(),
        });

        if let Some(sink) = &self.output_sink {
            runtime_kwargs.insert(OUTPUT_WRITER_ARG.to_string(), sink_value(sink));
        }

        let mut engine = EngineGuard::new(
            self.engine_factory
                .create(self.forced_model.as_deref())?,
        );
        if let (Some(log), Some(id)) = (&self.events, invocation) {
            engine = engine.with_events(log.clone(), id);
        }
        self.emit(invocation, |invocation| EventKind::EngineCreated {
            invocation,
            engine: engine.name().to_string(),
            model: engine.model().map(str::to_string),
        });
        engine.set_extra_args(runtime_kwargs);

        if let Some(value) = query_kwargs.remove(SELF_PARAM) {
            query_kwargs.insert(RENAMED_SELF_PARAM.to_string(), value);
        }

        *phase = Phase::Executing;
        let results = engine.run(&self.template, query_kwargs).await?;
        self.emit(invocation, |invocation| EventKind::EngineFinished {
            invocation,
            result_count: results.len(),
        });

        *phase = Phase::Postprocessing;
        let distribution = ConditionalDistribution::from_engine(&*engine);
        let mut results = distribution.process(results).await?;
        for postprocessor in self.postprocessors.iter() {
            results = postprocessor
                .process(results, self.output_sink.as_ref())
                .await?;
            self.emit(invocation, |invocation| EventKind::PostprocessorApplied {
                invocation,
                postprocessor: postprocessor.name().to_string(),
                result_count: results.len(),
            });
        }

        engine.print_stats();
        engine.release();
        *phase = Phase::Completed;
        Ok(results)
    }

    fn emit(&self, invocation: Option<u64>, kind: impl FnOnce(u64) -> EventKind) {
        if let (Some(log), Some(id)) = (&self.events, invocation) {
            log.emit(kind(id));
        }
    }
}

impl fmt::Debug for QueryFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryFunction")
            .field("name", &self.name)
            .field("output_variables", &self.output_variables)
            .field("postprocessors", &self.postprocessors)
            .field("engine", &self.engine_factory.name())
            .field("forced_model", &self.forced_model)
            .field("has_context", &self.context.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockEngineFactory;
    use crate::postprocess::GroupBy;
    use crate::scope::{BuiltinTable, EmptyScope, LexicalContext, Namespace};
    use crate::signature::Signature;
    use crate::sink::BufferSink;
    use crate::value::Kwargs;

    fn query(source: &str, sig: &str, factory: &MockEngineFactory) -> QueryFunction {
        let template = CompiledTemplate::compile("q", source).unwrap();
        let outputs = template.outputs();
        let params = template.inputs();
        let scope = LexicalContext::new(
            "q",
            Namespace::new().with("tone", "warm"),
            Namespace::new(),
            Arc::new(BuiltinTable::standard()),
        );
        QueryFunction::new(template, outputs, vec![], Arc::new(factory.clone()))
            .with_context(FunctionContext::new(
                Signature::parse(sig).unwrap(),
                params,
                Arc::new(scope),
            ))
            .unwrap()
    }

    fn empty_context() -> FunctionContext {
        FunctionContext::new(
            Signature::empty(),
            Vec::<String>::new(),
            Arc::new(EmptyScope::new("q")),
        )
    }

    /// Appends its tag to every prompt
    #[derive(Debug)]
    struct Tag(&'static str);

    #[async_trait::async_trait]
    impl Postprocessor for Tag {
        fn name(&self) -> &str {
            self.0
        }

        async fn process(&self, results: Results, _sink: Option<&SharedSink>) -> Result<Results> {
            match results {
                Results::List(list) => Ok(Results::List(
                    list.into_iter()
                        .map(|mut r| {
                            r.prompt.push_str(self.0);
                            r
                        })
                        .collect(),
                )),
                grouped => Ok(grouped),
            }
        }
    }

    #[tokio::test]
    async fn call_without_context_fails_before_engine() {
        let factory = MockEngineFactory::new();
        let template = CompiledTemplate::compile("q", "[X]").unwrap();
        let q = QueryFunction::new(template, vec![], vec![], Arc::new(factory.clone()));

        let err = q.call(CallArgs::new()).await.unwrap_err();
        assert!(matches!(err, QueryError::MissingContext { .. }));
        assert_eq!(factory.record().created, 0);
    }

    #[tokio::test]
    async fn call_runs_full_lifecycle() {
        let factory = MockEngineFactory::new().with_default("ok");
        let q = query("{{name}} in a {{tone}} voice: [REPLY]", "(name)", &factory);

        let results = q.call(CallArgs::new().arg("Ada")).await.unwrap();
        assert_eq!(results.first().unwrap().prompt, "Ada in a warm voice: ok");

        let record = factory.record();
        assert_eq!(record.created, 1);
        assert_eq!(record.closed, 1);
        assert_eq!(record.runs[0].get("tone"), Some(&Value::from("warm")));
    }

    #[tokio::test]
    async fn binding_failure_creates_no_engine() {
        let factory = MockEngineFactory::new();
        let q = query("{{name}} {{missing}}", "(name)", &factory);

        let err = q.call(CallArgs::new().arg("x")).await.unwrap_err();
        assert!(matches!(err, QueryError::UnresolvedVariable { .. }));
        assert_eq!(factory.record().created, 0);
    }

    #[tokio::test]
    async fn self_parameter_is_renamed() {
        let factory = MockEngineFactory::new();
        let q = query("{{self}} [X]", "(self)", &factory);

        q.call(CallArgs::new().arg("me")).await.unwrap();
        let run = &factory.record().runs[0];
        assert!(!run.contains_key(SELF_PARAM));
        assert_eq!(run.get(RENAMED_SELF_PARAM), Some(&Value::from("me")));
    }

    #[tokio::test]
    async fn output_sink_and_runtime_args_reach_engine() {
        let factory = MockEngineFactory::new();
        let mut q = query("{{name}} [X]", "(name)", &factory);
        let buffer = BufferSink::new();
        q.set_output_sink(Arc::new(buffer.clone()));
        q.force_model("tiny");

        q.call(CallArgs::new().arg("a").kwarg("temperature", 0.2))
            .await
            .unwrap();

        let record = factory.record();
        let extra = &record.extra_args[0];
        assert!(extra.contains_key("temperature"));
        assert!(extra.contains_key(OUTPUT_WRITER_ARG));
        assert_eq!(record.forced_models, vec![Some("tiny".to_string())]);
        assert_eq!(buffer.lines(), vec!["a Mock response"]);
    }

    #[tokio::test]
    async fn engine_failure_still_releases_engine() {
        let factory = MockEngineFactory::new();
        factory.queue_failure("model unavailable");
        let q = query("{{name}} [X]", "(name)", &factory);

        let err = q.call(CallArgs::new().arg("a")).await.unwrap_err();
        assert!(matches!(err, QueryError::Engine(ref m) if m == "model unavailable"));
        assert_eq!(factory.record().closed, 1);
    }

    #[tokio::test]
    async fn postprocessors_run_in_order_after_engine() {
        let factory = MockEngineFactory::new();
        factory.queue_outputs(Kwargs::from([("LABEL".to_string(), Value::from("x"))]));
        let template = CompiledTemplate::compile("q", "[LABEL]").unwrap();
        let q = QueryFunction::new(
            template,
            vec!["LABEL".into()],
            vec![Arc::new(GroupBy::new("LABEL"))],
            Arc::new(factory.clone()),
        )
        .with_context(empty_context())
        .unwrap();

        let results = q.call(CallArgs::new()).await.unwrap();
        assert!(matches!(results, Results::Grouped(ref g) if g.contains_key("x")));
    }

    #[tokio::test]
    async fn postprocessors_apply_in_declared_order() {
        let factory = MockEngineFactory::new();
        let template = CompiledTemplate::compile("q", "[X]").unwrap();
        let q = QueryFunction::new(
            template,
            vec!["X".into()],
            vec![Arc::new(Tag("1")), Arc::new(Tag("2"))],
            Arc::new(factory.clone()),
        )
        .with_context(empty_context())
        .unwrap();

        let names: Vec<&str> = q.postprocessors().iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["1", "2"]);

        let results = q.call(CallArgs::new()).await.unwrap();
        assert_eq!(results.first().unwrap().prompt, "Mock response12");
    }

    #[tokio::test]
    async fn postprocessor_failure_still_releases_engine() {
        let factory = MockEngineFactory::new();
        factory.queue_outputs(Kwargs::from([("LABEL".to_string(), Value::from("x"))]));
        let template = CompiledTemplate::compile("q", "[LABEL]").unwrap();
        let log = EventLog::new();
        let q = QueryFunction::new(
            template,
            vec!["LABEL".into()],
            vec![Arc::new(GroupBy::new("LABEL")), Arc::new(GroupBy::new("LABEL"))],
            Arc::new(factory.clone()),
        )
        .with_context(empty_context())
        .unwrap()
        .with_event_log(log.clone());

        let err = q.call(CallArgs::new()).await.unwrap_err();
        assert!(matches!(err, QueryError::Postprocess { .. }));

        let record = factory.record();
        assert_eq!(record.created, 1);
        assert_eq!(record.closed, 1);
        let last = log.events().pop().unwrap();
        assert!(matches!(
            last.kind,
            EventKind::InvocationFailed { phase: Phase::Postprocessing, .. }
        ));
    }

    #[test]
    fn context_attaches_only_once() {
        let factory = MockEngineFactory::new();
        let mut q = query("{{a}}", "(a)", &factory);

        let err = q.attach_context(empty_context()).unwrap_err();
        assert!(matches!(err, QueryError::Definition { ref reason } if reason.contains("'q'")));
        assert_eq!(q.context().unwrap().signature.to_string(), "(a)");
    }

    #[tokio::test]
    async fn events_trace_each_phase() {
        let factory = MockEngineFactory::new();
        let log = EventLog::new();
        let q = query("{{name}} [X]", "(name)", &factory).with_event_log(log.clone());

        q.call(CallArgs::new().arg("a")).await.unwrap();
        let kinds: Vec<_> = log
            .filter_invocation(0)
            .into_iter()
            .map(|e| serde_json::to_value(&e.kind).unwrap()["type"].clone())
            .collect();
        assert_eq!(
            kinds,
            vec![
                "invocation_started",
                "arguments_bound",
                "engine_created",
                "engine_finished",
                "engine_released",
                "invocation_completed",
            ]
        );
    }

    #[tokio::test]
    async fn failure_event_records_phase() {
        let factory = MockEngineFactory::new();
        factory.queue_failure("boom");
        let log = EventLog::new();
        let q = query("{{name}} [X]", "(name)", &factory).with_event_log(log.clone());

        q.call(CallArgs::new().arg("a")).await.unwrap_err();
        let last = log.events().pop().unwrap();
        assert!(matches!(
            last.kind,
            EventKind::InvocationFailed { phase: Phase::Executing, .. }
        ));
    }

    #[test]
    fn input_keys_skip_context_param() {
        let factory = MockEngineFactory::new();
        let q = query("{{a}}", "(a, context=null)", &factory);
        assert_eq!(q.input_keys(), vec!["a"]);
    }
}
