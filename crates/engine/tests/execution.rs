use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use engine::{
    EngineConfig, ExecutionEngine, InvocationEvent, PipelineExecutor, Stage, TelemetrySink,
};
use pipeline::{
    CapabilityDeclaration, Completion, ExecutionBudget, FaultKind, InputEnvelope,
    InvocationContext, ItemKind, Metadata, Outcome, OutcomeKind, ParameterMap, ParameterSchema,
    ParameterType, Payload, Permissions, Processor, ProcessorDescriptor, ProcessorFault,
    ProcessorName, ProcessorNamespace, ProcessorVersion, Prompt,
};
use serde_json::json;

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<InvocationEvent>>,
}

impl RecordingSink {
    fn events(&self) -> Vec<InvocationEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl TelemetrySink for RecordingSink {
    fn record(&self, event: &InvocationEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

#[derive(Clone)]
enum Action {
    Pass,
    Reject(&'static str),
    Modify(Payload),
    Tag(&'static str, &'static str),
    Metadata(&'static str, serde_json::Value),
    Sleep(Duration),
    Fail(&'static str),
    Panic(&'static str),
    /// Records the value of a per-request parameter as metadata.
    Echo(&'static str),
}

struct Scripted {
    descriptor: ProcessorDescriptor,
    action: Action,
    calls: AtomicUsize,
}

impl Scripted {
    fn new(name: &str, consumes: &[ItemKind], produces: &[ItemKind], action: Action) -> Arc<Self> {
        let capability =
            CapabilityDeclaration::declare(consumes.iter().copied(), produces.iter().copied())
                .unwrap();
        Arc::new(Self {
            descriptor: ProcessorDescriptor::new(
                ProcessorNamespace::new("test").unwrap(),
                ProcessorName::new(name).unwrap(),
                ProcessorVersion::new("v1").unwrap(),
                capability,
            ),
            action,
            calls: AtomicUsize::new(0),
        })
    }

    fn declaring(self: Arc<Self>, schema: ParameterSchema) -> Arc<Self> {
        let mut inner = Arc::into_inner(self).unwrap();
        inner.descriptor = inner.descriptor.with_parameters(schema);
        Arc::new(inner)
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Processor for Scripted {
    fn descriptor(&self) -> &ProcessorDescriptor {
        &self.descriptor
    }

    async fn process(
        &self,
        _envelope: &InputEnvelope,
        ctx: &mut InvocationContext,
    ) -> Result<(), ProcessorFault> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.action.clone() {
            Action::Pass => ctx.pass(),
            Action::Reject(reason) => ctx.reject(reason),
            Action::Modify(payload) => ctx.modify(payload),
            Action::Tag(key, value) => ctx.add_tag(key, [value])?,
            Action::Metadata(key, value) => ctx.insert_metadata(key, value)?,
            Action::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                ctx.pass();
            }
            Action::Fail(message) => return Err(message.into()),
            Action::Panic(message) => panic!("{message}"),
            Action::Echo(key) => {
                let value = ctx.parameters().get(key).cloned().unwrap_or_default();
                ctx.insert_metadata(key, value)?;
            }
        }
        Ok(())
    }
}

fn budget(ms: u64) -> ExecutionBudget {
    ExecutionBudget::new(Duration::from_millis(ms)).unwrap()
}

fn engine_with(sink: Arc<RecordingSink>) -> ExecutionEngine {
    ExecutionEngine::new(EngineConfig::new(budget(1_000)), sink)
}

fn prompt(text: &str) -> InputEnvelope {
    InputEnvelope::new(Prompt::from_text(text))
}

// ---------------------------------------------------------------------------
// Execution engine
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unconsumed_kind_is_skipped_without_invocation() {
    let sink = Arc::new(RecordingSink::default());
    let engine = engine_with(sink.clone());
    let processor = Scripted::new("responses-only", &[ItemKind::Response], &[], Action::Reject("no"));

    let result = engine.execute(&prompt("hi"), processor.as_ref(), budget(100)).await;
    let again = engine.execute(&prompt("hi"), processor.as_ref(), budget(100)).await;

    assert_eq!(result.outcome(), &Outcome::Pass);
    assert_eq!(again.outcome(), &Outcome::Pass);
    assert_eq!(processor.calls(), 0);
    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.skipped));
}

#[tokio::test]
async fn exceeding_the_budget_is_a_timeout_error() {
    let sink = Arc::new(RecordingSink::default());
    let engine = engine_with(sink.clone());
    let processor = Scripted::new(
        "slow",
        &[ItemKind::Prompt],
        &[],
        Action::Sleep(Duration::from_millis(500)),
    );

    let result = engine.execute(&prompt("hi"), processor.as_ref(), budget(200)).await;

    match result.outcome() {
        Outcome::Error(fault) => assert_eq!(fault.kind, FaultKind::Timeout),
        other => panic!("expected timeout, got {other:?}"),
    }
    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].outcome, OutcomeKind::Error);
    assert!(events[0].duration < Duration::from_millis(500));
}

#[tokio::test]
async fn panics_are_contained_as_unhandled_errors() {
    let engine = engine_with(Arc::new(RecordingSink::default()));
    let processor = Scripted::new("panicky", &[ItemKind::Prompt], &[], Action::Panic("kaboom"));

    let result = engine.execute(&prompt("hi"), processor.as_ref(), budget(100)).await;

    match result.outcome() {
        Outcome::Error(fault) => {
            assert_eq!(fault.kind, FaultKind::Unhandled);
            assert!(fault.detail.contains("kaboom"));
        }
        other => panic!("expected unhandled error, got {other:?}"),
    }
}

#[tokio::test]
async fn returned_errors_are_contained_as_unhandled_errors() {
    let engine = engine_with(Arc::new(RecordingSink::default()));
    let processor = Scripted::new("failing", &[ItemKind::Prompt], &[], Action::Fail("upstream down"));

    let result = engine.execute(&prompt("hi"), processor.as_ref(), budget(100)).await;

    assert!(matches!(
        result.outcome(),
        Outcome::Error(fault) if fault.kind == FaultKind::Unhandled && fault.detail == "upstream down"
    ));
}

#[tokio::test]
async fn undeclared_modification_kind_is_rejected_as_error() {
    let engine = engine_with(Arc::new(RecordingSink::default()));
    let processor = Scripted::new(
        "sneaky",
        &[ItemKind::Prompt],
        &[],
        Action::Modify(Payload::from(Prompt::from_text("rewritten"))),
    );

    let result = engine.execute(&prompt("hi"), processor.as_ref(), budget(100)).await;

    assert!(matches!(
        result.outcome(),
        Outcome::Error(fault) if fault.kind == FaultKind::InvalidProduceKind
    ));
}

// ---------------------------------------------------------------------------
// Pipeline executor
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reject_stops_later_stages() {
    let engine = engine_with(Arc::new(RecordingSink::default()));
    let first = Scripted::new("first", &[ItemKind::Prompt], &[], Action::Tag("seen", "first"));
    let second = Scripted::new("second", &[ItemKind::Prompt], &[], Action::Reject("blocked"));
    let third = Scripted::new("third", &[ItemKind::Prompt], &[], Action::Pass);

    let executor = PipelineExecutor::new(
        engine,
        vec![
            Stage::new(first.clone()),
            Stage::new(second.clone()),
            Stage::new(third.clone()),
        ],
    )
    .unwrap();
    let result = executor.run(prompt("hi")).await;

    assert!(matches!(result.outcome, Outcome::Reject(_)));
    assert_eq!((first.calls(), second.calls(), third.calls()), (1, 1, 0));
    assert_eq!(result.tags_added.get("seen").unwrap(), ["first"]);
    assert_eq!(result.provenance.len(), 2);
}

#[tokio::test]
async fn equal_metadata_from_two_stages_collides() {
    let engine = engine_with(Arc::new(RecordingSink::default()));
    let a = Scripted::new("a", &[ItemKind::Prompt], &[], Action::Metadata("verdict", json!("ok")));
    let b = Scripted::new("b", &[ItemKind::Prompt], &[], Action::Metadata("verdict", json!("ok")));
    let c = Scripted::new("c", &[ItemKind::Prompt], &[], Action::Pass);

    let executor =
        PipelineExecutor::new(engine, vec![Stage::new(a), Stage::new(b), Stage::new(c.clone())])
            .unwrap();
    let result = executor.run(prompt("hi")).await;

    assert!(matches!(
        result.outcome,
        Outcome::Error(ref fault) if fault.kind == FaultKind::MetadataCollision
    ));
    assert_eq!(c.calls(), 0);
    assert_eq!(result.metadata_added.get("verdict"), Some(&json!("ok")));
}

#[tokio::test]
async fn overlapping_tags_depend_on_stage_order() {
    async fn run(names: [&'static str; 2]) -> pipeline::Tags {
        let engine = engine_with(Arc::new(RecordingSink::default()));
        let stages = names
            .into_iter()
            .map(|n| {
                Stage::new(Scripted::new(n, &[ItemKind::Prompt], &[], Action::Tag("topic", n))
                    as Arc<dyn Processor>)
            })
            .collect();
        PipelineExecutor::new(engine, stages)
            .unwrap()
            .run(prompt("hi"))
            .await
            .tags_added
    }

    let ab = run(["a", "b"]).await;
    let ba = run(["b", "a"]).await;
    assert_ne!(ab, ba);
    assert_eq!(ab.get("topic").unwrap(), ["a", "b"]);
}

#[tokio::test]
async fn disjoint_tags_are_order_independent() {
    async fn run(order: [(&'static str, &'static str); 2]) -> pipeline::Tags {
        let engine = engine_with(Arc::new(RecordingSink::default()));
        let stages = order
            .into_iter()
            .map(|(name, key)| {
                Stage::new(
                    Scripted::new(name, &[ItemKind::Prompt], &[], Action::Tag(key, "yes"))
                        as Arc<dyn Processor>,
                )
            })
            .collect();
        PipelineExecutor::new(engine, stages)
            .unwrap()
            .run(prompt("hi"))
            .await
            .tags_added
    }

    let ab = run([("a", "lang"), ("b", "topic")]).await;
    let ba = run([("b", "topic"), ("a", "lang")]).await;
    assert_eq!(ab, ba);
}

#[tokio::test]
async fn modification_is_visible_to_later_stages() {
    struct Expect {
        descriptor: ProcessorDescriptor,
    }

    #[async_trait]
    impl Processor for Expect {
        fn descriptor(&self) -> &ProcessorDescriptor {
            &self.descriptor
        }

        async fn process(
            &self,
            envelope: &InputEnvelope,
            ctx: &mut InvocationContext,
        ) -> Result<(), ProcessorFault> {
            let text = envelope.payload().as_response().and_then(Completion::text);
            ctx.insert_metadata("seen_text", json!(text))?;
            Ok(())
        }
    }

    let engine = engine_with(Arc::new(RecordingSink::default()));
    let rewrite = Scripted::new(
        "rewrite",
        &[ItemKind::Response],
        &[ItemKind::Response],
        Action::Modify(Payload::from(Completion::from_text("after"))),
    );
    let expect = Arc::new(Expect {
        descriptor: ProcessorDescriptor::new(
            ProcessorNamespace::new("test").unwrap(),
            ProcessorName::new("expect").unwrap(),
            ProcessorVersion::new("v1").unwrap(),
            CapabilityDeclaration::declare([ItemKind::Response], []).unwrap(),
        ),
    });

    let executor =
        PipelineExecutor::new(engine, vec![Stage::new(rewrite), Stage::new(expect)]).unwrap();
    let result = executor
        .run(InputEnvelope::new(Completion::from_text("before")))
        .await;

    assert_eq!(
        result.outcome,
        Outcome::Modify(Payload::from(Completion::from_text("after")))
    );
    assert_eq!(result.metadata_added.get("seen_text"), Some(&json!("after")));
}

#[tokio::test]
async fn parameters_modification_leaves_prompt_for_later_stages() {
    let sink = Arc::new(RecordingSink::default());
    let parameters: ParameterMap = [("temperature".to_string(), json!(0.1))].into();
    let tune = Scripted::new(
        "tune",
        &[ItemKind::Prompt],
        &[ItemKind::Parameters],
        Action::Modify(Payload::Parameters(parameters.clone())),
    );
    let inspect = Scripted::new("inspect", &[ItemKind::Prompt], &[], Action::Pass);
    let executor = PipelineExecutor::new(
        engine_with(sink),
        vec![Stage::new(tune), Stage::new(inspect.clone())],
    )
    .unwrap();

    let result = executor.run(prompt("hello")).await;

    assert_eq!(inspect.calls(), 1);
    assert_eq!(result.outcome, Outcome::Modify(Payload::Parameters(parameters.clone())));
    assert_eq!(result.modifications, vec![Payload::Parameters(parameters)]);
    assert_eq!(result.provenance.len(), 2);
    assert_eq!(result.provenance[1].outcome, OutcomeKind::Pass);
}

#[tokio::test]
async fn per_request_parameters_reach_declaring_stages_only() {
    let sink = Arc::new(RecordingSink::default());
    let schema = ParameterSchema::new().field(
        "level",
        ParameterType::Integer {
            minimum: Some(0),
            maximum: None,
        },
        "",
    );
    let declares =
        Scripted::new("declares", &[ItemKind::Prompt], &[], Action::Echo("level")).declaring(schema);
    let ignores = Scripted::new("ignores", &[ItemKind::Prompt], &[], Action::Echo("other"));
    let executor = PipelineExecutor::new(
        engine_with(sink.clone()),
        vec![Stage::new(declares.clone()), Stage::new(ignores)],
    )
    .unwrap();
    let request: ParameterMap = [
        ("level".to_string(), json!(3)),
        ("other".to_string(), json!("x")),
    ]
    .into();

    let result = executor
        .run_within(prompt("hi"), budget(1_000), Permissions::default(), &request)
        .await;
    assert_eq!(result.metadata_added.get("level"), Some(&json!(3)));
    assert_eq!(result.metadata_added.get("other"), Some(&serde_json::Value::Null));

    let direct = engine_with(sink)
        .execute_with_parameters(
            &prompt("hi"),
            declares.as_ref(),
            budget(100),
            Permissions::default(),
            [("level".to_string(), json!(7))].into(),
        )
        .await;
    assert_eq!(direct.metadata_added().get("level"), Some(&json!(7)));
}

#[tokio::test]
async fn timeout_leaves_prior_snapshot_intact() {
    let engine = engine_with(Arc::new(RecordingSink::default()));
    let tagger = Scripted::new("tagger", &[ItemKind::Prompt], &[], Action::Metadata("step", json!(1)));
    let slow = Scripted::new(
        "slow",
        &[ItemKind::Prompt],
        &[],
        Action::Sleep(Duration::from_millis(500)),
    );

    let executor =
        PipelineExecutor::new(engine, vec![Stage::new(tagger), Stage::new(slow)]).unwrap();
    let result = executor.run_with_budget(prompt("hi"), budget(200)).await;

    assert!(matches!(
        result.outcome,
        Outcome::Error(ref fault) if fault.kind == FaultKind::Timeout
    ));
    let expected: Metadata = [("step".to_string(), json!(1))].into_iter().collect();
    assert_eq!(result.metadata_added, expected);
}

#[tokio::test]
async fn exhausted_request_budget_halts_before_next_stage() {
    let engine = engine_with(Arc::new(RecordingSink::default()));
    let slow = Scripted::new(
        "slow",
        &[ItemKind::Prompt],
        &[],
        Action::Sleep(Duration::from_millis(150)),
    );
    let never = Scripted::new("never", &[ItemKind::Prompt], &[], Action::Pass);

    let request_budget = budget(1_000)
        .with_request_timeout(Duration::from_millis(100))
        .unwrap();
    let executor =
        PipelineExecutor::new(engine, vec![Stage::new(slow), Stage::new(never.clone())]).unwrap();
    let result = executor.run_with_budget(prompt("hi"), request_budget).await;

    assert!(matches!(
        result.outcome,
        Outcome::Error(ref fault) if fault.kind == FaultKind::Timeout
    ));
    assert_eq!(never.calls(), 0);
}

#[tokio::test]
async fn duplicate_processor_ids_are_a_configuration_error() {
    let engine = engine_with(Arc::new(RecordingSink::default()));
    let a = Scripted::new("same", &[ItemKind::Prompt], &[], Action::Pass);
    let b = Scripted::new("same", &[ItemKind::Prompt], &[], Action::Pass);

    let err = PipelineExecutor::new(engine, vec![Stage::new(a), Stage::new(b)]).unwrap_err();
    assert!(matches!(err, pipeline::PipelineError::ConfigurationError { .. }));
}

#[tokio::test]
async fn independent_requests_run_concurrently() {
    let engine = engine_with(Arc::new(RecordingSink::default()));
    let slow = Scripted::new(
        "slow",
        &[ItemKind::Prompt],
        &[],
        Action::Sleep(Duration::from_millis(100)),
    );
    let executor = Arc::new(PipelineExecutor::new(engine, vec![Stage::new(slow.clone())]).unwrap());

    let started = std::time::Instant::now();
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let executor = executor.clone();
            tokio::spawn(async move { executor.run(prompt(&format!("request {i}"))).await })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap().outcome, Outcome::Pass);
    }

    assert_eq!(slow.calls(), 8);
    assert!(started.elapsed() < Duration::from_millis(800));
}
