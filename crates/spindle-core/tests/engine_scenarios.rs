use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tempfile::TempDir;

use spindle_core::domain::JobMutation;
use spindle_core::impls::BroadcastEventSink;
use spindle_core::ports::ManualClock;
use spindle_core::wal::Wal;
use spindle_core::{
    Arguments, CancelOutcome, Engine, EngineBuilder, EngineConfig, Handler, HandlerError, JobContext, JobEnvelope,
    JobEventKind, JobId, JobState, PerformMiddleware, PerformNext, PerformOutcome, SpindleError, SubmitContext,
    SubmitMiddleware, SubmitNext, SubmitOutcome, Task, TaskType,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SendEmail {
    to: String,
}

impl Task for SendEmail {
    const TYPE: &'static str = "send_email";
}

#[derive(Default)]
struct SendEmailHandler {
    sent: Mutex<Vec<String>>,
}

#[async_trait]
impl Handler<SendEmail> for Arc<SendEmailHandler> {
    async fn handle(&self, task: SendEmail, _ctx: &JobContext) -> Result<(), HandlerError> {
        self.sent.lock().unwrap().push(task.to);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChargeCard {
    cents: u64,
}

impl Task for ChargeCard {
    const TYPE: &'static str = "charge_card";
}

/// Declines the first `failures` attempts.
struct ChargeCardHandler {
    failures: u32,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Handler<ChargeCard> for ChargeCardHandler {
    async fn handle(&self, _task: ChargeCard, _ctx: &JobContext) -> Result<(), HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            Err(HandlerError::new(format!("card declined (call {call})")))
        } else {
            Ok(())
        }
    }
}

struct Harness {
    dir: TempDir,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            clock: Arc::new(ManualClock::new(Utc::now())),
        }
    }

    fn config(&self) -> EngineConfig {
        let mut cfg = EngineConfig::default().with_wal_path(self.dir.path().join("spindle.wal"));
        cfg.retry.max_attempts = 3;
        cfg.retry.base_delay_ms = 1_000;
        cfg.poll_interval_ms = 20;
        cfg
    }

    fn builder(&self) -> EngineBuilder {
        self.builder_with(self.config())
    }

    fn builder_with(&self, config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config).clock(self.clock.clone())
    }

    fn now(&self) -> DateTime<Utc> {
        use spindle_core::ports::Clock;
        self.clock.now()
    }

    fn advance(&self, by: TimeDelta) {
        self.clock.advance(by);
    }
}

fn email(to: &str) -> SendEmail {
    SendEmail { to: to.to_string() }
}

fn enqueued(outcome: SubmitOutcome) -> JobId {
    match outcome {
        SubmitOutcome::Enqueued(job_id) => job_id,
        SubmitOutcome::Halted => panic!("submission was halted"),
    }
}

async fn job(engine: &Engine, job_id: JobId) -> JobEnvelope {
    engine.job(job_id).await.expect("job should exist")
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn send_email_completes_in_one_dispatch_cycle() {
    let h = Harness::new();
    let handler = Arc::new(SendEmailHandler::default());
    let events = BroadcastEventSink::new(16);
    let mut rx = events.subscribe();
    let engine = h
        .builder()
        .register::<SendEmail, _>(Arc::clone(&handler))
        .unwrap()
        .event_sink(Arc::new(events))
        .open()
        .await
        .unwrap();

    let job_id = enqueued(engine.submit_task(&email("a@example.com"), None).await.unwrap());
    let report = engine.tick().await;

    assert_eq!(report.claimed, 1);
    assert_eq!(report.completed, 1);
    let env = job(&engine, job_id).await;
    assert_eq!(env.state, JobState::Completed);
    assert_eq!(env.attempt_count, 1);
    assert_eq!(*handler.sent.lock().unwrap(), vec!["a@example.com"]);

    let kinds: Vec<JobEventKind> = std::iter::from_fn(|| rx.try_recv().ok()).map(|e| e.kind).collect();
    assert_eq!(kinds, vec![JobEventKind::Submitted, JobEventKind::Claimed, JobEventKind::Completed]);
}

#[tokio::test]
async fn charge_card_fails_twice_then_succeeds() {
    let h = Harness::new();
    let calls = Arc::new(AtomicU32::new(0));
    let engine = h
        .builder()
        .register::<ChargeCard, _>(ChargeCardHandler {
            failures: 2,
            calls: Arc::clone(&calls),
        })
        .unwrap()
        .open()
        .await
        .unwrap();

    let job_id = enqueued(engine.submit_task(&ChargeCard { cents: 1_999 }, None).await.unwrap());

    let report = engine.tick().await;
    assert_eq!(report.retrying, 1);
    let env = job(&engine, job_id).await;
    assert_eq!(env.state, JobState::Scheduled);
    assert_eq!(env.due_at, Some(h.now() + TimeDelta::seconds(1)));
    assert!(env.last_error.as_deref().unwrap().contains("declined"));

    // backoff not elapsed yet
    assert_eq!(engine.tick().await.claimed, 0);

    h.advance(TimeDelta::seconds(1));
    assert_eq!(engine.tick().await.retrying, 1);
    assert_eq!(job(&engine, job_id).await.due_at, Some(h.now() + TimeDelta::seconds(2)));

    h.advance(TimeDelta::seconds(2));
    assert_eq!(engine.tick().await.completed, 1);

    let env = job(&engine, job_id).await;
    assert_eq!(env.state, JobState::Completed);
    assert_eq!(env.attempt_count, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn delayed_job_waits_for_its_due_time() {
    let h = Harness::new();
    let engine = h
        .builder()
        .register::<SendEmail, _>(Arc::new(SendEmailHandler::default()))
        .unwrap()
        .open()
        .await
        .unwrap();

    let due_at = h.now() + TimeDelta::minutes(5);
    let job_id = enqueued(engine.submit_task(&email("later@example.com"), Some(due_at)).await.unwrap());

    assert!(engine.ready_jobs(h.now()).await.is_empty());
    assert_eq!(engine.tick().await.claimed, 0);
    assert_eq!(job(&engine, job_id).await.state, JobState::Pending);

    h.advance(TimeDelta::minutes(5));
    let ready: Vec<JobId> = engine.ready_jobs(h.now()).await.iter().map(|e| e.job_id).collect();
    assert_eq!(ready, vec![job_id]);
    assert_eq!(engine.tick().await.completed, 1);
}

/// Leave a WAL behind as a process that died mid-execution would: the job was
/// submitted, then `tail` was appended.
async fn seed_interrupted_job(h: &Harness, to: &str, tail: Vec<JobMutation>) -> JobId {
    let now = h.now();
    let job_id = JobId::from_ulid(ulid::Ulid::new());
    let (wal, _) = Wal::open(h.dir.path().join("spindle.wal")).await.unwrap();
    let mut arguments = Arguments::new();
    arguments.insert("to".into(), json!(to));
    let env = JobEnvelope::new(job_id, TaskType::new(SendEmail::TYPE), arguments, now, None);
    wal.append(job_id, JobMutation::Submitted { envelope: Box::new(env) }, now)
        .await
        .unwrap();
    for op in tail {
        wal.append(job_id, op, now).await.unwrap();
    }
    job_id
}

async fn open_mailer(h: &Harness, handler: &Arc<SendEmailHandler>) -> Engine {
    h.builder()
        .register::<SendEmail, _>(Arc::clone(handler))
        .unwrap()
        .open()
        .await
        .unwrap()
}

#[tokio::test]
async fn crash_after_claim_redelivers_the_job() {
    let h = Harness::new();
    let job_id = seed_interrupted_job(&h, "crash@example.com", vec![JobMutation::Claimed { attempt: 1 }]).await;

    let handler = Arc::new(SendEmailHandler::default());
    let engine = open_mailer(&h, &handler).await;

    let env = job(&engine, job_id).await;
    assert_eq!(env.state, JobState::Pending);
    assert_eq!(engine.ready_jobs(h.now()).await.len(), 1);

    assert_eq!(engine.tick().await.completed, 1);
    let env = job(&engine, job_id).await;
    assert_eq!(env.state, JobState::Completed);
    assert_eq!(env.attempt_count, 2);
    assert_eq!(*handler.sent.lock().unwrap(), vec!["crash@example.com"]);
    drop(engine);

    // the redelivered run is what the next restart sees
    let engine = open_mailer(&h, &handler).await;
    let env = job(&engine, job_id).await;
    assert_eq!(env.state, JobState::Completed);
    assert_eq!(env.attempt_count, 2);
    assert_eq!(engine.tick().await.claimed, 0);
    assert_eq!(handler.sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn crash_after_failure_completes_once_across_restarts() {
    let h = Harness::new();
    let job_id = seed_interrupted_job(
        &h,
        "flaky@example.com",
        vec![
            JobMutation::Claimed { attempt: 1 },
            JobMutation::Failed {
                error: "smtp timeout".into(),
            },
        ],
    )
    .await;

    let handler = Arc::new(SendEmailHandler::default());
    let engine = open_mailer(&h, &handler).await;
    assert_eq!(job(&engine, job_id).await.state, JobState::Pending);
    assert_eq!(engine.tick().await.completed, 1);
    drop(engine);

    for _ in 0..2 {
        let engine = open_mailer(&h, &handler).await;
        let env = job(&engine, job_id).await;
        assert_eq!(env.state, JobState::Completed);
        assert_eq!(env.attempt_count, 2);
        assert_eq!(engine.tick().await.claimed, 0);
    }
    assert_eq!(*handler.sent.lock().unwrap(), vec!["flaky@example.com"]);
}

#[tokio::test]
async fn cancelled_redelivery_stays_dead_after_restart() {
    let h = Harness::new();
    let job_id = seed_interrupted_job(&h, "stop@example.com", vec![JobMutation::Claimed { attempt: 1 }]).await;

    let handler = Arc::new(SendEmailHandler::default());
    let engine = open_mailer(&h, &handler).await;
    assert_eq!(engine.cancel(job_id).await.unwrap(), CancelOutcome::Cancelled);
    drop(engine);

    let engine = open_mailer(&h, &handler).await;
    let env = job(&engine, job_id).await;
    assert_eq!(env.state, JobState::Dead);
    assert_eq!(env.last_error.as_deref(), Some("cancelled"));
    assert_eq!(engine.tick().await.claimed, 0);
    assert!(handler.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn attempt_count_survives_repeated_crashes() {
    let h = Harness::new();
    let job_id = seed_interrupted_job(&h, "again@example.com", vec![JobMutation::Claimed { attempt: 1 }]).await;
    let handler = Arc::new(SendEmailHandler::default());

    // restarted twice without running anything
    drop(open_mailer(&h, &handler).await);
    let engine = open_mailer(&h, &handler).await;
    let env = job(&engine, job_id).await;
    assert_eq!(env.state, JobState::Pending);
    assert_eq!(env.attempt_count, 1);
    drop(engine);

    // crash again mid-execution of the second attempt
    {
        let (wal, replay) = Wal::open(h.dir.path().join("spindle.wal")).await.unwrap();
        assert_eq!(replay.skipped, 0);
        assert!(replay.recovered.is_empty());
        wal.append(job_id, JobMutation::Claimed { attempt: 2 }, h.now()).await.unwrap();
    }

    let engine = open_mailer(&h, &handler).await;
    assert_eq!(job(&engine, job_id).await.attempt_count, 2);
    assert_eq!(engine.tick().await.completed, 1);
    drop(engine);

    let engine = open_mailer(&h, &handler).await;
    let env = job(&engine, job_id).await;
    assert_eq!(env.state, JobState::Completed);
    assert_eq!(env.attempt_count, 3);
}

#[tokio::test]
async fn second_engine_on_the_same_wal_is_refused() {
    let h = Harness::new();
    let handler = Arc::new(SendEmailHandler::default());
    let engine = open_mailer(&h, &handler).await;

    let second = h.builder().open().await;
    assert!(matches!(second, Err(SpindleError::WalLocked(_))));
    let compactor = Wal::open(h.dir.path().join("spindle.wal")).await;
    assert!(matches!(compactor, Err(SpindleError::WalLocked(_))));

    drop(engine);
    assert!(h.builder().open().await.is_ok());
}

#[tokio::test]
async fn exhausted_retries_dead_letter_the_job_for_good() {
    let h = Harness::new();
    let mut config = h.config();
    config.retry.max_attempts = 2;
    let engine = h
        .builder_with(config.clone())
        .register::<ChargeCard, _>(ChargeCardHandler {
            failures: u32::MAX,
            calls: Arc::new(AtomicU32::new(0)),
        })
        .unwrap()
        .open()
        .await
        .unwrap();

    let job_id = enqueued(engine.submit_task(&ChargeCard { cents: 5 }, None).await.unwrap());
    assert_eq!(engine.tick().await.retrying, 1);
    h.advance(TimeDelta::seconds(1));
    assert_eq!(engine.tick().await.dead, 1);

    let env = job(&engine, job_id).await;
    assert_eq!(env.state, JobState::Dead);
    assert_eq!(env.attempt_count, 2);
    assert!(env.last_error.as_deref().unwrap().contains("declined"));
    assert!(engine.next_due().is_none());

    h.advance(TimeDelta::hours(1));
    assert_eq!(engine.tick().await.claimed, 0);
    drop(engine);

    // still dead, and still not dispatched, after a restart
    let engine = h
        .builder_with(config)
        .register::<ChargeCard, _>(ChargeCardHandler {
            failures: 0,
            calls: Arc::new(AtomicU32::new(0)),
        })
        .unwrap()
        .open()
        .await
        .unwrap();
    assert_eq!(job(&engine, job_id).await.state, JobState::Dead);
    assert_eq!(engine.tick().await.claimed, 0);
    assert_eq!(engine.counts().await.dead, 1);
}

#[tokio::test]
async fn permanent_failure_skips_retries() {
    let h = Harness::new();
    let engine = h
        .builder()
        .register_fn("import_csv", |_ctx| async { Err::<(), _>(HandlerError::permanent("malformed header")) })
        .unwrap()
        .open()
        .await
        .unwrap();

    let job_id = enqueued(engine.submit("import_csv", Arguments::new(), None).await.unwrap());
    assert_eq!(engine.tick().await.dead, 1);

    let env = job(&engine, job_id).await;
    assert_eq!(env.state, JobState::Dead);
    assert_eq!(env.attempt_count, 1);
    assert_eq!(env.last_error.as_deref(), Some("malformed header"));
}

#[tokio::test]
async fn job_whose_task_disappeared_is_dead_lettered() {
    let h = Harness::new();
    let job_id = {
        let engine = h
            .builder()
            .register::<SendEmail, _>(Arc::new(SendEmailHandler::default()))
            .unwrap()
            .open()
            .await
            .unwrap();
        enqueued(engine.submit_task(&email("a@example.com"), None).await.unwrap())
    };

    // restart without the handler
    let engine = h.builder().open().await.unwrap();
    let report = engine.tick().await;

    assert_eq!(report.dead, 1);
    let env = job(&engine, job_id).await;
    assert_eq!(env.state, JobState::Dead);
    assert!(env.last_error.as_deref().unwrap().contains("no task registered"));
}

#[tokio::test]
async fn rejected_submissions_persist_nothing() {
    let h = Harness::new();
    let engine = h
        .builder()
        .register::<SendEmail, _>(Arc::new(SendEmailHandler::default()))
        .unwrap()
        .open()
        .await
        .unwrap();

    let err = engine.submit(SendEmail::TYPE, Arguments::new(), None).await.unwrap_err();
    assert!(matches!(err, SpindleError::Validation { .. }));

    let err = engine.submit("no_such_task", Arguments::new(), None).await.unwrap_err();
    assert!(matches!(err, SpindleError::UnknownTask(t) if t.as_str() == "no_such_task"));

    assert_eq!(engine.counts().await.total(), 0);
    drop(engine);

    let (_, replay) = Wal::open(h.dir.path().join("spindle.wal")).await.unwrap();
    assert!(replay.is_empty());
    assert_eq!(replay.last_seq, 0);
}

#[tokio::test]
async fn definition_defaults_and_required_keys_apply_at_submission() {
    let h = Harness::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in_handler = Arc::clone(&seen);
    let definition = spindle_core::TaskDefinition::new(
        "resize_image",
        Arc::new(spindle_core::typed::FnHandler::new(move |ctx: JobContext| {
            let seen = Arc::clone(&seen_in_handler);
            async move {
                seen.lock().unwrap().push(ctx.arguments.clone());
                Ok::<(), HandlerError>(())
            }
        })),
    )
    .require("path")
    .with_default("width", json!(640));
    let engine = h.builder().define(definition).unwrap().open().await.unwrap();

    let err = engine.submit("resize_image", Arguments::new(), None).await.unwrap_err();
    assert!(err.to_string().contains("path"));

    let mut arguments = Arguments::new();
    arguments.insert("path".into(), json!("/tmp/cat.png"));
    enqueued(engine.submit("resize_image", arguments, None).await.unwrap());
    engine.tick().await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0]["width"], json!(640));
}

struct Mailer {
    delivered: Mutex<Vec<String>>,
}

#[tokio::test]
async fn wrapped_method_runs_later() {
    let h = Harness::new();
    let engine = h.builder().open().await.unwrap();
    let mailer = Arc::new(Mailer {
        delivered: Mutex::new(Vec::new()),
    });

    let deliver = engine
        .wrap(Arc::clone(&mailer), "deliver", |mailer: Arc<Mailer>, args: Arguments| async move {
            let to = args.get("to").and_then(|v| v.as_str()).ok_or("missing `to`")?;
            mailer.delivered.lock().unwrap().push(to.to_string());
            Ok::<(), HandlerError>(())
        })
        .unwrap();
    assert_eq!(deliver.task_type().as_str(), "Mailer#deliver");
    assert!(engine.registered_types().contains(&"Mailer#deliver".to_string()));

    let mut now_args = Arguments::new();
    now_args.insert("to".into(), json!("now@example.com"));
    let mut later_args = Arguments::new();
    later_args.insert("to".into(), json!("later@example.com"));
    deliver.perform_later(now_args).await.unwrap();
    deliver
        .perform_at(h.now() + TimeDelta::hours(1), later_args)
        .await
        .unwrap();

    assert_eq!(engine.tick().await.completed, 1);
    assert_eq!(*mailer.delivered.lock().unwrap(), vec!["now@example.com"]);

    h.advance(TimeDelta::hours(1));
    assert_eq!(engine.tick().await.completed, 1);
    assert_eq!(mailer.delivered.lock().unwrap().len(), 2);

    // wrapping the same method twice is a duplicate registration
    let again = engine.wrap(mailer, "deliver", |_m: Arc<Mailer>, _a: Arguments| async { Ok::<(), HandlerError>(()) });
    assert!(matches!(again, Err(SpindleError::DuplicateTask(_))));
}

#[tokio::test]
async fn cancelling_a_waiting_job_dead_letters_it() {
    let h = Harness::new();
    let handler = Arc::new(SendEmailHandler::default());
    let engine = h
        .builder()
        .register::<SendEmail, _>(Arc::clone(&handler))
        .unwrap()
        .open()
        .await
        .unwrap();

    let job_id = enqueued(
        engine
            .submit_task(&email("a@example.com"), Some(h.now() + TimeDelta::minutes(1)))
            .await
            .unwrap(),
    );

    assert_eq!(engine.cancel(job_id).await.unwrap(), CancelOutcome::Cancelled);
    let env = job(&engine, job_id).await;
    assert_eq!(env.state, JobState::Dead);
    assert_eq!(env.last_error.as_deref(), Some("cancelled"));

    h.advance(TimeDelta::minutes(2));
    assert_eq!(engine.tick().await.claimed, 0);
    assert!(handler.sent.lock().unwrap().is_empty());
    assert_eq!(engine.cancel(job_id).await.unwrap(), CancelOutcome::AlreadyFinished);

    let missing = JobId::from_ulid(ulid::Ulid::new());
    assert!(matches!(engine.cancel(missing).await, Err(SpindleError::JobNotFound(id)) if id == missing));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelling_a_running_job_raises_its_flag() {
    let h = Harness::new();
    let engine = h
        .builder()
        .register_fn("long_export", |ctx: JobContext| async move {
            while !ctx.is_cancelled() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Err::<(), _>(HandlerError::new("stopped by request"))
        })
        .unwrap()
        .open()
        .await
        .unwrap();
    let dispatchers = engine.start();

    let job_id = enqueued(engine.submit("long_export", Arguments::new(), None).await.unwrap());
    eventually(|| {
        let engine = engine.clone();
        async move { job(&engine, job_id).await.state == JobState::Claimed }
    })
    .await;

    assert_eq!(engine.cancel(job_id).await.unwrap(), CancelOutcome::Signalled);
    eventually(|| {
        let engine = engine.clone();
        async move { job(&engine, job_id).await.state == JobState::Dead }
    })
    .await;

    let env = job(&engine, job_id).await;
    assert_eq!(env.last_error.as_deref(), Some("cancelled"));
    assert_eq!(env.attempt_count, 1);
    dispatchers.shutdown_and_join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn background_dispatchers_publish_events() {
    let h = Harness::new();
    let events = BroadcastEventSink::new(64);
    let mut rx = events.subscribe();
    let engine = h
        .builder()
        .register::<SendEmail, _>(Arc::new(SendEmailHandler::default()))
        .unwrap()
        .event_sink(Arc::new(events))
        .open()
        .await
        .unwrap();
    let dispatchers = engine.start();

    for n in 0..3 {
        engine.submit_task(&email(&format!("user{n}@example.com")), None).await.unwrap();
    }

    let mut completed = 0;
    tokio::time::timeout(Duration::from_secs(10), async {
        while completed < 3 {
            let event = rx.recv().await.unwrap();
            if event.kind == JobEventKind::Completed {
                assert_eq!(event.task_type.as_str(), SendEmail::TYPE);
                assert_eq!(event.attempt_count, 1);
                completed += 1;
            }
        }
    })
    .await
    .expect("jobs did not complete in time");

    dispatchers.shutdown_and_join().await;
    assert_eq!(engine.counts().await.completed, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_dispatchers_run_each_job_exactly_once() {
    let h = Harness::new();
    let mut config = h.config();
    config.dispatchers = 4;
    config.max_concurrency = 8;

    let runs: Arc<Mutex<HashMap<JobId, u32>>> = Arc::new(Mutex::new(HashMap::new()));
    let runs_in_handler = Arc::clone(&runs);
    let engine = h
        .builder_with(config)
        .register_fn("count", move |ctx: JobContext| {
            let runs = Arc::clone(&runs_in_handler);
            async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                *runs.lock().unwrap().entry(ctx.job_id).or_default() += 1;
                Ok::<(), HandlerError>(())
            }
        })
        .unwrap()
        .open()
        .await
        .unwrap();
    let dispatchers = engine.start();

    for _ in 0..50 {
        engine.submit("count", Arguments::new(), None).await.unwrap();
    }
    eventually(|| {
        let engine = engine.clone();
        async move { engine.counts().await.completed == 50 }
    })
    .await;
    dispatchers.shutdown_and_join().await;

    let runs = runs.lock().unwrap();
    assert_eq!(runs.len(), 50);
    assert!(runs.values().all(|n| *n == 1));
}

struct BlockTestAddresses;

#[async_trait]
impl SubmitMiddleware for BlockTestAddresses {
    async fn call(&self, mut ctx: SubmitContext, next: SubmitNext<'_>) -> Result<SubmitOutcome, SpindleError> {
        let to = ctx.arguments.get("to").and_then(|v| v.as_str()).unwrap_or_default();
        if to.ends_with("@test.invalid") {
            return Ok(SubmitOutcome::Halted);
        }
        ctx.arguments.insert("trace_id".into(), json!("abc123"));
        next.run(ctx).await
    }
}

/// Skips every job on its first attempt.
struct SkipFirstAttempt {
    skipped: Arc<AtomicU32>,
}

#[async_trait]
impl PerformMiddleware for SkipFirstAttempt {
    async fn call(&self, ctx: &JobContext, next: PerformNext<'_>) -> PerformOutcome {
        if ctx.attempt == 1 && ctx.arguments.contains_key("skip") {
            self.skipped.fetch_add(1, Ordering::SeqCst);
            return PerformOutcome::Skipped;
        }
        next.run(ctx).await
    }
}

#[tokio::test]
async fn middleware_can_halt_rewrite_and_skip() {
    let h = Harness::new();
    let handler = Arc::new(SendEmailHandler::default());
    let skipped = Arc::new(AtomicU32::new(0));
    let engine = h
        .builder()
        .register::<SendEmail, _>(Arc::clone(&handler))
        .unwrap()
        .submit_middleware(BlockTestAddresses)
        .perform_middleware(SkipFirstAttempt {
            skipped: Arc::clone(&skipped),
        })
        .open()
        .await
        .unwrap();

    let halted = engine.submit_task(&email("bot@test.invalid"), None).await.unwrap();
    assert_eq!(halted, SubmitOutcome::Halted);
    assert_eq!(engine.counts().await.total(), 0);

    let sent = enqueued(engine.submit_task(&email("a@example.com"), None).await.unwrap());
    assert_eq!(job(&engine, sent).await.arguments["trace_id"], json!("abc123"));

    let mut arguments = Arguments::new();
    arguments.insert("to".into(), json!("b@example.com"));
    arguments.insert("skip".into(), json!(true));
    let skipped_job = enqueued(engine.submit(SendEmail::TYPE, arguments, None).await.unwrap());

    assert_eq!(engine.tick().await.completed, 2);
    assert_eq!(job(&engine, skipped_job).await.state, JobState::Completed);
    assert_eq!(skipped.load(Ordering::SeqCst), 1);
    assert_eq!(*handler.sent.lock().unwrap(), vec!["a@example.com"]);
}

#[tokio::test]
async fn compaction_forgets_old_finished_jobs() {
    let h = Harness::new();
    let mut config = h.config();
    config.retention_secs = 60;
    let engine = h
        .builder_with(config.clone())
        .register::<SendEmail, _>(Arc::new(SendEmailHandler::default()))
        .unwrap()
        .open()
        .await
        .unwrap();

    let done = enqueued(engine.submit_task(&email("old@example.com"), None).await.unwrap());
    engine.tick().await;
    let waiting = enqueued(
        engine
            .submit_task(&email("later@example.com"), Some(h.now() + TimeDelta::days(1)))
            .await
            .unwrap(),
    );

    h.advance(TimeDelta::minutes(5));
    let report = engine.compact().await.unwrap();

    assert_eq!(report.dropped_jobs, vec![done]);
    assert!(engine.job(done).await.is_none());
    assert_eq!(job(&engine, waiting).await.state, JobState::Pending);
    drop(engine);

    let engine = h
        .builder_with(config)
        .register::<SendEmail, _>(Arc::new(SendEmailHandler::default()))
        .unwrap()
        .open()
        .await
        .unwrap();
    assert!(engine.job(done).await.is_none());
    assert_eq!(engine.counts().await.total(), 1);
}
