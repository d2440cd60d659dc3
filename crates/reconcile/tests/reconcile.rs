#![forbid(unsafe_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use runvault_core::{
    annotation, ClientError, Clock, Config, Converter, Identity, ManualClock, ReconcileError, ResourceClient, RunView,
};
use runvault_kubehub::{FakeResources, JsonConverter, RunKind, RunObject};
use runvault_persist::{MemoryStore, RecordStore};
use runvault_reconcile::{Cleanup, Outcome, Reconciler};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z").unwrap().with_timezone(&Utc)
}

fn run(kind: RunKind) -> RunObject {
    let (name, spec) = match kind {
        RunKind::TaskRun => ("taskrun", json!({"taskSpec": {"steps": [{"script": "echo hello world!"}]}})),
        RunKind::PipelineRun => (
            "pipelinerun",
            json!({"pipelineSpec": {"tasks": [{"name": "task", "taskSpec": {"steps": [{"script": "echo hello world!"}]}}]}}),
        ),
    };
    RunObject::from_json(json!({
        "apiVersion": "tekton.dev/v1beta1",
        "kind": kind.to_string(),
        "metadata": {
            "name": name,
            "namespace": "ns",
            "annotations": {"demo": "demo"},
            "uid": "12345"
        },
        "spec": spec,
        "status": {
            "conditions": [{"type": "Succeeded", "status": "True", "lastTransitionTime": "2024-03-01T12:00:00Z"}]
        }
    }))
    .unwrap()
}

fn owner() -> OwnerReference {
    OwnerReference {
        api_version: "tekton.dev/v1beta1".into(),
        kind: "PipelineRun".into(),
        name: "parent".into(),
        uid: "parent-uid".into(),
        ..Default::default()
    }
}

struct Env {
    fake: Arc<FakeResources>,
    store: Arc<MemoryStore>,
    clock: ManualClock,
    reconciler: Reconciler<FakeResources>,
    cancel: CancellationToken,
}

fn env(kind: RunKind, cfg: Config) -> Env {
    let fake = Arc::new(FakeResources::new(kind));
    let store = Arc::new(MemoryStore::new());
    let clock = ManualClock::at(t0());
    let reconciler = Reconciler::new(
        Arc::clone(&fake),
        store.clone() as Arc<dyn RecordStore>,
        Arc::new(JsonConverter),
        Arc::new(clock.clone()),
        cfg,
    );
    Env { fake, store, clock, reconciler, cancel: CancellationToken::new() }
}

fn key(r: &RunObject) -> String {
    format!("{}/{}", r.namespace().unwrap(), r.name())
}

/// Reconcile `want`'s key, check the annotations landed and that the archived
/// payload matches `want`, and return the post-reconcile object.
async fn reconcile(env: &Env, want: &RunObject) -> RunObject {
    let out = env.reconciler.reconcile(&env.cancel, &key(want)).await.expect("reconcile");
    assert!(matches!(out, Outcome::Reconciled(_)), "unexpected outcome {:?}", out);

    let got = env.fake.peek("ns", want.name()).expect("run still present");
    for a in [annotation::RESULT, annotation::RECORD] {
        assert!(got.annotation(a).is_some(), "annotation {} missing", a);
    }
    // Payload is the state as observed by this reconcile, which does not yet
    // carry the annotations it is about to write.
    let rec = env.store.get_record(got.annotation(annotation::RECORD).unwrap()).await.expect("get_record");
    assert_eq!(rec.data, JsonConverter.convert(want).unwrap());
    got
}

#[tokio::test]
async fn create_nop_update() {
    for kind in RunKind::ALL {
        let env = env(kind, Config::default());
        let mut u = env.fake.create(run(kind)).unwrap();

        // create
        u = reconcile(&env, &u).await;
        let record = u.annotation(annotation::RECORD).unwrap().to_string();
        assert_eq!(record, "ns/results/12345/records/12345");
        assert_eq!(u.annotation(annotation::RESULT), Some("ns/results/12345"));
        assert_eq!(u.annotation("demo"), Some("demo"));
        assert_eq!(env.fake.update_calls(), 1);

        // nop: treated as an update even though nothing changed
        let before = env.store.record_writes();
        u = reconcile(&env, &u).await;
        assert_eq!(env.store.record_writes(), before + 1);
        assert_eq!(env.fake.update_calls(), 1, "unchanged annotations must not be rewritten");

        // update
        u.set_generation(u.generation() + 1);
        let u = env.fake.update(&u).await.unwrap();
        let after = reconcile(&env, &u).await;
        assert_eq!(after.annotation(annotation::RECORD), Some(record.as_str()));

        assert_eq!(env.store.record_count(), 1, "{}: one record per run", kind);
        assert_eq!(env.store.result_count(), 1);
    }
}

#[tokio::test]
async fn disable_annotation_update_leaves_run_untouched() {
    let env = env(RunKind::TaskRun, Config { disable_annotation_update: true, ..Config::default() });
    let u = env.fake.create(run(RunKind::TaskRun)).unwrap();

    let out = env.reconciler.reconcile(&env.cancel, "ns/taskrun").await.unwrap();
    let Outcome::Reconciled(r) = out else { panic!("expected reconciled") };
    assert!(!r.annotated);

    let got = env.fake.peek("ns", "taskrun").unwrap();
    assert_eq!(got, u, "did not expect change in TaskRun");
    assert_eq!(env.fake.update_calls(), 0);

    let rec = env.store.get_record(&r.refs.record).await.unwrap();
    assert_eq!(rec.data, JsonConverter.convert(&u).unwrap());

    // Every reconcile takes the create path but lands on the same record.
    env.reconciler.reconcile(&env.cancel, "ns/taskrun").await.unwrap();
    assert_eq!(env.store.record_count(), 1);
}

#[tokio::test]
async fn run_cleanup() {
    for kind in RunKind::ALL {
        for (grace, want_delete) in [(Duration::seconds(-1), true), (Duration::zero(), false), (Duration::seconds(1), true)] {
            let env = env(kind, Config { completed_run_grace_period: grace, ..Config::default() });
            let mut owned = run(kind);
            owned.set_owner_refs(vec![owner()]);
            env.fake.create(owned).unwrap();
            let k = format!("ns/{}", run(kind).name());

            // noop: owner reference present
            let out = env.reconciler.reconcile(&env.cancel, &k).await.unwrap();
            assert!(matches!(out, Outcome::Reconciled(ref r) if r.cleanup == Cleanup::Owned), "{:?}", out);
            assert!(env.fake.peek("ns", run(kind).name()).is_some());

            // Clear owner references, then move time past the grace period.
            let mut u = env.fake.peek("ns", run(kind).name()).unwrap();
            u.set_owner_refs(vec![]);
            env.fake.update(&u).await.unwrap();
            env.clock.advance(grace + Duration::minutes(1));

            env.reconciler.reconcile(&env.cancel, &k).await.unwrap();
            let got = env.fake.get("ns", run(kind).name()).await;
            match (want_delete, got) {
                (true, Err(e)) => assert!(e.is_not_found()),
                (false, Ok(_)) => {}
                (w, g) => panic!("{} grace={} want_delete={} got={:?}", kind, grace, w, g.map(|r| r.name().to_string())),
            }
            // archived copy survives cleanup
            assert_eq!(env.store.record_count(), 1);
        }
    }
}

#[tokio::test]
async fn owned_runs_survive_any_grace_period() {
    for grace in [Duration::seconds(-1), Duration::zero(), Duration::seconds(1)] {
        let env = env(RunKind::TaskRun, Config { completed_run_grace_period: grace, ..Config::default() });
        let mut owned = run(RunKind::TaskRun);
        owned.set_owner_refs(vec![owner()]);
        env.fake.create(owned).unwrap();
        env.clock.advance(Duration::days(365));
        for _ in 0..3 {
            env.reconciler.reconcile(&env.cancel, "ns/taskrun").await.unwrap();
        }
        assert!(env.fake.peek("ns", "taskrun").is_some(), "grace={}", grace);
        assert_eq!(env.fake.delete_calls(), 0);
    }
}

#[tokio::test]
async fn grace_period_boundary() {
    let env = env(RunKind::PipelineRun, Config { completed_run_grace_period: Duration::seconds(30), ..Config::default() });
    env.fake.create(run(RunKind::PipelineRun)).unwrap();

    env.clock.set(t0() + Duration::seconds(10));
    let out = env.reconciler.reconcile(&env.cancel, "ns/pipelinerun").await.unwrap();
    assert_eq!(out.requeue_after(), Some(std::time::Duration::from_secs(20)));
    assert!(env.fake.peek("ns", "pipelinerun").is_some());

    env.clock.set(t0() + Duration::seconds(30));
    let out = env.reconciler.reconcile(&env.cancel, "ns/pipelinerun").await.unwrap();
    assert!(matches!(out, Outcome::Reconciled(ref r) if r.cleanup == Cleanup::Deleted));
    assert!(env.fake.peek("ns", "pipelinerun").is_none());

    let out = env.reconciler.reconcile(&env.cancel, "ns/pipelinerun").await.unwrap();
    assert_eq!(out, Outcome::Gone);
}

#[tokio::test]
async fn running_runs_are_archived_but_kept() {
    let env = env(RunKind::TaskRun, Config { completed_run_grace_period: Duration::seconds(-1), ..Config::default() });
    let running = RunObject::from_json(json!({
        "apiVersion": "tekton.dev/v1beta1",
        "kind": "TaskRun",
        "metadata": {"name": "taskrun", "namespace": "ns", "uid": "12345"},
        "status": {"conditions": [{"type": "Succeeded", "status": "Unknown"}]}
    }))
    .unwrap();
    env.fake.create(running).unwrap();
    let out = env.reconciler.reconcile(&env.cancel, "ns/taskrun").await.unwrap();
    assert!(matches!(out, Outcome::Reconciled(ref r) if r.cleanup == Cleanup::Running));
    assert_eq!(env.store.record_count(), 1);
}

#[tokio::test]
async fn half_annotation_pair_takes_create_path() {
    let env = env(RunKind::TaskRun, Config::default());
    let mut half = run(RunKind::TaskRun);
    half.set_annotation(annotation::RECORD, "ns/results/12345/records/12345");
    env.fake.create(half).unwrap();

    let out = env.reconciler.reconcile(&env.cancel, "ns/taskrun").await.unwrap();
    let Outcome::Reconciled(r) = out else { panic!("expected reconciled") };
    assert!(r.created);
    assert!(r.annotated);
    let got = env.fake.peek("ns", "taskrun").unwrap();
    assert_eq!(annotation::read(&got).complete(), Some(r.refs));
    assert_eq!(env.store.record_count(), 1);
}

#[tokio::test]
async fn annotate_failure_then_retry_does_not_duplicate() {
    let env = env(RunKind::TaskRun, Config::default());
    env.fake.create(run(RunKind::TaskRun)).unwrap();

    env.fake.fail_next_updates(1);
    let err = env.reconciler.reconcile(&env.cancel, "ns/taskrun").await.unwrap_err();
    assert!(err.is_retryable(), "{}", err);
    assert_eq!(env.store.record_count(), 1, "archived before the annotate failure");
    assert!(annotation::read(&env.fake.peek("ns", "taskrun").unwrap()).complete().is_none());

    env.reconciler.reconcile(&env.cancel, "ns/taskrun").await.unwrap();
    assert_eq!(env.store.record_count(), 1, "retry must upsert the same record");
    assert!(annotation::read(&env.fake.peek("ns", "taskrun").unwrap()).complete().is_some());
}

/// Bumps the stored object between the reconciler's read and its write.
struct Racing(FakeResources);

#[async_trait::async_trait]
impl ResourceClient for Racing {
    type Object = RunObject;

    async fn get(&self, namespace: &str, name: &str) -> Result<RunObject, ClientError> {
        let seen = self.0.get(namespace, name).await?;
        let mut bumped = seen.clone();
        bumped.set_generation(seen.generation() + 1);
        self.0.update(&bumped).await?;
        Ok(seen)
    }

    async fn update(&self, run: &RunObject) -> Result<RunObject, ClientError> {
        self.0.update(run).await
    }

    async fn delete(&self, id: &Identity) -> Result<(), ClientError> {
        self.0.delete(id).await
    }
}

#[tokio::test]
async fn stale_write_is_a_retryable_conflict() {
    let racing = Arc::new(Racing(FakeResources::new(RunKind::TaskRun)));
    racing.0.create(run(RunKind::TaskRun)).unwrap();
    let store = Arc::new(MemoryStore::new());
    let r = Reconciler::new(
        Arc::clone(&racing),
        store.clone() as Arc<dyn RecordStore>,
        Arc::new(JsonConverter),
        Arc::new(ManualClock::at(t0())),
        Config::default(),
    );
    let err = r.reconcile(&CancellationToken::new(), "ns/taskrun").await.unwrap_err();
    assert!(matches!(err, ReconcileError::Conflict(_)), "{}", err);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn unconvertible_run_is_a_permanent_error() {
    let env = env(RunKind::TaskRun, Config::default());
    let mut no_uid = run(RunKind::TaskRun);
    no_uid.obj.metadata.uid = None;
    env.fake.create(no_uid).unwrap();

    let err = env.reconciler.reconcile(&env.cancel, "ns/taskrun").await.unwrap_err();
    assert!(matches!(err, ReconcileError::Conversion(_)), "{}", err);
    assert!(!err.is_retryable());
    assert_eq!(env.store.record_count(), 0);
    assert_eq!(env.fake.update_calls(), 0);
}

#[tokio::test]
async fn store_outage_is_transient() {
    let env = env(RunKind::TaskRun, Config::default());
    env.fake.create(run(RunKind::TaskRun)).unwrap();
    env.store.set_unavailable(true);
    let err = env.reconciler.reconcile(&env.cancel, "ns/taskrun").await.unwrap_err();
    assert!(matches!(err, ReconcileError::Transient(_)), "{}", err);
    assert_eq!(env.fake.update_calls(), 0, "no annotation without an archived record");
}

#[tokio::test]
async fn fetch_failure_is_transient() {
    let env = env(RunKind::TaskRun, Config::default());
    env.fake.create(run(RunKind::TaskRun)).unwrap();
    env.fake.fail_next_gets(1);
    let err = env.reconciler.reconcile(&env.cancel, "ns/taskrun").await.unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn cancelled_reconcile_mutates_nothing() {
    let env = env(RunKind::TaskRun, Config { completed_run_grace_period: Duration::seconds(-1), ..Config::default() });
    env.fake.create(run(RunKind::TaskRun)).unwrap();
    env.cancel.cancel();
    let err = env.reconciler.reconcile(&env.cancel, "ns/taskrun").await.unwrap_err();
    assert!(matches!(err, ReconcileError::Cancelled));
    assert_eq!(env.store.record_count(), 0);
    assert_eq!(env.fake.update_calls(), 0);
    assert!(env.fake.peek("ns", "taskrun").is_some());
}

#[tokio::test]
async fn missing_run_and_bad_keys() {
    let env = env(RunKind::TaskRun, Config::default());
    assert_eq!(env.reconciler.reconcile(&env.cancel, "ns/absent").await.unwrap(), Outcome::Gone);
    let err = env.reconciler.reconcile(&env.cancel, "no-namespace").await.unwrap_err();
    assert!(matches!(err, ReconcileError::InvalidKey(_)));
}

#[tokio::test]
async fn name_reuse_gets_a_fresh_record() {
    let env = env(RunKind::TaskRun, Config { completed_run_grace_period: Duration::seconds(-1), ..Config::default() });
    env.fake.create(run(RunKind::TaskRun)).unwrap();
    env.reconciler.reconcile(&env.cancel, "ns/taskrun").await.unwrap();
    assert!(env.fake.peek("ns", "taskrun").is_none());

    let mut again = run(RunKind::TaskRun);
    again.obj.metadata.uid = Some("67890".into());
    env.fake.create(again).unwrap();
    env.reconciler.reconcile(&env.cancel, "ns/taskrun").await.unwrap();
    assert_eq!(env.store.record_count(), 2);
    assert!(env.store.get_record("ns/results/67890/records/67890").await.is_ok());
    assert_eq!(env.clock.now(), t0());
}
