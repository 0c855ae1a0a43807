use std::{
    collections::HashSet,
    sync::atomic::{AtomicUsize, Ordering},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use stalkerhunt::{
    engine::{EngineState, Hunter, RunOptions},
    error::EngineError,
    probe::{AssumeAlive, FnProber},
    target::{Target, TargetFile, TargetList},
    worker::Worker,
};

/// Behaviour picked from the target name:
/// `hang` never returns, `fail` errors, `panic` panics, `silent` returns no
/// record, names starting with `quick` return their name at once, anything
/// else returns its own name after a short sleep.
#[derive(Default)]
struct ScriptWorker {
    running: AtomicUsize,
    peak: AtomicUsize,
    sessions: AtomicUsize,
    session_limit: Option<usize>,
    runs: Mutex<Vec<String>>,
    starts: Mutex<Vec<Instant>>,
}

impl ScriptWorker {
    fn with_session_limit(limit: usize) -> Self {
        Self {
            session_limit: Some(limit),
            ..Self::default()
        }
    }
}

struct Running<'a>(&'a AtomicUsize);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Worker for ScriptWorker {
    type Session = ();
    type Record = String;

    fn open_session(&self) -> anyhow::Result<()> {
        let n = self.sessions.fetch_add(1, Ordering::SeqCst);
        if self.session_limit.is_some_and(|limit| n >= limit) {
            anyhow::bail!("no more sessions");
        }
        Ok(())
    }

    async fn run(&self, _session: &mut (), target: &Target) -> anyhow::Result<Vec<String>> {
        self.runs.lock().push(target.to_string());
        self.starts.lock().push(Instant::now());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _running = Running(&self.running);

        match target.as_str() {
            "hang" => std::future::pending().await,
            "fail" => anyhow::bail!("access denied"),
            "panic" => panic!("worker blew up"),
            name if name.starts_with("quick") => Ok(vec![name.to_string()]),
            "silent" => {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(Vec::new())
            }
            name => {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(vec![name.to_string()])
            }
        }
    }
}

fn options(throttle: usize) -> RunOptions {
    RunOptions::default()
        .with_throttle(throttle)
        .with_probe(false)
        .with_poll_interval(Duration::from_millis(5))
}

fn hosts(n: usize) -> TargetList {
    TargetList::new((0..n).map(|i| format!("host{i:02}")))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ten_targets_throttle_three() {
    let hunter = Hunter::new(ScriptWorker::default()).with_options(options(3));

    let mut run = hunter.start(&hosts(10)).unwrap();
    let mut records = Vec::new();
    while let Some(finding) = run.next().await {
        assert!(run.stats().running <= 3);
        records.push(finding.record);
    }
    run.terminated().await;
    assert_eq!(run.state(), EngineState::Terminated);
    let summary = run.finish().await.unwrap();

    assert_eq!(records.len(), 10);
    assert_eq!(records.iter().collect::<HashSet<_>>().len(), 10);
    assert_eq!(summary.outcomes(), 10);
    assert_eq!(summary.completed, 10);
    assert!(summary.pool.peak_running <= 3);
    assert!(hunter.worker().peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(hunter.worker().sessions.load(Ordering::SeqCst), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_target_reaches_one_outcome() {
    let targets = TargetList::new(["fail", "silent", "a", "b", "fail", "c", "silent"]);
    let hunter = Hunter::new(ScriptWorker::default()).with_options(options(2));

    let (findings, summary) = hunter.run(&targets).await.unwrap();

    assert_eq!(summary.supplied, 7);
    assert_eq!(summary.submitted, 7);
    assert_eq!(summary.outcomes(), 7);
    assert_eq!(summary.failed.len(), 2);
    assert!(summary.failed.iter().all(|f| f.error == "access denied"));
    assert_eq!(summary.completed, 5);
    assert_eq!(findings.len(), 3);
    assert_eq!(summary.abandoned, 0);
    assert_eq!(hunter.worker().runs.lock().len(), 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hung_worker_times_out_and_pool_recovers() {
    let targets = TargetList::new(["a", "b", "hang", "c", "d"]);
    let timeout = Duration::from_secs(1);
    let hunter = Hunter::new(ScriptWorker::default())
        .with_options(options(2).with_timeout(timeout));

    let started = Instant::now();
    let (findings, summary) = hunter.run(&targets).await.unwrap();

    assert!(started.elapsed() < timeout + Duration::from_millis(800));
    assert_eq!(summary.timed_out, vec![Target::new("hang")]);
    assert_eq!(summary.completed, 4);
    assert_eq!(findings.len(), 4);
    assert_eq!(summary.outcomes(), 5);
    assert_eq!(summary.pool.rebuilt, 1);
    assert_eq!(summary.pool.leaked, 0);
    assert_eq!(summary.pool.available, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hung_worker_without_close_leaks_a_slot() {
    let targets = TargetList::new(["a", "b", "hang", "c", "d"]);
    let hunter = Hunter::new(ScriptWorker::default()).with_options(
        options(2)
            .with_timeout(Duration::from_millis(300))
            .with_close_on_timeout(false),
    );

    let (findings, summary) = hunter.run(&targets).await.unwrap();

    assert_eq!(summary.timed_out, vec![Target::new("hang")]);
    assert_eq!(findings.len(), 4);
    assert_eq!(summary.pool.leaked, 1);
    assert_eq!(summary.pool.rebuilt, 0);
    assert_eq!(summary.pool.available, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_context_leaked_stops_dispatch() {
    let targets = TargetList::new(["hang", "a", "b", "c"]);
    let hunter = Hunter::new(ScriptWorker::default()).with_options(
        options(1)
            .with_timeout(Duration::from_millis(100))
            .with_close_on_timeout(false)
            .with_seed(3),
    );

    let (_, summary) = hunter.run(&targets).await.unwrap();

    assert_eq!(summary.timed_out, vec![Target::new("hang")]);
    assert_eq!(summary.pool.leaked, 1);
    assert_eq!(summary.submitted + summary.undispatched, 4);
    assert_eq!(summary.outcomes(), summary.submitted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_zero_throttle_is_rejected() {
    let hunter = Hunter::new(ScriptWorker::default()).with_options(options(0));

    let err = hunter.start(&hosts(3)).err().unwrap();
    assert!(matches!(err, EngineError::InvalidThrottle(0)));
    assert!(err.is_configuration());
    assert_eq!(hunter.worker().sessions.load(Ordering::SeqCst), 0);
    assert!(hunter.worker().runs.lock().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_missing_target_file_is_rejected() {
    let hunter = Hunter::new(ScriptWorker::default()).with_options(options(2));
    let source = TargetFile::new(std::env::temp_dir().join("stalkerhunt-no-such-file.txt"));

    let err = hunter.start(&source).err().unwrap();
    assert!(matches!(err, EngineError::TargetFileMissing { .. }));
    assert_eq!(hunter.worker().sessions.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_probe_skips_dead_targets() {
    let targets = TargetList::new(["alive1", "dead1", "alive2", "dead2", "alive3"]);
    let prober = || FnProber(|t: &Target| !t.as_str().starts_with("dead"));

    let probing = Hunter::new(ScriptWorker::default())
        .with_prober(prober())
        .with_options(options(2).with_probe(true));
    let (_, summary) = probing.run(&targets).await.unwrap();
    assert_eq!(summary.submitted, 3);
    assert_eq!(summary.skipped, 2);
    assert_eq!(probing.worker().runs.lock().len(), 3);

    let blind = Hunter::new(ScriptWorker::default())
        .with_prober(prober())
        .with_options(options(2).with_probe(false));
    let (_, summary) = blind.run(&targets).await.unwrap();
    assert_eq!(summary.submitted, 5);
    assert_eq!(summary.skipped, 0);
    assert_eq!(blind.worker().runs.lock().len(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_on_first_match_drains_running_tasks() {
    let hunter = Hunter::new(ScriptWorker::default())
        .with_options(options(2).with_stop_on_first_match(true));

    let (findings, summary) = hunter.run(&hosts(20)).await.unwrap();

    assert!(summary.stopped_early);
    assert!(summary.submitted < 20);
    assert_eq!(summary.submitted + summary.undispatched, 20);
    // Tasks already running when the first match arrived still report.
    assert_eq!(summary.outcomes(), summary.submitted);
    assert_eq!(findings.len(), summary.submitted);
    assert_eq!(hunter.worker().runs.lock().len(), summary.submitted);
}

fn quick(n: usize) -> TargetList {
    TargetList::new((0..n).map(|i| format!("quick{i:02}")))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_on_first_match_with_instant_workers() {
    let hunter = Hunter::new(ScriptWorker::default()).with_options(
        RunOptions::default()
            .with_throttle(1)
            .with_probe(false)
            .with_stop_on_first_match(true),
    );

    let (findings, summary) = hunter.run(&quick(50)).await.unwrap();

    assert!(summary.stopped_early);
    assert_eq!(summary.submitted, 1);
    assert_eq!(summary.undispatched, 49);
    assert_eq!(findings.len(), 1);
    assert_eq!(hunter.worker().runs.lock().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_on_first_match_bounded_by_running_tasks() {
    let hunter = Hunter::new(ScriptWorker::default()).with_options(
        RunOptions::default()
            .with_throttle(3)
            .with_probe(false)
            .with_stop_on_first_match(true),
    );

    let (findings, summary) = hunter.run(&quick(50)).await.unwrap();

    assert!(summary.stopped_early);
    assert!(summary.submitted >= 1 && summary.submitted <= 3);
    assert_eq!(summary.submitted + summary.undispatched, 50);
    assert_eq!(findings.len(), summary.submitted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dispatches_are_paced_with_jitter() {
    let delay = Duration::from_millis(50);
    let hunter = Hunter::new(ScriptWorker::default())
        .with_options(options(5).with_delay(delay, 0.3));

    let started = Instant::now();
    let (_, summary) = hunter.run(&quick(6)).await.unwrap();
    assert_eq!(summary.completed, 6);

    let mut starts = hunter.worker().starts.lock().clone();
    starts.sort();
    assert_eq!(starts.len(), 6);
    assert!(starts[0] - started >= Duration::from_millis(35));
    for pair in starts.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(
            gap >= Duration::from_millis(30) && gap <= Duration::from_millis(100),
            "gap {gap:?} outside the jitter window"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_from_handle_halts_dispatch() {
    let hunter = Hunter::new(ScriptWorker::default()).with_options(options(1));

    let mut run = hunter.start(&hosts(30)).unwrap();
    assert!(run.next().await.is_some());
    run.stop();
    while run.next().await.is_some() {}
    let summary = run.finish().await.unwrap();

    assert!(!summary.stopped_early);
    assert!(summary.undispatched > 0);
    assert_eq!(summary.abandoned, 0);
    assert_eq!(summary.outcomes(), summary.submitted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_fault_aborts_with_partial_summary() {
    let targets = TargetList::new(["a", "panic", "b", "c"]);
    let hunter = Hunter::new(ScriptWorker::with_session_limit(1)).with_options(options(1));

    match hunter.run(&targets).await {
        Err(EngineError::Aborted { reason, summary }) => {
            assert!(reason.contains("no more sessions"));
            assert!(summary.failed.iter().any(|f| f.target.as_str() == "panic"));
            assert_eq!(summary.submitted + summary.undispatched, 4);
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rebuild_fault_after_last_task_aborts() {
    let targets = TargetList::new(["panic"]);
    let hunter = Hunter::new(ScriptWorker::with_session_limit(1)).with_options(options(1));

    match hunter.run(&targets).await {
        Err(EngineError::Aborted { reason, summary }) => {
            assert!(reason.contains("no more sessions"));
            assert_eq!(summary.failed.len(), 1);
            assert_eq!(summary.submitted, 1);
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_seeded_runs_dispatch_in_the_same_order() {
    let run_once = || async {
        let hunter = Hunter::new(ScriptWorker::default())
            .with_prober(AssumeAlive)
            .with_options(options(1).with_seed(99));
        hunter.run(&hosts(12)).await.unwrap();
        let order = hunter.worker().runs.lock().clone();
        order
    };

    let first = run_once().await;
    let second = run_once().await;
    assert_eq!(first, second);
    assert_ne!(first, (0..12).map(|i| format!("host{i:02}")).collect::<Vec<_>>());
}
