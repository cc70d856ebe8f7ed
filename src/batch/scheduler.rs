use crossbeam_channel::{unbounded, SendError};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::cache_key::CacheKey;
use crate::cancel::CancelFlag;
use crate::error::{PrecisError, Result};
use crate::function::{FunctionRun, MetadataEnvelope, RunOutcome};
use crate::logging::services;

/// A step ready to run, with the ids of the steps it depends on
pub(crate) struct ScheduledRun<'a> {
    pub run: FunctionRun<'a>,
    pub depends: Vec<String>,
}

/// Result of one step
#[derive(Debug, Clone)]
pub(crate) struct StepResult {
    pub id: String,
    pub key: CacheKey,
    pub args: Map<String, Value>,
    pub outcome: RunOutcome,
    pub envelope: MetadataEnvelope,
    pub elapsed: Duration,
}

type Completed = BTreeMap<String, MetadataEnvelope>;

/// Run every step, in declaration order when `jobs == 1`, otherwise level
/// by level with up to `jobs` workers. Steps connected by `depends` are
/// always in different levels. Results come back in declaration order.
pub(crate) fn execute(
    runs: Vec<ScheduledRun<'_>>,
    jobs: usize,
    cancel: &CancelFlag,
) -> Result<Vec<StepResult>> {
    let mut completed = Completed::new();
    let mut results = Vec::with_capacity(runs.len());

    if jobs <= 1 {
        for scheduled in runs {
            cancel.check()?;
            let result = run_one(scheduled.run, &completed)?;
            completed.insert(result.id.clone(), result.envelope.clone());
            results.push(result);
        }
        return Ok(results);
    }

    let levels = levels(&runs);
    let mut pending: Vec<Option<FunctionRun<'_>>> =
        runs.into_iter().map(|s| Some(s.run)).collect();
    let mut finished: Vec<Option<StepResult>> = (0..pending.len()).map(|_| None).collect();

    for (depth, level) in levels.iter().enumerate() {
        cancel.check()?;
        debug!(
            service = services::BATCH,
            level = depth,
            steps = level.len(),
            "scheduling level"
        );
        let batch: Vec<(usize, FunctionRun<'_>)> = level
            .iter()
            .filter_map(|&i| pending[i].take().map(|run| (i, run)))
            .collect();

        for (index, result) in run_level(batch, jobs, &completed)? {
            completed.insert(result.id.clone(), result.envelope.clone());
            finished[index] = Some(result);
        }
    }

    results.extend(finished.into_iter().flatten());
    Ok(results)
}

fn run_one(mut run: FunctionRun<'_>, completed: &Completed) -> Result<StepResult> {
    let start = Instant::now();
    let (envelope, outcome) = run.execute_or_restore(completed)?;
    Ok(StepResult {
        id: run.step_id().to_string(),
        key: run.key().clone(),
        args: run.args().clone(),
        outcome,
        envelope,
        elapsed: start.elapsed(),
    })
}

/// Run independent steps on a scoped worker pool. Once one step fails no
/// further steps are started; the failure of the earliest declared step wins.
fn run_level(
    batch: Vec<(usize, FunctionRun<'_>)>,
    jobs: usize,
    completed: &Completed,
) -> Result<Vec<(usize, StepResult)>> {
    let workers = jobs.min(batch.len()).max(1);
    let (job_tx, job_rx) = unbounded();
    let (result_tx, result_rx) = unbounded();
    let failed = AtomicBool::new(false);

    for job in batch {
        if let Err(SendError((_, run))) = job_tx.send(job) {
            return Err(PrecisError::Execution {
                step: run.step_id().to_string(),
                source: anyhow::anyhow!("worker pool closed before the step was scheduled"),
            });
        }
    }
    drop(job_tx);

    thread::scope(|scope| {
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            let failed = &failed;
            scope.spawn(move || {
                for (index, run) in job_rx.iter() {
                    if failed.load(Ordering::SeqCst) {
                        break;
                    }
                    let result = run_one(run, completed);
                    if result.is_err() {
                        failed.store(true, Ordering::SeqCst);
                    }
                    if result_tx.send((index, result)).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(result_tx);

    let mut outcomes: Vec<(usize, Result<StepResult>)> = result_rx.iter().collect();
    outcomes.sort_by_key(|(index, _)| *index);
    outcomes
        .into_iter()
        .map(|(index, result)| result.map(|r| (index, r)))
        .collect()
}

/// Group step indices so every step sits one level below its deepest
/// dependency. Dependencies always precede their dependents.
///
/// A step sharing its key with an earlier step is placed below that step
/// too, so the key executes once and the later step finds it cached.
fn levels(runs: &[ScheduledRun<'_>]) -> Vec<Vec<usize>> {
    let mut level_of: HashMap<&str, usize> = HashMap::new();
    let mut first_with_key: HashMap<&CacheKey, usize> = HashMap::new();
    let mut levels: Vec<Vec<usize>> = Vec::new();

    for (index, scheduled) in runs.iter().enumerate() {
        let after_same_key = first_with_key.get(scheduled.run.key()).map(|l| l + 1);
        let level = scheduled
            .depends
            .iter()
            .filter_map(|dep| level_of.get(dep.as_str()))
            .map(|l| l + 1)
            .chain(after_same_key)
            .max()
            .unwrap_or(0);
        if after_same_key.is_none() {
            first_with_key.insert(scheduled.run.key(), level);
        }
        level_of.insert(scheduled.run.step_id(), level);
        if levels.len() <= level {
            levels.resize_with(level + 1, Vec::new);
        }
        levels[level].push(index);
    }

    levels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::{FunctionRegistry, FunctionSource, StepFunction};
    use crate::remote::RemoteSet;
    use crate::storage::CacheStore;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    struct Env {
        _temp: TempDir,
        store: CacheStore,
        remotes: RemoteSet,
        cancel: CancelFlag,
        registry: FunctionRegistry,
    }

    /// `value(x)` returns x after a short sleep, recording how many run at once
    fn env(active: Arc<AtomicUsize>, peak: Arc<AtomicUsize>, order: Arc<Mutex<Vec<i64>>>) -> Env {
        let temp = TempDir::new().unwrap();
        let value = StepFunction::new("value", "v1", move |_ctx, args| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            let x = args["x"].as_i64().unwrap_or_default();
            order.lock().unwrap().push(x);
            active.fetch_sub(1, Ordering::SeqCst);
            if x < 0 {
                anyhow::bail!("negative input");
            }
            Ok(json!(x))
        });
        Env {
            store: CacheStore::new(temp.path()).unwrap(),
            _temp: temp,
            remotes: RemoteSet::new(),
            cancel: CancelFlag::new(),
            registry: FunctionRegistry::new().with_source(FunctionSource::new("t").with(value)),
        }
    }

    impl Env {
        fn scheduled(&self, id: &str, x: i64, depends: &[&str]) -> ScheduledRun<'_> {
            let args = json!({"x": x}).as_object().cloned().unwrap();
            ScheduledRun {
                run: FunctionRun::new(
                    id,
                    self.registry.resolve("value").unwrap(),
                    args,
                    None,
                    &self.store,
                    &self.remotes,
                    &self.cancel,
                ),
                depends: depends.iter().map(|d| d.to_string()).collect(),
            }
        }
    }

    fn counters() -> (Arc<AtomicUsize>, Arc<AtomicUsize>, Arc<Mutex<Vec<i64>>>) {
        (
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
            Arc::new(Mutex::new(Vec::new())),
        )
    }

    #[test]
    fn test_levels_follow_depends() {
        let (a, p, o) = counters();
        let env = env(a, p, o);
        let runs = vec![
            env.scheduled("a", 1, &[]),
            env.scheduled("b", 2, &[]),
            env.scheduled("c", 3, &["a"]),
            env.scheduled("d", 4, &["c", "b"]),
        ];
        assert_eq!(levels(&runs), vec![vec![0, 1], vec![2], vec![3]]);
    }

    #[test]
    fn test_same_key_waits_for_first_step() {
        let (a, p, o) = counters();
        let env = env(a, p, o);
        let runs = vec![
            env.scheduled("a", 1, &[]),
            env.scheduled("b", 2, &[]),
            env.scheduled("again", 1, &[]),
            env.scheduled("c", 3, &["again"]),
        ];
        assert_eq!(levels(&runs), vec![vec![0, 1], vec![2], vec![3]]);
    }

    #[test]
    fn test_parallel_executes_shared_key_once() {
        let (active, peak, order) = counters();
        let env = env(active, peak, order.clone());
        let runs = vec![env.scheduled("first", 5, &[]), env.scheduled("second", 5, &[])];

        let results = execute(runs, 2, &env.cancel).unwrap();

        assert_eq!(order.lock().unwrap().len(), 1);
        assert_eq!(results[0].outcome, RunOutcome::Executed);
        assert_eq!(results[1].outcome, RunOutcome::Local);
        assert_eq!(results[0].key, results[1].key);
    }

    #[test]
    fn test_parallel_runs_independent_steps_together() {
        let (active, peak, order) = counters();
        let env = env(active, peak.clone(), order.clone());
        let runs = vec![
            env.scheduled("a", 1, &[]),
            env.scheduled("b", 2, &[]),
            env.scheduled("c", 3, &["a", "b"]),
        ];

        let results = execute(runs, 4, &env.cancel).unwrap();

        let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        // The dependent step always runs last
        assert_eq!(order.lock().unwrap().last(), Some(&3));
    }

    #[test]
    fn test_sequential_never_overlaps() {
        let (active, peak, order) = counters();
        let env = env(active, peak.clone(), order);
        let runs = vec![env.scheduled("a", 1, &[]), env.scheduled("b", 2, &[])];

        execute(runs, 1, &env.cancel).unwrap();
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_parallel_failure_reports_step() {
        let (active, peak, order) = counters();
        let env = env(active, peak, order);
        let runs = vec![env.scheduled("ok", 1, &[]), env.scheduled("bad", -1, &[])];

        match execute(runs, 2, &env.cancel) {
            Err(PrecisError::Execution { step, .. }) => assert_eq!(step, "bad"),
            other => panic!("expected Execution error, got {other:?}"),
        }
    }

    #[test]
    fn test_cancelled_before_start() {
        let (active, peak, order) = counters();
        let env = env(active, peak, order.clone());
        env.cancel.cancel();
        let runs = vec![env.scheduled("a", 1, &[])];

        assert!(matches!(
            execute(runs, 1, &env.cancel),
            Err(PrecisError::Cancelled)
        ));
        assert!(order.lock().unwrap().is_empty());
    }
}
