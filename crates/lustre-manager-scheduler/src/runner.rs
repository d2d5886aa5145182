//! Step execution for one job.
//!
//! The runner walks a job's steps in order, writing a step result before
//! each step starts and again when it ends, so a restarted scheduler can
//! tell which step was interrupted.

use chrono::Utc;
use lustre_manager_core::{JobId, StepResultId};
use lustre_manager_store::{IdSpace, JobRecord, StepResultRecord, StepState, WriteSet};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::context::SchedulerContext;
use crate::error::Result;
use crate::jobs::Job;
use crate::steps::{Step, StepContext};

/// How a job run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Every step succeeded.
    Succeeded,
    /// A step failed, or the steps could not be computed.
    Errored,
    /// The job was cancelled between or during steps.
    Cancelled,
}

/// Run `job`'s steps from `start_at`.
///
/// Resuming at a non-zero index hands the result of the last successful
/// step before it to the first step run.
pub async fn run_job(
    ctx: &SchedulerContext,
    record: &JobRecord,
    job: Job,
    start_at: usize,
    cancel: &CancellationToken,
) -> JobOutcome {
    let steps = match job.steps(ctx.cache(), ctx.config()) {
        Ok(steps) => steps,
        Err(e) => {
            tracing::error!(job_id = %record.id, job = %job, error = %e, "Could not compute steps");
            return JobOutcome::Errored;
        }
    };

    let mut prev_result = if start_at == 0 {
        Value::Null
    } else {
        resumed_result(ctx, record.id, start_at)
    };

    tracing::info!(
        job_id = %record.id,
        job = %job,
        steps = steps.len(),
        start_at,
        "Running job"
    );

    for (index, step) in steps.iter().enumerate().skip(start_at) {
        if cancel.is_cancelled() {
            return JobOutcome::Cancelled;
        }
        match run_step(ctx, record.id, step, index, steps.len(), prev_result, cancel).await {
            Ok(StepOutcome::Done(result)) => prev_result = result,
            Ok(StepOutcome::Failed) => return JobOutcome::Errored,
            Ok(StepOutcome::Cancelled) => return JobOutcome::Cancelled,
            Err(e) => {
                tracing::error!(job_id = %record.id, error = %e, "Could not record step result");
                return JobOutcome::Errored;
            }
        }
    }

    if cancel.is_cancelled() {
        JobOutcome::Cancelled
    } else {
        JobOutcome::Succeeded
    }
}

enum StepOutcome {
    Done(Value),
    Failed,
    Cancelled,
}

async fn run_step(
    ctx: &SchedulerContext,
    job_id: JobId,
    step: &Step,
    index: usize,
    count: usize,
    prev_result: Value,
    cancel: &CancellationToken,
) -> Result<StepOutcome> {
    let now = Utc::now();
    let mut result = StepResultRecord {
        id: StepResultId::new(ctx.next_id(IdSpace::StepResult)?),
        job_id,
        step_index: index,
        step_count: count,
        step_class: step.class_name().to_string(),
        args_json: serde_json::to_string(&step.args())?,
        state: StepState::Incomplete,
        log: String::new(),
        backtrace: String::new(),
        console: String::new(),
        result_json: None,
        created_at: now,
        modified_at: now,
    };
    save(ctx, result.clone())?;

    tracing::debug!(
        job_id = %job_id,
        step = index,
        step_class = step.class_name(),
        "Step started"
    );

    let step_ctx = StepContext::new(ctx, job_id, cancel, prev_result);
    let outcome = step.run(&step_ctx).await;
    let (log, console) = step_ctx.take_output();
    result.log = log;
    result.console = console;
    result.modified_at = Utc::now();

    let outcome = match outcome {
        Ok(value) => {
            result.state = StepState::Success;
            result.result_json = Some(serde_json::to_string(&value)?);
            StepOutcome::Done(value)
        }
        Err(e) if e.is_cancellation() => {
            tracing::info!(job_id = %job_id, step = index, "Step cancelled");
            StepOutcome::Cancelled
        }
        Err(e) => {
            tracing::error!(
                job_id = %job_id,
                step = index,
                step_class = step.class_name(),
                error = %e,
                "Step failed"
            );
            result.state = StepState::Failed;
            result.backtrace = e.backtrace();
            StepOutcome::Failed
        }
    };
    save(ctx, result)?;
    Ok(outcome)
}

fn save(ctx: &SchedulerContext, result: StepResultRecord) -> Result<()> {
    let mut writes = WriteSet::new();
    writes.put_step_result(result);
    ctx.write(writes)
}

fn resumed_result(ctx: &SchedulerContext, job_id: JobId, start_at: usize) -> Value {
    let results = match ctx.store().list_step_results(job_id) {
        Ok(results) => results,
        Err(e) => {
            tracing::warn!(job_id = %job_id, error = %e, "Could not load step results");
            return Value::Null;
        }
    };
    results
        .iter()
        .rev()
        .find(|r| r.step_index < start_at && r.state == StepState::Success)
        .and_then(|r| r.result_json.as_deref())
        .and_then(|json| serde_json::from_str(json).ok())
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use lustre_manager_core::{ClassTag, EntityRef};
    use lustre_manager_store::{JobState, RocksStore, Store};
    use tempfile::TempDir;

    use super::*;
    use crate::agent_rpc::{AgentMessenger, Transport};
    use crate::config::SchedulerConfig;
    use crate::jobs::JobClass;
    use crate::local::LocalActions;
    use crate::mock::{fixtures, MockAgentFleet, MockLocalActions};

    struct Setup {
        _dir: TempDir,
        ctx: SchedulerContext,
        fleet: Arc<MockAgentFleet>,
        server: fixtures::ServerLayout,
    }

    fn setup() -> Setup {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn Store> = Arc::new(RocksStore::open(dir.path()).unwrap());
        let server = fixtures::managed_server(store.as_ref(), "oss1.example.com", 0).unwrap();
        let config = SchedulerConfig {
            session_wait_timeout_seconds: 1,
            ..SchedulerConfig::default()
        };
        let fleet = MockAgentFleet::new();
        let messenger = Arc::new(AgentMessenger::new(
            Arc::clone(&fleet) as Arc<dyn Transport>,
            &config,
        ));
        fleet.attach(&messenger);
        let local = MockLocalActions::with_fleet(Arc::clone(&fleet));
        let ctx =
            SchedulerContext::new(store, config, messenger, local as Arc<dyn LocalActions>).unwrap();
        Setup {
            _dir: dir,
            ctx,
            fleet,
            server,
        }
    }

    fn record(id: u64, job: Job) -> JobRecord {
        JobRecord {
            id: JobId::new(id),
            class_name: job.class.name().to_string(),
            args_json: job.args().to_string(),
            description: String::new(),
            state: JobState::Tasked,
            errored: false,
            cancelled: false,
            locks: Vec::new(),
            wait_for: Vec::new(),
            created_at: Utc::now(),
            modified_at: Utc::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn successful_steps_chain_results() {
        let s = setup();
        s.fleet.connect("oss1.example.com").await;
        let job = Job::new(JobClass::StartLnet, s.server.lnet_id);
        let rec = record(1, job);

        let outcome = run_job(&s.ctx, &rec, job, 0, &CancellationToken::new()).await;
        assert_eq!(outcome, JobOutcome::Succeeded);

        let results = s.ctx.store().list_step_results(rec.id).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.state == StepState::Success));
        assert_eq!(results[1].step_class, "LearnNids");
        let lnet = s
            .ctx
            .cache()
            .get(EntityRef::new(ClassTag::LnetConfiguration, s.server.lnet_id))
            .unwrap();
        assert_eq!(lnet.as_lnet().unwrap().nids, ["oss1.example.com@tcp0"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_step_records_backtrace() {
        let s = setup();
        s.fleet.connect("oss1.example.com").await;
        s.fleet
            .fail_action("oss1.example.com", "stop_lnet", "lnet in use");
        let job = Job::new(JobClass::StopLnet, s.server.lnet_id);
        let rec = record(2, job);

        let outcome = run_job(&s.ctx, &rec, job, 0, &CancellationToken::new()).await;
        assert_eq!(outcome, JobOutcome::Errored);

        let results = s.ctx.store().list_step_results(rec.id).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].state, StepState::Failed);
        assert!(results[0].backtrace.contains("lnet in use"));
        assert!(results[0].console.contains("lnet in use"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_start_runs_nothing() {
        let s = setup();
        let job = Job::new(JobClass::StopLnet, s.server.lnet_id);
        let rec = record(3, job);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = run_job(&s.ctx, &rec, job, 0, &cancel).await;
        assert_eq!(outcome, JobOutcome::Cancelled);
        assert!(s.ctx.store().list_step_results(rec.id).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn resume_skips_completed_steps() {
        let s = setup();
        s.fleet.connect("oss1.example.com").await;
        let job = Job::new(JobClass::StartLnet, s.server.lnet_id);
        let rec = record(4, job);

        let outcome = run_job(&s.ctx, &rec, job, 1, &CancellationToken::new()).await;
        assert_eq!(outcome, JobOutcome::Succeeded);
        assert!(!s
            .fleet
            .actions_for("oss1.example.com")
            .contains(&"start_lnet".to_string()));
        let results = s.ctx.store().list_step_results(rec.id).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].step_index, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_session_errors_the_job() {
        let s = setup();
        let job = Job::new(JobClass::StopLnet, s.server.lnet_id);
        let rec = record(5, job);

        let outcome = run_job(&s.ctx, &rec, job, 0, &CancellationToken::new()).await;
        assert_eq!(outcome, JobOutcome::Errored);
        let results = s.ctx.store().list_step_results(rec.id).unwrap();
        assert!(results[0].backtrace.contains("no session"));
    }
}
