//! JSON facade over the scheduler.
//!
//! Other services reach the scheduler through [`SchedulerRpc`]: a method
//! name, an optional caller-assigned request id and JSON parameters in,
//! JSON out. Requests carrying an id are de-duplicated for the configured
//! window, so a caller retrying after a lost response gets the original
//! answer instead of a second command. A repeat arriving while the first
//! call is still running waits for its answer.
//!
//! Scheduler methods are synchronous and touch the store, so each call runs
//! on the blocking pool.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lustre_manager_core::{CommandId, EntityRef, JobId};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::agent_rpc::Envelope;
use crate::command_plan::{JobRequest, StateRequest};
use crate::create::{ConfParamUpdate, CreateClientMount, CreateCopytool, CreateFilesystem, CreateHost};
use crate::error::{Result, SchedulerError};
use crate::notify::Notification;
use crate::scheduler::JobScheduler;

/// The scheduler as seen by other services.
#[async_trait]
pub trait SchedulerRpc: Send + Sync {
    /// Invoke a facade method.
    ///
    /// # Errors
    ///
    /// Returns `UnknownMethod` for unknown names, `DuplicateRequest` when
    /// `request_id` was used for a different call within the window, and
    /// the method's own error otherwise.
    async fn call(&self, method: &str, request_id: Option<&str>, params: Value) -> Result<Value>;

    /// Hand an inbound agent-bus envelope to the messenger.
    async fn agent_message(&self, envelope: Envelope);
}

// =============================================================================
// Parameters
// =============================================================================

#[derive(Debug, Deserialize)]
struct SetStateParams {
    requests: Vec<StateRequest>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct RunJobsParams {
    jobs: Vec<JobRequest>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct JobParams {
    job_id: JobId,
}

#[derive(Debug, Deserialize)]
struct CommandParams {
    command_id: CommandId,
}

#[derive(Debug, Deserialize)]
struct ItemParams {
    #[serde(flatten)]
    item: EntityRef,
}

#[derive(Debug, Deserialize)]
struct ItemsParams {
    items: Vec<EntityRef>,
}

#[derive(Debug, Deserialize)]
struct ConsequencesParams {
    #[serde(flatten)]
    item: EntityRef,
    state: String,
}

#[derive(Debug, Deserialize)]
struct AlertsParams {
    #[serde(default)]
    active_only: bool,
}

#[derive(Debug, Deserialize)]
struct ConfParamsParams {
    params: Vec<ConfParamUpdate>,
}

fn parse<T: DeserializeOwned>(method: &str, params: Value) -> Result<T> {
    serde_json::from_value(params)
        .map_err(|e| SchedulerError::InvalidRequest(format!("bad parameters for {method}: {e}")))
}

fn message_or(message: String, default: impl FnOnce() -> String) -> String {
    if message.trim().is_empty() {
        default()
    } else {
        message
    }
}

// =============================================================================
// Service
// =============================================================================

enum Answer {
    /// Still running. The sender side drops once the answer is settled.
    InFlight(watch::Receiver<()>),
    Done(Value),
}

struct Answered {
    fingerprint: blake3::Hash,
    at: Instant,
    answer: Answer,
}

enum Claim {
    Replay(Value),
    Wait(watch::Receiver<()>),
    Run(watch::Sender<()>),
}

/// [`SchedulerRpc`] over an in-process [`JobScheduler`].
pub struct SchedulerService {
    scheduler: Arc<JobScheduler>,
    dedup_window: Duration,
    answered: Mutex<HashMap<String, Answered>>,
}

impl SchedulerService {
    /// Serve `scheduler`.
    #[must_use]
    pub fn new(scheduler: Arc<JobScheduler>) -> Self {
        let dedup_window = scheduler.context().config().request_dedup_window();
        Self {
            scheduler,
            dedup_window,
            answered: Mutex::new(HashMap::new()),
        }
    }

    /// The scheduler being served.
    #[must_use]
    pub const fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.scheduler
    }

    /// Decide what a call with `request_id` does: replay a settled answer,
    /// wait for one in flight, or run and be the one others wait for.
    fn claim(&self, request_id: &str, fingerprint: blake3::Hash) -> Result<Claim> {
        let mut answered = self.answered.lock();
        let window = self.dedup_window;
        answered.retain(|_, a| matches!(a.answer, Answer::InFlight(_)) || a.at.elapsed() < window);
        if let Some(a) = answered.get(request_id) {
            if a.fingerprint != fingerprint {
                return Err(SchedulerError::DuplicateRequest(request_id.to_string()));
            }
            match &a.answer {
                Answer::Done(response) => {
                    tracing::debug!(request_id, "Replaying answer to repeated request");
                    return Ok(Claim::Replay(response.clone()));
                }
                // A closed channel means the first caller went away unsettled.
                Answer::InFlight(running) if running.has_changed().is_ok() => {
                    return Ok(Claim::Wait(running.clone()));
                }
                Answer::InFlight(_) => {}
            }
        }
        let (done, running) = watch::channel(());
        answered.insert(
            request_id.to_string(),
            Answered {
                fingerprint,
                at: Instant::now(),
                answer: Answer::InFlight(running),
            },
        );
        Ok(Claim::Run(done))
    }

    /// Record the outcome of a claimed call. Failures are not kept, so a
    /// retry runs again.
    fn settle(&self, request_id: &str, outcome: &Result<Value>) {
        let mut answered = self.answered.lock();
        match outcome {
            Ok(response) => {
                if let Some(a) = answered.get_mut(request_id) {
                    a.at = Instant::now();
                    a.answer = Answer::Done(response.clone());
                }
            }
            Err(_) => {
                answered.remove(request_id);
            }
        }
    }

    async fn run(&self, method: &str, params: Value) -> Result<Value> {
        let scheduler = Arc::clone(&self.scheduler);
        let name = method.to_string();
        tokio::task::spawn_blocking(move || dispatch(&scheduler, &name, params))
            .await
            .map_err(|e| SchedulerError::Internal(format!("{method} did not finish: {e}")))?
    }
}

fn dispatch(s: &JobScheduler, method: &str, params: Value) -> Result<Value> {
    let value = match method {
        "set_state" => {
            let p: SetStateParams = parse(method, params)?;
            let message = message_or(p.message, || {
                let items: Vec<String> = p.requests.iter().map(|r| r.item.to_string()).collect();
                format!("Change state of {}", items.join(", "))
            });
            serde_json::to_value(s.set_state(&p.requests, &message)?)?
        }
        "run_jobs" => {
            let p: RunJobsParams = parse(method, params)?;
            let message = message_or(p.message, || {
                let classes: Vec<&str> = p.jobs.iter().map(|j| j.class_name.as_str()).collect();
                format!("Run {}", classes.join(", "))
            });
            serde_json::to_value(s.run_jobs(&p.jobs, &message)?)?
        }
        "cancel_job" => {
            let p: JobParams = parse(method, params)?;
            serde_json::to_value(s.cancel_job(p.job_id)?)?
        }
        "cancel_command" => {
            let p: CommandParams = parse(method, params)?;
            serde_json::to_value(s.cancel_command(p.command_id)?)?
        }
        "get_command" => {
            let p: CommandParams = parse(method, params)?;
            serde_json::to_value(s.get_command(p.command_id)?)?
        }
        "get_job" => {
            let p: JobParams = parse(method, params)?;
            json!({
                "job": s.get_job(p.job_id)?,
                "steps": s.step_results(p.job_id)?,
            })
        }
        "available_transitions" => {
            let p: ItemsParams = parse(method, params)?;
            let out: BTreeMap<String, _> = p
                .items
                .iter()
                .map(|item| (item.to_string(), s.available_transitions(*item)))
                .collect();
            serde_json::to_value(out)?
        }
        "available_jobs" => {
            let p: ItemsParams = parse(method, params)?;
            let out: BTreeMap<String, _> = p
                .items
                .iter()
                .map(|item| (item.to_string(), s.available_jobs(*item)))
                .collect();
            serde_json::to_value(out)?
        }
        "get_transition_consequences" => {
            let p: ConsequencesParams = parse(method, params)?;
            serde_json::to_value(s.transition_consequences(p.item, &p.state)?)?
        }
        "get_locks" => {
            let p: ItemParams = parse(method, params)?;
            serde_json::to_value(s.get_locks(p.item))?
        }
        "notify" => {
            let p: Notification = parse(method, params)?;
            serde_json::to_value(s.notify(p)?)?
        }
        "create_host" => {
            let p: CreateHost = parse(method, params)?;
            serde_json::to_value(s.create_host(&p)?)?
        }
        "create_filesystem" => {
            let p: CreateFilesystem = parse(method, params)?;
            let (filesystem, command) = s.create_filesystem(&p)?;
            json!({ "filesystem": filesystem, "command": command })
        }
        "create_client_mount" => {
            let p: CreateClientMount = parse(method, params)?;
            serde_json::to_value(s.create_client_mount(&p)?)?
        }
        "create_copytool" => {
            let p: CreateCopytool = parse(method, params)?;
            serde_json::to_value(s.create_copytool(&p)?)?
        }
        "set_conf_params" => {
            let p: ConfParamsParams = parse(method, params)?;
            serde_json::to_value(s.set_conf_params(&p.params)?)?
        }
        "list_alerts" => {
            let p: AlertsParams = parse(method, params)?;
            serde_json::to_value(s.alerts(p.active_only)?)?
        }
        other => return Err(SchedulerError::UnknownMethod(other.to_string())),
    };
    Ok(value)
}

#[async_trait]
impl SchedulerRpc for SchedulerService {
    async fn call(&self, method: &str, request_id: Option<&str>, params: Value) -> Result<Value> {
        let Some(request_id) = request_id else {
            return self.run(method, params).await;
        };
        let fingerprint = blake3::hash(format!("{method}\n{params}").as_bytes());
        let _done = loop {
            match self.claim(request_id, fingerprint)? {
                Claim::Replay(response) => return Ok(response),
                Claim::Wait(mut running) => {
                    tracing::debug!(request_id, "Waiting for the answer to a repeated request");
                    let _ = running.changed().await;
                }
                Claim::Run(done) => break done,
            }
        };

        let outcome = self.run(method, params).await;
        self.settle(request_id, &outcome);
        outcome
    }

    async fn agent_message(&self, envelope: Envelope) {
        self.scheduler.context().messenger().on_message(envelope).await;
    }
}

#[cfg(test)]
mod tests {
    use lustre_manager_core::ClassTag;
    use lustre_manager_store::{CommandRecord, RocksStore, Store};
    use tempfile::TempDir;

    use super::*;
    use crate::config::SchedulerConfig;
    use crate::mock::{fixtures, Harness};

    struct Setup {
        _dir: TempDir,
        harness: Harness,
        service: SchedulerService,
        server: fixtures::ServerLayout,
    }

    async fn setup() -> Setup {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn Store> = Arc::new(RocksStore::open(dir.path()).unwrap());
        let server = fixtures::managed_server(store.as_ref(), "oss1.example.com", 0).unwrap();
        let harness = Harness::start(store, SchedulerConfig::default()).await.unwrap();
        let service = SchedulerService::new(Arc::clone(&harness.scheduler));
        Setup {
            _dir: dir,
            harness,
            service,
            server,
        }
    }

    fn stop_lnet(s: &Setup) -> Value {
        json!({
            "requests": [{ "class_tag": "lnet_configuration", "id": s.server.lnet_id, "state": "lnet_down" }],
            "message": "Stop LNet",
        })
    }

    #[tokio::test(start_paused = true)]
    async fn set_state_returns_the_command() {
        let s = setup().await;
        let value = s.service.call("set_state", None, stop_lnet(&s)).await.unwrap();
        let command: CommandRecord = serde_json::from_value(value).unwrap();
        assert_eq!(command.message, "Stop LNet");
        assert_eq!(command.jobs.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_request_is_answered_once() {
        let s = setup().await;
        let first = s
            .service
            .call("set_state", Some("req-1"), stop_lnet(&s))
            .await
            .unwrap();
        let again = s
            .service
            .call("set_state", Some("req-1"), stop_lnet(&s))
            .await
            .unwrap();
        assert_eq!(first, again);
        assert_eq!(s.harness.ctx().store().list_incomplete_commands().unwrap().len(), 1);

        let err = s
            .service
            .call("get_locks", Some("req-1"), json!({ "class_tag": "host", "id": 1 }))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateRequest(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_repeats_share_one_command() {
        let s = setup().await;
        let (first, second) = tokio::join!(
            s.service.call("set_state", Some("req-3"), stop_lnet(&s)),
            s.service.call("set_state", Some("req-3"), stop_lnet(&s)),
        );
        let first: CommandRecord = serde_json::from_value(first.unwrap()).unwrap();
        let second: CommandRecord = serde_json::from_value(second.unwrap()).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(s.harness.ctx().store().list_incomplete_commands().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_request_is_not_remembered() {
        let s = setup().await;
        let err = s
            .service
            .call("get_job", Some("req-4"), json!({ "job_id": 999 }))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::JobNotFound(_)));
        assert!(s.service.answered.lock().get("req-4").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn request_ids_expire_after_the_window() {
        let s = setup().await;
        let params = json!({ "class_tag": "host", "id": s.server.host_id });
        s.service.call("get_locks", Some("req-2"), params).await.unwrap();

        tokio::time::advance(s.service.dedup_window + Duration::from_secs(1)).await;
        let other = json!({ "items": [{ "class_tag": "host", "id": s.server.host_id }] });
        s.service
            .call("available_transitions", Some("req-2"), other)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_method_and_missing_records() {
        let s = setup().await;
        let err = s.service.call("reticulate", None, json!({})).await.unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownMethod(_)));
        assert_eq!(err.http_status_code(), 404);

        let err = s
            .service
            .call("get_job", None, json!({ "job_id": 999 }))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::JobNotFound(_)));

        let err = s
            .service
            .call("cancel_command", None, json!({ "command": 1 }))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidRequest(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn queries_are_keyed_by_entity() {
        let s = setup().await;
        let host = EntityRef::new(ClassTag::Host, s.server.host_id);
        let value = s
            .service
            .call("available_transitions", None, json!({ "items": [host] }))
            .await
            .unwrap();
        let states: Vec<&str> = value[host.to_string()]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|t| t["state"].as_str())
            .collect();
        assert!(states.contains(&"removed"), "{value}");
    }
}
