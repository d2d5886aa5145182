//! Scripted agents for testing.
//!
//! [`MockAgentFleet`] stands in for the transport service and every agent
//! behind it. Envelopes the messenger sends are recorded; `ACTION_START`s are
//! answered with canned results unless the agent has been told to fail the
//! action or to fall silent.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use lustre_manager_core::SessionId;
use parking_lot::Mutex;
use serde_json::{json, Value};

use super::envelope::{Body, Envelope, MessageType, Subprocess};
use super::messenger::AgentMessenger;
use super::transport::Transport;
use crate::error::AgentError;

/// One action an agent was asked to run.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentCall {
    /// Host.
    pub fqdn: String,
    /// Action name.
    pub action: String,
    /// Action arguments.
    pub args: Value,
}

#[derive(Debug, Default)]
struct MockAgent {
    session_id: Option<SessionId>,
    silent: bool,
    failures: HashMap<String, String>,
    results: HashMap<String, Value>,
    reboot_required: bool,
}

/// A fleet of simulated agents behind a simulated transport.
#[derive(Default)]
pub struct MockAgentFleet {
    messenger: OnceLock<Weak<AgentMessenger>>,
    agents: Mutex<HashMap<String, MockAgent>>,
    resources: Mutex<HashMap<String, String>>,
    sent: Mutex<Vec<Envelope>>,
    calls: Mutex<Vec<AgentCall>>,
}

impl MockAgentFleet {
    /// Create an empty fleet.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver agent messages to `messenger`.
    pub fn attach(&self, messenger: &Arc<AgentMessenger>) {
        let _ = self.messenger.set(Arc::downgrade(messenger));
    }

    fn messenger(&self) -> Option<Arc<AgentMessenger>> {
        self.messenger.get().and_then(Weak::upgrade)
    }

    /// Have the agent on `fqdn` open a session.
    pub async fn connect(&self, fqdn: &str) {
        self.agents.lock().entry(fqdn.to_string()).or_default();
        if let Some(messenger) = self.messenger() {
            messenger
                .on_message(Envelope::control(fqdn, MessageType::SessionCreateRequest, None))
                .await;
        }
    }

    /// Have the transport report the agent's session terminated.
    pub async fn disconnect(&self, fqdn: &str) {
        if let Some(agent) = self.agents.lock().get_mut(fqdn) {
            agent.session_id = None;
        }
        if let Some(messenger) = self.messenger() {
            messenger
                .on_message(Envelope::control(fqdn, MessageType::SessionTerminate, None))
                .await;
        }
    }

    /// Stop (or resume) answering actions on `fqdn`.
    pub fn set_silent(&self, fqdn: &str, silent: bool) {
        self.agents.lock().entry(fqdn.to_string()).or_default().silent = silent;
    }

    /// Make `action` raise on `fqdn` with `message` as its backtrace.
    pub fn fail_action(&self, fqdn: &str, action: &str, message: &str) {
        self.agents
            .lock()
            .entry(fqdn.to_string())
            .or_default()
            .failures
            .insert(action.to_string(), message.to_string());
    }

    /// Answer `action` on `fqdn` with `result`.
    pub fn set_result(&self, fqdn: &str, action: &str, result: Value) {
        self.agents
            .lock()
            .entry(fqdn.to_string())
            .or_default()
            .results
            .insert(action.to_string(), result);
    }

    /// Whether package installation on `fqdn` asks for a reboot.
    pub fn set_reboot_required(&self, fqdn: &str, required: bool) {
        self.agents
            .lock()
            .entry(fqdn.to_string())
            .or_default()
            .reboot_required = required;
    }

    /// Every action started, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<AgentCall> {
        self.calls.lock().clone()
    }

    /// Names of the actions started on `fqdn`, in order.
    #[must_use]
    pub fn actions_for(&self, fqdn: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.fqdn == fqdn)
            .map(|c| c.action.clone())
            .collect()
    }

    /// Every envelope the messenger sent.
    #[must_use]
    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().clone()
    }

    /// Session the agent on `fqdn` was granted.
    #[must_use]
    pub fn session_id(&self, fqdn: &str) -> Option<SessionId> {
        self.agents.lock().get(fqdn).and_then(|a| a.session_id)
    }

    fn answer(&self, fqdn: &str, action: &str, args: &Value) -> Option<Result<Value, String>> {
        let agents = self.agents.lock();
        let agent = agents.get(fqdn)?;
        if agent.silent {
            return None;
        }
        if let Some(message) = agent.failures.get(action) {
            return Some(Err(message.clone()));
        }
        if let Some(result) = agent.results.get(action) {
            return Some(Ok(result.clone()));
        }
        let label = args["ha_label"].as_str().unwrap_or_default().to_string();
        let result = match action {
            "install_packages" => json!({ "reboot_required": agent.reboot_required }),
            "format_target" => json!({
                "uuid": uuid::Uuid::new_v4().to_string(),
                "inode_size": 512,
                "filesystem_type": "ldiskfs",
            }),
            "register_target" => json!({ "label": args["target_name"] }),
            "get_nids" => json!({ "nids": [format!("{fqdn}@tcp0")] }),
            "start_target" => {
                self.resources.lock().insert(label, fqdn.to_string());
                Value::Null
            }
            "stop_target" => {
                self.resources.lock().remove(&label);
                Value::Null
            }
            "move_target" => {
                let destination = args["destination"].as_str().unwrap_or(fqdn).to_string();
                self.resources.lock().insert(label, destination);
                Value::Null
            }
            "check_ha_resource" => json!({
                "location": self.resources.lock().get(&label).cloned(),
                "transitioning": false,
            }),
            _ => Value::Null,
        };
        Some(Ok(result))
    }
}

#[async_trait]
impl Transport for MockAgentFleet {
    async fn send(&self, envelope: Envelope) -> Result<(), AgentError> {
        self.sent.lock().push(envelope.clone());
        let fqdn = envelope.fqdn.clone();
        match envelope.message_type {
            MessageType::SessionCreateResponse => {
                self.agents.lock().entry(fqdn).or_default().session_id = envelope.session_id;
            }
            MessageType::SessionTerminateAll => {
                for agent in self.agents.lock().values_mut() {
                    agent.session_id = None;
                }
            }
            MessageType::Data => {
                let (Some(session_id), Some(Body::ActionStart { id, action, args })) =
                    (envelope.session_id, envelope.body)
                else {
                    return Ok(());
                };
                self.calls.lock().push(AgentCall {
                    fqdn: fqdn.clone(),
                    action: action.clone(),
                    args: args.clone(),
                });
                let Some(outcome) = self.answer(&fqdn, &action, &args) else {
                    return Ok(());
                };
                let Some(messenger) = self.messenger() else {
                    return Ok(());
                };
                let body = match outcome {
                    Ok(result) => Body::ActionComplete {
                        id,
                        exception: None,
                        result,
                        subprocesses: Vec::new(),
                    },
                    Err(message) => Body::ActionComplete {
                        id,
                        exception: Some(message.clone()),
                        result: Value::Null,
                        subprocesses: vec![Subprocess {
                            args: vec![action.clone()],
                            rc: 1,
                            stdout: String::new(),
                            stderr: message,
                        }],
                    },
                };
                let rebooting = action == "reboot_server";
                tokio::spawn(async move {
                    messenger
                        .on_message(Envelope::data(&fqdn, session_id, None, body))
                        .await;
                    if rebooting {
                        tokio::task::yield_now().await;
                        messenger
                            .on_message(Envelope::control(
                                &fqdn,
                                MessageType::SessionCreateRequest,
                                None,
                            ))
                            .await;
                    }
                });
            }
            MessageType::SessionCreateRequest | MessageType::SessionTerminate => {}
        }
        Ok(())
    }
}
