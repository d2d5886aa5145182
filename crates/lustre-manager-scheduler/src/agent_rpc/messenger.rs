//! Session-aware RPC to agents.
//!
//! Each host has at most one session with the action runner plugin and at
//! most one action in flight. A session moves through `no_session`,
//! `active` and back:
//!
//! - `SESSION_CREATE_REQUEST` opens a session, replacing any previous one
//!   and re-issuing the in-flight action inside the new session.
//! - `SESSION_TERMINATE`, a data message for a stale session, or silence
//!   longer than the contact timeout ends it and fails the in-flight action.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use lustre_manager_core::{RpcId, SessionId};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::envelope::{render_subprocesses, Body, Envelope, MessageType, PLUGIN};
use super::transport::Transport;
use crate::config::SchedulerConfig;
use crate::error::AgentError;

/// Session lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A host opened a session.
    Established {
        /// Host.
        fqdn: String,
    },
    /// A host's session ended.
    Lost {
        /// Host.
        fqdn: String,
        /// Why the session ended.
        reason: String,
    },
}

struct InFlight {
    id: RpcId,
    action: String,
    args: Value,
    reply: oneshot::Sender<Result<Value, AgentError>>,
}

struct HostSession {
    session_id: Option<SessionId>,
    last_contact: Instant,
    seq: u64,
    in_flight: Option<InFlight>,
}

impl HostSession {
    fn new() -> Self {
        Self {
            session_id: None,
            last_contact: Instant::now(),
            seq: 0,
            in_flight: None,
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

#[derive(Default)]
struct MessengerState {
    hosts: HashMap<String, HostSession>,
    cancelled: HashMap<RpcId, Instant>,
}

/// Runs actions on agents over the transport.
pub struct AgentMessenger {
    transport: Arc<dyn Transport>,
    state: Mutex<MessengerState>,
    generation: watch::Sender<u64>,
    events: broadcast::Sender<SessionEvent>,
    session_wait_timeout: Duration,
    contact_timeout: Duration,
    cancelled_expiry: Duration,
}

impl AgentMessenger {
    /// Create a messenger sending through `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: &SchedulerConfig) -> Self {
        let (generation, _) = watch::channel(0);
        let (events, _) = broadcast::channel(256);
        Self {
            transport,
            state: Mutex::new(MessengerState::default()),
            generation,
            events,
            session_wait_timeout: config.session_wait_timeout(),
            contact_timeout: config.contact_timeout(),
            cancelled_expiry: config.cancelled_rpc_expiry(),
        }
    }

    /// Subscribe to session lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// The host's active session, if any.
    #[must_use]
    pub fn current_session(&self, fqdn: &str) -> Option<SessionId> {
        self.state.lock().hosts.get(fqdn).and_then(|h| h.session_id)
    }

    fn changed(&self) {
        self.generation.send_modify(|g| *g += 1);
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn send(&self, envelope: Envelope) {
        let fqdn = envelope.fqdn.clone();
        if let Err(e) = self.transport.send(envelope).await {
            tracing::warn!(fqdn = %fqdn, error = %e, "Failed to deliver envelope");
        }
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    /// Handle an envelope received from an agent or the transport service.
    pub async fn on_message(&self, envelope: Envelope) {
        if envelope.plugin != PLUGIN {
            tracing::debug!(plugin = %envelope.plugin, "Ignoring message for another plugin");
            return;
        }
        match envelope.message_type {
            MessageType::SessionCreateRequest => self.open_session(&envelope.fqdn).await,
            MessageType::SessionTerminate => {
                self.end_session(&envelope.fqdn, "session terminated");
            }
            MessageType::SessionTerminateAll => {
                let hosts: Vec<String> = self.state.lock().hosts.keys().cloned().collect();
                for fqdn in hosts {
                    self.end_session(&fqdn, "all sessions terminated");
                }
            }
            MessageType::Data => self.on_data(envelope),
            MessageType::SessionCreateResponse => {
                tracing::warn!(fqdn = %envelope.fqdn, "Unexpected SESSION_CREATE_RESPONSE from agent");
            }
        }
    }

    async fn open_session(&self, fqdn: &str) {
        let session_id = SessionId::generate();
        let reissue = {
            let mut state = self.state.lock();
            let host = state
                .hosts
                .entry(fqdn.to_string())
                .or_insert_with(HostSession::new);
            if let Some(old) = host.session_id.replace(session_id) {
                tracing::info!(fqdn = %fqdn, old = %old, new = %session_id, "Replacing agent session");
            }
            host.seq = 0;
            host.last_contact = Instant::now();
            host.in_flight.as_ref().map(|f| {
                (
                    f.id,
                    f.action.clone(),
                    f.args.clone(),
                )
            })
        };
        tracing::info!(fqdn = %fqdn, session_id = %session_id, "Agent session established");
        self.changed();
        self.emit(SessionEvent::Established {
            fqdn: fqdn.to_string(),
        });
        self.send(Envelope::control(
            fqdn,
            MessageType::SessionCreateResponse,
            Some(session_id),
        ))
        .await;

        if let Some((id, action, args)) = reissue {
            let seq = self
                .state
                .lock()
                .hosts
                .get_mut(fqdn)
                .map(HostSession::next_seq);
            tracing::info!(fqdn = %fqdn, rpc_id = %id, action = %action, "Re-issuing action in new session");
            self.send(Envelope::data(
                fqdn,
                session_id,
                seq,
                Body::ActionStart { id, action, args },
            ))
            .await;
        }
    }

    fn end_session(&self, fqdn: &str, reason: &str) {
        let (had_session, in_flight) = {
            let mut state = self.state.lock();
            let Some(host) = state.hosts.get_mut(fqdn) else {
                return;
            };
            (host.session_id.take().is_some(), host.in_flight.take())
        };
        if let Some(rpc) = in_flight {
            let _ = rpc.reply.send(Err(AgentError::SessionTerminated {
                fqdn: fqdn.to_string(),
                reason: reason.to_string(),
            }));
        }
        if had_session {
            tracing::warn!(fqdn = %fqdn, reason = %reason, "Agent session ended");
            self.changed();
            self.emit(SessionEvent::Lost {
                fqdn: fqdn.to_string(),
                reason: reason.to_string(),
            });
        }
    }

    fn on_data(&self, envelope: Envelope) {
        let fqdn = envelope.fqdn;
        let Some(session_id) = envelope.session_id else {
            tracing::warn!(fqdn = %fqdn, "Data message without a session id");
            return;
        };

        let completed = {
            let mut state = self.state.lock();
            let MessengerState { hosts, cancelled } = &mut *state;
            let current = hosts.get(&fqdn).and_then(|h| h.session_id);
            if current != Some(session_id) {
                drop(state);
                tracing::warn!(fqdn = %fqdn, session_id = %session_id, "Data for a stale session");
                self.end_session(&fqdn, "unexpected session id");
                return;
            }
            let Some(host) = hosts.get_mut(&fqdn) else {
                return;
            };
            host.last_contact = Instant::now();

            match envelope.body {
                None => return,
                Some(Body::ActionComplete {
                    id,
                    exception,
                    result,
                    subprocesses,
                }) => {
                    if host.in_flight.as_ref().is_some_and(|f| f.id == id) {
                        host.in_flight
                            .take()
                            .map(|rpc| (rpc, exception, result, subprocesses))
                    } else if cancelled.remove(&id).is_some() {
                        tracing::debug!(fqdn = %fqdn, rpc_id = %id, "Completion for a cancelled action");
                        None
                    } else {
                        tracing::warn!(fqdn = %fqdn, rpc_id = %id, "Completion for an unknown action");
                        None
                    }
                }
                Some(other) => {
                    tracing::warn!(fqdn = %fqdn, body = ?other, "Unexpected data from agent");
                    None
                }
            }
        };

        if let Some((rpc, exception, result, subprocesses)) = completed {
            let outcome = match exception {
                Some(backtrace) => {
                    tracing::warn!(fqdn = %fqdn, action = %rpc.action, "Agent action raised");
                    Err(AgentError::AgentException {
                        fqdn: fqdn.clone(),
                        action: rpc.action.clone(),
                        backtrace,
                        subprocesses: render_subprocesses(&subprocesses),
                    })
                }
                None => Ok(result),
            };
            let _ = rpc.reply.send(outcome);
        }
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    /// Run `action` on `fqdn` and wait for its result.
    ///
    /// Waits up to the session wait timeout for a session to appear.
    ///
    /// # Errors
    ///
    /// Returns `NoSession` if no session appears, `SessionTerminated` if the
    /// session ends mid-call, `Timeout` if the agent goes silent,
    /// `AgentException` if the action raises and `Cancelled` if `cancel`
    /// fires first.
    pub async fn call(
        &self,
        fqdn: &str,
        action: &str,
        args: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, AgentError> {
        self.wait_for_session(fqdn, None, self.session_wait_timeout, cancel)
            .await
            .map_err(|e| match e {
                AgentError::Timeout { .. } => AgentError::NoSession {
                    fqdn: fqdn.to_string(),
                },
                other => other,
            })?;

        let id = RpcId::generate();
        let (reply, mut response) = oneshot::channel();
        let envelope = {
            let mut state = self.state.lock();
            let host = state.hosts.get_mut(fqdn).ok_or_else(|| AgentError::NoSession {
                fqdn: fqdn.to_string(),
            })?;
            let session_id = host.session_id.ok_or_else(|| AgentError::NoSession {
                fqdn: fqdn.to_string(),
            })?;
            if host.in_flight.is_some() {
                return Err(AgentError::Protocol(format!(
                    "an action is already running on {fqdn}"
                )));
            }
            host.in_flight = Some(InFlight {
                id,
                action: action.to_string(),
                args: args.clone(),
                reply,
            });
            // The contact timeout counts from the later of the agent's last
            // message and this request.
            host.last_contact = Instant::now();
            let seq = host.next_seq();
            Envelope::data(
                fqdn,
                session_id,
                Some(seq),
                Body::ActionStart {
                    id,
                    action: action.to_string(),
                    args,
                },
            )
        };

        tracing::debug!(fqdn = %fqdn, action = %action, rpc_id = %id, "Starting agent action");
        if let Err(e) = self.transport.send(envelope).await {
            self.take_in_flight(fqdn, id);
            return Err(e);
        }

        loop {
            let deadline = self
                .last_contact(fqdn)
                .map_or_else(Instant::now, |t| t)
                + self.contact_timeout;
            tokio::select! {
                outcome = &mut response => {
                    return outcome.unwrap_or(Err(AgentError::Shutdown));
                }
                () = cancel.cancelled() => {
                    self.cancel_action(fqdn, id).await;
                    return Err(AgentError::Cancelled);
                }
                () = tokio::time::sleep_until(deadline) => {
                    if self.contact_lost(fqdn) {
                        self.take_in_flight(fqdn, id);
                        self.end_session(fqdn, "no contact within the contact timeout");
                        return Err(AgentError::Timeout {
                            fqdn: fqdn.to_string(),
                            seconds: self.contact_timeout.as_secs(),
                        });
                    }
                }
            }
        }
    }

    fn last_contact(&self, fqdn: &str) -> Option<Instant> {
        self.state.lock().hosts.get(fqdn).map(|h| h.last_contact)
    }

    fn contact_lost(&self, fqdn: &str) -> bool {
        self.state
            .lock()
            .hosts
            .get(fqdn)
            .is_some_and(|h| h.session_id.is_some() && h.last_contact.elapsed() >= self.contact_timeout)
    }

    fn take_in_flight(&self, fqdn: &str, id: RpcId) -> Option<InFlight> {
        let mut state = self.state.lock();
        let host = state.hosts.get_mut(fqdn)?;
        if host.in_flight.as_ref().is_some_and(|f| f.id == id) {
            host.in_flight.take()
        } else {
            None
        }
    }

    async fn cancel_action(&self, fqdn: &str, id: RpcId) {
        let envelope = {
            let mut state = self.state.lock();
            let expiry = self.cancelled_expiry;
            state.cancelled.retain(|_, at| at.elapsed() < expiry);
            state.cancelled.insert(id, Instant::now());
            let Some(host) = state.hosts.get_mut(fqdn) else {
                return;
            };
            if host.in_flight.as_ref().is_some_and(|f| f.id == id) {
                host.in_flight = None;
            }
            match host.session_id {
                Some(session_id) => {
                    let seq = host.next_seq();
                    Envelope::data(fqdn, session_id, Some(seq), Body::ActionCancel { id })
                }
                None => return,
            }
        };
        tracing::info!(fqdn = %fqdn, rpc_id = %id, "Cancelling agent action");
        self.send(envelope).await;
    }

    // =========================================================================
    // Session waits
    // =========================================================================

    async fn wait_for_session(
        &self,
        fqdn: &str,
        not: Option<SessionId>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<SessionId, AgentError> {
        let deadline = Instant::now() + timeout;
        let mut generation = self.generation.subscribe();
        loop {
            if let Some(id) = self.current_session(fqdn).filter(|id| Some(*id) != not) {
                return Ok(id);
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(AgentError::Cancelled),
                changed = tokio::time::timeout_at(deadline, generation.changed()) => match changed {
                    Err(_) => {
                        return Err(AgentError::Timeout {
                            fqdn: fqdn.to_string(),
                            seconds: timeout.as_secs(),
                        })
                    }
                    Ok(Err(_)) => return Err(AgentError::Shutdown),
                    Ok(Ok(())) => {}
                },
            }
        }
    }

    /// Wait for the host to open a session.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if none appears within `timeout`.
    pub async fn await_session(
        &self,
        fqdn: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<SessionId, AgentError> {
        self.wait_for_session(fqdn, None, timeout, cancel).await
    }

    /// Wait for the host to come back with a session other than `old`.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if the agent does not return within `timeout`.
    pub async fn await_restart(
        &self,
        fqdn: &str,
        old: Option<SessionId>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<SessionId, AgentError> {
        self.wait_for_session(fqdn, old, timeout, cancel).await
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Forget a host that has left the manager.
    pub fn remove_host(&self, fqdn: &str) {
        self.end_session(fqdn, "host removed");
        self.state.lock().hosts.remove(fqdn);
    }

    /// Tell the transport to drop every session, as on startup.
    ///
    /// # Errors
    ///
    /// Returns `Transport` if the transport service cannot be reached.
    pub async fn terminate_all(&self) -> Result<(), AgentError> {
        let hosts: Vec<String> = self.state.lock().hosts.keys().cloned().collect();
        for fqdn in hosts {
            self.end_session(&fqdn, "all sessions terminated");
        }
        self.transport
            .send(Envelope::control("", MessageType::SessionTerminateAll, None))
            .await
    }

    /// Fail every in-flight action.
    pub fn shutdown(&self) {
        let in_flight: Vec<InFlight> = self
            .state
            .lock()
            .hosts
            .values_mut()
            .filter_map(|h| h.in_flight.take())
            .collect();
        for rpc in in_flight {
            let _ = rpc.reply.send(Err(AgentError::Shutdown));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_rpc::mock::MockAgentFleet;
    use serde_json::json;

    fn messenger(fleet: &Arc<MockAgentFleet>) -> Arc<AgentMessenger> {
        let messenger = Arc::new(AgentMessenger::new(
            Arc::clone(fleet) as Arc<dyn Transport>,
            &SchedulerConfig::default(),
        ));
        fleet.attach(&messenger);
        messenger
    }

    #[tokio::test]
    async fn call_returns_agent_result() {
        let fleet = MockAgentFleet::new();
        let messenger = messenger(&fleet);
        fleet.connect("h1.example.com").await;
        fleet.set_result("h1.example.com", "get_nids", json!({"nids": ["10.0.0.1@tcp0"]}));

        let result = messenger
            .call("h1.example.com", "get_nids", json!({}), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result["nids"][0], "10.0.0.1@tcp0");
        assert_eq!(fleet.actions_for("h1.example.com"), ["get_nids"]);
    }

    #[tokio::test]
    async fn agent_exception_carries_subprocesses() {
        let fleet = MockAgentFleet::new();
        let messenger = messenger(&fleet);
        fleet.connect("h1.example.com").await;
        fleet.fail_action("h1.example.com", "format_target", "mkfs failed");

        let err = messenger
            .call("h1.example.com", "format_target", json!({}), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            AgentError::AgentException {
                backtrace,
                subprocesses,
                ..
            } => {
                assert_eq!(backtrace, "mkfs failed");
                assert!(subprocesses.contains("returned 1"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn no_session_after_wait_timeout() {
        let fleet = MockAgentFleet::new();
        let messenger = messenger(&fleet);
        let err = messenger
            .call("h1.example.com", "start_lnet", json!({}), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AgentError::NoSession {
                fqdn: "h1.example.com".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn silent_agent_times_out() {
        let fleet = MockAgentFleet::new();
        let messenger = messenger(&fleet);
        fleet.connect("h1.example.com").await;
        fleet.set_silent("h1.example.com", true);

        let err = messenger
            .call("h1.example.com", "start_target", json!({}), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Timeout { .. }));
        assert!(messenger.current_session("h1.example.com").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_sends_action_cancel() {
        let fleet = MockAgentFleet::new();
        let messenger = messenger(&fleet);
        fleet.connect("h1.example.com").await;
        fleet.set_silent("h1.example.com", true);

        let cancel = CancellationToken::new();
        let call = {
            let messenger = Arc::clone(&messenger);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                messenger
                    .call("h1.example.com", "start_target", json!({}), &cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        assert_eq!(call.await.unwrap().unwrap_err(), AgentError::Cancelled);
        assert!(fleet
            .sent()
            .iter()
            .any(|e| matches!(e.body, Some(Body::ActionCancel { .. }))));
    }

    #[tokio::test(start_paused = true)]
    async fn terminated_session_fails_in_flight_call() {
        let fleet = MockAgentFleet::new();
        let messenger = messenger(&fleet);
        fleet.connect("h1.example.com").await;
        fleet.set_silent("h1.example.com", true);

        let call = {
            let messenger = Arc::clone(&messenger);
            tokio::spawn(async move {
                messenger
                    .call("h1.example.com", "stop_target", json!({}), &CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        messenger
            .on_message(Envelope::control(
                "h1.example.com",
                MessageType::SessionTerminate,
                None,
            ))
            .await;

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(
            err.to_string(),
            "communications error with h1.example.com because session terminated"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn new_session_reissues_in_flight_action() {
        let fleet = MockAgentFleet::new();
        let messenger = messenger(&fleet);
        fleet.connect("h1.example.com").await;
        fleet.set_silent("h1.example.com", true);

        let call = {
            let messenger = Arc::clone(&messenger);
            tokio::spawn(async move {
                messenger
                    .call("h1.example.com", "configure_lnet", json!({}), &CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        fleet.set_silent("h1.example.com", false);
        fleet.connect("h1.example.com").await;

        assert!(call.await.unwrap().is_ok());
        assert_eq!(
            fleet.actions_for("h1.example.com"),
            ["configure_lnet", "configure_lnet"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_still_answers() {
        let fleet = MockAgentFleet::new();
        let messenger = messenger(&fleet);
        fleet.connect("h1.example.com").await;
        let session = messenger.current_session("h1.example.com");

        tokio::time::sleep(Duration::from_secs(120)).await;
        for _ in 0..20 {
            messenger
                .call("h1.example.com", "get_nids", json!({}), &CancellationToken::new())
                .await
                .unwrap();
        }
        assert_eq!(messenger.current_session("h1.example.com"), session);
        assert_eq!(fleet.actions_for("h1.example.com").len(), 20);
    }

    #[tokio::test]
    async fn stale_session_data_ends_session() {
        let fleet = MockAgentFleet::new();
        let messenger = messenger(&fleet);
        fleet.connect("h1.example.com").await;
        messenger
            .on_message(Envelope::data(
                "h1.example.com",
                SessionId::generate(),
                None,
                Body::ActionCancel { id: RpcId::generate() },
            ))
            .await;
        assert!(messenger.current_session("h1.example.com").is_none());
    }
}
