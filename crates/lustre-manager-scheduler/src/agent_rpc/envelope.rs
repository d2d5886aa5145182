//! Wire format of messages exchanged with agents through the transport.

use lustre_manager_core::{RpcId, SessionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Agent plugin that runs actions.
pub const PLUGIN: &str = "action_runner";

/// Envelope message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Agent asks for a new session.
    SessionCreateRequest,
    /// Manager grants a session.
    SessionCreateResponse,
    /// A session ended.
    SessionTerminate,
    /// Every session of the plugin ended.
    SessionTerminateAll,
    /// Payload within a session.
    Data,
}

/// One message between the manager and an agent plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Host the message is from or for.
    pub fqdn: String,
    /// Message type.
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Agent plugin.
    pub plugin: String,
    /// Session the message belongs to.
    #[serde(default)]
    pub session_id: Option<SessionId>,
    /// Per-session sequence number of manager-sent data.
    #[serde(default)]
    pub session_seq: Option<u64>,
    /// Data payload; absent on session control messages and heartbeats.
    #[serde(default)]
    pub body: Option<Body>,
}

impl Envelope {
    /// A session control message.
    #[must_use]
    pub fn control(fqdn: &str, message_type: MessageType, session_id: Option<SessionId>) -> Self {
        Self {
            fqdn: fqdn.to_string(),
            message_type,
            plugin: PLUGIN.to_string(),
            session_id,
            session_seq: None,
            body: None,
        }
    }

    /// A data message within a session.
    #[must_use]
    pub fn data(fqdn: &str, session_id: SessionId, session_seq: Option<u64>, body: Body) -> Self {
        Self {
            fqdn: fqdn.to_string(),
            message_type: MessageType::Data,
            plugin: PLUGIN.to_string(),
            session_id: Some(session_id),
            session_seq,
            body: Some(body),
        }
    }
}

/// Data payloads of the action runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Body {
    /// Run an action.
    ActionStart {
        /// Rpc id.
        id: RpcId,
        /// Action name.
        action: String,
        /// Action arguments.
        args: Value,
    },
    /// An action finished.
    ActionComplete {
        /// Rpc id.
        id: RpcId,
        /// Rendered exception when the action raised.
        #[serde(default)]
        exception: Option<String>,
        /// Action result.
        #[serde(default)]
        result: Value,
        /// Commands the action ran.
        #[serde(default)]
        subprocesses: Vec<Subprocess>,
    },
    /// Abandon an action.
    ActionCancel {
        /// Rpc id.
        id: RpcId,
    },
}

/// A command an action ran on the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subprocess {
    /// Command line.
    pub args: Vec<String>,
    /// Exit status.
    pub rc: i32,
    /// Captured standard output.
    #[serde(default)]
    pub stdout: String,
    /// Captured standard error.
    #[serde(default)]
    pub stderr: String,
}

/// Render subprocess output for a step's console log.
#[must_use]
pub fn render_subprocesses(subprocesses: &[Subprocess]) -> String {
    subprocesses
        .iter()
        .map(|s| {
            format!(
                "'{}' returned {}:\nstdout:\n{}\nstderr:\n{}",
                s.args.join(" "),
                s.rc,
                s.stdout,
                s.stderr
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn action_start_wire_format() {
        let id = RpcId::generate();
        let session = SessionId::generate();
        let env = Envelope::data(
            "h1.example.com",
            session,
            Some(3),
            Body::ActionStart {
                id,
                action: "start_lnet".into(),
                args: json!({}),
            },
        );
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["type"], "DATA");
        assert_eq!(value["plugin"], "action_runner");
        assert_eq!(value["session_seq"], 3);
        assert_eq!(value["body"]["type"], "ACTION_START");
        assert_eq!(value["body"]["action"], "start_lnet");
        assert_eq!(value["body"]["id"], id.to_string());
    }

    #[test]
    fn heartbeat_has_no_body() {
        let raw = json!({
            "fqdn": "h1.example.com",
            "type": "DATA",
            "plugin": "action_runner",
            "session_id": SessionId::generate().to_string(),
        });
        let env: Envelope = serde_json::from_value(raw).unwrap();
        assert_eq!(env.message_type, MessageType::Data);
        assert!(env.body.is_none());
    }

    #[test]
    fn renders_subprocess_output() {
        let rendered = render_subprocesses(&[Subprocess {
            args: vec!["mkfs.lustre".into(), "--ost".into()],
            rc: 1,
            stdout: String::new(),
            stderr: "device busy".into(),
        }]);
        assert!(rendered.starts_with("'mkfs.lustre --ost' returned 1:"));
        assert!(rendered.ends_with("device busy"));
    }
}
