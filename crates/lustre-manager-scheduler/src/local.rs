//! Manager-side helpers invoked by steps.
//!
//! Most steps run on agents. The few that cannot (deploying the agent
//! itself) go through [`LocalActions`].

use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use crate::error::StepError;

/// Runs helpers on the manager.
///
/// This trait abstracts process execution, allowing steps to be tested
/// without touching real servers.
#[async_trait]
pub trait LocalActions: Send + Sync {
    /// Run `action` with `args`.
    ///
    /// # Errors
    ///
    /// Returns `StepError::Local` if the helper is unknown or fails.
    async fn run(&self, action: &str, args: &Value) -> Result<Value, StepError>;
}

/// Runs helpers as local processes.
#[derive(Debug, Clone)]
pub struct ShellLocalActions {
    server_http_url: String,
}

impl ShellLocalActions {
    /// Create a runner deploying agents against `server_http_url`.
    #[must_use]
    pub fn new(server_http_url: impl Into<String>) -> Self {
        Self {
            server_http_url: server_http_url.into(),
        }
    }

    async fn deploy_agent(&self, args: &Value) -> Result<Value, StepError> {
        let failed = |message: String| StepError::Local {
            action: "deploy_agent".to_string(),
            message,
        };
        let address = args["address"]
            .as_str()
            .ok_or_else(|| failed("missing address".to_string()))?;
        let fqdn = args["fqdn"]
            .as_str()
            .ok_or_else(|| failed("missing fqdn".to_string()))?;
        let setup_url = format!(
            "{}/agent/setup/?fqdn={fqdn}",
            self.server_http_url.trim_end_matches('/')
        );

        tracing::info!(address = %address, fqdn = %fqdn, "Deploying agent");
        let output = Command::new("ssh")
            .args([
                "-o",
                "BatchMode=yes",
                "-o",
                "StrictHostKeyChecking=accept-new",
                &format!("root@{address}"),
                &format!("curl -ksf '{setup_url}' | sh"),
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| failed(format!("failed to run ssh: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if output.status.success() {
            Ok(json!({ "stdout": stdout }))
        } else {
            tracing::error!(address = %address, code = ?output.status.code(), "Agent deployment failed");
            Err(failed(if stderr.is_empty() {
                format!("exit code {:?}", output.status.code())
            } else {
                stderr
            }))
        }
    }
}

#[async_trait]
impl LocalActions for ShellLocalActions {
    async fn run(&self, action: &str, args: &Value) -> Result<Value, StepError> {
        match action {
            "deploy_agent" => self.deploy_agent(args).await,
            other => Err(StepError::Local {
                action: other.to_string(),
                message: "unknown local action".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_action_is_rejected() {
        let local = ShellLocalActions::new("https://manager.example.com/");
        let err = local.run("format_disk", &json!({})).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "local action format_disk failed: unknown local action"
        );
    }

    #[tokio::test]
    async fn deploy_requires_address() {
        let local = ShellLocalActions::new("https://manager.example.com/");
        let err = local
            .run("deploy_agent", &json!({ "fqdn": "h1.example.com" }))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Local { .. }));
    }
}
