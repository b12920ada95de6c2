//! Turning a stored secret into the bearer value sent upstream
//!
//! Two strategies:
//! 1. `PassthroughExchange` sends the stored secret unchanged.
//! 2. `CopilotExchange` trades a GitHub OAuth token for a short-lived Copilot
//!    token via `GET copilot_internal/v2/token`. The response also carries the
//!    account's quota, which the pool inspects before using the token.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use common::Secret;
use serde_json::Value;

use crate::constants::{
    API_VERSION, EDITOR_PLUGIN_VERSION, EDITOR_VERSION, EXCHANGE_ENDPOINT, USER_AGENT,
};
use crate::error::{Error, Result};

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// What an exchange produced for one stored secret.
#[derive(Debug, Clone)]
pub struct AccessGrant {
    pub token: Secret<String>,
    /// Absolute unix seconds, when the upstream announced one.
    pub expires_at: Option<u64>,
    /// Chat API base announced by the exchange (`endpoints.api`).
    pub api_base: Option<String>,
    /// The account reports usage telemetry to GitHub. Anything but an
    /// explicit `"telemetry": "disabled"` counts as enabled.
    pub telemetry_enabled: bool,
    /// Remaining response fields, with the token itself removed.
    pub payload: Option<Value>,
}

impl AccessGrant {
    pub fn passthrough(secret: &Secret<String>) -> Self {
        Self {
            token: secret.clone(),
            expires_at: None,
            api_base: None,
            telemetry_enabled: false,
            payload: None,
        }
    }
}

/// Strategy for obtaining an upstream bearer value from a stored secret.
pub trait TokenExchange: Send + Sync {
    /// Short name for logs and config (`"passthrough"`, `"copilot"`).
    fn id(&self) -> &str;

    fn exchange<'a>(
        &'a self,
        secret: &'a Secret<String>,
    ) -> Pin<Box<dyn Future<Output = Result<AccessGrant>> + Send + 'a>>;
}

pub struct PassthroughExchange;

impl TokenExchange for PassthroughExchange {
    fn id(&self) -> &str {
        "passthrough"
    }

    fn exchange<'a>(
        &'a self,
        secret: &'a Secret<String>,
    ) -> Pin<Box<dyn Future<Output = Result<AccessGrant>> + Send + 'a>> {
        Box::pin(async move { Ok(AccessGrant::passthrough(secret)) })
    }
}

pub struct CopilotExchange {
    client: reqwest::Client,
    endpoint: String,
}

impl CopilotExchange {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_endpoint(client, EXCHANGE_ENDPOINT)
    }

    pub fn with_endpoint(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    async fn fetch(&self, secret: &Secret<String>) -> Result<AccessGrant> {
        let response = self
            .client
            .get(&self.endpoint)
            .header("authorization", format!("token {}", secret.expose()))
            .header("editor-plugin-version", EDITOR_PLUGIN_VERSION)
            .header("editor-version", EDITOR_VERSION)
            .header("user-agent", USER_AGENT)
            .header("x-github-api-version", API_VERSION)
            .timeout(EXCHANGE_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::Http(format!("token exchange request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));

            // 401/403 means the GitHub token is revoked or lacks Copilot access
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(Error::InvalidCredentials(format!(
                    "token rejected ({status}): {body}"
                )));
            }

            return Err(Error::TokenExchange(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        let body = response
            .json::<Value>()
            .await
            .map_err(|e| Error::TokenExchange(format!("invalid token response: {e}")))?;
        parse_grant(body)
    }
}

impl TokenExchange for CopilotExchange {
    fn id(&self) -> &str {
        "copilot"
    }

    fn exchange<'a>(
        &'a self,
        secret: &'a Secret<String>,
    ) -> Pin<Box<dyn Future<Output = Result<AccessGrant>> + Send + 'a>> {
        Box::pin(self.fetch(secret))
    }
}

fn parse_grant(mut body: Value) -> Result<AccessGrant> {
    let Some(fields) = body.as_object_mut() else {
        return Err(Error::TokenExchange("token response is not an object".into()));
    };
    let token = match fields.remove("token") {
        Some(Value::String(t)) if !t.is_empty() => t,
        _ => {
            return Err(Error::TokenExchange(
                "token response has no token field".into(),
            ));
        }
    };
    let expires_at = fields.get("expires_at").and_then(Value::as_u64);
    let api_base = fields
        .get("endpoints")
        .and_then(|e| e.get("api"))
        .and_then(Value::as_str)
        .map(|s| s.trim_end_matches('/').to_string());
    let telemetry_enabled = fields.get("telemetry").and_then(Value::as_str) != Some("disabled");

    Ok(AccessGrant {
        token: Secret::new(token),
        expires_at,
        api_base,
        telemetry_enabled,
        payload: Some(body),
    })
}
