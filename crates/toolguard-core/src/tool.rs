//! Tool contract: what a tool declares, what it receives, what it returns.
//!
//! A tool declares its capabilities and which parameter keys carry the
//! paths, URLs or command its guards must inspect. The middleware refuses
//! to wrap a tool whose declaration leaves a guarded capability uncovered.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::domain::{GuardViolation, ToolCapability};
use crate::guards::SsrfGuard;

/// Parameter keys the guards inspect.
///
/// `paths` and `urls` values may be a string or an array of strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardedParams {
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

/// Tool spec as registered with the middleware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    pub name: String,
    pub capabilities: BTreeSet<ToolCapability>,
    #[serde(default)]
    pub guarded: GuardedParams,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: BTreeSet::new(),
            guarded: GuardedParams::default(),
        }
    }

    pub fn with_capability(mut self, capability: ToolCapability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn with_path_param(mut self, key: impl Into<String>) -> Self {
        self.guarded.paths.push(key.into());
        self
    }

    pub fn with_url_param(mut self, key: impl Into<String>) -> Self {
        self.guarded.urls.push(key.into());
        self
    }

    pub fn with_command_param(mut self, key: impl Into<String>) -> Self {
        self.guarded.command = Some(key.into());
        self
    }

    pub fn has_capability(&self, capability: &ToolCapability) -> bool {
        self.capabilities.contains(capability)
    }
}

/// What a tool hands back to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ToolResult {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
            metadata: None,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A call to the platform API made on behalf of a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRequest {
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl ApiRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            body: None,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Platform API client provided by the agent runtime.
#[async_trait]
pub trait ApiExecutor: Send + Sync {
    async fn request(&self, request: ApiRequest) -> anyhow::Result<Value>;

    async fn get(&self, path: &str) -> anyhow::Result<Value> {
        self.request(ApiRequest::new("GET", path)).await
    }

    async fn post(&self, path: &str, body: Value) -> anyhow::Result<Value> {
        self.request(ApiRequest::new("POST", path).with_body(body))
            .await
    }
}

/// Executor for contexts with no API access; every request fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableApiExecutor;

#[async_trait]
impl ApiExecutor for UnavailableApiExecutor {
    async fn request(&self, request: ApiRequest) -> anyhow::Result<Value> {
        anyhow::bail!(
            "no API executor available for {} {}",
            request.method,
            request.path
        )
    }
}

/// Per-call context supplied by the agent runtime.
#[derive(Clone)]
pub struct ToolExecutionContext {
    pub agent_id: String,
    /// Who triggered the call (user, schedule, parent agent), when known.
    pub caller: Option<String>,
    pub api: Arc<dyn ApiExecutor>,
    pub skill_config: Map<String, Value>,
    pub cancel: CancellationToken,
    pub deadline: Option<Instant>,
    /// SSRF policy of the guarded tool this call runs under.
    pub ssrf: Option<Arc<SsrfGuard>>,
}

impl ToolExecutionContext {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            caller: None,
            api: Arc::new(UnavailableApiExecutor),
            skill_config: Map::new(),
            cancel: CancellationToken::new(),
            deadline: None,
            ssrf: None,
        }
    }

    pub fn with_api(mut self, api: Arc<dyn ApiExecutor>) -> Self {
        self.api = api;
        self
    }

    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self
    }

    pub fn with_skill_config(mut self, skill_config: Map<String, Value>) -> Self {
        self.skill_config = skill_config;
        self
    }

    /// Deadline `timeout` from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_ssrf_guard(mut self, ssrf: Arc<SsrfGuard>) -> Self {
        self.ssrf = Some(ssrf);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Check the address `host` actually resolved to before connecting.
    ///
    /// Returning the violation from [`Tool::execute`] (`Err(violation.into())`)
    /// makes the call fail with `ssrf_violation`. Passes when the call runs
    /// without an SSRF guard.
    pub fn check_resolved(&self, host: &str, ip: IpAddr) -> Result<(), GuardViolation> {
        match &self.ssrf {
            Some(ssrf) => ssrf.validate_resolved(host, ip),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for ToolExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolExecutionContext")
            .field("agent_id", &self.agent_id)
            .field("caller", &self.caller)
            .field("skill_config", &self.skill_config)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("deadline", &self.deadline)
            .field("ssrf_guarded", &self.ssrf.is_some())
            .finish_non_exhaustive()
    }
}

/// A capability-tagged tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> &ToolSpec;

    /// Run the tool. `Err` and `ToolResult { is_error: true }` are both
    /// failures from the middleware's point of view.
    async fn execute(&self, params: Value, ctx: &ToolExecutionContext) -> anyhow::Result<ToolResult>;
}
