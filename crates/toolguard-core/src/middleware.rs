//! Guarded execution pipeline.
//!
//! [`ToolMiddleware::wrap`] binds a tool to an effective profile and
//! returns a [`GuardedTool`]. Each call then runs, in order:
//!
//! 1. rate limit
//! 2. circuit breaker admission
//! 3. containment guards for the tool's declared capabilities
//! 4. the tool body, raced against cancellation and the deadline
//! 5. audit, telemetry and breaker bookkeeping
//!
//! Every rejection or failure comes back as an error [`ToolResult`] with
//! `metadata.errorKind` (and `metadata.retryAfterMs` when known). Nothing
//! is retried.
//!
//! A call future dropped mid-flight is still settled: it is audited as
//! cancelled and its breaker admission is reported as a failure.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use crate::domain::{
    AuditConfig, BucketLimit, CircuitBreakerConfig, ConfigurationError, ErrorKind, GuardKind,
    GuardViolation, ToolCallError, ToolSecurityProfile,
};
use crate::guards::{CommandSanitizer, PathSandbox, SsrfGuard};
use crate::metrics::METRICS;
use crate::obs;
use crate::resilience::{
    resolve_limit, validate_limit, Admission, CallKey, CallOutcome, CircuitBreaker,
    InMemoryCircuitBreaker, InMemoryRateLimiter, RateDecision, RateLimiter,
};
use crate::sinks::{
    redact_parameters, AuditEntry, AuditOutcome, AuditSink, TelemetryEntry, TelemetrySink,
};
use crate::tool::{Tool, ToolExecutionContext, ToolResult, ToolSpec};

/// Shared resilience state and sinks; one per process (or per tenant).
#[derive(Clone)]
pub struct ToolMiddleware {
    rate_limiter: Arc<dyn RateLimiter>,
    circuit_breaker: Arc<dyn CircuitBreaker>,
    audit: Arc<dyn AuditSink>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl ToolMiddleware {
    pub fn new(
        rate_limiter: Arc<dyn RateLimiter>,
        circuit_breaker: Arc<dyn CircuitBreaker>,
        audit: Arc<dyn AuditSink>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            rate_limiter,
            circuit_breaker,
            audit,
            telemetry,
        }
    }

    /// Middleware with process-local limiter and breaker state.
    pub fn in_memory(audit: Arc<dyn AuditSink>, telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self::new(
            Arc::new(InMemoryRateLimiter::new()),
            Arc::new(InMemoryCircuitBreaker::new()),
            audit,
            telemetry,
        )
    }

    /// Compile `profile` for `tool`.
    ///
    /// Fails when a declared capability's guard has no parameter to inspect
    /// or when the profile itself does not compile.
    pub fn wrap(
        &self,
        tool: Arc<dyn Tool>,
        profile: &ToolSecurityProfile,
    ) -> Result<GuardedTool, ConfigurationError> {
        let spec = tool.spec().clone();
        let guards = CompiledGuards::for_spec(&spec, profile)?;

        let rate_limit = &profile.middleware.rate_limit;
        let limit = resolve_limit(rate_limit, &spec.name, &spec.capabilities);
        if rate_limit.enabled {
            validate_limit(&spec.name, &limit)?;
        }

        Ok(GuardedTool {
            inner: tool,
            spec,
            guards,
            limit,
            rate_limit_enabled: rate_limit.enabled,
            breaker: profile.middleware.circuit_breaker.clone(),
            audit_config: profile.middleware.audit.clone(),
            telemetry_enabled: profile.middleware.telemetry.enabled,
            policy_digest: profile.digest(),
            middleware: self.clone(),
        })
    }
}

#[derive(Debug, Default)]
struct CompiledGuards {
    path: Option<PathSandbox>,
    ssrf: Option<Arc<SsrfGuard>>,
    command: Option<CommandSanitizer>,
}

impl CompiledGuards {
    fn for_spec(spec: &ToolSpec, profile: &ToolSecurityProfile) -> Result<Self, ConfigurationError> {
        let mut guards = Self::default();
        let security = &profile.security;

        for capability in &spec.capabilities {
            let missing = |param: &'static str| ConfigurationError::MissingGuardedParam {
                tool_name: spec.name.clone(),
                capability: capability.to_string(),
                param,
            };
            match capability.guard() {
                Some(GuardKind::PathSandbox) => {
                    if spec.guarded.paths.is_empty() {
                        return Err(missing("path"));
                    }
                    if guards.path.is_none() {
                        guards.path = Some(PathSandbox::new(&security.path_sandbox)?);
                    }
                }
                Some(GuardKind::Ssrf) => {
                    if spec.guarded.urls.is_empty() {
                        return Err(missing("url"));
                    }
                    if guards.ssrf.is_none() {
                        guards.ssrf = Some(Arc::new(SsrfGuard::new(&security.ssrf)?));
                    }
                }
                Some(GuardKind::Command) => {
                    if spec.guarded.command.is_none() {
                        return Err(missing("command"));
                    }
                    if guards.command.is_none() {
                        guards.command = Some(CommandSanitizer::new(&security.command_sanitizer)?);
                    }
                }
                None => {}
            }
        }
        Ok(guards)
    }
}

/// A tool bound to its effective profile. Cheap to share behind an `Arc`.
pub struct GuardedTool {
    inner: Arc<dyn Tool>,
    spec: ToolSpec,
    guards: CompiledGuards,
    limit: BucketLimit,
    rate_limit_enabled: bool,
    breaker: CircuitBreakerConfig,
    audit_config: AuditConfig,
    telemetry_enabled: bool,
    policy_digest: String,
    middleware: ToolMiddleware,
}

impl GuardedTool {
    /// Run one call through the full pipeline.
    ///
    /// Tools with an SSRF guard see it on the context, so the body can
    /// re-check the addresses it actually connects to.
    pub async fn call(&self, params: Value, ctx: &ToolExecutionContext) -> ToolResult {
        let span = obs::call_span(&ctx.agent_id, &self.spec.name);
        match &self.guards.ssrf {
            Some(ssrf) => {
                let ctx = ctx.clone().with_ssrf_guard(ssrf.clone());
                self.call_inner(params, &ctx).instrument(span).await
            }
            None => self.call_inner(params, ctx).instrument(span).await,
        }
    }

    /// Bucket applied to this tool.
    pub fn limit(&self) -> BucketLimit {
        self.limit
    }

    /// Digest of the profile this tool was wrapped with.
    pub fn policy_digest(&self) -> &str {
        &self.policy_digest
    }

    async fn call_inner(&self, mut params: Value, ctx: &ToolExecutionContext) -> ToolResult {
        let key = CallKey::new(ctx.agent_id.as_str(), self.spec.name.as_str());
        let audited_params = self
            .audit_config
            .enabled
            .then(|| redact_parameters(&params, &self.audit_config.redact_keys));
        let mut pending = PendingCall::new(self, ctx, key, audited_params);
        let started = pending.started;

        if self.rate_limit_enabled {
            let decision = self
                .middleware
                .rate_limiter
                .try_consume(&pending.key, self.limit)
                .await;
            if let RateDecision::Denied { retry_after } = decision {
                let err = ToolCallError::RateLimitExceeded {
                    tool_name: self.spec.name.clone(),
                    retry_after,
                };
                return self.reject(ctx, pending.disarm(), started, err);
            }
        }

        if self.breaker.enabled {
            let admitted = self
                .middleware
                .circuit_breaker
                .before_call(&pending.key, &self.breaker)
                .await;
            match admitted {
                Ok(admission) => pending.admission = Some(admission),
                Err(rejection) => {
                    let err = ToolCallError::CircuitOpen {
                        tool_name: self.spec.name.clone(),
                        retry_after: rejection.retry_after,
                    };
                    return self.reject(ctx, pending.disarm(), started, err);
                }
            }
        }

        if let Err(violation) = self.apply_guards(&mut params) {
            self.settle(&mut pending, CallOutcome::Released).await;
            METRICS.inc_guard_violations();
            return self.reject(ctx, pending.disarm(), started, violation.into());
        }

        METRICS.inc_calls_executed();
        let result = self.run_body(params, ctx).await;

        let (outcome, result) = match result {
            Ok(result) if !result.is_error => (AuditOutcome::Succeeded, result),
            Ok(result) => {
                let outcome = AuditOutcome::Failed {
                    kind: ErrorKind::ToolError,
                    message: result.content.clone(),
                };
                (outcome, with_error_metadata(result, ErrorKind::ToolError, None))
            }
            // A guard check inside the body refused the call.
            Err(ToolCallError::Guard(violation)) => {
                self.settle(&mut pending, CallOutcome::Released).await;
                METRICS.inc_guard_violations();
                return self.reject(ctx, pending.disarm(), started, violation.into());
            }
            Err(err) => {
                let outcome = AuditOutcome::Failed {
                    kind: err.kind(),
                    message: err.to_string(),
                };
                (outcome, error_result(&err))
            }
        };
        let error_kind = outcome.error_kind();

        let breaker_outcome = match error_kind {
            None => CallOutcome::Success,
            Some(_) => CallOutcome::Failure,
        };
        self.settle(&mut pending, breaker_outcome).await;

        let audited_params = pending.disarm();
        let duration_ms = elapsed_ms(started);
        obs::emit_call_finished(&ctx.agent_id, &self.spec.name, duration_ms, error_kind);
        self.record(ctx, audited_params, duration_ms, outcome);
        result
    }

    /// Report the outcome of the pending call's admission, if it has one.
    async fn settle(&self, pending: &mut PendingCall<'_>, outcome: CallOutcome) {
        if let Some(admission) = pending.admission.take() {
            self.middleware
                .circuit_breaker
                .after_call(&pending.key, &self.breaker, admission, outcome)
                .await;
        }
    }

    async fn run_body(
        &self,
        params: Value,
        ctx: &ToolExecutionContext,
    ) -> Result<ToolResult, ToolCallError> {
        let deadline = async {
            match ctx.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(ToolCallError::Cancelled {
                tool_name: self.spec.name.clone(),
            }),
            _ = deadline => Err(ToolCallError::TimedOut {
                tool_name: self.spec.name.clone(),
            }),
            res = self.inner.execute(params, ctx) => res.map_err(|e| {
                match e.downcast::<GuardViolation>() {
                    Ok(violation) => ToolCallError::Guard(violation),
                    Err(e) => ToolCallError::ToolFailed {
                        tool_name: self.spec.name.clone(),
                        message: format!("{e:#}"),
                    },
                }
            }),
        }
    }

    /// Validate guarded parameters, replacing paths with their canonical
    /// form and URLs with their normalized form.
    fn apply_guards(&self, params: &mut Value) -> Result<(), GuardViolation> {
        let guarded = &self.spec.guarded;

        if let Some(sandbox) = &self.guards.path {
            for key in &guarded.paths {
                rewrite_strings(params, key, GuardViolation::PathSandbox, |raw| {
                    let canonical = sandbox.validate(raw)?;
                    canonical.to_str().map(str::to_owned).ok_or_else(|| {
                        GuardViolation::PathSandbox(format!(
                            "'{}' is not valid UTF-8",
                            canonical.display()
                        ))
                    })
                })?;
            }
        }

        if let Some(ssrf) = &self.guards.ssrf {
            for key in &guarded.urls {
                rewrite_strings(params, key, GuardViolation::Ssrf, |raw| {
                    ssrf.validate_url(raw).map(String::from)
                })?;
            }
        }

        if let (Some(sanitizer), Some(key)) = (&self.guards.command, &guarded.command) {
            match params.get(key.as_str()) {
                None | Some(Value::Null) => {}
                Some(Value::String(command)) => sanitizer.validate(command)?,
                Some(_) => {
                    return Err(GuardViolation::Command(format!(
                        "parameter '{key}' must be a string"
                    )))
                }
            }
        }

        Ok(())
    }

    fn reject(
        &self,
        ctx: &ToolExecutionContext,
        audited_params: Option<Value>,
        started: Instant,
        err: ToolCallError,
    ) -> ToolResult {
        let kind = err.kind();
        let message = err.to_string();
        METRICS.inc_calls_rejected();
        obs::emit_call_rejected(&ctx.agent_id, &self.spec.name, kind, &message);
        self.record(
            ctx,
            audited_params,
            elapsed_ms(started),
            AuditOutcome::Rejected { kind, message },
        );
        error_result(&err)
    }

    fn record(
        &self,
        ctx: &ToolExecutionContext,
        audited_params: Option<Value>,
        duration_ms: u64,
        outcome: AuditOutcome,
    ) {
        let timestamp = Utc::now();

        if self.telemetry_enabled {
            self.middleware.telemetry.record(TelemetryEntry {
                agent_id: ctx.agent_id.clone(),
                tool_name: self.spec.name.clone(),
                timestamp,
                duration_ms,
                success: outcome.error_kind().is_none(),
                error_kind: outcome.error_kind(),
            });
        }

        if let Some(parameters) = audited_params {
            self.middleware.audit.record(AuditEntry {
                id: Uuid::new_v4(),
                agent_id: ctx.agent_id.clone(),
                tool_name: self.spec.name.clone(),
                parameters,
                timestamp,
                duration_ms,
                outcome,
                caller: ctx.caller.clone(),
                policy_digest: self.policy_digest.clone(),
            });
        }
    }
}

/// Bookkeeping for a call that has not finished yet.
///
/// Dropping it while armed means the call future was dropped: the call is
/// audited as cancelled and any breaker admission is settled as a failure.
struct PendingCall<'a> {
    tool: &'a GuardedTool,
    ctx: &'a ToolExecutionContext,
    key: CallKey,
    started: Instant,
    audited_params: Option<Value>,
    admission: Option<Admission>,
    armed: bool,
}

impl<'a> PendingCall<'a> {
    fn new(
        tool: &'a GuardedTool,
        ctx: &'a ToolExecutionContext,
        key: CallKey,
        audited_params: Option<Value>,
    ) -> Self {
        Self {
            tool,
            ctx,
            key,
            started: Instant::now(),
            audited_params,
            admission: None,
            armed: true,
        }
    }

    /// The call finished normally; hand back the audited parameters.
    fn disarm(&mut self) -> Option<Value> {
        self.armed = false;
        self.audited_params.take()
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let tool = self.tool;

        if let Some(admission) = self.admission.take() {
            // Without a runtime the breaker's trial lease frees the slot instead.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let breaker = tool.middleware.circuit_breaker.clone();
                let config = tool.breaker.clone();
                let key = self.key.clone();
                handle.spawn(async move {
                    breaker
                        .after_call(&key, &config, admission, CallOutcome::Failure)
                        .await;
                });
            }
        }

        let duration_ms = elapsed_ms(self.started);
        obs::emit_call_finished(
            &self.ctx.agent_id,
            &tool.spec.name,
            duration_ms,
            Some(ErrorKind::Cancelled),
        );
        tool.record(
            self.ctx,
            self.audited_params.take(),
            duration_ms,
            AuditOutcome::Failed {
                kind: ErrorKind::Cancelled,
                message: "call dropped before completion".into(),
            },
        );
    }
}

#[async_trait]
impl Tool for GuardedTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn execute(&self, params: Value, ctx: &ToolExecutionContext) -> anyhow::Result<ToolResult> {
        Ok(self.call(params, ctx).await)
    }
}

/// Apply `check` to the string (or each string of the array) at `params[key]`
/// and store what it returns. Absent and null values are skipped.
fn rewrite_strings(
    params: &mut Value,
    key: &str,
    violation: fn(String) -> GuardViolation,
    check: impl Fn(&str) -> Result<String, GuardViolation>,
) -> Result<(), GuardViolation> {
    let Some(slot) = params.get_mut(key) else {
        return Ok(());
    };
    match slot {
        Value::Null => Ok(()),
        Value::String(raw) => {
            *raw = check(raw)?;
            Ok(())
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                match item {
                    Value::String(raw) => *raw = check(raw)?,
                    _ => {
                        return Err(violation(format!(
                            "parameter '{key}' must contain only strings"
                        )))
                    }
                }
            }
            Ok(())
        }
        _ => Err(violation(format!(
            "parameter '{key}' must be a string or an array of strings"
        ))),
    }
}

fn error_result(err: &ToolCallError) -> ToolResult {
    with_error_metadata(ToolResult::error(err.to_string()), err.kind(), err.retry_after())
}

fn with_error_metadata(
    mut result: ToolResult,
    kind: ErrorKind,
    retry_after: Option<std::time::Duration>,
) -> ToolResult {
    let mut metadata = match result.metadata.take() {
        Some(Value::Object(map)) => map,
        Some(other) => {
            let mut map = Map::new();
            map.insert("toolMetadata".into(), other);
            map
        }
        None => Map::new(),
    };
    metadata.insert("errorKind".into(), json!(kind));
    if let Some(retry_after) = retry_after {
        metadata.insert(
            "retryAfterMs".into(),
            json!(u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX)),
        );
    }
    result.is_error = true;
    result.metadata = Some(Value::Object(metadata));
    result
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
