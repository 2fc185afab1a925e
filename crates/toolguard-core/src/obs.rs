//! Tracing setup and structured events for the guarded-call lifecycle.
//!
//! This module provides:
//! - [`init_tracing`] for binaries (`EnvFilter` from `RUST_LOG`, optional JSON)
//! - the `tool.call` span every guarded call runs in
//! - emission functions for rejections, completions, policy writes and
//!   breaker transitions
//!
//! Rejections and breaker trips are `warn!`; everything else is `info!`.

use tracing::{info, warn, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::domain::ErrorKind;
use crate::resilience::{CallKey, CircuitState};

/// Initialise the global tracing subscriber.
///
/// * `json`: emit newline-delimited JSON log lines.
/// * `level`: default verbosity when `RUST_LOG` is not set.
///
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .try_init()
            .ok();
    }
}

/// Span wrapping one guarded call.
pub fn call_span(agent_id: &str, tool_name: &str) -> tracing::Span {
    tracing::info_span!("tool.call", agent_id = %agent_id, tool = %tool_name)
}

/// Emit event: call turned away before the tool body ran.
pub fn emit_call_rejected(agent_id: &str, tool_name: &str, kind: ErrorKind, reason: &str) {
    warn!(
        event = "call.rejected",
        agent_id = %agent_id,
        tool = %tool_name,
        kind = %kind,
        reason = %reason,
    );
}

/// Emit event: tool body finished (successfully or not).
pub fn emit_call_finished(
    agent_id: &str,
    tool_name: &str,
    duration_ms: u64,
    error_kind: Option<ErrorKind>,
) {
    info!(
        event = "call.finished",
        agent_id = %agent_id,
        tool = %tool_name,
        duration_ms = duration_ms,
        success = error_kind.is_none(),
        error_kind = error_kind.map(|k| k.as_str()).unwrap_or(""),
    );
}

/// Emit event: agent overrides saved, with the sections now customized.
pub fn emit_policy_saved(org_id: &str, agent_id: &str, updated_by: &str, sections: &[&str]) {
    info!(
        event = "policy.saved",
        org_id = %org_id,
        agent_id = %agent_id,
        updated_by = %updated_by,
        sections = %sections.join(","),
    );
}

/// Emit event: agent overrides cleared.
pub fn emit_policy_reset(org_id: &str, agent_id: &str, updated_by: &str) {
    info!(
        event = "policy.reset",
        org_id = %org_id,
        agent_id = %agent_id,
        updated_by = %updated_by,
    );
}

/// Emit event: breaker moved between states.
pub fn emit_breaker_transition(key: &CallKey, from: CircuitState, to: CircuitState) {
    if to == CircuitState::Open {
        warn!(
            event = "breaker.transition",
            agent_id = %key.agent_id,
            tool = %key.tool_name,
            from = %from,
            to = %to,
        );
    } else {
        info!(
            event = "breaker.transition",
            agent_id = %key.agent_id,
            tool = %key.tool_name,
            from = %from,
            to = %to,
        );
    }
}
