// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The tool-call lifecycle: record, hooks, permission, validation,
//! execution, and result pairing.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::join_all;
use tracing::warn;

use runa_config::{AgentId, TimeoutPolicy};
use runa_events::{AgentEvent, PermissionCallInfo};
use runa_model::Block;
use runa_sandbox::Sandbox;
use runa_store::Store;
use runa_tools::{
    validate_args, PostToolAction, PreToolDecision, ToolCall, ToolCallRecord, ToolCallState,
    ToolContext, ToolHost, ToolInstance, ToolOutcome, ToolRegistry,
};

use crate::error::ErrorKind;
use crate::permission::{Decision, Gate, PermissionEngine, WaitOutcome};

pub(crate) type Emit = dyn Fn(AgentEvent) -> anyhow::Result<u64> + Send + Sync;

/// Everything a batch needs from the owning agent.
pub(crate) struct ToolRunEnv<'a> {
    pub agent: &'a AgentId,
    pub store: &'a Store,
    pub registry: &'a ToolRegistry,
    pub permissions: &'a PermissionEngine,
    pub sandbox: Option<Arc<dyn Sandbox>>,
    pub host: Arc<dyn ToolHost>,
    pub emit: &'a Emit,
    pub in_flight: &'a Mutex<HashSet<String>>,
    pub result_byte_cap: usize,
}

/// The paired output of one batch.
pub(crate) struct BatchOutcome {
    /// `tool_result` blocks in model-emitted order, for calls that reached a
    /// terminal state this round.
    pub result_blocks: Vec<Block>,
    /// Calls left suspended (approval pause or plan queue).
    pub paused: Vec<String>,
}

enum CallFinish {
    Completed(Block),
    Suspended,
}

/// Run one model-turn's batch.
///
/// A batch where every descriptor declares `concurrent = true` runs its
/// calls concurrently; any non-concurrent member serializes the whole batch
/// in model-emitted order.  Result pairing order is model-emitted order in
/// both cases.
pub(crate) async fn run_batch(env: &ToolRunEnv<'_>, calls: Vec<ToolCall>) -> anyhow::Result<BatchOutcome> {
    let all_concurrent = !calls.is_empty()
        && calls.iter().all(|call| {
            env.registry
                .get(&call.name)
                .map(|t| t.descriptor().concurrent)
                .unwrap_or(false)
        });

    let finishes: Vec<anyhow::Result<CallFinish>> = if all_concurrent && calls.len() > 1 {
        join_all(calls.iter().map(|call| run_one(env, call))).await
    } else {
        let mut out = Vec::with_capacity(calls.len());
        for call in &calls {
            out.push(run_one(env, call).await);
        }
        out
    };

    let mut result_blocks = Vec::new();
    let mut paused = Vec::new();
    for (call, finish) in calls.iter().zip(finishes) {
        match finish? {
            CallFinish::Completed(block) => result_blocks.push(block),
            CallFinish::Suspended => paused.push(call.id.clone()),
        }
    }
    Ok(BatchOutcome {
        result_blocks,
        paused,
    })
}

/// Steps 1–8 of the lifecycle for a single call.
async fn run_one(env: &ToolRunEnv<'_>, call: &ToolCall) -> anyhow::Result<CallFinish> {
    let mut record = ToolCallRecord::new(&call.id, &call.name, call.args.clone());
    env.store.save_tool_record(env.agent, &record)?;
    env.in_flight.lock().unwrap().insert(call.id.clone());

    let tool = match env.registry.get(&call.name) {
        Some(tool) => tool,
        None => {
            (env.emit)(AgentEvent::ToolStart {
                id: call.id.clone(),
                name: call.name.clone(),
                args: call.args.clone(),
                phase: "permitted".into(),
            })?;
            let outcome = ToolOutcome::err(format!("unknown tool: {}", call.name));
            record.advance(ToolCallState::Permitted)?;
            record.advance(ToolCallState::Errored)?;
            (env.emit)(ErrorKind::ToolValidation.event(
                format!("unknown tool: {}", call.name),
                None,
            ))?;
            return finish(env, record, outcome, Instant::now()).map(CallFinish::Completed);
        }
    };

    let started = Instant::now();

    // Tool-level preToolUse hooks may short-circuit with a ready outcome.
    for hook in &tool.hooks().pre_tool_use {
        match hook(call.clone()).await {
            Ok(PreToolDecision::Continue) => {}
            Ok(PreToolDecision::Skip(outcome)) => {
                (env.emit)(AgentEvent::ToolStart {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    args: call.args.clone(),
                    phase: "skipped".into(),
                })?;
                record.advance(ToolCallState::Permitted)?;
                record.advance(ToolCallState::Running)?;
                return finish(env, record, outcome, started).map(CallFinish::Completed);
            }
            Err(e) => {
                (env.emit)(ErrorKind::HookError.event(format!("preToolUse: {e}"), None))?;
            }
        }
    }

    // Permission gate.
    let denial: Option<String> = match env.permissions.evaluate(tool.descriptor()) {
        Gate::Permitted => {
            record.advance(ToolCallState::Permitted)?;
            env.store.save_tool_record(env.agent, &record)?;
            (env.emit)(AgentEvent::ToolStart {
                id: call.id.clone(),
                name: call.name.clone(),
                args: call.args.clone(),
                phase: "permitted".into(),
            })?;
            None
        }
        Gate::Denied { reason } => {
            (env.emit)(AgentEvent::ToolStart {
                id: call.id.clone(),
                name: call.name.clone(),
                args: call.args.clone(),
                phase: "denied".into(),
            })?;
            Some(reason)
        }
        Gate::Queued => {
            (env.emit)(AgentEvent::ToolStart {
                id: call.id.clone(),
                name: call.name.clone(),
                args: call.args.clone(),
                phase: "queued".into(),
            })?;
            // Plan mode: stays Pending in the durable record until promoted
            // by a later decision.
            return Ok(CallFinish::Suspended);
        }
        Gate::NeedsApproval => {
            (env.emit)(AgentEvent::ToolStart {
                id: call.id.clone(),
                name: call.name.clone(),
                args: call.args.clone(),
                phase: "awaiting_approval".into(),
            })?;
            (env.emit)(AgentEvent::PermissionRequired {
                call: PermissionCallInfo {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    args: call.args.clone(),
                },
            })?;
            match env.permissions.wait(&call.id).await {
                WaitOutcome::Decided(Decision::Allow, _) => {
                    record.advance(ToolCallState::Permitted)?;
                    env.store.save_tool_record(env.agent, &record)?;
                    None
                }
                WaitOutcome::Decided(Decision::Deny, note) => Some(match note {
                    Some(note) => format!("denied: {note}"),
                    None => "denied".to_string(),
                }),
                WaitOutcome::TimedOut(TimeoutPolicy::Allow) => {
                    record.advance(ToolCallState::Permitted)?;
                    env.store.save_tool_record(env.agent, &record)?;
                    None
                }
                WaitOutcome::TimedOut(TimeoutPolicy::Deny) => {
                    Some("denied: decision timeout".to_string())
                }
                WaitOutcome::TimedOut(TimeoutPolicy::Pause) => {
                    return Ok(CallFinish::Suspended);
                }
            }
        }
    };

    if let Some(reason) = denial {
        record.advance(ToolCallState::Denied)?;
        env.store.save_tool_record(env.agent, &record)?;
        (env.emit)(ErrorKind::PermissionDenied.event(reason.clone(), None))?;
        let outcome = ToolOutcome::err(reason);
        return finish(env, record, outcome, started).map(CallFinish::Completed);
    }

    execute_permitted(env, &tool, call, record, started)
        .await
        .map(CallFinish::Completed)
}

/// Validation + execution + post hooks for a call already in `Permitted`.
pub(crate) async fn execute_permitted(
    env: &ToolRunEnv<'_>,
    tool: &Arc<dyn ToolInstance>,
    call: &ToolCall,
    mut record: ToolCallRecord,
    started: Instant,
) -> anyhow::Result<Block> {
    // Argument validation against the declared schema.
    if let Err(message) = validate_args(&tool.descriptor().parameters, &call.args) {
        record.advance(ToolCallState::Errored)?;
        (env.emit)(ErrorKind::ToolValidation.event(message.clone(), None))?;
        let outcome = ToolOutcome::validation_err(message);
        return finish(env, record, outcome, started);
    }

    record.advance(ToolCallState::Running)?;
    env.store.save_tool_record(env.agent, &record)?;

    let ctx = ToolContext::new(Arc::clone(&env.host), env.sandbox.clone(), call.id.clone());
    let timeout = tool.descriptor().timeout_ms.map(Duration::from_millis);
    let executed = match timeout {
        Some(limit) => match tokio::time::timeout(limit, tool.exec(call.args.clone(), &ctx)).await
        {
            Ok(result) => result,
            Err(_) => {
                (env.emit)(AgentEvent::ToolError {
                    id: call.id.clone(),
                    message: format!("timed out after {limit:?}"),
                })?;
                (env.emit)(ErrorKind::ToolTimeout.event(
                    format!("{} timed out after {limit:?}", call.name),
                    None,
                ))?;
                record.advance(ToolCallState::Errored)?;
                let outcome = ToolOutcome::timeout();
                return finish(env, record, outcome, started);
            }
        },
        None => tool.exec(call.args.clone(), &ctx).await,
    };

    let mut outcome = match executed {
        Ok(outcome) => outcome,
        Err(e) => {
            let kind = match e.downcast_ref::<runa_sandbox::SandboxError>() {
                Some(runa_sandbox::SandboxError::Violation(_)) => ErrorKind::SandboxViolation,
                _ => ErrorKind::ToolRuntime,
            };
            (env.emit)(AgentEvent::ToolError {
                id: call.id.clone(),
                message: e.to_string(),
            })?;
            (env.emit)(kind.event(e.to_string(), None))?;
            record.advance(ToolCallState::Errored)?;
            let outcome = ToolOutcome::err(e.to_string());
            return finish(env, record, outcome, started);
        }
    };

    // postToolUse hooks may rewrite the outcome.
    for hook in &tool.hooks().post_tool_use {
        match hook(call.clone(), outcome.clone()).await {
            Ok(PostToolAction::Keep) => {}
            Ok(PostToolAction::Replace(replacement)) => outcome = replacement,
            Err(e) => {
                (env.emit)(ErrorKind::HookError.event(format!("postToolUse: {e}"), None))?;
            }
        }
    }

    finish(env, record, outcome, started)
}

/// Step 7–8: persist the outcome, emit `tool:end` and `tool_executed`, and
/// build the paired `tool_result` block.
fn finish(
    env: &ToolRunEnv<'_>,
    mut record: ToolCallRecord,
    outcome: ToolOutcome,
    started: Instant,
) -> anyhow::Result<Block> {
    record.set_outcome(outcome.clone());
    record.advance(ToolCallState::Completed)?;
    env.store.save_tool_record(env.agent, &record)?;
    env.in_flight.lock().unwrap().remove(&record.id);

    (env.emit)(AgentEvent::ToolEnd {
        id: record.id.clone(),
        name: record.name.clone(),
        outcome: outcome.value.clone(),
        is_error: outcome.is_error,
    })?;
    (env.emit)(AgentEvent::ToolExecuted {
        call_id: record.id.clone(),
        duration_ms: started.elapsed().as_millis() as u64,
    })?;

    let content = truncate_result(&outcome.render(), env.result_byte_cap);
    Ok(Block::tool_result(&record.id, content, outcome.is_error))
}

/// Apply a later `decide()` to a call that was left suspended (pause or plan
/// queue).  Used by the reconciliation pass at the start of the next chat.
pub(crate) async fn settle_decided(
    env: &ToolRunEnv<'_>,
    record: ToolCallRecord,
    decision: Decision,
    note: Option<String>,
) -> anyhow::Result<Block> {
    let call = ToolCall {
        id: record.id.clone(),
        name: record.name.clone(),
        args: record.args.clone(),
    };
    match decision {
        Decision::Allow => match env.registry.get(&call.name) {
            Some(tool) => {
                let mut record = record;
                record.advance(ToolCallState::Permitted)?;
                env.store.save_tool_record(env.agent, &record)?;
                execute_permitted(env, &tool, &call, record, Instant::now()).await
            }
            None => {
                warn!(tool = %call.name, "allowed tool vanished from registry");
                let mut record = record;
                record.advance(ToolCallState::Permitted)?;
                record.advance(ToolCallState::Errored)?;
                let outcome = ToolOutcome::err(format!("unknown tool: {}", call.name));
                finish(env, record, outcome, Instant::now())
            }
        },
        Decision::Deny => {
            let mut record = record;
            record.advance(ToolCallState::Denied)?;
            (env.emit)(ErrorKind::PermissionDenied.event("denied", None))?;
            let outcome = ToolOutcome::err(match note {
                Some(note) => format!("denied: {note}"),
                None => "denied".to_string(),
            });
            finish(env, record, outcome, Instant::now())
        }
    }
}

/// Head/tail truncation for oversized tool results.
fn truncate_result(content: &str, cap: usize) -> String {
    if content.len() <= cap || cap == 0 {
        return content.to_string();
    }
    let head_len = cap * 2 / 3;
    let tail_len = cap / 3;
    let head_end = content
        .char_indices()
        .take_while(|(i, _)| *i <= head_len)
        .last()
        .map(|(i, _)| i)
        .unwrap_or(0);
    let tail_start = content
        .char_indices()
        .find(|(i, _)| *i >= content.len().saturating_sub(tail_len))
        .map(|(i, _)| i)
        .unwrap_or(content.len());
    format!(
        "{}\n…[truncated {} bytes]…\n{}",
        &content[..head_end],
        content.len() - head_end - (content.len() - tail_start),
        &content[tail_start..]
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_head_and_tail() {
        let content = "a".repeat(100) + &"z".repeat(100);
        let truncated = truncate_result(&content, 60);
        assert!(truncated.starts_with('a'));
        assert!(truncated.ends_with('z'));
        assert!(truncated.contains("truncated"));
        assert!(truncated.len() < content.len());
    }

    #[test]
    fn truncate_noop_under_cap() {
        assert_eq!(truncate_result("short", 100), "short");
    }
}
