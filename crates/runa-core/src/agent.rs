// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use runa_config::{AgentId, AgentOptions, ReasoningTransport};
use runa_events::{AgentEvent, Channel, EventBus, EventSink, OnGuard, Subscription};
use runa_model::{Block, Message, ModelRequest, ProviderError, Role};
use runa_sandbox::Sandbox;
use runa_store::{Snapshot, Store, StoreMeta};
use runa_tools::{Todo, TodoStatus, ToolHost, ToolRegistry};

use crate::{
    context,
    error::{AgentError, ErrorKind},
    hooks::{HookFlow, PostModelAction},
    inbox::{Inbox, InboxItem, InboxKind},
    permission::{Decision, PermissionEngine},
    resume::{self, ResumeStrategy},
    scheduler::{ScheduledFire, Scheduler, SystemClock, TimeBridge},
    template::{Template, TemplateRegistry},
    todos::TodoService,
    toolrun::{self, ToolRunEnv},
    turn::{self, TurnOutput},
};

/// External capabilities an agent is wired to.
#[derive(Clone)]
pub struct AgentDeps {
    pub model: Arc<dyn runa_model::ModelProvider>,
    pub tools: Arc<ToolRegistry>,
    pub store: Arc<Store>,
    pub sandbox: Option<Arc<dyn Sandbox>>,
    pub templates: Arc<TemplateRegistry>,
    pub clock: Arc<dyn TimeBridge>,
}

impl AgentDeps {
    pub fn new(
        model: Arc<dyn runa_model::ModelProvider>,
        tools: Arc<ToolRegistry>,
        store: Arc<Store>,
    ) -> Self {
        Self {
            model,
            tools,
            store,
            sandbox: None,
            templates: Arc::new(TemplateRegistry::new()),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_sandbox(mut self, sandbox: Arc<dyn Sandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn with_templates(mut self, templates: Arc<TemplateRegistry>) -> Self {
        self.templates = templates;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn TimeBridge>) -> Self {
        self.clock = clock;
        self
    }
}

#[derive(Clone)]
pub struct AgentConfig {
    pub id: AgentId,
    pub template: Arc<Template>,
    pub options: AgentOptions,
}

impl AgentConfig {
    pub fn new(id: impl Into<AgentId>, template: Arc<Template>) -> Self {
        Self {
            id: id.into(),
            template,
            options: AgentOptions::default(),
        }
    }

    pub fn options(mut self, options: AgentOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatStatus {
    Ok,
    Paused,
    Error,
}

/// Terminal result of one `chat()` call.
#[derive(Debug, Clone)]
pub struct ChatReply {
    pub status: ChatStatus,
    pub text: Option<String>,
    /// Call ids awaiting `decide()` when `status == Paused`.
    pub permission_ids: Vec<String>,
    pub error: Option<String>,
}

impl ChatReply {
    fn ok(text: String) -> Self {
        Self {
            status: ChatStatus::Ok,
            text: if text.is_empty() { None } else { Some(text) },
            permission_ids: Vec::new(),
            error: None,
        }
    }

    fn paused(permission_ids: Vec<String>, text: String) -> Self {
        Self {
            status: ChatStatus::Paused,
            text: if text.is_empty() { None } else { Some(text) },
            permission_ids,
            error: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            status: ChatStatus::Error,
            text: None,
            permission_ids: Vec::new(),
            error: Some(message.into()),
        }
    }
}

/// Current durable position of an agent.
#[derive(Debug, Clone)]
pub struct AgentStatus {
    pub last_bookmark: u64,
    pub in_flight: Vec<String>,
}

/// Delegation request for a one-shot sub-agent.
#[derive(Debug, Clone, Default)]
pub struct DelegateRequest {
    /// Template id; `None` reuses the parent's template.
    pub template_id: Option<String>,
    pub prompt: String,
    /// Tool allow-list override for the child.
    pub tools: Option<Vec<String>>,
}

/// Owner registry (pool) seam; agents hold only a weak pointer back, used
/// solely for deregistration on dispose.
pub trait Deregister: Send + Sync {
    fn deregister(&self, id: &AgentId);
}

enum Command {
    Chat {
        input: String,
        reply: oneshot::Sender<ChatReply>,
    },
    Snapshot {
        reply: oneshot::Sender<Result<String, String>>,
    },
    Dispose {
        reply: oneshot::Sender<()>,
    },
}

/// State shared between the public handle and the actor, safe to touch
/// while a turn is in flight.
struct Shared {
    id: AgentId,
    bus: Arc<EventBus>,
    permissions: Arc<PermissionEngine>,
    todos: TodoService,
    inbox: Inbox,
    scheduler: Arc<Scheduler>,
    store: Arc<Store>,
    template_id: String,
    in_flight: Mutex<HashSet<String>>,
    bookmarks: Mutex<HashMap<Channel, u64>>,
    owner: Mutex<Weak<dyn Deregister>>,
    abort: tokio::sync::Notify,
    abort_flag: std::sync::atomic::AtomicBool,
}

impl Shared {
    /// Emit with per-channel bookmark tracking.
    fn emit(&self, event: AgentEvent) -> anyhow::Result<u64> {
        let channel = event.channel();
        let seq = self.bus.emit(event)?;
        self.bookmarks.lock().unwrap().insert(channel, seq);
        Ok(seq)
    }

    fn meta(&self) -> StoreMeta {
        StoreMeta {
            template: self.template_id.clone(),
            bookmarks: self
                .bookmarks
                .lock()
                .unwrap()
                .iter()
                .map(|(channel, seq)| (channel.as_str().to_string(), *seq))
                .collect(),
            in_flight: {
                let mut ids: Vec<String> = self.in_flight.lock().unwrap().iter().cloned().collect();
                ids.sort();
                ids
            },
            todos: self.todos.list(),
        }
    }

    fn save_meta(&self) {
        if let Err(e) = self.store.save_meta(&self.id, &self.meta()) {
            warn!(agent = %self.id, error = %e, "meta write failed");
        }
    }
}

/// Adapter giving tools scoped access back into the runtime.
struct HostAdapter {
    shared: Arc<Shared>,
}

#[async_trait]
impl ToolHost for HostAdapter {
    async fn todos(&self) -> Vec<Todo> {
        self.shared.todos.list()
    }

    async fn set_todos(&self, todos: Vec<Todo>) -> anyhow::Result<Vec<Todo>> {
        let todos = self.shared.todos.set(todos);
        self.shared
            .emit(AgentEvent::TodoUpdated {
                todos: todos.clone(),
            })?;
        Ok(todos)
    }

    fn emit_custom(&self, call_id: &str, event_type: &str, data: Value) {
        if let Err(e) = self.shared.emit(AgentEvent::ToolCustomEvent {
            call_id: call_id.to_string(),
            name: event_type.to_string(),
            data,
        }) {
            warn!(error = %e, "tool custom event emit failed");
        }
    }
}

/// A single conversational entity with its own state, log, and sandbox.
///
/// The handle is cheap to clone; all orchestration runs on one owning task
/// per agent (single-writer).  `send`, `decide`, `subscribe`, and todo
/// accessors act on shared state and are safe while a turn is in flight.
#[derive(Clone)]
pub struct Agent {
    shared: Arc<Shared>,
    deps: AgentDeps,
    template: Arc<Template>,
    options: AgentOptions,
    depth: u32,
    cmd_tx: mpsc::Sender<Command>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent").field("id", &self.shared.id).finish()
    }
}

impl Agent {
    /// Create a fresh agent (or attach to an existing id's durable state).
    pub fn create(config: AgentConfig, deps: AgentDeps) -> Result<Agent, AgentError> {
        Self::spawn(config, deps, 0, None)
    }

    /// Reconstruct an agent from its durable state.
    pub fn resume(
        id: AgentId,
        config: AgentConfig,
        deps: AgentDeps,
        strategy: ResumeStrategy,
    ) -> Result<Agent, AgentError> {
        let state = resume::load_for_resume(&deps.store, &id, strategy)?;
        let config = AgentConfig { id, ..config };
        Self::spawn(config, deps, 0, Some((strategy, state)))
    }

    fn spawn(
        config: AgentConfig,
        deps: AgentDeps,
        depth: u32,
        resumed: Option<(ResumeStrategy, resume::LoadedState)>,
    ) -> Result<Agent, AgentError> {
        let AgentConfig {
            id,
            template,
            options,
        } = config;

        let (messages, todos, last_seq, resumed_info) = match resumed {
            Some((strategy, state)) => (
                state.messages,
                state.todos,
                state.last_seq,
                Some((strategy, state.sealed)),
            ),
            None => {
                let messages = deps.store.load_messages(&id)?;
                let todos = deps
                    .store
                    .load_meta(&id)?
                    .map(|meta| meta.todos)
                    .unwrap_or_default();
                let last_seq = deps.store.last_seq(&id)?;
                (messages, todos, last_seq, None)
            }
        };

        let bus = Arc::new(EventBus::new(
            id.as_str(),
            Arc::clone(&deps.store) as Arc<dyn EventSink>,
            last_seq,
        ));
        let (sched_tx, sched_rx) = mpsc::unbounded_channel::<ScheduledFire>();
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&deps.clock), sched_tx));

        let shared = Arc::new(Shared {
            id: id.clone(),
            bus,
            permissions: Arc::new(PermissionEngine::new(template.permission.clone())),
            todos: TodoService::new(),
            inbox: Inbox::new(),
            scheduler: Arc::clone(&scheduler),
            store: Arc::clone(&deps.store),
            template_id: template.id.clone(),
            in_flight: Mutex::new(HashSet::new()),
            bookmarks: Mutex::new(HashMap::new()),
            owner: Mutex::new(empty_owner()),
            abort: tokio::sync::Notify::new(),
            abort_flag: std::sync::atomic::AtomicBool::new(false),
        });
        shared.todos.seed(todos);

        match &resumed_info {
            Some((strategy, sealed)) => {
                shared
                    .emit(AgentEvent::AgentResumed {
                        strategy: strategy.as_str().to_string(),
                        sealed: sealed.clone(),
                    })
                    .map_err(AgentError::Other)?;
            }
            None => {
                shared
                    .emit(AgentEvent::Lifecycle {
                        state: "created".to_string(),
                    })
                    .map_err(AgentError::Other)?;
            }
        }
        shared.save_meta();

        let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(64);
        let agent = Agent {
            shared: Arc::clone(&shared),
            deps: deps.clone(),
            template: Arc::clone(&template),
            options: options.clone(),
            depth,
            cmd_tx,
        };

        let runner = Runner {
            shared,
            deps,
            template,
            options,
            messages,
            cmd_rx,
            sched_rx,
        };
        tokio::spawn(runner.run());
        agent.spawn_ticker();
        agent.spawn_file_watch();
        Ok(agent)
    }

    /// Cooperative ticker advancing the scheduler's wall-clock triggers.
    fn spawn_ticker(&self) {
        let weak = Arc::downgrade(&self.shared.scheduler);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(25)).await;
                match weak.upgrade() {
                    Some(scheduler) => scheduler.poll_timers(),
                    None => break,
                }
            }
        });
    }

    /// Forward sandbox file-change notifications onto the monitor channel.
    fn spawn_file_watch(&self) {
        let Some(sandbox) = self.deps.sandbox.clone() else {
            return;
        };
        let weak = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            let mut watch = sandbox.watch();
            while let Some(change) = watch.next().await {
                let Some(shared) = weak.upgrade() else { break };
                let kind = serde_json::to_value(change.kind)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| "modified".to_string());
                if shared
                    .emit(AgentEvent::FileChanged {
                        path: change.path.display().to_string(),
                        kind,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });
    }

    pub fn id(&self) -> &AgentId {
        &self.shared.id
    }

    pub fn template(&self) -> &Arc<Template> {
        &self.template
    }

    /// Blocking conversation turn; resolves at a terminal condition
    /// (`ok` / `paused` / `error`).
    pub async fn chat(&self, input: impl Into<String>) -> Result<ChatReply, AgentError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Chat {
                input: input.into(),
                reply: tx,
            })
            .await
            .map_err(|_| AgentError::Gone)?;
        rx.await.map_err(|_| AgentError::Gone)
    }

    /// Non-blocking enqueue of ordinary user input.
    pub fn send(&self, text: impl Into<String>) {
        self.send_kind(text, InboxKind::User);
    }

    /// Non-blocking enqueue with an explicit kind (`reminder`, `mention`).
    pub fn send_kind(&self, text: impl Into<String>, kind: InboxKind) {
        self.shared.inbox.push(InboxItem {
            kind,
            text: text.into(),
        });
    }

    /// Queued inbox items not yet drained into a turn.
    pub fn peek_inbox(&self) -> Vec<InboxItem> {
        self.shared.inbox.peek_all()
    }

    /// Cancel the turn in flight.  The next suspension point observes the
    /// signal; `chat` returns `status: error` with an "aborted" reason.
    /// No-op when no turn is running.
    pub fn abort(&self) {
        self.shared
            .abort_flag
            .store(true, std::sync::atomic::Ordering::Release);
        // notify_one stores a permit, so a raiser that beats the waiter's
        // registration is still observed.
        self.shared.abort.notify_one();
    }

    /// Publish a control-channel signal on this agent's bus.  Used by room
    /// and pool coordination; non-control events are rejected.
    pub fn emit_signal(&self, event: AgentEvent) -> Result<u64, AgentError> {
        if event.channel() != Channel::Control {
            return Err(AgentError::Other(anyhow::anyhow!(
                "emit_signal only accepts control events, got {}",
                event.type_name()
            )));
        }
        self.shared.emit(event).map_err(AgentError::Other)
    }

    pub fn subscribe(&self, channels: &[Channel]) -> Subscription {
        self.shared.bus.subscribe(channels, None)
    }

    /// Subscribe with durable replay from a bookmark.
    pub fn subscribe_since(&self, channels: &[Channel], since: u64) -> Subscription {
        self.shared.bus.subscribe(channels, Some(since))
    }

    /// Filtered monitor+control handler; drop the guard to unsubscribe.
    pub fn on(
        &self,
        event_type: &str,
        handler: impl Fn(runa_events::EventEnvelope) + Send + Sync + 'static,
    ) -> OnGuard {
        self.shared.bus.on(event_type, handler)
    }

    /// Resolve a suspended tool call.  Idempotent: a repeat decision emits
    /// no further events.
    pub fn decide(
        &self,
        call_id: &str,
        decision: Decision,
        note: Option<String>,
    ) -> Result<(), AgentError> {
        if let Some((applied, note)) = self.shared.permissions.decide(call_id, decision, note) {
            self.shared
                .emit(AgentEvent::PermissionDecided {
                    id: call_id.to_string(),
                    decision: applied.as_str().to_string(),
                    note,
                })
                .map_err(AgentError::Other)?;
        }
        Ok(())
    }

    /// Take a consistent snapshot; runs on the actor so no turn is mid-flight.
    pub async fn snapshot(&self) -> Result<String, AgentError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Snapshot { reply: tx })
            .await
            .map_err(|_| AgentError::Gone)?;
        rx.await
            .map_err(|_| AgentError::Gone)?
            .map_err(|e| AgentError::Other(anyhow::anyhow!(e)))
    }

    /// Copy this agent's state into a new identity.  In-flight tool calls
    /// are sealed in the child; events start fresh.
    pub async fn fork(&self) -> Result<Agent, AgentError> {
        let snapshot_id = self.snapshot().await?;
        let snapshot = self
            .deps
            .store
            .load_snapshot(&self.shared.id, &snapshot_id)?;
        let child_id = AgentId::new(format!(
            "{}-fork-{}",
            self.shared.id,
            &uuid::Uuid::new_v4().to_string()[..8]
        ));
        resume::seed_from_snapshot(&self.deps.store, &child_id, &snapshot)?;
        self.shared
            .emit(AgentEvent::ForkCreated {
                child: child_id.to_string(),
            })
            .map_err(AgentError::Other)?;
        let config = AgentConfig {
            id: child_id,
            template: Arc::clone(&self.template),
            options: self.options.clone(),
        };
        Agent::create(config, self.deps.clone())
    }

    /// Run a one-shot sub-agent and return its terminal reply.
    pub async fn delegate_task(&self, request: DelegateRequest) -> Result<ChatReply, AgentError> {
        let limits = &self.template.runtime.subagents;
        if self.depth >= limits.depth {
            return Ok(ChatReply::error(format!(
                "maximum delegation depth ({}) reached",
                limits.depth
            )));
        }
        let template = match &request.template_id {
            Some(template_id) => {
                if !limits.templates.is_empty() && !limits.templates.contains(template_id) {
                    return Ok(ChatReply::error(format!(
                        "template {template_id} is not delegable from this agent"
                    )));
                }
                self.deps.templates.get(template_id).ok_or_else(|| {
                    AgentError::Other(anyhow::anyhow!("unknown template: {template_id}"))
                })?
            }
            None => Arc::clone(&self.template),
        };
        let template = match &request.tools {
            Some(tools) => {
                let mut restricted = (*template).clone();
                restricted.tools = tools.clone();
                Arc::new(restricted)
            }
            None => template,
        };

        let child_id = AgentId::new(format!(
            "{}-sub-{}",
            self.shared.id,
            &uuid::Uuid::new_v4().to_string()[..8]
        ));
        debug!(parent = %self.shared.id, child = %child_id, depth = self.depth + 1, "delegating task");
        let config = AgentConfig {
            id: child_id,
            template,
            options: self.options.clone(),
        };
        let child = Agent::spawn(config, self.deps.clone(), self.depth + 1, None)?;
        let reply = child.chat(request.prompt.clone()).await?;
        child.dispose().await;
        Ok(reply)
    }

    // ── Todos ────────────────────────────────────────────────────────────────

    pub fn get_todos(&self) -> Vec<Todo> {
        self.shared.todos.list()
    }

    pub fn set_todos(&self, todos: Vec<Todo>) -> Result<Vec<Todo>, AgentError> {
        let todos = self.shared.todos.set(todos);
        self.shared
            .emit(AgentEvent::TodoUpdated {
                todos: todos.clone(),
            })
            .map_err(AgentError::Other)?;
        self.shared.save_meta();
        Ok(todos)
    }

    pub fn update_todo(
        &self,
        id: &str,
        status: Option<TodoStatus>,
        title: Option<String>,
    ) -> Result<Vec<Todo>, AgentError> {
        let todos = self.shared.todos.update(id, status, title)?;
        self.shared
            .emit(AgentEvent::TodoUpdated {
                todos: todos.clone(),
            })
            .map_err(AgentError::Other)?;
        self.shared.save_meta();
        Ok(todos)
    }

    pub fn delete_todo(&self, id: &str) -> Result<Vec<Todo>, AgentError> {
        let todos = self.shared.todos.delete(id)?;
        self.shared
            .emit(AgentEvent::TodoUpdated {
                todos: todos.clone(),
            })
            .map_err(AgentError::Other)?;
        self.shared.save_meta();
        Ok(todos)
    }

    // ── Introspection ────────────────────────────────────────────────────────

    pub fn status(&self) -> AgentStatus {
        let mut in_flight: Vec<String> = self
            .shared
            .in_flight
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .collect();
        in_flight.sort();
        AgentStatus {
            last_bookmark: self.shared.bus.bookmark(),
            in_flight,
        }
    }

    pub fn schedule(&self) -> Arc<Scheduler> {
        Arc::clone(&self.shared.scheduler)
    }

    pub fn attach_owner(&self, owner: Weak<dyn Deregister>) {
        *self.shared.owner.lock().unwrap() = owner;
    }

    /// Stop the actor and release the sandbox.  Durable state survives.
    pub async fn dispose(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Dispose { reply: tx }).await.is_ok() {
            let _ = rx.await;
        }
        if let Some(sandbox) = &self.deps.sandbox {
            sandbox.dispose().await;
        }
        let _ = self.shared.emit(AgentEvent::Lifecycle {
            state: "disposed".to_string(),
        });
        self.shared.save_meta();
        if let Some(owner) = self.shared.owner.lock().unwrap().upgrade() {
            owner.deregister(&self.shared.id);
        }
    }
}

/// Placeholder type so `Weak<dyn Deregister>` has a default value.
struct PoolNever;
impl Deregister for PoolNever {
    fn deregister(&self, _id: &AgentId) {}
}

fn empty_owner() -> Weak<dyn Deregister> {
    Weak::<PoolNever>::new()
}

// ─── The actor ───────────────────────────────────────────────────────────────

struct Runner {
    shared: Arc<Shared>,
    deps: AgentDeps,
    template: Arc<Template>,
    options: AgentOptions,
    messages: Vec<Message>,
    cmd_rx: mpsc::Receiver<Command>,
    sched_rx: mpsc::UnboundedReceiver<ScheduledFire>,
}

impl Runner {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.cmd_rx.recv() => match command {
                    None => break,
                    Some(Command::Chat { input, reply }) => {
                        let result = self.run_chat(input).await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Snapshot { reply }) => {
                        let result = self.take_snapshot().map_err(|e| e.to_string());
                        let _ = reply.send(result);
                    }
                    Some(Command::Dispose { reply }) => {
                        let _ = reply.send(());
                        break;
                    }
                },
                fire = self.sched_rx.recv() => {
                    if let Some(fire) = fire {
                        (fire.callback)(fire.tick);
                    }
                }
            }
        }
        debug!(agent = %self.shared.id, "agent actor stopped");
    }

    async fn run_chat(&mut self, input: String) -> ChatReply {
        match self.options.turn_timeout_ms {
            Some(ms) => {
                match tokio::time::timeout(Duration::from_millis(ms), self.chat_inner(input)).await
                {
                    Ok(reply) => reply,
                    Err(_) => {
                        let reason = format!("turn timed out after {ms}ms");
                        let _ = self.shared.emit(AgentEvent::Done {
                            error: Some(reason.clone()),
                        });
                        let _ = self.shared.emit(AgentEvent::AgentHalted {
                            reason: reason.clone(),
                        });
                        ChatReply::error(reason)
                    }
                }
            }
            None => self.chat_inner(input).await,
        }
    }

    async fn chat_inner(&mut self, input: String) -> ChatReply {
        let template = Arc::clone(&self.template);
        // A stale abort from before this turn must not cancel it.
        self.take_abort();

        // Decisions that arrived while the agent was paused settle first so
        // the model sees their results in this turn.
        match self.reconcile_suspended().await {
            Ok(blocks) if !blocks.is_empty() => {
                if let Err(e) = self.append_message(Message::tool_results(blocks)).await {
                    return self.persistence_failure(e);
                }
            }
            Ok(_) => {}
            Err(e) => return self.persistence_failure(e),
        }

        // Inbox items queued since the last turn become leading messages.
        for item in self.shared.inbox.drain() {
            if let Err(e) = self.append_message(item.into_message()).await {
                return self.persistence_failure(e);
            }
        }

        let todo_opts = template.runtime.todo.clone();
        if todo_opts.enabled
            && todo_opts.reminder_on_start
            && self.shared.scheduler.step_count() == 0
        {
            let reminder = context::todo_reminder(self.shared.todos.summary());
            if let Err(e) = self.append_message(reminder).await {
                return self.persistence_failure(e);
            }
        }

        if let Err(e) = self.append_message(Message::user(input)).await {
            return self.persistence_failure(e);
        }

        // preModel hook chain.
        for hook in &template.hooks.pre_model {
            match hook(self.messages.clone()).await {
                Ok(HookFlow::Continue) => {}
                Ok(HookFlow::Halt { reason }) => return self.halt(reason),
                Err(e) => {
                    let _ = self
                        .shared
                        .emit(ErrorKind::HookError.event(format!("preModel: {e}"), None));
                }
            }
        }

        let mut final_text = String::new();
        let mut rounds = 0u32;
        loop {
            rounds += 1;
            if self.take_abort() {
                return self.halt("aborted".to_string());
            }
            if rounds > self.options.max_tool_rounds {
                let reason = format!(
                    "exceeded max tool rounds ({})",
                    self.options.max_tool_rounds
                );
                let _ = self.shared.emit(AgentEvent::Done {
                    error: Some(reason.clone()),
                });
                let _ = self
                    .shared
                    .emit(AgentEvent::AgentHalted { reason: reason.clone() });
                return ChatReply::error(reason);
            }

            let output = match self.stream_with_retry().await {
                Ok(output) => output,
                Err(e) => {
                    if e.to_string() == "aborted" {
                        return self.halt("aborted".to_string());
                    }
                    let _ = self
                        .shared
                        .emit(ErrorKind::ProviderError.event(e.to_string(), None));
                    let _ = self.shared.emit(AgentEvent::Done {
                        error: Some(e.to_string()),
                    });
                    return ChatReply::error(e.to_string());
                }
            };

            let mut blocks = output.blocks;
            // postModel hooks may rewrite the content the turn continues with.
            for hook in &template.hooks.post_model {
                match hook(blocks.clone()).await {
                    Ok(PostModelAction::Keep) => {}
                    Ok(PostModelAction::Replace(replacement)) => blocks = replacement,
                    Ok(PostModelAction::Halt { reason }) => return self.halt(reason),
                    Err(e) => {
                        let _ = self
                            .shared
                            .emit(ErrorKind::HookError.event(format!("postModel: {e}"), None));
                    }
                }
            }

            let text = blocks
                .iter()
                .filter_map(|b| match b {
                    Block::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("");
            let tool_calls: Vec<runa_tools::ToolCall> = blocks
                .iter()
                .filter_map(|b| match b {
                    Block::ToolUse { id, name, input } => Some(runa_tools::ToolCall {
                        id: id.clone(),
                        name: name.clone(),
                        args: input.clone(),
                    }),
                    _ => None,
                })
                .collect();

            let stored: Vec<Block> = blocks
                .into_iter()
                .filter(|b| self.options.retain_thinking || !matches!(b, Block::Reasoning { .. }))
                .collect();
            if !stored.is_empty() {
                if let Err(e) = self.append_message(Message::new(Role::Assistant, stored)).await {
                    return self.persistence_failure(e);
                }
            }

            if !text.is_empty() {
                final_text = text;
            }

            if tool_calls.is_empty() {
                let _ = self.shared.emit(AgentEvent::Done { error: None });
                break;
            }

            let host: Arc<dyn ToolHost> = Arc::new(HostAdapter {
                shared: Arc::clone(&self.shared),
            });
            let shared = Arc::clone(&self.shared);
            let emit = move |event: AgentEvent| shared.emit(event);
            let env = ToolRunEnv {
                agent: &self.shared.id,
                store: &self.deps.store,
                registry: &self.deps.tools,
                permissions: &self.shared.permissions,
                sandbox: self.deps.sandbox.clone(),
                host,
                emit: &emit,
                in_flight: &self.shared.in_flight,
                result_byte_cap: self.options.tool_result_byte_cap,
            };
            let batch = match toolrun::run_batch(&env, tool_calls).await {
                Ok(batch) => batch,
                Err(e) => {
                    let _ = self
                        .shared
                        .emit(ErrorKind::PersistenceError.event(e.to_string(), None));
                    let _ = self.shared.emit(AgentEvent::Done {
                        error: Some(e.to_string()),
                    });
                    return ChatReply::error(e.to_string());
                }
            };

            if !batch.result_blocks.is_empty() {
                if let Err(e) = self
                    .append_message(Message::tool_results(batch.result_blocks))
                    .await
                {
                    return self.persistence_failure(e);
                }
            }

            if !batch.paused.is_empty() {
                let _ = self.shared.emit(AgentEvent::Done { error: None });
                self.shared.save_meta();
                return ChatReply::paused(batch.paused, final_text);
            }
        }

        self.shared.scheduler.on_step();
        if todo_opts.enabled {
            if let Some(interval) = todo_opts.remind_interval_steps {
                let steps = self.shared.scheduler.step_count();
                if interval > 0 && steps % interval as u64 == 0 {
                    self.shared.inbox.push(InboxItem {
                        kind: InboxKind::Reminder,
                        text: self.shared.todos.summary(),
                    });
                }
            }
        }
        self.shared.save_meta();
        ChatReply::ok(final_text)
    }

    fn take_abort(&self) -> bool {
        self.shared
            .abort_flag
            .swap(false, std::sync::atomic::Ordering::AcqRel)
    }

    /// One streamed model call, with a single retry on transport-shaped
    /// failures.  Cancellable at every await by `abort()`.
    async fn stream_with_retry(&self) -> anyhow::Result<TurnOutput> {
        let shared = Arc::clone(&self.shared);
        let emit = move |event: AgentEvent| shared.emit(event);
        for attempt in 0..2u32 {
            let request = self.build_request();
            let streamed = async {
                match self.deps.model.stream(request).await {
                    Ok(stream) => {
                        turn::consume_stream(stream, self.options.expose_thinking, &emit).await
                    }
                    Err(e) => Err(anyhow::Error::from(e)),
                }
            };
            // Re-checks the flag after every wakeup so a stale permit from a
            // previous turn cannot cancel this one.
            let abort_wait = async {
                loop {
                    if self
                        .shared
                        .abort_flag
                        .load(std::sync::atomic::Ordering::Acquire)
                    {
                        return;
                    }
                    self.shared.abort.notified().await;
                }
            };
            let result = tokio::select! {
                biased;
                _ = abort_wait => {
                    self.take_abort();
                    return Err(anyhow::anyhow!("aborted"));
                }
                result = streamed => result,
            };
            match result {
                Ok(output) => return Ok(output),
                Err(e) => {
                    let retryable = e
                        .downcast_ref::<ProviderError>()
                        .map(ProviderError::is_retryable)
                        .unwrap_or(false);
                    if attempt == 0 && retryable {
                        warn!(error = %e, "provider call failed; retrying once");
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
        unreachable!("retry loop returns on the second attempt")
    }

    fn build_request(&self) -> ModelRequest {
        let view = match self.options.history_char_budget {
            Some(budget) => context::windowed(
                &self.messages,
                budget,
                self.options.compaction_keep_recent,
            ),
            None => self.messages.clone(),
        };
        // Reasoning blocks only travel back to the provider in `provider`
        // transport mode.
        let messages = match self.options.reasoning_transport {
            ReasoningTransport::Provider => view,
            ReasoningTransport::Internal | ReasoningTransport::None => view
                .into_iter()
                .map(|mut message| {
                    message
                        .content
                        .retain(|b| !matches!(b, Block::Reasoning { .. }));
                    message
                })
                .filter(|message| !message.content.is_empty())
                .collect(),
        };
        ModelRequest {
            messages,
            system: if self.template.system_prompt.is_empty() {
                None
            } else {
                Some(self.template.system_prompt.clone())
            },
            tools: self.deps.tools.schemas(self.template.tool_allow_list()),
            ..Default::default()
        }
    }

    /// Settle suspended calls for which a decision has since arrived.
    async fn reconcile_suspended(&mut self) -> anyhow::Result<Vec<Block>> {
        let records = self.deps.store.load_tool_call_records(&self.shared.id)?;
        let mut blocks = Vec::new();
        for record in records {
            if record.state.is_terminal() {
                continue;
            }
            let Some((decision, note)) = self.shared.permissions.decision_for(&record.id) else {
                continue;
            };
            let host: Arc<dyn ToolHost> = Arc::new(HostAdapter {
                shared: Arc::clone(&self.shared),
            });
            let shared = Arc::clone(&self.shared);
            let emit = move |event: AgentEvent| shared.emit(event);
            let env = ToolRunEnv {
                agent: &self.shared.id,
                store: &self.deps.store,
                registry: &self.deps.tools,
                permissions: &self.shared.permissions,
                sandbox: self.deps.sandbox.clone(),
                host,
                emit: &emit,
                in_flight: &self.shared.in_flight,
                result_byte_cap: self.options.tool_result_byte_cap,
            };
            blocks.push(toolrun::settle_decided(&env, record, decision, note).await?);
        }
        Ok(blocks)
    }

    async fn append_message(&mut self, message: Message) -> anyhow::Result<()> {
        // Bounded retry on the durable append; a store that stays down is
        // fatal for the turn.
        let mut last_err = None;
        for attempt in 0..3u32 {
            match self.shared.store.append_message(&self.shared.id, &message) {
                Ok(()) => {
                    last_err = None;
                    break;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "message append failed");
                    last_err = Some(e);
                }
            }
        }
        if let Some(e) = last_err {
            return Err(anyhow::Error::from(e));
        }
        self.messages.push(message);
        self.shared.emit(AgentEvent::MessagesChanged {
            count: self.messages.len(),
        })?;
        for hook in &self.template.hooks.messages_changed {
            hook(self.messages.len()).await;
        }
        Ok(())
    }

    fn persistence_failure(&self, e: anyhow::Error) -> ChatReply {
        let _ = self
            .shared
            .emit(ErrorKind::PersistenceError.event(e.to_string(), None));
        let _ = self.shared.emit(AgentEvent::Done {
            error: Some(e.to_string()),
        });
        ChatReply::error(e.to_string())
    }

    fn halt(&self, reason: String) -> ChatReply {
        let _ = self
            .shared
            .emit(AgentEvent::AgentHalted { reason: reason.clone() });
        let _ = self.shared.emit(AgentEvent::Done {
            error: Some(reason.clone()),
        });
        ChatReply::error(reason)
    }

    fn take_snapshot(&self) -> anyhow::Result<String> {
        let snapshot_id = format!("snap-{}", &uuid::Uuid::new_v4().to_string()[..13]);
        let tool_records = self.deps.store.load_tool_call_records(&self.shared.id)?;
        let pending_permissions: Vec<String> = {
            let mut ids: Vec<String> = self
                .shared
                .in_flight
                .lock()
                .unwrap()
                .iter()
                .cloned()
                .collect();
            ids.sort();
            ids
        };
        let snapshot = Snapshot {
            agent_id: self.shared.id.to_string(),
            snapshot_id: snapshot_id.clone(),
            created_at: chrono::Utc::now(),
            template: self.template.id.clone(),
            messages: self.messages.clone(),
            todos: self.shared.todos.list(),
            tool_records,
            last_seq: self.shared.bus.bookmark(),
            pending_permissions,
        };
        self.deps.store.save_snapshot(&snapshot)?;
        self.shared.emit(AgentEvent::SnapshotTaken {
            id: snapshot_id.clone(),
            seq: snapshot.last_seq,
        })?;
        self.shared.save_meta();
        Ok(snapshot_id)
    }
}
