//! The per-run state machine.
//!
//! [`Agent::start`] spawns one worker task fed by an action queue. The
//! worker owns all mutation of its turn, tool-call group, approvals, and
//! LLM counter; callers interact through the event queue and the
//! cancellation token. Actions are FIFO; within a tool-call round exactly
//! one follow-up (next model call or stop) is produced.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use tiller_context::{AgentContext, MemoryStore, Skill};
use tiller_domain::{
    AssistantMessage, Error, Message, Result, ToolCall, ToolDefinition, ToolMessage, Usage,
};
use tiller_sessions::ConversationHistory;
use tiller_workspace::Workspace;

use crate::approval::{ApprovalQueue, PendingApproval};
use crate::cancel::CancelToken;
use crate::event::{AgentEvent, EventMeta};
use crate::group::{ClosedGroup, FinalOutcome, Reconciler, ResponseOutcome};
use crate::interceptor::Interceptor;
use crate::model::{Model, ModelRequest, StreamItem};
use crate::subagent::{AgentTool, SubAgentDef};
use crate::tool::{Tool, ToolCtx, ToolResult};
use crate::trace::{TraceInterceptor, TraceWriter};

const MEMORY_FILE: &str = "memory.json";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RunSession — state shared by every run on one workspace
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The durable state a run executes against: workspace, history, memory,
/// and the shared turn counter. Parent and sub-agent runs hold clones of
/// the same session.
#[derive(Clone)]
pub struct RunSession {
    pub workspace: Arc<Workspace>,
    pub history: Arc<ConversationHistory>,
    pub memory: Arc<MemoryStore>,
    pub session_id: String,
    turn_counter: Arc<Mutex<u64>>,
}

impl RunSession {
    /// Create a fresh timestamped workspace under `base_dir`.
    pub fn create(base_dir: impl AsRef<Path>, agent_id: &str) -> Result<Self> {
        Self::from_workspace(Arc::new(Workspace::create(base_dir, agent_id)?))
    }

    /// Open an existing workspace root, rehydrating history and memory.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        Self::from_workspace(Arc::new(Workspace::open(root.as_ref())?))
    }

    pub fn from_workspace(workspace: Arc<Workspace>) -> Result<Self> {
        let history = Arc::new(ConversationHistory::open(&workspace)?);
        let memory = Arc::new(MemoryStore::open(
            workspace.private_dir().join(MEMORY_FILE),
        )?);
        // Resume turn numbering after the highest persisted turn.
        let highest = history
            .turns()
            .iter()
            .filter_map(|t| t.turn_id.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        Ok(Self {
            workspace,
            history,
            memory,
            session_id: Uuid::new_v4().to_string(),
            turn_counter: Arc::new(Mutex::new(highest)),
        })
    }

    pub fn turn_counter(&self) -> Arc<Mutex<u64>> {
        self.turn_counter.clone()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RunOptions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Cap on model calls per run.
    pub max_llm_calls: usize,
    /// How long a pending approval may wait before it times out.
    pub approval_timeout: Duration,
    /// Cadence of the approval-expiry scan.
    pub tick_interval: Duration,
    /// Use the model's streaming entry point.
    pub streaming: bool,
    /// Write a per-turn trace file.
    pub trace: bool,
    /// Include prior history in every prompt.
    pub include_history: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_llm_calls: 20,
            approval_timeout: Duration::from_secs(60 * 60),
            tick_interval: Duration::from_secs(30),
            streaming: false,
            trace: false,
            include_history: true,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent — the run definition
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An agent definition: identity, model, tools, sub-agents, retrievers,
/// interceptors. Starting it against a session spawns an [`AgentRun`].
pub struct Agent {
    name: String,
    description: String,
    instructions: String,
    output_instructions: String,
    model: Arc<dyn Model>,
    tools: Vec<Arc<dyn Tool>>,
    sub_agents: Vec<SubAgentDef>,
    retrievers: Vec<Arc<dyn Tool>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    skills: Vec<Skill>,
    options: RunOptions,
}

impl Agent {
    pub fn new(name: impl Into<String>, model: Arc<dyn Model>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            instructions: String::new(),
            output_instructions: String::new(),
            model,
            tools: Vec::new(),
            sub_agents: Vec::new(),
            retrievers: Vec::new(),
            interceptors: Vec::new(),
            skills: Vec::new(),
            options: RunOptions::default(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_output_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.output_instructions = instructions.into();
        self
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    /// Install a sub-agent, exposed to the model as a tool named after it.
    pub fn with_sub_agent(mut self, def: SubAgentDef) -> Self {
        self.sub_agents.push(def);
        self
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn Tool>) -> Self {
        self.retrievers.push(retriever);
        self
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn with_skills(mut self, skills: Vec<Skill>) -> Self {
        self.skills = skills;
        self
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sub_agents(&self) -> &[SubAgentDef] {
        &self.sub_agents
    }

    /// Start a run for one user message.
    pub fn start(&self, session: &RunSession, user_message: &str) -> Result<AgentRun> {
        self.start_inner(session, user_message, None, None)
    }

    /// Start a child run sharing a parent's trace and cancellation.
    pub(crate) fn start_child(
        &self,
        session: &RunSession,
        user_message: &str,
        trace: Option<Arc<TraceWriter>>,
        cancel: CancelToken,
    ) -> Result<AgentRun> {
        self.start_inner(session, user_message, trace, Some(cancel))
    }

    fn start_inner(
        &self,
        session: &RunSession,
        user_message: &str,
        shared_trace: Option<Arc<TraceWriter>>,
        cancel: Option<CancelToken>,
    ) -> Result<AgentRun> {
        let run_id = Uuid::new_v4().to_string();
        let cancel = cancel.unwrap_or_default();

        let ctx = Arc::new(
            AgentContext::new(
                run_id.as_str(),
                self.name.as_str(),
                session.workspace.clone(),
                session.history.clone(),
            )?
            .with_memory_store(session.memory.clone())
            .with_turn_counter(session.turn_counter())
            .with_description(self.description.clone())
            .with_instructions(self.instructions.clone())
            .with_output_instructions(self.output_instructions.clone())
            .with_skills(self.skills.clone()),
        );

        let turn_id = ctx.start_turn(user_message)?;

        // A shared trace comes from the parent; otherwise open one for this
        // turn when tracing is on.
        let trace = match shared_trace {
            Some(trace) => Some(trace),
            None if self.options.trace => {
                let path = session
                    .workspace
                    .turns_dir()
                    .join(&turn_id)
                    .join("trace.txt");
                let writer = Arc::new(TraceWriter::create(&path)?);
                ctx.with_turn(|t| t.trace_file = Some(writer.path().to_path_buf()));
                Some(writer)
            }
            None => None,
        };

        // Registry in lookup priority order: agent tools, sub-agents,
        // retrievers. Duplicate names resolve left-to-right.
        let mut registry: Vec<Arc<dyn Tool>> = self.tools.clone();
        for def in &self.sub_agents {
            registry.push(Arc::new(AgentTool::new(def.clone())));
        }
        registry.extend(self.retrievers.iter().cloned());

        // The trace interceptor goes last so it sees the final payloads.
        let mut interceptors = self.interceptors.clone();
        if let Some(writer) = &trace {
            interceptors.push(Arc::new(TraceInterceptor::new(
                writer.clone(),
                self.name.clone(),
            )));
        }

        let (actions_tx, actions_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let worker = Worker {
            meta: EventMeta {
                run_id: run_id.clone(),
                agent_name: self.name.clone(),
                session_id: session.session_id.clone(),
            },
            ctx,
            session: session.clone(),
            model: self.model.clone(),
            registry,
            interceptors,
            options: self.options.clone(),
            cancel: cancel.clone(),
            trace,
            actions_tx: actions_tx.clone(),
            events_tx,
            reconciler: Reconciler::new(),
            approvals: ApprovalQueue::new(self.options.approval_timeout),
            llm_calls: 0,
            turn_usage: Usage::default(),
        };

        actions_tx
            .send(Action::LlmCall)
            .map_err(|_| Error::Other("action queue closed before start".into()))?;

        let span = tracing::info_span!("run", run_id = %run_id, agent = %self.name);
        let handle = tokio::spawn(tracing::Instrument::instrument(
            worker.process(actions_rx),
            span,
        ));

        Ok(AgentRun {
            run_id,
            actions_tx,
            events_rx: Some(events_rx),
            cancel,
            _handle: handle,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AgentRun — the caller-facing handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct AgentRun {
    run_id: String,
    actions_tx: mpsc::UnboundedSender<Action>,
    events_rx: Option<mpsc::UnboundedReceiver<AgentEvent>>,
    cancel: CancelToken,
    _handle: tokio::task::JoinHandle<()>,
}

impl AgentRun {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Request cancellation; the worker stops at its next action.
    pub fn cancel(&self) {
        self.cancel.cancel();
        let _ = self.actions_tx.send(Action::Stop {
            error: Some(Error::Cancelled),
        });
    }

    /// Resolve a pending approval.
    pub fn approve(&self, approval_id: &str, approved: bool) {
        let _ = self.actions_tx.send(Action::Approval {
            approval_id: approval_id.to_string(),
            approved,
        });
    }

    /// Take the event receiver. Panics when taken twice.
    pub fn events(&mut self) -> mpsc::UnboundedReceiver<AgentEvent> {
        self.events_rx
            .take()
            .expect("event receiver already taken")
    }

    /// The next event, or None once the run has finished and drained.
    pub async fn next_event(&mut self) -> Option<AgentEvent> {
        self.events_rx.as_mut()?.recv().await
    }

    /// Drain events until the run finishes, collapsing them into the
    /// accumulated assistant content or the first error.
    pub async fn wait(&mut self, timeout: Duration) -> Result<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut content = String::new();
        let mut error: Option<Error> = None;

        loop {
            let Some(rx) = self.events_rx.as_mut() else {
                return Err(Error::Other("event receiver already taken".into()));
            };
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Err(_) => {
                    self.cancel();
                    return Err(Error::Other(format!(
                        "run {} timed out after {timeout:?}",
                        self.run_id
                    )));
                }
                Ok(None) => break,
                Ok(Some(event)) => match event {
                    AgentEvent::Content { content: c, .. } => content.push_str(&c),
                    AgentEvent::Error { message, .. } => error = Some(Error::Other(message)),
                    _ => {}
                },
            }
        }

        match error {
            Some(e) => Err(e),
            None => Ok(content),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Actions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug)]
enum Action {
    LlmCall,
    ToolCall {
        call: ToolCall,
        args: serde_json::Value,
        group_id: u64,
    },
    ToolResponse {
        response: ToolMessage,
        terminal: bool,
        group_id: u64,
    },
    Approval {
        approval_id: String,
        approved: bool,
    },
    Stop {
        error: Option<Error>,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Worker — the single-consumer loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Worker {
    meta: EventMeta,
    ctx: Arc<AgentContext>,
    session: RunSession,
    model: Arc<dyn Model>,
    registry: Vec<Arc<dyn Tool>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    options: RunOptions,
    cancel: CancelToken,
    trace: Option<Arc<TraceWriter>>,
    actions_tx: mpsc::UnboundedSender<Action>,
    events_tx: mpsc::UnboundedSender<AgentEvent>,
    reconciler: Reconciler,
    approvals: ApprovalQueue,
    llm_calls: usize,
    turn_usage: Usage,
}

impl Worker {
    async fn process(mut self, mut actions_rx: mpsc::UnboundedReceiver<Action>) {
        let mut tick = tokio::time::interval(self.options.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tick.reset(); // skip the immediate first tick

        loop {
            tokio::select! {
                action = actions_rx.recv() => {
                    let Some(action) = action else { break };
                    // Cancellation preempts whatever was queued.
                    if self.cancel.is_cancelled() && !matches!(action, Action::Stop { .. }) {
                        self.finish(Some(Error::Cancelled));
                        break;
                    }
                    tracing::debug!(action = ?action_kind(&action), "processing action");
                    match action {
                        Action::LlmCall => self.handle_llm_call().await,
                        Action::ToolCall { call, args, group_id } => {
                            self.handle_tool_call(call, args, group_id).await
                        }
                        Action::ToolResponse { response, terminal, group_id } => {
                            self.handle_tool_response(response, terminal, group_id)
                        }
                        Action::Approval { approval_id, approved } => {
                            self.handle_approval(approval_id, approved).await
                        }
                        Action::Stop { error } => {
                            self.finish(error);
                            break;
                        }
                    }
                }
                _ = tick.tick() => self.expire_approvals(),
            }
        }
    }

    fn finish(&mut self, error: Option<Error>) {
        if let Some(error) = error {
            if let Some(trace) = &self.trace {
                trace.record_error(&error.to_string());
            }
            tracing::debug!(error = %error, "run stopped with error");
            self.emit(AgentEvent::Error {
                meta: self.meta.clone(),
                message: error.to_string(),
            });
        }
        self.cancel.cancel();
        // Dropping the worker closes the event channel; the caller sees the
        // stream end.
    }

    fn emit(&self, event: AgentEvent) {
        let _ = self.events_tx.send(event);
    }

    fn enqueue(&self, action: Action) {
        let _ = self.actions_tx.send(action);
    }

    fn stop(&self, error: Option<Error>) {
        self.enqueue(Action::Stop { error });
    }

    fn find_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        // Left-to-right first match: agent tools shadow sub-agents shadow
        // retrievers.
        self.registry
            .iter()
            .find(|t| t.definition().name == name)
            .cloned()
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut seen = std::collections::HashSet::new();
        self.registry
            .iter()
            .map(|t| t.definition())
            .filter(|d| seen.insert(d.name.clone()))
            .collect()
    }

    // ── LLM call ───────────────────────────────────────────────────

    async fn handle_llm_call(&mut self) {
        if self.llm_calls >= self.options.max_llm_calls {
            self.stop(Some(Error::LimitExceeded(self.options.max_llm_calls)));
            return;
        }
        self.llm_calls += 1;
        self.reconciler.reset();

        self.emit(AgentEvent::LlmCall {
            meta: self.meta.clone(),
            message: self
                .ctx
                .with_turn(|t| t.user_message.clone())
                .unwrap_or_default(),
        });

        let tools = self.tool_definitions();
        let messages = match self.ctx.build_prompt(&tools, self.options.include_history) {
            Ok(messages) => messages,
            Err(e) => {
                self.stop(Some(e));
                return;
            }
        };

        let mut request = ModelRequest {
            messages,
            tools,
            cancel: self.cancel.clone(),
        };
        for interceptor in &self.interceptors {
            if let Err(e) = interceptor.before_call(&mut request).await {
                self.stop(Some(Error::Interceptor {
                    name: interceptor.name().to_string(),
                    message: e.to_string(),
                }));
                return;
            }
        }

        let final_message = if self.options.streaming {
            match self.consume_stream(request).await {
                Ok(Some(message)) => message,
                Ok(None) => return, // stream aborted; stop already queued
                Err(e) => {
                    self.stop(Some(e));
                    return;
                }
            }
        } else {
            match self.model.call(request).await {
                Ok(message) => message,
                Err(e) => {
                    self.stop(Some(e));
                    return;
                }
            }
        };

        self.finish_llm_call(final_message).await;
    }

    /// Drain the chunk stream, dispatching tool calls as they appear.
    /// Returns the final message, or None when the run is stopping.
    async fn consume_stream(
        &mut self,
        request: ModelRequest,
    ) -> Result<Option<AssistantMessage>> {
        let mut stream = self.model.stream(request).await?;
        let mut final_message = None;

        while let Some(item) = stream.next().await {
            if self.cancel.is_cancelled() {
                self.stop(Some(Error::Cancelled));
                return Ok(None);
            }
            match item? {
                StreamItem::Chunk(chunk) => {
                    if !chunk.thinking.is_empty() {
                        self.emit(AgentEvent::Thinking {
                            meta: self.meta.clone(),
                            content: chunk.thinking.clone(),
                        });
                    }
                    if !chunk.content.is_empty() {
                        self.reconciler.mark_content_streamed();
                        self.emit(AgentEvent::Content {
                            meta: self.meta.clone(),
                            content: chunk.content.clone(),
                        });
                    }
                    let fresh = self.reconciler.on_chunk(&chunk);
                    self.enqueue_tool_calls(fresh);
                }
                StreamItem::Final(message) => {
                    final_message = Some(message);
                }
            }
        }

        match final_message {
            Some(message) => Ok(Some(message)),
            None => Err(Error::Model("stream ended without a final message".into())),
        }
    }

    async fn finish_llm_call(&mut self, mut final_message: AssistantMessage) {
        for interceptor in &self.interceptors {
            if let Err(e) = interceptor.after_call(&mut final_message).await {
                self.stop(Some(Error::Interceptor {
                    name: interceptor.name().to_string(),
                    message: e.to_string(),
                }));
                return;
            }
        }

        if let Some(usage) = &final_message.usage {
            self.turn_usage.add(usage);
        }

        match self.reconciler.on_final(final_message) {
            FinalOutcome::SealTurn(message) => {
                if !message.content.is_empty() && !self.reconciler.content_streamed() {
                    self.emit(AgentEvent::Content {
                        meta: self.meta.clone(),
                        content: message.content.clone(),
                    });
                }
                self.seal_turn(message);
                self.stop(None);
            }
            FinalOutcome::NewCalls(fresh) => {
                self.attach_assistant_to_turn();
                self.enqueue_tool_calls(fresh);
            }
            FinalOutcome::Complete(closed) => {
                // The group already left the reconciler; attach its message
                // directly.
                self.ctx.with_turn(|t| {
                    t.add_message(Message::Assistant(closed.assistant.clone()))
                });
                self.close_group(closed);
            }
        }
    }

    fn attach_assistant_to_turn(&self) {
        if let Some(assistant) = self.reconciler.assistant_snapshot() {
            self.ctx
                .with_turn(|t| t.add_message(Message::Assistant(assistant.clone())));
        }
    }

    fn seal_turn(&mut self, reply: AssistantMessage) {
        let usage = std::mem::take(&mut self.turn_usage);
        if let Err(e) = self.ctx.end_turn(reply, usage) {
            tracing::warn!(error = %e, "failed to seal turn");
        }
    }

    // ── Tool dispatch ──────────────────────────────────────────────

    /// Resolve and queue freshly-observed tool calls. Unknown tools and
    /// unparseable arguments become synthetic responses so the model can
    /// recover.
    fn enqueue_tool_calls(&mut self, calls: Vec<ToolCall>) {
        let group_id = self.reconciler.group_id().unwrap_or(0);
        for call in calls {
            if self.find_tool(&call.name).is_none() {
                tracing::warn!(tool = %call.name, "model requested unknown tool");
                self.enqueue(Action::ToolResponse {
                    response: ToolMessage {
                        tool_call_id: call.id.clone(),
                        tool_name: call.name.clone(),
                        content: format!("tool not found: {}", call.name),
                    },
                    terminal: false,
                    group_id,
                });
                continue;
            }

            let raw = call.arguments.trim();
            let parsed = if raw.is_empty() {
                Ok(serde_json::json!({}))
            } else {
                serde_json::from_str::<serde_json::Value>(raw)
            };
            match parsed {
                Ok(args) => self.enqueue(Action::ToolCall {
                    call,
                    args,
                    group_id,
                }),
                Err(e) => {
                    tracing::warn!(tool = %call.name, error = %e, "invalid tool arguments");
                    self.enqueue(Action::ToolResponse {
                        response: ToolMessage {
                            tool_call_id: call.id.clone(),
                            tool_name: call.name.clone(),
                            content: format!("tool execution error: invalid arguments: {e}"),
                        },
                        terminal: false,
                        group_id,
                    });
                }
            }
        }
    }

    async fn handle_tool_call(
        &mut self,
        call: ToolCall,
        args: serde_json::Value,
        group_id: u64,
    ) {
        if self.reconciler.group_id() != Some(group_id) {
            tracing::warn!(tool = %call.name, "dropping tool call for a stale group");
            return;
        }
        let Some(tool) = self.find_tool(&call.name) else {
            // Resolution happened at enqueue time; this is unreachable in
            // practice but must not kill the run.
            self.enqueue(Action::ToolResponse {
                response: ToolMessage {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    content: format!("tool not found: {}", call.name),
                },
                terminal: false,
                group_id,
            });
            return;
        };

        self.emit(AgentEvent::Tool {
            meta: self.meta.clone(),
            event_id: Uuid::new_v4().to_string(),
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
        });

        if tool.requires_approval() {
            let approval_id = Uuid::new_v4().to_string();
            self.emit(AgentEvent::Approval {
                meta: self.meta.clone(),
                approval_id: approval_id.clone(),
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                arguments: call.arguments.clone(),
            });
            self.approvals.insert(PendingApproval {
                approval_id,
                call,
                args,
                group_id,
                requested_at: Instant::now(),
            });
            return;
        }

        self.execute_tool(tool, call, args, group_id).await;
    }

    async fn execute_tool(
        &mut self,
        tool: Arc<dyn Tool>,
        call: ToolCall,
        mut args: serde_json::Value,
        group_id: u64,
    ) {
        for interceptor in &self.interceptors {
            if let Err(e) = interceptor.before_tool_call(&call, &mut args).await {
                self.stop(Some(Error::Interceptor {
                    name: interceptor.name().to_string(),
                    message: e.to_string(),
                }));
                return;
            }
        }

        let tool_ctx = ToolCtx::new(
            self.meta.run_id.clone(),
            self.meta.agent_name.clone(),
            call.id.clone(),
            self.session.clone(),
            self.cancel.clone(),
            self.trace.clone(),
            self.options.streaming,
            self.events_tx.clone(),
        );

        let mut result = match tool.execute(args, &tool_ctx).await {
            Ok(result) => result,
            // A tool error value becomes conversation, not a run failure.
            Err(e) => ToolResult::error_text(format!("tool execution error: {e}")),
        };

        for interceptor in &self.interceptors {
            if let Err(e) = interceptor.after_tool_call(&call, &mut result).await {
                self.stop(Some(Error::Interceptor {
                    name: interceptor.name().to_string(),
                    message: e.to_string(),
                }));
                return;
            }
        }

        // Attach produced documents and carry file refs into the turn.
        self.ctx.with_turn(|t| {
            for document in result.documents.drain(..) {
                t.add_document(document, call.id.clone());
            }
            let refs = result.file_refs.drain(..).map(|mut r| {
                r.user_upload = false;
                r
            });
            t.add_file_refs(refs);
        });

        self.enqueue(Action::ToolResponse {
            response: ToolMessage {
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                content: result.rendered(),
            },
            terminal: result.terminal,
            group_id,
        });
    }

    // ── Tool responses ─────────────────────────────────────────────

    fn handle_tool_response(&mut self, response: ToolMessage, terminal: bool, group_id: u64) {
        match self.reconciler.on_response(group_id, response, terminal) {
            ResponseOutcome::Pending => {}
            ResponseOutcome::Complete(closed) => self.close_group(closed),
        }
    }

    /// Apply the group-closing behavior: responses into the turn in call
    /// order, one response event each, unstreamed content, then exactly one
    /// follow-up.
    fn close_group(&mut self, closed: ClosedGroup) {
        for response in &closed.responses {
            let documents = self
                .ctx
                .with_turn(|t| t.documents_for_call(&response.tool_call_id))
                .unwrap_or_default();
            self.ctx
                .with_turn(|t| t.add_message(Message::Tool(response.clone())));
            self.emit(AgentEvent::ToolResponse {
                meta: self.meta.clone(),
                tool_call_id: response.tool_call_id.clone(),
                tool_name: response.tool_name.clone(),
                content: response.content.clone(),
                documents,
            });
        }

        if !closed.assistant.content.is_empty() && !closed.content_streamed {
            self.emit(AgentEvent::Content {
                meta: self.meta.clone(),
                content: closed.assistant.content.clone(),
            });
        }

        if closed.terminal {
            self.seal_turn(closed.assistant);
            self.stop(None);
        } else {
            self.enqueue(Action::LlmCall);
        }
    }

    // ── Approvals ──────────────────────────────────────────────────

    async fn handle_approval(&mut self, approval_id: String, approved: bool) {
        let Some(pending) = self.approvals.resolve(&approval_id) else {
            tracing::warn!(approval_id = %approval_id, "unknown or expired approval");
            return;
        };

        if approved {
            if let Some(tool) = self.find_tool(&pending.call.name) {
                self.execute_tool(tool, pending.call, pending.args, pending.group_id)
                    .await;
                return;
            }
        }

        self.enqueue(Action::ToolResponse {
            response: ToolMessage {
                tool_call_id: pending.call.id.clone(),
                tool_name: pending.call.name.clone(),
                content: format!("approval denied for tool: {}", pending.call.name),
            },
            terminal: false,
            group_id: pending.group_id,
        });
    }

    fn expire_approvals(&mut self) {
        for pending in self.approvals.expired(Instant::now()) {
            tracing::debug!(tool = %pending.call.name, "approval timed out");
            self.enqueue(Action::ToolResponse {
                response: ToolMessage {
                    tool_call_id: pending.call.id.clone(),
                    tool_name: pending.call.name.clone(),
                    content: format!("approval timed out for tool: {}", pending.call.name),
                },
                terminal: false,
                group_id: pending.group_id,
            });
        }
    }
}

fn action_kind(action: &Action) -> &'static str {
    match action {
        Action::LlmCall => "llm_call",
        Action::ToolCall { .. } => "tool_call",
        Action::ToolResponse { .. } => "tool_response",
        Action::Approval { .. } => "approval",
        Action::Stop { .. } => "stop",
    }
}
