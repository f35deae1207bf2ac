//! The agent execution engine.
//!
//! An [`Agent`] is a definition: model, tools, sub-agents, instructions.
//! Starting it against a [`RunSession`] spawns an [`AgentRun`] — a single
//! worker task that assembles prompts, calls the model, dispatches tool
//! calls, reconciles streamed output, and loops until the model stops
//! requesting tools. Callers observe a stream of [`AgentEvent`]s.

pub mod approval;
pub mod batch;
pub mod cancel;
pub mod compaction;
pub mod event;
pub mod group;
pub mod interceptor;
pub mod memory_tools;
pub mod model;
pub mod plan;
pub mod run;
pub mod subagent;
pub mod testing;
pub mod tool;
pub mod trace;

pub use cancel::CancelToken;
pub use compaction::{compact_history, CompactionConfig};
pub use event::AgentEvent;
pub use interceptor::Interceptor;
pub use model::{Model, ModelRequest, StreamItem};
pub use run::{Agent, AgentRun, RunOptions, RunSession};
pub use subagent::SubAgentDef;
pub use tool::{FuncTool, Tool, ToolCtx, ToolResult};
