//! The `agent_batch` tool — fan one sub-agent out over a list of items.
//!
//! Items may be `file://<relpath>` (expanded to the files under that path,
//! recursively), `http(s)://` URLs (passed through), or opaque strings.
//! Items run with bounded concurrency; state is persisted to
//! `_private/batch/<id>/result.json` after every item so a watcher can
//! follow progress and a crash loses nothing already finished.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Semaphore;
use uuid::Uuid;

use tiller_domain::{Error, Result, ToolDefinition};
use tiller_workspace::jsonio::write_json_atomic;
use tiller_workspace::paths;

use crate::subagent::{run_sub_agent, SubAgentDef};
use crate::tool::{Tool, ToolCtx, ToolResult};

pub const BATCH_TOOL_NAME: &str = "agent_batch";

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub max_items: usize,
    /// Abort remaining items once this many have failed. 0 = unlimited.
    pub max_failed: usize,
    pub concurrency: usize,
    pub item_timeout: Duration,
    pub total_timeout: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_items: 50,
            max_failed: 0,
            concurrency: 5,
            item_timeout: Duration::from_secs(5 * 60),
            total_timeout: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Running,
    Completed,
    Partial,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItemResult {
    pub item: String,
    pub status: ItemStatus,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchState {
    pub batch_id: String,
    pub sub_agent: String,
    pub description: String,
    pub status: BatchStatus,
    pub items: Vec<BatchItemResult>,
}

/// Fans a named sub-agent out over items with bounded concurrency.
pub struct BatchTool {
    agents: Vec<SubAgentDef>,
    options: BatchOptions,
}

impl BatchTool {
    pub fn new(agents: Vec<SubAgentDef>) -> Self {
        Self {
            agents,
            options: BatchOptions::default(),
        }
    }

    pub fn with_options(mut self, options: BatchOptions) -> Self {
        self.options = options;
        self
    }

    /// Expand one raw item. `file://` paths resolve under the workspace's
    /// model-visible directory; directories expand recursively and must not
    /// be empty.
    fn expand_item(ctx: &ToolCtx, item: &str) -> Result<Vec<String>> {
        let Some(rest) = item.strip_prefix("file://") else {
            return Ok(vec![item.to_string()]);
        };

        let rel = paths::normalize(rest)?;
        let llm = ctx.workspace().llm_dir();
        let abs = llm.join(&rel);
        if abs.is_file() {
            return Ok(vec![format!("file://{rel}")]);
        }
        if abs.is_dir() {
            let mut files = Vec::new();
            for entry in walkdir::WalkDir::new(&abs).follow_links(false) {
                let entry = entry.map_err(|e| Error::Other(format!("walking {rel}: {e}")))?;
                if entry.file_type().is_file() {
                    let rel_path = entry
                        .path()
                        .strip_prefix(&llm)
                        .map_err(|e| Error::Other(format!("path outside llm dir: {e}")))?;
                    files.push(format!(
                        "file://{}",
                        rel_path.to_string_lossy().replace('\\', "/")
                    ));
                }
            }
            files.sort();
            if files.is_empty() {
                return Err(Error::InvalidInput(format!("no files under {rel}")));
            }
            return Ok(files);
        }
        Err(Error::InvalidInput(format!("no such file or folder: {rel}")))
    }
}

#[async_trait]
impl Tool for BatchTool {
    fn definition(&self) -> ToolDefinition {
        let agent_names: Vec<&str> = self.agents.iter().map(|a| a.name.as_str()).collect();
        ToolDefinition::new(
            BATCH_TOOL_NAME,
            "Run a sub-agent over every item of a list in parallel. Items may be \
             file://<path> (expands to the files under it), http(s) URLs, or plain strings.",
            json!({
                "type": "object",
                "properties": {
                    "sub_agent": {
                        "type": "string",
                        "enum": agent_names,
                        "description": "Which sub-agent processes each item."
                    },
                    "description": {
                        "type": "string",
                        "description": "What to do with each item."
                    },
                    "items": {
                        "type": "array",
                        "items": { "type": "string" },
                        "minItems": 1,
                        "description": "The items to fan out over."
                    }
                },
                "required": ["sub_agent", "description", "items"]
            }),
        )
    }

    async fn execute(&self, args: serde_json::Value, ctx: &ToolCtx) -> Result<ToolResult> {
        let sub_agent = args
            .get("sub_agent")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::InvalidInput("missing 'sub_agent'".into()))?;
        let description = args
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let raw_items = args
            .get("items")
            .and_then(|v| v.as_array())
            .ok_or_else(|| Error::InvalidInput("missing 'items' array".into()))?;

        let def = self
            .agents
            .iter()
            .find(|a| a.name == sub_agent)
            .ok_or_else(|| Error::InvalidInput(format!("unknown sub-agent: {sub_agent}")))?;

        let mut items = Vec::new();
        for raw in raw_items {
            let raw = raw
                .as_str()
                .ok_or_else(|| Error::InvalidInput("items must be strings".into()))?;
            items.extend(Self::expand_item(ctx, raw)?);
        }
        if items.is_empty() {
            return Err(Error::InvalidInput("no items to process".into()));
        }
        if items.len() > self.options.max_items {
            return Err(Error::InvalidInput(format!(
                "too many items: {} (max {})",
                items.len(),
                self.options.max_items
            )));
        }

        let batch_id = Uuid::new_v4().to_string();
        let batch_dir = ctx.workspace().private_dir().join("batch").join(&batch_id);
        std::fs::create_dir_all(&batch_dir)?;
        let state_path = batch_dir.join("result.json");

        let state = Mutex::new(BatchState {
            batch_id: batch_id.clone(),
            sub_agent: sub_agent.to_string(),
            description: description.clone(),
            status: BatchStatus::Running,
            items: items
                .iter()
                .map(|item| BatchItemResult {
                    item: item.clone(),
                    status: ItemStatus::Pending,
                    output: String::new(),
                    error: None,
                })
                .collect(),
        });
        write_json_atomic(&state_path, &*state.lock())?;

        let semaphore = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let failed = std::sync::atomic::AtomicUsize::new(0);
        let max_failed = self.options.max_failed;

        let runs = items.iter().enumerate().map(|(index, item)| {
            let semaphore = semaphore.clone();
            let state = &state;
            let state_path = &state_path;
            let failed = &failed;
            let description = &description;
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");

                let outcome = if ctx.cancel.is_cancelled() {
                    Err("cancelled".to_string())
                } else if max_failed > 0
                    && failed.load(std::sync::atomic::Ordering::Acquire) >= max_failed
                {
                    Err("skipped: failure limit reached".to_string())
                } else {
                    let task = format!("{description}\n\nItem: {item}");
                    match tokio::time::timeout(
                        self.options.item_timeout,
                        run_sub_agent(def, ctx, &task),
                    )
                    .await
                    {
                        Ok(Ok(output)) => Ok(output),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(_) => Err("item timed out".to_string()),
                    }
                };

                // Persist after every item so progress survives a crash.
                let mut locked = state.lock();
                match outcome {
                    Ok(output) => {
                        locked.items[index].status = ItemStatus::Completed;
                        locked.items[index].output = output;
                    }
                    Err(message) => {
                        failed.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
                        locked.items[index].status = ItemStatus::Failed;
                        locked.items[index].error = Some(message);
                    }
                }
                if let Err(e) = write_json_atomic(state_path, &*locked) {
                    tracing::warn!(error = %e, "failed to persist batch state");
                }
            }
        });

        let timed_out = tokio::time::timeout(
            self.options.total_timeout,
            futures_util::future::join_all(runs),
        )
        .await
        .is_err();

        let mut locked = state.lock();
        let completed = locked
            .items
            .iter()
            .filter(|i| i.status == ItemStatus::Completed)
            .count();
        locked.status = if completed == locked.items.len() && !timed_out {
            BatchStatus::Completed
        } else if completed > 0 {
            BatchStatus::Partial
        } else {
            BatchStatus::Failed
        };
        write_json_atomic(&state_path, &*locked)?;

        let mut summary = format!(
            "batch {batch_id}: {:?} ({completed}/{} items completed)\n",
            locked.status,
            locked.items.len()
        );
        for item in &locked.items {
            match &item.error {
                Some(error) => summary.push_str(&format!("- {} failed: {error}\n", item.item)),
                None => summary.push_str(&format!("- {} ok\n", item.item)),
            }
        }

        let result = ToolResult::text(summary.trim_end());
        Ok(if locked.status == BatchStatus::Failed {
            ToolResult {
                error: true,
                ..result
            }
        } else {
            result
        })
    }
}
