//! DAG plans — static named plans and model-frozen dynamic plans.
//!
//! A plan is a set of steps with dependencies, validated as a DAG and
//! executed level by level: each round extracts the steps whose
//! dependencies are all done and runs them behind a bounded semaphore.
//! Dependent steps receive their upstream outputs as a `[depID]: <output>`
//! prefix. Per-step results persist to `_private/plan/<id>/plan.json` as
//! they complete.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Semaphore;
use uuid::Uuid;

use tiller_domain::{Error, Result, ToolDefinition};
use tiller_workspace::jsonio::{read_json_or_default, write_json_atomic};

use crate::subagent::{run_sub_agent, SubAgentDef};
use crate::tool::{Tool, ToolCtx, ToolResult};

/// Dynamic plans may not exceed this many tasks.
pub const MAX_PLAN_TASKS: usize = 20;

const DEFAULT_CONCURRENCY: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub description: String,
    pub sub_agent: String,
    #[serde(default)]
    pub deps: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    pub goal: String,
    pub steps: Vec<PlanStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepStatus,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The persisted form: the frozen plan plus whatever results exist so far.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    #[serde(default)]
    pub step_results: BTreeMap<String, StepResult>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation and leveling
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Validate the plan: step count, unique IDs, known non-self dependencies,
/// and acyclicity.
pub fn validate(plan: &Plan) -> Result<()> {
    if plan.steps.is_empty() {
        return Err(Error::InvalidInput("plan has no steps".into()));
    }
    if plan.steps.len() > MAX_PLAN_TASKS {
        return Err(Error::InvalidInput(format!(
            "too many tasks: {} (max {MAX_PLAN_TASKS})",
            plan.steps.len()
        )));
    }

    let mut ids = HashSet::new();
    for step in &plan.steps {
        if !ids.insert(step.id.as_str()) {
            return Err(Error::InvalidInput(format!("duplicate step id: {}", step.id)));
        }
    }
    for step in &plan.steps {
        for dep in &step.deps {
            if dep == &step.id {
                return Err(Error::InvalidInput(format!(
                    "step {} depends on itself",
                    step.id
                )));
            }
            if !ids.contains(dep.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "step {} depends on unknown step {dep}",
                    step.id
                )));
            }
        }
    }

    levels(&plan.steps).map(|_| ())
}

/// Level the DAG by repeated zero-indegree extraction. Steps within one
/// level have no ordering constraints and may run in parallel. Fails on a
/// cycle.
pub fn levels(steps: &[PlanStep]) -> Result<Vec<Vec<String>>> {
    let mut indegree: HashMap<&str, usize> =
        steps.iter().map(|s| (s.id.as_str(), s.deps.len())).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in steps {
        for dep in &step.deps {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(step.id.as_str());
        }
    }

    let mut out = Vec::new();
    let mut remaining = steps.len();
    while remaining > 0 {
        let mut level: Vec<String> = indegree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(id, _)| id.to_string())
            .collect();
        if level.is_empty() {
            return Err(Error::InvalidInput("plan contains a cycle".into()));
        }
        level.sort();
        for id in &level {
            indegree.remove(id.as_str());
            if let Some(next) = dependents.get(id.as_str()) {
                for dependent in next {
                    if let Some(d) = indegree.get_mut(dependent) {
                        *d -= 1;
                    }
                }
            }
        }
        remaining -= level.len();
        out.push(level);
    }
    Ok(out)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Execution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn plan_file(ctx: &ToolCtx, plan_id: &str) -> PathBuf {
    ctx.workspace()
        .private_dir()
        .join("plan")
        .join(plan_id)
        .join("plan.json")
}

fn find_agent<'a>(agents: &'a [SubAgentDef], name: &str) -> Result<&'a SubAgentDef> {
    agents
        .iter()
        .find(|a| a.name == name)
        .ok_or_else(|| Error::InvalidInput(format!("unknown sub-agent: {name}")))
}

/// Execute a validated plan. `inputs` are keyed by root-step ID; dependent
/// steps receive their upstream outputs automatically.
async fn execute(
    plan: &Plan,
    inputs: &HashMap<String, String>,
    agents: &[SubAgentDef],
    ctx: &ToolCtx,
    concurrency: usize,
) -> Result<String> {
    let step_levels = levels(&plan.steps)?;
    let steps_by_id: HashMap<&str, &PlanStep> =
        plan.steps.iter().map(|s| (s.id.as_str(), s)).collect();

    let state_path = plan_file(ctx, &plan.plan_id);
    if let Some(parent) = state_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let state = Mutex::new(PlanState {
        plan: Some(plan.clone()),
        step_results: BTreeMap::new(),
    });
    write_json_atomic(&state_path, &*state.lock())?;

    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut outputs: HashMap<String, String> = HashMap::new();

    for level in step_levels {
        let runs = level.iter().map(|id| {
            let step = steps_by_id[id.as_str()];
            let semaphore = semaphore.clone();
            let state = &state;
            let state_path = &state_path;
            let outputs = &outputs;
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");

                // Cancellation skips every step that has not started.
                let result = if ctx.cancel.is_cancelled() {
                    StepResult {
                        status: StepStatus::Skipped,
                        output: String::new(),
                        error: Some("cancelled".into()),
                    }
                } else {
                    let mut message = String::new();
                    for dep in &step.deps {
                        if let Some(output) = outputs.get(dep) {
                            message.push_str(&format!("[{dep}]: {output}\n"));
                        }
                    }
                    if let Some(input) = inputs.get(&step.id) {
                        message.push_str(input);
                        message.push('\n');
                    }
                    message.push_str(&step.description);

                    match find_agent(agents, &step.sub_agent) {
                        Err(e) => StepResult {
                            status: StepStatus::Failed,
                            output: String::new(),
                            error: Some(e.to_string()),
                        },
                        Ok(def) => match run_sub_agent(def, ctx, &message).await {
                            Ok(output) => StepResult {
                                status: StepStatus::Completed,
                                output,
                                error: None,
                            },
                            Err(e) => StepResult {
                                status: StepStatus::Failed,
                                output: String::new(),
                                error: Some(e.to_string()),
                            },
                        },
                    }
                };

                let mut locked = state.lock();
                locked.step_results.insert(step.id.clone(), result.clone());
                if let Err(e) = write_json_atomic(state_path, &*locked) {
                    tracing::warn!(error = %e, "failed to persist plan state");
                }
                (step.id.clone(), result)
            }
        });

        for (id, result) in futures_util::future::join_all(runs).await {
            if result.status == StepStatus::Completed {
                outputs.insert(id, result.output);
            }
        }
    }

    let locked = state.lock();
    let completed = locked
        .step_results
        .values()
        .filter(|r| r.status == StepStatus::Completed)
        .count();
    let mut summary = format!(
        "plan {}: {completed}/{} steps completed\n",
        plan.plan_id,
        plan.steps.len()
    );
    for (id, result) in &locked.step_results {
        match &result.error {
            Some(error) => summary.push_str(&format!("[{id}] failed: {error}\n")),
            None => summary.push_str(&format!("[{id}] {}\n", result.output)),
        }
    }
    Ok(summary.trim_end().to_string())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A named static plan, exposed to the model as a tool carrying the plan's
/// own name.
pub struct StaticPlanTool {
    name: String,
    description: String,
    steps: Vec<PlanStep>,
    agents: Vec<SubAgentDef>,
    concurrency: usize,
}

impl StaticPlanTool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        steps: Vec<PlanStep>,
        agents: Vec<SubAgentDef>,
    ) -> Result<Self> {
        let name = name.into();
        let plan = Plan {
            plan_id: name.clone(),
            goal: String::new(),
            steps: steps.clone(),
        };
        validate(&plan)?;
        Ok(Self {
            name,
            description: description.into(),
            steps,
            agents,
            concurrency: DEFAULT_CONCURRENCY,
        })
    }
}

#[async_trait]
impl Tool for StaticPlanTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            self.name.clone(),
            self.description.clone(),
            json!({
                "type": "object",
                "properties": {
                    "description": {
                        "type": "string",
                        "description": "Overall goal for this plan execution."
                    },
                    "inputs": {
                        "type": "object",
                        "additionalProperties": { "type": "string" },
                        "description": "Inputs keyed by root-step ID."
                    }
                },
                "required": ["description"]
            }),
        )
    }

    async fn execute(&self, args: serde_json::Value, ctx: &ToolCtx) -> Result<ToolResult> {
        let goal = args
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let inputs = parse_inputs(&args);

        let plan = Plan {
            plan_id: format!("{}_{}", self.name, short_id()),
            goal: goal.to_string(),
            steps: self.steps.clone(),
        };
        let summary = execute(&plan, &inputs, &self.agents, ctx, self.concurrency).await?;
        Ok(ToolResult::text(summary))
    }
}

/// `create_plan` — freeze a model-authored plan after validating it.
pub struct CreatePlanTool;

#[async_trait]
impl Tool for CreatePlanTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "create_plan",
            "Freeze a plan of dependent tasks for later execution. Returns a plan handle.",
            json!({
                "type": "object",
                "properties": {
                    "goal": { "type": "string" },
                    "tasks": {
                        "type": "array",
                        "maxItems": MAX_PLAN_TASKS,
                        "items": {
                            "type": "object",
                            "properties": {
                                "id": { "type": "string" },
                                "description": { "type": "string" },
                                "sub_agent": { "type": "string" },
                                "deps": {
                                    "type": "array",
                                    "items": { "type": "string" }
                                }
                            },
                            "required": ["id", "description", "sub_agent"]
                        }
                    }
                },
                "required": ["goal", "tasks"]
            }),
        )
    }

    async fn execute(&self, args: serde_json::Value, ctx: &ToolCtx) -> Result<ToolResult> {
        let goal = args
            .get("goal")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::InvalidInput("missing 'goal'".into()))?;
        let tasks = args
            .get("tasks")
            .cloned()
            .ok_or_else(|| Error::InvalidInput("missing 'tasks'".into()))?;
        let steps: Vec<PlanStep> = serde_json::from_value(tasks)
            .map_err(|e| Error::InvalidInput(format!("invalid tasks: {e}")))?;

        let plan = Plan {
            plan_id: format!("plan_{}", short_id()),
            goal: goal.to_string(),
            steps,
        };
        validate(&plan)?;

        let path = plan_file(ctx, &plan.plan_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_json_atomic(
            &path,
            &PlanState {
                plan: Some(plan.clone()),
                step_results: BTreeMap::new(),
            },
        )?;

        Ok(ToolResult::text(format!(
            "plan frozen: {} ({} steps). Execute it with execute_plan.",
            plan.plan_id,
            plan.steps.len()
        )))
    }
}

/// `execute_plan` — run a previously frozen plan.
pub struct ExecutePlanTool {
    agents: Vec<SubAgentDef>,
    concurrency: usize,
}

impl ExecutePlanTool {
    pub fn new(agents: Vec<SubAgentDef>) -> Self {
        Self {
            agents,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

#[async_trait]
impl Tool for ExecutePlanTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "execute_plan",
            "Execute a plan previously frozen with create_plan.",
            json!({
                "type": "object",
                "properties": {
                    "plan_id": { "type": "string" },
                    "inputs": {
                        "type": "object",
                        "additionalProperties": { "type": "string" },
                        "description": "Inputs keyed by root-step ID."
                    }
                },
                "required": ["plan_id"]
            }),
        )
    }

    async fn execute(&self, args: serde_json::Value, ctx: &ToolCtx) -> Result<ToolResult> {
        let plan_id = args
            .get("plan_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::InvalidInput("missing 'plan_id'".into()))?;
        if plan_id.contains('/') || plan_id.contains("..") {
            return Err(Error::InvalidInput(format!("invalid plan id: {plan_id}")));
        }

        let state: PlanState = read_json_or_default(&plan_file(ctx, plan_id))?;
        let plan = state
            .plan
            .ok_or_else(|| Error::InvalidInput(format!("no such plan: {plan_id}")))?;
        let inputs = parse_inputs(&args);

        let summary = execute(&plan, &inputs, &self.agents, ctx, self.concurrency).await?;
        Ok(ToolResult::text(summary))
    }
}

fn parse_inputs(args: &serde_json::Value) -> HashMap<String, String> {
    args.get("inputs")
        .and_then(|v| v.as_object())
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}
