//! Executor/Doer (`SPEC_FULL.md` §4.F) — runs a [`PipelineJson`] end to end
//! as a concurrent DAG: a node may run once every predecessor has produced
//! a result (success or failure), ready nodes launch up to a bounded
//! parallelism, and node failures never abort the run — downstream nodes
//! still run and observe the failure through their resolver.
//!
//! "Compile once per run, cache keyed by block id" means writing a given
//! block id's python body to the sandbox's scripts directory exactly once
//! per run; every node sharing that block id reuses the same script,
//! reading its own inputs from a file passed on the command line instead
//! of having them baked in.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::capability::LanguageCapability;
use crate::config::ExecutorConfig;
use crate::planner::{extract_json_block, strip_reasoning_tags};
use crate::registry::{BlockRegistry, RegistryError};
use crate::resolver::{self, ResolutionContext, ResolverError};
use crate::sandbox::{ExecOptions, Executor as Sandbox};
use crate::store::{RunStatus, Store, StoreError};
use crate::types::{
    BlockCategory, BlockDefinition, ExecutionType, LogRecord, NodeResult, PipelineJson, PipelineNode, RunState,
};

/// Errors raised by the DAG scheduler itself, as distinct from a single
/// node's failure (which is captured in its [`NodeResult`] and never aborts
/// the run).
#[derive(Debug, Error)]
pub enum DoerError {
    /// The pipeline's edges describe a cycle; nothing can be scheduled.
    #[error("pipeline '{0}' is not acyclic")]
    CyclicPipeline(String),
    /// Block registry failure while loading a node's block.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// Pipeline/execution storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A node task panicked — not a modeled node failure, an actual bug.
    #[error("node task panicked: {0}")]
    TaskPanicked(String),
}

/// The outcome of a completed run.
#[derive(Debug)]
pub struct RunOutcome {
    /// Freshly generated identifier for this run.
    pub run_id: String,
    /// Final accumulated state: results, log, and memory.
    pub state: RunState,
    /// Aggregate status: `Completed` iff every node succeeded.
    pub status: RunStatus,
}

/// Drives a [`PipelineJson`] to completion over a shared sandbox, language
/// capability, block registry, and execution store.
pub struct Doer {
    registry: Arc<BlockRegistry>,
    sandbox: Arc<dyn Sandbox>,
    capability: Arc<dyn LanguageCapability>,
    store: Arc<Store>,
    config: ExecutorConfig,
    generate_deadline: Duration,
}

impl Doer {
    /// Construct a scheduler over shared components.
    pub fn new(
        registry: Arc<BlockRegistry>,
        sandbox: Arc<dyn Sandbox>,
        capability: Arc<dyn LanguageCapability>,
        store: Arc<Store>,
        config: ExecutorConfig,
        generate_deadline: Duration,
    ) -> Self {
        Self {
            registry,
            sandbox,
            capability,
            store,
            config,
            generate_deadline,
        }
    }

    /// Run `pipeline` for `user_id` to completion.
    ///
    /// Loads the user's memory snapshot before scheduling the first node and
    /// persists it back, annotated with the run's results, once every node
    /// has produced a result. A memory-save failure is logged as a warning
    /// rather than failing the run.
    ///
    /// # Errors
    ///
    /// Returns [`DoerError::CyclicPipeline`] if the pipeline's edges contain
    /// a cycle, or propagates a registry/store failure encountered while
    /// recording the run.
    pub async fn run(
        &self,
        pipeline: &PipelineJson,
        user_id: &str,
        user: Value,
        trigger_data: Value,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, DoerError> {
        if !pipeline.is_acyclic() {
            return Err(DoerError::CyclicPipeline(pipeline.id.clone()));
        }

        let run_id = Uuid::new_v4().to_string();
        self.store.create_run(&run_id, &pipeline.id, user_id).await?;
        info!(run_id = %run_id, pipeline_id = %pipeline.id, "run started");

        let results: Arc<Mutex<HashMap<String, NodeResult>>> = Arc::new(Mutex::new(HashMap::new()));
        let memory: Arc<Mutex<HashMap<String, Value>>> = Arc::new(Mutex::new(self.store.load_memory(user_id).await?));
        let log: Arc<Mutex<Vec<LogRecord>>> = Arc::new(Mutex::new(Vec::new()));
        let compiled: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        let user = Arc::new(user);
        let trigger_data = Arc::new(trigger_data);
        let semaphore = Arc::new(Semaphore::new(self.config.parallelism.max(1)));

        let mut completed: HashSet<String> = HashSet::new();
        let mut scheduled: HashSet<String> = HashSet::new();
        let mut join_set: JoinSet<(String, NodeResult, Duration)> = JoinSet::new();

        loop {
            let ready: Vec<String> = pipeline
                .nodes
                .iter()
                .filter(|n| !scheduled.contains(&n.id))
                .filter(|n| pipeline.predecessors(&n.id).all(|p| completed.contains(p)))
                .map(|n| n.id.clone())
                .collect();

            for node_id in ready {
                scheduled.insert(node_id.clone());

                if cancel.is_cancelled() {
                    record_result(
                        &log,
                        &results,
                        &mut completed,
                        node_id,
                        NodeResult::Failure {
                            kind: "cancelled".to_owned(),
                            message: "run cancelled before node started".to_owned(),
                        },
                        Duration::ZERO,
                    )
                    .await;
                    continue;
                }

                let node = pipeline
                    .node(&node_id)
                    .cloned()
                    .expect("ready node id always resolves within its own pipeline");

                let registry = self.registry.clone();
                let sandbox = self.sandbox.clone();
                let capability = self.capability.clone();
                let results_for_ctx = results.clone();
                let memory_for_ctx = memory.clone();
                let user = user.clone();
                let trigger_data = trigger_data.clone();
                let semaphore = semaphore.clone();
                let compiled = compiled.clone();
                let cancel = cancel.clone();
                let generate_deadline = self.generate_deadline;
                let run_id_for_task = run_id.clone();

                join_set.spawn(async move {
                    let started = Instant::now();

                    let permit = tokio::select! {
                        permit = semaphore.acquire_owned() => permit.expect("semaphore is never closed"),
                        () = cancel.cancelled() => {
                            return (
                                node_id,
                                NodeResult::Failure {
                                    kind: "cancelled".to_owned(),
                                    message: "run cancelled while queued".to_owned(),
                                },
                                started.elapsed(),
                            );
                        }
                    };

                    let result = dispatch_node(
                        &node,
                        registry.as_ref(),
                        sandbox.as_ref(),
                        capability.as_ref(),
                        &results_for_ctx,
                        &memory_for_ctx,
                        &user,
                        &trigger_data,
                        &compiled,
                        &run_id_for_task,
                        generate_deadline,
                        &cancel,
                    )
                    .await;

                    drop(permit);
                    (node_id, result, started.elapsed())
                });
            }

            if join_set.is_empty() {
                break;
            }

            match join_set.join_next().await {
                Some(Ok((node_id, result, duration))) => {
                    record_result(&log, &results, &mut completed, node_id, result, duration).await;
                }
                Some(Err(join_err)) => return Err(DoerError::TaskPanicked(join_err.to_string())),
                None => break,
            }
        }

        let final_results = results.lock().await.clone();
        let final_memory = memory.lock().await.clone();
        let final_log = log.lock().await.clone();

        let any_failed = final_results.values().any(|r| !r.is_success());
        let status = if any_failed { RunStatus::Failed } else { RunStatus::Completed };

        let results_snapshot = results_to_value(&final_results);
        let state = RunState {
            pipeline_id: pipeline.id.clone(),
            run_id: run_id.clone(),
            results: final_results,
            user: (*user).clone(),
            memory: final_memory.clone(),
            log: final_log,
            trigger_data: (*trigger_data).clone(),
        };

        self.store.complete_run(&run_id, &state, status).await?;

        if let Err(err) = self.store.save_memory(user_id, &final_memory, &pipeline.id, &results_snapshot).await {
            warn!(run_id = %run_id, error = %err, "memory save failed; run results still returned");
        }

        info!(run_id = %run_id, status = ?status, "run finished");

        Ok(RunOutcome { run_id, state, status })
    }
}

async fn record_result(
    log: &Arc<Mutex<Vec<LogRecord>>>,
    results: &Arc<Mutex<HashMap<String, NodeResult>>>,
    completed: &mut HashSet<String>,
    node_id: String,
    result: NodeResult,
    duration: Duration,
) {
    let status = if result.is_success() { "success" } else { "failure" };
    let error = match &result {
        NodeResult::Failure { message, .. } => Some(message.clone()),
        NodeResult::Success { .. } => None,
    };
    let duration_ms: u64 = duration.as_millis().try_into().unwrap_or(u64::MAX);

    log.lock().await.push(LogRecord {
        subject: node_id.clone(),
        status: status.to_owned(),
        error,
        duration_ms,
    });
    results.lock().await.insert(node_id.clone(), result);
    completed.insert(node_id);
}

fn results_to_value(results: &HashMap<String, NodeResult>) -> Value {
    let map: serde_json::Map<String, Value> = results
        .iter()
        .map(|(id, result)| {
            let value = match result {
                NodeResult::Success { output } => output.clone(),
                NodeResult::Failure { kind, message } => {
                    serde_json::json!({"error": true, "kind": kind, "message": message})
                }
            };
            (id.clone(), value)
        })
        .collect();
    Value::Object(map)
}

fn memory_to_value(memory: &HashMap<String, Value>) -> Value {
    Value::Object(memory.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_node(
    node: &PipelineNode,
    registry: &BlockRegistry,
    sandbox: &dyn Sandbox,
    capability: &dyn LanguageCapability,
    results: &Arc<Mutex<HashMap<String, NodeResult>>>,
    memory: &Arc<Mutex<HashMap<String, Value>>>,
    user: &Value,
    trigger_data: &Value,
    compiled: &Arc<Mutex<HashSet<String>>>,
    run_id: &str,
    generate_deadline: Duration,
    cancel: &CancellationToken,
) -> NodeResult {
    let block = match registry.get(&node.block_id).await {
        Ok(block) => block,
        Err(err) => {
            return NodeResult::Failure {
                kind: "not_found".to_owned(),
                message: err.to_string(),
            };
        }
    };

    let results_snapshot = results.lock().await.clone();
    let memory_map = memory.lock().await.clone();
    let memory_snapshot = memory_to_value(&memory_map);
    let ctx = ResolutionContext {
        results: &results_snapshot,
        memory: &memory_snapshot,
        user,
    };

    if block.category == BlockCategory::Trigger {
        return execute_trigger(&block, node, &ctx, trigger_data);
    }

    let resolved = match resolver::resolve_inputs(&ctx, &node.inputs, &block.input_schema) {
        Ok(resolved) => resolved,
        Err(err) => return resolver_error_to_node_result(err),
    };

    let result = match block.execution_type {
        ExecutionType::Python => {
            execute_python(&block, &resolved, sandbox, compiled, run_id, user, &memory_snapshot, cancel).await
        }
        ExecutionType::TextGeneration => execute_text_generation(&block, &resolved, capability, generate_deadline, cancel).await,
    };

    if block.category == BlockCategory::Memory {
        if let NodeResult::Success { output: Value::Object(fields) } = &result {
            let mut memory = memory.lock().await;
            for (key, value) in fields {
                memory.insert(key.clone(), value.clone());
            }
        }
    }

    result
}

fn execute_trigger(
    block: &BlockDefinition,
    node: &PipelineNode,
    ctx: &ResolutionContext<'_>,
    trigger_data: &Value,
) -> NodeResult {
    let mut raw_inputs = node.inputs.clone();
    if let Value::Object(fields) = trigger_data {
        for (key, value) in fields {
            raw_inputs.insert(key.clone(), value.clone());
        }
    }

    let resolved = match resolver::resolve_inputs(ctx, &raw_inputs, &block.input_schema) {
        Ok(resolved) => resolved,
        Err(err) => return resolver_error_to_node_result(err),
    };

    let mut output: serde_json::Map<String, Value> = resolved.into_iter().collect();
    output.insert("status".to_owned(), Value::String("triggered".to_owned()));
    NodeResult::Success { output: Value::Object(output) }
}

fn resolver_error_to_node_result(err: ResolverError) -> NodeResult {
    let kind = match &err {
        ResolverError::UpstreamError { .. } => "upstream_error",
        ResolverError::MissingRequired(_) | ResolverError::Coercion { .. } => "validation_error",
    };
    NodeResult::Failure {
        kind: kind.to_owned(),
        message: err.to_string(),
    }
}

#[allow(clippy::too_many_arguments)]
async fn execute_python(
    block: &BlockDefinition,
    resolved_inputs: &HashMap<String, Value>,
    sandbox: &dyn Sandbox,
    compiled: &Arc<Mutex<HashSet<String>>>,
    run_id: &str,
    user: &Value,
    memory: &Value,
    cancel: &CancellationToken,
) -> NodeResult {
    let script_path = match ensure_script_written(sandbox, compiled, block).await {
        Ok(path) => path,
        Err(result) => return result,
    };

    let input_path = sandbox.scripts_dir().join(format!("{run_id}_{}_input.json", block.id));
    let context_path = sandbox.scripts_dir().join(format!("{run_id}_{}_context.json", block.id));
    let context = serde_json::json!({"user": user, "memory": memory});

    if let Err(e) = std::fs::write(&input_path, serde_json::to_vec(resolved_inputs).unwrap_or_default()) {
        return NodeResult::Failure {
            kind: "sandbox_error".to_owned(),
            message: format!("could not write node input file: {e}"),
        };
    }
    if let Err(e) = std::fs::write(&context_path, serde_json::to_vec(&context).unwrap_or_default()) {
        return NodeResult::Failure {
            kind: "sandbox_error".to_owned(),
            message: format!("could not write node context file: {e}"),
        };
    }

    let command = format!(
        "python3 {} {} {}",
        script_path.display(),
        input_path.display(),
        context_path.display()
    );

    let opts = ExecOptions {
        timeout: Duration::from_secs(30),
        network: block.category == BlockCategory::Input && block.needs_network,
        ..Default::default()
    };
    let exec_result = tokio::select! {
        res = sandbox.execute(&command, opts) => res,
        () = cancel.cancelled() => {
            let _ = std::fs::remove_file(&input_path);
            let _ = std::fs::remove_file(&context_path);
            return NodeResult::Failure { kind: "cancelled".to_owned(), message: "run cancelled".to_owned() };
        }
    };

    let _ = std::fs::remove_file(&input_path);
    let _ = std::fs::remove_file(&context_path);

    let result = match exec_result {
        Ok(result) => result,
        Err(err) => {
            return NodeResult::Failure {
                kind: "sandbox_error".to_owned(),
                message: err.to_string(),
            };
        }
    };

    if result.timed_out {
        return NodeResult::Failure {
            kind: "timeout".to_owned(),
            message: "sandbox execution exceeded its timeout".to_owned(),
        };
    }
    if !result.success() {
        return NodeResult::Failure {
            kind: "sandbox_error".to_owned(),
            message: result.output(),
        };
    }

    match serde_json::from_str::<Value>(result.stdout.trim()) {
        Ok(output) => NodeResult::Success { output },
        Err(e) => NodeResult::Failure {
            kind: "validation_error".to_owned(),
            message: format!("block did not return valid JSON: {e}: {}", result.stdout.trim()),
        },
    }
}

async fn ensure_script_written(
    sandbox: &dyn Sandbox,
    compiled: &Arc<Mutex<HashSet<String>>>,
    block: &BlockDefinition,
) -> Result<PathBuf, NodeResult> {
    let script_path = sandbox.scripts_dir().join(format!("{}.py", block.id));
    let mut guard = compiled.lock().await;
    if guard.contains(&block.id) {
        return Ok(script_path);
    }

    let source = block.source_code.as_deref().ok_or_else(|| NodeResult::Failure {
        kind: "validation_error".to_owned(),
        message: format!("block {} has no source_code", block.id),
    })?;

    let harness = render_node_harness(source);
    std::fs::write(&script_path, harness).map_err(|e| NodeResult::Failure {
        kind: "sandbox_error".to_owned(),
        message: format!("could not write block script: {e}"),
    })?;
    guard.insert(block.id.clone());
    Ok(script_path)
}

/// Render a standalone script defining the block's `execute` function and
/// running it against the input/context file pair passed on the command
/// line, printing the JSON result on success or `FAIL: <message>` on
/// stderr with a nonzero exit code on failure.
fn render_node_harness(source: &str) -> String {
    format!(
        r#"import asyncio
import json
import sys

{source}

async def _run():
    with open(sys.argv[1]) as f:
        inputs = json.load(f)
    with open(sys.argv[2]) as f:
        context = json.load(f)
    try:
        result = await execute(inputs, context)
        print(json.dumps(result))
    except Exception as exc:
        print(f"FAIL: {{exc}}", file=sys.stderr)
        sys.exit(1)

asyncio.run(_run())
"#
    )
}

async fn execute_text_generation(
    block: &BlockDefinition,
    resolved_inputs: &HashMap<String, Value>,
    capability: &dyn LanguageCapability,
    deadline: Duration,
    cancel: &CancellationToken,
) -> NodeResult {
    let system = build_text_generation_system_prompt(block);
    let template = block.prompt_template.as_deref().unwrap_or_default();
    let prompt = fill_prompt_template(template, resolved_inputs);

    let raw = tokio::select! {
        res = capability.generate(&system, &prompt, deadline) => res,
        () = cancel.cancelled() => {
            return NodeResult::Failure { kind: "cancelled".to_owned(), message: "run cancelled".to_owned() };
        }
    };

    let raw = match raw {
        Ok(raw) => raw,
        Err(err) => {
            return NodeResult::Failure {
                kind: "capability_error".to_owned(),
                message: err.to_string(),
            };
        }
    };

    let cleaned = strip_reasoning_tags(&raw);
    let json_text = extract_json_block(&cleaned).unwrap_or_else(|| cleaned.trim());

    let value: Value = match serde_json::from_str(json_text) {
        Ok(value) => value,
        Err(e) => {
            return NodeResult::Failure {
                kind: "validation_error".to_owned(),
                message: format!("could not parse JSON from generation response: {e}"),
            };
        }
    };

    if !schema_satisfied(&block.output_schema, &value) {
        return NodeResult::Failure {
            kind: "validation_error".to_owned(),
            message: "generated output is missing required fields".to_owned(),
        };
    }

    NodeResult::Success { output: value }
}

fn build_text_generation_system_prompt(block: &BlockDefinition) -> String {
    let required = if block.output_schema.required.is_empty() {
        block.output_schema.properties.keys().cloned().collect::<Vec<_>>().join(", ")
    } else {
        block.output_schema.required.join(", ")
    };

    format!(
        "You are the block '{}'. {}\n\nRespond with a single JSON object and nothing else, containing these required fields: {required}.",
        block.name, block.description,
    )
}

fn fill_prompt_template(template: &str, inputs: &HashMap<String, Value>) -> String {
    let mut rendered = template.to_owned();
    for (key, value) in inputs {
        let placeholder = format!("{{{{{key}}}}}");
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        rendered = rendered.replace(&placeholder, &text);
    }
    rendered
}

fn schema_satisfied(schema: &crate::types::Schema, value: &Value) -> bool {
    match value.as_object() {
        Some(obj) => schema.required.iter().all(|name| obj.contains_key(name)),
        None => schema.required.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::MockCapability;
    use crate::config::RegistryConfig;
    use crate::sandbox::{ExecResult, ExecutorError, ExecutorKind, HealthStatus};
    use crate::types::{CreatedBy, PipelineEdge, Schema, SchemaProperty};
    use async_trait::async_trait;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::path::Path;

    struct FakeSandbox {
        scripts_dir: tempfile::TempDir,
        workspace_dir: tempfile::TempDir,
        fail_commands_containing: Option<String>,
    }

    impl FakeSandbox {
        fn new() -> Self {
            Self {
                scripts_dir: tempfile::TempDir::new().expect("tempdir"),
                workspace_dir: tempfile::TempDir::new().expect("tempdir"),
                fail_commands_containing: None,
            }
        }

        fn failing(marker: &str) -> Self {
            Self {
                fail_commands_containing: Some(marker.to_owned()),
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl Sandbox for FakeSandbox {
        async fn execute(&self, command: &str, _opts: ExecOptions) -> Result<ExecResult, ExecutorError> {
            if let Some(marker) = &self.fail_commands_containing {
                if command.contains(marker.as_str()) {
                    return Ok(ExecResult {
                        exit_code: Some(1),
                        stdout: String::new(),
                        stderr: "FAIL: nope".to_owned(),
                        timed_out: false,
                        duration: Duration::from_millis(1),
                    });
                }
            }

            let parts: Vec<&str> = command.split_whitespace().collect();
            let input_path = parts.get(2).expect("input path argument present");
            let inputs: Value = serde_json::from_str(&std::fs::read_to_string(input_path).expect("read input"))
                .expect("parse input json");
            Ok(ExecResult {
                exit_code: Some(0),
                stdout: serde_json::json!({"echoed": inputs}).to_string(),
                stderr: String::new(),
                timed_out: false,
                duration: Duration::from_millis(1),
            })
        }

        async fn health_check(&self) -> Result<HealthStatus, ExecutorError> {
            Ok(HealthStatus::Healthy { kind: ExecutorKind::Direct, details: "fake".to_owned() })
        }

        fn has_network_isolation(&self) -> bool {
            false
        }

        fn scripts_dir(&self) -> &Path {
            self.scripts_dir.path()
        }

        fn workspace_dir(&self) -> &Path {
            self.workspace_dir.path()
        }

        fn kind(&self) -> ExecutorKind {
            ExecutorKind::Direct
        }
    }

    async fn test_registry() -> Arc<BlockRegistry> {
        let pool = SqlitePoolOptions::new().max_connections(1).connect("sqlite::memory:").await.expect("pool");
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS blocks (
                id TEXT PRIMARY KEY, name TEXT NOT NULL, description TEXT NOT NULL,
                category TEXT NOT NULL, execution_type TEXT NOT NULL, input_schema TEXT NOT NULL,
                output_schema TEXT NOT NULL, source_code TEXT, prompt_template TEXT, use_when TEXT,
                tags TEXT NOT NULL DEFAULT '[]', examples TEXT NOT NULL DEFAULT '[]', embedding TEXT,
                created_by TEXT NOT NULL, needs_network INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now')), updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
        )
        .execute(&pool)
        .await
        .expect("create table");
        sqlx::query(
            "CREATE VIRTUAL TABLE IF NOT EXISTS blocks_fts USING fts5(id UNINDEXED, name, description, use_when, tags)",
        )
        .execute(&pool)
        .await
        .expect("create fts table");
        Arc::new(BlockRegistry::from_pool(pool, RegistryConfig::default(), None, None))
    }

    async fn test_store() -> Arc<Store> {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let db_path = dir.path().join("store.db");
        let store = Store::open(&db_path).await.expect("open store");
        // Leak the tempdir so the sqlite file outlives the store for the test's duration.
        std::mem::forget(dir);
        Arc::new(store)
    }

    fn python_block(id: &str) -> BlockDefinition {
        BlockDefinition {
            id: id.to_owned(),
            name: id.to_owned(),
            description: "echoes its inputs".to_owned(),
            category: BlockCategory::Process,
            execution_type: ExecutionType::Python,
            input_schema: Schema::default(),
            output_schema: Schema::default(),
            source_code: Some("async def execute(inputs, context):\n    return inputs".to_owned()),
            prompt_template: None,
            use_when: None,
            tags: Vec::new(),
            examples: Vec::new(),
            embedding: None,
            created_by: CreatedBy::System,
            needs_network: false,
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn test_fill_prompt_template_substitutes_inputs() {
        let mut inputs = HashMap::new();
        inputs.insert("topic".to_owned(), Value::String("rust".to_owned()));
        let rendered = fill_prompt_template("Write about {{topic}}.", &inputs);
        assert_eq!(rendered, "Write about rust.");
    }

    #[test]
    fn test_schema_satisfied_checks_required_fields() {
        let mut schema = Schema::default();
        schema.required.push("summary".to_owned());
        schema.properties.insert(
            "summary".to_owned(),
            SchemaProperty { kind: "string".to_owned(), description: String::new(), default: None },
        );
        assert!(schema_satisfied(&schema, &serde_json::json!({"summary": "ok"})));
        assert!(!schema_satisfied(&schema, &serde_json::json!({"other": "ok"})));
    }

    #[test]
    fn test_resolver_error_to_node_result_maps_upstream_kind() {
        let err = ResolverError::UpstreamError { node: "n1".to_owned(), message: "boom".to_owned() };
        let result = resolver_error_to_node_result(err);
        assert!(matches!(result, NodeResult::Failure { kind, .. } if kind == "upstream_error"));
    }

    #[tokio::test]
    async fn test_run_executes_independent_python_nodes_concurrently() {
        let registry = test_registry().await;
        registry.save(python_block("echo_a")).await.expect("save block a");
        registry.save(python_block("echo_b")).await.expect("save block b");

        let sandbox: Arc<dyn Sandbox> = Arc::new(FakeSandbox::new());
        let capability: Arc<dyn LanguageCapability> = Arc::new(MockCapability::new(vec![]));
        let store = test_store().await;

        let pipeline = PipelineJson {
            id: "p1".to_owned(),
            name: "demo".to_owned(),
            user_prompt: "demo".to_owned(),
            nodes: vec![
                PipelineNode { id: "n1".to_owned(), block_id: "echo_a".to_owned(), inputs: HashMap::new() },
                PipelineNode { id: "n2".to_owned(), block_id: "echo_b".to_owned(), inputs: HashMap::new() },
            ],
            edges: Vec::new(),
            memory_keys: Vec::new(),
        };

        let doer = Doer::new(
            registry,
            sandbox,
            capability,
            store,
            ExecutorConfig { parallelism: 4 },
            Duration::from_secs(60),
        );

        let outcome = doer
            .run(&pipeline, "alice", serde_json::json!({}), serde_json::json!({}), CancellationToken::new())
            .await
            .expect("run succeeds");

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.state.results.len(), 2);
        assert!(outcome.state.results.values().all(NodeResult::is_success));
    }

    #[tokio::test]
    async fn test_run_marks_downstream_node_ran_despite_upstream_failure() {
        let registry = test_registry().await;
        registry.save(python_block("will_fail")).await.expect("save failing block");
        registry.save(python_block("echo_b")).await.expect("save block b");

        let sandbox: Arc<dyn Sandbox> = Arc::new(FakeSandbox::failing("will_fail"));
        let capability: Arc<dyn LanguageCapability> = Arc::new(MockCapability::new(vec![]));
        let store = test_store().await;

        let pipeline = PipelineJson {
            id: "p1".to_owned(),
            name: "demo".to_owned(),
            user_prompt: "demo".to_owned(),
            nodes: vec![
                PipelineNode { id: "n1".to_owned(), block_id: "will_fail".to_owned(), inputs: HashMap::new() },
                PipelineNode { id: "n2".to_owned(), block_id: "echo_b".to_owned(), inputs: HashMap::new() },
            ],
            edges: vec![PipelineEdge { from: "n1".to_owned(), to: "n2".to_owned() }],
            memory_keys: Vec::new(),
        };

        let doer = Doer::new(
            registry,
            sandbox,
            capability,
            store,
            ExecutorConfig { parallelism: 4 },
            Duration::from_secs(60),
        );

        let outcome = doer
            .run(&pipeline, "alice", serde_json::json!({}), serde_json::json!({}), CancellationToken::new())
            .await
            .expect("run completes despite node failure");

        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(!outcome.state.results.get("n1").expect("n1 ran").is_success());
        assert!(outcome.state.results.get("n2").expect("n2 still ran").is_success());
    }

    #[tokio::test]
    async fn test_run_rejects_cyclic_pipeline() {
        let registry = test_registry().await;
        let sandbox: Arc<dyn Sandbox> = Arc::new(FakeSandbox::new());
        let capability: Arc<dyn LanguageCapability> = Arc::new(MockCapability::new(vec![]));
        let store = test_store().await;

        let pipeline = PipelineJson {
            id: "p1".to_owned(),
            name: "demo".to_owned(),
            user_prompt: "demo".to_owned(),
            nodes: vec![
                PipelineNode { id: "n1".to_owned(), block_id: "echo_a".to_owned(), inputs: HashMap::new() },
                PipelineNode { id: "n2".to_owned(), block_id: "echo_b".to_owned(), inputs: HashMap::new() },
            ],
            edges: vec![
                PipelineEdge { from: "n1".to_owned(), to: "n2".to_owned() },
                PipelineEdge { from: "n2".to_owned(), to: "n1".to_owned() },
            ],
            memory_keys: Vec::new(),
        };

        let doer = Doer::new(
            registry,
            sandbox,
            capability,
            store,
            ExecutorConfig { parallelism: 4 },
            Duration::from_secs(60),
        );

        let err = doer
            .run(&pipeline, "alice", serde_json::json!({}), serde_json::json!({}), CancellationToken::new())
            .await
            .expect_err("cyclic pipeline must be rejected");
        assert!(matches!(err, DoerError::CyclicPipeline(_)));
    }
}
