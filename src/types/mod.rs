//! Core data model: block definitions, pipeline DAGs, and run state
//! (`SPEC_FULL.md` §3).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which kind of work a block performs in a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockCategory {
    /// Fetches or accepts external data.
    Input,
    /// Transforms data already in hand.
    Process,
    /// Produces an externally-visible side effect.
    Action,
    /// Reads or writes per-user memory.
    Memory,
    /// Scheduling metadata; never executed, only triggers a run.
    Trigger,
    /// Branches or gates based on upstream results.
    Control,
}

/// How a block's `execute` is carried out.
///
/// The legacy `llm` execution type from the reference implementation is
/// folded into `Python` at parse time — see [`ExecutionType::from_legacy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    /// Runs inside the sandbox; `source_code` defines `execute`.
    Python,
    /// A prompt template filled in and sent to the language capability.
    TextGeneration,
}

impl ExecutionType {
    /// Parse an execution type string, transparently treating the legacy
    /// `"llm"` tag as `Python` (it is a python block whose body calls the
    /// language capability — see `SPEC_FULL.md` §3, §4.D searching).
    pub fn from_legacy(s: &str) -> Option<Self> {
        match s {
            "python" | "llm" => Some(Self::Python),
            "text_generation" => Some(Self::TextGeneration),
            _ => None,
        }
    }
}

/// One property of a block's `input_schema`/`output_schema`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaProperty {
    /// Declared semantic type: `integer`, `number`, `boolean`, `string`,
    /// `array`, or `object`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Default value used when the property is optional and unresolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// A JSON-Schema-shaped property map, as used by `input_schema`/`output_schema`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    /// Property name to declaration.
    #[serde(default)]
    pub properties: HashMap<String, SchemaProperty>,
    /// Names of properties that must be present.
    #[serde(default)]
    pub required: Vec<String>,
}

impl Schema {
    /// `true` when every name in `required` has a matching property —
    /// the `SPEC_FULL.md` §3 invariant `input_schema.required ⊆
    /// input_schema.properties`.
    pub fn required_is_subset_of_properties(&self) -> bool {
        self.required.iter().all(|name| self.properties.contains_key(name))
    }
}

/// A sample input/output pair; doubles as a synthesis test case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockExample {
    /// Example inputs.
    pub inputs: Value,
    /// Expected outputs.
    pub outputs: Value,
}

/// Who or what produced a block definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreatedBy {
    /// Seeded at system startup; never overwritten by non-system callers.
    System,
    /// Produced by the planner's wiring stage (references only).
    Planner,
    /// Produced by the block synthesizer.
    Synthesizer,
    /// Uploaded manually.
    User,
}

/// The fundamental unit of work (`SPEC_FULL.md` §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDefinition {
    /// Stable, snake_case, globally unique identifier. Immutable once stored.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// What the block does.
    pub description: String,
    /// Functional category.
    pub category: BlockCategory,
    /// How the block is executed.
    pub execution_type: ExecutionType,
    /// Input property declarations.
    pub input_schema: Schema,
    /// Output property declarations.
    pub output_schema: Schema,
    /// Required for `Python` blocks: a self-contained program exposing
    /// `execute(inputs, context) -> outputs`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_code: Option<String>,
    /// Optional legacy prompt template; placeholders are a subset of
    /// `input_schema` property names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_template: Option<String>,
    /// Guidance on when this block is appropriate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_when: Option<String>,
    /// Semantic discovery tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Sample input/output pairs; also used as synthesis golden tests.
    #[serde(default)]
    pub examples: Vec<BlockExample>,
    /// Fixed-dimension embedding over {description, use_when, tags} — never
    /// over the schemas.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Who produced this definition.
    pub created_by: CreatedBy,
    /// Whether this block requires network access inside the sandbox
    /// (only meaningful for `category == Input`).
    #[serde(default)]
    pub needs_network: bool,
    /// Server-assigned creation timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Server-assigned last-update timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl BlockDefinition {
    /// The canonical search text used for embedding and full-text indexing
    /// (`SPEC_FULL.md` §4.A save algorithm, step 2).
    pub fn search_text(&self) -> String {
        let mut text = self.description.clone();
        if let Some(use_when) = &self.use_when {
            text.push_str(" Use when ");
            text.push_str(use_when);
        }
        if !self.tags.is_empty() {
            text.push_str(" Related to: ");
            text.push_str(&self.tags.join(", "));
        }
        text
    }
}

/// A single node in a [`PipelineJson`] DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineNode {
    /// Sequential id, unique within the pipeline (`n1`, `n2`, ...).
    pub id: String,
    /// Which block this node executes.
    pub block_id: String,
    /// Input values — literals, templates, or nested containers of either.
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
}

/// A directed edge: `to` depends on `from`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineEdge {
    /// Source node id.
    pub from: String,
    /// Target node id.
    pub to: String,
}

/// The serialized form of a pipeline DAG — the planner's output, the
/// executor's sole input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineJson {
    /// Pipeline identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// The original user request.
    pub user_prompt: String,
    /// Ordered list of nodes.
    pub nodes: Vec<PipelineNode>,
    /// DAG edges.
    #[serde(default)]
    pub edges: Vec<PipelineEdge>,
    /// Memory keys this pipeline reads from or writes into.
    #[serde(default)]
    pub memory_keys: Vec<String>,
}

impl PipelineJson {
    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&PipelineNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Ids of nodes that `node_id` directly depends on.
    pub fn predecessors<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a str> {
        self.edges
            .iter()
            .filter(move |e| e.to == node_id)
            .map(|e| e.from.as_str())
    }

    /// `true` when the edges describe an acyclic graph over the node set
    /// (`SPEC_FULL.md` §3 invariant: the graph is acyclic).
    pub fn is_acyclic(&self) -> bool {
        let mut visiting: HashMap<&str, bool> = HashMap::new();
        let mut visited: HashMap<&str, bool> = HashMap::new();

        fn visit<'a>(
            node: &'a str,
            edges: &'a [PipelineEdge],
            visiting: &mut HashMap<&'a str, bool>,
            visited: &mut HashMap<&'a str, bool>,
        ) -> bool {
            if visited.contains_key(node) {
                return true;
            }
            if visiting.contains_key(node) {
                return false;
            }
            visiting.insert(node, true);
            for edge in edges.iter().filter(|e| e.from == node) {
                if !visit(&edge.to, edges, visiting, visited) {
                    return false;
                }
            }
            visiting.remove(node);
            visited.insert(node, true);
            true
        }

        self.nodes
            .iter()
            .all(|n| visit(&n.id, &self.edges, &mut visiting, &mut visited))
    }
}

/// Outcome of running a single node: success carries its output object,
/// failure carries the error kind and a human message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NodeResult {
    /// The node ran and produced an output object.
    Success {
        /// The block's output.
        output: Value,
    },
    /// The node failed; downstream nodes still run and may observe this via
    /// `UpstreamError` in their resolver.
    Failure {
        /// Behavioral error kind.
        kind: String,
        /// Short human-readable message.
        message: String,
    },
}

impl NodeResult {
    /// `true` for [`NodeResult::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// One entry in a run's ordered log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Node or stage this record concerns.
    pub subject: String,
    /// `"success"`, `"failure"`, or a stage name.
    pub status: String,
    /// Error message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

/// Per-execution state, not persisted between nodes except through itself
/// (`SPEC_FULL.md` §3 Run State).
#[derive(Debug, Clone, Default)]
pub struct RunState {
    /// Pipeline identifier being executed.
    pub pipeline_id: String,
    /// Fresh identifier for this particular run.
    pub run_id: String,
    /// Node id to its result; each slot is written exactly once.
    pub results: HashMap<String, NodeResult>,
    /// Opaque per-user facts loaded once at the start of the run.
    pub user: Value,
    /// Mutable key-value snapshot; read at load, written at save, visible
    /// live to subsequent nodes within the run.
    pub memory: HashMap<String, Value>,
    /// Ordered stage/node records.
    pub log: Vec<LogRecord>,
    /// Initial inputs injected into any trigger-category node.
    pub trigger_data: Value,
}

/// Stage of the four-stage planner state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannerStatus {
    /// Initial state before the first language call.
    Start,
    /// Decomposing intent into required blocks.
    Decomposing,
    /// Searching the registry for matches.
    Searching,
    /// Synthesizing missing blocks.
    Creating,
    /// Wiring matched/created blocks into a pipeline.
    Wiring,
    /// Terminal success: `pipeline_json` is populated.
    Done,
    /// Terminal failure.
    Failed,
}

/// Reference to a block expected to already exist in the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistingBlockRef {
    /// Id of an existing block in the registry.
    pub block_id: String,
    /// Why this block is needed for the user's intent.
    pub reason: String,
}

/// Description of a block that needs to be created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBlockSpec {
    /// Proposed id for the new block.
    pub suggested_id: String,
    /// What this block should do.
    pub description: String,
    /// Suggested category; defaults to `process`.
    #[serde(default = "default_process_category")]
    pub category: BlockCategory,
    /// Desired input schema.
    pub input_schema: Schema,
    /// Desired output schema.
    pub output_schema: Schema,
    /// Sample input/output pairs, if the requester has any in mind.
    #[serde(default)]
    pub examples: Vec<BlockExample>,
}

fn default_process_category() -> BlockCategory {
    BlockCategory::Process
}

/// A block the decompose stage believes is needed — either an existing
/// reference or a new specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequiredBlock {
    /// Matches an id the planner expects to already exist.
    Existing(ExistingBlockRef),
    /// Describes a block that must be synthesized if no match is found.
    New(NewBlockSpec),
}

/// Four named fields that advance through the planner's stages
/// (`SPEC_FULL.md` §3 Planner State).
#[derive(Debug, Clone, Default)]
pub struct PlannerState {
    /// Output of the decompose stage.
    pub required_blocks: Vec<RequiredBlock>,
    /// Blocks found in the registry.
    pub matched_blocks: Vec<BlockDefinition>,
    /// Required blocks with no registry match.
    pub missing_blocks: Vec<NewBlockSpec>,
    /// Final Pipeline JSON, once the wire stage succeeds.
    pub pipeline_json: Option<PipelineJson>,
}

/// A synthesis golden-test request (`SPEC_FULL.md` §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisRequest {
    /// Desired input property names.
    pub inputs: Vec<String>,
    /// Desired output property names.
    pub outputs: Vec<String>,
    /// What the block should accomplish.
    pub purpose: String,
    /// Input schema the generated block must satisfy.
    pub input_schema: Schema,
    /// Output schema the generated block must satisfy.
    pub output_schema: Schema,
    /// Golden test input.
    pub test_input: Value,
    /// Golden expected output, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_type_legacy_llm_is_python() {
        assert_eq!(
            ExecutionType::from_legacy("llm"),
            Some(ExecutionType::Python)
        );
        assert_eq!(
            ExecutionType::from_legacy("python"),
            Some(ExecutionType::Python)
        );
        assert_eq!(
            ExecutionType::from_legacy("text_generation"),
            Some(ExecutionType::TextGeneration)
        );
        assert_eq!(ExecutionType::from_legacy("bogus"), None);
    }

    #[test]
    fn test_schema_required_subset_invariant() {
        let mut schema = Schema::default();
        schema.properties.insert(
            "url".to_owned(),
            SchemaProperty {
                kind: "string".to_owned(),
                description: String::new(),
                default: None,
            },
        );
        schema.required = vec!["url".to_owned()];
        assert!(schema.required_is_subset_of_properties());

        schema.required.push("missing".to_owned());
        assert!(!schema.required_is_subset_of_properties());
    }

    #[test]
    fn test_pipeline_acyclic_detection() {
        let pipeline = PipelineJson {
            id: "p1".to_owned(),
            name: "test".to_owned(),
            user_prompt: "test".to_owned(),
            nodes: vec![
                PipelineNode {
                    id: "n1".to_owned(),
                    block_id: "a".to_owned(),
                    inputs: HashMap::new(),
                },
                PipelineNode {
                    id: "n2".to_owned(),
                    block_id: "b".to_owned(),
                    inputs: HashMap::new(),
                },
            ],
            edges: vec![PipelineEdge {
                from: "n1".to_owned(),
                to: "n2".to_owned(),
            }],
            memory_keys: Vec::new(),
        };
        assert!(pipeline.is_acyclic());

        let mut cyclic = pipeline.clone();
        cyclic.edges.push(PipelineEdge {
            from: "n2".to_owned(),
            to: "n1".to_owned(),
        });
        assert!(!cyclic.is_acyclic());
    }

    #[test]
    fn test_search_text_composition() {
        let block = BlockDefinition {
            id: "web_search".to_owned(),
            name: "Web Search".to_owned(),
            description: "Search the web".to_owned(),
            category: BlockCategory::Input,
            execution_type: ExecutionType::Python,
            input_schema: Schema::default(),
            output_schema: Schema::default(),
            source_code: None,
            prompt_template: None,
            use_when: Some("looking up current events".to_owned()),
            tags: vec!["search".to_owned(), "web".to_owned()],
            examples: Vec::new(),
            embedding: None,
            created_by: CreatedBy::System,
            needs_network: true,
            created_at: None,
            updated_at: None,
        };
        let text = block.search_text();
        assert!(text.contains("Search the web"));
        assert!(text.contains("Use when looking up current events"));
        assert!(text.contains("Related to: search, web"));
    }
}
