//! Block Synthesizer (`SPEC_FULL.md` §4.C) — generates a Python block body
//! from a natural-language description, then drives a
//! generate → execute → validate → repair loop in the sandbox until the
//! block passes its own golden test or the iteration budget is exhausted.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::capability::{CapabilityError, LanguageCapability};
use crate::config::SynthesizerConfig;
use crate::planner::{extract_json_block, strip_reasoning_tags};
use crate::sandbox::{ExecOptions, Executor, ExecutorError};
use crate::types::{
    BlockCategory, BlockDefinition, CreatedBy, ExecutionType, NewBlockSpec, RequiredBlock, Schema,
};

/// Errors raised while synthesizing a block.
#[derive(Debug, Error)]
pub enum SynthesizerError {
    /// The model's response had no parseable JSON block definition.
    #[error("could not extract a block definition from model response: {0}")]
    UnparseableResponse(String),
    /// Synthesis did not converge within the configured iteration budget.
    #[error("synthesis did not converge after {iterations} iterations: {last_error}")]
    MaxIterations {
        /// Iterations actually attempted.
        iterations: u32,
        /// The most recent validation failure.
        last_error: String,
    },
    /// The language capability call failed.
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    /// The sandbox could not run the candidate block.
    #[error(transparent)]
    Sandbox(#[from] ExecutorError),
}

/// Result of a synthesis attempt.
pub enum SynthesisOutcome {
    /// A validated block definition, ready to save to the registry.
    Created(BlockDefinition),
    /// The synthesizer exhausted its iteration budget.
    GaveUp {
        /// Why synthesis could not converge.
        reason: String,
    },
}

#[derive(Debug, Deserialize)]
struct GeneratedBlock {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    input_schema: Option<Schema>,
    #[serde(default)]
    output_schema: Option<Schema>,
    #[serde(default)]
    source_code: Option<String>,
    /// Accepted alongside `source_code` for models that follow the legacy
    /// field name from the reference implementation's block format.
    #[serde(default)]
    python_source: Option<String>,
}

/// Drives the code-generation/repair loop for a single missing block.
pub struct Synthesizer {
    capability: Arc<dyn LanguageCapability>,
    executor: Arc<dyn Executor>,
    config: SynthesizerConfig,
}

impl Synthesizer {
    /// Construct a synthesizer over a shared capability and sandbox.
    pub fn new(
        capability: Arc<dyn LanguageCapability>,
        executor: Arc<dyn Executor>,
        config: SynthesizerConfig,
    ) -> Self {
        Self {
            capability,
            executor,
            config,
        }
    }

    /// Synthesize a block satisfying `required`.
    ///
    /// # Errors
    ///
    /// Returns a [`SynthesizerError`] if the language capability or sandbox
    /// fails outright (as distinct from the candidate block merely failing
    /// its own test, which instead produces `Ok(SynthesisOutcome::GaveUp)`
    /// once the iteration budget is spent).
    pub async fn synthesize(
        &self,
        required: &RequiredBlock,
    ) -> Result<SynthesisOutcome, SynthesizerError> {
        let spec = match required {
            RequiredBlock::Existing(existing) => NewBlockSpec {
                suggested_id: existing.block_id.clone(),
                description: existing.reason.clone(),
                category: BlockCategory::Process,
                input_schema: Schema::default(),
                output_schema: Schema::default(),
                examples: Vec::new(),
            },
            RequiredBlock::New(spec) => spec.clone(),
        };

        if self.config.max_iterations == 0 {
            return Ok(SynthesisOutcome::GaveUp {
                reason: "synthesizer configured with zero iterations".to_owned(),
            });
        }

        let mut last_error = String::new();
        let mut repair_context: Option<(String, String)> = None;

        for iteration in 1..=self.config.max_iterations {
            let (system, user) = match &repair_context {
                None => build_create_block_prompt(&spec),
                Some((prior_source, error)) => build_repair_prompt(&spec, prior_source, error),
            };

            let deadline = Duration::from_secs(self.config.deadline_secs);
            let raw = self.capability.generate(&system, &user, deadline).await?;
            let cleaned = strip_reasoning_tags(&raw);
            let json_text = extract_json_block(&cleaned).unwrap_or(cleaned.trim());

            let generated: GeneratedBlock = match serde_json::from_str(json_text) {
                Ok(g) => g,
                Err(e) => {
                    last_error = format!("model response was not valid JSON: {e}");
                    repair_context = Some((String::new(), last_error.clone()));
                    continue;
                }
            };

            let block = match finalize_generated_block(generated, &spec) {
                Ok(b) => b,
                Err(e) => {
                    last_error = e;
                    repair_context = Some((String::new(), last_error.clone()));
                    continue;
                }
            };

            let source = block.source_code.clone().unwrap_or_default();
            match self.validate(&block).await {
                Ok(()) => return Ok(SynthesisOutcome::Created(block)),
                Err(e) => {
                    tracing::warn!(
                        iteration,
                        block_id = %block.id,
                        error = %e,
                        "synthesized block failed validation, retrying"
                    );
                    last_error = e;
                    repair_context = Some((source, last_error.clone()));
                }
            }
        }

        Err(SynthesizerError::MaxIterations {
            iterations: self.config.max_iterations,
            last_error,
        })
    }

    /// Validate a candidate block by running its golden test (from
    /// `examples[0]` when present, else schema-derived stub inputs) inside
    /// the sandbox.
    async fn validate(&self, block: &BlockDefinition) -> Result<(), String> {
        let source = block
            .source_code
            .as_deref()
            .ok_or_else(|| "block has no source_code".to_owned())?;

        let test_inputs = block
            .examples
            .first()
            .and_then(|e| e.inputs.as_object().cloned())
            .map(Value::Object)
            .unwrap_or_else(|| generate_test_inputs(&block.input_schema));

        let script = render_test_harness(source, &test_inputs);
        let script_path = self
            .executor
            .scripts_dir()
            .join(format!("{}_test.py", block.id));
        std::fs::write(&script_path, &script).map_err(|e| e.to_string())?;

        let result = self
            .executor
            .execute(
                &format!("python3 {}", script_path.display()),
                ExecOptions {
                    timeout: Duration::from_secs(30),
                    network: block.category == BlockCategory::Input && block.needs_network,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| e.to_string())?;

        let _ = std::fs::remove_file(&script_path);

        if !result.success() {
            return Err(result.output());
        }

        let output: Value = serde_json::from_str(result.stdout.trim())
            .map_err(|e| format!("block did not print a JSON result: {e}: {}", result.stdout.trim()))?;

        for field in &block.output_schema.required {
            if output.get(field).is_none() {
                return Err(format!("output is missing required field `{field}`"));
            }
        }

        if let Some(expected) = block.examples.first().map(|e| &e.outputs) {
            if !values_match(expected, &output) {
                return Err(format!(
                    "block output did not match its example: expected {expected}, got {output}"
                ));
            }
        }

        Ok(())
    }
}

fn finalize_generated_block(
    generated: GeneratedBlock,
    spec: &NewBlockSpec,
) -> Result<BlockDefinition, String> {
    let id = generated.id.unwrap_or_else(|| spec.suggested_id.clone());
    let source_code = generated
        .source_code
        .or(generated.python_source)
        .ok_or_else(|| format!("block {id} has no source_code — all blocks must be python"))?;

    Ok(BlockDefinition {
        id: id.clone(),
        name: generated.name.unwrap_or_else(|| id.replace('_', " ")),
        description: generated.description.unwrap_or_else(|| spec.description.clone()),
        category: spec.category,
        execution_type: ExecutionType::Python,
        input_schema: generated.input_schema.unwrap_or_else(|| spec.input_schema.clone()),
        output_schema: generated.output_schema.unwrap_or_else(|| spec.output_schema.clone()),
        source_code: Some(source_code),
        prompt_template: None,
        use_when: Some(spec.description.clone()),
        tags: Vec::new(),
        examples: spec.examples.clone(),
        embedding: None,
        created_by: CreatedBy::Synthesizer,
        needs_network: false,
        created_at: Some(Utc::now()),
        updated_at: Some(Utc::now()),
    })
}

/// Generate minimal valid inputs from a JSON-Schema-shaped property map.
fn generate_test_inputs(schema: &Schema) -> Value {
    let names: Vec<&String> = if schema.required.is_empty() {
        schema.properties.keys().collect()
    } else {
        schema.required.iter().collect()
    };

    let mut map = serde_json::Map::with_capacity(names.len());
    for name in names {
        let value = match schema.properties.get(name).map(|p| p.kind.as_str()) {
            Some("number") => Value::from(0.0),
            Some("integer") => Value::from(0),
            Some("boolean") => Value::from(true),
            Some("array") => Value::Array(Vec::new()),
            Some("object") => Value::Object(serde_json::Map::new()),
            _ => Value::from("test"),
        };
        map.insert(name.clone(), value);
    }
    Value::Object(map)
}

/// Render a standalone script that defines the block's `execute` function,
/// runs it against `test_inputs`, and prints the JSON result on success —
/// the caller compares it against `output_schema`/the example's expected
/// outputs — or `FAIL: <message>` on stderr with a nonzero exit code.
fn render_test_harness(source: &str, test_inputs: &Value) -> String {
    let inputs_json = serde_json::to_string(test_inputs).unwrap_or_else(|_| "{}".to_owned());
    format!(
        r#"import asyncio
import json
import sys

{source}

async def _run():
    inputs = json.loads({inputs_json:?})
    context = {{"user": {{}}, "memory": {{}}, "user_id": "test"}}
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

/// Deep-equal comparison tolerant of floating-point drift, used to compare
/// a synthesized block's test output against its own example pair
/// (`SPEC_FULL.md` §4.C step 6, §8 "a block that returns `SynthesisResult.ok`
/// MUST satisfy its own example pair").
fn values_match(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Number(e), Value::Number(a)) => match (e.as_f64(), a.as_f64()) {
            (Some(e), Some(a)) => (e - a).abs() <= 1e-6 * e.abs().max(1.0),
            _ => e == a,
        },
        (Value::Array(e), Value::Array(a)) => {
            e.len() == a.len() && e.iter().zip(a).all(|(e, a)| values_match(e, a))
        }
        (Value::Object(e), Value::Object(a)) => {
            e.len() == a.len() && e.iter().all(|(key, v)| a.get(key).is_some_and(|av| values_match(v, av)))
        }
        _ => expected == actual,
    }
}

/// Build the system/user prompt pair asking the capability to generate a
/// Python block for `spec`.
fn build_create_block_prompt(spec: &NewBlockSpec) -> (String, String) {
    let system = "You are a specialist Python code generator for pipeline blocks. \
        Your sole job is to write a complete, working block as a JSON object. \
        A block is a self-contained Python module exposing \
        `async def execute(inputs: dict, context: dict) -> dict`. `context` \
        carries `user`, `memory`, and `user_id`. The function's return value \
        must match the declared output_schema. Use only the standard library \
        plus `httpx` for HTTP and `json`/`re`/`math`/`statistics`/`datetime`/ \
        `collections`/`itertools`/`functools`/`random` for data handling. Do \
        not import `time`, `requests`, `urllib`, `subprocess`, `sys`, \
        `pathlib`, `socket`, `numpy`, or `pandas`. Respond with a JSON \
        object: {\"id\": \"...\", \"name\": \"...\", \"description\": \"...\", \
        \"input_schema\": {...}, \"output_schema\": {...}, \"source_code\": \
        \"...\"}. Return ONLY the JSON object, no explanation outside the code fence."
        .to_owned();

    let user = format!(
        "Suggested id: {}\nDescription: {}\nInput schema: {}\nOutput schema: {}",
        spec.suggested_id,
        spec.description,
        serde_json::to_string(&spec.input_schema).unwrap_or_default(),
        serde_json::to_string(&spec.output_schema).unwrap_or_default(),
    );

    (system, user)
}

/// Build a repair prompt including the prior source and the failure it
/// produced, asking the capability to fix it.
fn build_repair_prompt(spec: &NewBlockSpec, prior_source: &str, error: &str) -> (String, String) {
    let (system, _) = build_create_block_prompt(spec);
    let user = format!(
        "The following block implementation for \"{}\" failed validation.\n\n\
        Previous source_code:\n{prior_source}\n\n\
        Failure:\n{error}\n\n\
        Fix the implementation and return the full corrected JSON object.",
        spec.description,
    );
    (system, user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SchemaProperty;

    #[test]
    fn test_generate_test_inputs_covers_required_properties() {
        let mut schema = Schema::default();
        schema.required.push("count".to_owned());
        schema.properties.insert(
            "count".to_owned(),
            SchemaProperty {
                kind: "integer".to_owned(),
                description: String::new(),
                default: None,
            },
        );
        let inputs = generate_test_inputs(&schema);
        assert_eq!(inputs.get("count"), Some(&Value::from(0)));
    }

    #[test]
    fn test_finalize_generated_block_requires_source_code() {
        let spec = NewBlockSpec {
            suggested_id: "fetch_weather".to_owned(),
            description: "fetch current weather".to_owned(),
            category: BlockCategory::Process,
            input_schema: Schema::default(),
            output_schema: Schema::default(),
            examples: Vec::new(),
        };
        let generated = GeneratedBlock {
            id: None,
            name: None,
            description: None,
            input_schema: None,
            output_schema: None,
            source_code: None,
            python_source: None,
        };
        let result = finalize_generated_block(generated, &spec);
        assert!(result.is_err());
    }

    #[test]
    fn test_finalize_generated_block_folds_legacy_python_source_field() {
        let spec = NewBlockSpec {
            suggested_id: "fetch_weather".to_owned(),
            description: "fetch current weather".to_owned(),
            category: BlockCategory::Process,
            input_schema: Schema::default(),
            output_schema: Schema::default(),
            examples: Vec::new(),
        };
        let generated = GeneratedBlock {
            id: Some("fetch_weather".to_owned()),
            name: None,
            description: None,
            input_schema: None,
            output_schema: None,
            source_code: None,
            python_source: Some("async def execute(inputs, context):\n    return {}".to_owned()),
        };
        let block = finalize_generated_block(generated, &spec).expect("finalizes");
        assert_eq!(block.created_by, CreatedBy::Synthesizer);
        assert!(block.source_code.unwrap().contains("async def execute"));
    }

    #[test]
    fn test_render_test_harness_embeds_source_and_inputs() {
        let inputs = serde_json::json!({"q": "test"});
        let script = render_test_harness(
            "async def execute(inputs, context):\n    return {}",
            &inputs,
        );
        assert!(script.contains("async def execute"));
        assert!(script.contains("asyncio.run"));
        assert!(script.contains("print(json.dumps(result))"));
    }

    #[test]
    fn test_values_match_tolerates_float_drift() {
        let expected = serde_json::json!({"temp": 21.0, "unit": "c"});
        let actual = serde_json::json!({"temp": 21.0000001, "unit": "c"});
        assert!(values_match(&expected, &actual));
    }

    #[test]
    fn test_values_match_rejects_missing_field() {
        let expected = serde_json::json!({"temp": 21.0, "unit": "c"});
        let actual = serde_json::json!({"temp": 21.0});
        assert!(!values_match(&expected, &actual));
    }
}
