//! Planner (`SPEC_FULL.md` §4.D) — turns a natural-language intent into a
//! Pipeline JSON by driving a four-stage text-generation cycle against the
//! [`crate::capability::LanguageCapability`] and the [`crate::registry`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use crate::capability::{CapabilityError, LanguageCapability};
use crate::registry::{BlockRegistry, RegistryError};
use crate::synthesizer::{SynthesisOutcome, Synthesizer, SynthesizerError};
use crate::types::{PipelineJson, PlannerStatus, RequiredBlock};

/// Errors raised while planning a pipeline.
#[derive(Debug, Error)]
pub enum PlannerError {
    /// The language capability returned no parseable JSON.
    #[error("could not extract JSON from model response: {0}")]
    UnparseableResponse(String),
    /// The produced pipeline failed structural validation (e.g. a cycle).
    #[error("pipeline validation failed: {0}")]
    InvalidPipeline(String),
    /// A required block could not be found or synthesized.
    #[error("could not satisfy required block '{0}'")]
    UnsatisfiedBlock(String),
    /// The language capability call failed.
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    /// The block registry failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// Block synthesis failed while filling a gap.
    #[error(transparent)]
    Synthesis(#[from] SynthesizerError),
}

/// A single decomposed step the decompose stage proposes.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DecomposedStep {
    /// Short description of what this step does.
    pub description: String,
    /// Suggested block id if one already exists in the registry.
    #[serde(default)]
    pub suggested_block_id: Option<String>,
    /// Required input field names this step consumes.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Output field names this step produces.
    #[serde(default)]
    pub outputs: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DecomposeResponse {
    steps: Vec<DecomposedStep>,
}

/// An event emitted as planning progresses, for streaming to a client.
#[derive(Debug, Clone, Serialize)]
pub struct PlannerEvent {
    /// The stage the planner is currently in.
    pub status: PlannerStatus,
    /// Human-readable progress message.
    pub message: String,
}

/// Drives the decompose → search → (create|wire) → done state machine.
pub struct Planner {
    capability: Arc<dyn LanguageCapability>,
    registry: Arc<BlockRegistry>,
    synthesizer: Synthesizer,
}

impl Planner {
    /// Construct a planner over a shared capability, registry, and
    /// synthesizer.
    pub fn new(
        capability: Arc<dyn LanguageCapability>,
        registry: Arc<BlockRegistry>,
        synthesizer: Synthesizer,
    ) -> Self {
        Self {
            capability,
            registry,
            synthesizer,
        }
    }

    /// Plan a pipeline for `intent`, emitting progress events on `events`.
    ///
    /// # Errors
    ///
    /// Returns a [`PlannerError`] if decomposition, search, synthesis, or
    /// wiring fails, or if the final pipeline is not acyclic.
    pub async fn plan(
        &self,
        intent: &str,
        events: &UnboundedSender<PlannerEvent>,
    ) -> Result<PipelineJson, PlannerError> {
        emit(events, PlannerStatus::Decomposing, "decomposing intent into steps");
        let steps = self.decompose(intent).await?;

        emit(events, PlannerStatus::Searching, "searching registry for matching blocks");
        let mut resolved_block_ids = Vec::with_capacity(steps.len());
        for step in &steps {
            match self.find_or_synthesize(step, events).await {
                Ok(block_id) => resolved_block_ids.push(block_id),
                Err(err) => {
                    emit(events, PlannerStatus::Failed, &err.to_string());
                    return Err(err);
                }
            }
        }

        emit(events, PlannerStatus::Wiring, "wiring resolved blocks into a pipeline");
        let pipeline = self.wire(intent, &resolved_block_ids).await?;

        if !pipeline.is_acyclic() {
            let message = "pipeline contains a cycle".to_owned();
            emit(events, PlannerStatus::Failed, &message);
            return Err(PlannerError::InvalidPipeline(message));
        }

        emit(events, PlannerStatus::Done, "pipeline ready");
        Ok(pipeline)
    }

    async fn decompose(&self, intent: &str) -> Result<Vec<DecomposedStep>, PlannerError> {
        let (system, user) = build_decompose_prompts(intent);
        let raw = self
            .capability
            .generate(&system, &user, std::time::Duration::from_secs(60))
            .await?;
        let cleaned = strip_reasoning_tags(&raw);
        let json_text = extract_json_block(&cleaned).unwrap_or(cleaned.trim());
        let parsed: DecomposeResponse = serde_json::from_str(json_text)
            .map_err(|e| PlannerError::UnparseableResponse(format!("{e}: {json_text}")))?;
        Ok(parsed.steps)
    }

    async fn find_or_synthesize(
        &self,
        step: &DecomposedStep,
        events: &UnboundedSender<PlannerEvent>,
    ) -> Result<String, PlannerError> {
        if let Some(suggested) = &step.suggested_block_id {
            if self.registry.get(suggested).await.is_ok() {
                return Ok(suggested.clone());
            }
        }

        let candidates = self.registry.search(&step.description, 5).await?;
        if let Some(best) = candidates.into_iter().next() {
            return Ok(best.id);
        }

        emit(
            events,
            PlannerStatus::Creating,
            &format!("no existing block matches '{}', synthesizing one", step.description),
        );

        let suggested_id = step
            .suggested_block_id
            .clone()
            .unwrap_or_else(|| slugify(&step.description));

        let required = RequiredBlock::New(crate::types::NewBlockSpec {
            suggested_id,
            description: step.description.clone(),
            category: crate::types::BlockCategory::Process,
            input_schema: crate::types::Schema::default(),
            output_schema: crate::types::Schema::default(),
            examples: Vec::new(),
        });

        match self.synthesizer.synthesize(&required).await? {
            SynthesisOutcome::Created(block) => {
                let id = block.id.clone();
                self.registry.save(block).await?;
                Ok(id)
            }
            SynthesisOutcome::GaveUp { reason } => {
                Err(PlannerError::UnsatisfiedBlock(format!(
                    "{}: {reason}",
                    step.description
                )))
            }
        }
    }

    async fn wire(
        &self,
        intent: &str,
        block_ids: &[String],
    ) -> Result<PipelineJson, PlannerError> {
        let mut blocks = Vec::with_capacity(block_ids.len());
        for id in block_ids {
            blocks.push(self.registry.get(id).await?);
        }

        let (system, user) = build_wire_prompts(intent, &blocks);
        let raw = self
            .capability
            .generate(&system, &user, std::time::Duration::from_secs(60))
            .await?;
        let cleaned = strip_reasoning_tags(&raw);
        let json_text = extract_json_block(&cleaned).unwrap_or(cleaned.trim());
        serde_json::from_str(json_text)
            .map_err(|e| PlannerError::UnparseableResponse(format!("{e}: {json_text}")))
    }
}

fn emit(events: &UnboundedSender<PlannerEvent>, status: PlannerStatus, message: &str) {
    let _ = events.send(PlannerEvent {
        status,
        message: message.to_owned(),
    });
}

/// Build the system/user prompt pair for the decompose stage.
fn build_decompose_prompts(intent: &str) -> (String, String) {
    let system = "You are an IO-driven task decomposer for a pipeline planner. \
        Break the user's intent into an ordered list of steps. Each step names \
        the inputs it consumes and the outputs it produces, so later steps can \
        reference earlier ones. Respond with a JSON object: \
        {\"steps\": [{\"description\": \"...\", \"suggested_block_id\": null, \
        \"inputs\": [], \"outputs\": []}]}. Return ONLY the JSON object."
        .to_owned();
    let user = format!("User intent: \"{intent}\"");
    (system, user)
}

/// Build the system/user prompt pair for the wiring stage.
fn build_wire_prompts(intent: &str, blocks: &[crate::types::BlockDefinition]) -> (String, String) {
    let catalog: Vec<serde_json::Value> = blocks
        .iter()
        .map(|b| {
            serde_json::json!({
                "id": b.id,
                "description": b.description,
                "input_schema": b.input_schema,
                "output_schema": b.output_schema,
            })
        })
        .collect();

    let system = format!(
        "You are a pipeline wirer. Connect the given blocks into an executable \
        Pipeline JSON. Node ids are sequential: n1, n2, n3... The first node \
        gets literal input values derived from the user's intent. Later nodes \
        reference earlier outputs with {{{{nX.field_name}}}} syntax, where \
        field_name comes from node nX's output_schema. Edges define execution \
        dependencies: {{\"from\": \"n1\", \"to\": \"n2\"}} means n2 runs after \
        n1. Blocks (in suggested order):\n{}",
        serde_json::to_string_pretty(&catalog).unwrap_or_default()
    );

    let user = format!(
        "User intent: \"{intent}\"\n\nWire the blocks above into a pipeline. \
        Return ONLY a JSON object: {{\"id\": \"pipeline_...\", \"name\": \"...\", \
        \"nodes\": [{{\"id\": \"n1\", \"block_id\": \"...\", \"inputs\": {{}}}}], \
        \"edges\": [{{\"from\": \"n1\", \"to\": \"n2\"}}]}}"
    );

    (system, user)
}

/// Extract JSON content from a markdown code fence (```` ```json ... ``` ````
/// or a plain ```` ``` ... ``` ```` block).
pub fn extract_json_block(text: &str) -> Option<&str> {
    let start_marker_json = "```json";
    let start_marker_plain = "```";
    let end_marker = "```";

    let content_start = if let Some(pos) = text.find(start_marker_json) {
        pos.checked_add(start_marker_json.len())?
    } else if let Some(pos) = text.find(start_marker_plain) {
        pos.checked_add(start_marker_plain.len())?
    } else {
        return None;
    };

    let rest = text.get(content_start..)?;
    let rest = rest.strip_prefix('\n').unwrap_or(rest);
    let end_pos = rest.find(end_marker)?;
    let content = rest.get(..end_pos)?;
    Some(content.trim())
}

/// Strip `<think>...</think>` reasoning-model tags (e.g. DeepSeek R1) from a
/// response, leaving only the substantive output.
pub fn strip_reasoning_tags(response: &str) -> String {
    let mut result = response.to_owned();

    while let Some(start) = result.find("<think>") {
        if let Some(end) = result.find("</think>") {
            let tag_end = end.saturating_add("</think>".len());
            result = format!(
                "{}{}",
                result.get(..start).unwrap_or_default(),
                result.get(tag_end..).unwrap_or_default()
            );
        } else {
            result = result.get(..start).unwrap_or_default().to_owned();
            break;
        }
    }

    result
}

/// Derive a snake_case block id candidate from a free-text description.
fn slugify(description: &str) -> String {
    let mut slug = String::with_capacity(description.len());
    let mut last_was_underscore = false;
    for ch in description.to_lowercase().chars() {
        if ch.is_alphanumeric() {
            slug.push(ch);
            last_was_underscore = false;
        } else if !last_was_underscore {
            slug.push('_');
            last_was_underscore = true;
        }
    }
    let trimmed = slug.trim_matches('_');
    let truncated = truncate_for_error(trimmed, 48);
    if truncated.is_empty() {
        "generated_block".to_owned()
    } else {
        truncated.to_owned()
    }
}

/// Truncate a string to at most `max_len` bytes, on a valid char boundary,
/// for inclusion in error messages.
pub fn truncate_for_error(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    s.get(..end).unwrap_or(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_block_from_fenced_code() {
        let text = "here you go\n```json\n{\"a\": 1}\n```\nthanks";
        assert_eq!(extract_json_block(text), Some("{\"a\": 1}"));
    }

    #[test]
    fn test_extract_json_block_returns_none_without_fence() {
        assert_eq!(extract_json_block("no fences here"), None);
    }

    #[test]
    fn test_strip_reasoning_tags_removes_think_block() {
        let response = "<think>internal chatter</think>final answer";
        assert_eq!(strip_reasoning_tags(response), "final answer");
    }

    #[test]
    fn test_strip_reasoning_tags_handles_unclosed_tag() {
        let response = "prefix<think>never closes";
        assert_eq!(strip_reasoning_tags(response), "prefix");
    }

    #[test]
    fn test_truncate_for_error_respects_char_boundary() {
        let s = "héllo world";
        let truncated = truncate_for_error(s, 3);
        assert!(s.is_char_boundary(truncated.len()));
    }

    #[test]
    fn test_build_decompose_prompts_embeds_intent() {
        let (_, user) = build_decompose_prompts("send a daily weather email");
        assert!(user.contains("send a daily weather email"));
    }
}
