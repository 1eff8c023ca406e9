//! Typed per-stage outputs and hallucination detection.
//!
//! Iterative pipelines accumulate a [`StructuredContext`]: a typed,
//! append-then-replaceable record of what every prior stage actually
//! produced.  Downstream agents reference it (via the
//! `{{structured_context}}` placeholder) and validators use it to catch two
//! classes of LLM hallucination:
//!
//! - **Reference hallucination**: the agent cites a table, database, or
//!   output no earlier stage produced.
//! - **Action hallucination**: the agent claims an action (a tool call, a
//!   file written) that, by the recorded evidence or the local filesystem,
//!   never happened.
//!
//! Agent outputs arrive as free text; [`parse_stage_output`] extracts a
//! [`StageOutput`] from JSON (preferred) or a permissive `<stage_output>`
//! XML shape, and [`validate_output_structure`] checks the documented
//! shapes without any LLM involvement.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use crate::agentweave::agent_api::BoxError;

/// Stage status recorded in a [`StageOutput`].
pub const STATUS_COMPLETED: &str = "completed";
/// Stage status for a failed stage.
pub const STATUS_FAILED: &str = "failed";
/// Stage status for a skipped stage.
pub const STATUS_SKIPPED: &str = "skipped";

/// Identity block for the workflow owning a context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContextInfo {
    /// Unique id of the owning workflow execution.
    pub workflow_id: String,
    /// Pattern discriminator, e.g. `"iterative_pipeline"`.
    pub workflow_type: String,
    /// On-wire schema version; currently always `"1.0"`.
    pub schema_version: String,
    /// RFC 3339 timestamp of context creation.
    pub started_at: String,
}

/// One recorded tool invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// Name of the executed tool.
    #[serde(default)]
    pub tool_name: String,
    /// Parameters the tool was called with.
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    /// Short summary of the tool's result.
    #[serde(default)]
    pub result_summary: String,
}

impl From<&crate::agentweave::agent_api::ToolExecution> for ToolCallRecord {
    fn from(execution: &crate::agentweave::agent_api::ToolExecution) -> Self {
        let parameters = match &execution.parameters {
            serde_json::Value::Object(object) => object.clone().into_iter().collect(),
            serde_json::Value::Null => HashMap::new(),
            other => {
                let mut map = HashMap::new();
                map.insert("value".to_string(), other.clone());
                map
            }
        };
        Self {
            tool_name: execution.tool_name.clone(),
            parameters,
            result_summary: execution.result_summary.clone(),
        }
    }
}

/// Evidence a stage leaves behind: what it actually executed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageEvidence {
    /// Tool invocations, in execution order.
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
    /// Queries the stage ran, verbatim.
    #[serde(default)]
    pub queries_executed: Vec<String>,
}

/// The typed record of a single stage's execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    /// Stage identifier (non-empty once stored in a context).
    #[serde(default)]
    pub stage_id: String,
    /// One of [`STATUS_COMPLETED`], [`STATUS_FAILED`], [`STATUS_SKIPPED`].
    #[serde(default)]
    pub status: String,
    /// RFC 3339 start timestamp, when known.
    #[serde(default)]
    pub started_at: String,
    /// RFC 3339 completion timestamp, when known.
    #[serde(default)]
    pub completed_at: String,
    /// Inputs the stage consumed.
    #[serde(default)]
    pub inputs: HashMap<String, serde_json::Value>,
    /// Outputs the stage produced.
    #[serde(default)]
    pub outputs: HashMap<String, serde_json::Value>,
    /// What the stage actually executed.
    #[serde(default)]
    pub evidence: StageEvidence,
}

/// Typed, per-stage output record for one workflow execution.
///
/// Keys are conventionally `stage-1`, `stage-2`, … but the map is
/// insertion-order-irrelevant; lookups go through the key alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredContext {
    /// Identity of the owning workflow.
    pub workflow_context: WorkflowContextInfo,
    /// Stage key to recorded output.
    #[serde(default)]
    pub stage_outputs: HashMap<String, StageOutput>,
}

impl StructuredContext {
    /// Create an empty context for a workflow.
    pub fn new(workflow_id: impl Into<String>, workflow_type: impl Into<String>) -> Self {
        Self {
            workflow_context: WorkflowContextInfo {
                workflow_id: workflow_id.into(),
                workflow_type: workflow_type.into(),
                schema_version: "1.0".to_string(),
                started_at: Utc::now().to_rfc3339(),
            },
            stage_outputs: HashMap::new(),
        }
    }

    /// Add (or replace) a stage output under `key`.
    ///
    /// Fails when the output's `stage_id` or `status` is empty; once an
    /// entry is in the map those two fields are guaranteed non-empty.
    pub fn add_stage_output(&mut self, key: &str, output: StageOutput) -> Result<(), ContextError> {
        if output.stage_id.is_empty() {
            return Err(ContextError::EmptyStageId { key: key.to_string() });
        }
        if output.status.is_empty() {
            return Err(ContextError::EmptyStatus {
                key: key.to_string(),
                stage_id: output.stage_id,
            });
        }
        self.stage_outputs.insert(key.to_string(), output);
        Ok(())
    }

    /// Serialize to the stable on-wire JSON.
    pub fn to_json(&self) -> Result<String, BoxError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from the stable on-wire JSON.
    pub fn from_json(raw: &str) -> Result<Self, BoxError> {
        Ok(serde_json::from_str(raw)?)
    }

    fn source(&self, source_key: &str) -> Result<&StageOutput, ContextError> {
        self.stage_outputs
            .get(source_key)
            .ok_or_else(|| ContextError::SourceMissing {
                source_key: source_key.to_string(),
            })
    }

    /// Check that `current` stage's claim of `database.table` traces back to
    /// a completed source stage that actually recommended it.
    ///
    /// The source must exist, be `completed`, and carry
    /// `outputs.recommended_table.{database,table}` matching both names
    /// literally.  Any mismatch is a reference hallucination.
    pub fn validate_table_reference(
        &self,
        current: &str,
        database: &str,
        table: &str,
        source_key: &str,
    ) -> Result<(), ContextError> {
        let source = self.source(source_key)?;
        if source.status != STATUS_COMPLETED {
            return Err(ContextError::SourceNotCompleted {
                source_key: source_key.to_string(),
                status: source.status.clone(),
            });
        }
        let recommended = source
            .outputs
            .get("recommended_table")
            .and_then(|value| value.as_object())
            .ok_or_else(|| ContextError::MissingOutputField {
                source_key: source_key.to_string(),
                field: "recommended_table".to_string(),
            })?;
        let rec_database = recommended.get("database").and_then(|v| v.as_str()).unwrap_or("");
        let rec_table = recommended.get("table").and_then(|v| v.as_str()).unwrap_or("");
        if rec_database != database || rec_table != table {
            return Err(ContextError::ReferenceHallucination {
                current: current.to_string(),
                claimed: format!("{}.{}", database, table),
                actual: format!("{}.{}", rec_database, rec_table),
                source_key: source_key.to_string(),
            });
        }
        Ok(())
    }

    /// Check that `database` appears in the source stage's
    /// `outputs.discovered_databases` string list.
    pub fn validate_database_list(
        &self,
        database: &str,
        source_key: &str,
    ) -> Result<(), ContextError> {
        let source = self.source(source_key)?;
        let discovered = source
            .outputs
            .get("discovered_databases")
            .and_then(|value| value.as_array())
            .ok_or_else(|| ContextError::MissingOutputField {
                source_key: source_key.to_string(),
                field: "discovered_databases".to_string(),
            })?;
        let found = discovered
            .iter()
            .filter_map(|value| value.as_str())
            .any(|name| name == database);
        if !found {
            return Err(ContextError::ReferenceHallucination {
                current: source_key.to_string(),
                claimed: database.to_string(),
                actual: "not in discovered_databases".to_string(),
                source_key: source_key.to_string(),
            });
        }
        Ok(())
    }

    /// Check that the stage under `key` recorded tool activity covering every
    /// name in `required_tools`.
    ///
    /// An empty `evidence.tool_calls` list is classified as an action
    /// hallucination: the stage claims work it never routed through a tool.
    pub fn validate_tool_executions(
        &self,
        key: &str,
        required_tools: &[&str],
    ) -> Result<(), ContextError> {
        let stage = self.source(key)?;
        if stage.evidence.tool_calls.is_empty() {
            return Err(ContextError::ActionHallucination {
                key: key.to_string(),
                claim: "stage reports results but recorded zero tool calls".to_string(),
            });
        }
        for required in required_tools {
            let present = stage
                .evidence
                .tool_calls
                .iter()
                .any(|call| call.tool_name == *required);
            if !present {
                return Err(ContextError::ActionHallucination {
                    key: key.to_string(),
                    claim: format!("required tool '{}' was never executed", required),
                });
            }
        }
        Ok(())
    }

    /// Check that the path recorded under `outputs[path_field]` exists on the
    /// local filesystem.  A missing file is an action hallucination.
    pub fn validate_file_creation(
        &self,
        key: &str,
        path_field: &str,
    ) -> Result<(), ContextError> {
        let stage = self.source(key)?;
        let path = stage
            .outputs
            .get(path_field)
            .and_then(|value| value.as_str())
            .ok_or_else(|| ContextError::MissingOutputField {
                source_key: key.to_string(),
                field: path_field.to_string(),
            })?;
        if !Path::new(path).exists() {
            return Err(ContextError::ActionHallucination {
                key: key.to_string(),
                claim: format!("claimed file '{}' does not exist", path),
            });
        }
        Ok(())
    }
}

/// Errors from context mutation and hallucination validation.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextError {
    /// `add_stage_output` was called with an empty `stage_id`.
    EmptyStageId { key: String },
    /// `add_stage_output` was called with an empty `status`.
    EmptyStatus { key: String, stage_id: String },
    /// A validator referenced a stage key that is not in the context.
    SourceMissing { source_key: String },
    /// The referenced source stage did not complete.
    SourceNotCompleted { source_key: String, status: String },
    /// The referenced source stage lacks a required output field.
    MissingOutputField { source_key: String, field: String },
    /// The claim does not match what the source stage recorded.
    ReferenceHallucination {
        current: String,
        claimed: String,
        actual: String,
        source_key: String,
    },
    /// The stage claims an action the evidence does not support.
    ActionHallucination { key: String, claim: String },
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextError::EmptyStageId { key } => {
                write!(f, "stage output '{}' has an empty stage_id", key)
            }
            ContextError::EmptyStatus { key, stage_id } => {
                write!(f, "stage output '{}' ({}) has an empty status", key, stage_id)
            }
            ContextError::SourceMissing { source_key } => {
                write!(f, "source stage '{}' not found in structured context", source_key)
            }
            ContextError::SourceNotCompleted { source_key, status } => {
                write!(f, "source stage '{}' is '{}', not completed", source_key, status)
            }
            ContextError::MissingOutputField { source_key, field } => {
                write!(f, "source stage '{}' has no output field '{}'", source_key, field)
            }
            ContextError::ReferenceHallucination {
                current,
                claimed,
                actual,
                source_key,
            } => write!(
                f,
                "reference hallucination in '{}': claimed '{}' but source '{}' recorded '{}'",
                current, claimed, source_key, actual
            ),
            ContextError::ActionHallucination { key, claim } => {
                write!(f, "action hallucination in '{}': {}", key, claim)
            }
        }
    }
}

impl std::error::Error for ContextError {}

/// Error from [`validate_output_structure`], carrying a precise description
/// of the first missing or malformed field.
#[derive(Debug, Clone, PartialEq)]
pub struct StructureError(pub String);

impl fmt::Display for StructureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for StructureError {}

/// Byte offset of the first ASCII-case-insensitive occurrence of `needle`
/// in `haystack` at or after `from`.  The needle must be ASCII, which keeps
/// every match on a char boundary regardless of what surrounds it.
pub(crate) fn find_ignore_ascii_case(haystack: &str, needle: &str, from: usize) -> Option<usize> {
    let haystack = haystack.as_bytes();
    let needle = needle.as_bytes();
    if needle.is_empty() || haystack.len() < needle.len() || from > haystack.len() - needle.len() {
        return None;
    }
    (from..=haystack.len() - needle.len())
        .find(|&index| haystack[index..index + needle.len()].eq_ignore_ascii_case(needle))
}

/// Remove every `<thinking>…</thinking>` block (case-insensitive).
fn strip_thinking(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut cursor = 0;
    while let Some(open) = find_ignore_ascii_case(raw, "<thinking>", cursor) {
        out.push_str(&raw[cursor..open]);
        match find_ignore_ascii_case(raw, "</thinking>", open) {
            Some(close) => {
                cursor = close + "</thinking>".len();
            }
            None => {
                // Unterminated block: drop the rest.
                return out;
            }
        }
    }
    out.push_str(&raw[cursor..]);
    out
}

/// Extract the JSON object text from free-form agent output: the content of
/// a ```` ```json ```` fence when present, otherwise the outermost `{…}`.
fn extract_json_object(raw: &str) -> Option<String> {
    if let Some(fence_start) = raw.find("```json") {
        let body_start = fence_start + "```json".len();
        if let Some(fence_end) = raw[body_start..].find("```") {
            return Some(raw[body_start..body_start + fence_end].trim().to_string());
        }
    }
    let first = raw.find('{')?;
    let last = raw.rfind('}')?;
    if last <= first {
        return None;
    }
    Some(raw[first..=last].to_string())
}

fn require_nonempty_string(
    object: &serde_json::Map<String, serde_json::Value>,
    field: &str,
    location: &str,
) -> Result<(), StructureError> {
    match object.get(field) {
        Some(serde_json::Value::String(value)) if !value.is_empty() => Ok(()),
        Some(serde_json::Value::String(_)) => Err(StructureError(format!(
            "{}: field \"{}\" is empty",
            location, field
        ))),
        Some(_) => Err(StructureError(format!(
            "{}: field \"{}\" must be a string",
            location, field
        ))),
        None => Err(StructureError(format!(
            "{}: missing required field \"{}\"",
            location, field
        ))),
    }
}

fn check_evidence(
    object: &serde_json::Map<String, serde_json::Value>,
    location: &str,
) -> Result<(), StructureError> {
    if let Some(evidence) = object.get("evidence") {
        let evidence = evidence.as_object().ok_or_else(|| {
            StructureError(format!("{}: field \"evidence\" must be an object", location))
        })?;
        if let Some(tool_calls) = evidence.get("tool_calls") {
            if !tool_calls.is_array() {
                return Err(StructureError(format!(
                    "{}: field \"evidence.tool_calls\" must be a list",
                    location
                )));
            }
        }
    }
    Ok(())
}

fn check_entry(
    object: &serde_json::Map<String, serde_json::Value>,
    location: &str,
    status_required: bool,
) -> Result<(), StructureError> {
    require_nonempty_string(object, "stage_id", location)?;
    if status_required {
        require_nonempty_string(object, "status", location)?;
    } else if let Some(status) = object.get("status") {
        if !status.is_string() {
            return Err(StructureError(format!(
                "{}: field \"status\" must be a string",
                location
            )));
        }
    }
    match object.get("outputs") {
        Some(serde_json::Value::Object(_)) => {}
        Some(_) => {
            return Err(StructureError(format!(
                "{}: field \"outputs\" must be an object",
                location
            )))
        }
        None => {
            return Err(StructureError(format!(
                "{}: missing required field \"outputs\"",
                location
            )))
        }
    }
    check_evidence(object, location)
}

/// Deterministic, LLM-free check that `raw` carries a structurally valid
/// stage output.
///
/// Any `<thinking>…</thinking>` block is stripped first.  The remainder must
/// contain either `<stage_output>` XML or a JSON object (inside a
/// ```` ```json ```` fence or as the outermost `{…}`).  JSON is accepted in
/// two shapes:
///
/// - *nested*: `{"stage_outputs": {"<key>": {stage_id, status, outputs,
///   evidence?}}}`; every entry requires `stage_id`, `status`, and
///   `outputs`;
/// - *flat*: `{stage_id, outputs, evidence?}`, where `status` is optional.
///
/// In both, `evidence.tool_calls`, when present, must be a list.  The error
/// names the first missing or malformed field.
pub fn validate_output_structure(raw: &str) -> Result<(), StructureError> {
    let cleaned = strip_thinking(raw);

    if cleaned.contains("<stage_output>") {
        let parsed = parse_stage_output_xml(&cleaned)
            .map_err(|e| StructureError(format!("stage_output XML: {}", e)))?;
        if parsed.stage_id.is_empty() {
            return Err(StructureError(
                "stage_output XML: missing <stage_id>".to_string(),
            ));
        }
        return Ok(());
    }

    let json_text = extract_json_object(&cleaned).ok_or_else(|| {
        StructureError(
            "no structured output found: expected <stage_output> XML or a JSON object".to_string(),
        )
    })?;
    let value: serde_json::Value = serde_json::from_str(&json_text)
        .map_err(|e| StructureError(format!("invalid JSON: {}", e)))?;
    let object = value
        .as_object()
        .ok_or_else(|| StructureError("structured output must be a JSON object".to_string()))?;

    if let Some(stage_outputs) = object.get("stage_outputs") {
        let entries = stage_outputs.as_object().ok_or_else(|| {
            StructureError("field \"stage_outputs\" must be an object".to_string())
        })?;
        for (key, entry) in entries {
            let location = format!("stage_outputs[\"{}\"]", key);
            let entry = entry
                .as_object()
                .ok_or_else(|| StructureError(format!("{}: expected an object", location)))?;
            check_entry(entry, &location, true)?;
        }
        return Ok(());
    }

    check_entry(object, "stage output", false)
}

/// Parse free-form agent output into a [`StageOutput`]: JSON first, XML
/// second.
///
/// Flat JSON missing `status` defaults to `completed` so minimal v-latest
/// outputs still land in the context.  For the nested shape, the first entry
/// (by key order) is taken.
pub fn parse_stage_output(raw: &str) -> Result<StageOutput, BoxError> {
    let cleaned = strip_thinking(raw);

    if let Some(json_text) = extract_json_object(&cleaned) {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&json_text) {
            if let Some(object) = value.as_object() {
                if let Some(entries) = object.get("stage_outputs").and_then(|v| v.as_object()) {
                    if let Some((_, entry)) = entries.iter().next() {
                        let output: StageOutput = serde_json::from_value(entry.clone())?;
                        return Ok(output);
                    }
                    return Err(Box::new(StructureError(
                        "stage_outputs is empty".to_string(),
                    )));
                }
                if let Ok(mut output) = serde_json::from_value::<StageOutput>(value.clone()) {
                    if output.status.is_empty() {
                        output.status = STATUS_COMPLETED.to_string();
                    }
                    if !output.stage_id.is_empty() {
                        return Ok(output);
                    }
                }
            }
        }
    }

    if cleaned.contains("<stage_output>") {
        let output = parse_stage_output_xml(&cleaned)?;
        if !output.stage_id.is_empty() {
            return Ok(output);
        }
    }

    Err(Box::new(StructureError(
        "output carries neither stage-output JSON nor <stage_output> XML".to_string(),
    )))
}

/// Scan `xml` for direct scalar children: `<tag>text</tag>` pairs whose body
/// contains no further markup.  Returns `(name, trimmed_body)` pairs in
/// document order.
fn scalar_children(xml: &str) -> Vec<(String, String)> {
    let mut children = Vec::new();
    let bytes = xml.as_bytes();
    let mut cursor = 0;
    while let Some(open) = xml[cursor..].find('<') {
        let open_abs = cursor + open;
        let rest = &xml[open_abs + 1..];
        if rest.starts_with('/') || rest.starts_with('!') || rest.starts_with('?') {
            cursor = open_abs + 1;
            continue;
        }
        let name_end = rest
            .find(|c: char| c == '>' || c.is_whitespace())
            .unwrap_or(rest.len());
        let name = &rest[..name_end];
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            cursor = open_abs + 1;
            continue;
        }
        let tag_close = match xml[open_abs..].find('>') {
            Some(pos) => open_abs + pos + 1,
            None => break,
        };
        // Self-closing tag.
        if tag_close >= 2 && bytes[tag_close - 2] == b'/' {
            cursor = tag_close;
            continue;
        }
        let closing = format!("</{}>", name);
        let body_end = match xml[tag_close..].find(&closing) {
            Some(pos) => tag_close + pos,
            None => {
                cursor = tag_close;
                continue;
            }
        };
        let body = &xml[tag_close..body_end];
        if !body.contains('<') {
            children.push((name.to_string(), body.trim().to_string()));
        }
        cursor = body_end + closing.len();
    }
    children
}

/// Parse the permissive `<stage_output>` XML shape.
///
/// Scalar children named `stage_id`, `status`, `started_at`, `completed_at`
/// map to the corresponding fields.  An `<outputs>` wrapper's scalar
/// children become the outputs map; without the wrapper, remaining scalar
/// children directly under `<stage_output>` are promoted to outputs.
fn parse_stage_output_xml(raw: &str) -> Result<StageOutput, BoxError> {
    let open = raw.find("<stage_output>").ok_or_else(|| {
        Box::new(StructureError("missing <stage_output> element".to_string())) as BoxError
    })?;
    let body_start = open + "<stage_output>".len();
    let body_end = raw[body_start..]
        .find("</stage_output>")
        .map(|pos| body_start + pos)
        .ok_or_else(|| {
            Box::new(StructureError("unterminated <stage_output> element".to_string())) as BoxError
        })?;
    let body = &raw[body_start..body_end];

    let mut output = StageOutput {
        status: STATUS_COMPLETED.to_string(),
        ..StageOutput::default()
    };

    let wrapped_outputs = body.find("<outputs>").and_then(|outputs_open| {
        let inner_start = outputs_open + "<outputs>".len();
        body[inner_start..]
            .find("</outputs>")
            .map(|pos| &body[inner_start..inner_start + pos])
    });

    if let Some(outputs_body) = wrapped_outputs {
        for (name, value) in scalar_children(outputs_body) {
            output
                .outputs
                .insert(name, serde_json::Value::String(value));
        }
    }

    for (name, value) in scalar_children(body) {
        match name.as_str() {
            "stage_id" => output.stage_id = value,
            "status" => output.status = value,
            "started_at" => output.started_at = value,
            "completed_at" => output.completed_at = value,
            _ => {
                // Fallback promotion: only when no <outputs> wrapper exists.
                if wrapped_outputs.is_none() {
                    output
                        .outputs
                        .insert(name, serde_json::Value::String(value));
                }
            }
        }
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed_stage(stage_id: &str) -> StageOutput {
        StageOutput {
            stage_id: stage_id.to_string(),
            status: STATUS_COMPLETED.to_string(),
            ..StageOutput::default()
        }
    }

    #[test]
    fn add_stage_output_rejects_empty_identity() {
        let mut ctx = StructuredContext::new("wf-1", "iterative_pipeline");
        let err = ctx
            .add_stage_output("stage-1", StageOutput::default())
            .unwrap_err();
        assert!(matches!(err, ContextError::EmptyStageId { .. }));

        let missing_status = StageOutput {
            stage_id: "extract".to_string(),
            ..StageOutput::default()
        };
        let err = ctx.add_stage_output("stage-1", missing_status).unwrap_err();
        assert!(matches!(err, ContextError::EmptyStatus { .. }));
    }

    #[test]
    fn json_round_trip_preserves_identity_and_keys() {
        let mut ctx = StructuredContext::new("wf-7", "iterative_pipeline");
        ctx.add_stage_output("stage-1", completed_stage("discover"))
            .unwrap();
        ctx.add_stage_output("stage-2", completed_stage("analyze"))
            .unwrap();

        let round_tripped = StructuredContext::from_json(&ctx.to_json().unwrap()).unwrap();
        assert_eq!(round_tripped.workflow_context.workflow_id, "wf-7");
        assert_eq!(round_tripped.workflow_context.workflow_type, "iterative_pipeline");
        assert_eq!(round_tripped.workflow_context.schema_version, "1.0");
        assert_eq!(round_tripped.stage_outputs["stage-1"].stage_id, "discover");
        assert_eq!(round_tripped.stage_outputs["stage-2"].stage_id, "analyze");
    }

    #[test]
    fn table_reference_matches_literally() {
        let mut ctx = StructuredContext::new("wf", "iterative_pipeline");
        let mut stage = completed_stage("recommender");
        stage.outputs.insert(
            "recommended_table".to_string(),
            serde_json::json!({"database": "sales", "table": "orders"}),
        );
        ctx.add_stage_output("stage-1", stage).unwrap();

        ctx.validate_table_reference("stage-2", "sales", "orders", "stage-1")
            .unwrap();

        let err = ctx
            .validate_table_reference("stage-2", "sales", "order_items", "stage-1")
            .unwrap_err();
        assert!(err.to_string().contains("reference hallucination"));
        assert!(err.to_string().contains("sales.order_items"));
    }

    #[test]
    fn table_reference_requires_completed_source() {
        let mut ctx = StructuredContext::new("wf", "iterative_pipeline");
        let mut stage = completed_stage("recommender");
        stage.status = STATUS_FAILED.to_string();
        ctx.add_stage_output("stage-1", stage).unwrap();

        let err = ctx
            .validate_table_reference("stage-2", "sales", "orders", "stage-1")
            .unwrap_err();
        assert!(matches!(err, ContextError::SourceNotCompleted { .. }));

        let err = ctx
            .validate_table_reference("stage-2", "sales", "orders", "stage-9")
            .unwrap_err();
        assert!(matches!(err, ContextError::SourceMissing { .. }));
    }

    #[test]
    fn database_list_membership() {
        let mut ctx = StructuredContext::new("wf", "iterative_pipeline");
        let mut stage = completed_stage("discovery");
        stage.outputs.insert(
            "discovered_databases".to_string(),
            serde_json::json!(["sales", "hr"]),
        );
        ctx.add_stage_output("stage-1", stage).unwrap();

        ctx.validate_database_list("sales", "stage-1").unwrap();
        let err = ctx.validate_database_list("finance", "stage-1").unwrap_err();
        assert!(err.to_string().contains("finance"));
    }

    #[test]
    fn empty_tool_calls_is_action_hallucination() {
        let mut ctx = StructuredContext::new("wf", "iterative_pipeline");
        ctx.add_stage_output("stage-1", completed_stage("worker"))
            .unwrap();

        let err = ctx
            .validate_tool_executions("stage-1", &["query_runner"])
            .unwrap_err();
        assert!(err.to_string().contains("action hallucination"));
    }

    #[test]
    fn tool_executions_cover_required_names() {
        let mut ctx = StructuredContext::new("wf", "iterative_pipeline");
        let mut stage = completed_stage("worker");
        stage.evidence.tool_calls.push(ToolCallRecord {
            tool_name: "query_runner".to_string(),
            ..ToolCallRecord::default()
        });
        ctx.add_stage_output("stage-1", stage).unwrap();

        ctx.validate_tool_executions("stage-1", &["query_runner"])
            .unwrap();
        let err = ctx
            .validate_tool_executions("stage-1", &["query_runner", "file_writer"])
            .unwrap_err();
        assert!(err.to_string().contains("file_writer"));
    }

    #[test]
    fn file_creation_checks_local_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("report.html");
        std::fs::write(&real, "<html></html>").unwrap();

        let mut ctx = StructuredContext::new("wf", "iterative_pipeline");
        let mut stage = completed_stage("reporter");
        stage.outputs.insert(
            "report_path".to_string(),
            serde_json::Value::String(real.to_string_lossy().into_owned()),
        );
        stage.outputs.insert(
            "phantom_path".to_string(),
            serde_json::Value::String(
                dir.path().join("never-written.html").to_string_lossy().into_owned(),
            ),
        );
        ctx.add_stage_output("stage-1", stage).unwrap();

        ctx.validate_file_creation("stage-1", "report_path").unwrap();
        let err = ctx
            .validate_file_creation("stage-1", "phantom_path")
            .unwrap_err();
        assert!(err.to_string().contains("action hallucination"));
    }

    #[test]
    fn minimal_flat_json_is_accepted() {
        validate_output_structure(r#"{"stage_id":"s","outputs":{}}"#).unwrap();
    }

    #[test]
    fn flat_json_without_outputs_is_rejected() {
        let err = validate_output_structure(r#"{"stage_id":"s"}"#).unwrap_err();
        assert!(err.to_string().contains("outputs"));
    }

    #[test]
    fn nested_shape_requires_status_per_entry() {
        let raw = r#"{"stage_outputs":{"stage-1":{"stage_id":"s","outputs":{}}}}"#;
        let err = validate_output_structure(raw).unwrap_err();
        assert!(err.to_string().contains("status"));
        assert!(err.to_string().contains("stage-1"));

        let ok = r#"{"stage_outputs":{"stage-1":{"stage_id":"s","status":"completed","outputs":{}}}}"#;
        validate_output_structure(ok).unwrap();
    }

    #[test]
    fn tool_calls_must_be_a_list() {
        let raw = r#"{"stage_id":"s","outputs":{},"evidence":{"tool_calls":"none"}}"#;
        let err = validate_output_structure(raw).unwrap_err();
        assert!(err.to_string().contains("tool_calls"));
    }

    #[test]
    fn thinking_blocks_are_stripped() {
        let raw = "<thinking>{not json}</thinking>\n```json\n{\"stage_id\":\"s\",\"outputs\":{}}\n```";
        validate_output_structure(raw).unwrap();
    }

    #[test]
    fn fenced_json_wins_over_surrounding_prose() {
        let raw = "Here is my output:\n```json\n{\"stage_id\":\"s\",\"status\":\"completed\",\"outputs\":{\"answer\":\"42\"}}\n```\nDone.";
        let output = parse_stage_output(raw).unwrap();
        assert_eq!(output.stage_id, "s");
        assert_eq!(output.outputs["answer"], serde_json::json!("42"));
    }

    #[test]
    fn flat_json_defaults_missing_status_to_completed() {
        let output = parse_stage_output(r#"{"stage_id":"s","outputs":{}}"#).unwrap();
        assert_eq!(output.status, STATUS_COMPLETED);
    }

    #[test]
    fn xml_with_outputs_wrapper() {
        let raw = "<stage_output><stage_id>extract</stage_id><status>completed</status>\
                   <outputs><rows>120</rows><table>orders</table></outputs></stage_output>";
        let output = parse_stage_output(raw).unwrap();
        assert_eq!(output.stage_id, "extract");
        assert_eq!(output.status, "completed");
        assert_eq!(output.outputs["rows"], serde_json::json!("120"));
        assert_eq!(output.outputs["table"], serde_json::json!("orders"));
    }

    #[test]
    fn xml_without_wrapper_promotes_scalars_to_outputs() {
        let raw = "<stage_output><stage_id>extract</stage_id><summary>ok</summary></stage_output>";
        let output = parse_stage_output(raw).unwrap();
        assert_eq!(output.stage_id, "extract");
        assert_eq!(output.outputs["summary"], serde_json::json!("ok"));
        assert!(!output.outputs.contains_key("stage_id"));
    }

    #[test]
    fn unparseable_output_is_an_error() {
        assert!(parse_stage_output("just prose, no structure").is_err());
    }
}
