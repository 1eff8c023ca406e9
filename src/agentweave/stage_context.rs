//! Hybrid stage context: size-bounded summaries plus shared-memory references.
//!
//! Prompts carry only a bounded slice of earlier stage output; the full data
//! lives in the workflow's shared-memory namespace and agents fetch it on
//! demand with `shared_memory_read`.  This module owns the truncation rule,
//! the context header that teaches agents where the full outputs live, and
//! the `{{previous}}` / `{{history}}` / `{{structured_context}}` placeholder
//! expansion.

/// Default byte bound for per-stage context summaries.
pub const DEFAULT_MAX_CONTEXT_BYTES: usize = 8192;

/// Largest char-boundary index not exceeding `index`.
fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Bound `output` to `max_bytes`, appending a notice that points at the
/// shared-memory key holding the complete data.
///
/// Returns `(text, truncated)`.  Outputs within the bound come back
/// unchanged.  Oversized outputs are cut at the last newline after
/// `max_bytes / 2` when one exists (so the cut lands between lines), at the
/// byte bound otherwise.
pub fn truncate_for_context(output: &str, max_bytes: usize, memory_key: &str) -> (String, bool) {
    if output.len() <= max_bytes {
        return (output.to_string(), false);
    }

    let hard_cut = floor_char_boundary(output, max_bytes);
    let half = max_bytes / 2;
    let cut = output[..hard_cut]
        .rfind('\n')
        .filter(|&pos| pos >= half)
        .unwrap_or(hard_cut);

    let mut truncated = output[..cut].to_string();
    truncated.push_str(&format!(
        "\n\n[OUTPUT TRUNCATED — Full data stored in SharedMemory. Use \
         shared_memory_read(namespace=\"workflow\", key=\"{}\") to fetch complete output]",
        memory_key
    ));
    (truncated, true)
}

/// Shared-memory key for a stage's full output.  Stage numbers are 1-based.
pub fn stage_memory_key(stage_number: usize) -> String {
    format!("stage-{}-output", stage_number)
}

/// Markdown header prepended to every prompt that has prior stages.
///
/// Enumerates the shared-memory keys for stages `1..=prior_stages` and shows
/// the agent how to fetch a complete output.  Empty when there are no prior
/// stages.
pub fn shared_memory_header(prior_stages: usize) -> String {
    if prior_stages == 0 {
        return String::new();
    }
    let mut header = String::from("## Prior stage outputs\n\n");
    header.push_str(
        "Summaries below may be truncated. Full outputs are stored in SharedMemory:\n",
    );
    for stage_number in 1..=prior_stages {
        header.push_str(&format!("- key `{}`\n", stage_memory_key(stage_number)));
    }
    header.push_str(
        "\nFetch any complete output with \
         shared_memory_read(namespace=\"workflow\", key=\"<key>\").\n\n",
    );
    header
}

/// Concatenated, stage-labeled history block: one
/// `"Stage <i> output:\n<out>\n\n"` segment per prior output.
pub fn history_block(prior_outputs: &[String]) -> String {
    let mut block = String::new();
    for (index, output) in prior_outputs.iter().enumerate() {
        block.push_str(&format!("Stage {} output:\n{}\n\n", index + 1, output));
    }
    block
}

/// Whether the template references any of the engine-supplied placeholders.
pub fn references_placeholders(template: &str) -> bool {
    template.contains("{{previous}}")
        || template.contains("{{history}}")
        || template.contains("{{structured_context}}")
}

/// Expand the engine-supplied placeholders in a stage template.
///
/// - `{{previous}}`: the preceding stage's (possibly truncated) output.
/// - `{{history}}`: the labeled concatenation of all prior outputs.
/// - `{{structured_context}}`: the structured context JSON, `{}` when none.
///
/// Unresolved placeholders (caller variables were already interpolated at
/// dispatch) remain literal.
pub fn expand_stage_template(
    template: &str,
    previous: &str,
    prior_outputs: &[String],
    structured_json: Option<&str>,
) -> String {
    let mut expanded = template.to_string();
    if expanded.contains("{{previous}}") {
        expanded = expanded.replace("{{previous}}", previous);
    }
    if expanded.contains("{{history}}") {
        expanded = expanded.replace("{{history}}", &history_block(prior_outputs));
    }
    if expanded.contains("{{structured_context}}") {
        expanded = expanded.replace("{{structured_context}}", structured_json.unwrap_or("{}"));
    }
    expanded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_outputs_pass_through() {
        let (text, truncated) = truncate_for_context("short output", DEFAULT_MAX_CONTEXT_BYTES, "stage-1-output");
        assert_eq!(text, "short output");
        assert!(!truncated);
    }

    #[test]
    fn boundary_output_passes_through() {
        let output = "x".repeat(DEFAULT_MAX_CONTEXT_BYTES);
        let (text, truncated) = truncate_for_context(&output, DEFAULT_MAX_CONTEXT_BYTES, "k");
        assert_eq!(text, output);
        assert!(!truncated);
    }

    #[test]
    fn oversized_output_gets_notice_with_memory_key() {
        let output = "line\n".repeat(4000);
        let (text, truncated) = truncate_for_context(&output, 8192, "stage-3-output");
        assert!(truncated);
        assert!(text.len() < output.len());
        assert!(text.contains("stage-3-output"));
        assert!(text.ends_with("to fetch complete output]"));
    }

    #[test]
    fn cut_prefers_newline_after_half() {
        let mut output = "a".repeat(5000);
        output.push('\n');
        output.push_str(&"b".repeat(5000));
        let (text, truncated) = truncate_for_context(&output, 8192, "k");
        assert!(truncated);
        // Cut lands at the newline at byte 5000, which is past 8192 / 2.
        let body_len = text.find("\n\n[OUTPUT TRUNCATED").unwrap();
        assert_eq!(body_len, 5000);
    }

    #[test]
    fn header_enumerates_prior_stage_keys() {
        assert_eq!(shared_memory_header(0), "");
        let header = shared_memory_header(2);
        assert!(header.contains("stage-1-output"));
        assert!(header.contains("stage-2-output"));
        assert!(!header.contains("stage-3-output"));
        assert!(header.contains("shared_memory_read"));
    }

    #[test]
    fn placeholder_expansion() {
        let history = vec!["first".to_string(), "second".to_string()];
        let expanded = expand_stage_template(
            "prev=[{{previous}}]\nhist=[{{history}}]\nctx=[{{structured_context}}]\nraw={{unknown}}",
            "second",
            &history,
            None,
        );
        assert!(expanded.contains("prev=[second]"));
        assert!(expanded.contains("Stage 1 output:\nfirst"));
        assert!(expanded.contains("Stage 2 output:\nsecond"));
        assert!(expanded.contains("ctx=[{}]"));
        assert!(expanded.contains("raw={{unknown}}"));
    }
}
