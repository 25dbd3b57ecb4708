//! Capability extraction: one completion call per document, then
//! deterministic filtering, normalization and de-duplication.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use biothreat_shared::{CapabilityCandidate, Document, ForecastError, PipelinePolicy, Result};
use regex::Regex;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::llm::{CompletionClient, CompletionRequest, strip_json_fences};

const EXTRACTION_SYSTEM_PROMPT: &str = "You are a biosecurity analyst with expertise in AI capabilities and biological risks.

Your task is to read a publication and list the concrete AI capabilities it demonstrates or reports: \
things an AI system can now do, stated as short standalone sentences. Ignore background, \
speculation and future work. Give each capability a confidence between 0.0 and 1.0 that the \
publication actually supports it.";

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Extracts capability statements from documents.
pub struct CapabilityExtractor {
    client: Arc<dyn CompletionClient>,
    confidence_threshold: f64,
    max_document_chars: usize,
    call_timeout: Duration,
}

impl CapabilityExtractor {
    pub fn new(client: Arc<dyn CompletionClient>, policy: &PipelinePolicy) -> Self {
        Self {
            client,
            confidence_threshold: policy.confidence_threshold,
            max_document_chars: policy.max_document_chars,
            call_timeout: policy.call_timeout,
        }
    }

    pub fn model_id(&self) -> &str {
        self.client.model_id()
    }

    /// Extract capability candidates from `doc`.
    ///
    /// Any call error, timeout or unparseable reply is an `ExtractionFailed`.
    #[instrument(skip_all, fields(document = %doc.id))]
    pub async fn extract(&self, doc: &Document) -> Result<Vec<CapabilityCandidate>> {
        let request = build_extraction_request(doc, self.max_document_chars);

        let completion = tokio::time::timeout(self.call_timeout, self.client.complete(&request))
            .await
            .map_err(|_| {
                ForecastError::extraction_failed(
                    &doc.id,
                    format!("timed out after {:?}", self.call_timeout),
                )
            })?
            .map_err(|e| ForecastError::extraction_failed(&doc.id, e))?;

        let candidates = parse_extraction(&completion.text, self.confidence_threshold)
            .map_err(|e| ForecastError::extraction_failed(&doc.id, e))?;
        debug!(count = candidates.len(), "capabilities extracted");
        Ok(candidates)
    }
}

/// Prompt carrying the document's title, provenance and (truncated) text.
pub fn build_extraction_request(doc: &Document, max_chars: usize) -> CompletionRequest {
    let prompt = format!(
        "Extract AI capabilities from this publication.

TITLE: {title}

AUTHORS: {authors}
PUBLISHED: {published}

CONTENT:
{content}

---

Respond with JSON:
{{
    \"capabilities\": [
        {{\"statement\": \"capability as one sentence\", \"confidence\": 0.0-1.0}}
    ]
}}",
        title = doc.title,
        authors = doc.authors.as_deref().unwrap_or("Unknown"),
        published = doc
            .published_at
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "Unknown".into()),
        content = truncate_chars(&doc.body, max_chars),
    );
    CompletionRequest {
        system: EXTRACTION_SYSTEM_PROMPT.to_string(),
        prompt,
    }
}

/// Parse an extraction reply into filtered, de-duplicated candidates.
///
/// Accepts `{"capabilities": [...]}` or a bare array. Items without a
/// statement or without a finite numeric confidence are dropped.
pub fn parse_extraction(text: &str, threshold: f64) -> Result<Vec<CapabilityCandidate>> {
    let value: Value = serde_json::from_str(strip_json_fences(text))
        .map_err(|e| ForecastError::parse(format!("extraction reply is not JSON: {e}")))?;

    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("capabilities") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(ForecastError::parse(
                    "extraction reply has no \"capabilities\" array",
                ));
            }
        },
        _ => return Err(ForecastError::parse("extraction reply is not an object or array")),
    };

    let mut raw = Vec::with_capacity(items.len());
    for item in items {
        let Some(statement) = item
            .get("statement")
            .and_then(Value::as_str)
            .map(|s| WHITESPACE.replace_all(s.trim(), " ").into_owned())
            .filter(|s| !s.is_empty())
        else {
            debug!("dropping capability without statement");
            continue;
        };
        let Some(confidence) = item.get("confidence").and_then(Value::as_f64) else {
            warn!(%statement, "dropping capability with missing or non-numeric confidence");
            continue;
        };
        let Some(confidence) = clamp_confidence(confidence) else {
            warn!(%statement, "dropping capability with NaN confidence");
            continue;
        };
        raw.push(CapabilityCandidate {
            normalized: normalize_statement(&statement),
            statement,
            confidence,
        });
    }

    Ok(dedupe(raw)
        .into_iter()
        .filter(|c| c.confidence >= threshold)
        .collect())
}

/// Clamp into [0, 1]; `None` for NaN.
fn clamp_confidence(value: f64) -> Option<f64> {
    if value.is_nan() {
        return None;
    }
    if !(0.0..=1.0).contains(&value) {
        warn!(value, "confidence out of range, clamping to [0, 1]");
    }
    Some(value.clamp(0.0, 1.0))
}

/// Lower-case, collapse whitespace, strip trailing punctuation.
pub fn normalize_statement(statement: &str) -> String {
    let lowered = statement.to_lowercase();
    let collapsed = WHITESPACE.replace_all(lowered.trim(), " ");
    collapsed
        .trim_end_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace())
        .to_string()
}

/// Keep the first occurrence of each normalized statement, with the highest
/// confidence seen among its duplicates.
fn dedupe(candidates: Vec<CapabilityCandidate>) -> Vec<CapabilityCandidate> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<CapabilityCandidate> = Vec::new();
    for candidate in candidates {
        match index.get(&candidate.normalized) {
            Some(&i) => {
                if candidate.confidence > out[i].confidence {
                    out[i].confidence = candidate.confidence;
                }
            }
            None => {
                index.insert(candidate.normalized.clone(), out.len());
                out.push(candidate);
            }
        }
    }
    out
}

/// Truncate to `max_chars` characters on a char boundary.
fn truncate_chars(content: &str, max_chars: usize) -> String {
    match content.char_indices().nth(max_chars) {
        None => content.to_string(),
        Some((cut, _)) => format!("{}\n\n[... content truncated ...]", &content[..cut]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedClient;
    use biothreat_shared::{DocumentCandidate, new_id};

    fn doc(body: &str) -> Document {
        Document::from_candidate(
            &new_id(),
            DocumentCandidate {
                external_id: "1".into(),
                title: "Generative binder design".into(),
                url: None,
                authors: Some("A. Author".into()),
                body: body.into(),
                published_at: None,
            },
        )
    }

    #[test]
    fn two_statements_two_candidates() {
        let reply = r#"{"capabilities": [
            {"statement": "Designs protein binders de novo", "confidence": 0.9},
            {"statement": "Predicts toxin structure from sequence", "confidence": 0.7}
        ]}"#;
        let candidates = parse_extraction(reply, 0.5).unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].confidence, 0.9);
        assert_eq!(candidates[1].confidence, 0.7);
        assert_eq!(candidates[0].normalized, "designs protein binders de novo");
    }

    #[test]
    fn below_threshold_discarded() {
        let reply = r#"[
            {"statement": "A", "confidence": 0.49},
            {"statement": "B", "confidence": 0.5},
            {"statement": "C", "confidence": 0.2}
        ]"#;
        let candidates = parse_extraction(reply, 0.5).unwrap();
        let statements: Vec<_> = candidates.iter().map(|c| c.statement.as_str()).collect();
        assert_eq!(statements, vec!["B"]);
    }

    #[test]
    fn bad_confidences_dropped_or_clamped() {
        let reply = r#"{"capabilities": [
            {"statement": "missing"},
            {"statement": "text", "confidence": "high"},
            {"statement": "too high", "confidence": 1.7},
            {"statement": "negative", "confidence": -0.3}
        ]}"#;
        let candidates = parse_extraction(reply, 0.0).unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].statement, "too high");
        assert_eq!(candidates[0].confidence, 1.0);
        assert_eq!(candidates[1].confidence, 0.0);
    }

    #[test]
    fn duplicates_keep_first_position_and_max_confidence() {
        let reply = r#"[
            {"statement": "Automates cloning workflows.", "confidence": 0.6},
            {"statement": "Plans synthesis routes", "confidence": 0.8},
            {"statement": "automates   cloning workflows", "confidence": 0.95}
        ]"#;
        let candidates = parse_extraction(reply, 0.5).unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].statement, "Automates cloning workflows.");
        assert_eq!(candidates[0].confidence, 0.95);
        assert_eq!(candidates[1].statement, "Plans synthesis routes");
    }

    #[test]
    fn fenced_and_invalid_replies() {
        let fenced = "```json\n{\"capabilities\": []}\n```";
        assert!(parse_extraction(fenced, 0.5).unwrap().is_empty());
        assert!(parse_extraction("I could not find any.", 0.5).is_err());
        assert!(parse_extraction("{\"items\": []}", 0.5).is_err());
    }

    #[test]
    fn truncation_is_char_safe() {
        let text = "é".repeat(10);
        let truncated = truncate_chars(&text, 4);
        assert!(truncated.starts_with("éééé\n"));
        assert_eq!(truncate_chars("short", 100), "short");
    }

    #[test]
    fn normalization() {
        assert_eq!(normalize_statement("  Predicts\tStructure!! "), "predicts structure");
    }

    #[tokio::test]
    async fn extract_marks_unparseable_reply_as_failure() {
        let client = Arc::new(ScriptedClient::new(|_| Ok("not json".into())));
        let extractor = CapabilityExtractor::new(client, &PipelinePolicy::default());
        let document = doc("body");
        let err = extractor.extract(&document).await.unwrap_err();
        match err {
            ForecastError::ExtractionFailed { document_id, .. } => assert_eq!(document_id, document.id),
            other => panic!("unexpected: {other}"),
        }
    }

    #[tokio::test]
    async fn extract_sends_document_text() {
        let client = Arc::new(ScriptedClient::new(|req| {
            assert!(req.prompt.contains("Generative binder design"));
            assert!(req.prompt.contains("A. Author"));
            Ok(r#"{"capabilities": [{"statement": "Designs binders", "confidence": 0.8}]}"#.into())
        }));
        let extractor = CapabilityExtractor::new(client.clone(), &PipelinePolicy::default());
        let candidates = extractor.extract(&doc("We designed binders.")).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(client.calls(), 1);
    }
}
