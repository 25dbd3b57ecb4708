//! Capability-to-threat scoring.

use std::sync::Arc;
use std::time::Duration;

use biothreat_shared::{Capability, ForecastError, PipelinePolicy, Result, ThreatCategory};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::catalog::ThreatCatalog;
use crate::llm::{CompletionClient, CompletionRequest, strip_json_fences};

const SCORING_SYSTEM_PROMPT: &str = "You are a biosecurity risk assessor.

Given one AI capability and one biosecurity threat category, estimate how feasible it is that \
this capability materially advances the threat. 0.0 means no meaningful contribution, 1.0 means \
it directly removes a key barrier. Judge the capability as stated; do not speculate beyond it.";

/// Result of scoring one pair.
#[derive(Debug, Clone, PartialEq)]
pub enum PairOutcome {
    Mapped { score: f64, rationale: String },
    BelowFloor { score: f64 },
}

/// Scores capabilities against threat categories.
pub struct CapabilityMapper {
    client: Arc<dyn CompletionClient>,
    relevance_floor: f64,
    call_timeout: Duration,
}

impl CapabilityMapper {
    pub fn new(client: Arc<dyn CompletionClient>, policy: &PipelinePolicy) -> Self {
        Self {
            client,
            relevance_floor: policy.relevance_floor,
            call_timeout: policy.call_timeout,
        }
    }

    pub fn model_id(&self) -> &str {
        self.client.model_id()
    }

    /// Score one pair. Call errors, timeouts and malformed replies are `MappingFailed`.
    #[instrument(skip_all, fields(capability = %capability.id, category = %category.name))]
    pub async fn score_pair(
        &self,
        capability: &Capability,
        category: &ThreatCategory,
    ) -> Result<PairOutcome> {
        let fail = |reason: String| {
            ForecastError::mapping_failed(&capability.id, &category.name, reason)
        };

        let request = build_scoring_request(&capability.statement, category);
        let completion = tokio::time::timeout(self.call_timeout, self.client.complete(&request))
            .await
            .map_err(|_| fail(format!("timed out after {:?}", self.call_timeout)))?
            .map_err(|e| fail(e.to_string()))?;

        let (score, rationale) =
            parse_score(&completion.text).map_err(|e| fail(e.to_string()))?;

        debug!(score, "pair scored");
        if score < self.relevance_floor {
            Ok(PairOutcome::BelowFloor { score })
        } else {
            Ok(PairOutcome::Mapped { score, rationale })
        }
    }

    /// Score `capability` against every category, keeping those at or above the floor.
    ///
    /// Failed pairs are logged and contribute nothing.
    pub async fn map(
        &self,
        capability: &Capability,
        catalog: &ThreatCatalog,
    ) -> Vec<(ThreatCategory, f64, String)> {
        let mut kept = Vec::new();
        for category in catalog.iter() {
            match self.score_pair(capability, category).await {
                Ok(PairOutcome::Mapped { score, rationale }) => {
                    kept.push((category.clone(), score, rationale));
                }
                Ok(PairOutcome::BelowFloor { .. }) => {}
                Err(e) => warn!(error = %e, "pair skipped"),
            }
        }
        kept
    }
}

/// Request for one pair. Carries only the statement and the category's descriptive fields.
pub fn build_scoring_request(statement: &str, category: &ThreatCategory) -> CompletionRequest {
    let criteria = if category.criteria.is_empty() {
        "(none listed)".to_string()
    } else {
        category
            .criteria
            .iter()
            .map(|c| format!("- {c}"))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let prompt = format!(
        "CAPABILITY:
{statement}

THREAT CATEGORY: {name}
GROUP: {group}
DESCRIPTION: {description}
ENABLING CAPABILITIES:
{criteria}

---

Respond with JSON:
{{\"score\": 0.0-1.0, \"rationale\": \"one or two sentences\"}}",
        name = category.name,
        group = category.group,
        description = category.description,
    );

    CompletionRequest {
        system: SCORING_SYSTEM_PROMPT.to_string(),
        prompt,
    }
}

/// Parse `{"score": number, "rationale": string}`, clamping the score into [0, 1].
pub fn parse_score(text: &str) -> Result<(f64, String)> {
    let value: Value = serde_json::from_str(strip_json_fences(text))
        .map_err(|e| ForecastError::parse(format!("scoring reply is not JSON: {e}")))?;

    let raw = value
        .get("score")
        .or_else(|| value.get("feasibility_score"))
        .and_then(Value::as_f64)
        .ok_or_else(|| ForecastError::parse("scoring reply has no numeric \"score\""))?;
    let score = clamp_score(raw)?;

    let rationale = value
        .get("rationale")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .unwrap_or_default();

    Ok((score, rationale))
}

fn clamp_score(raw: f64) -> Result<f64> {
    if !raw.is_finite() {
        return Err(ForecastError::parse(format!("non-finite score {raw}")));
    }
    if !(0.0..=1.0).contains(&raw) {
        warn!(raw, "feasibility score out of range, clamping to [0, 1]");
    }
    Ok(raw.clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedClient;
    use biothreat_shared::new_id;
    use chrono::Utc;

    fn capability(statement: &str) -> Capability {
        Capability {
            id: new_id(),
            document_id: new_id(),
            statement: statement.into(),
            normalized_statement: statement.to_lowercase(),
            confidence: 0.8731,
            model_id: "m".into(),
            extracted_at: Utc::now(),
        }
    }

    fn category(name: &str) -> ThreatCategory {
        ThreatCategory::new(
            name,
            "group",
            format!("{name} description"),
            vec!["Protein design".into()],
            None,
        )
    }

    /// Replies with the score configured for the category named in the prompt.
    fn scorer(scores: &'static [(&'static str, &'static str)]) -> Arc<ScriptedClient> {
        Arc::new(ScriptedClient::new(move |req| {
            scores
                .iter()
                .find(|(name, _)| req.prompt.contains(&format!("THREAT CATEGORY: {name}\n")))
                .map(|(_, reply)| reply.to_string())
                .ok_or_else(|| ForecastError::Llm("no script".into()))
        }))
    }

    #[test]
    fn request_never_carries_confidence() {
        let cap = capability("Designs novel binders");
        let request = build_scoring_request(&cap.statement, &category("Toxins"));
        assert!(request.prompt.contains("Designs novel binders"));
        assert!(request.prompt.contains("Toxins description"));
        assert!(request.prompt.contains("- Protein design"));
        assert!(!request.prompt.contains("0.8731"));
        assert!(!request.prompt.contains(&cap.document_id));
    }

    #[test]
    fn parse_score_variants() {
        assert_eq!(
            parse_score(r#"{"score": 0.7, "rationale": " plausible "}"#).unwrap(),
            (0.7, "plausible".to_string())
        );
        assert_eq!(parse_score(r#"{"score": 1.4}"#).unwrap().0, 1.0);
        assert_eq!(parse_score(r#"{"score": -2}"#).unwrap().0, 0.0);
        assert!(parse_score(r#"{"score": "high"}"#).is_err());
        assert!(parse_score("").is_err());
    }

    #[tokio::test]
    async fn floor_keeps_two_of_three() {
        static SCORES: &[(&str, &str)] = &[
            ("A", r#"{"score": 0.1, "rationale": "weak"}"#),
            ("B", r#"{"score": 0.6, "rationale": "moderate"}"#),
            ("C", r#"{"score": 0.9, "rationale": "strong"}"#),
        ];
        let mapper = CapabilityMapper::new(scorer(SCORES), &PipelinePolicy::default());
        let catalog =
            ThreatCatalog::from_categories(vec![category("A"), category("B"), category("C")])
                .unwrap();

        let kept = mapper.map(&capability("x"), &catalog).await;
        let scores: Vec<f64> = kept.iter().map(|(_, s, _)| *s).collect();
        assert_eq!(scores, vec![0.6, 0.9]);
        assert_eq!(kept[1].0.name, "C");
        assert_eq!(kept[1].2, "strong");
    }

    #[tokio::test]
    async fn equal_scores_all_kept() {
        static SCORES: &[(&str, &str)] = &[
            ("A", r#"{"score": 0.7, "rationale": "r"}"#),
            ("B", r#"{"score": 0.7, "rationale": "r"}"#),
        ];
        let mapper = CapabilityMapper::new(scorer(SCORES), &PipelinePolicy::default());
        let catalog = ThreatCatalog::from_categories(vec![category("A"), category("B")]).unwrap();
        assert_eq!(mapper.map(&capability("x"), &catalog).await.len(), 2);
    }

    #[tokio::test]
    async fn malformed_reply_is_mapping_failure() {
        static SCORES: &[(&str, &str)] = &[("A", "sorry, I cannot help")];
        let mapper = CapabilityMapper::new(scorer(SCORES), &PipelinePolicy::default());
        let err = mapper
            .score_pair(&capability("x"), &category("A"))
            .await
            .unwrap_err();
        assert!(matches!(err, ForecastError::MappingFailed { .. }));
        assert!(!err.is_fatal());
    }
}
