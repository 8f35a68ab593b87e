//! AI Normalizer Adapter
//! Mission: an optional remote LLM call producing the same NormalizedProduct
//! shape as the heuristic normalizer. Failure or a disabled provider always
//! falls back cleanly — callers never see an error from this module.

use crate::canonical::{ConditionGrade, FunctionalState, Hints};
use crate::config::AiProviderKind;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// The subset of a `NormalizedProduct` an AI backend is allowed to opine on.
/// Deterministic hints (functional_state/condition_grade resolution) always
/// run after this and can override it — see `canonical::resolve_*`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AiOpinion {
    pub brand: Option<String>,
    pub model: Option<String>,
    pub reference: Option<String>,
    pub capacity_gb: Option<i64>,
    pub functional_state: Option<FunctionalState>,
    pub condition_grade: Option<ConditionGrade>,
    pub condition_confidence: Option<f32>,
    pub confidence: Option<f32>,
}

#[async_trait::async_trait]
pub trait AiBackend: Send + Sync {
    /// `Err` means "no opinion" — caller must fall back to the heuristic.
    async fn normalize(
        &self,
        req: &super::NormalizeRequest,
        hints: &Hints,
    ) -> anyhow::Result<AiOpinion>;
}

/// `AI_PROVIDER=none`, or no API key configured. Always declines.
pub struct NullAiBackend;

#[async_trait::async_trait]
impl AiBackend for NullAiBackend {
    async fn normalize(
        &self,
        _req: &super::NormalizeRequest,
        _hints: &Hints,
    ) -> anyhow::Result<AiOpinion> {
        anyhow::bail!("AI normalizer disabled")
    }
}

/// HTTP-based backend for `anthropic` / `openai` / `ollama`. The exact
/// request shape differs per provider; what's shared is "send the raw title
/// + hints, parse JSON back out of (possibly fenced) text".
pub struct HttpAiBackend {
    client: reqwest::Client,
    provider: AiProviderKind,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
}

impl HttpAiBackend {
    pub fn new(provider: AiProviderKind, api_key: Option<String>, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            provider,
            api_key,
            model,
            timeout: Duration::from_secs(10),
        }
    }

    fn prompt(req: &super::NormalizeRequest, hints: &Hints) -> String {
        format!(
            "Normalize this auction title into JSON only (no prose). \
             Fields: brand, model, reference, capacity_gb, functional_state \
             (ok|broken|unknown), condition_grade (new|used|unknown), \
             condition_confidence (0-1), confidence (0-1).\n\
             Title: {}\nSite: {}\nLocale: {}\n\
             Deterministic broken indicators: {:?} (confidence {})\n\
             Deterministic condition indicators: {:?} (confidence {})",
            req.raw_title,
            req.site_domain,
            req.locale,
            hints.broken_indicators,
            hints.broken_confidence,
            hints.condition_indicators,
            hints.condition_confidence,
        )
    }

    async fn call_completion(&self, prompt: &str) -> anyhow::Result<String> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("AI provider configured without an API key"))?;

        let (url, body) = match self.provider {
            AiProviderKind::Anthropic => (
                "https://api.anthropic.com/v1/messages".to_string(),
                serde_json::json!({
                    "model": self.model,
                    "max_tokens": 512,
                    "messages": [{"role": "user", "content": prompt}],
                }),
            ),
            AiProviderKind::OpenAi => (
                "https://api.openai.com/v1/chat/completions".to_string(),
                serde_json::json!({
                    "model": self.model,
                    "messages": [{"role": "user", "content": prompt}],
                }),
            ),
            AiProviderKind::Ollama => (
                "http://localhost:11434/api/generate".to_string(),
                serde_json::json!({
                    "model": self.model,
                    "prompt": prompt,
                    "stream": false,
                }),
            ),
            AiProviderKind::None => anyhow::bail!("AI provider disabled"),
        };

        let mut request = self.client.post(&url).timeout(self.timeout).json(&body);
        request = match self.provider {
            AiProviderKind::Anthropic => request
                .header("x-api-key", api_key)
                .header("anthropic-version", "2023-06-01"),
            AiProviderKind::OpenAi => request.bearer_auth(api_key),
            AiProviderKind::Ollama => request,
            AiProviderKind::None => request,
        };

        let resp = request.send().await?.error_for_status()?;
        let text = resp.text().await?;
        Ok(text)
    }
}

#[async_trait::async_trait]
impl AiBackend for HttpAiBackend {
    async fn normalize(
        &self,
        req: &super::NormalizeRequest,
        hints: &Hints,
    ) -> anyhow::Result<AiOpinion> {
        if matches!(self.provider, AiProviderKind::None) {
            anyhow::bail!("AI normalizer disabled");
        }

        let prompt = Self::prompt(req, hints);
        let raw = self.call_completion(&prompt).await?;
        let opinion = parse_ai_response(&raw)?;
        debug!(provider = ?self.provider, "AI normalizer produced an opinion");
        Ok(opinion)
    }
}

/// Extract a fenced or bare JSON object from the provider's raw text
/// response and parse it into an `AiOpinion`.
pub fn parse_ai_response(raw: &str) -> anyhow::Result<AiOpinion> {
    let json_text = extract_json_block(raw)
        .ok_or_else(|| anyhow::anyhow!("no JSON object found in AI response"))?;
    let opinion: AiOpinion = serde_json::from_str(&json_text)
        .map_err(|e| anyhow::anyhow!("failed to parse AI response JSON: {e}"))?;
    Ok(opinion)
}

fn extract_json_block(raw: &str) -> Option<String> {
    let trimmed = raw.trim();

    // Fenced code block: ```json ... ``` or ``` ... ```
    if let Some(start) = trimmed.find("```") {
        let after_fence = &trimmed[start + 3..];
        let after_fence = after_fence.strip_prefix("json").unwrap_or(after_fence);
        if let Some(end) = after_fence.find("```") {
            let candidate = after_fence[..end].trim();
            if !candidate.is_empty() {
                return Some(candidate.to_string());
            }
        }
    }

    // Bare JSON object: first '{' to its matching '}'.
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end > start {
        return Some(trimmed[start..=end].to_string());
    }
    None
}

/// Build the configured backend from environment, degrading to `NullAiBackend`
/// when disabled or unconfigured — a failure here must never propagate.
pub fn build_backend(
    provider: AiProviderKind,
    api_key: Option<String>,
    model: Option<String>,
) -> std::sync::Arc<dyn AiBackend> {
    match provider {
        AiProviderKind::None => std::sync::Arc::new(NullAiBackend),
        other => {
            if api_key.is_none() {
                warn!(provider = ?other, "AI provider configured without API key, disabling");
                return std::sync::Arc::new(NullAiBackend);
            }
            std::sync::Arc::new(HttpAiBackend::new(
                other,
                api_key,
                model.unwrap_or_else(|| "default".to_string()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fenced_json() {
        let raw = "here you go:\n```json\n{\"brand\":\"Apple\",\"confidence\":0.9}\n```";
        let opinion = parse_ai_response(raw).unwrap();
        assert_eq!(opinion.brand.as_deref(), Some("Apple"));
        assert_eq!(opinion.confidence, Some(0.9));
    }

    #[test]
    fn extracts_bare_json() {
        let raw = "{\"brand\":\"Samsung\"}";
        let opinion = parse_ai_response(raw).unwrap();
        assert_eq!(opinion.brand.as_deref(), Some("Samsung"));
    }

    #[test]
    fn rejects_non_json_text() {
        assert!(parse_ai_response("no json here at all").is_err());
    }

    #[tokio::test]
    async fn null_backend_always_declines() {
        let backend = NullAiBackend;
        let req = super::super::NormalizeRequest {
            raw_title: "x".into(),
            site_domain: "d".into(),
            locale: "fr".into(),
            brand_hint: None,
            model_hint: None,
            category_hint: None,
        };
        let hints = Hints::default();
        assert!(backend.normalize(&req, &hints).await.is_err());
    }
}
