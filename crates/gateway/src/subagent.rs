//! Sub-agent tool filtering (the automation service's model call).
//!
//! Given a client request, a model provider picks the relevant subset of
//! the client's visible tools. The model must answer with a strict JSON
//! array of tool names; anything else falls back to the full visible set
//! with a warning. The result is always clamped to
//! `maxToolsPerRequest` and intersected with the visible set.

use mcpv_domain::config::SubAgentConfig;
use mcpv_domain::{Error, Result};
use serde_json::Value;

const DEFAULT_FILTER_PROMPT: &str = "You select tools for a coding assistant. \
Given the user request and the available tool names, answer with a JSON array \
of the tool names that are relevant, nothing else.\n\nRequest:\n{request}\n\n\
Tools:\n{tools}\n";

pub struct SubAgent {
    config: SubAgentConfig,
    client: reqwest::Client,
}

impl SubAgent {
    pub fn new(config: SubAgentConfig) -> SubAgent {
        SubAgent {
            config,
            client: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> &SubAgentConfig {
        &self.config
    }

    /// Pick a subset of `visible` for the request. Never fails: every
    /// error path degrades to the (clamped) full visible set.
    pub async fn filter_tools(&self, request: &str, visible: &[String]) -> Vec<String> {
        let clamp = |tools: &[String]| -> Vec<String> {
            tools
                .iter()
                .take(self.config.max_tools_per_request)
                .cloned()
                .collect()
        };

        if visible.len() <= self.config.max_tools_per_request {
            // Nothing to narrow down.
            return visible.to_vec();
        }

        match self.ask_model(request, visible).await {
            Ok(raw) => match parse_tool_selection(&raw) {
                Some(selected) => {
                    let filtered: Vec<String> = selected
                        .into_iter()
                        .filter(|name| visible.contains(name))
                        .take(self.config.max_tools_per_request)
                        .collect();
                    if filtered.is_empty() {
                        tracing::warn!("sub-agent selected no known tools, using full set");
                        clamp(visible)
                    } else {
                        filtered
                    }
                }
                None => {
                    tracing::warn!(raw = %raw, "sub-agent answer was not a JSON array, using full set");
                    clamp(visible)
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "sub-agent call failed, using full set");
                clamp(visible)
            }
        }
    }

    async fn ask_model(&self, request: &str, visible: &[String]) -> Result<String> {
        let base_url = self
            .config
            .base_url
            .as_deref()
            .ok_or_else(|| Error::Config("subAgent.baseURL not configured".into()))?;
        let model = self
            .config
            .model
            .as_deref()
            .ok_or_else(|| Error::Config("subAgent.model not configured".into()))?;
        let api_key = self
            .config
            .resolve_api_key()
            .ok_or_else(|| Error::Config("subAgent api key not configured".into()))?;

        let prompt = self
            .config
            .filter_prompt
            .as_deref()
            .unwrap_or(DEFAULT_FILTER_PROMPT)
            .replace("{request}", request)
            .replace("{tools}", &visible.join("\n"));

        let body = serde_json::json!({
            "model": model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": 0,
        });
        let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
        let response: Value = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Internal(format!("sub-agent request: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Internal(format!("sub-agent status: {e}")))?
            .json()
            .await
            .map_err(|e| Error::Internal(format!("sub-agent body: {e}")))?;

        response["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Internal("sub-agent answer had no content".into()))
    }
}

/// Strict parse: the answer must be a JSON array of strings (surrounding
/// whitespace and markdown fences tolerated).
pub fn parse_tool_selection(raw: &str) -> Option<Vec<String>> {
    let trimmed = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let value: Value = serde_json::from_str(trimmed).ok()?;
    let items = value.as_array()?;
    items
        .iter()
        .map(|item| item.as_str().map(str::to_string))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_strict_array() {
        assert_eq!(
            parse_tool_selection(r#"["a", "b"]"#),
            Some(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(parse_tool_selection("  [] "), Some(vec![]));
    }

    #[test]
    fn parse_tolerates_code_fences() {
        assert_eq!(
            parse_tool_selection("```json\n[\"a\"]\n```"),
            Some(vec!["a".to_string()])
        );
    }

    #[test]
    fn parse_rejects_non_arrays() {
        assert_eq!(parse_tool_selection(r#"{"tools": ["a"]}"#), None);
        assert_eq!(parse_tool_selection("use the github tool"), None);
        assert_eq!(parse_tool_selection(r#"["a", 1]"#), None);
    }

    #[tokio::test]
    async fn small_sets_skip_the_model() {
        // No baseURL configured: a model call would fail, proving the
        // short-circuit for sets within the cap.
        let agent = SubAgent::new(SubAgentConfig {
            enabled: true,
            max_tools_per_request: 10,
            ..Default::default()
        });
        let visible = vec!["a".to_string(), "b".to_string()];
        assert_eq!(agent.filter_tools("req", &visible).await, visible);
    }

    #[tokio::test]
    async fn model_failure_falls_back_clamped() {
        let agent = SubAgent::new(SubAgentConfig {
            enabled: true,
            max_tools_per_request: 2,
            ..Default::default()
        });
        let visible: Vec<String> = (0..5).map(|i| format!("t{i}")).collect();
        // No provider configured: ask_model errors, fallback clamps.
        let out = agent.filter_tools("req", &visible).await;
        assert_eq!(out, vec!["t0".to_string(), "t1".to_string()]);
    }
}
