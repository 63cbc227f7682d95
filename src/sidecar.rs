//! # Sidecar Analysis
//!
//! Relay-side assessment for agents that do not call the assessment tool
//! themselves. After every user transcript the relay sends the conversation so
//! far to a chat-completions model and hands the answer to the client as if the
//! agent had called `updateAssessmentState`.
//!
//! ## Flow:
//! 1. The relay records a user turn and spawns [`SidecarClient::analyze`] with a
//!    snapshot of the history
//! 2. The model's reply is stripped of code fences
//! 3. [`tool_event`] wraps it in a `response.function_call_arguments.done` frame
//!    with a `sidecar_` call id, which the client merges but does not acknowledge
//!
//! Failures are logged and dropped; the conversation itself never waits on the sidecar.

use crate::assessment::patch::strip_formatting;
use crate::config::SidecarConfig;
use crate::error::{AppError, AppResult};
use crate::protocol::{ASSESSMENT_TOOL, SIDECAR_CALL_PREFIX};
use crate::session::transcript::Turn;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const ANALYSIS_PROMPT: &str = r#"You are an expert Cultural Intelligence assessor.
Analyze the ongoing conversation between a user and an AI coach and answer with one JSON
object matching the updateAssessmentState tool:
{
  "dimensions": {
    "DT": { "score": 0-5, "confidence": "LOW|MEDIUM|HIGH", "evidenceCount": int, "trend": "up|down|stable" },
    "TR": { ... }, "CO": { ... }, "CA": { ... }, "EP": { ... }
  },
  "newEvidence": { "dimension": "DT|TR|CO|CA|EP", "type": "positive|negative|contextual", "summary": "One sentence.", "timestamp": "MM:SS" },
  "contradiction": { "dimension": "DT|TR|CO|CA|EP", "earlyStatement": "...", "lateStatement": "...", "resolution": "..." },
  "phase": "OPENING|CORE|GAP_FILLING|VALIDATION|CLOSING",
  "isComplete": boolean,
  "summary": "Short profile summary so far.",
  "strengths": ["..."],
  "developmentPriorities": ["..."]
}
Dimensions: DT directness and transparency, TR task versus relationship, CO conflict
orientation, CA cultural adaptability, EP empathy.
Always include "newEvidence"; use a "contextual" observation when nothing stands out.
Answer with JSON only, no markdown."#;

#[derive(Debug, Deserialize)]
struct Completion {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Clone)]
pub struct SidecarClient {
    http: reqwest::Client,
    config: SidecarConfig,
    api_key: Option<String>,
}

impl SidecarClient {
    pub fn new(config: SidecarConfig, api_key: Option<String>) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { http, config, api_key })
    }

    /// Client for the configured sidecar, or `None` when the sidecar is off.
    pub fn from_config(config: &SidecarConfig) -> AppResult<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty());
        if api_key.is_none() {
            warn!(env = %config.api_key_env, "Sidecar enabled without an API key");
        }
        Self::new(config.clone(), api_key).map(Some)
    }

    fn request_body(&self, history: &[Turn]) -> AppResult<Value> {
        let transcript = serde_json::to_string_pretty(history)?;
        Ok(json!({
            "model": self.config.model,
            "temperature": self.config.temperature,
            "max_completion_tokens": self.config.max_tokens,
            "stream": false,
            "messages": [
                { "role": "system", "content": ANALYSIS_PROMPT },
                {
                    "role": "user",
                    "content": format!(
                        "Current Conversation History:\n{}\n\nAnalyze the latest turn and provide the JSON update.",
                        transcript
                    )
                }
            ]
        }))
    }

    /// Run one analysis and return the frame to inject into the client stream.
    pub async fn analyze(&self, history: Vec<Turn>) -> AppResult<String> {
        let started = Instant::now();
        info!(turns = history.len(), "Sidecar analysis started");

        let mut request = self.http.post(&self.config.url).json(&self.request_body(&history)?);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Transport(format!(
                "sidecar answered {}: {}",
                status, body
            )));
        }

        let completion: Completion = response.json().await?;
        let arguments = extract_arguments(completion)?;
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Sidecar analysis complete"
        );
        Ok(tool_event(&arguments, chrono::Utc::now().timestamp_millis()))
    }
}

fn extract_arguments(completion: Completion) -> AppResult<String> {
    let content = completion
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .unwrap_or_default();
    debug!(raw = %content, "Sidecar raw answer");

    let arguments = strip_formatting(&content);
    if arguments.is_empty() {
        return Err(AppError::Format("sidecar returned no content".to_string()));
    }
    Ok(arguments.to_string())
}

/// The `response.function_call_arguments.done` frame carrying sidecar arguments.
pub fn tool_event(arguments: &str, stamp: i64) -> String {
    json!({
        "type": "response.function_call_arguments.done",
        "call_id": format!("{}{}", SIDECAR_CALL_PREFIX, stamp),
        "name": ASSESSMENT_TOOL,
        "arguments": arguments,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::protocol::{parse_inbound, InboundMessage};
    use crate::session::transcript::Role;

    fn completion(content: &str) -> Completion {
        serde_json::from_value(json!({
            "choices": [{ "message": { "role": "assistant", "content": content } }]
        }))
        .unwrap()
    }

    #[test]
    fn test_disabled_sidecar_has_no_client() {
        let config = AppConfig::default().sidecar;
        assert!(SidecarClient::from_config(&config).unwrap().is_none());
    }

    #[test]
    fn test_request_carries_history_and_model() {
        let config = AppConfig::default().sidecar;
        let client = SidecarClient::new(config.clone(), None).unwrap();
        let history = vec![
            Turn {
                role: Role::Assistant,
                content: "How do you handle disagreement?".to_string(),
            },
            Turn {
                role: Role::User,
                content: "I say it openly.".to_string(),
            },
        ];

        let body = client.request_body(&history).unwrap();
        assert_eq!(body["model"], config.model.as_str());
        assert_eq!(body["messages"][0]["role"], "system");
        let prompt = body["messages"][1]["content"].as_str().unwrap();
        assert!(prompt.contains("I say it openly."));
        assert!(prompt.contains("\"role\": \"assistant\""));
    }

    #[test]
    fn test_fenced_answer_is_cleaned() {
        let args = extract_arguments(completion("```json\n{\"phase\":\"CORE\"}\n```")).unwrap();
        assert_eq!(args, r#"{"phase":"CORE"}"#);
    }

    #[test]
    fn test_empty_answer_is_format_error() {
        assert!(matches!(extract_arguments(completion("  ")), Err(AppError::Format(_))));
        let none: Completion = serde_json::from_value(json!({ "choices": [] })).unwrap();
        assert!(extract_arguments(none).is_err());
    }

    #[test]
    fn test_tool_event_reads_as_assessment_call() {
        let frame = tool_event(r#"{"phase":"CORE"}"#, 1_700_000_000_123);
        match parse_inbound(&frame).unwrap() {
            InboundMessage::FunctionCallDone { name, arguments, call_id } => {
                assert_eq!(name, ASSESSMENT_TOOL);
                assert_eq!(arguments, r#"{"phase":"CORE"}"#);
                assert_eq!(call_id, "sidecar_1700000000123");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
